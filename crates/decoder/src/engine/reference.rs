//! Reference decode engine.
//!
//! Runs the host phase with the `image` crate's JPEG decoder and the device
//! phase as layout kernels on the command stream. The `Host` backend stages
//! interleaved RGB; the `Hybrid` backend stages planar RGB and leaves the
//! interleave to the device, the way a hybrid hardware decoder leaves
//! reconstruction to the accelerator.

use std::io::Cursor;

use image::codecs::jpeg::JpegDecoder;
use image::{ColorType, ImageDecoder};

use pf_common::{EngineError, OutputLayout, Resolution};

use super::kernels;
use super::{Backend, DecodeEngine, DeviceJob, StagingSizes};
use crate::jpeg::StreamHeader;

#[derive(Clone, Copy, Debug, Default)]
pub struct ReferenceEngine;

impl ReferenceEngine {
    pub fn new() -> Self {
        Self
    }
}

/// Per-slot decoder handle of the [`ReferenceEngine`].
#[derive(Debug)]
pub struct ReferenceDecoder {
    backend: Backend,
    layout: OutputLayout,
    /// Resolution staged by the last host phase.
    staged: Option<Resolution>,
    /// Interleaved scratch for the hybrid backend; grows, never shrinks.
    scratch: Vec<u8>,
}

impl ReferenceDecoder {
    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn staged(&self) -> Option<Resolution> {
        self.staged
    }
}

fn staged_bytes(header: &StreamHeader) -> usize {
    header.resolution().byte_size(3)
}

impl DecodeEngine for ReferenceEngine {
    type Decoder = ReferenceDecoder;

    fn name(&self) -> &'static str {
        "reference"
    }

    fn create_decoder(&self, backend: Backend, layout: OutputLayout) -> Result<ReferenceDecoder, EngineError> {
        Ok(ReferenceDecoder {
            backend,
            layout,
            staged: None,
            scratch: Vec::new(),
        })
    }

    fn reset_decoder(&self, decoder: &mut ReferenceDecoder) {
        decoder.staged = None;
    }

    fn staging_sizes(&self, _decoder: &ReferenceDecoder, header: &StreamHeader) -> StagingSizes {
        let bytes = staged_bytes(header);
        StagingSizes {
            host: bytes,
            device: bytes,
        }
    }

    fn decode_host(
        &self,
        decoder: &mut ReferenceDecoder,
        header: &StreamHeader,
        data: &[u8],
        staging: &mut [u8],
    ) -> Result<(), EngineError> {
        decoder.staged = None;

        let jpeg = JpegDecoder::new(Cursor::new(data)).map_err(|e| EngineError::Malformed(e.to_string()))?;
        let (width, height) = jpeg.dimensions();
        let expected = header.resolution();
        if Resolution::new(width, height) != expected {
            return Err(EngineError::Malformed(format!(
                "decoder reports {width}x{height}, header says {expected}"
            )));
        }
        let channels = match jpeg.color_type() {
            ColorType::L8 => 1,
            ColorType::Rgb8 => 3,
            other => return Err(EngineError::NotSupported(format!("color type {other:?}"))),
        };

        let pixels = expected.pixel_count() as usize;
        let size = staged_bytes(header);
        if staging.len() < size {
            return Err(EngineError::Failed(format!(
                "staging buffer holds {} bytes, need {size}",
                staging.len()
            )));
        }
        let decoded = pixels * channels;

        match decoder.backend {
            Backend::Host => {
                jpeg.read_image(&mut staging[..decoded])
                    .map_err(|e| EngineError::Malformed(e.to_string()))?;
                if channels == 1 {
                    kernels::expand_gray_in_place(&mut staging[..size], pixels);
                }
            }
            Backend::Hybrid => {
                decoder.scratch.resize(decoded, 0);
                jpeg.read_image(&mut decoder.scratch)
                    .map_err(|e| EngineError::Malformed(e.to_string()))?;
                kernels::interleaved_to_planar(&decoder.scratch, channels, &mut staging[..size]);
            }
        }

        decoder.staged = Some(expected);
        Ok(())
    }

    fn decode_device(
        &self,
        decoder: &ReferenceDecoder,
        header: &StreamHeader,
        job: DeviceJob<'_>,
    ) -> Result<(), EngineError> {
        let resolution = decoder
            .staged
            .filter(|r| *r == header.resolution())
            .ok_or_else(|| EngineError::Failed("no staged host-phase output for this stream".into()))?;

        let size = staged_bytes(header);
        let expected_out = resolution.byte_size(decoder.layout.channels());
        if job.output.len() != expected_out {
            return Err(EngineError::Failed(format!(
                "output region is {} bytes, expected {expected_out}",
                job.output.len()
            )));
        }

        let scratch = job.scratch.region(0, size)?;
        job.stream.copy_htod(job.label, job.staging, 0, &scratch)?;

        let output = job.output.clone();
        let layout = decoder.layout;
        let planar = decoder.backend == Backend::Hybrid;
        job.stream.enqueue(job.label, move || {
            scratch.with(|src| {
                output.with_mut(|dst| {
                    if planar {
                        kernels::planar_to_layout(src, dst, layout)
                    } else {
                        kernels::interleaved_to_layout(src, dst, layout)
                    }
                })
            })
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{jpeg_gray, jpeg_rgb};
    use pf_device::Device;

    fn run(backend: Backend, layout: OutputLayout, data: &[u8]) -> Vec<u8> {
        let engine = ReferenceEngine::new();
        let header = StreamHeader::parse(data).unwrap();
        let mut decoder = engine.create_decoder(backend, layout).unwrap();
        let sizes = engine.staging_sizes(&decoder, &header);

        let dev = Device::open(0).unwrap();
        let stream = dev.create_stream().unwrap();
        let staging = dev.alloc_pinned(sizes.host).unwrap();
        let scratch = dev.alloc(sizes.device).unwrap();
        let out_len = header.resolution().byte_size(layout.channels());
        let output = dev.alloc(out_len).unwrap();

        engine
            .decode_host(&mut decoder, &header, data, &mut staging.host_slice())
            .unwrap();
        engine
            .decode_device(
                &decoder,
                &header,
                DeviceJob {
                    staging: &staging,
                    scratch: &scratch,
                    output: &output.full_region(),
                    stream: &stream,
                    label: "test",
                },
            )
            .unwrap();
        stream.synchronize().unwrap();

        let mut host = vec![0u8; out_len];
        output.copy_to_host(0, &mut host).unwrap();
        host
    }

    #[test]
    fn backends_produce_identical_pixels() {
        let data = jpeg_rgb(24, 16, 5);
        for layout in [OutputLayout::Rgb, OutputLayout::Bgr, OutputLayout::Gray] {
            assert_eq!(
                run(Backend::Host, layout, &data),
                run(Backend::Hybrid, layout, &data),
                "{layout}"
            );
        }
    }

    #[test]
    fn rgb_output_matches_image_crate() {
        let data = jpeg_rgb(16, 8, 1);
        let reference = image::load_from_memory(&data).unwrap().into_rgb8().into_raw();
        assert_eq!(run(Backend::Host, OutputLayout::Rgb, &data), reference);
    }

    #[test]
    fn gray_jpeg_expands_and_reduces_exactly() {
        let data = jpeg_gray(10, 6, 2);
        let luma = image::load_from_memory(&data).unwrap().into_luma8().into_raw();
        assert_eq!(run(Backend::Hybrid, OutputLayout::Gray, &data), luma);
    }

    #[test]
    fn header_mismatch_is_recoverable() {
        let header = StreamHeader::parse(&jpeg_rgb(16, 16, 0)).unwrap();
        let other = jpeg_rgb(8, 8, 0);

        let engine = ReferenceEngine::new();
        let mut decoder = engine.create_decoder(Backend::Host, OutputLayout::Rgb).unwrap();
        let mut staging = vec![0u8; engine.staging_sizes(&decoder, &header).host];
        let err = engine
            .decode_host(&mut decoder, &header, &other, &mut staging)
            .unwrap_err();
        assert!(err.is_recoverable(), "{err:?}");
        assert!(decoder.staged().is_none());
    }

    #[test]
    fn non_jpeg_bytes_are_recoverable() {
        let header = StreamHeader::parse(&jpeg_rgb(8, 8, 0)).unwrap();
        let engine = ReferenceEngine::new();
        let mut decoder = engine.create_decoder(Backend::Hybrid, OutputLayout::Rgb).unwrap();
        let mut staging = vec![0u8; 192];
        let err = engine
            .decode_host(&mut decoder, &header, b"not a jpeg at all", &mut staging)
            .unwrap_err();
        assert!(err.is_recoverable(), "{err:?}");
    }

    #[test]
    fn device_phase_requires_host_phase() {
        let data = jpeg_rgb(8, 8, 0);
        let header = StreamHeader::parse(&data).unwrap();
        let engine = ReferenceEngine::new();
        let decoder = engine.create_decoder(Backend::Host, OutputLayout::Rgb).unwrap();

        let dev = Device::open(0).unwrap();
        let stream = dev.create_stream().unwrap();
        let staging = dev.alloc_pinned(192).unwrap();
        let scratch = dev.alloc(192).unwrap();
        let output = dev.alloc(192).unwrap();
        let err = engine
            .decode_device(
                &decoder,
                &header,
                DeviceJob {
                    staging: &staging,
                    scratch: &scratch,
                    output: &output.full_region(),
                    stream: &stream,
                    label: "x",
                },
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::Failed(_)));
    }
}
