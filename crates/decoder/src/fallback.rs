//! Software fallback decoder.
//!
//! Decodes anything the `image` crate understands into an interleaved 8-bit
//! buffer in the pipeline's output layout. Used for samples the metadata
//! parser could not classify as supported and for samples the hardware
//! engine rejected during the host stage.

use image::{ColorType, DynamicImage};
use tracing::debug;

use pf_common::{rgb_to_luma, DecodeError, OutputLayout, Resolution, Sample};

/// An image decoded by the fallback path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedImage {
    pub resolution: Resolution,
    pub layout: OutputLayout,
    pub pixels: Vec<u8>,
}

#[derive(Clone, Copy, Debug)]
pub struct FallbackDecoder {
    layout: OutputLayout,
}

impl FallbackDecoder {
    pub fn new(layout: OutputLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> OutputLayout {
        self.layout
    }

    /// Decode `sample` into a freshly allocated buffer.
    pub fn decode(&self, sample: &Sample) -> Result<DecodedImage, DecodeError> {
        let image = load(sample)?;
        let resolution = Resolution::new(image.width(), image.height());
        let pixels = match self.layout {
            OutputLayout::Gray => to_gray(image),
            OutputLayout::Rgb => image.into_rgb8().into_raw(),
            OutputLayout::Bgr => {
                let mut pixels = image.into_rgb8().into_raw();
                swap_red_blue(&mut pixels);
                pixels
            }
        };
        Ok(DecodedImage {
            resolution,
            layout: self.layout,
            pixels,
        })
    }

    /// Decode `sample` straight into `dst`, which must be exactly the size of
    /// an `expected` image in this decoder's layout.
    pub fn decode_into(
        &self,
        sample: &Sample,
        expected: Resolution,
        dst: &mut [u8],
    ) -> Result<(), DecodeError> {
        let image = load(sample)?;
        let got = Resolution::new(image.width(), image.height());
        if got != expected {
            return Err(DecodeError::ShapeMismatch {
                sample: sample.source.clone(),
                expected,
                got,
            });
        }
        if dst.len() != expected.byte_size(self.layout.channels()) {
            return Err(DecodeError::HostWorker {
                sample: sample.source.clone(),
                reason: format!(
                    "fallback destination is {} bytes, {} {} needs {}",
                    dst.len(),
                    expected,
                    self.layout,
                    expected.byte_size(self.layout.channels())
                ),
            });
        }

        match self.layout {
            OutputLayout::Gray => dst.copy_from_slice(&to_gray(image)),
            OutputLayout::Rgb => dst.copy_from_slice(image.into_rgb8().as_raw()),
            OutputLayout::Bgr => {
                dst.copy_from_slice(image.into_rgb8().as_raw());
                swap_red_blue(dst);
            }
        }
        debug!(sample = %sample.source, resolution = %got, layout = %self.layout, "Fallback decode");
        Ok(())
    }
}

fn load(sample: &Sample) -> Result<DynamicImage, DecodeError> {
    image::load_from_memory(&sample.data).map_err(|e| DecodeError::Undecodable {
        sample: sample.source.clone(),
        reason: e.to_string(),
    })
}

/// Luma of `image`. Colour sources go through the same BT.601 reduction as
/// the engine path; single-channel sources are taken as they are.
fn to_gray(image: DynamicImage) -> Vec<u8> {
    match image.color() {
        ColorType::L8 | ColorType::La8 | ColorType::L16 | ColorType::La16 => image.into_luma8().into_raw(),
        _ => image
            .into_rgb8()
            .as_raw()
            .chunks_exact(3)
            .map(|px| rgb_to_luma(px[0], px[1], px[2]))
            .collect(),
    }
}

fn swap_red_blue(pixels: &mut [u8]) {
    for px in pixels.chunks_exact_mut(3) {
        px.swap(0, 2);
    }
}
