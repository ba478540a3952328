//! Per-sample metadata parsing and hardware-support classification.
//!
//! Host only: nothing here touches the accelerator. A sample is first parsed
//! as a JPEG stream; when that fails, a generic image-header sniff recovers
//! the dimensions and the sample is routed to the fallback decoder.

use std::fmt;
use std::io::Cursor;

use image::{ImageDecoder, ImageReader};
use tracing::debug;

use pf_common::{DecodeError, OutputLayout, Resolution, Sample};

use crate::jpeg::{Component, StreamHeader};

/// Chroma subsampling class of a stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Subsampling {
    S444,
    S422,
    S420,
    S440,
    S411,
    S410,
    Gray,
    #[default]
    Unknown,
}

impl Subsampling {
    /// Classify from the frame components.
    ///
    /// Three-component streams need both chroma planes sampled identically and
    /// the luma factors an exact multiple of them. Everything else, including
    /// four-component CMYK/YCCK, is `Unknown`.
    pub fn from_components(components: &[Component]) -> Self {
        match components {
            [_] => Self::Gray,
            [y, cb, cr] => {
                if (cb.h, cb.v) != (cr.h, cr.v) || y.h % cb.h != 0 || y.v % cb.v != 0 {
                    return Self::Unknown;
                }
                match (y.h / cb.h, y.v / cb.v) {
                    (1, 1) => Self::S444,
                    (2, 1) => Self::S422,
                    (2, 2) => Self::S420,
                    (1, 2) => Self::S440,
                    (4, 1) => Self::S411,
                    (4, 2) => Self::S410,
                    _ => Self::Unknown,
                }
            }
            _ => Self::Unknown,
        }
    }

    /// Whether the hardware decode engine accepts this class.
    pub fn is_whitelisted(self) -> bool {
        !matches!(self, Self::Unknown)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::S444 => "4:4:4",
            Self::S422 => "4:2:2",
            Self::S420 => "4:2:0",
            Self::S440 => "4:4:0",
            Self::S411 => "4:1:1",
            Self::S410 => "4:1:0",
            Self::Gray => "gray",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Subsampling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which decode path a sample takes.
///
/// Legal transitions: `Unknown -> Supported | FallbackRequired` (metadata
/// parsing) and `Supported -> FallbackRequired` (host stage downgrade).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Support {
    #[default]
    Unknown,
    Supported,
    FallbackRequired,
}

impl Support {
    pub fn is_supported(self) -> bool {
        self == Self::Supported
    }

    /// Route a `Supported` sample to the fallback path.
    ///
    /// Returns `false` (and changes nothing) from any other state.
    pub fn downgrade(&mut self) -> bool {
        if *self == Self::Supported {
            *self = Self::FallbackRequired;
            true
        } else {
            false
        }
    }
}

/// Facts about one sample, derived without decoding it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecodeInfo {
    pub resolution: Resolution,
    /// Channels in the encoded stream.
    pub components: u8,
    pub subsampling: Subsampling,
    pub support: Support,
}

impl DecodeInfo {
    /// Pixel volume; the load balancer's cost.
    pub fn cost(&self) -> u64 {
        self.resolution.pixel_count()
    }

    /// Bytes this sample occupies in an output of `layout`.
    pub fn output_bytes(&self, layout: OutputLayout) -> usize {
        self.resolution.byte_size(layout.channels())
    }
}

/// Parse `sample` and classify it.
///
/// On success `stream` holds the parsed header when the sample is a JPEG
/// the parser understood, and `None` otherwise. A sample declaring more than
/// `max_pixels` pixels fails with [`DecodeError::Metadata`] before anything
/// is sized for it.
pub fn parse_metadata(
    sample: &Sample,
    stream: &mut Option<StreamHeader>,
    max_pixels: u64,
) -> Result<DecodeInfo, DecodeError> {
    *stream = None;

    let (info, header) = classify(sample)?;
    if info.cost() > max_pixels {
        return Err(DecodeError::Metadata {
            sample: sample.source.clone(),
            reason: format!(
                "declares {} ({} pixels), limit is {max_pixels}",
                info.resolution,
                info.cost()
            ),
        });
    }
    *stream = header;
    Ok(info)
}

fn classify(sample: &Sample) -> Result<(DecodeInfo, Option<StreamHeader>), DecodeError> {
    match StreamHeader::parse(&sample.data) {
        Ok(header) => {
            let subsampling = Subsampling::from_components(&header.components);
            let support = if subsampling.is_whitelisted()
                && header.is_sequential_huffman_8bit()
                && !header.is_rgb_coded()
            {
                Support::Supported
            } else {
                Support::FallbackRequired
            };
            let info = DecodeInfo {
                resolution: header.resolution(),
                components: header.num_components() as u8,
                subsampling,
                support,
            };
            debug!(
                sample = %sample.source,
                resolution = %info.resolution,
                subsampling = %subsampling,
                ?support,
                "Parsed stream header"
            );
            Ok((info, Some(header)))
        }
        Err(parse_err) => {
            let (resolution, components) =
                sniff_header(&sample.data).map_err(|reason| DecodeError::Metadata {
                    sample: sample.source.clone(),
                    reason: format!("{parse_err}; header sniff: {reason}"),
                })?;
            debug!(
                sample = %sample.source,
                resolution = %resolution,
                reason = %parse_err,
                "Stream parse failed, sniffed generic header"
            );
            let info = DecodeInfo {
                resolution,
                components,
                subsampling: Subsampling::Unknown,
                support: Support::FallbackRequired,
            };
            Ok((info, None))
        }
    }
}

fn sniff_header(data: &[u8]) -> Result<(Resolution, u8), String> {
    let decoder = ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .map_err(|e| e.to_string())?
        .into_decoder()
        .map_err(|e| e.to_string())?;
    let (width, height) = decoder.dimensions();
    if width == 0 || height == 0 {
        return Err(format!("empty image {width}x{height}"));
    }
    Ok((Resolution::new(width, height), decoder.color_type().channel_count()))
}
