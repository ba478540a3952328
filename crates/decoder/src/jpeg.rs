//! JPEG marker-stream parser.
//!
//! Reads only what the pipeline needs before decoding: the frame header
//! (coding process, precision, dimensions, per-component sampling factors)
//! and the Adobe color transform flag. Parsing stops at
//! the first start-of-scan marker; entropy-coded data is never touched.

use std::io::{self, Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt};
use thiserror::Error;

use pf_common::Resolution;

const SOI: u8 = 0xD8;
const EOI: u8 = 0xD9;
const SOS: u8 = 0xDA;
const APP14: u8 = 0xEE;

/// Errors from [`StreamHeader::parse`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("Not a JPEG stream (missing SOI marker)")]
    NotJpeg,

    #[error("Stream truncated")]
    Truncated,

    #[error("Expected marker at offset {offset}, found byte 0x{byte:02X}")]
    InvalidMarker { offset: u64, byte: u8 },

    #[error("Invalid segment 0xFF{marker:02X}: {reason}")]
    InvalidSegment { marker: u8, reason: &'static str },

    #[error("Second frame header found")]
    DuplicateFrame,

    #[error("Scan starts before any frame header")]
    MissingFrame,

    #[error("End of image before any scan")]
    MissingScan,

    #[error("Frame has zero width or height")]
    ZeroDimension,
}

impl From<io::Error> for StreamError {
    fn from(_: io::Error) -> Self {
        // Reads come from an in-memory cursor; the only failure is EOF.
        Self::Truncated
    }
}

/// How the frame's coefficients are coded, from the SOF marker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodingProcess {
    Baseline,
    ExtendedSequential,
    Progressive,
    Lossless,
    /// Differential (hierarchical) frames.
    Hierarchical,
}

/// One frame component.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Component {
    pub id: u8,
    pub h: u8,
    pub v: u8,
    pub quant_table: u8,
}

/// Parsed stream header of one JPEG image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamHeader {
    pub process: CodingProcess,
    pub arithmetic: bool,
    pub precision: u8,
    pub width: u16,
    pub height: u16,
    pub components: Vec<Component>,
    /// Transform byte of an Adobe APP14 segment, if present.
    pub adobe_transform: Option<u8>,
    /// Byte offset of the first SOS marker.
    pub scan_offset: usize,
}

struct Frame {
    process: CodingProcess,
    arithmetic: bool,
    precision: u8,
    width: u16,
    height: u16,
    components: Vec<Component>,
}

impl StreamHeader {
    /// Parse the marker stream of `data` up to the first scan.
    pub fn parse(data: &[u8]) -> Result<Self, StreamError> {
        if data.len() < 2 || data[0] != 0xFF || data[1] != SOI {
            return Err(StreamError::NotJpeg);
        }

        let mut cursor = Cursor::new(data);
        cursor.set_position(2);

        let mut frame: Option<Frame> = None;
        let mut adobe_transform = None;

        loop {
            let marker_offset = cursor.position() as usize;
            let marker = next_marker(&mut cursor)?;
            match marker {
                // Standalone markers carry no length.
                0x01 | 0xD0..=0xD7 => continue,
                SOI => {
                    return Err(StreamError::InvalidSegment {
                        marker,
                        reason: "nested start of image",
                    })
                }
                EOI => return Err(StreamError::MissingScan),
                _ => {}
            }

            let length = cursor.read_u16::<BigEndian>()? as usize;
            if length < 2 {
                return Err(StreamError::InvalidSegment {
                    marker,
                    reason: "length below 2",
                });
            }
            let mut segment = vec![0u8; length - 2];
            cursor.read_exact(&mut segment)?;

            match marker {
                0xC0..=0xC3 | 0xC5..=0xC7 | 0xC9..=0xCB | 0xCD..=0xCF => {
                    if frame.is_some() {
                        return Err(StreamError::DuplicateFrame);
                    }
                    frame = Some(parse_frame(marker, &segment)?);
                }
                APP14 if segment.len() >= 12 && segment.starts_with(b"Adobe") => {
                    adobe_transform = Some(segment[11]);
                }
                SOS => {
                    let frame = frame.ok_or(StreamError::MissingFrame)?;
                    if frame.width == 0 || frame.height == 0 {
                        return Err(StreamError::ZeroDimension);
                    }
                    return Ok(Self {
                        process: frame.process,
                        arithmetic: frame.arithmetic,
                        precision: frame.precision,
                        width: frame.width,
                        height: frame.height,
                        components: frame.components,
                        adobe_transform,
                        scan_offset: marker_offset,
                    });
                }
                _ => {}
            }
        }
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(u32::from(self.width), u32::from(self.height))
    }

    pub fn num_components(&self) -> usize {
        self.components.len()
    }

    /// Three components coded as RGB rather than YCbCr: an Adobe segment
    /// with transform 0, or component ids spelling `R`, `G`, `B`.
    pub fn is_rgb_coded(&self) -> bool {
        if self.components.len() != 3 {
            return false;
        }
        match self.adobe_transform {
            Some(transform) => transform == 0,
            None => self.components.iter().map(|c| c.id).eq(*b"RGB"),
        }
    }

    /// Sequential, Huffman-coded, 8-bit: the only streams the hardware path takes.
    pub fn is_sequential_huffman_8bit(&self) -> bool {
        matches!(
            self.process,
            CodingProcess::Baseline | CodingProcess::ExtendedSequential
        ) && !self.arithmetic
            && self.precision == 8
    }
}

fn next_marker(cursor: &mut Cursor<&[u8]>) -> Result<u8, StreamError> {
    let offset = cursor.position();
    let byte = cursor.read_u8()?;
    if byte != 0xFF {
        return Err(StreamError::InvalidMarker { offset, byte });
    }
    let mut marker = cursor.read_u8()?;
    // Any number of 0xFF fill bytes may precede a marker.
    while marker == 0xFF {
        marker = cursor.read_u8()?;
    }
    if marker == 0x00 {
        return Err(StreamError::InvalidMarker { offset, byte: marker });
    }
    Ok(marker)
}

fn parse_frame(marker: u8, segment: &[u8]) -> Result<Frame, StreamError> {
    let (process, arithmetic) = match marker {
        0xC0 => (CodingProcess::Baseline, false),
        0xC1 => (CodingProcess::ExtendedSequential, false),
        0xC2 => (CodingProcess::Progressive, false),
        0xC3 => (CodingProcess::Lossless, false),
        0xC5..=0xC7 => (CodingProcess::Hierarchical, false),
        0xC9 => (CodingProcess::ExtendedSequential, true),
        0xCA => (CodingProcess::Progressive, true),
        0xCB => (CodingProcess::Lossless, true),
        _ => (CodingProcess::Hierarchical, true),
    };

    let short = StreamError::InvalidSegment {
        marker,
        reason: "frame header too short",
    };
    let mut seg = Cursor::new(segment);
    let precision = seg.read_u8().map_err(|_| short.clone())?;
    let height = seg.read_u16::<BigEndian>().map_err(|_| short.clone())?;
    let width = seg.read_u16::<BigEndian>().map_err(|_| short.clone())?;
    let count = seg.read_u8().map_err(|_| short.clone())?;
    if count == 0 {
        return Err(StreamError::InvalidSegment {
            marker,
            reason: "frame has no components",
        });
    }

    let mut components = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let mut raw = [0u8; 3];
        seg.read_exact(&mut raw).map_err(|_| short.clone())?;
        let (h, v) = (raw[1] >> 4, raw[1] & 0x0F);
        if !(1..=4).contains(&h) || !(1..=4).contains(&v) {
            return Err(StreamError::InvalidSegment {
                marker,
                reason: "sampling factor out of range",
            });
        }
        components.push(Component {
            id: raw[0],
            h,
            v,
            quant_table: raw[2],
        });
    }

    Ok(Frame {
        process,
        arithmetic,
        precision,
        width,
        height,
        components,
    })
}
