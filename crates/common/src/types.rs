//! Core types with newtype pattern for type safety.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Image resolution in pixels.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of pixels (`width * height`). Used as the decode cost estimate.
    pub fn pixel_count(self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Byte size of an interleaved 8-bit image with `channels` channels.
    ///
    /// Saturates at `usize::MAX`; use [`Self::checked_byte_size`] where an
    /// overflow must be reported.
    pub fn byte_size(self, channels: usize) -> usize {
        self.checked_byte_size(channels).unwrap_or(usize::MAX)
    }

    pub fn checked_byte_size(self, channels: usize) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(channels)
    }

    pub fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Identifier of the place an encoded sample came from (usually a file path).
///
/// Carried through every fatal error so a failing batch names the sample
/// that broke it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceId(pub String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One encoded image handed to the pipeline by the loader.
///
/// The pipeline only ever borrows samples; nothing derived from `data`
/// outlives the batch it arrived in.
#[derive(Clone, Debug)]
pub struct Sample {
    /// Where the bytes came from, for diagnostics.
    pub source: SourceId,
    /// Encoded image bytes (JPEG, PNG, ...).
    pub data: Vec<u8>,
}

impl Sample {
    pub fn new(source: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            source: SourceId::new(source),
            data,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
