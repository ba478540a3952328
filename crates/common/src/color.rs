//! Output pixel layouts.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Channel layout of every image in the output batch tensor.
///
/// All layouts are 8-bit, interleaved, row-major `(height, width, channels)`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputLayout {
    /// Single luma channel.
    Gray,
    /// Red, green, blue.
    #[default]
    Rgb,
    /// Blue, green, red.
    Bgr,
}

impl OutputLayout {
    /// Number of interleaved channels per pixel.
    pub fn channels(self) -> usize {
        match self {
            Self::Gray => 1,
            Self::Rgb | Self::Bgr => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Gray => "gray",
            Self::Rgb => "rgb",
            Self::Bgr => "bgr",
        }
    }
}

impl fmt::Display for OutputLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for OutputLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gray" | "grey" | "y" => Ok(Self::Gray),
            "rgb" => Ok(Self::Rgb),
            "bgr" => Ok(Self::Bgr),
            other => Err(format!("unknown output layout '{other}' (expected gray|rgb|bgr)")),
        }
    }
}

/// BT.601 luma from 8-bit RGB, fixed point with 8 fractional bits.
///
/// The weights sum to 256, so a neutral pixel `(v, v, v)` maps to exactly `v`.
#[inline(always)]
pub fn rgb_to_luma(r: u8, g: u8, b: u8) -> u8 {
    ((77 * r as u32 + 150 * g as u32 + 29 * b as u32 + 128) >> 8) as u8
}
