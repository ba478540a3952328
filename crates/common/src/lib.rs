//! `pf-common`: Shared types, configuration, and errors for pixelfeed.
//!
//! This crate is the foundation the device layer and the decoder build on:
//!
//! - **Types**: `Sample`, `SourceId`, `Resolution`
//! - **Color**: `OutputLayout` (gray / RGB / BGR) and the luma helper
//! - **Config**: `PipelineConfig` (serde, JSON-loadable)
//! - **Errors**: `DecodeError`, `EngineError`, `DeviceError`, `InitError`, `ConfigError`

pub mod color;
pub mod config;
pub mod error;
pub mod types;

pub use color::{rgb_to_luma, OutputLayout};
pub use config::{PipelineConfig, DEFAULT_HYBRID_HUFFMAN_THRESHOLD, DEFAULT_MAX_SAMPLE_PIXELS};
pub use error::{ConfigError, DecodeError, DeviceError, EngineError, InitError};
pub use types::{Resolution, Sample, SourceId};
