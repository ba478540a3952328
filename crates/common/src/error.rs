//! Central error types for the pipeline (thiserror-based).
//!
//! The taxonomy mirrors how failures are allowed to travel:
//!
//! - [`EngineError::NotSupported`] / [`EngineError::Malformed`] are
//!   recoverable per sample; the host stage turns them into a fallback
//!   decode and they never reach the caller.
//! - [`DecodeError`] is fatal for the whole batch and names the sample.
//! - [`InitError`] is fatal for pipeline construction.

use thiserror::Error;

use crate::types::{Resolution, SourceId};

/// Configuration loading / validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Failed to read config file {path}: {reason}")]
    Read { path: String, reason: String },
}

/// Accelerator memory / stream errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("No accelerator with ordinal {ordinal} (available: {available})")]
    NoDevice { ordinal: u32, available: u32 },

    #[error("Device memory allocation failed: {size} bytes")]
    AllocFailed { size: usize },

    #[error("Copy out of bounds: offset {offset} + {len} bytes exceeds buffer of {size} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error("Stream command '{label}' failed: {reason}")]
    CommandFailed { label: String, reason: String },

    #[error("Command stream is no longer running")]
    StreamClosed,
}

/// Errors reported by a decode engine for a single sample.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The engine cannot handle this stream (format, sampling, precision).
    #[error("Stream not supported by decode engine: {0}")]
    NotSupported(String),

    /// The engine found the stream corrupt.
    #[error("Malformed stream: {0}")]
    Malformed(String),

    /// Any other engine failure.
    #[error("Decode engine failure: {0}")]
    Failed(String),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
}

impl EngineError {
    /// Whether the sample can still be decoded through the fallback path.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::NotSupported(_) | Self::Malformed(_))
    }
}

/// Fatal batch failure. There is no partial-batch success.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Expected a batch of {expected} samples, got {got}")]
    BatchSize { expected: usize, got: usize },

    #[error("Cannot read image header of {sample}: {reason}")]
    Metadata { sample: SourceId, reason: String },

    #[error("Unsupported image type: {sample}: {reason}")]
    Undecodable { sample: SourceId, reason: String },

    #[error("Decode engine failed on {sample}: {error}")]
    Engine {
        sample: SourceId,
        #[source]
        error: EngineError,
    },

    #[error("Device failure while decoding {sample}: {error}")]
    Device {
        sample: SourceId,
        #[source]
        error: DeviceError,
    },

    #[error("Decoded size of {sample} is {got}, header says {expected}")]
    ShapeMismatch {
        sample: SourceId,
        expected: Resolution,
        got: Resolution,
    },

    #[error("Host worker failed while decoding {sample}: {reason}")]
    HostWorker { sample: SourceId, reason: String },

    #[error("Output tensor allocation failed: {0}")]
    Output(#[source] DeviceError),

    #[error("Command stream failure: {0}")]
    Stream(#[source] DeviceError),
}

impl DecodeError {
    /// The sample that caused the failure, when one is attributable.
    pub fn sample(&self) -> Option<&SourceId> {
        match self {
            Self::Metadata { sample, .. }
            | Self::Undecodable { sample, .. }
            | Self::Engine { sample, .. }
            | Self::Device { sample, .. }
            | Self::ShapeMismatch { sample, .. }
            | Self::HostWorker { sample, .. } => Some(sample),
            Self::BatchSize { .. } | Self::Output(_) | Self::Stream(_) => None,
        }
    }
}

/// Pipeline construction failures.
#[derive(Error, Debug)]
pub enum InitError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Failed to create decoder handle for slot {slot}: {error}")]
    Engine {
        slot: usize,
        #[source]
        error: EngineError,
    },

    #[error("Failed to build host thread pool: {0}")]
    ThreadPool(String),
}
