//! Hardware decode engine abstraction.
//!
//! A decode engine splits each image in two phases:
//!
//! 1. **Host phase** ([`DecodeEngine::decode_host`]): runs on a host worker,
//!    reads the encoded bytes and leaves intermediate state in the slot's
//!    pinned staging buffer.
//! 2. **Device phase** ([`DecodeEngine::decode_device`]): called from the
//!    orchestrating thread; enqueues the upload and the finishing work on
//!    the shared command stream, writing into the sample's output region.
//!
//! Each slot owns one decoder handle per [`Backend`]; the pipeline picks the
//! backend per sample from its pixel volume.

pub mod kernels;
pub mod reference;

use std::fmt;

use pf_common::{EngineError, OutputLayout};
use pf_device::{CommandStream, DeviceBuffer, DeviceRegion, PinnedBuffer};

use crate::jpeg::StreamHeader;

pub use reference::{ReferenceDecoder, ReferenceEngine};

/// Decoder variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Backend {
    /// Entropy decoding and reconstruction both finish on the host.
    Host,
    /// Host does entropy decoding only; the device does the rest.
    Hybrid,
}

impl Backend {
    pub fn name(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Staging memory one sample needs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StagingSizes {
    /// Pinned host bytes written by the host phase.
    pub host: usize,
    /// Device scratch bytes used by the device phase.
    pub device: usize,
}

/// Everything the device phase of one sample works with.
pub struct DeviceJob<'a> {
    /// Pinned staging filled by the host phase.
    pub staging: &'a PinnedBuffer,
    /// The slot's device staging buffer, at least `StagingSizes::device` bytes.
    pub scratch: &'a DeviceBuffer,
    /// The sample's region of the output tensor.
    pub output: &'a DeviceRegion,
    pub stream: &'a CommandStream,
    /// Label for every command enqueued for this sample.
    pub label: &'a str,
}

/// A two-phase image decode engine.
///
/// `NotSupported` and `Malformed` errors from [`decode_host`](Self::decode_host)
/// send the sample to the fallback decoder; every other error fails the batch.
pub trait DecodeEngine: Send + Sync {
    type Decoder: Send;

    fn name(&self) -> &'static str;

    /// Create one decoder handle. Called once per slot and backend.
    fn create_decoder(&self, backend: Backend, layout: OutputLayout) -> Result<Self::Decoder, EngineError>;

    /// Forget any per-sample state held by `decoder`.
    fn reset_decoder(&self, _decoder: &mut Self::Decoder) {}

    fn staging_sizes(&self, decoder: &Self::Decoder, header: &StreamHeader) -> StagingSizes;

    /// Host phase. `staging` holds at least `StagingSizes::host` bytes.
    fn decode_host(
        &self,
        decoder: &mut Self::Decoder,
        header: &StreamHeader,
        data: &[u8],
        staging: &mut [u8],
    ) -> Result<(), EngineError>;

    /// Device phase. Must only enqueue work, never wait on the stream.
    fn decode_device(
        &self,
        decoder: &Self::Decoder,
        header: &StreamHeader,
        job: DeviceJob<'_>,
    ) -> Result<(), EngineError>;
}
