//! `pf-decoder`: Batch hybrid image decode pipeline.
//!
//! Turns a fixed-size batch of encoded images into one packed output tensor
//! in device memory. Per batch:
//!
//! 1. **Metadata**: each sample's stream header is parsed and classified as
//!    hardware-supported or fallback-only ([`metadata`], [`jpeg`]).
//! 2. **Host stage**: a thread pool runs the engine's host phase, largest
//!    images first ([`balance`], [`executor`]). Samples the engine cannot
//!    take are decoded by the software [`fallback`] in the same task.
//! 3. **Device stage**: finishing work and fallback uploads are queued on a
//!    single command stream, each writing its own output region
//!    ([`device_stage`]).
//! 4. The stream is synchronized once and the [`batch::BatchTensor`] is
//!    handed out.
//!
//! [`pipeline::BatchDecoder`] owns all of it; [`engine::DecodeEngine`] is the
//! seam where a hardware decoder plugs in.

pub mod balance;
pub mod batch;
pub mod device_stage;
pub mod engine;
pub mod executor;
pub mod fallback;
pub mod jpeg;
pub mod metadata;
pub mod pipeline;
pub mod slot;

#[cfg(test)]
mod testutil;

pub use batch::{BatchTensor, SampleShape};
pub use engine::{Backend, DecodeEngine, ReferenceEngine};
pub use metadata::{DecodeInfo, Subsampling, Support};
pub use pipeline::{BatchDecoder, BatchState, PipelineStats};
