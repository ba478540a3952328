//! Batch orchestrator.
//!
//! [`BatchDecoder`] owns every resource of a pipeline instance and drives one
//! batch at a time through a fixed sequence of states:
//!
//! ```text
//! Idle -> MetadataParsed -> HostStageDone -> DeviceStageSubmitted -> BatchReady
//! ```
//!
//! - **MetadataParsed**: every slot has a `DecodeInfo`; the output tensor is
//!   laid out and allocated.
//! - **HostStageDone**: the host task group has joined; every slot's support
//!   class is final and its pinned staging holds either engine state or
//!   fallback-decoded pixels.
//! - **DeviceStageSubmitted**: all device work is queued on the one stream.
//! - **BatchReady**: the stream has been synchronized once; the output is
//!   complete.
//!
//! Any failure returns the pipeline to `Idle` with no output exposed.

use std::fmt;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use pf_common::{DecodeError, DeviceError, InitError, PipelineConfig, Resolution, Sample, SourceId};
use pf_device::{CommandStream, Device};

use crate::balance;
use crate::batch::BatchTensor;
use crate::device_stage;
use crate::engine::{Backend, DecodeEngine, ReferenceEngine};
use crate::executor::HostExecutor;
use crate::fallback::FallbackDecoder;
use crate::metadata::{parse_metadata, DecodeInfo, Support};
use crate::slot::{SlotPool, SlotState};

// ---------------------------------------------------------------------------
// State and statistics
// ---------------------------------------------------------------------------

/// Where the current batch is in its lifecycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BatchState {
    #[default]
    Idle,
    MetadataParsed,
    HostStageDone,
    DeviceStageSubmitted,
    BatchReady,
}

impl BatchState {
    /// The only state this one may advance to.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Idle => Some(Self::MetadataParsed),
            Self::MetadataParsed => Some(Self::HostStageDone),
            Self::HostStageDone => Some(Self::DeviceStageSubmitted),
            Self::DeviceStageSubmitted => Some(Self::BatchReady),
            Self::BatchReady => None,
        }
    }
}

/// Cumulative counters over the pipeline's lifetime.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Batches that reached `BatchReady`.
    pub batches: u64,
    pub failed_batches: u64,
    pub hybrid_decodes: u64,
    pub host_decodes: u64,
    /// Samples decoded by the fallback decoder, downgraded ones included.
    pub fallback_decodes: u64,
    /// Samples the engine rejected during the host stage.
    pub downgraded: u64,
    /// Slot staging buffers replaced by larger ones.
    pub staging_reallocations: u64,
    /// Output tensor buffers replaced by larger ones.
    pub output_reallocations: u64,
}

#[derive(Default)]
struct BatchCounts {
    hybrid: u64,
    host: u64,
    fallback: u64,
    downgraded: u64,
}

// ---------------------------------------------------------------------------
// BatchDecoder
// ---------------------------------------------------------------------------

/// A batch image decode pipeline instance.
pub struct BatchDecoder<E: DecodeEngine = ReferenceEngine> {
    // Declaration order is drop order: the host pool and the stream go
    // first, slot handles after them, the engine last.
    executor: HostExecutor,
    stream: CommandStream,
    output: BatchTensor,
    slots: SlotPool<E::Decoder>,
    engine: E,
    fallback: FallbackDecoder,
    device: Device,
    config: PipelineConfig,
    state: BatchState,
    stats: PipelineStats,
    infos: Vec<DecodeInfo>,
}

impl BatchDecoder<ReferenceEngine> {
    /// Build a pipeline with the reference decode engine.
    pub fn new(config: PipelineConfig) -> Result<Self, InitError> {
        Self::with_engine(config, ReferenceEngine::new())
    }
}

impl<E: DecodeEngine> BatchDecoder<E> {
    /// Build a pipeline around `engine`.
    ///
    /// Creates every slot's decoder handles up front; any failure aborts
    /// construction.
    pub fn with_engine(config: PipelineConfig, engine: E) -> Result<Self, InitError> {
        config.validate()?;

        let device = Device::open(config.device_id)?;
        let stream = device.create_stream()?;
        let slots = SlotPool::new(&engine, &device, &config)?;
        let output = BatchTensor::new(&device, config.output_layout)?;
        let executor = HostExecutor::new(config.num_threads, config.pin_threads)?;

        info!(
            engine = engine.name(),
            batch_size = config.batch_size,
            num_threads = config.num_threads,
            layout = %config.output_layout,
            hybrid_threshold = config.hybrid_huffman_threshold,
            device = config.device_id,
            "Batch decoder created"
        );

        Ok(Self {
            executor,
            stream,
            output,
            slots,
            engine,
            fallback: FallbackDecoder::new(config.output_layout),
            device,
            config,
            state: BatchState::Idle,
            stats: PipelineStats::default(),
            infos: Vec::new(),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            staging_reallocations: self.slots.reallocations(),
            ..self.stats.clone()
        }
    }

    /// Per-sample facts of the last successful batch.
    pub fn last_batch_infos(&self) -> &[DecodeInfo] {
        &self.infos
    }

    /// The output of the last batch, only while it is `BatchReady`.
    pub fn output(&self) -> Option<&BatchTensor> {
        (self.state == BatchState::BatchReady).then_some(&self.output)
    }

    /// Decode one batch. `samples.len()` must equal the configured batch size.
    ///
    /// `output[i]` holds `samples[i]`. On error nothing is exposed and the
    /// error names the sample that caused it.
    pub fn decode(&mut self, samples: &[Sample]) -> Result<&BatchTensor, DecodeError> {
        self.state = BatchState::Idle;
        self.infos.clear();
        let started = Instant::now();

        match self.run_batch(samples) {
            Ok(counts) => {
                self.stats.batches += 1;
                self.stats.hybrid_decodes += counts.hybrid;
                self.stats.host_decodes += counts.host;
                self.stats.fallback_decodes += counts.fallback;
                self.stats.downgraded += counts.downgraded;
                info!(
                    batch = self.stats.batches,
                    samples = samples.len(),
                    hybrid = counts.hybrid,
                    host = counts.host,
                    fallback = counts.fallback,
                    bytes = self.output.byte_len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Batch decoded"
                );
                Ok(&self.output)
            }
            Err(err) => {
                // Nothing queued may still touch slot memory once we return.
                if let Err(sync_err) = self.stream.synchronize() {
                    debug!(error = %sync_err, "Discarded stream error of failed batch");
                }
                self.slots.reset_all(&self.engine);
                self.infos.clear();
                self.state = BatchState::Idle;
                self.stats.failed_batches += 1;
                warn!(
                    sample = err.sample().map(SourceId::as_str).unwrap_or("-"),
                    error = %err,
                    "Batch failed"
                );
                Err(err)
            }
        }
    }

    fn advance(&mut self, next: BatchState) {
        debug_assert_eq!(self.state.next(), Some(next), "illegal batch state transition");
        debug!(from = ?self.state, to = ?next, "Batch state");
        self.state = next;
    }

    fn run_batch(&mut self, samples: &[Sample]) -> Result<BatchCounts, DecodeError> {
        if samples.len() != self.config.batch_size {
            return Err(DecodeError::BatchSize {
                expected: self.config.batch_size,
                got: samples.len(),
            });
        }

        // Metadata
        self.slots.reset_all(&self.engine);
        let max_pixels = self.config.max_sample_pixels;
        for (slot, sample) in self.slots.iter_mut().zip(samples) {
            slot.info = parse_metadata(sample, &mut slot.stream, max_pixels)?;
        }
        let resolutions: Vec<Resolution> = self.slots.iter().map(|s| s.info.resolution).collect();
        if self
            .output
            .prepare(&self.device, &resolutions, self.config.device_memory_padding)
            .map_err(|error| output_error(samples, &resolutions, error))?
        {
            self.stats.output_reallocations += 1;
        }
        self.advance(BatchState::MetadataParsed);

        // Host stage
        let counts = self.run_host_stage(samples)?;
        self.advance(BatchState::HostStageDone);

        // Device stage
        let submitted = device_stage::submit(&self.engine, &mut self.slots, samples, &self.output, &self.stream)?;
        debug!(engine = submitted.engine, fallback = submitted.fallback, "Device stage submitted");
        self.advance(BatchState::DeviceStageSubmitted);

        self.stream.synchronize().map_err(stream_error)?;
        self.infos = self.slots.iter().map(|s| s.info.clone()).collect();
        self.advance(BatchState::BatchReady);
        Ok(counts)
    }

    fn run_host_stage(&mut self, samples: &[Sample]) -> Result<BatchCounts, DecodeError> {
        let layout = self.config.output_layout;

        // Pick a backend per supported slot and size its staging before any
        // task starts; tasks never allocate.
        let mut required = Vec::with_capacity(samples.len());
        for slot in self.slots.iter_mut() {
            let mut bytes = slot.info.output_bytes(layout);
            if slot.info.support.is_supported() {
                let backend = if self.config.prefers_hybrid(slot.info.cost()) {
                    Backend::Hybrid
                } else {
                    Backend::Host
                };
                slot.backend = Some(backend);
                if let Some(header) = slot.stream.as_ref() {
                    bytes = bytes.max(self.engine.staging_sizes(slot.decoder(backend), header).host);
                }
            }
            required.push(bytes);
        }
        for (index, (bytes, sample)) in required.into_iter().zip(samples).enumerate() {
            self.slots
                .ensure_pinned(index, bytes)
                .map_err(|error| DecodeError::Device {
                    sample: sample.source.clone(),
                    error,
                })?;
        }

        let infos: Vec<DecodeInfo> = self.slots.iter().map(|s| s.info.clone()).collect();
        let order = balance::schedule(&infos);

        let engine = &self.engine;
        let fallback = &self.fallback;
        let mut pending: Vec<Option<&mut SlotState<E::Decoder>>> = self.slots.iter_mut().map(Some).collect();
        let tasks = self.executor.task_group(|group| {
            for entry in &order {
                let slot = pending.get_mut(entry.slot).and_then(Option::take);
                let (Some(slot), Some(sample)) = (slot, samples.get(entry.slot)) else {
                    continue;
                };
                group.submit(entry.slot, sample.source.clone(), move || {
                    host_task(engine, fallback, slot, sample)
                });
            }
        })?;
        debug!(tasks, largest = order.first().map(|e| e.cost), "Host stage joined");

        let mut counts = BatchCounts::default();
        for slot in self.slots.iter() {
            match (slot.info.support, slot.backend) {
                (Support::Supported, Some(Backend::Hybrid)) => counts.hybrid += 1,
                (Support::Supported, Some(Backend::Host)) => counts.host += 1,
                (Support::FallbackRequired, backend) => {
                    counts.fallback += 1;
                    if backend.is_some() {
                        counts.downgraded += 1;
                    }
                }
                _ => {}
            }
        }
        Ok(counts)
    }
}

/// Host work of one slot: the engine's host phase, or the fallback decode
/// when the sample is not supported or the engine rejects it.
fn host_task<E: DecodeEngine>(
    engine: &E,
    fallback: &FallbackDecoder,
    slot: &mut SlotState<E::Decoder>,
    sample: &Sample,
) -> Result<(), DecodeError> {
    if slot.info.support.is_supported() {
        let Some((decoder, header, pinned)) = slot.host_phase_parts() else {
            return Err(DecodeError::HostWorker {
                sample: sample.source.clone(),
                reason: "supported slot has no backend or parsed stream".into(),
            });
        };
        let result = engine.decode_host(decoder, header, &sample.data, &mut pinned.host_slice());
        match result {
            Ok(()) => return Ok(()),
            Err(error) if error.is_recoverable() => {
                warn!(
                    sample = %sample.source,
                    backend = ?slot.backend,
                    error = %error,
                    "Decode engine rejected sample, using fallback"
                );
                slot.info.support.downgrade();
            }
            Err(error) => {
                return Err(DecodeError::Engine {
                    sample: sample.source.clone(),
                    error,
                })
            }
        }
    }

    let bytes = slot.info.output_bytes(fallback.layout());
    let mut staging = slot.pinned().host_slice();
    let Some(dst) = staging.get_mut(..bytes) else {
        return Err(DecodeError::HostWorker {
            sample: sample.source.clone(),
            reason: format!("pinned staging smaller than {bytes} bytes"),
        });
    };
    fallback.decode_into(sample, slot.info.resolution, dst)
}

/// Attribute an output allocation failure to the largest sample.
fn output_error(samples: &[Sample], resolutions: &[Resolution], error: DeviceError) -> DecodeError {
    let largest = resolutions
        .iter()
        .zip(samples)
        .max_by_key(|(r, _)| r.pixel_count())
        .map(|(_, sample)| sample.source.clone());
    match largest {
        Some(sample) => DecodeError::Device { sample, error },
        None => DecodeError::Output(error),
    }
}

/// Attribute a stream failure to the sample whose command failed.
fn stream_error(error: DeviceError) -> DecodeError {
    let sample = match &error {
        DeviceError::CommandFailed { label, .. } => Some(SourceId::new(label.clone())),
        _ => None,
    };
    match sample {
        Some(sample) => DecodeError::Device { sample, error },
        None => DecodeError::Stream(error),
    }
}

impl<E: DecodeEngine> fmt::Debug for BatchDecoder<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchDecoder")
            .field("engine", &self.engine.name())
            .field("state", &self.state)
            .field("batch_size", &self.config.batch_size)
            .field("executor", &self.executor)
            .field("stats", &self.stats)
            .finish()
    }
}

impl<E: DecodeEngine> Drop for BatchDecoder<E> {
    fn drop(&mut self) {
        // Host tasks cannot outlive a task group, so the stream is the only
        // place work can still be pending.
        if let Err(err) = self.stream.synchronize() {
            error!(error = %err, "Failed to drain command stream during shutdown");
        }
        info!(
            batches = self.stats.batches,
            failed = self.stats.failed_batches,
            "Batch decoder shut down"
        );
    }
}
