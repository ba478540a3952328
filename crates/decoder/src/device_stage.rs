//! Device stage: submit every slot's finishing work onto the shared stream.
//!
//! Runs after the host-stage barrier, on the orchestrating thread, in slot
//! order. Supported slots hand their staged state to the engine's device
//! phase; fallback slots upload the pixels the host stage already decoded.
//! Nothing here waits on the stream.

use tracing::debug;

use pf_common::{DecodeError, Sample};
use pf_device::CommandStream;

use crate::batch::BatchTensor;
use crate::engine::{Backend, DecodeEngine, DeviceJob};
use crate::jpeg::StreamHeader;
use crate::metadata::Support;
use crate::slot::{SlotPool, SlotState};

/// What was submitted for one batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubmitSummary {
    pub engine: usize,
    pub fallback: usize,
}

/// Enqueue the device work of every slot. Each command is labeled with the
/// sample's source id.
pub fn submit<E: DecodeEngine>(
    engine: &E,
    slots: &mut SlotPool<E::Decoder>,
    samples: &[Sample],
    output: &BatchTensor,
    stream: &CommandStream,
) -> Result<SubmitSummary, DecodeError> {
    let mut summary = SubmitSummary::default();

    for (index, sample) in samples.iter().enumerate() {
        let device_err = |error| DecodeError::Device {
            sample: sample.source.clone(),
            error,
        };
        let region = output.region(index).map_err(DecodeError::Output)?;
        let label = sample.source.as_str();

        let support = slots
            .get(index)
            .map(|s| s.info.support)
            .unwrap_or_default();
        match support {
            Support::Supported => {
                let required = {
                    let (slot, backend, header) = engine_slot(slots, index, sample)?;
                    engine.staging_sizes(slot.decoder(backend), header).device
                };
                slots.ensure_device(index, required).map_err(device_err)?;

                let (slot, backend, header) = engine_slot(slots, index, sample)?;
                let job = DeviceJob {
                    staging: slot.pinned(),
                    scratch: slot.device_staging(),
                    output: &region,
                    stream,
                    label,
                };
                engine
                    .decode_device(slot.decoder(backend), header, job)
                    .map_err(|error| DecodeError::Engine {
                        sample: sample.source.clone(),
                        error,
                    })?;
                summary.engine += 1;
            }
            Support::FallbackRequired => {
                let slot = slots.get(index).ok_or_else(|| missing_slot(sample))?;
                stream
                    .copy_htod(label, slot.pinned(), 0, &region)
                    .map_err(device_err)?;
                summary.fallback += 1;
            }
            Support::Unknown => {
                return Err(DecodeError::Metadata {
                    sample: sample.source.clone(),
                    reason: "sample reached the device stage unclassified".into(),
                })
            }
        }
        debug!(sample = %sample.source, slot = index, ?support, "Submitted device work");
    }

    Ok(summary)
}

type EngineSlot<'a, D> = (&'a SlotState<D>, Backend, &'a StreamHeader);

fn engine_slot<'a, D>(
    slots: &'a SlotPool<D>,
    index: usize,
    sample: &Sample,
) -> Result<EngineSlot<'a, D>, DecodeError> {
    let slot = slots.get(index).ok_or_else(|| missing_slot(sample))?;
    match (slot.backend, slot.stream.as_ref()) {
        (Some(backend), Some(header)) => Ok((slot, backend, header)),
        _ => Err(DecodeError::HostWorker {
            sample: sample.source.clone(),
            reason: "supported slot has no backend or parsed stream".into(),
        }),
    }
}

fn missing_slot(sample: &Sample) -> DecodeError {
    DecodeError::HostWorker {
        sample: sample.source.clone(),
        reason: "no slot for this batch position".into(),
    }
}
