//! Per-slot decode resources.
//!
//! One [`SlotState`] per batch position, stored contiguously in a
//! [`SlotPool`]. Slots are created with the pipeline and reused for every
//! batch; [`SlotState::reset`] clears everything derived from the previous
//! sample while keeping decoder handles and staging memory.

use std::fmt;

use tracing::debug;

use pf_common::{DeviceError, InitError, PipelineConfig};
use pf_device::{Device, DeviceBuffer, PinnedBuffer};

use crate::engine::{Backend, DecodeEngine};
use crate::jpeg::StreamHeader;
use crate::metadata::DecodeInfo;

/// Reusable decode state of one batch position.
pub struct SlotState<D> {
    index: usize,
    host_decoder: D,
    hybrid_decoder: D,
    /// Parsed stream of the current sample, when it is a JPEG.
    pub stream: Option<StreamHeader>,
    pub info: DecodeInfo,
    /// Backend picked for the current sample; `None` until the host stage
    /// assigns one, and for samples that went straight to fallback.
    pub backend: Option<Backend>,
    pinned: PinnedBuffer,
    device_staging: DeviceBuffer,
}

impl<D> SlotState<D> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn decoder(&self, backend: Backend) -> &D {
        match backend {
            Backend::Host => &self.host_decoder,
            Backend::Hybrid => &self.hybrid_decoder,
        }
    }

    pub fn pinned(&self) -> &PinnedBuffer {
        &self.pinned
    }

    pub fn device_staging(&self) -> &DeviceBuffer {
        &self.device_staging
    }

    /// Split borrows for the host phase of the engine path.
    ///
    /// `None` if no backend was assigned or there is no parsed stream.
    pub(crate) fn host_phase_parts(&mut self) -> Option<(&mut D, &StreamHeader, &PinnedBuffer)> {
        let decoder = match self.backend? {
            Backend::Host => &mut self.host_decoder,
            Backend::Hybrid => &mut self.hybrid_decoder,
        };
        Some((decoder, self.stream.as_ref()?, &self.pinned))
    }

    /// Forget the previous sample. Handles and buffers are kept.
    pub fn reset<E>(&mut self, engine: &E)
    where
        E: DecodeEngine<Decoder = D>,
    {
        self.stream = None;
        self.info = DecodeInfo::default();
        self.backend = None;
        engine.reset_decoder(&mut self.host_decoder);
        engine.reset_decoder(&mut self.hybrid_decoder);
    }
}

impl<D> fmt::Debug for SlotState<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotState")
            .field("index", &self.index)
            .field("info", &self.info)
            .field("backend", &self.backend)
            .field("pinned", &self.pinned.size())
            .field("device_staging", &self.device_staging.size())
            .finish()
    }
}

/// Arena of all slots of a pipeline.
pub struct SlotPool<D> {
    slots: Vec<SlotState<D>>,
    device: Device,
    host_padding: usize,
    device_padding: usize,
    reallocations: u64,
}

impl<D> SlotPool<D> {
    /// Create `config.batch_size` slots, each with a host and a hybrid
    /// decoder handle. Staging buffers start empty and grow on first use.
    pub fn new<E>(engine: &E, device: &Device, config: &PipelineConfig) -> Result<Self, InitError>
    where
        E: DecodeEngine<Decoder = D>,
    {
        let mut slots = Vec::with_capacity(config.batch_size);
        for index in 0..config.batch_size {
            let create = |backend| {
                engine
                    .create_decoder(backend, config.output_layout)
                    .map_err(|error| InitError::Engine { slot: index, error })
            };
            slots.push(SlotState {
                index,
                host_decoder: create(Backend::Host)?,
                hybrid_decoder: create(Backend::Hybrid)?,
                stream: None,
                info: DecodeInfo::default(),
                backend: None,
                pinned: device.alloc_pinned(0)?,
                device_staging: device.alloc(0)?,
            });
        }
        debug!(slots = slots.len(), engine = engine.name(), "Slot pool created");

        Ok(Self {
            slots,
            device: device.clone(),
            host_padding: config.host_memory_padding,
            device_padding: config.device_memory_padding,
            reallocations: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&SlotState<D>> {
        self.slots.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SlotState<D>> {
        self.slots.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, SlotState<D>> {
        self.slots.iter_mut()
    }

    /// Staging buffer replacements since creation.
    pub fn reallocations(&self) -> u64 {
        self.reallocations
    }

    pub fn reset_all<E>(&mut self, engine: &E)
    where
        E: DecodeEngine<Decoder = D>,
    {
        for slot in &mut self.slots {
            slot.reset(engine);
        }
    }

    /// Make slot `index`'s pinned staging hold at least `required` bytes.
    pub fn ensure_pinned(&mut self, index: usize, required: usize) -> Result<(), DeviceError> {
        let Some(slot) = self.slots.get_mut(index) else {
            return Ok(());
        };
        if self
            .device
            .ensure_pinned(&mut slot.pinned, required, self.host_padding)?
        {
            self.reallocations += 1;
            debug!(slot = index, size = slot.pinned.size(), "Grew pinned staging");
        }
        Ok(())
    }

    /// Make slot `index`'s device staging hold at least `required` bytes.
    pub fn ensure_device(&mut self, index: usize, required: usize) -> Result<(), DeviceError> {
        let Some(slot) = self.slots.get_mut(index) else {
            return Ok(());
        };
        if self
            .device
            .ensure_device(&mut slot.device_staging, required, self.device_padding)?
        {
            self.reallocations += 1;
            debug!(slot = index, size = slot.device_staging.size(), "Grew device staging");
        }
        Ok(())
    }
}

impl<D> fmt::Debug for SlotPool<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotPool")
            .field("slots", &self.slots.len())
            .field("reallocations", &self.reallocations)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ReferenceDecoder, ReferenceEngine};
    use crate::metadata::Support;
    use crate::testutil::jpeg_rgb;
    use pf_common::Resolution;

    fn pool(batch: usize, host_pad: usize, dev_pad: usize) -> SlotPool<ReferenceDecoder> {
        let config = PipelineConfig::new(batch, 1).with_padding(host_pad, dev_pad);
        let device = Device::open(0).unwrap();
        SlotPool::new(&ReferenceEngine::new(), &device, &config).unwrap()
    }

    #[test]
    fn one_slot_per_batch_position() {
        let pool = pool(4, 0, 0);
        assert_eq!(pool.len(), 4);
        for (i, slot) in pool.iter().enumerate() {
            assert_eq!(slot.index(), i);
            assert_eq!(slot.decoder(Backend::Host).backend(), Backend::Host);
            assert_eq!(slot.decoder(Backend::Hybrid).backend(), Backend::Hybrid);
        }
    }

    #[test]
    fn staging_grows_with_padding_and_never_shrinks() {
        let mut pool = pool(2, 100, 1000);
        pool.ensure_pinned(0, 50).unwrap();
        assert_eq!(pool.get(0).unwrap().pinned().size(), 150);
        pool.ensure_pinned(0, 120).unwrap();
        assert_eq!(pool.get(0).unwrap().pinned().size(), 150);
        pool.ensure_pinned(0, 10).unwrap();
        assert_eq!(pool.get(0).unwrap().pinned().size(), 150);

        pool.ensure_device(1, 1).unwrap();
        assert_eq!(pool.get(1).unwrap().device_staging().size(), 1001);
        assert_eq!(pool.reallocations(), 2);
    }

    #[test]
    fn reset_clears_previous_sample() {
        let engine = ReferenceEngine::new();
        let mut pool = pool(1, 0, 0);
        let header = StreamHeader::parse(&jpeg_rgb(8, 8, 0)).unwrap();
        pool.ensure_pinned(0, 8 * 8 * 3).unwrap();
        {
            let slot = pool.iter_mut().next().unwrap();
            slot.stream = Some(header);
            slot.info = DecodeInfo {
                resolution: Resolution::new(8, 8),
                components: 3,
                support: Support::Supported,
                ..DecodeInfo::default()
            };
            slot.backend = Some(Backend::Host);
            assert!(slot.host_phase_parts().is_some());
        }

        pool.reset_all(&engine);
        let slot = pool.iter_mut().next().unwrap();
        assert!(slot.stream.is_none());
        assert_eq!(slot.info, DecodeInfo::default());
        assert!(slot.backend.is_none());
        assert!(slot.host_phase_parts().is_none());
        assert_eq!(slot.pinned().size(), 8 * 8 * 3, "buffers survive reset");
    }
}
