//! Accelerator device handle and allocation bookkeeping.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use pf_common::DeviceError;

use crate::buffer::{DeviceBuffer, PinnedBuffer};
use crate::stream::CommandStream;

/// Number of devices exposed by the host-emulated backend.
pub const EMULATED_DEVICE_COUNT: u32 = 1;

/// Memory counters shared by every allocation made on a device.
#[derive(Debug, Default)]
pub(crate) struct MemoryTracker {
    device_bytes: AtomicUsize,
    pinned_bytes: AtomicUsize,
    allocations: AtomicUsize,
}

impl MemoryTracker {
    pub(crate) fn add(&self, size: usize, pinned: bool) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        self.counter(pinned).fetch_add(size, Ordering::Relaxed);
    }

    pub(crate) fn sub(&self, size: usize, pinned: bool) {
        self.counter(pinned).fetch_sub(size, Ordering::Relaxed);
    }

    fn counter(&self, pinned: bool) -> &AtomicUsize {
        if pinned {
            &self.pinned_bytes
        } else {
            &self.device_bytes
        }
    }
}

/// Snapshot of a device's memory usage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryStats {
    /// Bytes currently held in device buffers.
    pub device_bytes: usize,
    /// Bytes currently held in pinned host buffers.
    pub pinned_bytes: usize,
    /// Allocations performed since the device was opened.
    pub allocations: usize,
}

/// Handle to one accelerator.
///
/// Cheap to clone; all clones share the same memory counters. Buffers and
/// streams keep the counters alive, so a `Device` may be dropped before
/// the resources created from it.
#[derive(Clone, Debug)]
pub struct Device {
    ordinal: u32,
    tracker: Arc<MemoryTracker>,
}

impl Device {
    /// Open the accelerator with the given ordinal.
    pub fn open(ordinal: u32) -> Result<Self, DeviceError> {
        if ordinal >= EMULATED_DEVICE_COUNT {
            return Err(DeviceError::NoDevice {
                ordinal,
                available: EMULATED_DEVICE_COUNT,
            });
        }
        info!(ordinal, backend = "host-emulated", "Opened accelerator device");
        Ok(Self {
            ordinal,
            tracker: Arc::new(MemoryTracker::default()),
        })
    }

    /// Number of devices that can be opened.
    pub fn count() -> u32 {
        EMULATED_DEVICE_COUNT
    }

    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    /// Allocate a zero-initialized device buffer of `size` bytes.
    pub fn alloc(&self, size: usize) -> Result<DeviceBuffer, DeviceError> {
        let buf = DeviceBuffer::alloc_zeros(self.tracker.clone(), size)?;
        debug!(size, ordinal = self.ordinal, "Allocated device buffer");
        Ok(buf)
    }

    /// Allocate a pinned (page-locked) host staging buffer of `size` bytes.
    pub fn alloc_pinned(&self, size: usize) -> Result<PinnedBuffer, DeviceError> {
        let buf = PinnedBuffer::alloc_zeros(self.tracker.clone(), size)?;
        debug!(size, ordinal = self.ordinal, "Allocated pinned host buffer");
        Ok(buf)
    }

    /// Replace `buf` with a larger allocation when it cannot hold `required`
    /// bytes. The new buffer has room for `required + padding` bytes.
    ///
    /// Returns `true` if a reallocation happened. Contents are not preserved.
    pub fn ensure_device(
        &self,
        buf: &mut DeviceBuffer,
        required: usize,
        padding: usize,
    ) -> Result<bool, DeviceError> {
        if buf.size() >= required {
            return Ok(false);
        }
        let size = required
            .checked_add(padding)
            .ok_or(DeviceError::AllocFailed { size: usize::MAX })?;
        *buf = self.alloc(size)?;
        Ok(true)
    }

    /// Pinned-memory counterpart of [`ensure_device`](Self::ensure_device).
    pub fn ensure_pinned(
        &self,
        buf: &mut PinnedBuffer,
        required: usize,
        padding: usize,
    ) -> Result<bool, DeviceError> {
        if buf.size() >= required {
            return Ok(false);
        }
        let size = required
            .checked_add(padding)
            .ok_or(DeviceError::AllocFailed { size: usize::MAX })?;
        *buf = self.alloc_pinned(size)?;
        Ok(true)
    }

    /// Create a new ordered asynchronous command stream.
    pub fn create_stream(&self) -> Result<CommandStream, DeviceError> {
        CommandStream::new(self.ordinal)
    }

    /// Current memory usage.
    pub fn memory_stats(&self) -> MemoryStats {
        MemoryStats {
            device_bytes: self.tracker.device_bytes.load(Ordering::Relaxed),
            pinned_bytes: self.tracker.pinned_bytes.load(Ordering::Relaxed),
            allocations: self.tracker.allocations.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_default_device() {
        let dev = Device::open(0).unwrap();
        assert_eq!(dev.ordinal(), 0);
        assert_eq!(Device::count(), EMULATED_DEVICE_COUNT);
    }

    #[test]
    fn open_missing_device_fails() {
        let err = Device::open(7).unwrap_err();
        assert_eq!(
            err,
            DeviceError::NoDevice {
                ordinal: 7,
                available: EMULATED_DEVICE_COUNT
            }
        );
    }

    #[test]
    fn memory_accounting_follows_drops() {
        let dev = Device::open(0).unwrap();
        let a = dev.alloc(1024).unwrap();
        let p = dev.alloc_pinned(512).unwrap();
        let stats = dev.memory_stats();
        assert_eq!(stats.device_bytes, 1024);
        assert_eq!(stats.pinned_bytes, 512);
        assert_eq!(stats.allocations, 2);

        drop(a);
        drop(p);
        let stats = dev.memory_stats();
        assert_eq!(stats.device_bytes, 0);
        assert_eq!(stats.pinned_bytes, 0);
    }

    #[test]
    fn ensure_grows_with_padding_and_reuses() {
        let dev = Device::open(0).unwrap();
        let mut buf = dev.alloc(0).unwrap();
        assert!(dev.ensure_device(&mut buf, 100, 28).unwrap());
        assert_eq!(buf.size(), 128);
        assert!(!dev.ensure_device(&mut buf, 120, 28).unwrap());
        assert_eq!(buf.size(), 128);

        let mut pinned = dev.alloc_pinned(16).unwrap();
        assert!(!dev.ensure_pinned(&mut pinned, 16, 0).unwrap());
        assert!(dev.ensure_pinned(&mut pinned, 17, 0).unwrap());
        assert_eq!(pinned.size(), 17);
    }
}
