//! Device buffers and pinned host staging buffers.
//!
//! Both are reference-counted handles: cloning a handle aliases the same
//! memory, the way a raw device pointer would. Commands queued on a
//! [`CommandStream`](crate::CommandStream) hold their own clones, so memory
//! stays alive until the command has run even if the owner replaced its
//! handle in the meantime.

use std::fmt;
use std::sync::Arc;

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard, RwLock};

use pf_common::DeviceError;

use crate::device::MemoryTracker;

fn zeroed(size: usize) -> Result<Vec<u8>, DeviceError> {
    let mut bytes = Vec::new();
    bytes
        .try_reserve_exact(size)
        .map_err(|_| DeviceError::AllocFailed { size })?;
    bytes.resize(size, 0);
    Ok(bytes)
}

fn check_bounds(offset: usize, len: usize, size: usize) -> Result<(), DeviceError> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(DeviceError::OutOfBounds { offset, len, size }),
    }
}

// ---------------------------------------------------------------------------
// Device memory
// ---------------------------------------------------------------------------

struct DeviceAllocation {
    bytes: RwLock<Vec<u8>>,
    size: usize,
    tracker: Arc<MemoryTracker>,
}

impl Drop for DeviceAllocation {
    fn drop(&mut self) {
        self.tracker.sub(self.size, false);
    }
}

/// A contiguous allocation in accelerator memory.
#[derive(Clone)]
pub struct DeviceBuffer {
    inner: Arc<DeviceAllocation>,
}

impl DeviceBuffer {
    pub(crate) fn alloc_zeros(tracker: Arc<MemoryTracker>, size: usize) -> Result<Self, DeviceError> {
        let bytes = zeroed(size)?;
        tracker.add(size, false);
        Ok(Self {
            inner: Arc::new(DeviceAllocation {
                bytes: RwLock::new(bytes),
                size,
                tracker,
            }),
        })
    }

    /// Size of the allocation in bytes.
    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Whether two handles alias the same allocation.
    pub fn same_allocation(&self, other: &DeviceBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// A bounds-checked window into this buffer.
    pub fn region(&self, offset: usize, len: usize) -> Result<DeviceRegion, DeviceError> {
        check_bounds(offset, len, self.size())?;
        Ok(DeviceRegion {
            buffer: self.clone(),
            offset,
            len,
        })
    }

    /// The whole buffer as a region.
    pub fn full_region(&self) -> DeviceRegion {
        DeviceRegion {
            buffer: self.clone(),
            offset: 0,
            len: self.size(),
        }
    }

    /// Blocking copy of `dst.len()` bytes starting at `offset` to host memory.
    ///
    /// Does not wait for queued stream work; synchronize the stream first.
    pub fn copy_to_host(&self, offset: usize, dst: &mut [u8]) -> Result<(), DeviceError> {
        check_bounds(offset, dst.len(), self.size())?;
        let bytes = self.inner.bytes.read();
        dst.copy_from_slice(&bytes[offset..offset + dst.len()]);
        Ok(())
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("size", &self.size())
            .field("handles", &Arc::strong_count(&self.inner))
            .finish()
    }
}

/// A `[offset, offset + len)` window of a [`DeviceBuffer`].
#[derive(Clone, Debug)]
pub struct DeviceRegion {
    buffer: DeviceBuffer,
    offset: usize,
    len: usize,
}

impl DeviceRegion {
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn buffer(&self) -> &DeviceBuffer {
        &self.buffer
    }

    /// Device-side read access. Intended for code running as a stream command.
    pub fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let bytes = self.buffer.inner.bytes.read();
        f(&bytes[self.offset..self.offset + self.len])
    }

    /// Device-side write access. Intended for code running as a stream command.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut bytes = self.buffer.inner.bytes.write();
        f(&mut bytes[self.offset..self.offset + self.len])
    }
}

// ---------------------------------------------------------------------------
// Pinned host memory
// ---------------------------------------------------------------------------

struct PinnedAllocation {
    bytes: Mutex<Vec<u8>>,
    size: usize,
    tracker: Arc<MemoryTracker>,
}

impl Drop for PinnedAllocation {
    fn drop(&mut self) {
        self.tracker.sub(self.size, true);
    }
}

/// Page-locked host memory used for staging transfers to the device.
#[derive(Clone)]
pub struct PinnedBuffer {
    inner: Arc<PinnedAllocation>,
}

impl PinnedBuffer {
    pub(crate) fn alloc_zeros(tracker: Arc<MemoryTracker>, size: usize) -> Result<Self, DeviceError> {
        let bytes = zeroed(size)?;
        tracker.add(size, true);
        Ok(Self {
            inner: Arc::new(PinnedAllocation {
                bytes: Mutex::new(bytes),
                size,
                tracker,
            }),
        })
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Lock the buffer for host access.
    pub fn host_slice(&self) -> MappedMutexGuard<'_, [u8]> {
        MutexGuard::map(self.inner.bytes.lock(), |v| v.as_mut_slice())
    }

    /// Copy `data` into the buffer at `offset`.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<(), DeviceError> {
        check_bounds(offset, data.len(), self.size())?;
        self.host_slice()[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn same_allocation(&self, other: &PinnedBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for PinnedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedBuffer")
            .field("size", &self.size())
            .field("handles", &Arc::strong_count(&self.inner))
            .finish()
    }
}
