//! Packed output tensor of one batch.
//!
//! All samples live back to back in a single device buffer, each as an
//! interleaved `(height, width, channels)` image. Sample `i` always sits at
//! `offset(i)` regardless of the order in which slots were decoded.

use std::fmt;

use pf_common::{DeviceError, OutputLayout, Resolution};
use pf_device::{Device, DeviceBuffer, DeviceRegion};

/// Shape of one sample in the tensor, HWC order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SampleShape {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl SampleShape {
    pub fn byte_len(&self) -> usize {
        self.height * self.width * self.channels
    }
}

/// Batch output in device memory.
///
/// The allocation is reused across batches and only grows.
pub struct BatchTensor {
    buffer: DeviceBuffer,
    layout: OutputLayout,
    shapes: Vec<SampleShape>,
    offsets: Vec<usize>,
    byte_len: usize,
}

impl BatchTensor {
    pub fn new(device: &Device, layout: OutputLayout) -> Result<Self, DeviceError> {
        Ok(Self {
            buffer: device.alloc(0)?,
            layout,
            shapes: Vec::new(),
            offsets: Vec::new(),
            byte_len: 0,
        })
    }

    /// Lay out the tensor for samples of `resolutions`, growing the device
    /// buffer by `padding` extra bytes if it is too small.
    ///
    /// Returns `true` if the buffer was reallocated. A total size that does
    /// not fit in `usize` is reported as an allocation failure.
    pub fn prepare(
        &mut self,
        device: &Device,
        resolutions: &[Resolution],
        padding: usize,
    ) -> Result<bool, DeviceError> {
        let channels = self.layout.channels();
        self.shapes.clear();
        self.offsets.clear();
        self.byte_len = 0;
        let mut offset = 0usize;
        for r in resolutions {
            let shape = SampleShape {
                height: r.height as usize,
                width: r.width as usize,
                channels,
            };
            self.offsets.push(offset);
            offset = r
                .checked_byte_size(channels)
                .and_then(|len| offset.checked_add(len))
                .ok_or(DeviceError::AllocFailed { size: usize::MAX })?;
            self.shapes.push(shape);
        }
        self.byte_len = offset;
        device.ensure_device(&mut self.buffer, offset, padding)
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }

    pub fn layout(&self) -> OutputLayout {
        self.layout
    }

    pub fn shape(&self, index: usize) -> Option<SampleShape> {
        self.shapes.get(index).copied()
    }

    pub fn shapes(&self) -> &[SampleShape] {
        &self.shapes
    }

    pub fn offset(&self, index: usize) -> Option<usize> {
        self.offsets.get(index).copied()
    }

    /// Packed size of all samples in bytes.
    pub fn byte_len(&self) -> usize {
        self.byte_len
    }

    pub fn device_buffer(&self) -> &DeviceBuffer {
        &self.buffer
    }

    /// Device region of sample `index`.
    pub fn region(&self, index: usize) -> Result<DeviceRegion, DeviceError> {
        match (self.offsets.get(index), self.shapes.get(index)) {
            (Some(&offset), Some(shape)) => self.buffer.region(offset, shape.byte_len()),
            _ => Err(DeviceError::OutOfBounds {
                offset: index,
                len: 1,
                size: self.len(),
            }),
        }
    }

    /// Copy sample `index` to host memory.
    pub fn sample_to_host(&self, index: usize) -> Result<Vec<u8>, DeviceError> {
        let region = self.region(index)?;
        let mut host = vec![0u8; region.len()];
        self.buffer.copy_to_host(region.offset(), &mut host)?;
        Ok(host)
    }

    /// Copy the whole packed batch to host memory.
    pub fn to_host(&self) -> Result<Vec<u8>, DeviceError> {
        let mut host = vec![0u8; self.byte_len];
        self.buffer.copy_to_host(0, &mut host)?;
        Ok(host)
    }
}

impl fmt::Debug for BatchTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchTensor")
            .field("len", &self.len())
            .field("layout", &self.layout)
            .field("byte_len", &self.byte_len)
            .field("capacity", &self.buffer.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_are_packed_in_sample_order() {
        let dev = Device::open(0).unwrap();
        let mut t = BatchTensor::new(&dev, OutputLayout::Rgb).unwrap();
        t.prepare(
            &dev,
            &[Resolution::new(2, 1), Resolution::new(1, 3), Resolution::new(4, 4)],
            0,
        )
        .unwrap();
        assert_eq!(t.len(), 3);
        assert_eq!(t.offset(0), Some(0));
        assert_eq!(t.offset(1), Some(6));
        assert_eq!(t.offset(2), Some(15));
        assert_eq!(t.byte_len(), 63);
        assert_eq!(
            t.shape(1),
            Some(SampleShape {
                height: 3,
                width: 1,
                channels: 3
            })
        );
        assert!(t.shape(3).is_none());
        assert!(t.region(3).is_err());
    }

    #[test]
    fn buffer_is_reused_when_large_enough() {
        let dev = Device::open(0).unwrap();
        let mut t = BatchTensor::new(&dev, OutputLayout::Gray).unwrap();
        assert!(t.prepare(&dev, &[Resolution::new(10, 10)], 50).unwrap());
        assert_eq!(t.device_buffer().size(), 150);
        assert!(!t.prepare(&dev, &[Resolution::new(5, 5), Resolution::new(10, 12)], 50).unwrap());
        assert_eq!(t.byte_len(), 145);
        assert!(t.prepare(&dev, &[Resolution::new(20, 20)], 50).unwrap());
    }

    #[test]
    fn overflowing_layout_is_alloc_failure() {
        let dev = Device::open(0).unwrap();
        let mut t = BatchTensor::new(&dev, OutputLayout::Rgb).unwrap();
        let huge = Resolution::new(u32::MAX, u32::MAX);
        let err = t.prepare(&dev, &[huge, huge, huge], 0).unwrap_err();
        assert!(matches!(err, DeviceError::AllocFailed { .. }));
        assert_eq!(t.device_buffer().size(), 0);
    }

    #[test]
    fn host_copies_follow_regions() {
        let dev = Device::open(0).unwrap();
        let mut t = BatchTensor::new(&dev, OutputLayout::Gray).unwrap();
        t.prepare(&dev, &[Resolution::new(2, 1), Resolution::new(3, 1)], 0)
            .unwrap();
        t.region(1).unwrap().with_mut(|d| d.copy_from_slice(&[7, 8, 9]));
        t.region(0).unwrap().with_mut(|d| d.copy_from_slice(&[1, 2]));
        assert_eq!(t.sample_to_host(1).unwrap(), vec![7, 8, 9]);
        assert_eq!(t.to_host().unwrap(), vec![1, 2, 7, 8, 9]);
    }
}
