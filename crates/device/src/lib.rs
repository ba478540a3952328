//! `pf-device`: Accelerator abstraction for pixelfeed.
//!
//! The decoder talks to the accelerator through three handles:
//!
//! - [`Device`]: opens an ordinal and allocates memory
//! - [`DeviceBuffer`] / [`PinnedBuffer`]: device memory and pinned host staging
//! - [`CommandStream`]: an in-order asynchronous command queue with
//!   synchronization points and sticky error reporting
//!
//! This backend emulates the accelerator on the host: device memory lives in
//! ordinary heap allocations and each stream runs its commands on a
//! dedicated worker thread. Ordering and error semantics match what the
//! decoder relies on from a real device.

pub mod buffer;
pub mod device;
pub mod stream;

pub use buffer::{DeviceBuffer, DeviceRegion, PinnedBuffer};
pub use device::{Device, MemoryStats, EMULATED_DEVICE_COUNT};
pub use stream::{CommandStream, StreamStats};
