//! Call contract between the buffer queue and a streaming capture device

use std::time::Duration;

use super::frame::{DeviceFormat, FrameRate};
use crate::Result;

/// A filled slot handed back by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeuedBuffer {
    pub index: u32,
    pub bytes_used: u32,
    /// Driver timestamp (monotonic clock)
    pub timestamp: Duration,
}

/// Streaming capture device with a fixed arena of indexed buffer slots.
///
/// Implementations are driven from one thread at a time; the buffer queue
/// serializes every call under its own lock.
pub trait CaptureDevice: Send {
    /// Format catalog, one entry per (fourcc, size)
    fn formats(&self) -> Result<Vec<DeviceFormat>>;

    /// Applies format and size; returns the largest frame the driver may produce
    fn set_format(&mut self, format: &DeviceFormat) -> Result<u32>;

    fn set_frame_rate(&mut self, rate: FrameRate) -> Result<()>;

    /// Sizes the slot arena. Returns the count the driver actually allocated;
    /// a count of zero frees every slot.
    fn request_buffers(&mut self, count: u32) -> Result<u32>;

    fn stream_on(&mut self) -> Result<()>;

    /// Stops streaming. Every slot leaves the incoming queue.
    fn stream_off(&mut self) -> Result<()>;

    /// Waits up to `timeout` for a filled slot. `Ok(None)` means nothing arrived.
    fn dequeue(&mut self, timeout: Duration) -> Result<Option<DequeuedBuffer>>;

    /// Hands a drained slot back. Unknown indices are a caller error.
    fn enqueue(&mut self, index: u32) -> Result<()>;

    /// Slots currently owned by the driver, filled or waiting to be
    fn queued(&self) -> u32;

    /// Read-only view of the first `len` bytes of a slot, borrowed from the
    /// driver mapping
    fn map(&self, index: u32, len: usize) -> Result<&[u8]>;
}

impl<D: CaptureDevice + ?Sized> CaptureDevice for Box<D> {
    fn formats(&self) -> Result<Vec<DeviceFormat>> {
        (**self).formats()
    }

    fn set_format(&mut self, format: &DeviceFormat) -> Result<u32> {
        (**self).set_format(format)
    }

    fn set_frame_rate(&mut self, rate: FrameRate) -> Result<()> {
        (**self).set_frame_rate(rate)
    }

    fn request_buffers(&mut self, count: u32) -> Result<u32> {
        (**self).request_buffers(count)
    }

    fn stream_on(&mut self) -> Result<()> {
        (**self).stream_on()
    }

    fn stream_off(&mut self) -> Result<()> {
        (**self).stream_off()
    }

    fn dequeue(&mut self, timeout: Duration) -> Result<Option<DequeuedBuffer>> {
        (**self).dequeue(timeout)
    }

    fn enqueue(&mut self, index: u32) -> Result<()> {
        (**self).enqueue(index)
    }

    fn queued(&self) -> u32 {
        (**self).queued()
    }

    fn map(&self, index: u32, len: usize) -> Result<&[u8]> {
        (**self).map(index, len)
    }
}
