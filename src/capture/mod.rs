pub mod buffer_queue;
pub mod decoder;
pub mod device;
pub mod frame;
pub mod synthetic;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use buffer_queue::{BufferCounts, BufferQueue, DeviceBuffer, StreamPlan};
pub use device::CaptureDevice;
pub use frame::PixelFormat;
pub use synthetic::{SyntheticDevice, SyntheticProbe};
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Device;
