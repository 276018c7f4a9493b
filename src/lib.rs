pub mod capture;
pub mod error;
pub mod negotiate;
pub mod pipeline;
pub mod session;
#[cfg(feature = "v4l2")]
pub mod utils;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use capture::frame::{DeviceFormat, FrameRate, PixelFormat, Size};
pub use error::{CaptureError, Result};
pub use session::CaptureSession;

/// Engine configuration, loadable from TOML/env by the binary
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub pipeline: PipelineConfig,
    pub jpeg: JpegConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Device node; `None` lets the binary probe /dev/video*
    pub device: Option<String>,
    /// Buffer count for streams at or above 30fps
    pub num_video_buffers: u32,
    /// Buffer count for slower still-oriented streams
    pub num_still_buffers: u32,
    /// Frames dropped right after stream on (some webcams send garbage)
    pub bad_frames_after_stream_on: u32,
    pub buffer_wait_ms: u64,
    /// Granularity of a single device poll inside acquire
    pub dequeue_slice_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub request_poll_ms: u64,
    /// Empty polls before the worker re-checks its exit flag from idle
    pub request_poll_ticks: u32,
    pub flush_timeout_ms: u64,
    pub fence_timeout_ms: u64,
    pub max_processed_streams: usize,
    pub max_stall_streams: usize,
    /// Pin the worker thread to this core
    pub worker_cpu: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JpegConfig {
    /// Buffer size for a JPEG at the largest catalog resolution
    pub max_size: u32,
    /// Thumbnail sizes advertised to clients; (0, 0) disables the thumbnail
    pub thumbnail_sizes: Vec<Size>,
    pub default_quality: u8,
    pub make: String,
    pub model: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: None,
            num_video_buffers: 4,
            num_still_buffers: 2,
            bad_frames_after_stream_on: 1,
            buffer_wait_ms: 3000,
            dequeue_slice_ms: 33,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            request_poll_ms: 33, // 30fps
            request_poll_ticks: 90,
            flush_timeout_ms: 3000,
            fence_timeout_ms: 500,
            max_processed_streams: 2,
            max_stall_streams: 1,
            worker_cpu: None,
        }
    }
}

impl Default for JpegConfig {
    fn default() -> Self {
        Self {
            max_size: 3 << 20,
            thumbnail_sizes: vec![
                Size::new(0, 0),
                Size::new(176, 144),
                Size::new(240, 144),
                Size::new(256, 144),
                Size::new(240, 160),
                Size::new(256, 154),
                Size::new(240, 180),
            ],
            default_quality: 90,
            make: "Generic UVC webcam".into(),
            model: "Generic UVC webcam".into(),
        }
    }
}

impl CaptureConfig {
    pub fn buffer_wait(&self) -> Duration {
        Duration::from_millis(self.buffer_wait_ms)
    }

    pub fn dequeue_slice(&self) -> Duration {
        Duration::from_millis(self.dequeue_slice_ms.max(1))
    }
}

impl PipelineConfig {
    pub fn request_poll(&self) -> Duration {
        Duration::from_millis(self.request_poll_ms.max(1))
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_timeout_ms)
    }
}

impl JpegConfig {
    /// Largest advertised thumbnail, by area
    pub fn max_thumbnail(&self) -> Size {
        self.thumbnail_sizes
            .iter()
            .copied()
            .max_by_key(Size::area)
            .unwrap_or_default()
    }
}

/// Locks `mutex`, recovering the data if a previous holder panicked
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
