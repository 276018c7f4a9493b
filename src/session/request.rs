//! Stream, request and result types exchanged with the session's client

use std::ops::BitOr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::buffers::{Fence, GraphicBuffer};
use crate::capture::frame::Size;
use crate::pipeline::exif::GpsFix;
use crate::pipeline::scratch::Rect;
use crate::{CaptureError, Result};

/// Client-visible pixel formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamFormat {
    /// Compressed JPEG in a byte buffer
    Blob,
    /// Flexible YUV 4:2:0, layout decided by the buffer
    Ycbcr420,
    Yv12,
    /// Resolved at configure time from the usage flags
    ImplementationDefined,
}

impl StreamFormat {
    pub fn is_blob(self) -> bool {
        self == StreamFormat::Blob
    }
}

/// Gralloc-style usage bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BufferUsage(pub u64);

impl BufferUsage {
    pub const CPU_READ_OFTEN: BufferUsage = BufferUsage(0x3);
    pub const CPU_WRITE_OFTEN: BufferUsage = BufferUsage(0x3 << 4);
    pub const VIDEO_ENCODER: BufferUsage = BufferUsage(1 << 16);
    pub const CAMERA_OUTPUT: BufferUsage = BufferUsage(1 << 17);

    pub fn contains(self, other: BufferUsage) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for BufferUsage {
    type Output = BufferUsage;

    fn bitor(self, rhs: BufferUsage) -> BufferUsage {
        BufferUsage(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamDirection {
    Output,
    Input,
}

/// One client output stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamShape {
    pub id: i32,
    pub size: Size,
    pub format: StreamFormat,
    pub usage: BufferUsage,
    pub direction: StreamDirection,
    /// Degrees; only 0 is supported
    pub rotation: u32,
}

impl StreamShape {
    pub fn output(id: i32, width: u32, height: u32, format: StreamFormat) -> Self {
        Self {
            id,
            size: Size::new(width, height),
            format,
            usage: BufferUsage::CPU_READ_OFTEN,
            direction: StreamDirection::Output,
            rotation: 0,
        }
    }
}

/// Per-stream answer to a configure call
#[derive(Debug, Clone, PartialEq)]
pub struct HalStream {
    pub id: i32,
    pub override_format: StreamFormat,
    pub producer_usage: BufferUsage,
    pub consumer_usage: BufferUsage,
    pub max_buffers: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestTemplate {
    Preview,
    StillCapture,
    VideoRecord,
    VideoSnapshot,
    Manual,
    ZeroShutterLag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AfTrigger {
    #[default]
    Idle,
    Start,
    Cancel,
}

/// Capture controls. The latest settings stay in effect until replaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSettings {
    pub capture_intent: RequestTemplate,
    /// `(min, max)` fps; the device is retuned to `max`
    pub ae_target_fps_range: (u32, u32),
    pub jpeg_quality: u8,
    pub thumbnail_quality: u8,
    /// `(0, 0)` disables the thumbnail
    pub thumbnail_size: Size,
    pub jpeg_orientation: u32,
    pub gps: Option<GpsFix>,
    pub af_trigger: AfTrigger,
    pub exposure_time: Option<f64>,
    pub aperture: Option<f32>,
    pub focal_length: Option<f32>,
    pub sensitivity: Option<u16>,
}

impl RequestSettings {
    /// Defaults for `template` on a device whose preferred rate is `default_fps`
    pub fn for_template(template: RequestTemplate, default_fps: u32) -> Result<Self> {
        if matches!(
            template,
            RequestTemplate::Manual | RequestTemplate::ZeroShutterLag
        ) {
            return Err(CaptureError::InvalidArgument(format!(
                "{template:?} template is not supported"
            )));
        }
        Ok(Self {
            capture_intent: template,
            ae_target_fps_range: (default_fps / 2, default_fps),
            jpeg_quality: 90,
            thumbnail_quality: 90,
            thumbnail_size: Size::new(240, 180),
            jpeg_orientation: 0,
            gps: None,
            af_trigger: AfTrigger::Idle,
            exposure_time: None,
            aperture: None,
            focal_length: None,
            sensitivity: None,
        })
    }
}

/// One destination buffer in a request
#[derive(Clone)]
pub struct OutputBuffer {
    pub stream_id: i32,
    pub buffer_id: u64,
    /// Needed the first time a buffer id is used on a stream
    pub handle: Option<GraphicBuffer>,
    pub acquire_fence: Option<Fence>,
}

#[derive(Clone)]
pub struct CaptureRequest {
    pub frame_number: u32,
    /// `None` reuses the previous request's settings
    pub settings: Option<RequestSettings>,
    pub outputs: Vec<OutputBuffer>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone)]
pub struct StreamBufferResult {
    pub stream_id: i32,
    pub buffer_id: u64,
    pub status: BufferStatus,
    /// Client waits on this before reading; set when the buffer was never written
    pub release_fence: Option<Fence>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AeState {
    Converged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwbState {
    Converged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfState {
    Inactive,
    FocusedLocked,
}

/// Dynamic metadata attached to a successful result
#[derive(Debug, Clone)]
pub struct ResultMetadata {
    pub sensor_timestamp: Duration,
    pub ae_state: AeState,
    pub awb_state: AwbState,
    pub af_state: AfState,
    pub pipeline_depth: u8,
    pub flash_available: bool,
    /// Region of the device frame the outputs were taken from
    pub crop_region: Rect,
    pub settings: RequestSettings,
}

/// Exactly one per submitted request
#[derive(Debug, Clone)]
pub struct ResultRecord {
    pub frame_number: u32,
    pub buffers: Vec<StreamBufferResult>,
    /// `None` when the whole request failed
    pub metadata: Option<ResultMetadata>,
    pub error: Option<String>,
}

impl ResultRecord {
    pub fn is_ok(&self) -> bool {
        self.error.is_none() && self.buffers.iter().all(|b| b.status == BufferStatus::Ok)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Session is unusable
    Device,
    /// Request produced no output
    Request,
    /// Metadata lost, buffers may be fine
    Result,
    /// One buffer failed
    Buffer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyMsg {
    Shutter {
        frame_number: u32,
        timestamp: Duration,
    },
    Error {
        frame_number: u32,
        stream_id: Option<i32>,
        code: ErrorCode,
    },
}

/// Receives notifications and results, in order, from the worker thread
pub trait ResultSink: Send + Sync {
    fn notify(&self, msg: NotifyMsg);
    fn process_result(&self, result: ResultRecord);
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Notify(NotifyMsg),
    Result(ResultRecord),
}

/// [`ResultSink`] forwarding into a flume channel
pub struct ChannelSink {
    tx: flume::Sender<SessionEvent>,
}

impl ChannelSink {
    pub fn unbounded() -> (Self, flume::Receiver<SessionEvent>) {
        let (tx, rx) = flume::unbounded();
        (Self { tx }, rx)
    }

    pub fn bounded(capacity: usize) -> (Self, flume::Receiver<SessionEvent>) {
        let (tx, rx) = flume::bounded(capacity);
        (Self { tx }, rx)
    }

    fn send(&self, event: SessionEvent) {
        if self.tx.send(event).is_err() {
            warn!("Result receiver dropped");
        }
    }
}

impl ResultSink for ChannelSink {
    fn notify(&self, msg: NotifyMsg) {
        self.send(SessionEvent::Notify(msg));
    }

    fn process_result(&self, result: ResultRecord) {
        self.send(SessionEvent::Result(result));
    }
}
