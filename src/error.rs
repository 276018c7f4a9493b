//! Error taxonomy shared by every stage of the capture engine

use std::time::Duration;

use thiserror::Error;

use crate::capture::frame::Size;

/// Every failure the session, queue or pipeline can report
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Device rejected a format, size, frame rate or buffer count
    #[error("device rejected configuration: {0}")]
    DeviceConfig(String),

    /// Operation needs an idle session
    #[error("operation not permitted while {0} request(s) are in flight")]
    Busy(usize),

    #[error("device produced no frame within {0:?}")]
    AcquireTimeout(Duration),

    #[error("frame decode failed: {0}")]
    Decode(String),

    #[error("unsupported destination layout: {0}")]
    UnsupportedLayout(String),

    /// The negotiated source cannot hold the requested output
    #[error("cannot crop {target} out of {frame}")]
    UncroppableSize { frame: Size, target: Size },

    #[error("encode failed: {0}")]
    Encode(String),

    /// Device handle is gone; the session closes
    #[error("device disconnected: {0}")]
    Disconnected(String),

    #[error("no device format can serve the requested streams")]
    NoCompatibleFormat,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("session has no active stream configuration")]
    NotConfigured,

    #[error("session is closed")]
    Closed,

    #[error("flush did not complete within {0:?}")]
    FlushTimeout(Duration),

    #[error("acquire fence not signalled within {0:?}")]
    FenceTimeout(Duration),

    #[error("request cancelled by flush")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CaptureError {
    /// Errors after which the session cannot continue
    pub fn is_fatal(&self) -> bool {
        matches!(self, CaptureError::Disconnected(_))
    }
}

pub type Result<T, E = CaptureError> = std::result::Result<T, E>;
