use std::path::Path;

use tracing::{debug, info};
use v4l::{capability::Flags, video::Capture, Device};

use crate::capture::frame::PixelFormat;
use crate::{CaptureError, Result};

/// Detected capture node and the format that made it eligible
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundDevice {
    pub path: String,
    pub format: PixelFormat,
}

/// First `/dev/video*` node that streams MJPEG or YUYV, preferring MJPEG
pub fn auto_detect_device() -> Result<FoundDevice> {
    info!("Auto-detecting capture devices...");

    let mut fallback = None;
    for i in 0..64 {
        let path = format!("/dev/video{i}");
        if !Path::new(&path).exists() {
            continue;
        }
        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            debug!("{} is not a capture node", path);
            continue;
        }
        let Ok(formats) = dev.enum_formats() else {
            continue;
        };
        for fmt in formats {
            match PixelFormat::from_fourcc(&fmt.fourcc.repr) {
                Some(PixelFormat::Mjpeg) => {
                    info!("Found MJPEG device: {} - {}", path, caps.card);
                    return Ok(FoundDevice {
                        path,
                        format: PixelFormat::Mjpeg,
                    });
                }
                Some(PixelFormat::Yuyv) if fallback.is_none() => {
                    fallback = Some(FoundDevice {
                        path: path.clone(),
                        format: PixelFormat::Yuyv,
                    });
                }
                _ => {}
            }
        }
    }

    fallback.ok_or_else(|| CaptureError::DeviceConfig("no suitable capture device found".into()))
}
