use std::fmt;

use serde::{Deserialize, Serialize};

/// Pixel encodings a capture device may deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Mjpeg,
    Yuyv,
}

impl PixelFormat {
    pub fn fourcc(self) -> [u8; 4] {
        match self {
            PixelFormat::Mjpeg => *b"MJPG",
            PixelFormat::Yuyv => *b"YUYV",
        }
    }

    pub fn from_fourcc(code: &[u8; 4]) -> Option<Self> {
        match code {
            b"MJPG" => Some(PixelFormat::Mjpeg),
            b"YUYV" => Some(PixelFormat::Yuyv),
            _ => None,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = self.fourcc();
        write!(f, "{}", String::from_utf8_lossy(&code))
    }
}

/// Width and height in pixels
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.width as f32 / self.height as f32
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Frame interval as `numerator / denominator` seconds, the way V4L2 reports it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameRate {
    pub numerator: u32,
    pub denominator: u32,
}

impl FrameRate {
    pub const fn from_fps(fps: u32) -> Self {
        Self {
            numerator: 1,
            denominator: fps,
        }
    }

    pub fn fps(&self) -> f64 {
        if self.numerator == 0 {
            return 0.0;
        }
        self.denominator as f64 / self.numerator as f64
    }
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}fps", self.fps())
    }
}

/// One entry of the device format catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceFormat {
    pub width: u32,
    pub height: u32,
    pub fourcc: PixelFormat,
    pub frame_rates: Vec<FrameRate>,
}

impl DeviceFormat {
    pub fn new(width: u32, height: u32, fourcc: PixelFormat, fps: &[u32]) -> Self {
        Self {
            width,
            height,
            fourcc,
            frame_rates: fps.iter().map(|f| FrameRate::from_fps(*f)).collect(),
        }
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.size().aspect_ratio()
    }

    pub fn max_fps(&self) -> f64 {
        self.frame_rates
            .iter()
            .map(FrameRate::fps)
            .fold(0.0, f64::max)
    }

    /// Whether some supported rate is within 1 fps of `fps`
    pub fn supports_fps(&self, fps: f64) -> bool {
        self.frame_rates.iter().any(|r| (r.fps() - fps).abs() < 1.0)
    }
}

impl fmt::Display for DeviceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}x{}", self.fourcc, self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_interval_maps_to_fps() {
        let rate = FrameRate {
            numerator: 1001,
            denominator: 30000,
        };
        assert!((rate.fps() - 29.97).abs() < 0.01);
        assert_eq!(FrameRate::from_fps(15).fps(), 15.0);
    }

    #[test]
    fn fourcc_round_trips_known_codes() {
        assert_eq!(PixelFormat::from_fourcc(b"MJPG"), Some(PixelFormat::Mjpeg));
        assert_eq!(PixelFormat::from_fourcc(b"H264"), None);
        assert_eq!(PixelFormat::Yuyv.to_string(), "YUYV");
    }

    #[test]
    fn fps_support_is_within_one_frame() {
        let fmt = DeviceFormat::new(640, 480, PixelFormat::Mjpeg, &[15, 30]);
        assert!(fmt.supports_fps(29.5));
        assert!(!fmt.supports_fps(24.0));
        assert_eq!(fmt.max_fps(), 30.0);
    }
}
