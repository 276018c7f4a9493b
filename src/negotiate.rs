//! Device format, frame rate and pool size selection for a stream set

use std::cmp::Ordering;
use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::capture::frame::{DeviceFormat, FrameRate, PixelFormat, Size};
use crate::pipeline::crop::{aspect_ratio_close, crop_rect, CropAxis};
use crate::session::request::{StreamDirection, StreamShape};
use crate::{CaptureConfig, CaptureError, PipelineConfig, Result};

/// Rates at or above this run with the video-sized pool
const VIDEO_FPS: f64 = 30.0;

/// Crop axis that keeps the most of the device catalog usable.
///
/// Vertical cropping wants sources as tall as the tallest catalog entry,
/// horizontal cropping wants the widest. Whichever side has more entries
/// wins; a tie goes to the side with the larger resolution, then to
/// vertical.
pub fn choose_crop_axis(catalog: &[DeviceFormat]) -> CropAxis {
    let Some(min_ar) = catalog.iter().map(DeviceFormat::aspect_ratio).reduce(f32::min) else {
        return CropAxis::Vertical;
    };
    let max_ar = catalog
        .iter()
        .map(DeviceFormat::aspect_ratio)
        .fold(min_ar, f32::max);

    let side = |ar: f32| {
        let matching: Vec<&DeviceFormat> = catalog
            .iter()
            .filter(|f| aspect_ratio_close(f.aspect_ratio(), ar))
            .collect();
        let largest = matching.iter().map(|f| f.size().area()).max().unwrap_or(0);
        (matching.len(), largest)
    };
    let vertical = side(min_ar);
    let horizontal = side(max_ar);
    debug!(
        "Crop candidates: vertical {:?}, horizontal {:?}",
        vertical, horizontal
    );
    if horizontal > vertical {
        CropAxis::Horizontal
    } else {
        CropAxis::Vertical
    }
}

/// Fastest rate in the catalog, or 30 when some format offers it
pub fn default_fps(catalog: &[DeviceFormat]) -> u32 {
    if catalog.iter().any(|f| f.supports_fps(VIDEO_FPS)) {
        return VIDEO_FPS as u32;
    }
    catalog
        .iter()
        .map(DeviceFormat::max_fps)
        .fold(0.0, f64::max)
        .round() as u32
}

pub struct StreamNegotiator {
    /// Ordered by the uncropped dimension first
    catalog: Vec<DeviceFormat>,
    axis: CropAxis,
    capture: CaptureConfig,
    limits: PipelineConfig,
}

impl StreamNegotiator {
    pub fn new(mut catalog: Vec<DeviceFormat>, capture: CaptureConfig, limits: PipelineConfig) -> Self {
        let axis = choose_crop_axis(&catalog);
        catalog.sort_by(|a, b| compare_for(axis, a, b));
        info!(
            "{} device formats, cropping {:?}",
            catalog.len(),
            axis
        );
        Self {
            catalog,
            axis,
            capture,
            limits,
        }
    }

    pub fn crop_axis(&self) -> CropAxis {
        self.axis
    }

    pub fn catalog(&self) -> &[DeviceFormat] {
        &self.catalog
    }

    /// Largest catalog resolution by area
    pub fn max_resolution(&self) -> Size {
        self.catalog
            .iter()
            .map(DeviceFormat::size)
            .max_by_key(Size::area)
            .unwrap_or_default()
    }

    pub fn default_fps(&self) -> u32 {
        default_fps(&self.catalog)
    }

    pub fn supports_size(&self, size: Size) -> bool {
        self.catalog.iter().any(|f| f.size() == size)
    }

    /// Rejects stream sets the pipeline cannot serve
    pub fn validate(&self, streams: &[StreamShape]) -> Result<()> {
        if streams.is_empty() {
            return Err(CaptureError::InvalidArgument("empty stream set".into()));
        }
        let mut ids = HashSet::new();
        let (mut processed, mut stalling) = (0, 0);
        for stream in streams {
            if !ids.insert(stream.id) {
                return Err(CaptureError::InvalidArgument(format!(
                    "stream id {} used twice",
                    stream.id
                )));
            }
            if stream.direction != StreamDirection::Output {
                return Err(CaptureError::InvalidArgument(format!(
                    "stream {} is not an output",
                    stream.id
                )));
            }
            if stream.rotation != 0 {
                return Err(CaptureError::InvalidArgument(format!(
                    "stream {} asks for {} degree rotation",
                    stream.id, stream.rotation
                )));
            }
            if !self.supports_size(stream.size) {
                return Err(CaptureError::InvalidArgument(format!(
                    "stream {} size {} is not in the device catalog",
                    stream.id, stream.size
                )));
            }
            if stream.format.is_blob() {
                stalling += 1;
            } else {
                processed += 1;
            }
        }
        if processed > self.limits.max_processed_streams || stalling > self.limits.max_stall_streams {
            return Err(CaptureError::InvalidArgument(format!(
                "{processed} processed and {stalling} stalling streams, limits are {} and {}",
                self.limits.max_processed_streams, self.limits.max_stall_streams
            )));
        }
        Ok(())
    }

    /// Device format every stream in `streams` can be cropped and scaled from.
    ///
    /// The format must cover the largest requested extent along the axis
    /// that is never cropped. An exact aspect ratio match is preferred,
    /// otherwise the first format whose aspect ratio leaves room to crop.
    pub fn negotiate(&self, streams: &[StreamShape]) -> Result<DeviceFormat> {
        let desired = match self.axis {
            CropAxis::Vertical => streams.iter().map(|s| s.size.aspect_ratio()).reduce(f32::min),
            CropAxis::Horizontal => streams.iter().map(|s| s.size.aspect_ratio()).reduce(f32::max),
        }
        .ok_or(CaptureError::NoCompatibleFormat)?;
        let needed = streams
            .iter()
            .map(|s| uncropped(self.axis, s.size))
            .max()
            .unwrap_or(0);

        let large_enough = || {
            self.catalog
                .iter()
                .filter(move |f| uncropped(self.axis, f.size()) >= needed)
        };
        let exact = large_enough().find(|f| aspect_ratio_close(f.aspect_ratio(), desired));
        let chosen = exact
            .or_else(|| {
                large_enough().find(|f| match self.axis {
                    CropAxis::Vertical => f.aspect_ratio() < desired,
                    CropAxis::Horizontal => f.aspect_ratio() > desired,
                })
            })
            .ok_or(CaptureError::NoCompatibleFormat)?;

        for stream in streams {
            if crop_rect(self.axis, chosen.size(), stream.size).is_err() {
                warn!("{} cannot serve stream {} at {}", chosen, stream.id, stream.size);
                return Err(CaptureError::NoCompatibleFormat);
            }
        }
        debug!("Negotiated {} for {} streams", chosen, streams.len());
        Ok(chosen.clone())
    }

    /// Frame interval for `format`. `requested_fps == 0` asks for the
    /// slowest rate that still reaches 30fps, or the fastest available.
    pub fn frame_rate(&self, format: &DeviceFormat, requested_fps: u32) -> Result<FrameRate> {
        let mut rates = format.frame_rates.clone();
        if rates.is_empty() {
            return Err(CaptureError::DeviceConfig(format!("{format} reports no frame rates")));
        }
        rates.sort_by(|a, b| a.fps().partial_cmp(&b.fps()).unwrap_or(Ordering::Equal));

        if requested_fps == 0 {
            let rate = rates
                .iter()
                .find(|r| r.fps() >= VIDEO_FPS)
                .or_else(|| rates.last())
                .copied()
                .ok_or(CaptureError::NoCompatibleFormat)?;
            return Ok(rate);
        }

        let target = requested_fps as f64;
        if let Some(rate) = rates.iter().find(|r| (r.fps() - target).abs() < 1.0) {
            return Ok(*rate);
        }
        let closest = rates
            .iter()
            .min_by(|a, b| {
                (a.fps() - target)
                    .abs()
                    .partial_cmp(&(b.fps() - target).abs())
                    .unwrap_or(Ordering::Equal)
            })
            .copied()
            .ok_or(CaptureError::NoCompatibleFormat)?;
        warn!(
            "{} does not support {}fps, using {}",
            format, requested_fps, closest
        );
        Ok(closest)
    }

    pub fn buffer_count(&self, rate: FrameRate) -> u32 {
        if rate.fps() >= VIDEO_FPS {
            self.capture.num_video_buffers
        } else {
            self.capture.num_still_buffers
        }
    }
}

fn uncropped(axis: CropAxis, size: Size) -> u32 {
    match axis {
        CropAxis::Vertical => size.width,
        CropAxis::Horizontal => size.height,
    }
}

fn compare_for(axis: CropAxis, a: &DeviceFormat, b: &DeviceFormat) -> Ordering {
    let key = |f: &DeviceFormat| {
        let (first, second) = match axis {
            CropAxis::Vertical => (f.width, f.height),
            CropAxis::Horizontal => (f.height, f.width),
        };
        // Compressed frames cost less USB bandwidth at the same size
        (first, second, f.fourcc != PixelFormat::Mjpeg)
    };
    key(a).cmp(&key(b))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::session::request::StreamFormat;

    fn fmt(w: u32, h: u32, fps: &[u32]) -> DeviceFormat {
        DeviceFormat::new(w, h, PixelFormat::Mjpeg, fps)
    }

    fn webcam() -> Vec<DeviceFormat> {
        vec![
            fmt(1920, 1080, &[5, 15, 30]),
            fmt(640, 480, &[15, 30]),
            fmt(1280, 720, &[10, 15, 30]),
            fmt(320, 240, &[30]),
        ]
    }

    fn negotiator(catalog: Vec<DeviceFormat>) -> StreamNegotiator {
        StreamNegotiator::new(catalog, CaptureConfig::default(), PipelineConfig::default())
    }

    fn yuv(id: i32, w: u32, h: u32) -> StreamShape {
        StreamShape::output(id, w, h, StreamFormat::Ycbcr420)
    }

    #[test]
    fn axis_follows_candidate_count() {
        // two 4:3 entries vs one 16:9
        let catalog = vec![fmt(640, 480, &[30]), fmt(320, 240, &[30]), fmt(1280, 720, &[30])];
        assert_eq!(choose_crop_axis(&catalog), CropAxis::Vertical);

        let catalog = vec![fmt(640, 480, &[30]), fmt(1280, 720, &[30]), fmt(1920, 1080, &[30])];
        assert_eq!(choose_crop_axis(&catalog), CropAxis::Horizontal);

        // tie in count, 16:9 side has the larger resolution
        let catalog = vec![fmt(640, 480, &[30]), fmt(1280, 720, &[30])];
        assert_eq!(choose_crop_axis(&catalog), CropAxis::Horizontal);

        let catalog = vec![fmt(640, 480, &[30])];
        assert_eq!(choose_crop_axis(&catalog), CropAxis::Vertical);
    }

    #[test]
    fn exact_aspect_match_wins() {
        let n = negotiator(vec![fmt(640, 480, &[30]), fmt(640, 360, &[30]), fmt(320, 240, &[30])]);
        assert_eq!(n.crop_axis(), CropAxis::Vertical);
        let chosen = n.negotiate(&[yuv(1, 640, 360)]).unwrap();
        assert_eq!(chosen.size(), Size::new(640, 360));
    }

    #[test]
    fn conservative_fallback_crops_a_taller_source() {
        let n = negotiator(vec![fmt(640, 480, &[30]), fmt(320, 240, &[30]), fmt(1280, 960, &[30])]);
        let chosen = n.negotiate(&[yuv(1, 1280, 720)]).unwrap();
        assert_eq!(chosen.size(), Size::new(1280, 960));
    }

    #[test]
    fn too_wide_request_has_no_format() {
        let n = negotiator(vec![fmt(640, 480, &[30]), fmt(320, 240, &[30])]);
        let err = n.negotiate(&[yuv(1, 1280, 720)]).unwrap_err();
        assert!(matches!(err, CaptureError::NoCompatibleFormat));
    }

    #[test]
    fn default_rate_prefers_slowest_video_rate() {
        let n = negotiator(webcam());
        let f = fmt(1280, 720, &[60, 10, 30]);
        assert_eq!(n.frame_rate(&f, 0).unwrap().fps(), 30.0);
        let slow = fmt(1920, 1080, &[5, 15]);
        assert_eq!(n.frame_rate(&slow, 0).unwrap().fps(), 15.0);
        assert_eq!(n.frame_rate(&f, 24).unwrap().fps(), 30.0);
        assert_eq!(n.frame_rate(&f, 10).unwrap().fps(), 10.0);
    }

    #[test]
    fn pool_size_tracks_rate() {
        let n = negotiator(webcam());
        assert_eq!(n.buffer_count(FrameRate::from_fps(30)), 4);
        assert_eq!(n.buffer_count(FrameRate::from_fps(15)), 2);
        assert_eq!(default_fps(&webcam()), 30);
        assert_eq!(default_fps(&[fmt(640, 480, &[15, 20])]), 20);
    }

    #[test]
    fn validation_limits_stream_mix() {
        let n = negotiator(webcam());
        let blob = |id| StreamShape::output(id, 640, 480, StreamFormat::Blob);
        assert!(n.validate(&[yuv(1, 640, 480), yuv(2, 320, 240), blob(3)]).is_ok());
        assert!(n.validate(&[yuv(1, 640, 480), yuv(2, 320, 240), yuv(3, 320, 240)]).is_err());
        assert!(n.validate(&[blob(1), blob(2)]).is_err());
        assert!(n.validate(&[yuv(1, 640, 480), yuv(1, 320, 240)]).is_err());
        assert!(n.validate(&[yuv(1, 800, 600)]).is_err());
        assert!(n.validate(&[]).is_err());
    }

    proptest! {
        #[test]
        fn negotiated_format_serves_every_stream(
            picks in proptest::collection::vec(0usize..4, 1..3),
        ) {
            let n = negotiator(webcam());
            let sizes = [(320, 240), (640, 480), (1280, 720), (1920, 1080)];
            let streams: Vec<StreamShape> = picks
                .iter()
                .enumerate()
                .map(|(i, &p)| yuv(i as i32, sizes[p].0, sizes[p].1))
                .collect();
            if let Ok(chosen) = n.negotiate(&streams) {
                for s in &streams {
                    prop_assert!(crop_rect(n.crop_axis(), chosen.size(), s.size).is_ok());
                }
            }
        }
    }
}
