//! Crop rectangle policy for adapting the negotiated frame to each output

use serde::{Deserialize, Serialize};

use super::scratch::Rect;
use crate::capture::frame::Size;
use crate::{CaptureError, Result};

/// Relative tolerance under which two aspect ratios count as equal
pub const ASPECT_RATIO_TOLERANCE: f32 = 0.025;

/// Axis along which the source is cropped to reach a different aspect ratio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CropAxis {
    /// Keep full width, crop rows
    Vertical,
    /// Keep full height, crop columns
    Horizontal,
}

pub fn aspect_ratio_close(a: f32, b: f32) -> bool {
    (a - b).abs() <= ASPECT_RATIO_TOLERANCE * a.max(b)
}

/// Centered crop of `source` that has the aspect ratio of `target`.
///
/// Close aspect ratios use the whole source. Extents and offsets are
/// rounded down to even values.
pub fn crop_rect(axis: CropAxis, source: Size, target: Size) -> Result<Rect> {
    if source.is_empty() || target.is_empty() {
        return Err(CaptureError::UncroppableSize { frame: source, target });
    }
    if aspect_ratio_close(source.aspect_ratio(), target.aspect_ratio()) {
        return Ok(Rect::full(source));
    }

    let (in_w, in_h) = (source.width as u64, source.height as u64);
    let (out_w, out_h) = (target.width as u64, target.height as u64);
    match axis {
        CropAxis::Vertical => {
            let scaled_h = out_h * in_w / out_w;
            if scaled_h > in_h {
                return Err(CaptureError::UncroppableSize { frame: source, target });
            }
            let scaled_h = scaled_h & !1;
            if scaled_h == 0 {
                return Err(CaptureError::UncroppableSize { frame: source, target });
            }
            Ok(Rect {
                left: 0,
                top: (((in_h - scaled_h) / 2) & !1) as u32,
                width: source.width,
                height: scaled_h as u32,
            })
        }
        CropAxis::Horizontal => {
            let scaled_w = out_w * in_h / out_h;
            if scaled_w > in_w {
                return Err(CaptureError::UncroppableSize { frame: source, target });
            }
            let scaled_w = scaled_w & !1;
            if scaled_w == 0 {
                return Err(CaptureError::UncroppableSize { frame: source, target });
            }
            Ok(Rect {
                left: (((in_w - scaled_w) / 2) & !1) as u32,
                top: 0,
                width: scaled_w as u32,
                height: source.height,
            })
        }
    }
}

/// Crop for a thumbnail: one scale factor for both axes, so exactly one
/// axis is trimmed and the result is centered on even offsets.
pub fn thumbnail_rect(source: Size, target: Size, max_area: u64) -> Result<Rect> {
    if target.area() > max_area || source.is_empty() || target.is_empty() {
        return Err(CaptureError::UncroppableSize { frame: source, target });
    }

    let (w_in, h_in) = (source.width as f32, source.height as f32);
    let (w_out, h_out) = (target.width as f32, target.height as f32);
    let scale = (h_in / h_out).min(w_in / w_out);

    let crop_w = 2 * (scale * w_out / 2.0) as u32;
    let crop_h = 2 * (scale * h_out / 2.0) as u32;
    let crop_w = crop_w.min(source.width);
    let crop_h = crop_h.min(source.height);

    let rect = Rect {
        left: 2 * ((source.width - crop_w) / 4),
        top: 2 * ((source.height - crop_h) / 4),
        width: crop_w,
        height: crop_h,
    };
    if rect.width == 0
        || rect.height == 0
        || rect.left >= source.width
        || rect.top >= source.height
        || rect.left + rect.width > source.width
        || rect.top + rect.height > source.height
    {
        return Err(CaptureError::UncroppableSize { frame: source, target });
    }
    Ok(rect)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn same_ratio_uses_whole_source() {
        let rect = crop_rect(
            CropAxis::Vertical,
            Size::new(1920, 1080),
            Size::new(1280, 720),
        )
        .unwrap();
        assert_eq!(rect, Rect::full(Size::new(1920, 1080)));
    }

    #[test]
    fn vertical_crop_trims_rows() {
        // 4:3 source, 16:9 output
        let rect = crop_rect(CropAxis::Vertical, Size::new(640, 480), Size::new(320, 180)).unwrap();
        assert_eq!(
            rect,
            Rect {
                left: 0,
                top: 60,
                width: 640,
                height: 360
            }
        );
    }

    #[test]
    fn horizontal_crop_trims_columns() {
        // 16:9 source, 4:3 output
        let rect =
            crop_rect(CropAxis::Horizontal, Size::new(1280, 720), Size::new(640, 480)).unwrap();
        assert_eq!(
            rect,
            Rect {
                left: 160,
                top: 0,
                width: 960,
                height: 720
            }
        );
    }

    #[test]
    fn taller_output_cannot_be_cropped_vertically() {
        let err = crop_rect(CropAxis::Vertical, Size::new(1280, 720), Size::new(640, 480))
            .unwrap_err();
        assert!(matches!(
            err,
            CaptureError::UncroppableSize { frame, target }
                if frame == Size::new(1280, 720) && target == Size::new(640, 480)
        ));
        assert_eq!(err.to_string(), "cannot crop 640x480 out of 1280x720");
    }

    #[test]
    fn thumbnail_crops_one_axis() {
        let rect = thumbnail_rect(Size::new(1280, 720), Size::new(240, 180), 240 * 180).unwrap();
        // scale = min(4, 5.33) = 4 -> 960x720, centred
        assert_eq!(
            rect,
            Rect {
                left: 160,
                top: 0,
                width: 960,
                height: 720
            }
        );
    }

    #[test]
    fn thumbnail_above_max_area_is_rejected() {
        assert!(thumbnail_rect(Size::new(640, 480), Size::new(320, 240), 240 * 180).is_err());
    }

    proptest! {
        #[test]
        fn equal_ratio_crop_is_identity(w in 1u32..200, h in 1u32..200, k in 1u32..8, vertical in any::<bool>()) {
            let source = Size::new(w * 2 * k, h * 2 * k);
            let target = Size::new(w * 2, h * 2);
            let axis = if vertical { CropAxis::Vertical } else { CropAxis::Horizontal };
            prop_assert_eq!(crop_rect(axis, source, target).unwrap(), Rect::full(source));
        }

        #[test]
        fn crops_are_even_and_inside(
            in_w in 8u32..4000, in_h in 8u32..4000,
            out_w in 8u32..4000, out_h in 8u32..4000,
            vertical in any::<bool>(),
        ) {
            let axis = if vertical { CropAxis::Vertical } else { CropAxis::Horizontal };
            let source = Size::new(in_w & !1, in_h & !1);
            if let Ok(rect) = crop_rect(axis, source, Size::new(out_w, out_h)) {
                prop_assert!(rect.left + rect.width <= source.width);
                prop_assert!(rect.top + rect.height <= source.height);
                prop_assert_eq!(rect.left % 2, 0);
                prop_assert_eq!(rect.top % 2, 0);
                prop_assert_eq!(rect.width % 2, 0);
                prop_assert_eq!(rect.height % 2, 0);
            }
        }
    }
}
