//! Process-owned I420 working frames and borrowed plane views

use crate::capture::frame::Size;
use crate::{CaptureError, Result};

/// Sub-rectangle of a frame, in luma pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn full(size: Size) -> Self {
        Self {
            left: 0,
            top: 0,
            width: size.width,
            height: size.height,
        }
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }
}

fn chroma_dims(size: Size) -> (usize, usize) {
    (
        (size.width as usize).div_ceil(2),
        (size.height as usize).div_ceil(2),
    )
}

/// Read-only planar YUV 4:2:0 image. Each plane slice starts at the
/// top-left sample of the view and rows are `stride` bytes apart.
#[derive(Clone, Copy)]
pub struct YuvPlanes<'a> {
    pub y: &'a [u8],
    pub u: &'a [u8],
    pub v: &'a [u8],
    pub y_stride: usize,
    pub c_stride: usize,
    pub size: Size,
}

impl<'a> YuvPlanes<'a> {
    pub fn chroma_size(&self) -> (usize, usize) {
        chroma_dims(self.size)
    }

    pub fn y_row(&self, row: usize) -> &'a [u8] {
        let start = row * self.y_stride;
        &self.y[start..start + self.size.width as usize]
    }

    pub fn u_row(&self, row: usize) -> &'a [u8] {
        let start = row * self.c_stride;
        &self.u[start..start + self.chroma_size().0]
    }

    pub fn v_row(&self, row: usize) -> &'a [u8] {
        let start = row * self.c_stride;
        &self.v[start..start + self.chroma_size().0]
    }
}

/// Writable planar YUV 4:2:0 image
pub struct YuvPlanesMut<'a> {
    pub y: &'a mut [u8],
    pub u: &'a mut [u8],
    pub v: &'a mut [u8],
    pub y_stride: usize,
    pub c_stride: usize,
    pub size: Size,
}

impl YuvPlanesMut<'_> {
    pub fn chroma_size(&self) -> (usize, usize) {
        chroma_dims(self.size)
    }
}

/// Tightly packed I420 frame owned by the pipeline
#[derive(Debug, Clone)]
pub struct ScratchFrame {
    size: Size,
    data: Vec<u8>,
}

impl ScratchFrame {
    pub fn new(size: Size) -> Self {
        let (cw, ch) = chroma_dims(size);
        let len = size.area() as usize + 2 * cw * ch;
        Self {
            size,
            data: vec![0; len],
        }
    }

    pub fn size(&self) -> Size {
        self.size
    }

    /// Changes the frame size, reusing the existing allocation when it is large enough
    pub fn reshape(&mut self, size: Size) {
        let (cw, ch) = chroma_dims(size);
        self.data.resize(size.area() as usize + 2 * cw * ch, 0);
        self.size = size;
    }

    fn split(&self) -> (usize, usize) {
        let (cw, ch) = chroma_dims(self.size);
        (self.size.area() as usize, cw * ch)
    }

    pub fn planes(&self) -> YuvPlanes<'_> {
        let (y_len, c_len) = self.split();
        let (y, chroma) = self.data.split_at(y_len);
        let (u, v) = chroma.split_at(c_len);
        YuvPlanes {
            y,
            u,
            v,
            y_stride: self.size.width as usize,
            c_stride: chroma_dims(self.size).0,
            size: self.size,
        }
    }

    pub fn planes_mut(&mut self) -> YuvPlanesMut<'_> {
        let (y_len, c_len) = self.split();
        let size = self.size;
        let (y, chroma) = self.data.split_at_mut(y_len);
        let (u, v) = chroma.split_at_mut(c_len);
        YuvPlanesMut {
            y,
            u,
            v,
            y_stride: size.width as usize,
            c_stride: chroma_dims(size).0,
            size,
        }
    }

    /// View of `rect`. Offsets must be even so chroma stays aligned.
    pub fn crop(&self, rect: Rect) -> Result<YuvPlanes<'_>> {
        let fits = rect.left.checked_add(rect.width).is_some_and(|r| r <= self.size.width)
            && rect.top.checked_add(rect.height).is_some_and(|b| b <= self.size.height);
        if !fits || rect.left % 2 != 0 || rect.top % 2 != 0 {
            return Err(CaptureError::UncroppableSize {
                frame: self.size,
                target: rect.size(),
            });
        }

        let full = self.planes();
        let y_off = rect.top as usize * full.y_stride + rect.left as usize;
        let c_off = (rect.top / 2) as usize * full.c_stride + (rect.left / 2) as usize;
        Ok(YuvPlanes {
            y: &full.y[y_off..],
            u: &full.u[c_off..],
            v: &full.v[c_off..],
            y_stride: full.y_stride,
            c_stride: full.c_stride,
            size: rect.size(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plane_sizes_follow_i420() {
        let frame = ScratchFrame::new(Size::new(6, 4));
        let planes = frame.planes();
        assert_eq!(planes.y.len(), 24);
        assert_eq!(planes.u.len(), 6);
        assert_eq!(planes.v.len(), 6);
        assert_eq!(planes.c_stride, 3);
    }

    #[test]
    fn crop_view_starts_at_offset() {
        let mut frame = ScratchFrame::new(Size::new(8, 8));
        {
            let planes = frame.planes_mut();
            for (i, px) in planes.y.iter_mut().enumerate() {
                *px = i as u8;
            }
        }
        let view = frame
            .crop(Rect {
                left: 2,
                top: 4,
                width: 4,
                height: 2,
            })
            .unwrap();
        assert_eq!(view.y_row(0), &[34, 35, 36, 37]);
        assert_eq!(view.y_row(1), &[42, 43, 44, 45]);
        assert_eq!(view.u_row(0).len(), 2);
    }

    #[test]
    fn crop_rejects_odd_or_oversized_rects() {
        let frame = ScratchFrame::new(Size::new(8, 8));
        let odd = Rect {
            left: 1,
            top: 0,
            width: 4,
            height: 4,
        };
        assert!(frame.crop(odd).is_err());
        let big = Rect {
            left: 2,
            top: 0,
            width: 8,
            height: 4,
        };
        assert!(frame.crop(big).is_err());
    }
}
