//! I420 to client buffer layout conversion
//!
//! The destination layout is classified once from plane geometry and the
//! converter is looked up in a table.

use std::collections::HashMap;
use std::fmt;

use once_cell::sync::Lazy;

use super::scratch::YuvPlanes;
use crate::capture::frame::Size;
use crate::{CaptureError, Result};

/// Plane geometry of a locked YUV 4:2:0 client buffer, as byte offsets into its memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YcbcrLayout {
    pub y_offset: usize,
    pub cb_offset: usize,
    pub cr_offset: usize,
    pub y_stride: usize,
    pub c_stride: usize,
    /// Distance between consecutive samples of one chroma plane
    pub chroma_step: usize,
}

impl YcbcrLayout {
    /// Bytes a buffer must have to hold `size` in this layout
    pub fn required_len(&self, size: Size) -> usize {
        let (w, h) = (size.width as usize, size.height as usize);
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
        let luma_end = self.y_offset + (h.max(1) - 1) * self.y_stride + w;
        let chroma_end = self.cb_offset.max(self.cr_offset)
            + (ch.max(1) - 1) * self.c_stride
            + (cw.max(1) - 1) * self.chroma_step
            + 1;
        luma_end.max(chroma_end)
    }
}

/// Destination encodings the pipeline can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DestinationLayout {
    /// Y plane, interleaved CbCr
    Nv12,
    /// Y plane, interleaved CrCb
    Nv21,
    /// Y, Cr, Cb planes
    Yv12,
    /// Y, Cb, Cr planes (I420)
    Yu12,
}

impl DestinationLayout {
    pub const ALL: [DestinationLayout; 4] = [
        DestinationLayout::Nv12,
        DestinationLayout::Nv21,
        DestinationLayout::Yv12,
        DestinationLayout::Yu12,
    ];

    pub fn classify(layout: &YcbcrLayout) -> Result<Self> {
        let cb_after_cr = layout.cb_offset > layout.cr_offset;
        match layout.chroma_step {
            2 if layout.cb_offset.abs_diff(layout.cr_offset) == 1 => Ok(if cb_after_cr {
                DestinationLayout::Nv21
            } else {
                DestinationLayout::Nv12
            }),
            1 => Ok(if cb_after_cr {
                DestinationLayout::Yv12
            } else {
                DestinationLayout::Yu12
            }),
            _ => Err(CaptureError::UnsupportedLayout(format!("{layout:?}"))),
        }
    }

    /// Tightly packed geometry; YV12 keeps its 16-byte stride alignment
    pub fn layout_for(self, size: Size) -> YcbcrLayout {
        let (w, h) = (size.width as usize, size.height as usize);
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
        match self {
            DestinationLayout::Nv12 | DestinationLayout::Nv21 => {
                let base = w * h;
                let (cb, cr) = if self == DestinationLayout::Nv12 {
                    (base, base + 1)
                } else {
                    (base + 1, base)
                };
                YcbcrLayout {
                    y_offset: 0,
                    cb_offset: cb,
                    cr_offset: cr,
                    y_stride: w,
                    c_stride: cw * 2,
                    chroma_step: 2,
                }
            }
            DestinationLayout::Yv12 => {
                let y_stride = w.next_multiple_of(16);
                let c_stride = (y_stride / 2).next_multiple_of(16);
                let cr = y_stride * h;
                YcbcrLayout {
                    y_offset: 0,
                    cb_offset: cr + c_stride * ch,
                    cr_offset: cr,
                    y_stride,
                    c_stride,
                    chroma_step: 1,
                }
            }
            DestinationLayout::Yu12 => {
                let cb = w * h;
                YcbcrLayout {
                    y_offset: 0,
                    cb_offset: cb,
                    cr_offset: cb + cw * ch,
                    y_stride: w,
                    c_stride: cw,
                    chroma_step: 1,
                }
            }
        }
    }
}

impl fmt::Display for DestinationLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DestinationLayout::Nv12 => "NV12",
            DestinationLayout::Nv21 => "NV21",
            DestinationLayout::Yv12 => "YV12",
            DestinationLayout::Yu12 => "YU12",
        };
        f.write_str(name)
    }
}

type ConvertFn = fn(&YuvPlanes<'_>, &YcbcrLayout, &mut [u8]);

static CONVERTERS: Lazy<HashMap<DestinationLayout, ConvertFn>> = Lazy::new(|| {
    let mut table: HashMap<DestinationLayout, ConvertFn> = HashMap::new();
    table.insert(DestinationLayout::Nv12, write_interleaved);
    table.insert(DestinationLayout::Nv21, write_interleaved);
    table.insert(DestinationLayout::Yv12, write_planar);
    table.insert(DestinationLayout::Yu12, write_planar);
    table
});

fn write_luma(src: &YuvPlanes<'_>, layout: &YcbcrLayout, dst: &mut [u8]) {
    let w = src.size.width as usize;
    for row in 0..src.size.height as usize {
        let start = layout.y_offset + row * layout.y_stride;
        dst[start..start + w].copy_from_slice(src.y_row(row));
    }
}

fn write_interleaved(src: &YuvPlanes<'_>, layout: &YcbcrLayout, dst: &mut [u8]) {
    write_luma(src, layout, dst);
    let (_, ch) = src.chroma_size();
    for row in 0..ch {
        let base = row * layout.c_stride;
        for (i, (&u, &v)) in src.u_row(row).iter().zip(src.v_row(row)).enumerate() {
            dst[layout.cb_offset + base + i * 2] = u;
            dst[layout.cr_offset + base + i * 2] = v;
        }
    }
}

fn write_planar(src: &YuvPlanes<'_>, layout: &YcbcrLayout, dst: &mut [u8]) {
    write_luma(src, layout, dst);
    let (cw, ch) = src.chroma_size();
    for row in 0..ch {
        let cb = layout.cb_offset + row * layout.c_stride;
        let cr = layout.cr_offset + row * layout.c_stride;
        dst[cb..cb + cw].copy_from_slice(src.u_row(row));
        dst[cr..cr + cw].copy_from_slice(src.v_row(row));
    }
}

/// Writes `src` into `dst` using the client geometry `layout`
pub fn convert(src: &YuvPlanes<'_>, layout: &YcbcrLayout, dst: &mut [u8]) -> Result<DestinationLayout> {
    let kind = DestinationLayout::classify(layout)?;
    let needed = layout.required_len(src.size);
    if dst.len() < needed {
        return Err(CaptureError::InvalidArgument(format!(
            "{kind} buffer of {} bytes, {} needs {needed}",
            dst.len(),
            src.size
        )));
    }
    let write = CONVERTERS
        .get(&kind)
        .ok_or_else(|| CaptureError::UnsupportedLayout(kind.to_string()))?;
    write(src, layout, dst);
    Ok(kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::scratch::ScratchFrame;

    fn sample_frame() -> ScratchFrame {
        let mut frame = ScratchFrame::new(Size::new(4, 2));
        let planes = frame.planes_mut();
        planes.y.copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        planes.u.copy_from_slice(&[10, 11]);
        planes.v.copy_from_slice(&[20, 21]);
        frame
    }

    #[test]
    fn classifies_standard_layouts() {
        for kind in DestinationLayout::ALL {
            let layout = kind.layout_for(Size::new(64, 48));
            assert_eq!(DestinationLayout::classify(&layout).unwrap(), kind);
        }
    }

    #[test]
    fn flexible_layout_is_unsupported() {
        let layout = YcbcrLayout {
            y_offset: 0,
            cb_offset: 100,
            cr_offset: 200,
            y_stride: 8,
            c_stride: 8,
            chroma_step: 2,
        };
        assert!(matches!(
            DestinationLayout::classify(&layout),
            Err(CaptureError::UnsupportedLayout(_))
        ));
    }

    #[test]
    fn nv21_interleaves_cr_first() {
        let frame = sample_frame();
        let layout = DestinationLayout::Nv21.layout_for(frame.size());
        let mut out = vec![0u8; layout.required_len(frame.size())];
        convert(&frame.planes(), &layout, &mut out).unwrap();
        assert_eq!(&out[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&out[8..12], &[20, 10, 21, 11]);
    }

    #[test]
    fn yv12_puts_cr_plane_first() {
        let frame = sample_frame();
        let layout = DestinationLayout::Yv12.layout_for(frame.size());
        let mut out = vec![0u8; layout.required_len(frame.size())];
        convert(&frame.planes(), &layout, &mut out).unwrap();
        assert_eq!(out[0], 1);
        assert_eq!(&out[layout.cr_offset..layout.cr_offset + 2], &[20, 21]);
        assert_eq!(&out[layout.cb_offset..layout.cb_offset + 2], &[10, 11]);
    }

    #[test]
    fn short_buffer_is_rejected() {
        let frame = sample_frame();
        let layout = DestinationLayout::Nv12.layout_for(frame.size());
        let mut out = vec![0u8; 4];
        assert!(convert(&frame.planes(), &layout, &mut out).is_err());
    }
}
