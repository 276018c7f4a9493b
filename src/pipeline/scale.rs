//! Area-averaging (box filter) scaler for I420 planes

use super::scratch::{YuvPlanes, YuvPlanesMut};

/// Source span `[start, end)` averaged into each destination sample
fn spans(src_len: usize, dst_len: usize) -> Vec<(usize, usize)> {
    (0..dst_len)
        .map(|d| {
            let start = d * src_len / dst_len;
            let end = ((d + 1) * src_len / dst_len).max(start + 1).min(src_len);
            (start, end)
        })
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn scale_plane(
    src: &[u8],
    src_stride: usize,
    (sw, sh): (usize, usize),
    dst: &mut [u8],
    dst_stride: usize,
    (dw, dh): (usize, usize),
) {
    let cols = spans(sw, dw);
    let rows = spans(sh, dh);
    for (dy, &(y0, y1)) in rows.iter().enumerate() {
        let out = &mut dst[dy * dst_stride..dy * dst_stride + dw];
        for (px, &(x0, x1)) in out.iter_mut().zip(cols.iter()) {
            let mut sum = 0u32;
            for y in y0..y1 {
                let row = &src[y * src_stride..];
                sum += row[x0..x1].iter().map(|&v| v as u32).sum::<u32>();
            }
            let n = ((y1 - y0) * (x1 - x0)) as u32;
            *px = ((sum + n / 2) / n) as u8;
        }
    }
}

/// Scales every plane of `src` to the size of `dst`
pub fn scale_into(src: &YuvPlanes<'_>, dst: &mut YuvPlanesMut<'_>) {
    let src_luma = (src.size.width as usize, src.size.height as usize);
    let dst_luma = (dst.size.width as usize, dst.size.height as usize);
    scale_plane(src.y, src.y_stride, src_luma, dst.y, dst.y_stride, dst_luma);

    let src_chroma = src.chroma_size();
    let dst_chroma = dst.chroma_size();
    scale_plane(src.u, src.c_stride, src_chroma, dst.u, dst.c_stride, dst_chroma);
    scale_plane(src.v, src.c_stride, src_chroma, dst.v, dst.c_stride, dst_chroma);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::Size;
    use crate::pipeline::scratch::{Rect, ScratchFrame};

    #[test]
    fn halving_averages_blocks() {
        let mut src = ScratchFrame::new(Size::new(4, 2));
        src.planes_mut().y.copy_from_slice(&[0, 10, 20, 30, 40, 50, 60, 70]);
        let mut dst = ScratchFrame::new(Size::new(2, 1));
        scale_into(&src.planes(), &mut dst.planes_mut());
        // (0+10+40+50)/4 = 25, (20+30+60+70)/4 = 45
        assert_eq!(dst.planes().y, &[25, 45]);
    }

    #[test]
    fn upscaling_replicates_samples() {
        let mut src = ScratchFrame::new(Size::new(2, 2));
        src.planes_mut().y.copy_from_slice(&[1, 2, 3, 4]);
        let mut dst = ScratchFrame::new(Size::new(4, 4));
        scale_into(&src.planes(), &mut dst.planes_mut());
        assert_eq!(&dst.planes().y[..4], &[1, 1, 2, 2]);
        assert_eq!(&dst.planes().y[12..], &[3, 3, 4, 4]);
    }

    #[test]
    fn scales_from_a_cropped_view() {
        let mut src = ScratchFrame::new(Size::new(8, 4));
        for (i, px) in src.planes_mut().y.iter_mut().enumerate() {
            *px = if i % 8 >= 2 && i % 8 < 6 { 200 } else { 0 };
        }
        let view = src
            .crop(Rect {
                left: 2,
                top: 0,
                width: 4,
                height: 4,
            })
            .unwrap();
        let mut dst = ScratchFrame::new(Size::new(2, 2));
        scale_into(&view, &mut dst.planes_mut());
        assert!(dst.planes().y.iter().all(|&v| v == 200));
    }
}
