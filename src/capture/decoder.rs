//! Device frame decode into the primary I420 scratch frame

use std::time::Instant;

use tracing::instrument;
use zune_jpeg::JpegDecoder;

use super::frame::PixelFormat;
use crate::pipeline::scratch::{ScratchFrame, YuvPlanesMut};
use crate::{CaptureError, Result};

/// Decodes one device frame into `frame`, which must already have the
/// negotiated size.
#[instrument(skip(data, frame), fields(len = data.len()))]
pub fn decode_frame(data: &[u8], format: PixelFormat, frame: &mut ScratchFrame) -> Result<()> {
    let start = Instant::now();
    match format {
        PixelFormat::Mjpeg => decode_mjpeg(data, frame)?,
        PixelFormat::Yuyv => unpack_yuyv(data, frame)?,
    }
    metrics::histogram!("extcam_decode_time_us").record(start.elapsed().as_micros() as f64);
    Ok(())
}

fn decode_mjpeg(data: &[u8], frame: &mut ScratchFrame) -> Result<()> {
    let mut decoder = JpegDecoder::new(data);
    let pixels = decoder
        .decode()
        .map_err(|e| CaptureError::Decode(format!("{e:?}")))?;
    let (w, h) = decoder
        .dimensions()
        .ok_or_else(|| CaptureError::Decode("missing frame header".into()))?;

    let size = frame.size();
    if (w, h) != (size.width as usize, size.height as usize) {
        return Err(CaptureError::Decode(format!(
            "decoded {w}x{h}, stream is {size}"
        )));
    }
    let channels = pixels.len() / (w * h).max(1);
    if channels == 0 || pixels.len() != w * h * channels {
        return Err(CaptureError::Decode(format!(
            "{} bytes for a {w}x{h} image",
            pixels.len()
        )));
    }

    rgb_to_i420(&pixels, channels, &mut frame.planes_mut());
    Ok(())
}

/// JFIF (full range BT.601) RGB to I420, chroma averaged over 2x2 blocks
fn rgb_to_i420(pixels: &[u8], channels: usize, out: &mut YuvPlanesMut<'_>) {
    let (w, h) = (out.size.width as usize, out.size.height as usize);
    let rgb = |x: usize, y: usize| -> (i32, i32, i32) {
        let p = (y * w + x) * channels;
        if channels < 3 {
            let l = pixels[p] as i32;
            (l, l, l)
        } else {
            (pixels[p] as i32, pixels[p + 1] as i32, pixels[p + 2] as i32)
        }
    };

    for y in 0..h {
        for x in 0..w {
            let (r, g, b) = rgb(x, y);
            out.y[y * out.y_stride + x] = ((77 * r + 150 * g + 29 * b + 128) >> 8) as u8;
        }
    }

    let (cw, ch) = out.chroma_size();
    for cy in 0..ch {
        for cx in 0..cw {
            let (mut r, mut g, mut b, mut n) = (0, 0, 0, 0);
            for (x, y) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                let (px, py) = (cx * 2 + x, cy * 2 + y);
                if px < w && py < h {
                    let (pr, pg, pb) = rgb(px, py);
                    r += pr;
                    g += pg;
                    b += pb;
                    n += 1;
                }
            }
            let (r, g, b) = (r / n, g / n, b / n);
            let u = ((-43 * r - 85 * g + 128 * b + 128) >> 8) + 128;
            let v = ((128 * r - 107 * g - 21 * b + 128) >> 8) + 128;
            out.u[cy * out.c_stride + cx] = u.clamp(0, 255) as u8;
            out.v[cy * out.c_stride + cx] = v.clamp(0, 255) as u8;
        }
    }
}

/// Packed YUYV 4:2:2 to I420, averaging chroma of row pairs
fn unpack_yuyv(data: &[u8], frame: &mut ScratchFrame) -> Result<()> {
    let size = frame.size();
    let (w, h) = (size.width as usize, size.height as usize);
    let row_bytes = w * 2;
    if data.len() < row_bytes * h {
        return Err(CaptureError::Decode(format!(
            "YUYV frame of {} bytes, {size} needs {}",
            data.len(),
            row_bytes * h
        )));
    }

    let out = frame.planes_mut();
    for y in 0..h {
        let row = &data[y * row_bytes..(y + 1) * row_bytes];
        for x in 0..w {
            out.y[y * out.y_stride + x] = row[x * 2];
        }
    }

    let (cw, ch) = out.chroma_size();
    for cy in 0..ch {
        let top = cy * 2;
        let bottom = (top + 1).min(h - 1);
        for cx in 0..cw {
            let pair = (cx * 4).min(row_bytes - 4);
            let avg = |offset: usize| {
                let a = data[top * row_bytes + pair + offset] as u16;
                let b = data[bottom * row_bytes + pair + offset] as u16;
                ((a + b + 1) / 2) as u8
            };
            out.u[cy * out.c_stride + cx] = avg(1);
            out.v[cy * out.c_stride + cx] = avg(3);
        }
    }
    Ok(())
}
