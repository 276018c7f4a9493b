//! JPEG encoding into client blob buffers

use std::io::{self, Write};

use image::codecs::jpeg::JpegEncoder;

use super::scratch::YuvPlanes;
use crate::capture::frame::Size;
use crate::{CaptureError, Result};

/// Thumbnail has to fit in the APP1 segment next to the EXIF tags
pub const MAX_THUMBNAIL_CODE_SIZE: usize = 64 * 1024;

/// `{ u16 id; u32 size }` with C alignment
pub const BLOB_TRAILER_LEN: usize = 8;
pub const JPEG_BLOB_ID: u16 = 0x00FF;

const MIN_JPEG_BUFFER_SIZE: usize = 256 * 1024 + BLOB_TRAILER_LEN;

/// Output space handed to an encoder. Writes past the end fail with
/// `WriteZero` instead of growing.
pub struct EncodeSink<'a> {
    buf: &'a mut [u8],
    written: usize,
}

impl<'a> EncodeSink<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, written: 0 }
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Ends the encode and returns its exact size
    pub fn finalize(self) -> usize {
        self.written
    }
}

impl Write for EncodeSink<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let room = self.buf.len() - self.written;
        if room == 0 && !data.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("encoded output exceeds {} bytes", self.buf.len()),
            ));
        }
        let n = room.min(data.len());
        self.buf[self.written..self.written + n].copy_from_slice(&data[..n]);
        self.written += n;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Compresses planar I420 images
pub trait ImageEncoder: Send {
    /// Encodes `image` at `quality` into `sink`. A given `app1` segment is
    /// placed right after SOI. Returns the encoded size.
    fn encode(
        &mut self,
        image: &YuvPlanes<'_>,
        quality: u8,
        app1: Option<&[u8]>,
        sink: &mut EncodeSink<'_>,
    ) -> Result<usize>;
}

/// Baseline JFIF encoder backed by the `image` crate
#[derive(Default)]
pub struct JfifEncoder {
    rgb: Vec<u8>,
    staging: Vec<u8>,
}

impl ImageEncoder for JfifEncoder {
    fn encode(
        &mut self,
        image: &YuvPlanes<'_>,
        quality: u8,
        app1: Option<&[u8]>,
        sink: &mut EncodeSink<'_>,
    ) -> Result<usize> {
        i420_to_rgb(image, &mut self.rgb);
        self.staging.clear();
        JpegEncoder::new_with_quality(&mut self.staging, quality.clamp(1, 100))
            .encode(
                &self.rgb,
                image.size.width,
                image.size.height,
                image::ExtendedColorType::Rgb8,
            )
            .map_err(|e| CaptureError::Encode(e.to_string()))?;

        splice_app1(&self.staging, app1, sink).map_err(|e| CaptureError::Encode(e.to_string()))?;
        Ok(sink.written())
    }
}

/// Copies `jpeg` into `sink` with `app1` after SOI. The encoder's own APP0
/// header is dropped in that case so APP1 stays the first segment.
fn splice_app1(jpeg: &[u8], app1: Option<&[u8]>, sink: &mut EncodeSink<'_>) -> io::Result<()> {
    if jpeg.len() < 4 || jpeg[..2] != [0xFF, 0xD8] {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "missing SOI marker"));
    }
    sink.write_all(&jpeg[..2])?;

    let mut rest = &jpeg[2..];
    if let Some(segment) = app1 {
        sink.write_all(segment)?;
        if rest.len() >= 4 && rest[..2] == [0xFF, 0xE0] {
            let len = u16::from_be_bytes([rest[2], rest[3]]) as usize;
            rest = &rest[(2 + len).min(rest.len())..];
        }
    }
    sink.write_all(rest)
}

/// Full range BT.601 I420 to packed RGB
fn i420_to_rgb(image: &YuvPlanes<'_>, rgb: &mut Vec<u8>) {
    let (w, h) = (image.size.width as usize, image.size.height as usize);
    rgb.clear();
    rgb.reserve(w * h * 3);
    for row in 0..h {
        let ys = image.y_row(row);
        let us = image.u_row(row / 2);
        let vs = image.v_row(row / 2);
        for (x, &y) in ys.iter().enumerate() {
            let y = y as i32;
            let u = us[x / 2] as i32 - 128;
            let v = vs[x / 2] as i32 - 128;
            let r = y + ((359 * v + 128) >> 8);
            let g = y - ((88 * u + 183 * v + 128) >> 8);
            let b = y + ((454 * u + 128) >> 8);
            rgb.extend_from_slice(&[
                r.clamp(0, 255) as u8,
                g.clamp(0, 255) as u8,
                b.clamp(0, 255) as u8,
            ]);
        }
    }
}

/// Blob buffer size for a JPEG of `size`, scaled by area between the
/// minimum and `max_size` (which applies at `max_resolution`)
pub fn jpeg_buffer_size(size: Size, max_resolution: Size, max_size: u32) -> Result<usize> {
    if max_resolution.is_empty() {
        return Err(CaptureError::InvalidArgument(
            "no JPEG capable resolution".into(),
        ));
    }
    let max_size = max_size as usize;
    if max_size <= MIN_JPEG_BUFFER_SIZE {
        return Err(CaptureError::InvalidArgument(format!(
            "maximum JPEG size {max_size} is below {MIN_JPEG_BUFFER_SIZE}"
        )));
    }
    let scale = size.area() as f32 / max_resolution.area() as f32;
    let sized = (scale * (max_size - MIN_JPEG_BUFFER_SIZE) as f32) as usize + MIN_JPEG_BUFFER_SIZE;
    Ok(sized.min(max_size))
}

/// Writes the `{id, size}` trailer into the last bytes of a blob buffer
pub fn write_blob_trailer(buf: &mut [u8], jpeg_size: usize) -> Result<()> {
    if buf.len() < BLOB_TRAILER_LEN {
        return Err(CaptureError::InvalidArgument(format!(
            "blob buffer of {} bytes",
            buf.len()
        )));
    }
    let at = buf.len() - BLOB_TRAILER_LEN;
    let trailer = &mut buf[at..];
    trailer[..2].copy_from_slice(&JPEG_BLOB_ID.to_le_bytes());
    trailer[2..4].fill(0);
    trailer[4..].copy_from_slice(&(jpeg_size as u32).to_le_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::scratch::ScratchFrame;

    fn grey(size: Size) -> ScratchFrame {
        let mut frame = ScratchFrame::new(size);
        let planes = frame.planes_mut();
        planes.y.fill(128);
        planes.u.fill(128);
        planes.v.fill(128);
        frame
    }

    #[test]
    fn sink_refuses_to_grow() {
        let mut buf = [0u8; 4];
        let mut sink = EncodeSink::new(&mut buf);
        assert!(sink.write_all(&[1, 2, 3, 4, 5]).is_err());
        assert_eq!(sink.written(), 4);
    }

    #[test]
    fn encodes_decodable_jpeg_with_app1_first() {
        let frame = grey(Size::new(32, 24));
        let app1 = [0xFF, 0xE1, 0x00, 0x08, b'E', b'x', b'i', b'f', 0, 0];
        let mut out = vec![0u8; 64 * 1024];
        let mut sink = EncodeSink::new(&mut out);
        let size = JfifEncoder::default()
            .encode(&frame.planes(), 90, Some(&app1), &mut sink)
            .unwrap();
        assert_eq!(sink.finalize(), size);

        assert_eq!(&out[..2], &[0xFF, 0xD8]);
        assert_eq!(&out[2..12], &app1);
        let mut decoder = jpeg_decoder::Decoder::new(&out[..size]);
        let pixels = decoder.decode().unwrap();
        let info = decoder.info().unwrap();
        assert_eq!((info.width, info.height), (32, 24));
        assert!(pixels.iter().all(|&p| (p as i32 - 128).abs() <= 4));
    }

    #[test]
    fn small_sink_is_an_encode_error() {
        let frame = grey(Size::new(64, 64));
        let mut out = vec![0u8; 32];
        let mut sink = EncodeSink::new(&mut out);
        let err = JfifEncoder::default()
            .encode(&frame.planes(), 90, None, &mut sink)
            .unwrap_err();
        assert!(matches!(err, CaptureError::Encode(_)));
    }

    #[test]
    fn buffer_size_scales_with_area() {
        let max = Size::new(1920, 1080);
        let full = jpeg_buffer_size(max, max, 3 << 20).unwrap();
        assert_eq!(full, 3 << 20);
        let small = jpeg_buffer_size(Size::new(320, 240), max, 3 << 20).unwrap();
        assert!(small > MIN_JPEG_BUFFER_SIZE && small < full);
        assert!(jpeg_buffer_size(max, max, 1024).is_err());
    }

    #[test]
    fn trailer_lands_at_the_end() {
        let mut buf = vec![0u8; 32];
        write_blob_trailer(&mut buf, 0x1234).unwrap();
        assert_eq!(&buf[24..], &[0xFF, 0x00, 0, 0, 0x34, 0x12, 0, 0]);
    }
}
