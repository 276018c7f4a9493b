//! Per-request frame transform: decode once, then crop, scale and encode
//! into every requested output buffer.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::NaiveDateTime;
use tracing::{debug, instrument};

use super::convert::{convert, DestinationLayout};
use super::crop::{crop_rect, thumbnail_rect, CropAxis};
use super::exif::{CaptureParams, MetadataEncoder};
use super::jpeg::{
    jpeg_buffer_size, write_blob_trailer, EncodeSink, ImageEncoder, BLOB_TRAILER_LEN,
    MAX_THUMBNAIL_CODE_SIZE,
};
use super::scale::scale_into;
use super::scratch::{Rect, ScratchFrame, YuvPlanes};
use crate::capture::decoder::decode_frame;
use crate::capture::frame::{DeviceFormat, PixelFormat, Size};
use crate::session::buffers::{BufferKind, GraphicBuffer};
use crate::session::request::{RequestSettings, StreamShape};
use crate::{CaptureError, Result};

/// Everything the worker needs to know about the current stream
/// configuration. Replaced as a whole on every configure.
#[derive(Debug, Clone)]
pub struct ActiveConfig {
    pub generation: u64,
    pub device_format: DeviceFormat,
    pub crop_axis: CropAxis,
    /// Keyed by stream id, formats already overridden
    pub streams: HashMap<i32, StreamShape>,
    pub max_thumbnail: Size,
    /// Catalog resolution the JPEG size budget applies to
    pub max_jpeg_resolution: Size,
    pub jpeg_max_size: u32,
    pub make: String,
    pub model: String,
}

impl ActiveConfig {
    pub fn fourcc(&self) -> PixelFormat {
        self.device_format.fourcc
    }

    /// Client byte count for a blob buffer of `size`
    pub fn blob_size(&self, size: Size) -> Result<usize> {
        jpeg_buffer_size(size, self.max_jpeg_resolution, self.jpeg_max_size)
    }
}

pub struct TransformPipeline {
    generation: u64,
    frame: ScratchFrame,
    thumbnail: ScratchFrame,
    /// One per distinct output size that differs from the device size
    intermediate: HashMap<Size, ScratchFrame>,
    /// Sizes already scaled for the current request
    scaled: HashSet<Size>,
    encoder: Box<dyn ImageEncoder>,
    metadata: Box<dyn MetadataEncoder>,
    thumbnail_code: Vec<u8>,
}

impl TransformPipeline {
    pub fn new(encoder: Box<dyn ImageEncoder>, metadata: Box<dyn MetadataEncoder>) -> Self {
        Self {
            generation: 0,
            frame: ScratchFrame::new(Size::default()),
            thumbnail: ScratchFrame::new(Size::default()),
            intermediate: HashMap::new(),
            scaled: HashSet::new(),
            encoder,
            metadata,
            thumbnail_code: Vec::new(),
        }
    }

    /// Reallocates scratch frames after a configuration change
    pub fn prepare(&mut self, config: &ActiveConfig) {
        if config.generation == self.generation {
            return;
        }
        let device = config.device_format.size();
        if self.frame.size() != device {
            self.frame = ScratchFrame::new(device);
        }
        if self.thumbnail.size() != config.max_thumbnail {
            self.thumbnail = ScratchFrame::new(config.max_thumbnail);
        }

        let wanted: HashSet<Size> = config
            .streams
            .values()
            .map(|s| s.size)
            .filter(|&size| size != device)
            .collect();
        self.intermediate.retain(|size, _| wanted.contains(size));
        for size in wanted {
            self.intermediate
                .entry(size)
                .or_insert_with(|| ScratchFrame::new(size));
        }
        self.scaled.clear();
        self.generation = config.generation;
        debug!(
            "Scratch frames for {} with {} intermediate sizes",
            device,
            self.intermediate.len()
        );
    }

    pub fn decode(&mut self, data: &[u8], format: PixelFormat) -> Result<()> {
        decode_frame(data, format, &mut self.frame)
    }

    /// Crop region of the device frame used for `size`
    pub fn crop_region(&self, axis: CropAxis, size: Size) -> Result<Rect> {
        crop_rect(axis, self.frame.size(), size)
    }

    /// Fills `buffer` for `stream` from the decoded frame
    #[instrument(skip_all, fields(stream = stream.id, size = %stream.size))]
    pub fn produce(
        &mut self,
        config: &ActiveConfig,
        stream: &StreamShape,
        buffer: &GraphicBuffer,
        settings: &RequestSettings,
        capture_time: NaiveDateTime,
    ) -> Result<()> {
        match buffer.kind() {
            BufferKind::Blob if stream.format.is_blob() => {
                self.produce_jpeg(config, stream.size, buffer, settings, capture_time)
            }
            BufferKind::Ycbcr(layout) if !stream.format.is_blob() => {
                if buffer.size() != stream.size {
                    return Err(CaptureError::InvalidArgument(format!(
                        "buffer of {} on a {} stream",
                        buffer.size(),
                        stream.size
                    )));
                }
                DestinationLayout::classify(&layout)?;
                let view = crop_and_scale(
                    &self.frame,
                    &mut self.intermediate,
                    &mut self.scaled,
                    config.crop_axis,
                    stream.size,
                )?;
                convert(&view, &layout, &mut buffer.lock())?;
                Ok(())
            }
            kind => Err(CaptureError::UnsupportedLayout(format!(
                "{kind:?} buffer on a {:?} stream",
                stream.format
            ))),
        }
    }

    /// Ends the current request; scaled intermediates are stale after this
    pub fn finish_request(&mut self) {
        self.scaled.clear();
    }

    fn produce_jpeg(
        &mut self,
        config: &ActiveConfig,
        size: Size,
        buffer: &GraphicBuffer,
        settings: &RequestSettings,
        capture_time: NaiveDateTime,
    ) -> Result<()> {
        let thumbnail_len = if settings.thumbnail_size.is_empty() {
            None
        } else {
            Some(self.encode_thumbnail(config, settings)?)
        };

        let params = CaptureParams {
            image_size: size,
            capture_time,
            make: config.make.clone(),
            model: config.model.clone(),
            orientation: settings.jpeg_orientation,
            exposure_time: settings.exposure_time,
            f_number: settings.aperture,
            focal_length: settings.focal_length,
            iso: settings.sensitivity,
            gps: settings.gps.clone(),
        };
        let thumbnail = thumbnail_len.map(|len| &self.thumbnail_code[..len]);
        let app1 = self.metadata.encode(&params, thumbnail)?;

        let main = crop_and_scale(
            &self.frame,
            &mut self.intermediate,
            &mut self.scaled,
            config.crop_axis,
            size,
        )?;

        let max_code = config.blob_size(size)?;
        let mut data = buffer.lock();
        if data.len() < max_code {
            return Err(CaptureError::InvalidArgument(format!(
                "blob buffer of {} bytes, {size} needs {max_code}",
                data.len()
            )));
        }
        let region = &mut data[..max_code];
        let mut sink = EncodeSink::new(&mut region[..max_code - BLOB_TRAILER_LEN]);
        let written = self
            .encoder
            .encode(&main, settings.jpeg_quality, Some(&app1), &mut sink)?;
        write_blob_trailer(region, written)?;
        debug!("JPEG {} of {} bytes", size, written);
        Ok(())
    }

    /// Encodes the thumbnail into `thumbnail_code` and returns its length
    fn encode_thumbnail(&mut self, config: &ActiveConfig, settings: &RequestSettings) -> Result<usize> {
        let target = settings.thumbnail_size;
        let rect = thumbnail_rect(self.frame.size(), target, config.max_thumbnail.area())?;
        let view = self.frame.crop(rect)?;
        self.thumbnail.reshape(target);
        scale_into(&view, &mut self.thumbnail.planes_mut());

        self.thumbnail_code.resize(MAX_THUMBNAIL_CODE_SIZE, 0);
        let mut sink = EncodeSink::new(&mut self.thumbnail_code);
        let written = self.encoder.encode(
            &self.thumbnail.planes(),
            settings.thumbnail_quality,
            None,
            &mut sink,
        )?;
        Ok(written)
    }
}

/// Device frame adapted to `target`: a crop view when sizes match after
/// cropping, otherwise the intermediate frame for `target`, scaled at most
/// once per request.
fn crop_and_scale<'a>(
    frame: &'a ScratchFrame,
    intermediate: &'a mut HashMap<Size, ScratchFrame>,
    scaled: &mut HashSet<Size>,
    axis: CropAxis,
    target: Size,
) -> Result<YuvPlanes<'a>> {
    let rect = crop_rect(axis, frame.size(), target)?;
    let view = frame.crop(rect)?;
    if view.size == target {
        return Ok(view);
    }

    let out = intermediate.get_mut(&target).ok_or_else(|| {
        CaptureError::InvalidArgument(format!("{target} is not a configured output size"))
    })?;
    if scaled.insert(target) {
        scale_into(&view, &mut out.planes_mut());
    }
    Ok(out.planes())
}

/// Shared handle to the configuration the worker reads per request
pub type SharedConfig = Arc<arc_swap::ArcSwapOption<ActiveConfig>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::convert::YcbcrLayout;
    use crate::pipeline::exif::ExifWriter;
    use crate::pipeline::jpeg::{JfifEncoder, JPEG_BLOB_ID};
    use crate::session::request::{RequestTemplate, StreamFormat};

    fn active(device: Size, streams: &[StreamShape]) -> ActiveConfig {
        ActiveConfig {
            generation: 1,
            device_format: DeviceFormat::new(device.width, device.height, PixelFormat::Yuyv, &[30]),
            crop_axis: CropAxis::Vertical,
            streams: streams.iter().map(|s| (s.id, s.clone())).collect(),
            max_thumbnail: Size::new(240, 180),
            max_jpeg_resolution: device,
            jpeg_max_size: 1 << 20,
            make: "Test".into(),
            model: "Cam".into(),
        }
    }

    fn yuyv_grey(size: Size) -> Vec<u8> {
        [128u8, 128].repeat(size.area() as usize)
    }

    fn pipeline() -> TransformPipeline {
        TransformPipeline::new(Box::new(JfifEncoder::default()), Box::new(ExifWriter))
    }

    fn now() -> NaiveDateTime {
        chrono::DateTime::from_timestamp(1_700_000_000, 0)
            .unwrap()
            .naive_utc()
    }

    #[test]
    fn yuv_output_is_cropped_scaled_and_converted() {
        let device = Size::new(640, 480);
        let stream = StreamShape::output(1, 320, 180, StreamFormat::Ycbcr420);
        let config = active(device, &[stream.clone()]);
        let mut pipeline = pipeline();
        pipeline.prepare(&config);
        pipeline.decode(&yuyv_grey(device), PixelFormat::Yuyv).unwrap();

        let buffer = GraphicBuffer::yuv(stream.size, DestinationLayout::Nv21);
        let settings = RequestSettings::for_template(RequestTemplate::Preview, 30).unwrap();
        pipeline
            .produce(&config, &stream, &buffer, &settings, now())
            .unwrap();
        pipeline.finish_request();

        let data = buffer.to_vec();
        assert!(data.iter().all(|&b| (b as i32 - 128).abs() <= 1));
        let region = pipeline.crop_region(config.crop_axis, stream.size).unwrap();
        assert_eq!((region.width, region.height), (640, 360));
        assert_eq!(region.top, 60);
    }

    #[test]
    fn blob_output_carries_trailer_and_exif() {
        let device = Size::new(320, 240);
        let stream = StreamShape::output(2, 320, 240, StreamFormat::Blob);
        let config = active(device, &[stream.clone()]);
        let mut pipeline = pipeline();
        pipeline.prepare(&config);
        pipeline.decode(&yuyv_grey(device), PixelFormat::Yuyv).unwrap();

        let len = config.blob_size(device).unwrap();
        let buffer = GraphicBuffer::blob(len);
        let settings = RequestSettings::for_template(RequestTemplate::StillCapture, 30).unwrap();
        pipeline
            .produce(&config, &stream, &buffer, &settings, now())
            .unwrap();

        let data = buffer.to_vec();
        let trailer = &data[len - BLOB_TRAILER_LEN..];
        assert_eq!(u16::from_le_bytes([trailer[0], trailer[1]]), JPEG_BLOB_ID);
        let size = u32::from_le_bytes(trailer[4..].try_into().unwrap()) as usize;
        assert_eq!(&data[..4], &[0xFF, 0xD8, 0xFF, 0xE1]);
        assert_eq!(&data[size - 2..size], &[0xFF, 0xD9]);

        let mut decoder = jpeg_decoder::Decoder::new(&data[..size]);
        decoder.decode().unwrap();
        let info = decoder.info().unwrap();
        assert_eq!((info.width, info.height), (320, 240));
    }

    #[test]
    fn unknown_layout_is_rejected() {
        let device = Size::new(64, 48);
        let stream = StreamShape::output(1, 64, 48, StreamFormat::Ycbcr420);
        let config = active(device, &[stream.clone()]);
        let mut pipeline = pipeline();
        pipeline.prepare(&config);
        pipeline.decode(&yuyv_grey(device), PixelFormat::Yuyv).unwrap();

        let odd = YcbcrLayout {
            y_offset: 0,
            cb_offset: 64 * 48,
            cr_offset: 64 * 48 + 5,
            y_stride: 64,
            c_stride: 32,
            chroma_step: 3,
        };
        let buffer = GraphicBuffer::with_layout(stream.size, odd, 64 * 48 * 3);
        let settings = RequestSettings::for_template(RequestTemplate::Preview, 30).unwrap();
        let err = pipeline
            .produce(&config, &stream, &buffer, &settings, now())
            .unwrap_err();
        assert!(matches!(err, CaptureError::UnsupportedLayout(_)));
    }

    #[test]
    fn intermediates_follow_configuration() {
        let device = Size::new(640, 480);
        let mut config = active(
            device,
            &[
                StreamShape::output(1, 320, 240, StreamFormat::Ycbcr420),
                StreamShape::output(2, 640, 480, StreamFormat::Blob),
            ],
        );
        let mut pipeline = pipeline();
        pipeline.prepare(&config);
        assert_eq!(pipeline.intermediate.len(), 1);

        config.generation = 2;
        config.streams = [(3, StreamShape::output(3, 160, 120, StreamFormat::Ycbcr420))]
            .into_iter()
            .collect();
        pipeline.prepare(&config);
        assert!(pipeline.intermediate.contains_key(&Size::new(160, 120)));
        assert!(!pipeline.intermediate.contains_key(&Size::new(320, 240)));
    }
}
