//! Capture session: stream configuration, request submission, flush and close

pub mod buffers;
pub mod request;
mod worker;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use arc_swap::ArcSwapOption;
use tracing::{debug, info, instrument, warn};

use self::buffers::{BufferCache, BufferImporter, BufferKind};
use self::request::{
    BufferUsage, CaptureRequest, HalStream, RequestSettings, RequestTemplate, StreamFormat,
    StreamShape,
};
use self::worker::{PendingOutput, PendingRequest, Publisher, Worker};
use crate::capture::buffer_queue::{BufferCounts, BufferQueue, StreamPlan};
use crate::capture::device::CaptureDevice;
use crate::negotiate::StreamNegotiator;
use crate::pipeline::crop::CropAxis;
use crate::pipeline::exif::{ExifWriter, MetadataEncoder};
use crate::pipeline::jpeg::{jpeg_buffer_size, ImageEncoder, JfifEncoder};
use crate::pipeline::stats::{PipelineStats, StatsSnapshot};
use crate::pipeline::transform::{ActiveConfig, SharedConfig, TransformPipeline};
use crate::{lock, CaptureError, Config, Result, Size};

pub use self::worker::WorkerState;

struct SessionState {
    closed: bool,
    streams: HashMap<i32, StreamShape>,
    cache: BufferCache,
    /// Settings of the last accepted request
    last_settings: Option<Arc<RequestSettings>>,
    generation: u64,
}

/// One open camera. All methods take `&self` and may be called from any
/// thread; results arrive on the sink from the worker thread.
pub struct CaptureSession {
    state: Mutex<SessionState>,
    buffers: Arc<BufferQueue>,
    active: SharedConfig,
    publisher: Arc<Publisher>,
    worker: Worker,
    importer: Arc<dyn BufferImporter>,
    negotiator: StreamNegotiator,
    stats: Arc<PipelineStats>,
    config: Config,
}

impl CaptureSession {
    pub fn new(
        device: Box<dyn CaptureDevice>,
        importer: Arc<dyn BufferImporter>,
        sink: Arc<dyn request::ResultSink>,
        config: Config,
    ) -> Result<Self> {
        Self::with_encoders(
            device,
            importer,
            sink,
            config,
            Box::new(JfifEncoder::default()),
            Box::new(ExifWriter),
        )
    }

    /// Like [`CaptureSession::new`] with caller supplied JPEG and EXIF encoders
    pub fn with_encoders(
        device: Box<dyn CaptureDevice>,
        importer: Arc<dyn BufferImporter>,
        sink: Arc<dyn request::ResultSink>,
        config: Config,
        encoder: Box<dyn ImageEncoder>,
        metadata: Box<dyn MetadataEncoder>,
    ) -> Result<Self> {
        let buffers = Arc::new(BufferQueue::new(device, config.capture.clone()));
        let catalog = buffers.formats()?;
        if catalog.is_empty() {
            return Err(CaptureError::DeviceConfig(
                "device reports no usable formats".into(),
            ));
        }
        let negotiator =
            StreamNegotiator::new(catalog, config.capture.clone(), config.pipeline.clone());

        let stats = Arc::new(PipelineStats::new());
        let publisher = Arc::new(Publisher::new(sink, stats.clone()));
        let active: SharedConfig = Arc::new(ArcSwapOption::empty());
        let worker = Worker::spawn(
            buffers.clone(),
            active.clone(),
            publisher.clone(),
            TransformPipeline::new(encoder, metadata),
            stats.clone(),
            &config.pipeline,
        )?;

        info!(
            "Session opened with {} formats",
            negotiator.catalog().len()
        );
        Ok(Self {
            state: Mutex::new(SessionState {
                closed: false,
                streams: HashMap::new(),
                cache: BufferCache::new(importer.clone()),
                last_settings: None,
                generation: 0,
            }),
            buffers,
            active,
            publisher,
            worker,
            importer,
            negotiator,
            stats,
            config,
        })
    }

    /// Replaces the stream set. Rejected with `Busy` while any request is
    /// in flight; the previous configuration is then left untouched.
    #[instrument(skip_all, fields(streams = streams.len()))]
    pub fn configure(&self, streams: &[StreamShape]) -> Result<Vec<HalStream>> {
        let mut state = lock(&self.state);
        self.ensure_open(&state)?;
        self.negotiator.validate(streams)?;
        let inflight = self.publisher.inflight.len();
        if inflight > 0 {
            return Err(CaptureError::Busy(inflight));
        }

        let format = self.negotiator.negotiate(streams)?;
        let rate = self.negotiator.frame_rate(&format, 0)?;
        let buffer_count = self.negotiator.buffer_count(rate);
        let plan = StreamPlan {
            format: format.clone(),
            rate,
            buffer_count,
        };
        if let Err(e) = self.buffers.configure(plan) {
            self.active.store(None);
            return Err(e);
        }

        let resolved: HashMap<i32, StreamShape> = streams
            .iter()
            .map(|s| {
                let mut shape = s.clone();
                shape.format = override_format(s);
                (s.id, shape)
            })
            .collect();
        let removed: Vec<i32> = state
            .streams
            .keys()
            .filter(|id| !resolved.contains_key(id))
            .copied()
            .collect();
        for id in removed {
            state.cache.drop_stream(id);
        }
        state.streams = resolved.clone();
        state.last_settings = None;
        state.generation += 1;

        self.active.store(Some(Arc::new(ActiveConfig {
            generation: state.generation,
            device_format: format.clone(),
            crop_axis: self.negotiator.crop_axis(),
            streams: resolved,
            max_thumbnail: self.config.jpeg.max_thumbnail(),
            max_jpeg_resolution: self.negotiator.max_resolution(),
            jpeg_max_size: self.config.jpeg.max_size,
            make: self.config.jpeg.make.clone(),
            model: self.config.jpeg.model.clone(),
        })));

        info!("Configured {} streams on {} at {}", streams.len(), format, rate);
        Ok(streams
            .iter()
            .map(|s| HalStream {
                id: s.id,
                override_format: override_format(s),
                producer_usage: s.usage | BufferUsage::CPU_WRITE_OFTEN | BufferUsage::CAMERA_OUTPUT,
                consumer_usage: BufferUsage::default(),
                max_buffers: buffer_count,
            })
            .collect())
    }

    /// Validates `request` and queues it for the worker. Exactly one
    /// result is published for every accepted request.
    #[instrument(skip_all, fields(frame = request.frame_number))]
    pub fn submit(&self, request: CaptureRequest) -> Result<()> {
        let mut state = lock(&self.state);
        self.ensure_open(&state)?;
        if state.streams.is_empty() || !self.buffers.is_streaming() {
            return Err(CaptureError::NotConfigured);
        }
        if request.outputs.is_empty() {
            return Err(CaptureError::InvalidArgument(format!(
                "frame {} has no output buffers",
                request.frame_number
            )));
        }
        let settings = match request.settings {
            Some(settings) => Arc::new(settings),
            None => state.last_settings.clone().ok_or_else(|| {
                CaptureError::InvalidArgument(
                    "first request after configure must carry settings".into(),
                )
            })?,
        };

        let mut outputs = Vec::with_capacity(request.outputs.len());
        for output in &request.outputs {
            let stream = state
                .streams
                .get(&output.stream_id)
                .cloned()
                .ok_or_else(|| {
                    CaptureError::InvalidArgument(format!(
                        "stream {} is not configured",
                        output.stream_id
                    ))
                })?;
            let buffer =
                state
                    .cache
                    .resolve(output.stream_id, output.buffer_id, output.handle.as_ref())?;
            let fits = match buffer.kind() {
                BufferKind::Blob if stream.format.is_blob() => {
                    let needed = self.blob_buffer_size(stream.size)?;
                    if buffer.len() < needed {
                        return Err(CaptureError::InvalidArgument(format!(
                            "blob buffer {} holds {} bytes, stream {} needs {needed}",
                            output.buffer_id,
                            buffer.len(),
                            stream.id
                        )));
                    }
                    true
                }
                BufferKind::Blob => false,
                BufferKind::Ycbcr(_) => !stream.format.is_blob() && buffer.size() == stream.size,
            };
            if !fits {
                return Err(CaptureError::InvalidArgument(format!(
                    "buffer {} does not match stream {}",
                    output.buffer_id, stream.id
                )));
            }
            let acquire_fence = output
                .acquire_fence
                .as_ref()
                .map(|fence| self.importer.import_fence(fence))
                .transpose()?;
            outputs.push(PendingOutput {
                stream,
                buffer_id: output.buffer_id,
                buffer,
                acquire_fence,
            });
        }

        let generation = state.generation;
        let mut state = self.apply_frame_rate(state, &settings)?;
        self.ensure_open(&state)?;
        if state.generation != generation {
            return Err(CaptureError::InvalidArgument(format!(
                "streams were reconfigured while frame {} waited for a frame rate change",
                request.frame_number
            )));
        }

        if !self.publisher.inflight.insert(request.frame_number) {
            return Err(CaptureError::InvalidArgument(format!(
                "frame {} is already in flight",
                request.frame_number
            )));
        }
        state.last_settings = Some(settings.clone());
        self.worker.submit(PendingRequest {
            frame_number: request.frame_number,
            settings,
            outputs,
            submitted: Instant::now(),
        });
        debug!("Queued frame {}", request.frame_number);
        Ok(())
    }

    /// Retunes the device when the requested maximum fps moved. The
    /// session lock is released while the buffer pool drains, so callers
    /// must re-check anything they read from `state` before.
    fn apply_frame_rate<'a>(
        &'a self,
        state: std::sync::MutexGuard<'a, SessionState>,
        settings: &RequestSettings,
    ) -> Result<std::sync::MutexGuard<'a, SessionState>> {
        let Some(plan) = self.buffers.plan() else {
            return Err(CaptureError::NotConfigured);
        };
        let requested = settings.ae_target_fps_range.1;
        if requested == 0 || (plan.rate.fps() - requested as f64).abs() < 1.0 {
            return Ok(state);
        }
        let rate = self.negotiator.frame_rate(&plan.format, requested)?;
        if rate == plan.rate {
            return Ok(state);
        }

        info!("Retuning {} from {} to {}", plan.format, plan.rate, rate);
        let next = StreamPlan {
            format: plan.format,
            rate,
            buffer_count: self.negotiator.buffer_count(rate),
        };
        let (state, result) = self.buffers.retune(&self.state, state, next);
        result?;
        Ok(state)
    }

    /// Answers every pending request with an error. Safe to call
    /// concurrently with `submit`.
    pub fn flush(&self) -> Result<()> {
        let state = lock(&self.state);
        if state.closed {
            return Ok(());
        }
        let flushed = self.worker.flush();
        drop(state);
        flushed
    }

    /// Flushes, stops the worker and the device and frees imported
    /// buffers. Idempotent. If the flush times out the session stays open
    /// and the call can be retried.
    pub fn close(&self) -> Result<()> {
        let mut state = lock(&self.state);
        if state.closed {
            return Ok(());
        }
        self.worker.flush()?;
        state.closed = true;
        self.worker.shutdown();
        if let Err(e) = self.buffers.drain_and_stop() {
            warn!("Stopping capture on close: {}", e);
        }
        state.cache.clear();
        state.streams.clear();
        self.active.store(None);
        info!("Session closed");
        Ok(())
    }

    /// Forgets imported buffers the client no longer uses
    pub fn remove_buffer_caches(&self, entries: &[(i32, u64)]) {
        let mut state = lock(&self.state);
        for &(stream_id, buffer_id) in entries {
            state.cache.remove(stream_id, buffer_id);
        }
    }

    pub fn default_settings(&self, template: RequestTemplate) -> Result<RequestSettings> {
        let mut settings = RequestSettings::for_template(template, self.negotiator.default_fps())?;
        settings.jpeg_quality = self.config.jpeg.default_quality;
        settings.thumbnail_quality = self.config.jpeg.default_quality;
        Ok(settings)
    }

    /// Bytes a blob buffer for a JPEG stream of `size` must have. The
    /// size trailer sits in the last bytes of that range.
    pub fn blob_buffer_size(&self, size: Size) -> Result<usize> {
        jpeg_buffer_size(size, self.negotiator.max_resolution(), self.config.jpeg.max_size)
    }

    pub fn crop_axis(&self) -> CropAxis {
        self.negotiator.crop_axis()
    }

    pub fn counts(&self) -> BufferCounts {
        self.buffers.counts()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed || self.publisher.is_closed()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = lock(&self.state);
        let (worker, pending) = self.worker.state();
        let mut streams: Vec<StreamShape> = state.streams.values().cloned().collect();
        streams.sort_by_key(|s| s.id);
        SessionSnapshot {
            closed: state.closed || self.publisher.is_closed(),
            plan: self.buffers.plan(),
            counts: self.buffers.counts(),
            inflight: self.publisher.inflight.frames(),
            worker,
            pending,
            cached_buffers: state.cache.len(),
            streams,
            stats: self.stats.snapshot(),
        }
    }

    fn ensure_open(&self, state: &SessionState) -> Result<()> {
        if state.closed {
            return Err(CaptureError::Closed);
        }
        if self.publisher.is_closed() {
            return Err(CaptureError::Disconnected("device was lost".into()));
        }
        Ok(())
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Closing session on drop: {}", e);
        }
    }
}

/// Client format after resolving implementation-defined streams
fn override_format(stream: &StreamShape) -> StreamFormat {
    match stream.format {
        StreamFormat::ImplementationDefined if stream.usage.contains(BufferUsage::VIDEO_ENCODER) => {
            StreamFormat::Ycbcr420
        }
        StreamFormat::ImplementationDefined => StreamFormat::Yv12,
        other => other,
    }
}

/// Point-in-time view of a session for diagnostics
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub closed: bool,
    pub plan: Option<StreamPlan>,
    pub counts: BufferCounts,
    pub inflight: Vec<u32>,
    pub worker: WorkerState,
    pub pending: usize,
    pub cached_buffers: usize,
    pub streams: Vec<StreamShape>,
    pub stats: StatsSnapshot,
}

impl fmt::Display for SessionSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "session: {}", if self.closed { "closed" } else { "open" })?;
        match &self.plan {
            Some(plan) => writeln!(
                f,
                "  device: {} at {}, {} buffers",
                plan.format, plan.rate, plan.buffer_count
            )?,
            None => writeln!(f, "  device: not streaming")?,
        }
        writeln!(
            f,
            "  buffers: {} dequeued, {} queued of {}",
            self.counts.dequeued, self.counts.queued, self.counts.total
        )?;
        writeln!(
            f,
            "  worker: {}, {} pending, in flight {:?}",
            self.worker, self.pending, self.inflight
        )?;
        for stream in &self.streams {
            writeln!(
                f,
                "  stream {}: {} {:?}",
                stream.id, stream.size, stream.format
            )?;
        }
        writeln!(f, "  imported buffers: {}", self.cached_buffers)?;
        write!(
            f,
            "  requests: {} ok, {} failed, {} flushed; {} frames decoded",
            self.stats.requests_ok,
            self.stats.requests_failed,
            self.stats.flushed,
            self.stats.frames_processed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn implementation_defined_resolves_by_usage() {
        let mut stream = StreamShape::output(1, 640, 480, StreamFormat::ImplementationDefined);
        assert_eq!(override_format(&stream), StreamFormat::Yv12);
        stream.usage = BufferUsage::VIDEO_ENCODER;
        assert_eq!(override_format(&stream), StreamFormat::Ycbcr420);
        stream.format = StreamFormat::Blob;
        assert_eq!(override_format(&stream), StreamFormat::Blob);
    }
}
