//! Request queue and the worker thread that turns device frames into results

use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Local;
use tracing::{debug, error, info, instrument, warn};

use super::buffers::{Fence, GraphicBuffer};
use super::request::{
    AeState, AfState, AfTrigger, AwbState, BufferStatus, ErrorCode, NotifyMsg, RequestSettings,
    ResultMetadata, ResultRecord, ResultSink, StreamBufferResult, StreamShape,
};
use crate::capture::buffer_queue::{BufferQueue, DeviceBuffer};
use crate::pipeline::scratch::Rect;
use crate::pipeline::stats::PipelineStats;
use crate::pipeline::transform::{ActiveConfig, SharedConfig, TransformPipeline};
use crate::{lock, CaptureError, PipelineConfig, Result};

const PIPELINE_DEPTH: u8 = 4;

/// A request accepted by the session, with its buffers already imported
pub(crate) struct PendingRequest {
    pub frame_number: u32,
    pub settings: Arc<RequestSettings>,
    pub outputs: Vec<PendingOutput>,
    pub submitted: Instant,
}

pub(crate) struct PendingOutput {
    pub stream: StreamShape,
    pub buffer_id: u64,
    pub buffer: GraphicBuffer,
    pub acquire_fence: Option<Fence>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    /// Polling for work
    Waiting,
    Processing,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Idle => "idle",
            WorkerState::Waiting => "waiting",
            WorkerState::Processing => "processing",
        };
        f.write_str(name)
    }
}

/// Frame numbers submitted but not yet answered
#[derive(Default)]
pub(crate) struct Inflight {
    frames: Mutex<BTreeSet<u32>>,
}

impl Inflight {
    pub fn insert(&self, frame_number: u32) -> bool {
        lock(&self.frames).insert(frame_number)
    }

    pub fn remove(&self, frame_number: u32) {
        lock(&self.frames).remove(&frame_number);
    }

    pub fn len(&self) -> usize {
        lock(&self.frames).len()
    }

    pub fn frames(&self) -> Vec<u32> {
        lock(&self.frames).iter().copied().collect()
    }
}

#[derive(Debug, Clone, Copy)]
struct OutputOutcome {
    ok: bool,
}

/// Delivers notifications and results to the client sink.
///
/// Every request leaves through exactly one of `success` or `fail`.
pub(crate) struct Publisher {
    sink: Arc<dyn ResultSink>,
    pub inflight: Inflight,
    stats: Arc<PipelineStats>,
    af_locked: AtomicBool,
    closed: AtomicBool,
}

impl Publisher {
    pub fn new(sink: Arc<dyn ResultSink>, stats: Arc<PipelineStats>) -> Self {
        Self {
            sink,
            inflight: Inflight::default(),
            stats,
            af_locked: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Set once the device is gone; the session refuses new work after that
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn device_error(&self, frame_number: u32) {
        self.sink.notify(NotifyMsg::Error {
            frame_number,
            stream_id: None,
            code: ErrorCode::Device,
        });
    }

    fn af_state(&self, trigger: AfTrigger) -> AfState {
        match trigger {
            AfTrigger::Start => self.af_locked.store(true, Ordering::Release),
            AfTrigger::Cancel => self.af_locked.store(false, Ordering::Release),
            AfTrigger::Idle => {}
        }
        if self.af_locked.load(Ordering::Acquire) {
            AfState::FocusedLocked
        } else {
            AfState::Inactive
        }
    }

    fn success(
        &self,
        request: PendingRequest,
        outcomes: &[OutputOutcome],
        timestamp: Duration,
        crop_region: Rect,
    ) {
        let frame_number = request.frame_number;
        self.sink.notify(NotifyMsg::Shutter {
            frame_number,
            timestamp,
        });

        let mut buffers = Vec::with_capacity(request.outputs.len());
        for (output, outcome) in request.outputs.iter().zip(outcomes) {
            self.stats.record_output(outcome.ok);
            if !outcome.ok {
                self.sink.notify(NotifyMsg::Error {
                    frame_number,
                    stream_id: Some(output.stream.id),
                    code: ErrorCode::Buffer,
                });
            }
            buffers.push(StreamBufferResult {
                stream_id: output.stream.id,
                buffer_id: output.buffer_id,
                status: if outcome.ok {
                    BufferStatus::Ok
                } else {
                    BufferStatus::Error
                },
                release_fence: if outcome.ok {
                    None
                } else {
                    output.acquire_fence.clone()
                },
            });
        }

        let metadata = ResultMetadata {
            sensor_timestamp: timestamp,
            ae_state: AeState::Converged,
            awb_state: AwbState::Converged,
            af_state: self.af_state(request.settings.af_trigger),
            pipeline_depth: PIPELINE_DEPTH,
            flash_available: false,
            crop_region,
            settings: (*request.settings).clone(),
        };
        let record = ResultRecord {
            frame_number,
            buffers,
            metadata: Some(metadata),
            error: None,
        };
        self.finish(record, request.submitted);
    }

    /// Answers `request` with every buffer in error
    pub fn fail(&self, request: PendingRequest, reason: &CaptureError) {
        let frame_number = request.frame_number;
        debug!("Frame {} failed: {}", frame_number, reason);
        self.sink.notify(NotifyMsg::Error {
            frame_number,
            stream_id: None,
            code: ErrorCode::Request,
        });
        let buffers = request
            .outputs
            .iter()
            .map(|output| StreamBufferResult {
                stream_id: output.stream.id,
                buffer_id: output.buffer_id,
                status: BufferStatus::Error,
                release_fence: output.acquire_fence.clone(),
            })
            .collect();
        let record = ResultRecord {
            frame_number,
            buffers,
            metadata: None,
            error: Some(reason.to_string()),
        };
        self.finish(record, request.submitted);
    }

    fn finish(&self, record: ResultRecord, submitted: Instant) {
        self.inflight.remove(record.frame_number);
        self.stats.record_request(record.is_ok());
        metrics::histogram!("extcam_request_latency_ms")
            .record(submitted.elapsed().as_secs_f64() * 1000.0);
        self.sink.process_result(record);
    }
}

struct QueueInner {
    pending: VecDeque<PendingRequest>,
    /// Cancel flag of the request being processed
    processing: Option<Arc<AtomicBool>>,
    state: WorkerState,
    exit: bool,
}

enum Next {
    Request(PendingRequest, Arc<AtomicBool>),
    Idle,
    Exit,
}

/// FIFO between the session and the worker
pub(crate) struct RequestQueue {
    inner: Mutex<QueueInner>,
    new_work: Condvar,
    done: Condvar,
    poll: Duration,
    poll_ticks: u32,
}

impl RequestQueue {
    fn new(config: &PipelineConfig) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                pending: VecDeque::new(),
                processing: None,
                state: WorkerState::Idle,
                exit: false,
            }),
            new_work: Condvar::new(),
            done: Condvar::new(),
            poll: config.request_poll(),
            poll_ticks: config.request_poll_ticks.max(1),
        }
    }

    fn push(&self, request: PendingRequest) {
        lock(&self.inner).pending.push_back(request);
        self.new_work.notify_one();
    }

    /// Waits in short ticks for the next request
    fn next(&self) -> Next {
        let mut inner = lock(&self.inner);
        let mut ticks = 0;
        loop {
            if inner.exit {
                inner.state = WorkerState::Idle;
                return Next::Exit;
            }
            if let Some(request) = inner.pending.pop_front() {
                let cancel = Arc::new(AtomicBool::new(false));
                inner.processing = Some(cancel.clone());
                inner.state = WorkerState::Processing;
                return Next::Request(request, cancel);
            }
            if ticks >= self.poll_ticks {
                inner.state = WorkerState::Idle;
                return Next::Idle;
            }
            inner.state = WorkerState::Waiting;
            inner = self
                .new_work
                .wait_timeout(inner, self.poll)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
            ticks += 1;
        }
    }

    fn finish(&self) {
        let mut inner = lock(&self.inner);
        inner.processing = None;
        inner.state = WorkerState::Idle;
        drop(inner);
        self.done.notify_all();
    }

    fn take_pending(&self) -> VecDeque<PendingRequest> {
        mem::take(&mut lock(&self.inner).pending)
    }

    fn state(&self) -> (WorkerState, usize) {
        let inner = lock(&self.inner);
        (inner.state, inner.pending.len())
    }
}

/// State owned by the worker thread
struct WorkerLoop {
    queue: Arc<RequestQueue>,
    buffers: Arc<BufferQueue>,
    active: SharedConfig,
    publisher: Arc<Publisher>,
    pipeline: TransformPipeline,
    stats: Arc<PipelineStats>,
    fence_timeout: Duration,
}

impl WorkerLoop {
    fn run(mut self, cpu: Option<usize>) {
        if let Some(id) = cpu {
            if core_affinity::set_for_current(core_affinity::CoreId { id }) {
                debug!("Worker pinned to core {}", id);
            } else {
                warn!("Failed to pin worker to core {}", id);
            }
        }
        info!("Worker started");

        loop {
            match self.queue.next() {
                Next::Exit => break,
                Next::Idle => continue,
                Next::Request(request, cancel) => {
                    self.process(request, &cancel);
                    self.queue.finish();
                }
            }
        }

        let leftover = self.queue.take_pending();
        if !leftover.is_empty() {
            info!("Worker exiting with {} pending requests", leftover.len());
            self.stats.record_flushed(leftover.len() as u64);
        }
        for request in leftover {
            self.publisher.fail(request, &CaptureError::Closed);
        }
        info!("Worker stopped");
    }

    #[instrument(skip_all, fields(frame = request.frame_number))]
    fn process(&mut self, request: PendingRequest, cancel: &AtomicBool) {
        let Some(config) = self.active.load_full() else {
            self.publisher.fail(request, &CaptureError::NotConfigured);
            return;
        };
        self.pipeline.prepare(&config);

        let frame = match self.buffers.acquire(cancel) {
            Ok(frame) => frame,
            Err(e) if e.is_fatal() => {
                self.disconnected(request, &e);
                return;
            }
            Err(e) => {
                warn!("No frame for request {}: {}", request.frame_number, e);
                self.publisher.fail(request, &e);
                return;
            }
        };

        let timestamp = frame.timestamp();
        let outcome = self.transform(&request, &frame, &config);
        self.pipeline.finish_request();
        if let Err(e) = self.buffers.release(frame) {
            if e.is_fatal() {
                self.disconnected(request, &e);
                return;
            }
            warn!("Returning slot to the driver: {}", e);
        }

        match outcome {
            Ok(_) if cancel.load(Ordering::Acquire) => {
                self.publisher.fail(request, &CaptureError::Cancelled)
            }
            Ok((outcomes, crop_region)) => {
                self.publisher
                    .success(request, &outcomes, timestamp, crop_region)
            }
            Err(e) => {
                if matches!(e, CaptureError::Decode(_)) {
                    self.stats.record_decode_failure();
                }
                warn!("Request {} failed: {}", request.frame_number, e);
                self.publisher.fail(request, &e);
            }
        }
    }

    /// Decodes `frame` once and fills every output of `request`.
    /// A failing output does not stop its siblings.
    fn transform(
        &mut self,
        request: &PendingRequest,
        frame: &DeviceBuffer,
        config: &ActiveConfig,
    ) -> Result<(Vec<OutputOutcome>, Rect)> {
        let pipeline = &mut self.pipeline;
        self.buffers
            .with_frame(frame, |data| pipeline.decode(data, config.fourcc()))??;
        self.stats.record_frame();

        let capture_time = Local::now().naive_local();
        let mut outcomes = Vec::with_capacity(request.outputs.len());
        for output in &request.outputs {
            let produced = match &output.acquire_fence {
                Some(fence) => fence.acquire(self.fence_timeout),
                None => Ok(()),
            }
            .and_then(|()| {
                self.pipeline.produce(
                    config,
                    &output.stream,
                    &output.buffer,
                    &request.settings,
                    capture_time,
                )
            });
            if let Err(e) = &produced {
                warn!(
                    "Stream {} of frame {}: {}",
                    output.stream.id, request.frame_number, e
                );
            }
            outcomes.push(OutputOutcome {
                ok: produced.is_ok(),
            });
        }

        // Reported region is the one of the largest output
        let largest = request
            .outputs
            .iter()
            .map(|o| o.stream.size)
            .max_by_key(|s| s.area())
            .unwrap_or_else(|| config.device_format.size());
        let crop_region = self
            .pipeline
            .crop_region(config.crop_axis, largest)
            .unwrap_or_else(|_| Rect::full(config.device_format.size()));
        Ok((outcomes, crop_region))
    }

    fn disconnected(&mut self, request: PendingRequest, reason: &CaptureError) {
        error!("Capture device lost: {}", reason);
        self.publisher.mark_closed();
        self.publisher.device_error(request.frame_number);
        self.publisher.fail(request, reason);
        let pending = self.queue.take_pending();
        self.stats.record_flushed(pending.len() as u64);
        for request in pending {
            self.publisher.fail(request, reason);
        }
    }
}

/// Handle to the worker thread
pub(crate) struct Worker {
    queue: Arc<RequestQueue>,
    buffers: Arc<BufferQueue>,
    publisher: Arc<Publisher>,
    stats: Arc<PipelineStats>,
    handle: Mutex<Option<JoinHandle<()>>>,
    flush_timeout: Duration,
}

impl Worker {
    pub fn spawn(
        buffers: Arc<BufferQueue>,
        active: SharedConfig,
        publisher: Arc<Publisher>,
        pipeline: TransformPipeline,
        stats: Arc<PipelineStats>,
        config: &PipelineConfig,
    ) -> Result<Self> {
        let queue = Arc::new(RequestQueue::new(config));
        let worker = WorkerLoop {
            queue: queue.clone(),
            buffers: buffers.clone(),
            active,
            publisher: publisher.clone(),
            pipeline,
            stats: stats.clone(),
            fence_timeout: config.fence_timeout(),
        };
        let cpu = config.worker_cpu;
        let handle = thread::Builder::new()
            .name("extcam-worker".into())
            .spawn(move || worker.run(cpu))?;

        Ok(Self {
            queue,
            buffers,
            publisher,
            stats,
            handle: Mutex::new(Some(handle)),
            flush_timeout: config.flush_timeout(),
        })
    }

    pub fn submit(&self, request: PendingRequest) {
        self.queue.push(request);
    }

    /// Cancels the request in progress and answers every queued one with
    /// an error, in submission order, after the in-progress one has been
    /// answered. Fails with `FlushTimeout` if the worker did not finish in
    /// time; queued requests are answered either way.
    pub fn flush(&self) -> Result<()> {
        let deadline = Instant::now() + self.flush_timeout;
        let (swapped, finished) = {
            let mut inner = lock(&self.queue.inner);
            let swapped = mem::take(&mut inner.pending);
            if let Some(cancel) = &inner.processing {
                cancel.store(true, Ordering::Release);
                self.buffers.interrupt();
            }
            let mut finished = true;
            while inner.processing.is_some() {
                let now = Instant::now();
                if now >= deadline {
                    finished = false;
                    break;
                }
                inner = self
                    .queue
                    .done
                    .wait_timeout(inner, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
            (swapped, finished)
        };

        if !swapped.is_empty() {
            info!("Flushing {} pending requests", swapped.len());
            self.stats.record_flushed(swapped.len() as u64);
        }
        for request in swapped {
            self.publisher.fail(request, &CaptureError::Cancelled);
        }
        if finished {
            Ok(())
        } else {
            warn!("Worker still busy after {:?}", self.flush_timeout);
            Err(CaptureError::FlushTimeout(self.flush_timeout))
        }
    }

    /// Stops the thread; requests still queued are answered with errors
    pub fn shutdown(&self) {
        lock(&self.queue.inner).exit = true;
        self.queue.new_work.notify_all();
        let Some(handle) = lock(&self.handle).take() else {
            return;
        };
        if handle.join().is_err() {
            error!("Worker thread panicked");
            for request in self.queue.take_pending() {
                self.publisher.fail(request, &CaptureError::Closed);
            }
        }
    }

    pub fn state(&self) -> (WorkerState, usize) {
        self.queue.state()
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::request::{ChannelSink, RequestTemplate, SessionEvent};

    fn request(frame_number: u32) -> PendingRequest {
        PendingRequest {
            frame_number,
            settings: Arc::new(RequestSettings::for_template(RequestTemplate::Preview, 30).unwrap()),
            outputs: Vec::new(),
            submitted: Instant::now(),
        }
    }

    #[test]
    fn queue_polls_in_ticks_then_idles() {
        let config = PipelineConfig {
            request_poll_ms: 1,
            request_poll_ticks: 3,
            ..PipelineConfig::default()
        };
        let queue = RequestQueue::new(&config);
        assert!(matches!(queue.next(), Next::Idle));

        queue.push(request(1));
        queue.push(request(2));
        match queue.next() {
            Next::Request(r, _) => assert_eq!(r.frame_number, 1),
            _ => panic!("expected a request"),
        }
        assert_eq!(queue.state(), (WorkerState::Processing, 1));
        queue.finish();
        lock(&queue.inner).exit = true;
        assert!(matches!(queue.next(), Next::Exit));
        assert_eq!(queue.take_pending().len(), 1);
    }

    #[test]
    fn af_trigger_latches_until_cancelled() {
        let (sink, _rx) = ChannelSink::unbounded();
        let publisher = Publisher::new(Arc::new(sink), Arc::new(PipelineStats::new()));
        assert_eq!(publisher.af_state(AfTrigger::Idle), AfState::Inactive);
        assert_eq!(publisher.af_state(AfTrigger::Start), AfState::FocusedLocked);
        assert_eq!(publisher.af_state(AfTrigger::Idle), AfState::FocusedLocked);
        assert_eq!(publisher.af_state(AfTrigger::Cancel), AfState::Inactive);
    }

    #[test]
    fn failure_notifies_before_result() {
        let (sink, rx) = ChannelSink::unbounded();
        let publisher = Publisher::new(Arc::new(sink), Arc::new(PipelineStats::new()));
        publisher.inflight.insert(9);
        publisher.fail(request(9), &CaptureError::Cancelled);

        assert_eq!(publisher.inflight.len(), 0);
        match rx.try_recv().unwrap() {
            SessionEvent::Notify(NotifyMsg::Error { frame_number, code, .. }) => {
                assert_eq!(frame_number, 9);
                assert_eq!(code, ErrorCode::Request);
            }
            other => panic!("unexpected {other:?}"),
        }
        match rx.try_recv().unwrap() {
            SessionEvent::Result(r) => {
                assert!(!r.is_ok());
                assert!(r.metadata.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
