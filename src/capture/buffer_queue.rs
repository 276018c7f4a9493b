//! Fixed pool of device buffers with backpressure
//!
//! The queue owns the capture device. Every slot is either queued to the
//! driver or held by the worker, so `dequeued + queued == total` always.
//! The queued side is what the device reports, not derived from the rest.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use super::device::{CaptureDevice, DequeuedBuffer};
use super::frame::{DeviceFormat, FrameRate};
use crate::{lock, CaptureConfig, CaptureError, Result};

/// A slot held by the worker. Not `Clone`: it goes back through
/// [`BufferQueue::release`] exactly once.
#[derive(Debug)]
pub struct DeviceBuffer {
    index: u32,
    bytes_used: u32,
    timestamp: Duration,
    generation: u64,
}

impl DeviceBuffer {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn bytes_used(&self) -> u32 {
        self.bytes_used
    }

    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferCounts {
    pub total: u32,
    pub dequeued: u32,
    pub queued: u32,
}

/// What the device streams: format, interval and pool size
#[derive(Debug, Clone, PartialEq)]
pub struct StreamPlan {
    pub format: DeviceFormat,
    pub rate: FrameRate,
    pub buffer_count: u32,
}

struct QueueState {
    device: Box<dyn CaptureDevice>,
    plan: Option<StreamPlan>,
    streaming: bool,
    total: u32,
    dequeued: u32,
    max_frame_bytes: u32,
    generation: u64,
    /// Held while a retune waits for the pool to drain
    paused: bool,
}

pub struct BufferQueue {
    state: Mutex<QueueState>,
    returned: Condvar,
    config: CaptureConfig,
}

impl BufferQueue {
    pub fn new(device: Box<dyn CaptureDevice>, config: CaptureConfig) -> Self {
        Self {
            state: Mutex::new(QueueState {
                device,
                plan: None,
                streaming: false,
                total: 0,
                dequeued: 0,
                max_frame_bytes: 0,
                generation: 0,
                paused: false,
            }),
            returned: Condvar::new(),
            config,
        }
    }

    pub fn formats(&self) -> Result<Vec<DeviceFormat>> {
        lock(&self.state).device.formats()
    }

    /// Restarts streaming with `plan`. The queue is left stopped on failure.
    #[instrument(skip(self, plan), fields(format = %plan.format, rate = %plan.rate))]
    pub fn configure(&self, plan: StreamPlan) -> Result<u32> {
        let mut state = lock(&self.state);
        if state.dequeued != 0 {
            return Err(CaptureError::Busy(state.dequeued as usize));
        }
        self.restart_locked(&mut state, plan)
    }

    /// Blocks until a filled slot is available.
    ///
    /// Waits while every slot is held by the caller side, then polls the
    /// device in short slices so `cancel` and concurrent control calls are
    /// served between polls. Bounded by the configured buffer wait.
    pub fn acquire(&self, cancel: &AtomicBool) -> Result<DeviceBuffer> {
        let timeout = self.config.buffer_wait();
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        loop {
            if cancel.load(Ordering::Acquire) {
                return Err(CaptureError::Cancelled);
            }
            if !state.streaming {
                return Err(CaptureError::NotConfigured);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(CaptureError::AcquireTimeout(timeout));
            }
            let remaining = deadline - now;

            if state.paused || state.dequeued >= state.total {
                state = self
                    .returned
                    .wait_timeout(state, remaining.min(self.config.dequeue_slice()))
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
                continue;
            }

            match state.device.dequeue(remaining.min(self.config.dequeue_slice()))? {
                Some(filled) => return self.accept_locked(&mut state, filled),
                None => {
                    drop(state);
                    state = lock(&self.state);
                }
            }
        }
    }

    fn accept_locked(&self, state: &mut QueueState, filled: DequeuedBuffer) -> Result<DeviceBuffer> {
        if filled.index >= state.total {
            return Err(CaptureError::DeviceConfig(format!(
                "driver returned slot {} of {}",
                filled.index, state.total
            )));
        }
        if filled.bytes_used > state.max_frame_bytes {
            state.device.enqueue(filled.index)?;
            return Err(CaptureError::Decode(format!(
                "frame of {} bytes exceeds driver maximum {}",
                filled.bytes_used, state.max_frame_bytes
            )));
        }

        state.dequeued += 1;
        metrics::gauge!("extcam_dequeued_buffers").set(state.dequeued as f64);
        Ok(DeviceBuffer {
            index: filled.index,
            bytes_used: filled.bytes_used,
            timestamp: filled.timestamp,
            generation: state.generation,
        })
    }

    /// Runs `read` over the filled part of `buffer`, borrowed straight from
    /// the driver mapping. The queue lock is held meanwhile, so keep it short.
    pub fn with_frame<R>(
        &self,
        buffer: &DeviceBuffer,
        read: impl FnOnce(&[u8]) -> R,
    ) -> Result<R> {
        let state = lock(&self.state);
        if buffer.generation != state.generation {
            return Err(CaptureError::InvalidArgument(format!(
                "slot {} belongs to a previous stream",
                buffer.index
            )));
        }
        let data = state.device.map(buffer.index, buffer.bytes_used as usize)?;
        Ok(read(data))
    }

    /// Hands `buffer` back to the driver and wakes one waiter
    pub fn release(&self, buffer: DeviceBuffer) -> Result<()> {
        let mut state = lock(&self.state);
        if buffer.generation != state.generation {
            warn!("Dropping slot {} from a previous stream", buffer.index);
            return Ok(());
        }
        let requeued = if state.streaming {
            state.device.enqueue(buffer.index)
        } else {
            Ok(())
        };
        // The count drops even if the driver refused the slot, or drain would never finish
        state.dequeued = state.dequeued.saturating_sub(1);
        metrics::gauge!("extcam_dequeued_buffers").set(state.dequeued as f64);
        drop(state);

        self.returned.notify_one();
        requeued
    }

    /// Stops streaming and frees every slot. `Busy` while the worker holds any.
    pub fn drain_and_stop(&self) -> Result<()> {
        let mut state = lock(&self.state);
        if state.dequeued != 0 {
            return Err(CaptureError::Busy(state.dequeued as usize));
        }
        Self::stop_locked(&mut state)?;
        info!("Capture stream stopped");
        Ok(())
    }

    /// Applies a new frame rate while the caller holds `outer`.
    ///
    /// `outer` is released for the whole operation and reacquired before
    /// returning, so the worker and other control calls that need it keep
    /// running while this waits for held slots to come back. Acquire is
    /// paused meanwhile so the wait cannot be starved. When the format and
    /// pool size are unchanged only the interval is reprogrammed; otherwise
    /// the pool is sized again.
    pub fn retune<'a, T>(
        &self,
        outer: &'a Mutex<T>,
        guard: MutexGuard<'a, T>,
        plan: StreamPlan,
    ) -> (MutexGuard<'a, T>, Result<()>) {
        drop(guard);
        let result = self.retune_unlocked(plan);
        (lock(outer), result)
    }

    fn retune_unlocked(&self, plan: StreamPlan) -> Result<()> {
        let timeout = self.config.buffer_wait();
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        state.paused = true;
        while state.dequeued > 0 {
            let now = Instant::now();
            if now >= deadline {
                let held = state.dequeued as usize;
                state.paused = false;
                drop(state);
                self.returned.notify_all();
                return Err(CaptureError::Busy(held));
            }
            state = self
                .returned
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        let same_pool = state.plan.as_ref().is_some_and(|current| {
            current.format == plan.format && current.buffer_count == plan.buffer_count
        });
        let result = if same_pool && state.streaming {
            self.set_rate_locked(&mut state, plan.rate)
        } else {
            self.restart_locked(&mut state, plan).map(|_| ())
        };
        state.paused = false;
        drop(state);
        self.returned.notify_all();
        result
    }

    /// Wakes a blocked acquire so it re-checks its cancel flag
    pub fn interrupt(&self) {
        self.returned.notify_all();
    }

    pub fn counts(&self) -> BufferCounts {
        let state = lock(&self.state);
        BufferCounts {
            total: state.total,
            dequeued: state.dequeued,
            queued: state.device.queued(),
        }
    }

    pub fn plan(&self) -> Option<StreamPlan> {
        lock(&self.state).plan.clone()
    }

    pub fn is_streaming(&self) -> bool {
        lock(&self.state).streaming
    }

    fn restart_locked(&self, state: &mut QueueState, plan: StreamPlan) -> Result<u32> {
        Self::stop_locked(state)?;
        match self.start_locked(state, &plan) {
            Ok(max) => {
                info!(
                    "Streaming {} at {} with {} buffers (max frame {} bytes)",
                    plan.format, plan.rate, plan.buffer_count, max
                );
                state.plan = Some(plan);
                Ok(max)
            }
            Err(e) => {
                warn!("Stream configuration failed: {}", e);
                if let Err(stop) = Self::stop_locked(state) {
                    warn!("Cleanup after failed configuration: {}", stop);
                }
                Err(e)
            }
        }
    }

    fn start_locked(&self, state: &mut QueueState, plan: &StreamPlan) -> Result<u32> {
        let max = state.device.set_format(&plan.format)?;
        let pixels = plan.format.size().area();
        if max == 0 || max as u64 > pixels * 3 {
            return Err(CaptureError::DeviceConfig(format!(
                "driver reports {} bytes per {} frame",
                max, plan.format
            )));
        }
        state.device.set_frame_rate(plan.rate)?;

        let granted = state.device.request_buffers(plan.buffer_count)?;
        state.total = granted;
        if granted != plan.buffer_count {
            return Err(CaptureError::DeviceConfig(format!(
                "requested {} buffers, driver allocated {}",
                plan.buffer_count, granted
            )));
        }
        for index in 0..granted {
            state.device.enqueue(index)?;
        }
        state.device.stream_on()?;
        state.streaming = true;
        state.max_frame_bytes = max;
        state.generation += 1;

        self.swallow_bad_frames(state)?;
        Ok(max)
    }

    fn set_rate_locked(&self, state: &mut QueueState, rate: FrameRate) -> Result<()> {
        let outcome = (|| {
            state.device.stream_off()?;
            state.streaming = false;
            state.device.set_frame_rate(rate)?;
            for index in 0..state.total {
                state.device.enqueue(index)?;
            }
            state.device.stream_on()?;
            state.streaming = true;
            state.generation += 1;
            self.swallow_bad_frames(state)
        })();

        match outcome {
            Ok(()) => {
                if let Some(plan) = state.plan.as_mut() {
                    plan.rate = rate;
                }
                info!("Frame rate retuned to {}", rate);
                Ok(())
            }
            Err(e) => {
                warn!("Frame rate change failed: {}", e);
                if let Err(stop) = Self::stop_locked(state) {
                    warn!("Cleanup after failed retune: {}", stop);
                }
                Err(e)
            }
        }
    }

    /// Drops the first frames after stream on; some webcams send garbage there
    fn swallow_bad_frames(&self, state: &mut QueueState) -> Result<()> {
        for _ in 0..self.config.bad_frames_after_stream_on {
            match state.device.dequeue(self.config.buffer_wait())? {
                Some(frame) => {
                    debug!("Dropping startup frame in slot {}", frame.index);
                    state.device.enqueue(frame.index)?;
                }
                None => {
                    warn!("No startup frame within {:?}", self.config.buffer_wait());
                    break;
                }
            }
        }
        Ok(())
    }

    fn stop_locked(state: &mut QueueState) -> Result<()> {
        if state.streaming {
            state.device.stream_off()?;
            state.streaming = false;
        }
        if state.total > 0 {
            state.device.request_buffers(0)?;
            state.total = 0;
        }
        state.plan = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::capture::frame::PixelFormat;
    use crate::capture::synthetic::{SyntheticDevice, SyntheticProbe};

    fn fast_config() -> CaptureConfig {
        CaptureConfig {
            buffer_wait_ms: 200,
            dequeue_slice_ms: 5,
            ..CaptureConfig::default()
        }
    }

    fn plan(count: u32, fps: u32) -> StreamPlan {
        StreamPlan {
            format: DeviceFormat::new(64, 48, PixelFormat::Mjpeg, &[15, 30]),
            rate: FrameRate::from_fps(fps),
            buffer_count: count,
        }
    }

    fn queue() -> (BufferQueue, Arc<SyntheticProbe>) {
        let device = SyntheticDevice::new(vec![DeviceFormat::new(
            64,
            48,
            PixelFormat::Mjpeg,
            &[15, 30],
        )]);
        let probe = device.probe();
        (BufferQueue::new(Box::new(device), fast_config()), probe)
    }

    fn assert_balanced(queue: &BufferQueue, probe: &SyntheticProbe) {
        let counts = queue.counts();
        assert_eq!(counts.queued, probe.queued());
        assert_eq!(counts.dequeued + probe.queued(), counts.total);
    }

    #[test]
    fn configure_queues_every_slot() {
        let (queue, probe) = queue();
        queue.configure(plan(4, 30)).unwrap();
        assert!(queue.is_streaming());
        assert_eq!(queue.counts().total, 4);
        // One startup frame was dropped and requeued
        assert_eq!(probe.delivered(), 1);
        assert_balanced(&queue, &probe);
    }

    #[test]
    fn short_allocation_leaves_queue_stopped() {
        let (queue, probe) = queue();
        probe.limit_buffers(2);
        let err = queue.configure(plan(4, 30)).unwrap_err();
        assert!(matches!(err, CaptureError::DeviceConfig(_)));
        assert!(!queue.is_streaming());
        assert_eq!(queue.counts().total, 0);
    }

    #[test]
    fn acquire_and_release_keep_counts_balanced() {
        let (queue, probe) = queue();
        queue.configure(plan(2, 30)).unwrap();
        let cancel = AtomicBool::new(false);

        let a = queue.acquire(&cancel).unwrap();
        assert_balanced(&queue, &probe);
        let b = queue.acquire(&cancel).unwrap();
        assert_eq!(queue.counts().dequeued, 2);
        assert_balanced(&queue, &probe);

        queue.release(a).unwrap();
        queue.release(b).unwrap();
        assert_eq!(queue.counts().dequeued, 0);
        assert_balanced(&queue, &probe);
    }

    #[test]
    fn frame_view_covers_the_filled_bytes() {
        let (queue, probe) = queue();
        queue.configure(plan(2, 30)).unwrap();
        probe.push_frame(vec![7u8; 100]);
        let cancel = AtomicBool::new(false);
        let held = queue.acquire(&cancel).unwrap();
        let seen = queue.with_frame(&held, |data| data.to_vec()).unwrap();
        assert_eq!(seen, vec![7u8; 100]);
        queue.release(held).unwrap();
    }

    #[test]
    fn frame_view_rejects_slots_from_an_old_stream() {
        let (queue, _probe) = queue();
        queue.configure(plan(2, 30)).unwrap();
        let cancel = AtomicBool::new(false);
        let held = queue.acquire(&cancel).unwrap();
        let stale = DeviceBuffer {
            generation: held.generation - 1,
            ..held
        };
        assert!(matches!(
            queue.with_frame(&stale, |_| ()),
            Err(CaptureError::InvalidArgument(_))
        ));
        queue.release(held).unwrap();
    }

    #[test]
    fn exhausted_pool_times_out() {
        let (queue, _probe) = queue();
        queue.configure(plan(2, 30)).unwrap();
        let cancel = AtomicBool::new(false);
        let _a = queue.acquire(&cancel).unwrap();
        let _b = queue.acquire(&cancel).unwrap();
        let err = queue.acquire(&cancel).unwrap_err();
        assert!(matches!(err, CaptureError::AcquireTimeout(_)));
    }

    #[test]
    fn blocked_acquire_wakes_on_release() {
        let (queue, _probe) = queue();
        let queue = Arc::new(queue);
        queue.configure(plan(2, 30)).unwrap();
        let cancel = AtomicBool::new(false);
        let a = queue.acquire(&cancel).unwrap();
        let _b = queue.acquire(&cancel).unwrap();

        let releaser = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                queue.release(a).unwrap();
            })
        };
        assert!(queue.acquire(&cancel).is_ok());
        releaser.join().unwrap();
    }

    #[test]
    fn cancel_interrupts_a_starved_device() {
        let (queue, probe) = queue();
        queue.configure(plan(2, 30)).unwrap();
        probe.hold();
        let cancel = AtomicBool::new(true);
        assert!(matches!(
            queue.acquire(&cancel).unwrap_err(),
            CaptureError::Cancelled
        ));
    }

    #[test]
    fn drain_refuses_while_slots_are_held() {
        let (queue, probe) = queue();
        queue.configure(plan(2, 30)).unwrap();
        let cancel = AtomicBool::new(false);
        let held = queue.acquire(&cancel).unwrap();
        assert!(matches!(queue.drain_and_stop(), Err(CaptureError::Busy(1))));
        queue.release(held).unwrap();
        queue.drain_and_stop().unwrap();
        assert_eq!(queue.counts(), BufferCounts::default());
        assert_eq!(probe.queued(), 0);
    }

    #[test]
    fn oversized_frame_is_returned_to_driver() {
        let (queue, probe) = queue();
        queue.configure(plan(2, 30)).unwrap();
        probe.push_frame(vec![0u8; 64 * 48 * 3]);
        let cancel = AtomicBool::new(false);
        assert!(matches!(
            queue.acquire(&cancel).unwrap_err(),
            CaptureError::Decode(_)
        ));
        assert_eq!(queue.counts().dequeued, 0);
        assert_balanced(&queue, &probe);
    }

    #[test]
    fn retune_with_same_pool_only_changes_interval() {
        let (queue, probe) = queue();
        queue.configure(plan(2, 30)).unwrap();
        let outer = Mutex::new(());
        let guard = lock(&outer);
        let (_guard, result) = queue.retune(&outer, guard, plan(2, 15));
        result.unwrap();
        assert_eq!(probe.buffer_requests(), vec![2]);
        assert_eq!(probe.rates().last(), Some(&FrameRate::from_fps(15)));
        assert_eq!(queue.plan().unwrap().rate, FrameRate::from_fps(15));
        assert_balanced(&queue, &probe);
    }

    #[test]
    fn retune_with_new_count_resizes_pool() {
        let (queue, probe) = queue();
        queue.configure(plan(4, 30)).unwrap();
        let outer = Mutex::new(());
        let guard = lock(&outer);
        let (_guard, result) = queue.retune(&outer, guard, plan(2, 15));
        result.unwrap();
        assert_eq!(probe.buffer_requests(), vec![4, 2]);
        assert_eq!(queue.counts().total, 2);
    }

    #[test]
    fn retune_releases_outer_lock_while_waiting() {
        let (queue, _probe) = queue();
        let queue = Arc::new(queue);
        queue.configure(plan(2, 30)).unwrap();
        let cancel = AtomicBool::new(false);
        let held = queue.acquire(&cancel).unwrap();

        let outer = Arc::new(Mutex::new(0u32));
        let helper = {
            let queue = Arc::clone(&queue);
            let outer = Arc::clone(&outer);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                // Would deadlock if retune kept the outer lock
                *lock(&outer) += 1;
                queue.release(held).unwrap();
            })
        };

        let guard = lock(&outer);
        let (guard, result) = queue.retune(&outer, guard, plan(2, 15));
        result.unwrap();
        assert_eq!(*guard, 1);
        drop(guard);
        helper.join().unwrap();
    }
}
