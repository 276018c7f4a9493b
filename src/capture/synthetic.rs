//! In-process capture device producing a test pattern
//!
//! Behaves like a V4L2 driver with an MMAP slot arena: slots must be queued
//! before they can be filled, stream off empties the incoming queue, and
//! frames are only handed out while streaming. A shared [`SyntheticProbe`]
//! lets callers gate frame delivery, script frame contents, and observe the
//! driver-side queue.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use tracing::debug;

use super::device::{CaptureDevice, DequeuedBuffer};
use super::frame::{DeviceFormat, FrameRate, PixelFormat};
use crate::{lock, CaptureError, Result};

/// Observation and control handle shared with a [`SyntheticDevice`]
#[derive(Default)]
pub struct SyntheticProbe {
    state: Mutex<ProbeState>,
    ready: Condvar,
}

#[derive(Default)]
struct ProbeState {
    /// `None` delivers freely, `Some(n)` allows n more frames
    gate: Option<u32>,
    scripted: VecDeque<Bytes>,
    queued: u32,
    disconnected: bool,
    buffer_limit: Option<u32>,
    reject_format: bool,
    delivered: u64,
    stream_ons: u32,
    rates: Vec<FrameRate>,
    rate_delay: Option<Duration>,
    buffer_requests: Vec<u32>,
}

impl SyntheticProbe {
    /// Stop delivering frames until [`SyntheticProbe::allow`] is called
    pub fn hold(&self) {
        lock(&self.state).gate = Some(0);
    }

    pub fn allow(&self, frames: u32) {
        let mut state = lock(&self.state);
        let gate = state.gate.get_or_insert(0);
        *gate += frames;
        drop(state);
        self.ready.notify_all();
    }

    pub fn free_run(&self) {
        lock(&self.state).gate = None;
        self.ready.notify_all();
    }

    /// Next delivered frame carries exactly these bytes
    pub fn push_frame(&self, data: impl Into<Bytes>) {
        lock(&self.state).scripted.push_back(data.into());
    }

    pub fn disconnect(&self) {
        lock(&self.state).disconnected = true;
        self.ready.notify_all();
    }

    /// Driver allocates at most `limit` slots
    pub fn limit_buffers(&self, limit: u32) {
        lock(&self.state).buffer_limit = Some(limit);
    }

    /// Every later frame rate change takes `delay` after it is recorded
    pub fn slow_rate_changes(&self, delay: Duration) {
        lock(&self.state).rate_delay = Some(delay);
    }

    pub fn reject_formats(&self, reject: bool) {
        lock(&self.state).reject_format = reject;
    }

    /// Slots currently owned by the driver
    pub fn queued(&self) -> u32 {
        lock(&self.state).queued
    }

    pub fn delivered(&self) -> u64 {
        lock(&self.state).delivered
    }

    pub fn stream_ons(&self) -> u32 {
        lock(&self.state).stream_ons
    }

    pub fn rates(&self) -> Vec<FrameRate> {
        lock(&self.state).rates.clone()
    }

    /// Every non-zero buffer count requested so far
    pub fn buffer_requests(&self) -> Vec<u32> {
        lock(&self.state).buffer_requests.clone()
    }
}

/// Pattern-generating device with a V4L2-like slot arena
pub struct SyntheticDevice {
    formats: Vec<DeviceFormat>,
    probe: Arc<SyntheticProbe>,
    current: Option<DeviceFormat>,
    pattern: Bytes,
    slots: Vec<Bytes>,
    queued: VecDeque<u32>,
    streaming: bool,
    started: Instant,
}

impl SyntheticDevice {
    pub fn new(formats: Vec<DeviceFormat>) -> Self {
        Self {
            formats,
            probe: Arc::new(SyntheticProbe::default()),
            current: None,
            pattern: Bytes::new(),
            slots: Vec::new(),
            queued: VecDeque::new(),
            streaming: false,
            started: Instant::now(),
        }
    }

    /// Typical USB webcam catalog, MJPEG only
    pub fn webcam() -> Self {
        Self::new(vec![
            DeviceFormat::new(320, 240, PixelFormat::Mjpeg, &[15, 30]),
            DeviceFormat::new(640, 480, PixelFormat::Mjpeg, &[15, 30]),
            DeviceFormat::new(1280, 720, PixelFormat::Mjpeg, &[10, 15, 30]),
            DeviceFormat::new(1920, 1080, PixelFormat::Mjpeg, &[5, 15, 30]),
        ])
    }

    pub fn probe(&self) -> Arc<SyntheticProbe> {
        Arc::clone(&self.probe)
    }

    fn render_pattern(format: &DeviceFormat) -> Result<Bytes> {
        let (w, h) = (format.width as usize, format.height as usize);
        match format.fourcc {
            PixelFormat::Mjpeg => {
                let mut rgb = Vec::with_capacity(w * h * 3);
                for y in 0..h {
                    for x in 0..w {
                        // Eight vertical colour bars over a vertical luma ramp
                        let bar = (x * 8 / w.max(1)) as u8;
                        let ramp = (y * 255 / h.max(1)) as u8;
                        rgb.push(if bar & 4 != 0 { 255 } else { ramp / 2 });
                        rgb.push(if bar & 2 != 0 { 255 } else { ramp / 2 });
                        rgb.push(if bar & 1 != 0 { 255 } else { ramp / 2 });
                    }
                }
                let mut out = Vec::new();
                JpegEncoder::new_with_quality(&mut out, 75)
                    .encode(
                        &rgb,
                        format.width,
                        format.height,
                        image::ExtendedColorType::Rgb8,
                    )
                    .map_err(|e| CaptureError::Encode(e.to_string()))?;
                Ok(Bytes::from(out))
            }
            PixelFormat::Yuyv => {
                let mut out = Vec::with_capacity(w * h * 2);
                for y in 0..h {
                    for x in (0..w).step_by(2) {
                        let luma = ((x * 255) / w.max(1)) as u8;
                        out.extend_from_slice(&[luma, (y % 256) as u8, luma, 128]);
                    }
                }
                Ok(Bytes::from(out))
            }
        }
    }
}

impl CaptureDevice for SyntheticDevice {
    fn formats(&self) -> Result<Vec<DeviceFormat>> {
        Ok(self.formats.clone())
    }

    fn set_format(&mut self, format: &DeviceFormat) -> Result<u32> {
        if self.streaming {
            return Err(CaptureError::DeviceConfig("set format while streaming".into()));
        }
        if lock(&self.probe.state).reject_format {
            return Err(CaptureError::DeviceConfig(format!("{format} rejected")));
        }
        let known = self
            .formats
            .iter()
            .find(|f| f.fourcc == format.fourcc && f.size() == format.size())
            .cloned()
            .ok_or_else(|| CaptureError::DeviceConfig(format!("{format} not in catalog")))?;

        self.pattern = Self::render_pattern(&known)?;
        debug!("Synthetic pattern for {}: {} bytes", known, self.pattern.len());
        self.current = Some(known);
        Ok(format.width * format.height * 2)
    }

    fn set_frame_rate(&mut self, rate: FrameRate) -> Result<()> {
        let current = self
            .current
            .as_ref()
            .ok_or_else(|| CaptureError::DeviceConfig("frame rate before format".into()))?;
        if !current.supports_fps(rate.fps()) {
            return Err(CaptureError::DeviceConfig(format!(
                "{rate} unsupported by {current}"
            )));
        }
        let delay = {
            let mut probe = lock(&self.probe.state);
            probe.rates.push(rate);
            probe.rate_delay
        };
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        Ok(())
    }

    fn request_buffers(&mut self, count: u32) -> Result<u32> {
        if self.streaming {
            return Err(CaptureError::DeviceConfig("buffers busy".into()));
        }
        let mut probe = lock(&self.probe.state);
        let granted = probe.buffer_limit.map_or(count, |limit| count.min(limit));
        if count > 0 {
            probe.buffer_requests.push(count);
        }
        probe.queued = 0;
        self.queued.clear();
        self.slots = vec![Bytes::new(); granted as usize];
        Ok(granted)
    }

    fn stream_on(&mut self) -> Result<()> {
        if self.current.is_none() || self.slots.is_empty() {
            return Err(CaptureError::DeviceConfig("stream on without buffers".into()));
        }
        self.streaming = true;
        lock(&self.probe.state).stream_ons += 1;
        Ok(())
    }

    fn stream_off(&mut self) -> Result<()> {
        self.streaming = false;
        self.queued.clear();
        lock(&self.probe.state).queued = 0;
        Ok(())
    }

    fn dequeue(&mut self, timeout: Duration) -> Result<Option<DequeuedBuffer>> {
        if !self.streaming {
            return Err(CaptureError::DeviceConfig("dequeue while stopped".into()));
        }
        let deadline = Instant::now() + timeout;
        let mut probe = lock(&self.probe.state);
        loop {
            if probe.disconnected {
                return Err(CaptureError::Disconnected("synthetic device unplugged".into()));
            }
            let open = probe.gate.map_or(true, |n| n > 0);
            if open && !self.queued.is_empty() {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            probe = self
                .probe
                .ready
                .wait_timeout(probe, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        let Some(index) = self.queued.pop_front() else {
            return Ok(None);
        };
        if let Some(gate) = probe.gate.as_mut() {
            *gate -= 1;
        }
        let data = probe
            .scripted
            .pop_front()
            .unwrap_or_else(|| self.pattern.clone());
        probe.queued -= 1;
        probe.delivered += 1;
        drop(probe);

        let bytes_used = data.len() as u32;
        self.slots[index as usize] = data;
        Ok(Some(DequeuedBuffer {
            index,
            bytes_used,
            timestamp: self.started.elapsed(),
        }))
    }

    fn enqueue(&mut self, index: u32) -> Result<()> {
        if index as usize >= self.slots.len() || self.queued.contains(&index) {
            return Err(CaptureError::InvalidArgument(format!(
                "enqueue of slot {index}"
            )));
        }
        self.queued.push_back(index);
        lock(&self.probe.state).queued += 1;
        self.probe.ready.notify_all();
        Ok(())
    }

    fn queued(&self) -> u32 {
        self.queued.len() as u32
    }

    fn map(&self, index: u32, len: usize) -> Result<&[u8]> {
        let slot = self
            .slots
            .get(index as usize)
            .ok_or_else(|| CaptureError::InvalidArgument(format!("map of slot {index}")))?;
        Ok(&slot[..len.min(slot.len())])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn streaming_device() -> SyntheticDevice {
        let mut dev = SyntheticDevice::new(vec![DeviceFormat::new(
            64,
            48,
            PixelFormat::Mjpeg,
            &[30],
        )]);
        let fmt = dev.formats().unwrap()[0].clone();
        dev.set_format(&fmt).unwrap();
        dev.set_frame_rate(FrameRate::from_fps(30)).unwrap();
        assert_eq!(dev.request_buffers(2).unwrap(), 2);
        dev.enqueue(0).unwrap();
        dev.enqueue(1).unwrap();
        dev.stream_on().unwrap();
        dev
    }

    #[test]
    fn delivers_queued_slots_in_order() {
        let mut dev = streaming_device();
        let first = dev.dequeue(Duration::from_millis(10)).unwrap().unwrap();
        let second = dev.dequeue(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!((first.index, second.index), (0, 1));
        assert!(dev.dequeue(Duration::from_millis(5)).unwrap().is_none());
        assert_eq!(dev.probe().queued(), 0);
    }

    #[test]
    fn gate_holds_frames_back() {
        let mut dev = streaming_device();
        let probe = dev.probe();
        probe.hold();
        assert!(dev.dequeue(Duration::from_millis(5)).unwrap().is_none());
        probe.allow(1);
        assert!(dev.dequeue(Duration::from_millis(5)).unwrap().is_some());
        assert!(dev.dequeue(Duration::from_millis(5)).unwrap().is_none());
    }

    #[test]
    fn scripted_frame_overrides_pattern() {
        let mut dev = streaming_device();
        dev.probe().push_frame(vec![1u8, 2, 3]);
        let buf = dev.dequeue(Duration::from_millis(5)).unwrap().unwrap();
        assert_eq!(buf.bytes_used, 3);
        assert_eq!(&dev.map(buf.index, 3).unwrap()[..], &[1, 2, 3]);
    }

    #[test]
    fn rejects_double_enqueue() {
        let mut dev = streaming_device();
        assert!(dev.enqueue(0).is_err());
    }
}
