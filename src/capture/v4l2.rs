//! V4L2 streaming device on top of the `v4l` MMAP stream

use std::io;
use std::time::Duration;

use nix::errno::Errno;
use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::frameinterval::FrameIntervalEnum;
use v4l::framesize::FrameSizeEnum;
use v4l::io::traits::{CaptureStream, Stream};
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC, Fraction};

use super::device::{CaptureDevice, DequeuedBuffer};
use super::frame::{DeviceFormat, FrameRate, PixelFormat};
use crate::{CaptureError, Result};

/// A UVC node. Slots live in the mmap stream, indexed the way the driver
/// numbers them.
pub struct V4l2Device {
    device: Device,
    path: String,
    stream: Option<MmapStream<'static>>,
    queued: u32,
}

impl V4l2Device {
    pub fn open(path: &str) -> Result<Self> {
        let device = Device::with_path(path).map_err(|e| device_error(path, e))?;
        let caps = device.query_caps().map_err(|e| device_error(path, e))?;
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE)
            || !caps.capabilities.contains(CapFlags::STREAMING)
        {
            return Err(CaptureError::DeviceConfig(format!(
                "{path} ({}) cannot stream video capture",
                caps.card
            )));
        }
        info!("Opened {}: {} ({})", path, caps.card, caps.driver);
        Ok(Self {
            device,
            path: path.to_string(),
            stream: None,
            queued: 0,
        })
    }

    fn rates(&self, fourcc: FourCC, width: u32, height: u32) -> Vec<FrameRate> {
        let intervals = match self.device.enum_frameintervals(fourcc, width, height) {
            Ok(intervals) => intervals,
            Err(e) => {
                debug!("No intervals for {} {}x{}: {}", fourcc, width, height, e);
                return Vec::new();
            }
        };
        intervals
            .into_iter()
            .filter_map(|i| match i.interval {
                FrameIntervalEnum::Discrete(f) => Some(FrameRate {
                    numerator: f.numerator,
                    denominator: f.denominator,
                }),
                FrameIntervalEnum::Stepwise(_) => None,
            })
            .filter(|r| r.numerator != 0 && r.denominator != 0)
            .collect()
    }

    fn stream(&mut self) -> Result<&mut MmapStream<'static>> {
        let path = &self.path;
        self.stream
            .as_mut()
            .ok_or_else(|| CaptureError::DeviceConfig(format!("{path} has no buffers")))
    }
}

impl CaptureDevice for V4l2Device {
    fn formats(&self) -> Result<Vec<DeviceFormat>> {
        let descriptions = self
            .device
            .enum_formats()
            .map_err(|e| device_error(&self.path, e))?;
        let mut catalog = Vec::new();
        for desc in descriptions {
            let Some(fourcc) = PixelFormat::from_fourcc(&desc.fourcc.repr) else {
                debug!("Skipping unsupported fourcc {}", desc.fourcc);
                continue;
            };
            let sizes = self
                .device
                .enum_framesizes(desc.fourcc)
                .map_err(|e| device_error(&self.path, e))?;
            for size in sizes {
                let FrameSizeEnum::Discrete(d) = size.size else {
                    continue;
                };
                let frame_rates = self.rates(desc.fourcc, d.width, d.height);
                if frame_rates.is_empty() {
                    continue;
                }
                catalog.push(DeviceFormat {
                    width: d.width,
                    height: d.height,
                    fourcc,
                    frame_rates,
                });
            }
        }
        Ok(catalog)
    }

    #[instrument(skip(self), fields(path = %self.path))]
    fn set_format(&mut self, format: &DeviceFormat) -> Result<u32> {
        let mut fmt = self
            .device
            .format()
            .map_err(|e| device_error(&self.path, e))?;
        fmt.width = format.width;
        fmt.height = format.height;
        fmt.fourcc = FourCC::new(&format.fourcc.fourcc());
        let applied = self
            .device
            .set_format(&fmt)
            .map_err(|e| device_error(&self.path, e))?;
        if applied.width != format.width
            || applied.height != format.height
            || applied.fourcc != fmt.fourcc
        {
            return Err(CaptureError::DeviceConfig(format!(
                "driver applied {} {}x{} instead of {}",
                applied.fourcc, applied.width, applied.height, format
            )));
        }
        Ok(applied.size)
    }

    fn set_frame_rate(&mut self, rate: FrameRate) -> Result<()> {
        let params = Parameters::new(Fraction::new(rate.numerator, rate.denominator));
        let applied = self
            .device
            .set_params(&params)
            .map_err(|e| device_error(&self.path, e))?;
        if applied.interval.numerator != rate.numerator
            || applied.interval.denominator != rate.denominator
        {
            warn!(
                "Driver applied interval {}/{} for {}",
                applied.interval.numerator, applied.interval.denominator, rate
            );
        }
        Ok(())
    }

    fn request_buffers(&mut self, count: u32) -> Result<u32> {
        // Dropping the stream stops it and hands the old slots back
        self.stream = None;
        self.queued = 0;
        if count == 0 {
            return Ok(0);
        }
        let stream = MmapStream::with_buffers(&self.device, Type::VideoCapture, count)
            .map_err(|e| device_error(&self.path, e))?;
        let granted = (0..count as usize)
            .take_while(|&index| stream.get(index).is_some())
            .count() as u32;
        debug!("Driver allocated {} of {} slots", granted, count);
        self.stream = Some(stream);
        Ok(granted)
    }

    fn stream_on(&mut self) -> Result<()> {
        let path = self.path.clone();
        self.stream()?.start().map_err(|e| device_error(&path, e))
    }

    fn stream_off(&mut self) -> Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        stream.stop().map_err(|e| device_error(&self.path, e))?;
        self.queued = 0;
        Ok(())
    }

    fn dequeue(&mut self, timeout: Duration) -> Result<Option<DequeuedBuffer>> {
        let path = self.path.clone();
        let stream = self.stream()?;
        stream.set_timeout(timeout);
        let index = match stream.dequeue() {
            Ok(index) => index,
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                return Ok(None)
            }
            Err(e) => return Err(device_error(&path, e)),
        };
        self.queued = self.queued.saturating_sub(1);
        let stream = self.stream()?;
        let meta = stream.get_meta(index).ok_or_else(|| {
            CaptureError::DeviceConfig(format!("{path}: no metadata for slot {index}"))
        })?;
        Ok(Some(DequeuedBuffer {
            index: index as u32,
            bytes_used: meta.bytesused,
            timestamp: Duration::from_secs(meta.timestamp.sec as u64)
                + Duration::from_micros(meta.timestamp.usec as u64),
        }))
    }

    fn enqueue(&mut self, index: u32) -> Result<()> {
        let path = self.path.clone();
        self.stream()?
            .queue(index as usize)
            .map_err(|e| device_error(&path, e))?;
        self.queued += 1;
        Ok(())
    }

    fn queued(&self) -> u32 {
        self.queued
    }

    fn map(&self, index: u32, len: usize) -> Result<&[u8]> {
        let slot = self
            .stream
            .as_ref()
            .and_then(|stream| stream.get(index as usize))
            .ok_or_else(|| CaptureError::InvalidArgument(format!("slot {index} is not mapped")))?;
        Ok(&slot[..len.min(slot.len())])
    }
}

/// Unplug shows up as ENODEV; everything else is a plain I/O failure
fn device_error(path: &str, e: io::Error) -> CaptureError {
    match e.raw_os_error().map(Errno::from_raw) {
        Some(Errno::ENODEV) | Some(Errno::ENXIO) => {
            CaptureError::Disconnected(format!("{path}: {e}"))
        }
        _ => CaptureError::Io(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unplug_errors_close_the_device() {
        let unplugged = io::Error::from_raw_os_error(Errno::ENODEV as i32);
        assert!(device_error("/dev/video0", unplugged).is_fatal());
        let contended = io::Error::from_raw_os_error(Errno::EBUSY as i32);
        let busy = device_error("/dev/video0", contended);
        assert!(matches!(busy, CaptureError::Io(_)));
    }
}
