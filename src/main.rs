//! extcam demo: streams a preview and a still through a capture session and
//! writes the JPEGs to disk

use std::sync::Arc;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use tracing::{info, warn};

use extcam::capture::CaptureDevice;
use extcam::pipeline::jpeg::BLOB_TRAILER_LEN;
use extcam::pipeline::DestinationLayout;
use extcam::session::buffers::{GraphicBuffer, LocalImporter};
use extcam::session::request::{
    CaptureRequest, ChannelSink, OutputBuffer, RequestTemplate, SessionEvent, StreamFormat,
    StreamShape,
};
use extcam::{CaptureSession, Config};

const FRAMES: u32 = 30;
const PREVIEW_STREAM: i32 = 0;
const STILL_STREAM: i32 = 1;

fn load_config() -> Result<Config> {
    let path = std::env::var("EXTCAM_CONFIG").unwrap_or_else(|_| "extcam.toml".into());
    let config = config::Config::builder()
        .add_source(config::File::with_name(&path).required(false))
        .add_source(config::Environment::with_prefix("EXTCAM").separator("__"))
        .build()?
        .try_deserialize()?;
    Ok(config)
}

#[cfg(feature = "v4l2")]
fn open_device(config: &Config) -> Result<Box<dyn CaptureDevice>> {
    let path = match &config.capture.device {
        Some(path) => path.clone(),
        None => extcam::utils::auto_detect_device()?.path,
    };
    info!("Using capture device: {}", path);
    Ok(Box::new(extcam::capture::V4l2Device::open(&path)?))
}

#[cfg(not(feature = "v4l2"))]
fn open_device(_config: &Config) -> Result<Box<dyn CaptureDevice>> {
    info!("Built without V4L2, using the synthetic webcam");
    let device = extcam::capture::SyntheticDevice::webcam();
    device.probe().free_run();
    Ok(Box::new(device))
}

fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "extcam=debug".into()),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("extcam launching...");
    let config = load_config()?;
    let device = open_device(&config)?;

    let (sink, events) = ChannelSink::unbounded();
    let session = CaptureSession::new(
        device,
        Arc::new(LocalImporter::default()),
        Arc::new(sink),
        config,
    )?;

    let preview = StreamShape::output(PREVIEW_STREAM, 640, 480, StreamFormat::ImplementationDefined);
    let still = StreamShape::output(STILL_STREAM, 640, 480, StreamFormat::Blob);
    let hal = session.configure(&[preview.clone(), still.clone()])?;
    for stream in &hal {
        info!(
            "Stream {}: {:?}, {} buffers",
            stream.id, stream.override_format, stream.max_buffers
        );
    }

    let preview_buffer = GraphicBuffer::yuv(preview.size, DestinationLayout::Yv12);
    let blob_len = session.blob_buffer_size(still.size)?;
    let still_buffer = GraphicBuffer::blob(blob_len);
    let settings = session.default_settings(RequestTemplate::StillCapture)?;

    for frame_number in 0..FRAMES {
        let first = frame_number == 0;
        session.submit(CaptureRequest {
            frame_number,
            settings: first.then(|| settings.clone()),
            outputs: vec![
                OutputBuffer {
                    stream_id: PREVIEW_STREAM,
                    buffer_id: 1,
                    handle: first.then(|| preview_buffer.clone()),
                    acquire_fence: None,
                },
                OutputBuffer {
                    stream_id: STILL_STREAM,
                    buffer_id: 1,
                    handle: first.then(|| still_buffer.clone()),
                    acquire_fence: None,
                },
            ],
        })?;

        // One buffer per stream, so wait for this frame before reusing them
        loop {
            match events.recv_timeout(Duration::from_secs(5)) {
                Ok(SessionEvent::Result(result)) => {
                    if result.is_ok() {
                        write_jpeg(result.frame_number, &still_buffer)?;
                    } else {
                        warn!("Frame {} failed: {:?}", result.frame_number, result.error);
                    }
                    break;
                }
                Ok(SessionEvent::Notify(msg)) => tracing::debug!("{:?}", msg),
                Err(e) => return Err(eyre!("no result for frame {frame_number}: {e}")),
            }
        }
    }

    info!("\n{}", session.snapshot());
    session.close()?;
    info!("extcam shutting down");
    Ok(())
}

fn write_jpeg(frame_number: u32, buffer: &GraphicBuffer) -> Result<()> {
    let data = buffer.to_vec();
    let trailer = &data[data.len().saturating_sub(BLOB_TRAILER_LEN)..];
    if trailer.len() < BLOB_TRAILER_LEN {
        return Err(eyre!("blob buffer too small"));
    }
    let size = u32::from_le_bytes([trailer[4], trailer[5], trailer[6], trailer[7]]) as usize;
    let path = format!("frame-{frame_number:03}.jpg");
    std::fs::write(&path, &data[..size.min(data.len())])?;
    info!("Wrote {} ({} bytes)", path, size);
    Ok(())
}
