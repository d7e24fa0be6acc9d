//! V4L2 camera capability via the `v4l` crate.
//!
//! Each opened session owns one capture thread that dequeues mmap buffers,
//! reduces them to luma and forwards them over a single-slot channel. When
//! the consumer is slower than the camera, new frames are dropped instead of
//! queued.

use crate::frame::{is_dark_frame, PixelFormat};
use async_trait::async_trait;
use facelens_core::capture::{CameraCapability, CameraError, CaptureSession, Track, VideoSource};
use facelens_core::types::{Frame, Geometry};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Fraction of near-black pixels above which a frame counts as dark.
const DARK_FRAME_RATIO: f32 = 0.95;
const MMAP_BUFFERS: u32 = 4;

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// List available V4L2 video capture devices.
pub fn list_devices() -> Vec<DeviceInfo> {
    let mut devices = Vec::new();

    for i in 0..16 {
        let path = format!("/dev/video{i}");
        if !Path::new(&path).exists() {
            continue;
        }
        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            continue;
        }
        devices.push(DeviceInfo {
            path,
            name: caps.card.clone(),
            driver: caps.driver.clone(),
            bus: caps.bus.clone(),
        });
    }

    devices
}

/// Opens V4L2 devices at a requested resolution.
#[derive(Debug, Clone)]
pub struct V4lCamera {
    width: u32,
    height: u32,
    skip_dark_frames: bool,
}

impl Default for V4lCamera {
    fn default() -> Self {
        Self::new(640, 480)
    }
}

impl V4lCamera {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            skip_dark_frames: false,
        }
    }

    /// Drop frames that are almost entirely black (IR emitter off-cycles).
    pub fn skip_dark_frames(mut self, skip: bool) -> Self {
        self.skip_dark_frames = skip;
        self
    }
}

#[async_trait]
impl CameraCapability for V4lCamera {
    async fn open(&self, source_id: &str) -> Result<CaptureSession, CameraError> {
        let path = source_id.to_string();
        let (width, height) = (self.width, self.height);
        let opened = tokio::task::spawn_blocking(move || open_device(&path, width, height))
            .await
            .map_err(|e| CameraError::CaptureFailed(format!("device open task failed: {e}")))??;

        let (tx, rx) = mpsc::channel(1);
        let stop = Arc::new(AtomicBool::new(false));
        let worker = CaptureWorker {
            opened,
            skip_dark_frames: self.skip_dark_frames,
            stop: stop.clone(),
            tx,
        };
        let thread = std::thread::Builder::new()
            .name("facelens-capture".into())
            .spawn(move || worker.run())
            .map_err(|e| CameraError::CaptureFailed(format!("failed to spawn capture thread: {e}")))?;

        Ok(CaptureSession {
            tracks: vec![Box::new(ThreadTrack::new(source_id, stop, thread))],
            source: Box::new(ChannelSource::new(rx)),
        })
    }
}

struct OpenedDevice {
    device: Device,
    path: String,
    width: u32,
    height: u32,
    format: PixelFormat,
}

fn map_open_error(path: &str, e: io::Error) -> CameraError {
    if e.kind() == io::ErrorKind::PermissionDenied {
        CameraError::PermissionDenied(format!("{path}: {e}"))
    } else if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
        CameraError::DeviceBusy
    } else {
        CameraError::DeviceNotFound(format!("{path}: {e}"))
    }
}

/// Open the device, check it can capture and negotiate a luma-reducible format.
fn open_device(path: &str, width: u32, height: u32) -> Result<OpenedDevice, CameraError> {
    if !Path::new(path).exists() {
        return Err(CameraError::DeviceNotFound(path.to_string()));
    }

    let device = Device::with_path(path).map_err(|e| map_open_error(path, e))?;

    let caps = device
        .query_caps()
        .map_err(|e| CameraError::CaptureFailed(format!("failed to query capabilities: {e}")))?;
    tracing::info!(device = path, driver = %caps.driver, card = %caps.card, "opened camera");

    if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
        return Err(CameraError::StreamingNotSupported);
    }

    let mut fmt = device
        .format()
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to get format: {e}")))?;
    fmt.fourcc = FourCC::new(b"YUYV");
    fmt.width = width;
    fmt.height = height;

    let negotiated = device
        .set_format(&fmt)
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to set format: {e}")))?;

    let format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
        CameraError::FormatNegotiationFailed(format!(
            "unsupported pixel format: {:?} (need YUYV, GREY, or Y16)",
            negotiated.fourcc
        ))
    })?;

    tracing::info!(
        width = negotiated.width,
        height = negotiated.height,
        fourcc = ?negotiated.fourcc,
        "negotiated format"
    );

    Ok(OpenedDevice {
        device,
        path: path.to_string(),
        width: negotiated.width,
        height: negotiated.height,
        format,
    })
}

type FrameResult = Result<Frame, CameraError>;

struct CaptureWorker {
    opened: OpenedDevice,
    skip_dark_frames: bool,
    stop: Arc<AtomicBool>,
    tx: mpsc::Sender<FrameResult>,
}

impl CaptureWorker {
    fn run(self) {
        let OpenedDevice {
            device,
            path,
            width,
            height,
            format,
        } = &self.opened;

        let mut stream = match MmapStream::with_buffers(device, BufType::VideoCapture, MMAP_BUFFERS) {
            Ok(stream) => stream,
            Err(e) => {
                let _ = self.tx.try_send(Err(CameraError::CaptureFailed(format!(
                    "failed to create mmap stream: {e}"
                ))));
                return;
            }
        };

        let mut dropped = 0u64;
        while !self.stop.load(Ordering::SeqCst) {
            let (buf, meta) = match stream.next() {
                Ok(next) => next,
                Err(e) => {
                    tracing::warn!(device = %path, error = %e, "failed to dequeue buffer; ending capture");
                    let _ = self.tx.try_send(Err(CameraError::CaptureFailed(format!(
                        "failed to dequeue buffer: {e}"
                    ))));
                    break;
                }
            };

            let data = match format.to_luma(buf, *width, *height) {
                Ok(data) => data,
                Err(e) => {
                    tracing::debug!(seq = meta.sequence, error = %e, "skipping malformed buffer");
                    continue;
                }
            };
            if self.skip_dark_frames && is_dark_frame(&data, DARK_FRAME_RATIO) {
                tracing::debug!(seq = meta.sequence, "skipping dark frame");
                continue;
            }

            let frame = Frame {
                data,
                width: *width,
                height: *height,
                sequence: meta.sequence,
                timestamp: std::time::Instant::now(),
            };
            match self.tx.try_send(Ok(frame)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => dropped += 1,
                Err(TrySendError::Closed(_)) => break,
            }
        }

        tracing::debug!(device = %path, dropped, "capture thread exiting");
    }
}

/// Hardware track backed by the capture thread.
pub struct ThreadTrack {
    label: String,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ThreadTrack {
    pub fn new(label: impl Into<String>, stop: Arc<AtomicBool>, thread: JoinHandle<()>) -> Self {
        Self {
            label: label.into(),
            stop,
            thread: Some(thread),
        }
    }
}

#[async_trait]
impl Track for ThreadTrack {
    fn label(&self) -> &str {
        &self.label
    }

    /// Signal the thread and wait for it to release the device. Idempotent.
    async fn stop(&mut self) -> Result<(), CameraError> {
        self.stop.store(true, Ordering::SeqCst);
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };

        let joined = tokio::task::spawn_blocking(move || thread.join())
            .await
            .map_err(|e| CameraError::TrackStop {
                track: self.label.clone(),
                reason: e.to_string(),
            })?;
        joined.map_err(|_| CameraError::TrackStop {
            track: self.label.clone(),
            reason: "capture thread panicked".into(),
        })?;

        tracing::info!(track = %self.label, "capture track stopped");
        Ok(())
    }
}

impl Drop for ThreadTrack {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// Video source reading from the capture thread's channel.
pub struct ChannelSource {
    rx: mpsc::Receiver<FrameResult>,
    pending: Option<Frame>,
}

impl ChannelSource {
    pub fn new(rx: mpsc::Receiver<FrameResult>) -> Self {
        Self { rx, pending: None }
    }
}

#[async_trait]
impl VideoSource for ChannelSource {
    /// Wait for the first frame and keep it for the first `next_frame`.
    async fn ready(&mut self) -> Result<Geometry, CameraError> {
        if let Some(frame) = &self.pending {
            return Ok(frame.geometry());
        }
        match self.rx.recv().await {
            Some(Ok(frame)) => {
                let geometry = frame.geometry();
                self.pending = Some(frame);
                Ok(geometry)
            }
            Some(Err(e)) => Err(e),
            None => Err(CameraError::EndedBeforeReady),
        }
    }

    async fn next_frame(&mut self) -> Result<Option<Frame>, CameraError> {
        if let Some(frame) = self.pending.take() {
            return Ok(Some(frame));
        }
        self.rx.recv().await.transpose()
    }
}
