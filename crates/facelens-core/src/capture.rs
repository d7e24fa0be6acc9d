//! Camera capability boundary: capture sessions, hardware tracks and the
//! video source frames are read from.

use crate::types::{Frame, Geometry};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("camera access denied: {0}")]
    PermissionDenied(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("video source ended before it became ready")]
    EndedBeforeReady,
    #[error("track {track} did not stop: {reason}")]
    TrackStop { track: String, reason: String },
}

/// One hardware resource owned by a capture session.
#[async_trait]
pub trait Track: Send {
    fn label(&self) -> &str;

    /// Resolves once the hardware has been released.
    async fn stop(&mut self) -> Result<(), CameraError>;
}

/// Frame producer attached to a capture session.
#[async_trait]
pub trait VideoSource: Send {
    /// Wait for the first frame / metadata and report the intrinsic size.
    async fn ready(&mut self) -> Result<Geometry, CameraError>;

    /// The latest frame, or `None` once the source has ended.
    async fn next_frame(&mut self) -> Result<Option<Frame>, CameraError>;
}

/// A freshly opened camera: its tracks plus the source that reads them.
pub struct CaptureSession {
    pub tracks: Vec<Box<dyn Track>>,
    pub source: Box<dyn VideoSource>,
}

/// Grants access to capture devices.
#[async_trait]
pub trait CameraCapability: Send + Sync {
    /// Open the video source identified by `source_id` (e.g. "/dev/video0").
    async fn open(&self, source_id: &str) -> Result<CaptureSession, CameraError>;
}
