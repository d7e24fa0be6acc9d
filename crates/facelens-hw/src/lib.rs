//! facelens-hw — V4L2 camera capture for the facelens pipeline.
//!
//! Implements `facelens_core::CameraCapability` on top of the `v4l` crate:
//! device discovery, format negotiation, and a capture thread per session
//! that streams grayscale frames to the frame loop.

pub mod camera;
pub mod frame;

pub use camera::{list_devices, DeviceInfo, V4lCamera};
pub use frame::{is_dark_frame, FrameError, PixelFormat};
