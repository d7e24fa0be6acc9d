//! facelens-core — live face annotation engine.
//!
//! Loads perception models once per process, enrolls labelled reference
//! faces into a gallery, and runs a cooperative frame loop that detects,
//! matches and captions faces from a camera stream onto a pooled overlay
//! surface. Camera, perception and fetching sit behind traits so the
//! hardware and inference crates plug in from outside.

pub mod capture;
pub mod config;
pub mod fetch;
pub mod frame_loop;
pub mod gallery;
pub mod matcher;
pub mod models;
pub mod perception;
pub mod pipeline;
pub mod raster;
pub mod render;
pub mod resources;
pub mod surface;
pub mod types;

pub use capture::{CameraCapability, CameraError, CaptureSession, Track, VideoSource};
pub use config::{ConfigError, PipelineConfig};
pub use fetch::{DefaultFetcher, FetchError, Fetcher};
pub use frame_loop::{FrameClock, FrameObserver, FrameStats, IntervalClock, LoopExit, LoopPhase, Thresholds};
pub use gallery::{Gallery, GalleryBuilder, GalleryReport};
pub use matcher::{FaceMatcher, MatcherCache};
pub use models::{ModelLoadError, ModelRegistry, ModelSet};
pub use perception::{Perception, PerceptionError};
pub use pipeline::{Pipeline, PipelineDeps, PipelineError, PipelineState};
pub use raster::RasterSurface;
pub use surface::{Surface, SurfacePool};
pub use types::{
    AnnotatedFace, BoundingBox, Descriptor, ExpressionScores, FaceLabel, FaceObservation, Frame, Geometry, MatchResult,
};
