//! Camera stream and drawing surface ownership for one pipeline.

use crate::capture::{CameraCapability, CameraError, Track, VideoSource};
use crate::matcher::MatcherCache;
use crate::surface::{Surface, SurfacePool};
use crate::types::Geometry;
use std::sync::Arc;

/// The active capture session's hardware tracks.
pub struct StreamHandle {
    source_id: String,
    geometry: Geometry,
    tracks: Vec<Box<dyn Track>>,
}

impl StreamHandle {
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Intrinsic size reported by the video source when it became ready.
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }
}

/// What `release_stream` did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReleaseReport {
    pub tracks_stopped: usize,
    pub track_failures: usize,
    pub surface_returned: bool,
}

/// Acquires and releases the camera stream and the active surface.
///
/// At most one stream is active at a time; acquire and release are both
/// idempotent.
pub struct ResourceManager {
    camera: Arc<dyn CameraCapability>,
    pool: Arc<SurfacePool>,
    matchers: Arc<MatcherCache>,
    source_id: String,
    display: Option<Geometry>,
    stream: Option<StreamHandle>,
    source: Option<Box<dyn VideoSource>>,
    surface: Option<Box<dyn Surface>>,
}

impl ResourceManager {
    pub fn new(
        camera: Arc<dyn CameraCapability>,
        pool: Arc<SurfacePool>,
        matchers: Arc<MatcherCache>,
        source_id: impl Into<String>,
        display: Option<Geometry>,
    ) -> Self {
        Self {
            camera,
            pool,
            matchers,
            source_id: source_id.into(),
            display,
            stream: None,
            source: None,
            surface: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.stream.is_some()
    }

    pub fn stream(&self) -> Option<&StreamHandle> {
        self.stream.as_ref()
    }

    /// Open the camera and wait for its first frame. No-op while a stream is active.
    pub async fn acquire_stream(&mut self) -> Result<Geometry, CameraError> {
        if let Some(stream) = &self.stream {
            return Ok(stream.geometry);
        }

        let session = self.camera.open(&self.source_id).await?;
        let mut tracks = session.tracks;
        let mut source = session.source;

        let geometry = match source.ready().await {
            Ok(geometry) => geometry,
            Err(e) => {
                // Never leave hardware running behind a failed acquisition.
                stop_tracks(&mut tracks).await;
                return Err(e);
            }
        };

        tracing::info!(
            source = %self.source_id,
            %geometry,
            tracks = tracks.len(),
            "camera stream acquired"
        );

        self.stream = Some(StreamHandle {
            source_id: self.source_id.clone(),
            geometry,
            tracks,
        });
        self.source = Some(source);
        Ok(geometry)
    }

    /// Take a surface from the pool, sized to the display. No-op if one is held.
    ///
    /// Must be called after `acquire_stream` when no display size is configured.
    pub fn acquire_surface(&mut self) -> Geometry {
        let geometry = self.display_geometry();
        let surface = self.surface.get_or_insert_with(|| self.pool.acquire());
        surface.attach(geometry);
        geometry
    }

    /// Size overlays are drawn at: the configured display, else the intrinsic size.
    pub fn display_geometry(&self) -> Geometry {
        self.display
            .or_else(|| self.stream.as_ref().map(|s| s.geometry))
            .unwrap_or(Geometry::new(0, 0))
    }

    pub fn take_source(&mut self) -> Option<Box<dyn VideoSource>> {
        self.source.take()
    }

    pub fn restore_source(&mut self, source: Box<dyn VideoSource>) {
        if self.stream.is_some() {
            self.source = Some(source);
        }
    }

    pub fn take_surface(&mut self) -> Option<Box<dyn Surface>> {
        self.surface.take()
    }

    pub fn restore_surface(&mut self, surface: Box<dyn Surface>) {
        if self.surface.is_none() {
            self.surface = Some(surface);
        } else {
            self.pool.release(surface);
        }
    }

    /// Move the held stream, source and surface into a new manager, leaving
    /// this one empty.
    pub fn detach(&mut self) -> ResourceManager {
        ResourceManager {
            camera: self.camera.clone(),
            pool: self.pool.clone(),
            matchers: self.matchers.clone(),
            source_id: self.source_id.clone(),
            display: self.display,
            stream: self.stream.take(),
            source: self.source.take(),
            surface: self.surface.take(),
        }
    }

    /// Stop every track, drop the stream, return the surface and dispose the matcher.
    pub async fn release_stream(&mut self) -> ReleaseReport {
        let mut report = ReleaseReport::default();

        if let Some(mut stream) = self.stream.take() {
            let (stopped, failed) = stop_tracks(&mut stream.tracks).await;
            report.tracks_stopped = stopped;
            report.track_failures = failed;
            tracing::info!(source = %stream.source_id, stopped, failed, "camera stream released");
        }
        self.source = None;

        if let Some(surface) = self.surface.take() {
            self.pool.release(surface);
            report.surface_returned = true;
        }

        self.matchers.dispose();
        report
    }
}

/// Stop all tracks; a failing track is logged and the rest are still stopped.
async fn stop_tracks(tracks: &mut [Box<dyn Track>]) -> (usize, usize) {
    let mut stopped = 0;
    let mut failed = 0;
    for track in tracks.iter_mut() {
        match track.stop().await {
            Ok(()) => stopped += 1,
            Err(e) => {
                failed += 1;
                tracing::warn!(track = track.label(), error = %e, "track stop failed; continuing");
            }
        }
    }
    (stopped, failed)
}
