//! Pipeline facade: model loading, camera and surface ownership, and the
//! frame loop task behind `start` / `pause` / `stop`.

use crate::capture::{CameraCapability, CameraError};
use crate::config::{ConfigError, PipelineConfig};
use crate::fetch::Fetcher;
use crate::frame_loop::{
    ClockFactory, FrameClock, FrameLoop, FrameObserver, FrameStats, IntervalClock, LoopExit, LoopOutcome, Thresholds,
};
use crate::gallery::{Gallery, GalleryBuilder};
use crate::matcher::MatcherCache;
use crate::models::{ModelLoadError, ModelRegistry, ModelSet};
use crate::perception::Perception;
use crate::resources::ResourceManager;
use crate::surface::SurfacePool;
use crate::types::Geometry;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("model load failed: {0}")]
    ModelLoad(#[from] ModelLoadError),
    #[error("camera acquisition failed: {0}")]
    Camera(#[from] CameraError),
    #[error("video source or surface unavailable after acquisition")]
    SourceUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Constructed, nothing acquired yet.
    Uninitialized,
    /// Models loaded, stream and surface held, loop not running.
    Ready,
    Running,
    /// Everything released. `start` re-acquires.
    Stopped,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineState::Uninitialized => "uninitialized",
            PipelineState::Ready => "ready",
            PipelineState::Running => "running",
            PipelineState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// External capabilities a pipeline is built from.
pub struct PipelineDeps {
    camera: Arc<dyn CameraCapability>,
    perception: Arc<dyn Perception>,
    fetcher: Arc<dyn Fetcher>,
    surfaces: Arc<SurfacePool>,
    registry: &'static ModelRegistry,
    clock: Option<Arc<dyn ClockFactory>>,
    observer: Option<Arc<dyn FrameObserver>>,
}

impl PipelineDeps {
    pub fn new(
        camera: Arc<dyn CameraCapability>,
        perception: Arc<dyn Perception>,
        fetcher: Arc<dyn Fetcher>,
        surfaces: Arc<SurfacePool>,
    ) -> Self {
        Self {
            camera,
            perception,
            fetcher,
            surfaces,
            registry: ModelRegistry::global(),
            clock: None,
            observer: None,
        }
    }

    /// Use a registry other than the process-wide one.
    pub fn with_registry(mut self, registry: &'static ModelRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Replace the default `IntervalClock` at the configured refresh rate.
    pub fn with_clock(mut self, clock: impl ClockFactory + 'static) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn FrameObserver>) -> Self {
        self.observer = Some(observer);
        self
    }
}

struct RunningLoop {
    stop: watch::Sender<bool>,
    handle: JoinHandle<LoopOutcome>,
}

/// One live annotation pipeline over one video source.
pub struct Pipeline {
    config: PipelineConfig,
    perception: Arc<dyn Perception>,
    fetcher: Arc<dyn Fetcher>,
    registry: &'static ModelRegistry,
    clock: Option<Arc<dyn ClockFactory>>,
    observer: Option<Arc<dyn FrameObserver>>,
    matchers: Arc<MatcherCache>,
    resources: ResourceManager,
    models: Option<Arc<ModelSet>>,
    stats: Arc<FrameStats>,
    state: PipelineState,
    running: Option<RunningLoop>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, deps: PipelineDeps) -> Result<Self, PipelineError> {
        let config = config.validated()?;

        let builder = GalleryBuilder::new(
            deps.fetcher.clone(),
            deps.perception.clone(),
            config.reference_base.clone(),
            config.reference_extension.clone(),
            config.min_confidence,
        );
        let matchers = Arc::new(MatcherCache::new(
            builder,
            config.enrollment_labels.clone(),
            config.distance_threshold,
        ));
        let resources = ResourceManager::new(
            deps.camera,
            deps.surfaces,
            matchers.clone(),
            config.video_source.clone(),
            config.display,
        );

        Ok(Self {
            config,
            perception: deps.perception,
            fetcher: deps.fetcher,
            registry: deps.registry,
            clock: deps.clock,
            observer: deps.observer,
            matchers,
            resources,
            models: None,
            stats: Arc::new(FrameStats::default()),
            state: PipelineState::Uninitialized,
            running: None,
        })
    }

    /// Reflects the last transition. A source that ended on its own is only
    /// observed once `wait`, `pause` or `stop` reaps the loop.
    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<FrameStats> {
        self.stats.clone()
    }

    pub fn matchers(&self) -> &Arc<MatcherCache> {
        &self.matchers
    }

    pub fn models(&self) -> Option<&Arc<ModelSet>> {
        self.models.as_ref()
    }

    /// Intrinsic size of the active stream, if one is held.
    pub fn stream_geometry(&self) -> Option<Geometry> {
        self.resources.stream().map(|s| s.geometry())
    }

    pub async fn gallery(&self) -> Gallery {
        self.matchers.gallery().await
    }

    /// Forget every enrolled face; the next detection re-enrolls from the labels.
    pub async fn clear_gallery(&self) {
        self.matchers.clear_gallery().await;
    }

    /// Load models, acquire the stream and a surface, and start the frame loop.
    ///
    /// A no-op while running. Startup failures abort the start and leave any
    /// partially acquired stream released.
    pub async fn start(&mut self) -> Result<(), PipelineError> {
        if let Some(running) = &self.running {
            if !running.handle.is_finished() {
                return Ok(());
            }
            self.reap().await;
        }

        let artifacts = self.perception.required_artifacts();
        let models = self
            .registry
            .load(&self.config.model_source, &artifacts, self.fetcher.as_ref())
            .await?;
        models.require(&artifacts)?;
        tracing::info!(
            locator = models.locator(),
            artifacts = artifacts.len(),
            bytes = models.total_bytes(),
            "models ready"
        );
        self.models = Some(models.clone());

        let intrinsic = self.resources.acquire_stream().await?;
        let overlay = self.resources.acquire_surface();
        self.state = PipelineState::Ready;

        let (source, surface) = match (self.resources.take_source(), self.resources.take_surface()) {
            (Some(source), Some(surface)) => (source, surface),
            (source, surface) => {
                if let Some(source) = source {
                    self.resources.restore_source(source);
                }
                if let Some(surface) = surface {
                    self.resources.restore_surface(surface);
                }
                return Err(PipelineError::SourceUnavailable);
            }
        };

        let thresholds = Thresholds {
            min_confidence: self.config.min_confidence,
            distance: self.config.distance_threshold,
            smile: self.config.smile_threshold,
        };
        let frame_loop = FrameLoop::new(
            self.perception.clone(),
            models,
            self.matchers.clone(),
            thresholds,
            self.stats.clone(),
        )
        .with_observer(self.observer.clone());

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(frame_loop.run(source, surface, self.new_clock(), stop_rx));
        self.running = Some(RunningLoop { stop: stop_tx, handle });
        self.state = PipelineState::Running;

        tracing::info!(
            source = %self.config.video_source,
            %intrinsic,
            %overlay,
            "pipeline running"
        );
        Ok(())
    }

    /// Stop the loop after its in-flight iteration, keeping stream and surface.
    pub async fn pause(&mut self) {
        if let Some(running) = &self.running {
            let _ = running.stop.send(true);
        }
        self.reap().await;
    }

    /// Pause, then release the stream, the surface and the matcher. Idempotent.
    pub async fn stop(&mut self) {
        self.pause().await;
        let report = self.resources.release_stream().await;
        if self.state != PipelineState::Stopped {
            tracing::info!(
                tracks_stopped = report.tracks_stopped,
                track_failures = report.track_failures,
                surface_returned = report.surface_returned,
                "pipeline stopped"
            );
        }
        self.state = PipelineState::Stopped;
    }

    /// Resolve once the loop exits on its own. Returns `None` when not running.
    ///
    /// Cancel-safe: dropping the future leaves the loop running and owned.
    pub async fn wait(&mut self) -> Option<LoopExit> {
        let running = self.running.as_mut()?;
        let joined = (&mut running.handle).await;
        self.running = None;
        self.settle(joined).await
    }

    fn new_clock(&self) -> Box<dyn FrameClock> {
        match &self.clock {
            Some(factory) => factory.create(),
            None => Box::new(IntervalClock::new(self.config.refresh_hz)),
        }
    }

    async fn reap(&mut self) -> Option<LoopExit> {
        let running = self.running.take()?;
        let joined = running.handle.await;
        self.settle(joined).await
    }

    /// Take back what the loop owned and move to the matching state.
    async fn settle(&mut self, joined: Result<LoopOutcome, JoinError>) -> Option<LoopExit> {
        match joined {
            Ok(outcome) => {
                self.resources.restore_source(outcome.source);
                self.resources.restore_surface(outcome.surface);
                if outcome.exit == LoopExit::SourceEnded {
                    tracing::info!(source = %self.config.video_source, "video source ended");
                    self.resources.release_stream().await;
                    self.state = PipelineState::Stopped;
                } else {
                    self.state = PipelineState::Ready;
                }
                Some(outcome.exit)
            }
            Err(e) => {
                // The loop's source and surface are gone with the task.
                tracing::error!(error = %e, "frame loop task failed");
                self.resources.release_stream().await;
                self.state = PipelineState::Stopped;
                None
            }
        }
    }
}

/// Dropping without `stop()` still releases the camera and surface: the loop
/// is signalled, and a task on the current runtime joins it and releases
/// everything it held. Outside a runtime the tracks cannot be stopped.
impl Drop for Pipeline {
    fn drop(&mut self) {
        let running = self.running.take();
        if let Some(running) = &running {
            let _ = running.stop.send(true);
        }
        if running.is_none() && !self.resources.is_active() {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(source = %self.config.video_source, "pipeline dropped outside a runtime; camera not released");
            return;
        };
        let mut resources = self.resources.detach();
        let source = self.config.video_source.clone();
        runtime.spawn(async move {
            if let Some(running) = running {
                if let Ok(outcome) = running.handle.await {
                    resources.restore_source(outcome.source);
                    resources.restore_surface(outcome.surface);
                }
            }
            let report = resources.release_stream().await;
            tracing::info!(
                %source,
                tracks_stopped = report.tracks_stopped,
                surface_returned = report.surface_returned,
                "dropped pipeline released"
            );
        });
    }
}
