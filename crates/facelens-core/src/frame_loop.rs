//! The cooperative per-frame cycle: capture → infer → match → render → reschedule.
//!
//! One iteration runs to completion before the next is scheduled, so the
//! loop throttles itself to the inference rate instead of queueing work.
//! The stop flag is inspected before every reschedule; an iteration already
//! in flight still renders once.

use crate::capture::{CameraError, VideoSource};
use crate::matcher::{FaceMatcher, MatcherCache};
use crate::models::ModelSet;
use crate::perception::{Perception, PerceptionError};
use crate::render::render;
use crate::surface::Surface;
use crate::types::{AnnotatedFace, ExpressionScores, FaceLabel, FaceObservation, Frame, Geometry, MatchResult, HAPPY_EXPRESSION};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{Interval, MissedTickBehavior};

/// A failure confined to a single iteration.
#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("frame capture failed: {0}")]
    Capture(#[from] CameraError),
    #[error("perception failed: {0}")]
    Perception(#[from] PerceptionError),
}

/// Drives the loop's cadence (the display refresh in production).
#[async_trait]
pub trait FrameClock: Send {
    async fn tick(&mut self);
}

/// Fixed-rate clock. Late ticks are delayed rather than bunched up.
pub struct IntervalClock {
    interval: Interval,
}

impl IntervalClock {
    pub fn new(refresh_hz: f32) -> Self {
        let period = Duration::from_secs_f32(1.0 / refresh_hz.max(0.001));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }
}

#[async_trait]
impl FrameClock for IntervalClock {
    async fn tick(&mut self) {
        self.interval.tick().await;
    }
}

/// Builds a fresh clock for every run of the loop.
pub trait ClockFactory: Send + Sync {
    fn create(&self) -> Box<dyn FrameClock>;
}

impl<F> ClockFactory for F
where
    F: Fn() -> Box<dyn FrameClock> + Send + Sync,
{
    fn create(&self) -> Box<dyn FrameClock> {
        self()
    }
}

/// Notified after every rendered iteration.
pub trait FrameObserver: Send + Sync {
    fn on_rendered(&self, frame: &Frame, faces: &[AnnotatedFace], surface: &dyn Surface);
}

/// Thresholds applied to every detection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub min_confidence: f32,
    pub distance: f32,
    pub smile: f32,
}

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopPhase {
    Idle = 0,
    Capturing = 1,
    Rendering = 2,
    Stopped = 3,
}

/// Counters shared between the loop task and its owner.
#[derive(Debug, Default)]
pub struct FrameStats {
    iterations: AtomicU64,
    failures: AtomicU64,
    faces: AtomicU64,
    phase: AtomicU8,
}

impl FrameStats {
    /// Iterations that reached the render step.
    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::SeqCst)
    }

    /// Iterations that failed and were skipped.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    /// Faces annotated across all iterations.
    pub fn faces(&self) -> u64 {
        self.faces.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> LoopPhase {
        match self.phase.load(Ordering::SeqCst) {
            1 => LoopPhase::Capturing,
            2 => LoopPhase::Rendering,
            3 => LoopPhase::Stopped,
            _ => LoopPhase::Idle,
        }
    }

    fn set_phase(&self, phase: LoopPhase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }
}

/// Why the loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// A stop was requested.
    Cancelled,
    /// The video source stopped producing frames.
    SourceEnded,
}

/// Everything the loop owned while running, handed back on exit.
pub struct LoopOutcome {
    pub exit: LoopExit,
    pub source: Box<dyn VideoSource>,
    pub surface: Box<dyn Surface>,
}

/// Decide the caption for one face.
///
/// Known iff the match distance is under the distance threshold; smiling iff
/// a "happy" score is present and exceeds the smile threshold.
pub fn classify(matched: &MatchResult, expressions: Option<&ExpressionScores>, thresholds: &Thresholds) -> FaceLabel {
    let known = matched.label.is_some() && matched.distance < thresholds.distance;
    let smiling = expressions
        .and_then(|e| e.score(HAPPY_EXPRESSION))
        .map_or(false, |score| score > thresholds.smile);
    FaceLabel::classify(known, smiling)
}

/// Map observations to display space and attach their captions.
pub fn annotate(
    observations: Vec<FaceObservation>,
    matcher: Option<&FaceMatcher>,
    intrinsic: Geometry,
    display: Geometry,
    thresholds: &Thresholds,
) -> Vec<AnnotatedFace> {
    observations
        .into_iter()
        .map(|obs| {
            let matched = matcher
                .map(|m| m.query(&obs.descriptor))
                .unwrap_or_else(MatchResult::unknown);
            AnnotatedFace {
                bbox: obs.bbox.rescale(intrinsic, display),
                label: classify(&matched, obs.expressions.as_ref(), thresholds),
                matched,
            }
        })
        .collect()
}

/// Per-run state of the annotation loop.
pub struct FrameLoop {
    perception: Arc<dyn Perception>,
    models: Arc<ModelSet>,
    matchers: Arc<MatcherCache>,
    thresholds: Thresholds,
    stats: Arc<FrameStats>,
    observer: Option<Arc<dyn FrameObserver>>,
}

impl FrameLoop {
    pub fn new(
        perception: Arc<dyn Perception>,
        models: Arc<ModelSet>,
        matchers: Arc<MatcherCache>,
        thresholds: Thresholds,
        stats: Arc<FrameStats>,
    ) -> Self {
        Self {
            perception,
            models,
            matchers,
            thresholds,
            stats,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Option<Arc<dyn FrameObserver>>) -> Self {
        self.observer = observer;
        self
    }

    /// Run until stopped or until the source ends, then hand the resources back.
    pub async fn run(
        self,
        mut source: Box<dyn VideoSource>,
        mut surface: Box<dyn Surface>,
        mut clock: Box<dyn FrameClock>,
        mut stop: watch::Receiver<bool>,
    ) -> LoopOutcome {
        self.stats.set_phase(LoopPhase::Idle);
        tracing::info!("frame loop started");

        let exit = loop {
            // Checked before every reschedule.
            if *stop.borrow_and_update() {
                break LoopExit::Cancelled;
            }

            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() {
                        break LoopExit::Cancelled;
                    }
                    continue;
                }
                _ = clock.tick() => {}
            }

            self.stats.set_phase(LoopPhase::Capturing);
            let frame = match source.next_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => break LoopExit::SourceEnded,
                Err(e) => {
                    self.record_failure(&DetectionError::from(e));
                    continue;
                }
            };

            if let Err(e) = self.iterate(&frame, surface.as_mut()).await {
                self.record_failure(&e);
            }
        };

        self.stats.set_phase(LoopPhase::Stopped);
        tracing::info!(
            exit = ?exit,
            iterations = self.stats.iterations(),
            failures = self.stats.failures(),
            "frame loop stopped"
        );
        LoopOutcome { exit, source, surface }
    }

    /// Detect, match, classify and render one frame.
    pub async fn iterate(&self, frame: &Frame, surface: &mut dyn Surface) -> Result<Vec<AnnotatedFace>, DetectionError> {
        let observations = self
            .perception
            .detect(&self.models, frame, self.thresholds.min_confidence)
            .await?;

        let matcher = if observations.is_empty() {
            None
        } else {
            Some(self.matchers.get_or_build(&self.models).await)
        };

        let faces = annotate(
            observations,
            matcher.as_deref(),
            frame.geometry(),
            surface.dimensions(),
            &self.thresholds,
        );

        self.stats.set_phase(LoopPhase::Rendering);
        render(surface, &faces);

        self.stats.iterations.fetch_add(1, Ordering::SeqCst);
        self.stats.faces.fetch_add(faces.len() as u64, Ordering::SeqCst);
        tracing::trace!(sequence = frame.sequence, faces = faces.len(), "frame rendered");

        if let Some(observer) = &self.observer {
            observer.on_rendered(frame, &faces, surface);
        }
        Ok(faces)
    }

    fn record_failure(&self, error: &DetectionError) {
        let failures = self.stats.failures.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::warn!(error = %error, failures, "frame iteration failed; continuing");
    }
}
