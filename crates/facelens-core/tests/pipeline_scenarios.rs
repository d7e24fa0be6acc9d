//! End-to-end pipeline behaviour with in-memory camera, perception and fetcher.

use async_trait::async_trait;
use facelens_core::capture::{CameraCapability, CameraError, CaptureSession, Track, VideoSource};
use facelens_core::fetch::{FetchError, Fetcher};
use facelens_core::frame_loop::{FrameClock, FrameObserver, LoopExit};
use facelens_core::models::{ModelLoadError, ModelRegistry, ModelSet};
use facelens_core::perception::{Perception, PerceptionError};
use facelens_core::pipeline::{Pipeline, PipelineDeps, PipelineError, PipelineState};
use facelens_core::raster::RasterSurface;
use facelens_core::surface::{Surface, SurfacePool};
use facelens_core::types::{
    AnnotatedFace, BoundingBox, Descriptor, ExpressionScores, FaceLabel, FaceObservation, Frame, Geometry,
};
use facelens_core::PipelineConfig;
use image::{GrayImage, Luma};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const FRAME_W: u32 = 8;
const FRAME_H: u32 = 6;
/// Pixel value the perception double refuses to process.
const POISON: u8 = 13;
const ALICE: u8 = 100;

// ---- perception ---------------------------------------------------------

/// Reads identity from pixel 0 (descriptor = value / 100) and the "happy"
/// score from pixel 1 (value / 100). A zero pixel means "no face".
#[derive(Default)]
struct PixelPerception {
    windows: Mutex<Vec<(Instant, Instant)>>,
}

#[async_trait]
impl Perception for PixelPerception {
    fn required_artifacts(&self) -> Vec<String> {
        vec!["det.onnx".into(), "rec.onnx".into()]
    }

    async fn detect(&self, models: &ModelSet, frame: &Frame, _: f32) -> Result<Vec<FaceObservation>, PerceptionError> {
        let entered = Instant::now();
        assert!(models.artifact("det.onnx").is_some());
        tokio::time::sleep(Duration::from_millis(2)).await;

        let identity = frame.data[0];
        let smile = frame.data[1];
        let result = match identity {
            0 => Ok(vec![]),
            POISON => Err(PerceptionError::Inference("poisoned frame".into())),
            v => Ok(vec![FaceObservation {
                bbox: BoundingBox {
                    x: 1.0,
                    y: 1.0,
                    width: 4.0,
                    height: 3.0,
                    confidence: 0.99,
                    landmarks: None,
                },
                descriptor: Descriptor::new(vec![v as f32 / 100.0]),
                expressions: Some([("happy", smile as f32 / 100.0)].into_iter().collect::<ExpressionScores>()),
            }]),
        };
        self.windows.lock().unwrap().push((entered, Instant::now()));
        result
    }
}

// ---- fetcher ------------------------------------------------------------

#[derive(Default)]
struct MemoryFetcher {
    files: HashMap<String, Vec<u8>>,
    hits: Mutex<HashMap<String, usize>>,
}

impl MemoryFetcher {
    fn with(mut self, locator: &str, bytes: Vec<u8>) -> Self {
        self.files.insert(locator.into(), bytes);
        self
    }

    fn hits(&self, locator: &str) -> usize {
        self.hits.lock().unwrap().get(locator).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Fetcher for MemoryFetcher {
    async fn fetch(&self, locator: &str) -> Result<Vec<u8>, FetchError> {
        *self.hits.lock().unwrap().entry(locator.into()).or_default() += 1;
        self.files
            .get(locator)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(locator.into()))
    }
}

fn reference_png(value: u8) -> Vec<u8> {
    let img = GrayImage::from_pixel(FRAME_W, FRAME_H, Luma([value]));
    let mut png = Vec::new();
    img.write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png).unwrap();
    png
}

/// Models plus alice's reference; bob has none.
fn standard_fetcher() -> Arc<MemoryFetcher> {
    Arc::new(
        MemoryFetcher::default()
            .with("models/det.onnx", vec![1; 16])
            .with("models/rec.onnx", vec![2; 16])
            .with("refs/alice.png", reference_png(ALICE)),
    )
}

// ---- camera -------------------------------------------------------------

/// What the scripted source shows: (identity pixel, smile pixel).
type Scene = Arc<Mutex<(u8, u8)>>;

struct FlagTrack {
    label: String,
    stopped: Arc<AtomicBool>,
}

#[async_trait]
impl Track for FlagTrack {
    fn label(&self) -> &str {
        &self.label
    }

    async fn stop(&mut self) -> Result<(), CameraError> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// (sequence of the frame about to be produced, when `next_frame` was entered)
type CaptureLog = Arc<Mutex<Vec<(u32, Instant)>>>;

struct SceneSource {
    scene: Scene,
    sequence: u32,
    remaining: Option<usize>,
    captures: CaptureLog,
}

#[async_trait]
impl VideoSource for SceneSource {
    async fn ready(&mut self) -> Result<Geometry, CameraError> {
        Ok(Geometry::new(FRAME_W, FRAME_H))
    }

    async fn next_frame(&mut self) -> Result<Option<Frame>, CameraError> {
        self.captures.lock().unwrap().push((self.sequence + 1, Instant::now()));
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                return Ok(None);
            }
            *remaining -= 1;
        }
        let (identity, smile) = *self.scene.lock().unwrap();
        let mut data = vec![identity; (FRAME_W * FRAME_H) as usize];
        data[1] = smile;
        self.sequence += 1;
        Ok(Some(Frame {
            data,
            width: FRAME_W,
            height: FRAME_H,
            sequence: self.sequence,
            timestamp: Instant::now(),
        }))
    }
}

struct SceneCamera {
    scene: Scene,
    tracks: usize,
    frame_limit: Option<usize>,
    opens: AtomicUsize,
    stopped: Mutex<Vec<Arc<AtomicBool>>>,
    captures: CaptureLog,
}

impl SceneCamera {
    fn new(tracks: usize) -> Self {
        Self {
            scene: Arc::new(Mutex::new((0, 0))),
            tracks,
            frame_limit: None,
            opens: AtomicUsize::new(0),
            stopped: Mutex::new(Vec::new()),
            captures: CaptureLog::default(),
        }
    }

    fn show(&self, identity: u8, smile: u8) {
        *self.scene.lock().unwrap() = (identity, smile);
    }

    fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn all_tracks_stopped(&self) -> bool {
        let stopped = self.stopped.lock().unwrap();
        !stopped.is_empty() && stopped.iter().all(|f| f.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl CameraCapability for SceneCamera {
    async fn open(&self, source_id: &str) -> Result<CaptureSession, CameraError> {
        if source_id != "/dev/video0" {
            return Err(CameraError::DeviceNotFound(source_id.into()));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        let mut flags = self.stopped.lock().unwrap();
        let tracks = (0..self.tracks)
            .map(|i| {
                let stopped = Arc::new(AtomicBool::new(false));
                flags.push(stopped.clone());
                Box::new(FlagTrack {
                    label: format!("video{i}"),
                    stopped,
                }) as Box<dyn Track>
            })
            .collect();
        Ok(CaptureSession {
            tracks,
            source: Box::new(SceneSource {
                scene: self.scene.clone(),
                sequence: 0,
                remaining: self.frame_limit,
                captures: self.captures.clone(),
            }),
        })
    }
}

// ---- clock and observer -------------------------------------------------

struct FastClock {
    ticks: Arc<AtomicUsize>,
}

#[async_trait]
impl FrameClock for FastClock {
    async fn tick(&mut self) {
        self.ticks.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

#[derive(Default)]
struct Recorder {
    labels: Mutex<Vec<FaceLabel>>,
    surface_ids: Mutex<Vec<u64>>,
    /// (frame sequence, when rendering finished)
    renders: Mutex<Vec<(u32, Instant)>>,
}

impl Recorder {
    fn last_label(&self) -> Option<FaceLabel> {
        self.labels.lock().unwrap().last().copied()
    }

    fn clear(&self) {
        self.labels.lock().unwrap().clear();
    }
}

impl FrameObserver for Recorder {
    fn on_rendered(&self, frame: &Frame, faces: &[AnnotatedFace], surface: &dyn Surface) {
        self.labels.lock().unwrap().extend(faces.iter().map(|f| f.label));
        self.surface_ids.lock().unwrap().push(surface.id());
        self.renders.lock().unwrap().push((frame.sequence, Instant::now()));
    }
}

// ---- harness ------------------------------------------------------------

struct Harness {
    camera: Arc<SceneCamera>,
    perception: Arc<PixelPerception>,
    fetcher: Arc<MemoryFetcher>,
    pool: Arc<SurfacePool>,
    recorder: Arc<Recorder>,
    ticks: Arc<AtomicUsize>,
    registry: &'static ModelRegistry,
}

impl Harness {
    fn new(camera: SceneCamera, fetcher: Arc<MemoryFetcher>) -> Self {
        Self {
            camera: Arc::new(camera),
            perception: Arc::new(PixelPerception::default()),
            fetcher,
            pool: Arc::new(SurfacePool::new(|| Box::new(RasterSurface::new()) as Box<dyn Surface>)),
            recorder: Arc::new(Recorder::default()),
            ticks: Arc::new(AtomicUsize::new(0)),
            registry: Box::leak(Box::new(ModelRegistry::new())),
        }
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            model_source: "models".into(),
            video_source: "/dev/video0".into(),
            enrollment_labels: vec!["alice".into(), "bob".into()],
            reference_base: "refs".into(),
            reference_extension: "png".into(),
            min_confidence: 0.5,
            distance_threshold: 0.5,
            smile_threshold: 0.5,
            display: None,
            refresh_hz: 1000.0,
        }
    }

    fn pipeline(&self, config: PipelineConfig) -> Pipeline {
        let ticks = self.ticks.clone();
        let deps = PipelineDeps::new(
            self.camera.clone(),
            self.perception.clone(),
            self.fetcher.clone(),
            self.pool.clone(),
        )
        .with_registry(self.registry)
        .with_clock(move || Box::new(FastClock { ticks: ticks.clone() }) as Box<dyn FrameClock>)
        .with_observer(self.recorder.clone());
        Pipeline::new(config, deps).unwrap()
    }
}

async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

// ---- scenarios ----------------------------------------------------------

#[tokio::test]
async fn test_known_smiling_face_with_partial_gallery() {
    let h = Harness::new(SceneCamera::new(1), standard_fetcher());
    let mut pipeline = h.pipeline(Harness::config());
    h.camera.show(120, 90);

    pipeline.start().await.unwrap();
    eventually("a labelled face", || h.recorder.last_label().is_some()).await;
    pipeline.stop().await;

    assert_eq!(h.recorder.last_label(), Some(FaceLabel::KnownSmiling));
    let gallery = pipeline.gallery().await;
    assert_eq!(gallery.labels().collect::<Vec<_>>(), vec!["alice"]);
    assert_eq!(gallery.get("alice").unwrap(), &[Descriptor::new(vec![1.0])]);
}

#[tokio::test]
async fn test_distant_frowning_face_is_unknown() {
    let h = Harness::new(SceneCamera::new(1), standard_fetcher());
    let mut pipeline = h.pipeline(Harness::config());
    h.camera.show(160, 10);

    pipeline.start().await.unwrap();
    eventually("a labelled face", || h.recorder.last_label().is_some()).await;
    pipeline.stop().await;

    assert_eq!(h.recorder.last_label(), Some(FaceLabel::UnknownNotSmiling));
}

#[tokio::test]
async fn test_stop_releases_everything_and_restart_reuses_gallery() {
    let h = Harness::new(SceneCamera::new(2), standard_fetcher());
    let mut pipeline = h.pipeline(Harness::config());
    let stats = pipeline.stats();
    h.camera.show(120, 90);

    pipeline.start().await.unwrap();
    eventually("two iterations", || stats.iterations() >= 2).await;
    assert!(pipeline.matchers().is_cached());
    assert_eq!(h.pool.len(), 0);

    pipeline.stop().await;
    assert_eq!(pipeline.state(), PipelineState::Stopped);
    assert!(h.camera.all_tracks_stopped());
    assert_eq!(h.pool.len(), 1);
    assert!(!pipeline.matchers().is_cached());

    let stopped_at = stats.iterations();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(stats.iterations(), stopped_at, "loop kept running after stop");

    pipeline.start().await.unwrap();
    eventually("iterations after restart", || stats.iterations() >= stopped_at + 2).await;
    pipeline.stop().await;

    assert_eq!(h.camera.opens(), 2);
    assert_eq!(pipeline.matchers().builds(), 2);
    assert_eq!(pipeline.matchers().gallery_builds(), 1);
    assert_eq!(h.fetcher.hits("refs/alice.png"), 1);
    // bob is retried only when the gallery is empty, which it no longer is
    assert_eq!(h.fetcher.hits("refs/bob.png"), 1);
}

#[tokio::test]
async fn test_second_start_reuses_pooled_surface() {
    let h = Harness::new(SceneCamera::new(1), standard_fetcher());
    let mut pipeline = h.pipeline(Harness::config());
    let stats = pipeline.stats();
    h.camera.show(120, 90);

    pipeline.start().await.unwrap();
    eventually("first run", || stats.iterations() >= 1).await;
    pipeline.stop().await;
    let first = *h.recorder.surface_ids.lock().unwrap().last().unwrap();

    pipeline.start().await.unwrap();
    eventually("second run", || stats.iterations() >= 3).await;
    pipeline.stop().await;
    let second = *h.recorder.surface_ids.lock().unwrap().last().unwrap();

    assert_eq!(first, second);
    assert_eq!(h.pool.created(), 1);
    assert_eq!(h.pool.len(), 1);
}

#[tokio::test]
async fn test_iterations_never_overlap() {
    let h = Harness::new(SceneCamera::new(1), standard_fetcher());
    let mut pipeline = h.pipeline(Harness::config());
    let stats = pipeline.stats();
    h.camera.show(120, 90);

    pipeline.start().await.unwrap();
    eventually("ten iterations", || stats.iterations() >= 10).await;
    pipeline.stop().await;

    let windows = h.perception.windows.lock().unwrap().clone();
    assert!(windows.len() >= 10);
    for pair in windows.windows(2) {
        assert!(pair[1].0 >= pair[0].1, "detect calls overlapped");
    }

    // The capture of frame i+1 starts only after frame i has been rendered.
    let captures: HashMap<u32, Instant> = h.camera.captures.lock().unwrap().iter().copied().collect();
    let renders = h.recorder.renders.lock().unwrap().clone();
    assert!(renders.len() >= 10);
    let mut checked = 0;
    for (sequence, rendered_at) in renders {
        if let Some(next_capture) = captures.get(&(sequence + 1)) {
            assert!(*next_capture >= rendered_at, "frame {} captured before frame {sequence} rendered", sequence + 1);
            checked += 1;
        }
    }
    assert!(checked >= 9);
}

#[tokio::test]
async fn test_failed_frame_does_not_stop_loop() {
    let h = Harness::new(SceneCamera::new(1), standard_fetcher());
    let mut pipeline = h.pipeline(Harness::config());
    let stats = pipeline.stats();
    h.camera.show(POISON, 0);

    pipeline.start().await.unwrap();
    eventually("failures", || stats.failures() >= 3).await;
    assert_eq!(stats.iterations(), 0);

    h.camera.show(120, 90);
    eventually("recovery", || stats.iterations() >= 1).await;
    assert_eq!(pipeline.state(), PipelineState::Running);
    pipeline.stop().await;

    assert_eq!(h.recorder.last_label(), Some(FaceLabel::KnownSmiling));
}

#[tokio::test]
async fn test_no_detections_skip_matcher_build() {
    let h = Harness::new(SceneCamera::new(1), standard_fetcher());
    let mut pipeline = h.pipeline(Harness::config());
    let stats = pipeline.stats();

    pipeline.start().await.unwrap();
    eventually("empty iterations", || stats.iterations() >= 3).await;
    pipeline.stop().await;

    assert_eq!(pipeline.matchers().builds(), 0);
    assert_eq!(h.fetcher.hits("refs/alice.png"), 0);
    assert!(h.recorder.last_label().is_none());
}

#[tokio::test]
async fn test_pause_keeps_stream_and_resumes() {
    let h = Harness::new(SceneCamera::new(1), standard_fetcher());
    let mut pipeline = h.pipeline(Harness::config());
    let stats = pipeline.stats();
    h.camera.show(160, 10);

    pipeline.start().await.unwrap();
    eventually("first run", || stats.iterations() >= 1).await;
    pipeline.pause().await;

    assert_eq!(pipeline.state(), PipelineState::Ready);
    assert!(!h.camera.all_tracks_stopped());
    assert_eq!(pipeline.stream_geometry(), Some(Geometry::new(FRAME_W, FRAME_H)));

    h.recorder.clear();
    h.camera.show(120, 90);
    pipeline.start().await.unwrap();
    eventually("resumed", || h.recorder.last_label().is_some()).await;
    pipeline.stop().await;

    assert_eq!(h.camera.opens(), 1);
    assert_eq!(h.recorder.last_label(), Some(FaceLabel::KnownSmiling));
}

#[tokio::test]
async fn test_start_is_noop_while_running() {
    let h = Harness::new(SceneCamera::new(1), standard_fetcher());
    let mut pipeline = h.pipeline(Harness::config());

    pipeline.start().await.unwrap();
    pipeline.start().await.unwrap();
    assert_eq!(pipeline.state(), PipelineState::Running);
    pipeline.stop().await;
    pipeline.stop().await;

    assert_eq!(h.camera.opens(), 1);
    assert_eq!(pipeline.state(), PipelineState::Stopped);
}

#[tokio::test]
async fn test_source_end_stops_pipeline() {
    let mut camera = SceneCamera::new(1);
    camera.frame_limit = Some(3);
    let h = Harness::new(camera, standard_fetcher());
    let mut pipeline = h.pipeline(Harness::config());
    h.camera.show(120, 90);

    pipeline.start().await.unwrap();
    let exit = tokio::time::timeout(Duration::from_secs(5), pipeline.wait()).await.unwrap();

    assert_eq!(exit, Some(LoopExit::SourceEnded));
    assert_eq!(pipeline.state(), PipelineState::Stopped);
    assert_eq!(pipeline.stats().iterations(), 3);
    assert!(h.camera.all_tracks_stopped());
    assert_eq!(h.pool.len(), 1);
}

#[tokio::test]
async fn test_missing_artifact_fails_start_and_is_cached() {
    let fetcher = Arc::new(MemoryFetcher::default().with("models/det.onnx", vec![1; 4]));
    let h = Harness::new(SceneCamera::new(1), fetcher);

    let mut first = h.pipeline(Harness::config());
    let err = first.start().await.unwrap_err();
    assert!(matches!(err, PipelineError::ModelLoad(_)));
    assert!(err.to_string().contains("rec.onnx"));
    assert_eq!(first.state(), PipelineState::Uninitialized);

    let mut second = h.pipeline(Harness::config());
    assert!(matches!(second.start().await, Err(PipelineError::ModelLoad(_))));

    assert_eq!(h.fetcher.hits("models/rec.onnx"), 1);
    assert_eq!(h.camera.opens(), 0);
}

#[tokio::test]
async fn test_start_rejects_model_set_missing_required_artifacts() {
    let h = Harness::new(SceneCamera::new(1), standard_fetcher());
    // Another user of the registry loaded the same locator with fewer artifacts.
    h.registry
        .load("models", &["det.onnx".to_string()], h.fetcher.as_ref())
        .await
        .unwrap();

    let mut pipeline = h.pipeline(Harness::config());
    let err = pipeline.start().await.unwrap_err();

    match &err {
        PipelineError::ModelLoad(ModelLoadError::MissingArtifacts { missing, .. }) => {
            assert_eq!(missing, &vec!["rec.onnx".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(pipeline.state(), PipelineState::Uninitialized);
    assert_eq!(h.camera.opens(), 0);
    assert_eq!(h.ticks.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_dropping_running_pipeline_releases_camera_and_surface() {
    let h = Harness::new(SceneCamera::new(2), standard_fetcher());
    let mut pipeline = h.pipeline(Harness::config());
    let stats = pipeline.stats();
    h.camera.show(120, 90);

    pipeline.start().await.unwrap();
    eventually("two iterations", || stats.iterations() >= 2).await;
    drop(pipeline);

    eventually("tracks stopped", || h.camera.all_tracks_stopped()).await;
    eventually("surface pooled", || h.pool.len() == 1).await;
    let stopped_at = stats.iterations();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(stats.iterations(), stopped_at);
}

#[tokio::test]
async fn test_dropping_paused_pipeline_releases_camera() {
    let h = Harness::new(SceneCamera::new(1), standard_fetcher());
    let mut pipeline = h.pipeline(Harness::config());

    pipeline.start().await.unwrap();
    pipeline.pause().await;
    assert!(!h.camera.all_tracks_stopped());
    drop(pipeline);

    eventually("tracks stopped", || h.camera.all_tracks_stopped()).await;
    eventually("surface pooled", || h.pool.len() == 1).await;
}

#[tokio::test]
async fn test_camera_failure_fails_start() {
    let h = Harness::new(SceneCamera::new(1), standard_fetcher());
    let config = PipelineConfig {
        video_source: "/dev/video9".into(),
        ..Harness::config()
    };
    let mut pipeline = h.pipeline(config);

    let err = pipeline.start().await.unwrap_err();
    assert!(matches!(err, PipelineError::Camera(CameraError::DeviceNotFound(_))));
    assert_eq!(h.pool.created(), 0);
    assert_eq!(h.ticks.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let h = Harness::new(SceneCamera::new(1), standard_fetcher());
    let deps = PipelineDeps::new(h.camera.clone(), h.perception.clone(), h.fetcher.clone(), h.pool.clone());
    let config = PipelineConfig {
        smile_threshold: 2.0,
        ..Harness::config()
    };
    assert!(matches!(Pipeline::new(config, deps), Err(PipelineError::Config(_))));
}

#[tokio::test]
async fn test_display_geometry_scales_boxes() {
    let h = Harness::new(SceneCamera::new(1), standard_fetcher());
    let config = PipelineConfig {
        display: Some(Geometry::new(FRAME_W * 10, FRAME_H * 10)),
        ..Harness::config()
    };
    let mut pipeline = h.pipeline(config);
    let stats = pipeline.stats();
    h.camera.show(120, 90);

    pipeline.start().await.unwrap();
    eventually("an iteration", || stats.iterations() >= 1).await;
    pipeline.stop().await;

    let surface = h.pool.acquire();
    assert_eq!(surface.dimensions(), Geometry::new(80, 60));
    // box at (1,1) in frame space lands at (10,10) on the display
    let pixels = surface.snapshot().unwrap();
    assert_ne!(pixels.get_pixel(10, 10).0[3], 0);
}
