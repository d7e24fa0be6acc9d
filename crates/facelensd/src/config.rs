use anyhow::{Context, Result};
use facelens_core::types::Geometry;
use facelens_core::PipelineConfig;
use serde::Deserialize;
use std::path::PathBuf;

/// Daemon configuration: an optional TOML file overlaid by `FACELENS_*` variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub pipeline: PipelineConfig,
    /// Requested capture resolution.
    pub camera_width: u32,
    pub camera_height: u32,
    /// Drop near-black frames before inference.
    pub skip_dark_frames: bool,
    /// Load the FER+ model and score expressions.
    pub expressions: bool,
    /// Seconds between status log lines.
    pub status_interval_secs: u64,
    /// Where to write the rendered overlay as PNG, if anywhere.
    pub snapshot_path: Option<PathBuf>,
    /// Minimum milliseconds between snapshot writes.
    pub snapshot_interval_ms: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    pipeline: PipelineConfig,
    camera: CameraSection,
    daemon: DaemonSection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct CameraSection {
    width: u32,
    height: u32,
    skip_dark_frames: bool,
}

impl Default for CameraSection {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            skip_dark_frames: false,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct DaemonSection {
    expressions: bool,
    status_interval_secs: u64,
    snapshot_path: Option<PathBuf>,
    snapshot_interval_ms: u64,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            expressions: true,
            status_interval_secs: 10,
            snapshot_path: None,
            snapshot_interval_ms: 1000,
        }
    }
}

impl Config {
    /// Load from `FACELENS_CONFIG` (if set) and the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `var` to resolve variables.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let file = match var("FACELENS_CONFIG") {
            Some(path) => {
                let text = std::fs::read_to_string(&path).with_context(|| format!("reading config file {path}"))?;
                toml::from_str::<FileConfig>(&text).with_context(|| format!("parsing config file {path}"))?
            }
            None => FileConfig::default(),
        };

        let mut p = file.pipeline;
        if let Some(v) = var("FACELENS_MODEL_SOURCE") {
            p.model_source = v;
        }
        if let Some(v) = var("FACELENS_VIDEO_SOURCE") {
            p.video_source = v;
        }
        if let Some(v) = var("FACELENS_LABELS") {
            p.enrollment_labels = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = var("FACELENS_REFERENCE_BASE") {
            p.reference_base = v;
        }
        if let Some(v) = var("FACELENS_REFERENCE_EXT") {
            p.reference_extension = v;
        }
        p.min_confidence = env_f32(&var, "FACELENS_MIN_CONFIDENCE", p.min_confidence);
        p.distance_threshold = env_f32(&var, "FACELENS_DISTANCE_THRESHOLD", p.distance_threshold);
        p.smile_threshold = env_f32(&var, "FACELENS_SMILE_THRESHOLD", p.smile_threshold);
        p.refresh_hz = env_f32(&var, "FACELENS_REFRESH_HZ", p.refresh_hz);
        if let Some(v) = var("FACELENS_DISPLAY") {
            p.display = Some(parse_geometry(&v).with_context(|| format!("FACELENS_DISPLAY={v}"))?);
        }

        let config = Self {
            pipeline: p.validated()?,
            camera_width: env_u32(&var, "FACELENS_CAMERA_WIDTH", file.camera.width),
            camera_height: env_u32(&var, "FACELENS_CAMERA_HEIGHT", file.camera.height),
            skip_dark_frames: env_bool(&var, "FACELENS_SKIP_DARK_FRAMES", file.camera.skip_dark_frames),
            expressions: env_bool(&var, "FACELENS_EXPRESSIONS", file.daemon.expressions),
            status_interval_secs: env_u64(&var, "FACELENS_STATUS_INTERVAL_SECS", file.daemon.status_interval_secs),
            snapshot_path: var("FACELENS_SNAPSHOT_PATH")
                .map(PathBuf::from)
                .or(file.daemon.snapshot_path),
            snapshot_interval_ms: env_u64(&var, "FACELENS_SNAPSHOT_INTERVAL_MS", file.daemon.snapshot_interval_ms),
        };
        Ok(config)
    }
}

/// Parse "WIDTHxHEIGHT".
fn parse_geometry(s: &str) -> Result<Geometry> {
    let (w, h) = s
        .split_once(|c: char| c == 'x' || c == 'X')
        .with_context(|| format!("expected WIDTHxHEIGHT, got {s:?}"))?;
    Ok(Geometry::new(w.trim().parse()?, h.trim().parse()?))
}

fn env_f32(var: &impl Fn(&str) -> Option<String>, key: &str, default: f32) -> f32 {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(var: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> u64 {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(var: &impl Fn(&str) -> Option<String>, key: &str, default: u32) -> u32 {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(var: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    var(key).map(|v| v != "0" && !v.eq_ignore_ascii_case("false")).unwrap_or(default)
}
