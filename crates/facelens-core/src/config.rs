use crate::types::Geometry;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be within [0, 1], got {value}")]
    OutOfUnitRange { name: &'static str, value: f32 },
    #[error("distance_threshold must be a non-negative number, got {0}")]
    NegativeDistance(f32),
    #[error("refresh_hz must be positive, got {0}")]
    InvalidRefreshRate(f32),
    #[error("display geometry must be non-zero, got {0}")]
    EmptyDisplay(Geometry),
    #[error("duplicate enrollment label: {0}")]
    DuplicateLabel(String),
    #[error("{0} must not be empty")]
    Missing(&'static str),
}

/// Immutable settings held by one pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Directory or base URL the perception artifacts are fetched from.
    pub model_source: String,
    /// Capture device identifier.
    pub video_source: String,
    /// Identities to enroll, in order.
    pub enrollment_labels: Vec<String>,
    /// Directory or base URL holding `{label}.{reference_extension}` images.
    pub reference_base: String,
    pub reference_extension: String,
    /// Minimum detection confidence in [0, 1].
    pub min_confidence: f32,
    /// Maximum descriptor distance for a known match.
    pub distance_threshold: f32,
    /// Minimum "happy" score in [0, 1] to classify a face as smiling.
    pub smile_threshold: f32,
    /// Overlay surface size. `None` uses the video source's intrinsic size.
    pub display: Option<Geometry>,
    /// Frame clock rate for the annotation loop.
    pub refresh_hz: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model_source: "models".into(),
            video_source: "/dev/video0".into(),
            enrollment_labels: Vec::new(),
            reference_base: "labeled_images".into(),
            reference_extension: "jpg".into(),
            min_confidence: 0.5,
            distance_threshold: 0.6,
            smile_threshold: 0.5,
            display: None,
            refresh_hz: 30.0,
        }
    }
}

impl PipelineConfig {
    /// Check ranges and uniqueness; returns the config unchanged when valid.
    pub fn validated(self) -> Result<Self, ConfigError> {
        for (name, value) in [
            ("min_confidence", self.min_confidence),
            ("smile_threshold", self.smile_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::OutOfUnitRange { name, value });
            }
        }
        if !(self.distance_threshold >= 0.0) {
            return Err(ConfigError::NegativeDistance(self.distance_threshold));
        }
        if !(self.refresh_hz > 0.0) {
            return Err(ConfigError::InvalidRefreshRate(self.refresh_hz));
        }
        if let Some(display) = self.display {
            if display.width == 0 || display.height == 0 {
                return Err(ConfigError::EmptyDisplay(display));
            }
        }
        if self.model_source.is_empty() {
            return Err(ConfigError::Missing("model_source"));
        }
        if self.video_source.is_empty() {
            return Err(ConfigError::Missing("video_source"));
        }
        let mut seen = std::collections::HashSet::new();
        for label in &self.enrollment_labels {
            if !seen.insert(label.as_str()) {
                return Err(ConfigError::DuplicateLabel(label.clone()));
            }
        }
        Ok(self)
    }
}
