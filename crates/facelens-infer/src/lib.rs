//! facelens-infer — ONNX Runtime perception for the facelens pipeline.
//!
//! `OnnxPerception` implements `facelens_core::Perception` with SCRFD for
//! detection, ArcFace for identity descriptors and, optionally, FER+ for
//! expression scores. Sessions are built from the artifact bytes held by the
//! `ModelSet` the first time a model set is seen, and inference runs on the
//! blocking pool.

pub mod arcface;
pub mod expression;
pub mod preprocess;
pub mod scrfd;

use arcface::ArcFaceEmbedder;
use async_trait::async_trait;
use expression::FerPlusClassifier;
use facelens_core::models::ModelSet;
use facelens_core::perception::{Perception, PerceptionError};
use facelens_core::types::{FaceObservation, Frame};
use scrfd::ScrfdDetector;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

pub const DETECTOR_ARTIFACT: &str = "det_10g.onnx";
pub const EMBEDDER_ARTIFACT: &str = "w600k_r50.onnx";
pub const EXPRESSION_ARTIFACT: &str = "emotion-ferplus-8.onnx";

#[derive(Error, Debug)]
pub enum InferError {
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
    #[error("{model} model: {reason}")]
    Model { model: &'static str, reason: String },
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

impl From<InferError> for PerceptionError {
    fn from(e: InferError) -> Self {
        match e {
            InferError::InvalidFrame(msg) => PerceptionError::InvalidInput(msg),
            other => PerceptionError::Inference(other.to_string()),
        }
    }
}

struct Sessions {
    locator: String,
    detector: ScrfdDetector,
    embedder: ArcFaceEmbedder,
    expressions: Option<FerPlusClassifier>,
}

/// Artifact bytes copied out of a model set for session construction.
struct SessionSource {
    locator: String,
    detector: Vec<u8>,
    embedder: Vec<u8>,
    expressions: Option<Vec<u8>>,
}

impl Sessions {
    fn build(source: SessionSource) -> Result<Self, InferError> {
        let sessions = Self {
            detector: ScrfdDetector::from_bytes(&source.detector)?,
            embedder: ArcFaceEmbedder::from_bytes(&source.embedder)?,
            expressions: source
                .expressions
                .as_deref()
                .map(FerPlusClassifier::from_bytes)
                .transpose()?,
            locator: source.locator,
        };
        tracing::info!(
            locator = %sessions.locator,
            expressions = sessions.expressions.is_some(),
            "inference sessions ready"
        );
        Ok(sessions)
    }

    fn observe(&mut self, frame: &Frame, min_confidence: f32) -> Result<Vec<FaceObservation>, InferError> {
        let img = preprocess::gray_image(frame)?;
        let faces = self.detector.detect(&img, min_confidence)?;

        let mut observations = Vec::with_capacity(faces.len());
        for bbox in faces {
            let descriptor = self.embedder.embed(&img, &bbox)?;
            let expressions = match &mut self.expressions {
                Some(classifier) => Some(classifier.score(&img, &bbox)?),
                None => None,
            };
            observations.push(FaceObservation {
                bbox,
                descriptor,
                expressions,
            });
        }
        Ok(observations)
    }
}

/// SCRFD + ArcFace (+ FER+) perception.
pub struct OnnxPerception {
    with_expressions: bool,
    sessions: Arc<Mutex<Option<Sessions>>>,
}

impl Default for OnnxPerception {
    fn default() -> Self {
        Self::new(true)
    }
}

impl OnnxPerception {
    /// With `with_expressions` false, observations carry no expression scores
    /// and no face is ever classified as smiling.
    pub fn new(with_expressions: bool) -> Self {
        Self {
            with_expressions,
            sessions: Arc::new(Mutex::new(None)),
        }
    }

    fn session_source(&self, models: &ModelSet) -> Result<SessionSource, PerceptionError> {
        let artifact = |name: &str| {
            models
                .artifact(name)
                .map(<[u8]>::to_vec)
                .ok_or_else(|| PerceptionError::MissingArtifact {
                    locator: models.locator().to_string(),
                    artifact: name.to_string(),
                })
        };
        Ok(SessionSource {
            locator: models.locator().to_string(),
            detector: artifact(DETECTOR_ARTIFACT)?,
            embedder: artifact(EMBEDDER_ARTIFACT)?,
            expressions: if self.with_expressions {
                Some(artifact(EXPRESSION_ARTIFACT)?)
            } else {
                None
            },
        })
    }
}

#[async_trait]
impl Perception for OnnxPerception {
    fn required_artifacts(&self) -> Vec<String> {
        let mut names = vec![DETECTOR_ARTIFACT.to_string(), EMBEDDER_ARTIFACT.to_string()];
        if self.with_expressions {
            names.push(EXPRESSION_ARTIFACT.to_string());
        }
        names
    }

    async fn detect(
        &self,
        models: &ModelSet,
        frame: &Frame,
        min_confidence: f32,
    ) -> Result<Vec<FaceObservation>, PerceptionError> {
        let rebuild = {
            let guard = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
            match guard.as_ref() {
                Some(s) if s.locator == models.locator() => None,
                _ => Some(self.session_source(models)?),
            }
        };

        let sessions = self.sessions.clone();
        let frame = frame.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut guard = sessions.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(source) = rebuild {
                *guard = Some(Sessions::build(source)?);
            }
            match guard.as_mut() {
                Some(sessions) => sessions.observe(&frame, min_confidence),
                None => Err(InferError::Model {
                    model: "scrfd",
                    reason: "sessions not initialised".into(),
                }),
            }
        })
        .await
        .map_err(|e| PerceptionError::Inference(format!("inference task failed: {e}")))?;

        Ok(result?)
    }
}
