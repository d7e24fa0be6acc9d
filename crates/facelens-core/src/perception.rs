//! Boundary to the face perception capability (detection, landmarks,
//! descriptors, expression scores).

use crate::models::ModelSet;
use crate::types::{FaceObservation, Frame};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PerceptionError {
    #[error("model artifact missing from {locator}: {artifact}")]
    MissingArtifact { locator: String, artifact: String },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("inference failed: {0}")]
    Inference(String),
}

/// Detects faces and extracts per-face descriptors from a frame.
///
/// Implementations must give the same answer for the same inputs: any caches
/// they keep (sessions, buffers) may not influence results.
#[async_trait]
pub trait Perception: Send + Sync {
    /// Artifact file names this capability needs from the model source.
    fn required_artifacts(&self) -> Vec<String>;

    /// Faces whose detection confidence is at least `min_confidence`,
    /// sorted by descending confidence, in frame coordinates.
    async fn detect(
        &self,
        models: &ModelSet,
        frame: &Frame,
        min_confidence: f32,
    ) -> Result<Vec<FaceObservation>, PerceptionError>;
}

/// Decode an encoded image (JPEG, PNG, ...) into a grayscale frame.
pub fn frame_from_encoded(bytes: &[u8]) -> Result<Frame, image::ImageError> {
    let gray = image::load_from_memory(bytes)?.to_luma8();
    let (width, height) = gray.dimensions();
    Ok(Frame {
        data: gray.into_raw(),
        width,
        height,
        sequence: 0,
        timestamp: std::time::Instant::now(),
    })
}
