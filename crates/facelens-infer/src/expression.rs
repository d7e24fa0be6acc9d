//! FER+ expression scoring (emotion-ferplus-8).
//!
//! The model takes a 64×64 grayscale crop of raw pixel values and emits
//! eight logits; they are softmaxed and keyed by expression name.

use crate::preprocess::{softmax, square_crop, to_tensor};
use crate::InferError;
use facelens_core::types::{BoundingBox, ExpressionScores};
use image::GrayImage;
use ort::session::Session;
use ort::value::TensorRef;

const INPUT_SIZE: u32 = 64;

/// Output order of the FER+ model.
pub const EXPRESSIONS: [&str; 8] = [
    "neutral",
    "happy",
    "surprised",
    "sad",
    "angry",
    "disgusted",
    "fearful",
    "contempt",
];

pub struct FerPlusClassifier {
    session: Session,
}

impl FerPlusClassifier {
    pub fn from_bytes(model: &[u8]) -> Result<Self, InferError> {
        let session = Session::builder()?.with_intra_threads(1)?.commit_from_memory(model)?;
        tracing::info!("loaded FER+ expression classifier");
        Ok(Self { session })
    }

    pub fn score(&mut self, img: &GrayImage, bbox: &BoundingBox) -> Result<ExpressionScores, InferError> {
        let crop = square_crop(img, bbox, INPUT_SIZE);
        let input = to_tensor(&crop, 0.0, 1.0, 1);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, logits) = outputs[0].try_extract_tensor::<f32>()?;
        scores_from_logits(logits)
    }
}

fn scores_from_logits(logits: &[f32]) -> Result<ExpressionScores, InferError> {
    if logits.len() != EXPRESSIONS.len() {
        return Err(InferError::Model {
            model: "ferplus",
            reason: format!("expected {} logits, got {}", EXPRESSIONS.len(), logits.len()),
        });
    }
    Ok(EXPRESSIONS.iter().copied().zip(softmax(logits)).collect())
}
