//! ArcFace (w600k_r50) identity descriptors from square face crops.

use crate::preprocess::{l2_normalize, square_crop, to_tensor};
use crate::InferError;
use facelens_core::types::{BoundingBox, Descriptor};
use image::GrayImage;
use ort::session::Session;
use ort::value::TensorRef;

const INPUT_SIZE: u32 = 112;
const MEAN: f32 = 127.5;
// ArcFace normalises symmetrically, unlike SCRFD's 128.0.
const STD: f32 = 127.5;
pub const DESCRIPTOR_DIM: usize = 512;

pub struct ArcFaceEmbedder {
    session: Session,
}

impl ArcFaceEmbedder {
    pub fn from_bytes(model: &[u8]) -> Result<Self, InferError> {
        let session = Session::builder()?.with_intra_threads(2)?.commit_from_memory(model)?;
        tracing::info!(
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            "loaded ArcFace embedder"
        );
        Ok(Self { session })
    }

    /// L2-normalised descriptor for the face inside `bbox`.
    pub fn embed(&mut self, img: &GrayImage, bbox: &BoundingBox) -> Result<Descriptor, InferError> {
        let crop = square_crop(img, bbox, INPUT_SIZE);
        let input = to_tensor(&crop, MEAN, STD, 3);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0].try_extract_tensor::<f32>()?;
        if raw.len() != DESCRIPTOR_DIM {
            return Err(InferError::Model {
                model: "arcface",
                reason: format!("expected a {DESCRIPTOR_DIM}-dim embedding, got {}", raw.len()),
            });
        }

        let mut values = raw.to_vec();
        l2_normalize(&mut values);
        Ok(Descriptor::new(values))
    }
}
