use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Expression name whose score decides the smiling classification.
pub const HAPPY_EXPRESSION: &str = "happy";

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Map the box (and its landmarks) from one frame geometry onto another.
    pub fn rescale(&self, from: Geometry, to: Geometry) -> BoundingBox {
        let sx = to.width as f32 / from.width.max(1) as f32;
        let sy = to.height as f32 / from.height.max(1) as f32;
        BoundingBox {
            x: self.x * sx,
            y: self.y * sy,
            width: self.width * sx,
            height: self.height * sy,
            confidence: self.confidence,
            landmarks: self
                .landmarks
                .map(|lms| lms.map(|(lx, ly)| (lx * sx, ly * sy))),
        }
    }
}

/// Pixel dimensions of a frame, video source or surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
}

impl Geometry {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A captured grayscale frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub sequence: u32,
    pub timestamp: std::time::Instant,
}

impl Frame {
    pub fn geometry(&self) -> Geometry {
        Geometry::new(self.width, self.height)
    }
}

/// Face descriptor vector (identity-bearing embedding).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    pub values: Vec<f32>,
}

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Compute Euclidean distance between two descriptors.
    pub fn euclidean_distance(&self, other: &Descriptor) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// Per-expression probabilities keyed by expression name ("happy", "neutral", ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpressionScores(pub BTreeMap<String, f32>);

impl ExpressionScores {
    pub fn score(&self, expression: &str) -> Option<f32> {
        self.0.get(expression).copied()
    }
}

impl<S: Into<String>> FromIterator<(S, f32)> for ExpressionScores {
    fn from_iter<I: IntoIterator<Item = (S, f32)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// One face reported by the perception capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceObservation {
    pub bbox: BoundingBox,
    pub descriptor: Descriptor,
    /// Absent when the capability was not asked for (or could not score) expressions.
    pub expressions: Option<ExpressionScores>,
}

/// Result of matching a probe descriptor against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Enrollment label of the best match, `None` for unknown.
    pub label: Option<String>,
    /// Distance to the best label; infinite when the gallery is empty.
    pub distance: f32,
}

impl MatchResult {
    pub fn unknown() -> Self {
        Self {
            label: None,
            distance: f32::INFINITY,
        }
    }

    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or("unknown")
    }
}

/// The four overlay captions a rendered face can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaceLabel {
    KnownSmiling,
    KnownNotSmiling,
    UnknownSmiling,
    UnknownNotSmiling,
}

impl FaceLabel {
    pub fn classify(known: bool, smiling: bool) -> Self {
        match (known, smiling) {
            (true, true) => FaceLabel::KnownSmiling,
            (true, false) => FaceLabel::KnownNotSmiling,
            (false, true) => FaceLabel::UnknownSmiling,
            (false, false) => FaceLabel::UnknownNotSmiling,
        }
    }

    pub fn is_known(self) -> bool {
        matches!(self, FaceLabel::KnownSmiling | FaceLabel::KnownNotSmiling)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FaceLabel::KnownSmiling => "Known Smiling",
            FaceLabel::KnownNotSmiling => "Known Not Smiling",
            FaceLabel::UnknownSmiling => "Unknown Smiling",
            FaceLabel::UnknownNotSmiling => "Unknown Not Smiling",
        }
    }
}

impl fmt::Display for FaceLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detection in display coordinates, ready to be painted.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotatedFace {
    pub bbox: BoundingBox,
    pub label: FaceLabel,
    pub matched: MatchResult,
}
