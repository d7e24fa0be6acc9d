//! Enrolled gallery (label → reference descriptors) and its incremental builder.

use crate::fetch::{join_locator, FetchError, Fetcher};
use crate::models::ModelSet;
use crate::perception::{frame_from_encoded, Perception, PerceptionError};
use crate::types::Descriptor;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// SHA-256 over the gallery contents; changes whenever the gallery does.
pub type GalleryFingerprint = [u8; 32];

/// Why a single label could not be enrolled.
#[derive(Error, Debug)]
pub enum GalleryFetchError {
    #[error("reference image fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("reference image could not be decoded: {0}")]
    Decode(#[from] image::ImageError),
    #[error("detection failed on reference image: {0}")]
    Detection(#[from] PerceptionError),
    #[error("no face found in reference image {0}")]
    NoFace(String),
}

/// Mapping from enrollment label to its reference descriptors.
#[derive(Debug, Clone)]
pub struct Gallery {
    entries: BTreeMap<String, Vec<Descriptor>>,
    fingerprint: GalleryFingerprint,
}

impl Default for Gallery {
    fn default() -> Self {
        Self::new()
    }
}

impl Gallery {
    pub fn new() -> Self {
        let mut gallery = Self {
            entries: BTreeMap::new(),
            fingerprint: [0; 32],
        };
        gallery.refresh_fingerprint();
        gallery
    }

    /// Store `descriptors` under `label`, replacing any previous entry.
    pub fn insert(&mut self, label: impl Into<String>, descriptors: Vec<Descriptor>) {
        self.entries.insert(label.into(), descriptors);
        self.refresh_fingerprint();
    }

    pub fn remove(&mut self, label: &str) -> Option<Vec<Descriptor>> {
        let removed = self.entries.remove(label);
        if removed.is_some() {
            self.refresh_fingerprint();
        }
        removed
    }

    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            self.entries.clear();
            self.refresh_fingerprint();
        }
    }

    pub fn contains(&self, label: &str) -> bool {
        self.entries.contains_key(label)
    }

    pub fn get(&self, label: &str) -> Option<&[Descriptor]> {
        self.entries.get(label).map(Vec::as_slice)
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Descriptor])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn fingerprint(&self) -> GalleryFingerprint {
        self.fingerprint
    }

    fn refresh_fingerprint(&mut self) {
        let mut hasher = Sha256::new();
        for (label, descriptors) in &self.entries {
            hasher.update((label.len() as u64).to_le_bytes());
            hasher.update(label.as_bytes());
            hasher.update((descriptors.len() as u64).to_le_bytes());
            for d in descriptors {
                hasher.update((d.values.len() as u64).to_le_bytes());
                for v in &d.values {
                    hasher.update(v.to_le_bytes());
                }
            }
        }
        self.fingerprint = hasher.finalize().into();
    }
}

/// Outcome of one build pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GalleryReport {
    /// Labels enrolled by this pass.
    pub added: Vec<String>,
    /// Labels that were already present and left untouched.
    pub cached: Vec<String>,
    /// Labels that could not be enrolled, with the reason.
    pub skipped: Vec<(String, String)>,
}

/// Enrolls labels from reference images found at `{base}/{label}.{ext}`.
pub struct GalleryBuilder {
    fetcher: Arc<dyn Fetcher>,
    perception: Arc<dyn Perception>,
    reference_base: String,
    extension: String,
    min_confidence: f32,
}

impl GalleryBuilder {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        perception: Arc<dyn Perception>,
        reference_base: impl Into<String>,
        extension: impl Into<String>,
        min_confidence: f32,
    ) -> Self {
        Self {
            fetcher,
            perception,
            reference_base: reference_base.into(),
            extension: extension.into(),
            min_confidence,
        }
    }

    /// Locator of the reference image for `label`.
    pub fn reference_locator(&self, label: &str) -> String {
        join_locator(&self.reference_base, &format!("{label}.{}", self.extension))
    }

    /// Enroll every label missing from `gallery`. Per-label failures are
    /// logged and skipped; labels already present are never re-fetched.
    pub async fn build(&self, gallery: &mut Gallery, labels: &[String], models: &ModelSet) -> GalleryReport {
        let mut report = GalleryReport::default();

        for label in labels {
            if gallery.contains(label) {
                report.cached.push(label.clone());
                continue;
            }

            match self.enroll(label, models).await {
                Ok(descriptors) => {
                    tracing::info!(label = %label, faces = descriptors.len(), "label enrolled");
                    gallery.insert(label.clone(), descriptors);
                    report.added.push(label.clone());
                }
                Err(e) => {
                    tracing::warn!(label = %label, error = %e, "skipping label");
                    report.skipped.push((label.clone(), e.to_string()));
                }
            }
        }

        tracing::info!(
            added = report.added.len(),
            cached = report.cached.len(),
            skipped = report.skipped.len(),
            total = gallery.len(),
            "gallery build finished"
        );
        report
    }

    async fn enroll(&self, label: &str, models: &ModelSet) -> Result<Vec<Descriptor>, GalleryFetchError> {
        let locator = self.reference_locator(label);
        let bytes = self.fetcher.fetch(&locator).await?;
        let frame = frame_from_encoded(&bytes)?;
        let faces = self
            .perception
            .detect(models, &frame, self.min_confidence)
            .await?;
        if faces.is_empty() {
            return Err(GalleryFetchError::NoFace(locator));
        }
        Ok(faces.into_iter().map(|f| f.descriptor).collect())
    }
}
