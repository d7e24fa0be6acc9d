//! Immutable gallery matcher and the cache that builds it lazily.

use crate::gallery::{Gallery, GalleryBuilder, GalleryFingerprint, GalleryReport};
use crate::models::ModelSet;
use crate::types::{Descriptor, MatchResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Snapshot of a gallery supporting nearest-label lookup.
///
/// A label's distance to a probe is the mean Euclidean distance to all of its
/// reference descriptors; the closest label wins if it is under the threshold.
#[derive(Debug, Clone)]
pub struct FaceMatcher {
    labeled: Vec<(String, Vec<Descriptor>)>,
    distance_threshold: f32,
}

impl FaceMatcher {
    pub fn new(gallery: &Gallery, distance_threshold: f32) -> Self {
        let labeled = gallery
            .iter()
            .filter(|(_, descriptors)| !descriptors.is_empty())
            .map(|(label, descriptors)| (label.to_string(), descriptors.to_vec()))
            .collect();
        Self {
            labeled,
            distance_threshold,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.labeled.is_empty()
    }

    pub fn distance_threshold(&self) -> f32 {
        self.distance_threshold
    }

    /// Best label for `probe`, or unknown. Never fails, including on an empty gallery.
    pub fn query(&self, probe: &Descriptor) -> MatchResult {
        let mut best: Option<(usize, f32)> = None;

        // Every label is scored; no early exit.
        for (i, (_, descriptors)) in self.labeled.iter().enumerate() {
            let mean = descriptors
                .iter()
                .map(|d| probe.euclidean_distance(d))
                .sum::<f32>()
                / descriptors.len() as f32;
            if best.map_or(true, |(_, d)| mean < d) {
                best = Some((i, mean));
            }
        }

        match best {
            Some((idx, distance)) if distance < self.distance_threshold => MatchResult {
                label: Some(self.labeled[idx].0.clone()),
                distance,
            },
            Some((_, distance)) => MatchResult {
                label: None,
                distance,
            },
            None => MatchResult::unknown(),
        }
    }
}

struct CachedMatcher {
    key: GalleryFingerprint,
    matcher: Arc<FaceMatcher>,
}

/// Owns the gallery and a matcher snapshot keyed by the gallery fingerprint.
///
/// The snapshot is rebuilt whenever the gallery content changes and at most
/// once per gallery version. An empty gallery triggers a build from the
/// configured labels before the snapshot is taken.
pub struct MatcherCache {
    gallery: tokio::sync::Mutex<Gallery>,
    builder: GalleryBuilder,
    labels: Vec<String>,
    distance_threshold: f32,
    cached: Mutex<Option<CachedMatcher>>,
    builds: AtomicUsize,
    gallery_builds: AtomicUsize,
}

impl MatcherCache {
    pub fn new(builder: GalleryBuilder, labels: Vec<String>, distance_threshold: f32) -> Self {
        Self {
            gallery: tokio::sync::Mutex::new(Gallery::new()),
            builder,
            labels,
            distance_threshold,
            cached: Mutex::new(None),
            builds: AtomicUsize::new(0),
            gallery_builds: AtomicUsize::new(0),
        }
    }

    /// Return the current matcher, building the gallery and/or snapshot if needed.
    pub async fn get_or_build(&self, models: &ModelSet) -> Arc<FaceMatcher> {
        let mut gallery = self.gallery.lock().await;

        if let Some(matcher) = self.cached_for(gallery.fingerprint()) {
            return matcher;
        }

        if gallery.is_empty() && !self.labels.is_empty() {
            self.gallery_builds.fetch_add(1, Ordering::SeqCst);
            self.builder.build(&mut gallery, &self.labels, models).await;
            if let Some(matcher) = self.cached_for(gallery.fingerprint()) {
                return matcher;
            }
        }

        let matcher = Arc::new(FaceMatcher::new(&gallery, self.distance_threshold));
        *self.cached.lock().unwrap_or_else(PoisonError::into_inner) = Some(CachedMatcher {
            key: gallery.fingerprint(),
            matcher: matcher.clone(),
        });
        let builds = self.builds.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(labels = gallery.len(), builds, "matcher built");
        matcher
    }

    /// Enroll any configured labels missing from the gallery without touching the matcher.
    pub async fn prepare_gallery(&self, models: &ModelSet) -> GalleryReport {
        let mut gallery = self.gallery.lock().await;
        self.gallery_builds.fetch_add(1, Ordering::SeqCst);
        self.builder.build(&mut gallery, &self.labels, models).await
    }

    /// Drop the cached matcher. A no-op when nothing is cached.
    pub fn dispose(&self) {
        let previous = self.cached.lock().unwrap_or_else(PoisonError::into_inner).take();
        if previous.is_some() {
            tracing::debug!("matcher disposed");
        }
    }

    pub fn is_cached(&self) -> bool {
        self.cached.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Number of matcher snapshots built so far.
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    /// Number of gallery build passes triggered so far.
    pub fn gallery_builds(&self) -> usize {
        self.gallery_builds.load(Ordering::SeqCst)
    }

    pub async fn gallery(&self) -> Gallery {
        self.gallery.lock().await.clone()
    }

    /// Add or replace a gallery entry directly, bypassing reference images.
    pub async fn enroll(&self, label: impl Into<String>, descriptors: Vec<Descriptor>) {
        self.gallery.lock().await.insert(label, descriptors);
    }

    /// Empty the gallery; the next lookup rebuilds it from the configured labels.
    pub async fn clear_gallery(&self) {
        self.gallery.lock().await.clear();
    }

    fn cached_for(&self, key: GalleryFingerprint) -> Option<Arc<FaceMatcher>> {
        self.cached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|c| c.key == key)
            .map(|c| c.matcher.clone())
    }
}
