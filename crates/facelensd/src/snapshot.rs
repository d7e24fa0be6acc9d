//! Periodically persists the rendered overlay to a PNG file.

use facelens_core::frame_loop::FrameObserver;
use facelens_core::surface::Surface;
use facelens_core::types::{AnnotatedFace, Frame};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

pub struct SnapshotWriter {
    path: PathBuf,
    interval: Duration,
    last: Mutex<Option<Instant>>,
    written: AtomicU64,
}

impl SnapshotWriter {
    pub fn new(path: PathBuf, interval: Duration) -> Self {
        Self {
            path,
            interval,
            last: Mutex::new(None),
            written: AtomicU64::new(0),
        }
    }

    pub fn written(&self) -> u64 {
        self.written.load(Ordering::SeqCst)
    }

    fn due(&self, now: Instant) -> bool {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        match *last {
            Some(at) if now.duration_since(at) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

impl FrameObserver for SnapshotWriter {
    fn on_rendered(&self, frame: &Frame, faces: &[AnnotatedFace], surface: &dyn Surface) {
        if !self.due(Instant::now()) {
            return;
        }
        let Some(image) = surface.snapshot() else {
            return;
        };

        // Write beside the target and rename so readers never see a partial file.
        let tmp = self.path.with_extension("png.tmp");
        let result = image
            .save_with_format(&tmp, image::ImageFormat::Png)
            .map_err(|e| e.to_string())
            .and_then(|()| std::fs::rename(&tmp, &self.path).map_err(|e| e.to_string()));

        match result {
            Ok(()) => {
                self.written.fetch_add(1, Ordering::SeqCst);
                tracing::debug!(
                    path = %self.path.display(),
                    sequence = frame.sequence,
                    faces = faces.len(),
                    "overlay snapshot written"
                );
            }
            Err(e) => tracing::warn!(path = %self.path.display(), error = %e, "failed to write overlay snapshot"),
        }
    }
}
