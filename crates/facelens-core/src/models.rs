//! Process-wide, load-once registry of perception model artifacts.
//!
//! Every locator maps to a single `OnceCell`. The first caller runs the
//! multi-artifact load; concurrent and later callers await the same cell and
//! observe the same outcome, including a failed one.

use crate::fetch::{join_locator, Fetcher};
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use thiserror::Error;
use tokio::sync::OnceCell;

static GLOBAL_REGISTRY: OnceLock<ModelRegistry> = OnceLock::new();

/// One artifact that could not be retrieved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactFailure {
    pub artifact: String,
    pub reason: String,
}

impl fmt::Display for ArtifactFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.artifact, self.reason)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelLoadError {
    #[error("no model artifacts requested for {0}")]
    NothingToLoad(String),
    #[error("{} model artifact(s) failed to load from {locator}: {}", .failures.len(), join_failures(.failures))]
    Artifacts {
        locator: String,
        failures: Vec<ArtifactFailure>,
    },
    #[error("model set {locator} was loaded without {}", .missing.join(", "))]
    MissingArtifacts { locator: String, missing: Vec<String> },
}

fn join_failures(failures: &[ArtifactFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Immutable set of artifact blobs loaded from one locator.
#[derive(Debug)]
pub struct ModelSet {
    locator: String,
    artifacts: BTreeMap<String, Vec<u8>>,
}

impl ModelSet {
    pub fn new(locator: impl Into<String>, artifacts: BTreeMap<String, Vec<u8>>) -> Self {
        Self {
            locator: locator.into(),
            artifacts,
        }
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }

    pub fn artifact(&self, name: &str) -> Option<&[u8]> {
        self.artifacts.get(name).map(Vec::as_slice)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.artifacts.keys().map(String::as_str)
    }

    pub fn total_bytes(&self) -> usize {
        self.artifacts.values().map(Vec::len).sum()
    }

    /// Fail unless every name in `names` is present.
    ///
    /// The registry hands out whatever the first load of a locator fetched,
    /// so callers check their own requirements against it.
    pub fn require(&self, names: &[String]) -> Result<(), ModelLoadError> {
        let missing: Vec<String> = names
            .iter()
            .filter(|name| !self.artifacts.contains_key(name.as_str()))
            .cloned()
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ModelLoadError::MissingArtifacts {
                locator: self.locator.clone(),
                missing,
            })
        }
    }
}

type LoadCell = Arc<OnceCell<Result<Arc<ModelSet>, ModelLoadError>>>;

/// Locator-keyed cache of model loads.
#[derive(Default)]
pub struct ModelRegistry {
    entries: Mutex<HashMap<String, LoadCell>>,
    sequences: AtomicUsize,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by every pipeline in the process.
    pub fn global() -> &'static ModelRegistry {
        GLOBAL_REGISTRY.get_or_init(ModelRegistry::new)
    }

    /// Load `artifacts` from `locator`, at most once per locator.
    ///
    /// The artifact list of the first call wins; later calls with the same
    /// locator get the cached outcome regardless of what they ask for.
    pub async fn load(
        &self,
        locator: &str,
        artifacts: &[String],
        fetcher: &dyn Fetcher,
    ) -> Result<Arc<ModelSet>, ModelLoadError> {
        let cell = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries.entry(locator.to_string()).or_default().clone()
        };

        cell.get_or_init(|| self.load_all(locator, artifacts, fetcher))
            .await
            .clone()
    }

    /// Forget the cached outcome for `locator` so the next `load` retries.
    pub fn evict(&self, locator: &str) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let removed = entries.remove(locator).is_some();
        if removed {
            tracing::info!(locator, "model registry entry evicted");
        }
        removed
    }

    /// Number of underlying load sequences that have been started.
    pub fn load_sequences(&self) -> usize {
        self.sequences.load(Ordering::SeqCst)
    }

    async fn load_all(
        &self,
        locator: &str,
        artifacts: &[String],
        fetcher: &dyn Fetcher,
    ) -> Result<Arc<ModelSet>, ModelLoadError> {
        self.sequences.fetch_add(1, Ordering::SeqCst);
        if artifacts.is_empty() {
            return Err(ModelLoadError::NothingToLoad(locator.to_string()));
        }

        tracing::info!(locator, artifacts = ?artifacts, "loading model artifacts");

        let fetches = artifacts.iter().map(|name| async move {
            let path = join_locator(locator, name);
            (name.clone(), fetcher.fetch(&path).await)
        });

        let mut loaded = BTreeMap::new();
        let mut failures = Vec::new();
        for (name, result) in join_all(fetches).await {
            match result {
                Ok(bytes) if bytes.is_empty() => failures.push(ArtifactFailure {
                    artifact: name,
                    reason: "artifact is empty".into(),
                }),
                Ok(bytes) => {
                    loaded.insert(name, bytes);
                }
                Err(e) => failures.push(ArtifactFailure {
                    artifact: name,
                    reason: e.to_string(),
                }),
            }
        }

        if !failures.is_empty() {
            let err = ModelLoadError::Artifacts {
                locator: locator.to_string(),
                failures,
            };
            tracing::error!(locator, error = %err, "model load failed");
            return Err(err);
        }

        let set = ModelSet::new(locator, loaded);
        tracing::info!(
            locator,
            count = artifacts.len(),
            bytes = set.total_bytes(),
            "model artifacts loaded"
        );
        Ok(Arc::new(set))
    }
}
