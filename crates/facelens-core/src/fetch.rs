//! Byte retrieval for model artifacts and reference images.
//!
//! A locator is either a local filesystem path or an `http(s)://` URL.

use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("read {locator}: {source}")]
    Io {
        locator: String,
        #[source]
        source: std::io::Error,
    },
    #[error("http {locator}: {source}")]
    Http {
        locator: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Source of raw bytes addressed by a locator string.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, locator: &str) -> Result<Vec<u8>, FetchError>;
}

/// Join a base locator and a file name with exactly one separator.
pub fn join_locator(base: &str, name: &str) -> String {
    if base.is_empty() {
        return name.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), name.trim_start_matches('/'))
}

fn is_remote(locator: &str) -> bool {
    locator.starts_with("http://") || locator.starts_with("https://")
}

/// Reads local paths from disk and remote locators over HTTP.
#[derive(Clone, Default)]
pub struct DefaultFetcher {
    client: reqwest::Client,
}

impl DefaultFetcher {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Fetcher for DefaultFetcher {
    async fn fetch(&self, locator: &str) -> Result<Vec<u8>, FetchError> {
        if is_remote(locator) {
            let http_err = |source| FetchError::Http {
                locator: locator.to_string(),
                source,
            };
            let response = self.client.get(locator).send().await.map_err(http_err)?;
            if response.status() == reqwest::StatusCode::NOT_FOUND {
                return Err(FetchError::NotFound(locator.to_string()));
            }
            let bytes = response
                .error_for_status()
                .map_err(http_err)?
                .bytes()
                .await
                .map_err(http_err)?;
            tracing::debug!(locator, bytes = bytes.len(), "fetched remote locator");
            return Ok(bytes.to_vec());
        }

        if !Path::new(locator).exists() {
            return Err(FetchError::NotFound(locator.to_string()));
        }
        let data = tokio::fs::read(locator).await.map_err(|source| FetchError::Io {
            locator: locator.to_string(),
            source,
        })?;
        tracing::debug!(locator, bytes = data.len(), "read local locator");
        Ok(data)
    }
}
