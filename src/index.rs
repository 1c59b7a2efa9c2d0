use std::path::PathBuf;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::LauncherConfig;
use crate::http::{self, FetchError};
use crate::metadata::MetadataStore;

/// The published `versions.json`. `supported_versions` keeps publisher order;
/// its last element is "latest".
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseIndex {
    #[serde(default)]
    pub blocked_versions: Vec<String>,
    #[serde(default)]
    pub supported_versions: Vec<String>,
}

impl ReleaseIndex {
    pub fn parse(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }

    pub fn is_blocked(&self, version: &str) -> bool {
        self.blocked_versions.iter().any(|v| v == version)
    }

    pub fn latest(&self) -> Option<&str> {
        self.supported_versions.last().map(String::as_str)
    }
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("fetching release index: GET {url} returned {status}; body: {body}")]
    IndexFetchFailed {
        url: String,
        status: StatusCode,
        body: String,
    },
    #[error("no release index available: GET {url}: {source}")]
    NoIndexAvailable {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("no release index available: {url} returned invalid JSON: {source}")]
    InvalidIndex {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// `versions.json` with an on-disk copy, re-fetched at most once per TTL.
pub struct IndexCache {
    url: String,
    cache_path: PathBuf,
    metadata: MetadataStore,
    ttl: Duration,
    client: Client,
}

impl IndexCache {
    pub fn new(config: &LauncherConfig) -> reqwest::Result<Self> {
        Ok(IndexCache {
            url: config.versions_url(),
            cache_path: config.versions_cache_file.clone(),
            metadata: MetadataStore::new(&config.metadata_file),
            ttl: config.cache_ttl,
            client: http::client(None)?,
        })
    }

    pub fn get_index(&self, force: bool) -> Result<ReleaseIndex, IndexError> {
        if !force && self.metadata.is_fresh(self.ttl) {
            if let Some(index) = self.read_cache() {
                debug!(path = %self.cache_path.display(), "using cached release index");
                return Ok(index);
            }
        }

        debug!(url = %self.url, force, "fetching release index");
        let body = match http::fetch_url(&self.client, &self.url) {
            Ok(body) => body,
            // Non-2xx is never masked by the cache.
            Err(FetchError::Status { url, status, body }) => {
                return Err(IndexError::IndexFetchFailed { url, status, body });
            }
            Err(FetchError::Transport { url, source }) => {
                if let Some(index) = self.read_cache() {
                    warn!(error = %source, "release index fetch failed, using cached copy");
                    return Ok(index);
                }
                return Err(IndexError::NoIndexAvailable { url, source });
            }
        };

        let index = match ReleaseIndex::parse(&body) {
            Ok(index) => index,
            Err(source) => {
                if let Some(index) = self.read_cache() {
                    warn!(error = %source, "release index is not valid JSON, using cached copy");
                    return Ok(index);
                }
                return Err(IndexError::InvalidIndex {
                    url: self.url.clone(),
                    source,
                });
            }
        };

        self.write_cache(&body);
        self.metadata.touch_timestamp();
        Ok(index)
    }

    fn read_cache(&self) -> Option<ReleaseIndex> {
        let body = std::fs::read(&self.cache_path).ok()?;
        ReleaseIndex::parse(&body).ok()
    }

    fn write_cache(&self, body: &[u8]) {
        if let Some(parent) = self.cache_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(&self.cache_path, body) {
            warn!(path = %self.cache_path.display(), error = %e, "could not write index cache");
        }
    }
}
