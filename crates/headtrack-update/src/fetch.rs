//! Remote firmware catalog fetching with caching
//!
//! Catalogs live at `{base}/{channel}/catalog.json`. A fetched catalog is
//! kept in memory for a short TTL so repeated version checks do not hit the
//! network. Downloads are checked against the catalog's size and SHA-256
//! before anyone gets to flash them.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use headtrack_core::firmware::sha256_hex;
use headtrack_core::{BoardType, Channel, FirmwareCatalog, FirmwareRelease};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Cache TTL for catalogs (5 minutes)
const CATALOG_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },
    #[error("Invalid catalog at {url}: {reason}")]
    Catalog { url: String, reason: String },
    #[error("No {channel} release for {board}")]
    NoRelease { board: BoardType, channel: Channel },
    #[error("Size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("SHA-256 mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

struct CachedCatalog {
    catalog: FirmwareCatalog,
    fetched_at: Instant,
}

/// Catalog fetcher with in-memory caching
pub struct FirmwareFetcher {
    client: reqwest::Client,
    base_url: String,
    ttl: Duration,
    cache: Arc<RwLock<HashMap<Channel, CachedCatalog>>>,
}

impl FirmwareFetcher {
    pub fn new(base_url: impl Into<String>) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            ttl: CATALOG_CACHE_TTL,
            cache: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// `https://example.org/fw` + testing -> `https://example.org/fw/testing/catalog.json`
    pub fn catalog_url(base: &str, channel: Channel) -> String {
        format!("{}/{}/catalog.json", base.trim_end_matches('/'), channel)
    }

    /// Resolve a release URL that may be relative to its catalog
    pub fn resolve_url(catalog_url: &str, release_url: &str) -> String {
        if release_url.contains("://") {
            return release_url.to_string();
        }
        let dir = catalog_url
            .rsplit_once('/')
            .map_or(catalog_url, |(dir, _)| dir);
        format!("{}/{}", dir, release_url.trim_start_matches('/'))
    }

    /// Get the catalog for `channel`, from cache when fresh
    pub async fn get_catalog(&self, channel: Channel) -> Result<FirmwareCatalog, FetchError> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(&channel) {
                if cached.fetched_at.elapsed() < self.ttl {
                    debug!(
                        channel = %channel,
                        age_secs = cached.fetched_at.elapsed().as_secs(),
                        "Using cached firmware catalog"
                    );
                    return Ok(cached.catalog.clone());
                }
            }
        }

        let url = Self::catalog_url(&self.base_url, channel);
        debug!(url = %url, "Fetching firmware catalog");

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            warn!(url = %url, status = %response.status(), "Firmware catalog fetch failed");
            return Err(FetchError::Status {
                url,
                status: response.status().as_u16(),
            });
        }

        let text = response.text().await?;
        let mut catalog = parse_catalog(&url, &text)?;
        for release in &mut catalog.releases {
            release.url = Self::resolve_url(&url, &release.url);
        }

        info!(
            channel = %channel,
            releases = catalog.releases.len(),
            "Fetched firmware catalog"
        );

        self.cache.write().await.insert(
            channel,
            CachedCatalog {
                catalog: catalog.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(catalog)
    }

    /// Newest release for `board` on `channel`
    pub async fn latest_release(
        &self,
        channel: Channel,
        board: BoardType,
    ) -> Result<FirmwareRelease, FetchError> {
        self.get_catalog(channel)
            .await?
            .latest_for(board)
            .cloned()
            .ok_or(FetchError::NoRelease { board, channel })
    }

    /// Download a release binary and verify its size and hash
    pub async fn download(&self, release: &FirmwareRelease) -> Result<Vec<u8>, FetchError> {
        info!(
            board = %release.board,
            version = %release.version,
            url = %release.url,
            size = release.size,
            "Downloading firmware"
        );

        let response = self.client.get(&release.url).send().await?;
        if !response.status().is_success() {
            return Err(FetchError::Status {
                url: release.url.clone(),
                status: response.status().as_u16(),
            });
        }

        let data = response.bytes().await?.to_vec();
        verify_download(release, &data)?;

        info!(version = %release.version, size = data.len(), "Firmware download verified");
        Ok(data)
    }

    pub async fn clear_cache(&self) {
        self.cache.write().await.clear();
        info!("Cleared firmware catalog cache");
    }

    pub async fn cache_stats(&self) -> usize {
        self.cache.read().await.len()
    }
}

fn parse_catalog(url: &str, text: &str) -> Result<FirmwareCatalog, FetchError> {
    serde_json::from_str(text).map_err(|e| FetchError::Catalog {
        url: url.to_string(),
        reason: e.to_string(),
    })
}

/// Check downloaded bytes against the catalog entry
pub fn verify_download(release: &FirmwareRelease, data: &[u8]) -> Result<(), FetchError> {
    if data.len() as u64 != release.size {
        return Err(FetchError::SizeMismatch {
            expected: release.size,
            actual: data.len() as u64,
        });
    }

    let actual = sha256_hex(data);
    if !actual.eq_ignore_ascii_case(&release.sha256) {
        return Err(FetchError::HashMismatch {
            expected: release.sha256.clone(),
            actual,
        });
    }
    Ok(())
}

/// Read a firmware file from disk
pub async fn read_local(path: &Path) -> Result<Vec<u8>, FetchError> {
    let data = tokio::fs::read(path).await?;
    debug!(path = %path.display(), size = data.len(), "Read local firmware");
    Ok(data)
}
