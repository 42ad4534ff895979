//! TTL cache in front of the remote catalog.
//!
//! A fresh cache is served without network access. Otherwise the catalog is
//! fetched, validated and persisted atomically; when the fetch fails, any
//! parseable cache is served regardless of age.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use relay_common::fs::{write_atomic, AtomicWriteOptions};

use crate::error::{CatalogError, CatalogResult};
use crate::model::{Catalog, SdkPolicy};

pub const DEFAULT_CATALOG_URL: &str = "https://models.dev/api.json";
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_REDIRECTS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogOrigin {
    /// Fetched during this load.
    Fresh,
    /// Served from a cache within its TTL.
    Cache,
    /// Served from an expired cache because the fetch failed.
    StaleFallback { reason: String },
}

#[derive(Debug, Clone)]
pub struct CacheEnvelope {
    pub fetched_at: DateTime<Utc>,
    pub url: String,
    pub catalog: Catalog,
    pub origin: CatalogOrigin,
}

/// On-disk form; the raw document is kept so a policy change re-filters it.
#[derive(Debug, Serialize, Deserialize)]
struct StoredEnvelope {
    fetched_at: DateTime<Utc>,
    url: String,
    document: Value,
}

#[derive(Debug, Clone)]
pub struct CatalogCache {
    url: String,
    path: PathBuf,
    ttl: Duration,
    fetch_timeout: Duration,
    policy: SdkPolicy,
}

impl CatalogCache {
    pub fn new(url: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            path: path.into(),
            ttl: DEFAULT_TTL,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            policy: SdkPolicy::default(),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_policy(mut self, policy: SdkPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> CatalogResult<CacheEnvelope> {
        self.load_at(Utc::now()).await
    }

    /// [`load`](Self::load) with an injected clock.
    pub async fn load_at(&self, now: DateTime<Utc>) -> CatalogResult<CacheEnvelope> {
        let cached = self.read_cached();

        if let Some((stored, catalog)) = &cached {
            if self.is_fresh(stored, now) {
                debug!(path = %self.path.display(), fetched_at = %stored.fetched_at, "catalog cache is fresh");
                return Ok(CacheEnvelope {
                    fetched_at: stored.fetched_at,
                    url: stored.url.clone(),
                    catalog: catalog.clone(),
                    origin: CatalogOrigin::Cache,
                });
            }
        }

        match self.fetch().await {
            Ok((document, catalog)) => {
                self.persist(&document, now);
                info!(url = %self.url, providers = catalog.providers.len(), "catalog refreshed");
                Ok(CacheEnvelope {
                    fetched_at: now,
                    url: self.url.clone(),
                    catalog,
                    origin: CatalogOrigin::Fresh,
                })
            }
            Err(cause) => match cached {
                Some((stored, catalog)) => {
                    warn!(
                        url = %self.url,
                        fetched_at = %stored.fetched_at,
                        "catalog refresh failed, using stale cache: {}",
                        cause
                    );
                    Ok(CacheEnvelope {
                        fetched_at: stored.fetched_at,
                        url: stored.url,
                        catalog,
                        origin: CatalogOrigin::StaleFallback {
                            reason: cause.to_string(),
                        },
                    })
                }
                None => Err(CatalogError::Unavailable {
                    url: self.url.clone(),
                    cause: Box::new(cause),
                }),
            },
        }
    }

    fn is_fresh(&self, stored: &StoredEnvelope, now: DateTime<Utc>) -> bool {
        if stored.url != self.url {
            return false;
        }
        match (now - stored.fetched_at).to_std() {
            Ok(age) => age < self.ttl,
            // fetched "in the future": clock moved backwards
            Err(_) => false,
        }
    }

    fn read_cached(&self) -> Option<(StoredEnvelope, Catalog)> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), "catalog cache unreadable: {}", err);
                }
                return None;
            }
        };

        let stored: StoredEnvelope = match serde_json::from_slice(&bytes) {
            Ok(stored) => stored,
            Err(err) => {
                warn!(path = %self.path.display(), "ignoring corrupt catalog cache: {}", err);
                return None;
            }
        };
        match Catalog::from_document(&stored.document, &self.policy) {
            Ok(catalog) => Some((stored, catalog)),
            Err(err) => {
                warn!(path = %self.path.display(), "ignoring invalid catalog cache: {}", err);
                None
            }
        }
    }

    async fn fetch(&self) -> CatalogResult<(Value, Catalog)> {
        let network = |err: reqwest::Error| CatalogError::Network {
            url: self.url.clone(),
            message: err.to_string(),
        };

        let client = reqwest::Client::builder()
            .timeout(self.fetch_timeout)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(network)?;

        debug!(url = %self.url, "fetching catalog");
        let response = client.get(&self.url).send().await.map_err(network)?;
        if !response.status().is_success() {
            return Err(CatalogError::Status {
                url: self.url.clone(),
                status: response.status().as_u16(),
            });
        }

        let body = response.bytes().await.map_err(network)?;
        let document: Value = serde_json::from_slice(&body)
            .map_err(|e| CatalogError::Validation(format!("response is not JSON: {}", e)))?;
        let catalog = Catalog::from_document(&document, &self.policy)?;
        Ok((document, catalog))
    }

    /// Failure to persist does not fail the load.
    fn persist(&self, document: &Value, fetched_at: DateTime<Utc>) {
        let stored = StoredEnvelope {
            fetched_at,
            url: self.url.clone(),
            document: document.clone(),
        };
        let result = serde_json::to_vec(&stored)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
            .and_then(|payload| write_atomic(&self.path, &payload, AtomicWriteOptions::default()));
        if let Err(err) = result {
            warn!(path = %self.path.display(), "failed to persist catalog cache: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use httpmock::prelude::*;
    use serde_json::json;
    use tempfile::{tempdir, TempDir};

    fn catalog_document(model: &str) -> Value {
        json!({
            "openrouter": {
                "id": "openrouter",
                "name": "OpenRouter",
                "npm": "@ai-sdk/openai-compatible",
                "api": "https://openrouter.ai/api/v1",
                "env": ["OPENROUTER_API_KEY"],
                "models": {
                    model: { "id": model, "name": model, "tool_call": true }
                }
            }
        })
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn cache_for(server: &MockServer, temp: &TempDir) -> CatalogCache {
        CatalogCache::new(server.url("/api.json"), temp.path().join("catalog.json"))
            .with_ttl(Duration::from_secs(3600))
            .with_fetch_timeout(Duration::from_secs(5))
    }

    fn seed(cache: &CatalogCache, document: Value) {
        let stored = StoredEnvelope {
            fetched_at: t0(),
            url: cache.url().to_string(),
            document,
        };
        std::fs::write(cache.path(), serde_json::to_vec(&stored).unwrap()).unwrap();
    }

    fn first_model(envelope: &CacheEnvelope) -> &str {
        &envelope.catalog.providers[0].models[0].id
    }

    #[tokio::test]
    async fn functional_cache_is_served_within_ttl_and_refetched_after() {
        let temp = tempdir().expect("tempdir");
        let server = MockServer::start();
        let remote = server.mock(|when, then| {
            when.method(GET).path("/api.json");
            then.status(200).json_body(catalog_document("m-1"));
        });
        let cache = cache_for(&server, &temp);

        let first = cache.load_at(t0()).await.expect("initial fetch");
        assert_eq!(first.origin, CatalogOrigin::Fresh);
        remote.assert_calls(1);

        let cached = cache
            .load_at(t0() + chrono::Duration::seconds(3599))
            .await
            .expect("cached load");
        assert_eq!(cached.origin, CatalogOrigin::Cache);
        assert_eq!(cached.fetched_at, t0());
        remote.assert_calls(1);

        let refreshed = cache
            .load_at(t0() + chrono::Duration::seconds(3601))
            .await
            .expect("refresh");
        assert_eq!(refreshed.origin, CatalogOrigin::Fresh);
        remote.assert_calls(2);
    }

    #[tokio::test]
    async fn functional_cache_for_another_url_is_not_fresh() {
        let temp = tempdir().expect("tempdir");
        let server = MockServer::start();
        let remote = server.mock(|when, then| {
            when.method(GET).path("/api.json");
            then.status(200).json_body(catalog_document("m-1"));
        });
        let other = CatalogCache::new(server.url("/other.json"), temp.path().join("catalog.json"));
        seed(&other, catalog_document("old"));

        let loaded = cache_for(&server, &temp).load_at(t0()).await.unwrap();

        assert_eq!(loaded.origin, CatalogOrigin::Fresh);
        assert_eq!(first_model(&loaded), "m-1");
        remote.assert_calls(1);
    }

    #[tokio::test]
    async fn regression_failed_refresh_falls_back_to_expired_cache() {
        let temp = tempdir().expect("tempdir");
        let server = MockServer::start();
        let cache = cache_for(&server, &temp);
        seed(&cache, catalog_document("cached-model"));

        server.mock(|when, then| {
            when.method(GET).path("/api.json");
            then.status(503);
        });
        let stale = cache
            .load_at(t0() + chrono::Duration::hours(5))
            .await
            .expect("stale fallback");

        match &stale.origin {
            CatalogOrigin::StaleFallback { reason } => {
                assert!(reason.contains("503"), "unexpected reason: {reason}");
            }
            other => panic!("expected stale fallback, got {other:?}"),
        }
        assert_eq!(first_model(&stale), "cached-model");
        assert_eq!(stale.fetched_at, t0());
    }

    #[tokio::test]
    async fn regression_invalid_document_never_replaces_cache() {
        let temp = tempdir().expect("tempdir");
        let server = MockServer::start();
        let cache = cache_for(&server, &temp);
        seed(&cache, catalog_document("good"));
        let before = std::fs::read(cache.path()).unwrap();

        server.mock(|when, then| {
            when.method(GET).path("/api.json");
            then.status(200)
                .json_body(json!({ "other": { "npm": "@ai-sdk/unsupported", "models": {} } }));
        });
        let loaded = cache
            .load_at(t0() + chrono::Duration::hours(2))
            .await
            .unwrap();

        assert!(matches!(loaded.origin, CatalogOrigin::StaleFallback { .. }));
        assert_eq!(std::fs::read(cache.path()).unwrap(), before);
    }

    #[tokio::test]
    async fn regression_unreachable_catalog_without_cache_is_unavailable() {
        let temp = tempdir().expect("tempdir");
        let cache = CatalogCache::new("http://127.0.0.1:1/api.json", temp.path().join("c.json"))
            .with_fetch_timeout(Duration::from_millis(500));

        let err = cache.load_at(t0()).await.unwrap_err();

        assert!(matches!(err, CatalogError::Unavailable { .. }));
        assert!(matches!(err.root_cause(), CatalogError::Network { .. }));
        assert!(!cache.path().exists());
    }

    #[tokio::test]
    async fn regression_bad_status_without_cache_keeps_status_cause() {
        let temp = tempdir().expect("tempdir");
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/api.json");
            then.status(500);
        });

        let err = cache_for(&server, &temp).load_at(t0()).await.unwrap_err();

        assert!(matches!(
            err.root_cause(),
            CatalogError::Status { status: 500, .. }
        ));
    }

    #[test]
    fn unit_corrupt_cache_file_reads_as_absent() {
        let temp = tempdir().expect("tempdir");
        let cache = CatalogCache::new("http://unused.invalid", temp.path().join("catalog.json"));
        std::fs::write(cache.path(), "{ half-written").unwrap();
        assert!(cache.read_cached().is_none());
    }
}
