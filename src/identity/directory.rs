use std::time::Duration;

use anyhow::{Context, Result};
use moka::sync::Cache;
use tracing::{debug, info, instrument, warn};

use crate::config::DirectoryConfig;
use crate::db::{check_did, Db, StoreError};

/// Name recorded for keys learned from the directory service.
pub const DIRECTORY_KEY_NAME: &str = "directory";

/// Fetches the SSH public keys of an identity from the directory service.
///
/// `GET <endpoint>/<did>` answers with one key per line.  Results are cached
/// for a bounded time so a burst of membership events for the same DID costs
/// one request.
#[derive(Clone)]
pub struct DirectoryClient {
    http: reqwest::Client,
    endpoint: String,
    cache: Cache<String, Vec<String>>,
}

impl DirectoryClient {
    pub fn new(config: &DirectoryConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("knotserver/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build reqwest client")?;
        Ok(Self {
            http,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            cache: Cache::builder()
                .max_capacity(config.cache_capacity)
                .time_to_live(Duration::from_secs(config.cache_ttl_secs))
                .build(),
        })
    }

    fn remember(&self, did: &str, keys: &[String]) {
        self.cache.insert(did.to_string(), keys.to_vec());
    }

    #[instrument(skip(self))]
    pub async fn fetch_keys(&self, did: &str) -> Result<Vec<String>> {
        // The DID becomes a path segment.
        check_did(did)?;
        if let Some(keys) = self.cache.get(did) {
            debug!(count = keys.len(), "key cache hit");
            return Ok(keys);
        }

        let url = format!("{}/{did}", self.endpoint);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url} failed"))?;
        let status = response.status();
        anyhow::ensure!(status.is_success(), "GET {url} returned {status}");

        let body = response.text().await.context("failed to read key list")?;
        let keys = parse_key_lines(&body);
        self.remember(did, &keys);
        Ok(keys)
    }

    /// Fetch the keys of `did` and register each of them.  Returns how many
    /// were new.
    pub async fn register_keys(&self, db: &Db, did: &str) -> Result<usize> {
        let keys = self.fetch_keys(did).await?;
        let mut added = 0;
        for key in &keys {
            match db.add_public_key(did, DIRECTORY_KEY_NAME, key, None) {
                Ok(true) => added += 1,
                Ok(false) => {}
                Err(StoreError::InvalidKey) => warn!(%did, "directory listed a malformed key"),
                Err(e) => return Err(e.into()),
            }
        }
        info!(%did, fetched = keys.len(), added, "registered keys from directory");
        Ok(added)
    }

    /// Fire-and-forget [`register_keys`](Self::register_keys).
    pub fn spawn_register_keys(&self, db: Db, did: String) {
        let client = self.clone();
        tokio::spawn(async move {
            if let Err(e) = client.register_keys(&db, &did).await {
                warn!(%did, error = %format!("{e:#}"), "failed to fetch keys from directory");
            }
        });
    }
}

/// Non-empty, trimmed lines of a plaintext key listing.
pub fn parse_key_lines(body: &str) -> Vec<String> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
