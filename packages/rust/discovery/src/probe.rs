//! Remote existence checks for candidate pages.
//!
//! A probe issues `HEAD` requests against the wiki and caches every
//! definitive answer for its own lifetime. The cache sits behind a mutex so
//! one probe can be shared by concurrent workers.

use std::collections::HashMap;
use std::sync::Arc;

use reqwest::Client;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};
use wikiaccess_shared::{PageId, ProbeConfig, Result, WikiAccessError, WikiSource};
use wikiaccess_storage::Store;

/// Maximum number of redirects to follow per check.
const MAX_REDIRECTS: usize = 5;

/// User-Agent string for existence checks.
const USER_AGENT: &str = concat!("WikiAccess-Discovery/", env!("CARGO_PKG_VERSION"));

/// Outcome of one existence check.
///
/// `status == 0` means no definitive answer (timeout or network error).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub exists: bool,
    pub status: u16,
}

impl ProbeResult {
    pub const INDEFINITE: Self = Self {
        exists: false,
        status: 0,
    };

    fn from_status(status: u16) -> Self {
        Self {
            exists: status == 200,
            status,
        }
    }

    pub fn is_definitive(&self) -> bool {
        self.status != 0
    }

    pub fn is_not_found(&self) -> bool {
        self.status == 404
    }
}

// ---------------------------------------------------------------------------
// PageExistenceProbe
// ---------------------------------------------------------------------------

pub struct PageExistenceProbe {
    client: Client,
    wiki: WikiSource,
    config: ProbeConfig,
    store: Option<Arc<Store>>,
    cache: Mutex<HashMap<PageId, ProbeResult>>,
}

impl PageExistenceProbe {
    pub fn new(wiki: WikiSource, config: ProbeConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .timeout(config.timeout)
            .build()
            .map_err(|e| WikiAccessError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            wiki,
            config,
            store: None,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Persist definitive 404 answers to the discovered-page rows in `store`.
    pub fn with_store(mut self, store: Arc<Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Check whether a page exists on the wiki.
    ///
    /// Network failures are retried `retries` times with linear backoff and
    /// then reported as [`ProbeResult::INDEFINITE`], which is not cached.
    #[instrument(skip(self), fields(page = %id))]
    pub async fn exists(&self, id: &PageId) -> ProbeResult {
        if let Some(hit) = self.cache.lock().await.get(id).copied() {
            return hit;
        }

        let url = self.wiki.page_url(id);
        let mut attempt: u32 = 0;
        let result = loop {
            match self.client.head(&url).send().await {
                Ok(response) => break ProbeResult::from_status(response.status().as_u16()),
                Err(e) if attempt < self.config.retries => {
                    attempt += 1;
                    debug!(attempt, error = %e, "existence check failed, retrying");
                    tokio::time::sleep(self.config.backoff * attempt).await;
                }
                Err(e) => {
                    warn!(%url, error = %e, "existence check failed");
                    return ProbeResult::INDEFINITE;
                }
            }
        };

        debug!(status = result.status, "existence checked");
        self.cache.lock().await.insert(id.clone(), result);
        if result.is_not_found() {
            self.persist_not_found(id).await;
        }
        result
    }

    /// Number of cached answers.
    pub async fn cached(&self) -> usize {
        self.cache.lock().await.len()
    }

    async fn persist_not_found(&self, id: &PageId) {
        let Some(store) = &self.store else {
            return;
        };
        let target = id.clone();
        let outcome = store
            .with_transaction(move |tx| {
                Box::pin(async move { tx.record_probe_result(&target, 404).await })
            })
            .await;
        if let Err(e) = outcome {
            warn!(page = %id, error = %e, "failed to record 404");
        }
    }
}
