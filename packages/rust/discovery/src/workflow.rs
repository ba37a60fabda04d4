//! Review lifecycle of discovered pages.
//!
//! Every status change here is guarded on the row still being
//! `discovered`, so repeating any operation is harmless and a decision that
//! was already made is never overwritten.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{info, instrument, warn};
use wikiaccess_shared::{
    DiscoveredPage, DiscoverySource, DiscoveryStatus, PageId, Result, WikiAccessError, WikiSource,
};
use wikiaccess_storage::{DepthCount, DiscoveryFilter, Store};

use crate::probe::PageExistenceProbe;

/// What the operator should do next, derived from status counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NextAction {
    /// Candidates are waiting for a decision.
    RunReview,
    /// Approved candidates are waiting to be converted.
    RunConversion,
    /// Nothing pending: convert an initial page list.
    RunInitialBatch,
}

impl NextAction {
    pub fn hint(self) -> &'static str {
        match self {
            NextAction::RunReview => "review discovered pages: wikiaccess review pending",
            NextAction::RunConversion => "convert approved pages: wikiaccess convert-approved",
            NextAction::RunInitialBatch => "convert an initial page list: wikiaccess convert --file",
        }
    }
}

impl std::fmt::Display for NextAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.hint())
    }
}

/// Pure recommendation from per-status counts.
pub fn recommend_next_action(counts: &BTreeMap<DiscoveryStatus, u32>) -> NextAction {
    let count = |status| counts.get(&status).copied().unwrap_or(0);
    if count(DiscoveryStatus::Discovered) > 0 {
        NextAction::RunReview
    } else if count(DiscoveryStatus::Approved) > 0 {
        NextAction::RunConversion
    } else {
        NextAction::RunInitialBatch
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryProgress {
    pub by_status: BTreeMap<DiscoveryStatus, u32>,
    pub by_depth: Vec<DepthCount>,
    pub next_action: NextAction,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoverySummary {
    pub by_status: BTreeMap<DiscoveryStatus, u32>,
    pub pending_count: u32,
    pub approved_count: u32,
    /// Sum of reference counts over pending candidates.
    pub total_references: u32,
    pub avg_references: f64,
    pub most_referenced: Option<DiscoveredPage>,
}

/// Result of a 404 sweep over pending candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CheckStats {
    pub checked: u32,
    pub found: u32,
    pub not_found: u32,
    /// Timeouts, network errors, and non-200/404 answers.
    pub errors: u32,
}

// ---------------------------------------------------------------------------
// DiscoveryWorkflow
// ---------------------------------------------------------------------------

pub struct DiscoveryWorkflow {
    store: Arc<Store>,
    wiki: WikiSource,
}

impl DiscoveryWorkflow {
    pub fn new(store: Arc<Store>, wiki: WikiSource) -> Self {
        Self { store, wiki }
    }

    // -- reads --------------------------------------------------------------

    /// Candidates awaiting a decision, most referenced and shallowest first.
    pub async fn pending_review(&self, filter: &DiscoveryFilter) -> Result<Vec<DiscoveredPage>> {
        self.store
            .discovered_pages(Some(DiscoveryStatus::Discovered), filter)
            .await
    }

    /// Approved candidates, optionally limited to `max_depth`.
    pub async fn ready_to_convert(&self, max_depth: Option<u32>) -> Result<Vec<DiscoveredPage>> {
        let filter = DiscoveryFilter {
            max_depth,
            ..DiscoveryFilter::default()
        };
        self.store
            .discovered_pages(Some(DiscoveryStatus::Approved), &filter)
            .await
    }

    pub async fn progress(&self) -> Result<DiscoveryProgress> {
        let by_status = self.store.discovery_status_counts().await?;
        let by_depth = self.store.discovery_depth_counts().await?;
        let next_action = recommend_next_action(&by_status);
        Ok(DiscoveryProgress {
            by_status,
            by_depth,
            next_action,
        })
    }

    pub async fn summary(&self) -> Result<DiscoverySummary> {
        let by_status = self.store.discovery_status_counts().await?;
        let pending = self.pending_review(&DiscoveryFilter::all()).await?;
        let total_references: u32 = pending.iter().map(|p| p.reference_count).sum();
        let avg_references = if pending.is_empty() {
            0.0
        } else {
            let avg = f64::from(total_references) / pending.len() as f64;
            (avg * 10.0).round() / 10.0
        };
        Ok(DiscoverySummary {
            pending_count: by_status
                .get(&DiscoveryStatus::Discovered)
                .copied()
                .unwrap_or(0),
            approved_count: by_status
                .get(&DiscoveryStatus::Approved)
                .copied()
                .unwrap_or(0),
            by_status,
            total_references,
            avg_references,
            most_referenced: pending.into_iter().next(),
        })
    }

    /// Pages that referenced `target`, oldest first.
    pub async fn sources(&self, target: &PageId) -> Result<Vec<DiscoverySource>> {
        let page = self.require(target).await?;
        self.store.discovery_sources(page.id).await
    }

    // -- single-page transitions --------------------------------------------

    /// Move one pending candidate to `to`.
    ///
    /// Returns `false` when the page had already left `discovered`.
    #[instrument(skip(self), fields(page = %target))]
    pub async fn transition(
        &self,
        target: &PageId,
        to: DiscoveryStatus,
        reason: Option<&str>,
        http_status: Option<u16>,
    ) -> Result<bool> {
        ensure_decision(to)?;
        let page = self.require(target).await?;
        let reason = reason.map(str::to_string);
        let changed = self
            .store
            .with_transaction(move |tx| {
                Box::pin(async move {
                    tx.transition_discovery(
                        page.id,
                        DiscoveryStatus::Discovered,
                        to,
                        reason.as_deref(),
                        http_status,
                    )
                    .await
                })
            })
            .await?;
        if changed {
            info!(status = %to, "discovery decision recorded");
        }
        Ok(changed)
    }

    pub async fn approve(&self, target: &PageId, reason: Option<&str>) -> Result<bool> {
        self.transition(target, DiscoveryStatus::Approved, reason, None)
            .await
    }

    pub async fn skip(&self, target: &PageId, reason: Option<&str>) -> Result<bool> {
        self.transition(target, DiscoveryStatus::Skipped, reason, None)
            .await
    }

    /// Record a confirmed 404 as the terminal `failed_404` state.
    pub async fn mark_not_found(&self, target: &PageId) -> Result<bool> {
        self.transition(
            target,
            DiscoveryStatus::Failed404,
            Some("HTTP 404 - page not found"),
            Some(404),
        )
        .await
    }

    /// Probe one candidate and record a definitive 404.
    pub async fn check(&self, probe: &PageExistenceProbe, target: &PageId) -> Result<u16> {
        self.require(target).await?;
        let result = probe.exists(target).await;
        if result.is_not_found() {
            self.mark_not_found(target).await?;
        }
        Ok(result.status)
    }

    // -- bulk transitions ---------------------------------------------------

    /// Move every pending candidate matching `filter` to `to`.
    ///
    /// No matching rows is a zero count, not an error.
    #[instrument(skip(self))]
    pub async fn bulk_transition(
        &self,
        filter: &DiscoveryFilter,
        to: DiscoveryStatus,
        reason: Option<&str>,
    ) -> Result<u64> {
        ensure_decision(to)?;
        let filter = filter.clone();
        let reason = reason.map(str::to_string);
        let changed = self
            .store
            .with_transaction(move |tx| {
                Box::pin(async move { tx.bulk_transition(&filter, to, reason.as_deref()).await })
            })
            .await?;
        info!(changed, status = %to, "bulk decision recorded");
        Ok(changed)
    }

    pub async fn approve_all(&self) -> Result<u64> {
        self.bulk_transition(&DiscoveryFilter::all(), DiscoveryStatus::Approved, Some("bulk approve"))
            .await
    }

    pub async fn skip_all(&self) -> Result<u64> {
        self.bulk_transition(&DiscoveryFilter::all(), DiscoveryStatus::Skipped, Some("bulk skip"))
            .await
    }

    /// Approve candidates under a namespace prefix such as `course:examples:*`.
    pub async fn approve_namespace(&self, pattern: &str) -> Result<u64> {
        self.bulk_transition(
            &DiscoveryFilter::namespace(pattern),
            DiscoveryStatus::Approved,
            Some(&format!("namespace {pattern}")),
        )
        .await
    }

    pub async fn approve_min_references(&self, min: u32) -> Result<u64> {
        self.bulk_transition(
            &DiscoveryFilter::min_references(min),
            DiscoveryStatus::Approved,
            Some(&format!("referenced at least {min} times")),
        )
        .await
    }

    pub async fn approve_depth(&self, depth: u32) -> Result<u64> {
        self.bulk_transition(
            &DiscoveryFilter::depth(depth),
            DiscoveryStatus::Approved,
            Some(&format!("depth {depth}")),
        )
        .await
    }

    /// Skip low-value candidates referenced at most `max` times.
    pub async fn skip_max_references(&self, max: u32) -> Result<u64> {
        self.bulk_transition(
            &DiscoveryFilter::max_references(max),
            DiscoveryStatus::Skipped,
            Some(&format!("referenced at most {max} times")),
        )
        .await
    }

    // -- sweeps and export --------------------------------------------------

    /// Probe every pending candidate and move definitive 404s to `failed_404`.
    #[instrument(skip_all)]
    pub async fn check_pending(&self, probe: &PageExistenceProbe) -> Result<CheckStats> {
        let pending = self.pending_review(&DiscoveryFilter::all()).await?;
        let results: Vec<(PageId, u16)> = stream::iter(pending)
            .map(|page| async move {
                let status = probe.exists(&page.target_page_id).await.status;
                (page.target_page_id, status)
            })
            .buffer_unordered(probe.config().concurrency)
            .collect()
            .await;

        let mut stats = CheckStats::default();
        for (target, status) in results {
            stats.checked += 1;
            match status {
                200 => stats.found += 1,
                404 => {
                    if self.mark_not_found(&target).await? {
                        stats.not_found += 1;
                    }
                }
                other => {
                    if other != 0 {
                        warn!(page = %target, status = other, "unexpected status");
                    }
                    stats.errors += 1;
                }
            }
        }
        info!(
            checked = stats.checked,
            found = stats.found,
            not_found = stats.not_found,
            errors = stats.errors,
            "404 sweep complete"
        );
        Ok(stats)
    }

    /// Numbered `N→URL` page list of candidates in `status`.
    pub async fn export_list(&self, status: DiscoveryStatus) -> Result<String> {
        let pages = self
            .store
            .discovered_pages(Some(status), &DiscoveryFilter::all())
            .await?;
        Ok(export_lines(&self.wiki, &pages))
    }

    /// Write [`Self::export_list`] to `path`. Returns the number of entries.
    pub async fn export(&self, status: DiscoveryStatus, path: &Path) -> Result<usize> {
        let list = self.export_list(status).await?;
        tokio::fs::write(path, &list)
            .await
            .map_err(|e| WikiAccessError::io(path, e))?;
        Ok(list.lines().count())
    }

    async fn require(&self, target: &PageId) -> Result<DiscoveredPage> {
        self.store
            .discovered_page(target)
            .await?
            .ok_or_else(|| WikiAccessError::NotFound(format!("discovered page {target}")))
    }
}

/// Only decisions can be requested; `converted` is set by the pipeline.
fn ensure_decision(to: DiscoveryStatus) -> Result<()> {
    match to {
        DiscoveryStatus::Approved | DiscoveryStatus::Skipped | DiscoveryStatus::Failed404 => Ok(()),
        other => Err(WikiAccessError::validation(format!(
            "cannot transition a discovered page to {other}"
        ))),
    }
}

fn export_lines(wiki: &WikiSource, pages: &[DiscoveredPage]) -> String {
    pages
        .iter()
        .enumerate()
        .map(|(i, p)| format!("{}→{}\n", i + 1, wiki.page_url(&p.target_page_id)))
        .collect()
}
