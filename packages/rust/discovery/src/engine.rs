//! Turns the broken links of a batch into discovery candidates.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use wikiaccess_shared::{
    BrokenLinkTarget, DiscoveryStatus, LinkSource, PageId, ResolutionStatus, Result,
    WikiAccessError, WikiSource,
};
use wikiaccess_storage::{DiscoveryFilter, NewDiscoveredPage, Store};

use crate::probe::PageExistenceProbe;

const NOT_FOUND_REASON: &str = "HTTP 404 - page not found";

/// Counters for one discovery run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryStats {
    /// Distinct missing targets referenced from pages converted in the batch.
    pub total_broken_targets: u32,
    pub new_discoveries: u32,
    pub already_known: u32,
    /// Targets that the batch itself rendered.
    pub already_converted: u32,
    pub external_links: u32,
    /// New discoveries that a probe confirmed as missing on the wiki.
    pub failed_404: u32,
    pub depth_limit_reached: bool,
}

enum Recorded {
    New(i64),
    Known { added_references: u32 },
}

// ---------------------------------------------------------------------------
// DiscoveryEngine
// ---------------------------------------------------------------------------

pub struct DiscoveryEngine {
    store: Arc<Store>,
    wiki: WikiSource,
    max_depth: u32,
    probe: Option<Arc<PageExistenceProbe>>,
}

impl DiscoveryEngine {
    pub fn new(store: Arc<Store>, wiki: WikiSource, max_depth: u32) -> Self {
        Self {
            store,
            wiki,
            max_depth,
            probe: None,
        }
    }

    /// Check each new discovery on the wiki and mark definitive 404s.
    pub fn with_probe(mut self, probe: Arc<PageExistenceProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// Record the missing targets of `batch_id` as candidates one level
    /// below the pages that reference them.
    ///
    /// A page converted in the batch sits at its own discovery depth when it
    /// was an approved discovery, and at `current_depth` otherwise. Pages at
    /// the maximum depth are not expanded; when none is left the run does
    /// nothing. A target is inserted at most once ever; later runs only add
    /// new referencing sources and grow its reference count by their link
    /// rows.
    #[instrument(skip(self), fields(max_depth = self.max_depth))]
    pub async fn discover_from_batch(
        &self,
        batch_id: &str,
        current_depth: u32,
    ) -> Result<DiscoveryStats> {
        let mut stats = DiscoveryStats::default();
        if self.store.get_batch(batch_id).await?.is_none() {
            return Err(WikiAccessError::NotFound(format!("batch {batch_id}")));
        }

        let converted = self.store.converted_pages(batch_id).await?;
        let depths = self
            .source_depths(batch_id, &converted, current_depth)
            .await?;
        let shallowest = depths.values().min().copied().unwrap_or(current_depth);
        if shallowest >= self.max_depth {
            info!("maximum discovery depth reached, skipping");
            stats.depth_limit_reached = true;
            return Ok(stats);
        }

        let broken = self.store.broken_links(Some(batch_id)).await?;
        stats.external_links = self
            .store
            .count_links(batch_id, ResolutionStatus::External)
            .await?;

        let mut new_ids = Vec::new();
        for target in broken {
            let Some((target_id, sources, source_depth)) =
                expandable(target, &depths, self.max_depth)
            else {
                continue;
            };
            stats.total_broken_targets += 1;

            if converted.contains(&target_id) {
                debug!(target = %target_id, "target rendered in this batch");
                stats.already_converted += 1;
                continue;
            }

            let depth = source_depth + 1;
            match self.record(batch_id, &target_id, sources, depth).await? {
                Recorded::New(row_id) => {
                    info!(target = %target_id, depth, "discovered page");
                    stats.new_discoveries += 1;
                    new_ids.push((row_id, target_id));
                }
                Recorded::Known { added_references } => {
                    debug!(target = %target_id, added_references, "already discovered");
                    stats.already_known += 1;
                }
            }
        }

        if let Some(probe) = &self.probe {
            stats.failed_404 = self.probe_new(probe, new_ids).await?;
        }

        info!(
            new = stats.new_discoveries,
            known = stats.already_known,
            failed_404 = stats.failed_404,
            "discovery complete"
        );
        Ok(stats)
    }

    /// Run discovery at the batch's recorded depth and store the number of
    /// new discoveries on the batch while it is still open.
    #[instrument(skip(self))]
    pub async fn auto_discover(&self, batch_id: &str) -> Result<DiscoveryStats> {
        let batch = self
            .store
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| WikiAccessError::NotFound(format!("batch {batch_id}")))?;

        let stats = self
            .discover_from_batch(batch_id, batch.discovery_depth)
            .await?;

        let id = batch_id.to_string();
        let count = stats.new_discoveries;
        let updated = self
            .store
            .with_transaction(move |tx| {
                Box::pin(async move { tx.set_batch_discovered_count(&id, count).await })
            })
            .await?;
        if !updated {
            warn!("batch already closed; discovered count not recorded");
        }
        Ok(stats)
    }

    /// Discovery depth of each page converted in the batch.
    async fn source_depths(
        &self,
        batch_id: &str,
        converted: &BTreeSet<PageId>,
        batch_depth: u32,
    ) -> Result<BTreeMap<PageId, u32>> {
        let mut depths: BTreeMap<PageId, u32> =
            converted.iter().map(|p| (p.clone(), batch_depth)).collect();
        let approved = self
            .store
            .discovered_pages(Some(DiscoveryStatus::Converted), &DiscoveryFilter::all())
            .await?;
        for page in approved {
            if page.converted_batch_id.as_deref() != Some(batch_id) {
                continue;
            }
            if let Some(depth) = depths.get_mut(&page.target_page_id) {
                *depth = page.depth;
            }
        }
        Ok(depths)
    }

    /// Insert or update one target and its sources in a single transaction.
    async fn record(
        &self,
        batch_id: &str,
        target: &PageId,
        sources: Vec<(LinkSource, u32)>,
        depth: u32,
    ) -> Result<Recorded> {
        let candidate = NewDiscoveredPage {
            target_page_id: target.clone(),
            wiki_url: self.wiki.base_url().to_string(),
            depth,
            batch_id: batch_id.to_string(),
            reference_count: sources.iter().map(|(_, n)| n).sum(),
        };

        self.store
            .with_transaction(move |tx| {
                Box::pin(async move {
                    if let Some(row_id) = tx.insert_discovered_page(&candidate).await? {
                        for (source, _) in &sources {
                            tx.add_discovery_source(row_id, source, &candidate.batch_id)
                                .await?;
                        }
                        return Ok(Recorded::New(row_id));
                    }

                    let existing = tx
                        .discovered_page(&candidate.target_page_id)
                        .await?
                        .ok_or_else(|| {
                            WikiAccessError::Storage(format!(
                                "discovered page {} vanished",
                                candidate.target_page_id
                            ))
                        })?;
                    let mut added_references = 0;
                    for (source, links) in &sources {
                        if tx
                            .add_discovery_source(existing.id, source, &candidate.batch_id)
                            .await?
                        {
                            added_references += links;
                        }
                    }
                    tx.increment_reference_count(existing.id, added_references)
                        .await?;
                    Ok(Recorded::Known { added_references })
                })
            })
            .await
    }

    /// Probe new discoveries concurrently; move definitive 404s to `failed_404`.
    async fn probe_new(
        &self,
        probe: &PageExistenceProbe,
        new_ids: Vec<(i64, PageId)>,
    ) -> Result<u32> {
        let checked: Vec<(i64, u16)> = stream::iter(new_ids)
            .map(|(row_id, target)| async move { (row_id, probe.exists(&target).await.status) })
            .buffer_unordered(probe.config().concurrency)
            .collect()
            .await;

        let mut failed = 0;
        for (row_id, status) in checked {
            if status != 404 {
                continue;
            }
            let moved = self
                .store
                .with_transaction(move |tx| {
                    Box::pin(async move {
                        tx.transition_discovery(
                            row_id,
                            DiscoveryStatus::Discovered,
                            DiscoveryStatus::Failed404,
                            Some(NOT_FOUND_REASON),
                            Some(404),
                        )
                        .await
                    })
                })
                .await?;
            if moved {
                failed += 1;
            }
        }
        Ok(failed)
    }
}

/// Keep only references from pages converted in the batch that sit below the
/// maximum depth, one entry per source page with its number of link rows. Also
/// returns the shallowest depth among the kept sources.
fn expandable(
    target: BrokenLinkTarget,
    depths: &BTreeMap<PageId, u32>,
    max_depth: u32,
) -> Option<(PageId, Vec<(LinkSource, u32)>, u32)> {
    let target_id = match PageId::parse(&target.target_page_id) {
        Ok(id) => id,
        Err(e) => {
            warn!(target = %target.target_page_id, error = %e, "unusable link target");
            return None;
        }
    };

    let mut sources: Vec<(LinkSource, u32)> = Vec::new();
    let mut shallowest = max_depth;
    for source in target.sources {
        let depth = PageId::parse(&source.source_page_id)
            .ok()
            .and_then(|id| depths.get(&id).copied());
        let Some(depth) = depth.filter(|d| *d < max_depth) else {
            continue;
        };
        shallowest = shallowest.min(depth);
        // Sources arrive grouped by source page.
        match sources.last_mut() {
            Some((last, n)) if last.source_page_id == source.source_page_id => *n += 1,
            _ => sources.push((source, 1)),
        }
    }
    (!sources.is_empty()).then_some((target_id, sources, shallowest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;
    use wikiaccess_shared::{
        ArtifactPaths, LinkRecord, LinkType, NewBatch, NewPage, PageStatus, ProbeConfig, Scores,
    };
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const WIKI: &str = "https://wiki.example.org";

    fn pid(s: &str) -> PageId {
        PageId::parse(s).unwrap()
    }

    async fn test_store() -> Arc<Store> {
        let db = std::env::temp_dir().join(format!("wa_discovery_{}.db", Uuid::now_v7()));
        Arc::new(Store::open(&db).await.unwrap())
    }

    fn engine(store: &Arc<Store>, max_depth: u32) -> DiscoveryEngine {
        DiscoveryEngine::new(store.clone(), WikiSource::new(WIKI).unwrap(), max_depth)
    }

    fn link(source: &str, target: &str, resolution: ResolutionStatus, batch: &str) -> LinkRecord {
        LinkRecord {
            source_page_id: source.into(),
            target: target.into(),
            link_text: Some(format!("see {target}")),
            link_type: if resolution == ResolutionStatus::External {
                LinkType::External
            } else {
                LinkType::Internal
            },
            resolution,
            batch_id: batch.into(),
        }
    }

    /// Batch converting `pages`, with the given link rows recorded.
    async fn seed_batch(store: &Store, batch: &str, depth: u32, pages: &[&str], links: &[LinkRecord]) {
        let tx = store.begin().await.unwrap();
        tx.open_batch(&NewBatch {
            batch_id: batch.into(),
            wiki_url: WIKI.into(),
            discovery_depth: depth,
            parent_batch_id: None,
            discovery_enabled: true,
        })
        .await
        .unwrap();
        for page in pages {
            tx.insert_page(&NewPage {
                wiki_url: WIKI.into(),
                page_id: pid(page),
                batch_id: batch.into(),
                status: PageStatus::Success,
                artifacts: ArtifactPaths::default(),
                scores: Scores::default(),
                image_count: 0,
                image_success_count: 0,
                image_failed_count: 0,
                duration_secs: None,
                error_message: None,
                converted_at: None,
            })
            .await
            .unwrap();
        }
        for l in links {
            tx.insert_link(l).await.unwrap();
        }
        tx.commit().await.unwrap();
    }

    /// A and B converted; A links to B (found), C (missing) and an external site.
    async fn a_b_batch(store: &Store) {
        seed_batch(
            store,
            "b1",
            0,
            &["A", "B"],
            &[
                link("A", "B", ResolutionStatus::Found, "b1"),
                link("A", "C", ResolutionStatus::Missing, "b1"),
                link("A", "https://elsewhere.org", ResolutionStatus::External, "b1"),
            ],
        )
        .await;
    }

    #[tokio::test]
    async fn discovers_missing_target_once() {
        let store = test_store().await;
        a_b_batch(&store).await;

        let stats = engine(&store, 2).discover_from_batch("b1", 0).await.unwrap();
        assert_eq!(stats.new_discoveries, 1);
        assert_eq!(stats.already_known, 0);
        assert_eq!(stats.external_links, 1);

        let c = store.discovered_page(&pid("C")).await.unwrap().unwrap();
        assert_eq!(c.depth, 1);
        assert_eq!(c.reference_count, 1);
        assert_eq!(c.status, DiscoveryStatus::Discovered);
        assert_eq!(c.first_discovered_by_batch.as_deref(), Some("b1"));

        let sources = store.discovery_sources(c.id).await.unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].source_page_id, "A");
    }

    #[tokio::test]
    async fn rerun_is_idempotent() {
        let store = test_store().await;
        a_b_batch(&store).await;
        let engine = engine(&store, 2);
        engine.discover_from_batch("b1", 0).await.unwrap();

        let again = engine.discover_from_batch("b1", 0).await.unwrap();
        assert_eq!(again.new_discoveries, 0);
        assert_eq!(again.already_known, 1);

        let c = store.discovered_page(&pid("C")).await.unwrap().unwrap();
        assert_eq!(c.reference_count, 1);
        assert_eq!(store.discovery_sources(c.id).await.unwrap().len(), 1);
        let pending = store
            .discovered_pages(None, &wikiaccess_storage::DiscoveryFilter::all())
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn depth_limit_is_a_no_op() {
        let store = test_store().await;
        a_b_batch(&store).await;

        let stats = engine(&store, 2).discover_from_batch("b1", 2).await.unwrap();
        assert!(stats.depth_limit_reached);
        assert_eq!(stats.new_discoveries, 0);
        assert!(store.discovered_page(&pid("C")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn later_batch_adds_references_without_moving_depth() {
        let store = test_store().await;
        a_b_batch(&store).await;
        let engine = engine(&store, 3);
        engine.discover_from_batch("b1", 0).await.unwrap();

        // A depth-1 batch converts D, which links to C twice.
        seed_batch(
            &store,
            "b2",
            1,
            &["D"],
            &[
                link("D", "C", ResolutionStatus::Missing, "b2"),
                link("D", "C", ResolutionStatus::Missing, "b2"),
                // Re-recorded link of a page from an earlier batch.
                link("A", "C", ResolutionStatus::Missing, "b2"),
            ],
        )
        .await;
        let stats = engine.discover_from_batch("b2", 1).await.unwrap();
        assert_eq!(stats.already_known, 1);
        assert_eq!(stats.new_discoveries, 0);

        let c = store.discovered_page(&pid("C")).await.unwrap().unwrap();
        assert_eq!(c.depth, 1);
        assert_eq!(c.reference_count, 3);
        let sources: Vec<_> = store
            .discovery_sources(c.id)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.source_page_id)
            .collect();
        assert_eq!(sources, vec!["A", "D"]);
    }

    #[tokio::test]
    async fn approved_pages_expand_at_their_own_depth() {
        let store = test_store().await;
        seed_batch(&store, "b0", 0, &[], &[]).await;
        // c and e were discovered at depths 1 and 2, then approved together.
        let tx = store.begin().await.unwrap();
        for (target, depth) in [("c", 1), ("e", 2)] {
            let id = tx
                .insert_discovered_page(&NewDiscoveredPage {
                    target_page_id: pid(target),
                    wiki_url: WIKI.into(),
                    depth,
                    batch_id: "b0".into(),
                    reference_count: 1,
                })
                .await
                .unwrap()
                .unwrap();
            tx.transition_discovery(
                id,
                DiscoveryStatus::Discovered,
                DiscoveryStatus::Approved,
                None,
                None,
            )
            .await
            .unwrap();
        }
        tx.commit().await.unwrap();

        seed_batch(
            &store,
            "b1",
            2,
            &["c", "e"],
            &[
                link("c", "f", ResolutionStatus::Missing, "b1"),
                link("e", "g", ResolutionStatus::Missing, "b1"),
            ],
        )
        .await;
        let tx = store.begin().await.unwrap();
        assert!(tx.mark_converted(&pid("c"), "b1").await.unwrap());
        assert!(tx.mark_converted(&pid("e"), "b1").await.unwrap());
        tx.commit().await.unwrap();

        let stats = engine(&store, 2).auto_discover("b1").await.unwrap();
        assert!(!stats.depth_limit_reached);
        assert_eq!(stats.new_discoveries, 1);

        let f = store.discovered_page(&pid("f")).await.unwrap().unwrap();
        assert_eq!(f.depth, 2);
        assert_eq!(f.status, DiscoveryStatus::Discovered);
        // e already sits at the maximum depth.
        assert!(store.discovered_page(&pid("g")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn target_rendered_in_batch_is_not_discovered() {
        let store = test_store().await;
        seed_batch(
            &store,
            "b1",
            0,
            &["A", "B"],
            &[link("A", "B", ResolutionStatus::Missing, "b1")],
        )
        .await;

        let stats = engine(&store, 2).discover_from_batch("b1", 0).await.unwrap();
        assert_eq!(stats.already_converted, 1);
        assert_eq!(stats.new_discoveries, 0);
        assert!(store.discovered_page(&pid("B")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn auto_discover_uses_batch_depth_and_records_count() {
        let store = test_store().await;
        a_b_batch(&store).await;

        let stats = engine(&store, 2).auto_discover("b1").await.unwrap();
        assert_eq!(stats.new_discoveries, 1);
        let batch = store.get_batch("b1").await.unwrap().unwrap();
        assert_eq!(batch.pages_discovered_count, 1);

        let missing = engine(&store, 2).auto_discover("nope").await;
        assert!(matches!(missing, Err(WikiAccessError::NotFound(_))));
    }

    #[tokio::test]
    async fn probe_marks_definitive_404() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(query_param("id", "C"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let store = test_store().await;
        a_b_batch(&store).await;
        let wiki = WikiSource::new(&server.uri()).unwrap();
        let probe = PageExistenceProbe::new(
            wiki.clone(),
            ProbeConfig {
                timeout: Duration::from_secs(2),
                retries: 0,
                backoff: Duration::from_millis(10),
                concurrency: 2,
            },
        )
        .unwrap()
        .with_store(store.clone());
        let engine = DiscoveryEngine::new(store.clone(), wiki, 2).with_probe(Arc::new(probe));

        let stats = engine.discover_from_batch("b1", 0).await.unwrap();
        assert_eq!(stats.new_discoveries, 1);
        assert_eq!(stats.failed_404, 1);

        let c = store.discovered_page(&pid("C")).await.unwrap().unwrap();
        assert_eq!(c.status, DiscoveryStatus::Failed404);
        assert_eq!(c.http_status_code, Some(404));
    }
}
