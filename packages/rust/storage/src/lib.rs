//! Embedded libSQL storage for conversion history and discovery state.
//!
//! The [`Store`] is the system of record for batches, page conversions,
//! images, links, accessibility issues, and discovered pages. It is opened
//! once and shared (`Arc<Store>`) with every component that needs it.
//!
//! **Access rules:**
//! - Reads go through [`Store`] methods on a shared read connection.
//! - Writes only exist on [`StoreTx`]. Each transaction runs on its own
//!   connection under `BEGIN IMMEDIATE`; dropping it without
//!   [`StoreTx::commit`] rolls everything back.

mod migrations;
mod rows;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use libsql::{Connection, Database, Row, Rows, params};
use tracing::{debug, warn};
use wikiaccess_shared::{
    AccessibilityIssue, Batch, BrokenLinkTarget, DiscoveredPage, DiscoveryStatus,
    DiscoverySource, ImageFailureStat, ImageRecord, LinkRecord, LinkSource, NewBatch, NewPage,
    PageId, PageRecord, ResolutionStatus, Result, ScorePoint, WikiAccessError,
};

use crate::rows::{
    BATCH_COLUMNS, DISCOVERED_COLUMNS, IMAGE_COLUMNS, ISSUE_COLUMNS, LINK_COLUMNS, PAGE_COLUMNS,
    now, row_to_batch, row_to_discovered, row_to_image, row_to_issue, row_to_link, row_to_page,
    row_to_score_point, row_to_source, scalar, ts,
};

/// Milliseconds a connection waits on a locked database before failing.
const BUSY_TIMEOUT_MS: u32 = 5_000;

/// Primary storage handle wrapping a libSQL database.
pub struct Store {
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Store {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| WikiAccessError::io(parent, e))?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(WikiAccessError::storage)?;
        let conn = connect(&db).await?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .await
            .map_err(WikiAccessError::storage)?;

        let store = Self {
            db,
            conn,
            readonly: false,
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Open an existing database for reporting only.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(WikiAccessError::NotFound(format!(
                "database {}",
                path.display()
            )));
        }
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(WikiAccessError::storage)?;
        let conn = connect(&db).await?;
        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(&format!("BEGIN;\n{}\nCOMMIT;", migration.sql))
                    .await
                    .map_err(|e| {
                        WikiAccessError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Current schema version, or 0 if no migrations have been applied.
    pub async fn schema_version(&self) -> u32 {
        match self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await
        {
            Ok(mut rows) => scalar(&mut rows).await.unwrap_or(0) as u32,
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Start a write transaction on a dedicated connection.
    pub async fn begin(&self) -> Result<StoreTx> {
        if self.readonly {
            return Err(WikiAccessError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        let conn = connect(&self.db).await?;
        conn.execute("BEGIN IMMEDIATE", params![])
            .await
            .map_err(WikiAccessError::storage)?;
        Ok(StoreTx {
            conn,
            finished: false,
        })
    }

    /// Run `f` inside one transaction: commit on `Ok`, roll back on `Err`.
    ///
    /// The closure receives the transaction by reference and must move any
    /// data it needs into the returned future.
    pub async fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'t> FnOnce(&'t StoreTx) -> BoxFuture<'t, Result<T>>,
    {
        let tx = self.begin().await?;
        let outcome = f(&tx).await;
        match outcome {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Batches
    // -----------------------------------------------------------------------

    pub async fn get_batch(&self, batch_id: &str) -> Result<Option<Batch>> {
        fetch_batch(&self.conn, batch_id).await
    }

    /// Most recent batches first.
    pub async fn list_batches(&self, limit: u32) -> Result<Vec<Batch>> {
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {BATCH_COLUMNS} FROM batches ORDER BY started_at DESC, batch_id DESC LIMIT ?1"
                ),
                params![i64::from(limit)],
            )
            .await
            .map_err(WikiAccessError::storage)?;
        collect(rows, row_to_batch).await
    }

    // -----------------------------------------------------------------------
    // Page conversions
    // -----------------------------------------------------------------------

    /// Conversion attempts for a page, newest first.
    pub async fn page_history(
        &self,
        wiki_url: &str,
        page_id: &PageId,
        limit: u32,
    ) -> Result<Vec<PageRecord>> {
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {PAGE_COLUMNS} FROM pages
                     WHERE wiki_url = ?1 AND page_id = ?2
                     ORDER BY converted_at DESC, id DESC LIMIT ?3"
                ),
                params![wiki_url, page_id.as_str(), i64::from(limit)],
            )
            .await
            .map_err(WikiAccessError::storage)?;
        collect(rows, row_to_page).await
    }

    /// Whether the page has a `SUCCESS` row newer than `window` ago.
    pub async fn was_recently_converted(
        &self,
        wiki_url: &str,
        page_id: &PageId,
        window: Duration,
    ) -> Result<bool> {
        let window = chrono::Duration::from_std(window)
            .map_err(|e| WikiAccessError::validation(format!("freshness window: {e}")))?;
        let cutoff = ts(Utc::now() - window);
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM pages
                 WHERE wiki_url = ?1 AND page_id = ?2 AND status = 'SUCCESS'
                   AND converted_at >= ?3",
                params![wiki_url, page_id.as_str(), cutoff],
            )
            .await
            .map_err(WikiAccessError::storage)?;
        Ok(scalar(&mut rows).await? > 0)
    }

    /// Page ids rendered (`SUCCESS` or `PARTIAL`) within a batch.
    pub async fn converted_pages(&self, batch_id: &str) -> Result<BTreeSet<PageId>> {
        let ids = self
            .page_ids_with_status(batch_id, "status IN ('SUCCESS', 'PARTIAL')")
            .await?;
        Ok(ids.into_iter().collect())
    }

    /// Page ids that failed within a batch.
    pub async fn failed_pages(&self, batch_id: &str) -> Result<Vec<PageId>> {
        self.page_ids_with_status(batch_id, "status = 'FAILED'")
            .await
    }

    async fn page_ids_with_status(&self, batch_id: &str, predicate: &str) -> Result<Vec<PageId>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT DISTINCT page_id FROM pages WHERE batch_id = ?1 AND {predicate}
                     ORDER BY page_id"
                ),
                params![batch_id],
            )
            .await
            .map_err(WikiAccessError::storage)?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next().await.map_err(WikiAccessError::storage)? {
            let raw: String = row.get(0).map_err(WikiAccessError::storage)?;
            ids.push(PageId::parse(&raw).map_err(WikiAccessError::storage)?);
        }
        Ok(ids)
    }

    /// All conversion rows recorded by a batch, in insertion order.
    pub async fn batch_pages(&self, batch_id: &str) -> Result<Vec<PageRecord>> {
        let rows = self
            .conn
            .query(
                &format!("SELECT {PAGE_COLUMNS} FROM pages WHERE batch_id = ?1 ORDER BY id"),
                params![batch_id],
            )
            .await
            .map_err(WikiAccessError::storage)?;
        collect(rows, row_to_page).await
    }

    /// Latest rendered row (with an HTML artifact) per page, across all batches.
    pub async fn rendered_pages(&self, wiki_url: &str) -> Result<Vec<PageRecord>> {
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {PAGE_COLUMNS} FROM pages p
                     WHERE p.wiki_url = ?1
                       AND p.id = (
                         SELECT MAX(q.id) FROM pages q
                         WHERE q.wiki_url = p.wiki_url AND q.page_id = p.page_id
                           AND q.status IN ('SUCCESS', 'PARTIAL') AND q.html_path IS NOT NULL
                       )
                     ORDER BY p.page_id"
                ),
                params![wiki_url],
            )
            .await
            .map_err(WikiAccessError::storage)?;
        collect(rows, row_to_page).await
    }

    /// Accessibility score history for a page, oldest first.
    pub async fn accessibility_trends(
        &self,
        wiki_url: &str,
        page_id: &PageId,
    ) -> Result<Vec<ScorePoint>> {
        let rows = self
            .conn
            .query(
                "SELECT converted_at, batch_id, html_aa_score, html_aaa_score,
                        docx_aa_score, docx_aaa_score
                 FROM pages WHERE wiki_url = ?1 AND page_id = ?2
                 ORDER BY converted_at ASC, id ASC",
                params![wiki_url, page_id.as_str()],
            )
            .await
            .map_err(WikiAccessError::storage)?;
        collect(rows, row_to_score_point).await
    }

    // -----------------------------------------------------------------------
    // Images and accessibility issues
    // -----------------------------------------------------------------------

    /// Failed image attempts, optionally limited to one batch.
    pub async fn failed_images(&self, batch_id: Option<&str>) -> Result<Vec<ImageRecord>> {
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {IMAGE_COLUMNS} FROM images
                     WHERE status = 'failed' AND (?1 IS NULL OR batch_id = ?1)
                     ORDER BY id"
                ),
                params![batch_id],
            )
            .await
            .map_err(WikiAccessError::storage)?;
        collect(rows, row_to_image).await
    }

    /// Failure rate per image source, most failures first.
    pub async fn image_failure_stats(&self) -> Result<Vec<ImageFailureStat>> {
        let mut rows = self
            .conn
            .query(
                "SELECT source_url,
                        SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END) AS failure_count,
                        COUNT(*) AS total_attempts
                 FROM images
                 GROUP BY source_url
                 HAVING failure_count > 0
                 ORDER BY failure_count DESC, source_url",
                params![],
            )
            .await
            .map_err(WikiAccessError::storage)?;

        let mut stats = Vec::new();
        while let Some(row) = rows.next().await.map_err(WikiAccessError::storage)? {
            let failure_count = row.get::<i64>(1).map_err(WikiAccessError::storage)? as u32;
            let total_attempts = row.get::<i64>(2).map_err(WikiAccessError::storage)? as u32;
            let rate = 100.0 * f64::from(failure_count) / f64::from(total_attempts.max(1));
            stats.push(ImageFailureStat {
                source_url: row.get(0).map_err(WikiAccessError::storage)?,
                failure_count,
                total_attempts,
                failure_rate: (rate * 10.0).round() / 10.0,
            });
        }
        Ok(stats)
    }

    pub async fn page_issues(
        &self,
        page_id: &PageId,
        batch_id: &str,
    ) -> Result<Vec<AccessibilityIssue>> {
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {ISSUE_COLUMNS} FROM accessibility_issues
                     WHERE page_id = ?1 AND batch_id = ?2 ORDER BY id"
                ),
                params![page_id.as_str(), batch_id],
            )
            .await
            .map_err(WikiAccessError::storage)?;
        collect(rows, row_to_issue).await
    }

    // -----------------------------------------------------------------------
    // Links
    // -----------------------------------------------------------------------

    /// Missing internal references grouped by target, most referenced first.
    ///
    /// With `batch_id = None`, each source page contributes only the links
    /// recorded by the most recent batch that resolved it, even when that
    /// batch recorded no links for it.
    pub async fn broken_links(&self, batch_id: Option<&str>) -> Result<Vec<BrokenLinkTarget>> {
        let mut rows = self
            .conn
            .query(
                "SELECT l.target_page_id, l.source_page_id, l.link_text
                 FROM links l
                 WHERE l.resolution_status = 'missing' AND l.link_type = 'internal'
                   AND (
                     (?1 IS NOT NULL AND l.batch_id = ?1)
                     OR (?1 IS NULL AND l.batch_id = COALESCE(
                           (SELECT r.batch_id FROM page_resolutions r
                            WHERE r.source_page_id = l.source_page_id),
                           (SELECT l2.batch_id FROM links l2
                            WHERE l2.source_page_id = l.source_page_id
                            ORDER BY l2.id DESC LIMIT 1)))
                   )
                 ORDER BY l.target_page_id, l.source_page_id, l.id",
                params![batch_id],
            )
            .await
            .map_err(WikiAccessError::storage)?;

        let mut grouped: Vec<BrokenLinkTarget> = Vec::new();
        while let Some(row) = rows.next().await.map_err(WikiAccessError::storage)? {
            let target: String = row.get(0).map_err(WikiAccessError::storage)?;
            let source = LinkSource {
                source_page_id: row.get(1).map_err(WikiAccessError::storage)?,
                link_text: row.get::<String>(2).ok(),
            };
            match grouped.last_mut() {
                Some(last) if last.target_page_id == target => {
                    last.reference_count += 1;
                    last.sources.push(source);
                }
                _ => grouped.push(BrokenLinkTarget {
                    target_page_id: target,
                    reference_count: 1,
                    sources: vec![source],
                }),
            }
        }
        // Stable: ties keep target order.
        grouped.sort_by(|a, b| b.reference_count.cmp(&a.reference_count));
        Ok(grouped)
    }

    /// Links recorded for one source page within one batch.
    pub async fn page_links(&self, source_page_id: &str, batch_id: &str) -> Result<Vec<LinkRecord>> {
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {LINK_COLUMNS} FROM links
                     WHERE source_page_id = ?1 AND batch_id = ?2 ORDER BY id"
                ),
                params![source_page_id, batch_id],
            )
            .await
            .map_err(WikiAccessError::storage)?;
        collect(rows, row_to_link).await
    }

    /// Number of link rows in a batch with the given resolution.
    pub async fn count_links(&self, batch_id: &str, resolution: ResolutionStatus) -> Result<u32> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM links WHERE batch_id = ?1 AND resolution_status = ?2",
                params![batch_id, resolution.as_str()],
            )
            .await
            .map_err(WikiAccessError::storage)?;
        Ok(scalar(&mut rows).await? as u32)
    }

    // -----------------------------------------------------------------------
    // Discovery
    // -----------------------------------------------------------------------

    pub async fn discovered_page(&self, target: &PageId) -> Result<Option<DiscoveredPage>> {
        fetch_discovered(&self.conn, target).await
    }

    pub async fn discovered_page_by_id(&self, id: i64) -> Result<Option<DiscoveredPage>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {DISCOVERED_COLUMNS} FROM discovered_pages WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(WikiAccessError::storage)?;
        match rows.next().await.map_err(WikiAccessError::storage)? {
            Some(row) => Ok(Some(row_to_discovered(&row)?)),
            None => Ok(None),
        }
    }

    /// Discovered pages matching `status` and `filter`, ordered by reference
    /// count (desc), depth (asc), then id.
    pub async fn discovered_pages(
        &self,
        status: Option<DiscoveryStatus>,
        filter: &DiscoveryFilter,
    ) -> Result<Vec<DiscoveredPage>> {
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {DISCOVERED_COLUMNS} FROM discovered_pages
                     WHERE (?1 IS NULL OR discovery_status = ?1) AND {}
                     ORDER BY reference_count DESC, discovery_depth ASC, id ASC",
                    DiscoveryFilter::SQL
                ),
                params![
                    status.map(DiscoveryStatus::as_str),
                    filter.prefix(),
                    filter.min_references.map(i64::from),
                    filter.max_references.map(i64::from),
                    filter.depth.map(i64::from),
                    filter.max_depth.map(i64::from),
                ],
            )
            .await
            .map_err(WikiAccessError::storage)?;
        collect(rows, row_to_discovered).await
    }

    /// Pages that referenced a discovered page, oldest first.
    pub async fn discovery_sources(&self, discovered_page_id: i64) -> Result<Vec<DiscoverySource>> {
        let rows = self
            .conn
            .query(
                "SELECT discovered_page_id, source_page_id, link_text, batch_id, discovered_at
                 FROM discovery_sources WHERE discovered_page_id = ?1 ORDER BY id",
                params![discovered_page_id],
            )
            .await
            .map_err(WikiAccessError::storage)?;
        collect(rows, row_to_source).await
    }

    /// Row count per discovery status; every status is present.
    pub async fn discovery_status_counts(&self) -> Result<BTreeMap<DiscoveryStatus, u32>> {
        let mut counts: BTreeMap<DiscoveryStatus, u32> =
            DiscoveryStatus::ALL.iter().map(|s| (*s, 0)).collect();
        let mut rows = self
            .conn
            .query(
                "SELECT discovery_status, COUNT(*) FROM discovered_pages GROUP BY discovery_status",
                params![],
            )
            .await
            .map_err(WikiAccessError::storage)?;
        while let Some(row) = rows.next().await.map_err(WikiAccessError::storage)? {
            let status: DiscoveryStatus = row
                .get::<String>(0)
                .map_err(WikiAccessError::storage)?
                .parse()
                .map_err(WikiAccessError::storage)?;
            let n = row.get::<i64>(1).map_err(WikiAccessError::storage)?;
            counts.insert(status, n as u32);
        }
        Ok(counts)
    }

    /// Row count per (depth, status).
    pub async fn discovery_depth_counts(&self) -> Result<Vec<DepthCount>> {
        let mut rows = self
            .conn
            .query(
                "SELECT discovery_depth, discovery_status, COUNT(*) FROM discovered_pages
                 GROUP BY discovery_depth, discovery_status
                 ORDER BY discovery_depth, discovery_status",
                params![],
            )
            .await
            .map_err(WikiAccessError::storage)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(WikiAccessError::storage)? {
            out.push(DepthCount {
                depth: row.get::<i64>(0).map_err(WikiAccessError::storage)? as u32,
                status: row
                    .get::<String>(1)
                    .map_err(WikiAccessError::storage)?
                    .parse()
                    .map_err(WikiAccessError::storage)?,
                count: row.get::<i64>(2).map_err(WikiAccessError::storage)? as u32,
            });
        }
        Ok(out)
    }
}

/// Number of discovered pages at one depth with one status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct DepthCount {
    pub depth: u32,
    pub status: DiscoveryStatus,
    pub count: u32,
}

// ---------------------------------------------------------------------------
// Filters and write parameters
// ---------------------------------------------------------------------------

/// Row filter for discovered-page queries and bulk transitions.
///
/// All set fields must match. An empty filter matches every row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryFilter {
    /// Page id prefix such as `course:notes:`. A trailing `*` is ignored.
    pub namespace: Option<String>,
    pub min_references: Option<u32>,
    pub max_references: Option<u32>,
    pub depth: Option<u32>,
    pub max_depth: Option<u32>,
}

impl DiscoveryFilter {
    /// Predicate over parameters `?2`..`?6`.
    const SQL: &'static str = "(?2 IS NULL OR substr(target_page_id, 1, length(?2)) = ?2)
         AND (?3 IS NULL OR reference_count >= ?3)
         AND (?4 IS NULL OR reference_count <= ?4)
         AND (?5 IS NULL OR discovery_depth = ?5)
         AND (?6 IS NULL OR discovery_depth <= ?6)";

    pub fn all() -> Self {
        Self::default()
    }

    pub fn namespace(prefix: impl Into<String>) -> Self {
        Self {
            namespace: Some(prefix.into()),
            ..Self::default()
        }
    }

    pub fn min_references(n: u32) -> Self {
        Self {
            min_references: Some(n),
            ..Self::default()
        }
    }

    pub fn max_references(n: u32) -> Self {
        Self {
            max_references: Some(n),
            ..Self::default()
        }
    }

    pub fn depth(depth: u32) -> Self {
        Self {
            depth: Some(depth),
            ..Self::default()
        }
    }

    pub fn up_to_depth(max_depth: u32) -> Self {
        Self {
            max_depth: Some(max_depth),
            ..Self::default()
        }
    }

    fn prefix(&self) -> Option<&str> {
        self.namespace
            .as_deref()
            .map(|p| p.trim().trim_end_matches('*').trim_start_matches(':'))
            .filter(|p| !p.is_empty())
    }
}

/// A new discovery candidate.
#[derive(Debug, Clone)]
pub struct NewDiscoveredPage {
    pub target_page_id: PageId,
    pub wiki_url: String,
    pub depth: u32,
    pub batch_id: String,
    pub reference_count: u32,
}

/// Inputs for closing a batch that are not derivable from its page rows.
#[derive(Debug, Clone, Copy, Default)]
pub struct CloseBatch {
    pub skipped_pages: u32,
    pub cancelled: bool,
}

// ---------------------------------------------------------------------------
// StoreTx
// ---------------------------------------------------------------------------

/// An open write transaction. All mutations of the store go through here.
pub struct StoreTx {
    conn: Connection,
    finished: bool,
}

impl StoreTx {
    pub async fn commit(mut self) -> Result<()> {
        self.conn
            .execute("COMMIT", params![])
            .await
            .map_err(WikiAccessError::storage)?;
        self.finished = true;
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<()> {
        self.finished = true;
        self.conn
            .execute("ROLLBACK", params![])
            .await
            .map_err(WikiAccessError::storage)?;
        Ok(())
    }

    // -- batches ------------------------------------------------------------

    /// Insert a new open batch. Fails if the id already exists.
    pub async fn open_batch(&self, batch: &NewBatch) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO batches (batch_id, wiki_url, started_at, discovery_depth,
                                      parent_batch_id, discovery_enabled)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    batch.batch_id.as_str(),
                    batch.wiki_url.as_str(),
                    now(),
                    i64::from(batch.discovery_depth),
                    batch.parent_batch_id.as_deref(),
                    i64::from(batch.discovery_enabled),
                ],
            )
            .await
            .map_err(WikiAccessError::storage)?;
        Ok(())
    }

    /// Close a batch exactly once, deriving counters from its page rows.
    pub async fn close_batch(&self, batch_id: &str, close: CloseBatch) -> Result<Batch> {
        let updated = self
            .conn
            .execute(
                "UPDATE batches SET
                   completed_at     = ?2,
                   skipped_pages    = ?3,
                   cancelled        = ?4,
                   total_pages      = ?3 + (SELECT COUNT(*) FROM pages WHERE batch_id = ?1),
                   successful_pages = (SELECT COUNT(*) FROM pages
                                       WHERE batch_id = ?1 AND status IN ('SUCCESS', 'PARTIAL')),
                   failed_pages     = (SELECT COUNT(*) FROM pages
                                       WHERE batch_id = ?1 AND status = 'FAILED'),
                   total_images     = (SELECT COALESCE(SUM(image_count), 0) FROM pages
                                       WHERE batch_id = ?1),
                   failed_images    = (SELECT COALESCE(SUM(image_failed_count), 0) FROM pages
                                       WHERE batch_id = ?1)
                 WHERE batch_id = ?1 AND completed_at IS NULL",
                params![
                    batch_id,
                    now(),
                    i64::from(close.skipped_pages),
                    i64::from(close.cancelled)
                ],
            )
            .await
            .map_err(WikiAccessError::storage)?;

        let batch = fetch_batch(&self.conn, batch_id)
            .await?
            .ok_or_else(|| WikiAccessError::NotFound(format!("batch {batch_id}")))?;
        if updated == 0 {
            return Err(WikiAccessError::validation(format!(
                "batch {batch_id} is already closed"
            )));
        }
        Ok(batch)
    }

    /// Record how many pages discovery found. Closed batches are left untouched.
    pub async fn set_batch_discovered_count(&self, batch_id: &str, count: u32) -> Result<bool> {
        let updated = self
            .conn
            .execute(
                "UPDATE batches SET pages_discovered_count = ?2
                 WHERE batch_id = ?1 AND completed_at IS NULL",
                params![batch_id, i64::from(count)],
            )
            .await
            .map_err(WikiAccessError::storage)?;
        Ok(updated > 0)
    }

    pub async fn get_batch(&self, batch_id: &str) -> Result<Option<Batch>> {
        fetch_batch(&self.conn, batch_id).await
    }

    // -- pages, images, issues ---------------------------------------------

    /// Append a conversion attempt. Returns the row id.
    pub async fn insert_page(&self, page: &NewPage) -> Result<i64> {
        let converted_at = page.converted_at.map(ts).unwrap_or_else(now);
        let mut rows = self
            .conn
            .query(
                "INSERT INTO pages (wiki_url, page_id, batch_id, status, markdown_path, html_path,
                                    docx_path, html_aa_score, html_aaa_score, docx_aa_score,
                                    docx_aaa_score, image_count, image_success_count,
                                    image_failed_count, converted_at, duration_secs, error_message)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
                 RETURNING id",
                params![
                    page.wiki_url.as_str(),
                    page.page_id.as_str(),
                    page.batch_id.as_str(),
                    page.status.as_str(),
                    page.artifacts.markdown.as_deref(),
                    page.artifacts.html.as_deref(),
                    page.artifacts.docx.as_deref(),
                    page.scores.html_aa.map(i64::from),
                    page.scores.html_aaa.map(i64::from),
                    page.scores.docx_aa.map(i64::from),
                    page.scores.docx_aaa.map(i64::from),
                    i64::from(page.image_count),
                    i64::from(page.image_success_count),
                    i64::from(page.image_failed_count),
                    converted_at,
                    page.duration_secs,
                    page.error_message.as_deref(),
                ],
            )
            .await
            .map_err(WikiAccessError::storage)?;
        scalar(&mut rows).await
    }

    pub async fn insert_image(&self, image: &ImageRecord) -> Result<i64> {
        let mut rows = self
            .conn
            .query(
                "INSERT INTO images (page_id, batch_id, image_type, source_url, local_filename,
                                     status, file_size, dimensions, alt_text, alt_text_quality,
                                     error_message, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 RETURNING id",
                params![
                    image.page_id.as_str(),
                    image.batch_id.as_str(),
                    image.image_type.as_str(),
                    image.source_url.as_str(),
                    image.local_filename.as_deref(),
                    image.status.as_str(),
                    image.file_size.map(|v| v as i64),
                    image.dimensions.as_deref(),
                    image.alt_text.as_deref(),
                    image.alt_text_quality.map(|q| q.as_str()),
                    image.error_message.as_deref(),
                    now(),
                ],
            )
            .await
            .map_err(WikiAccessError::storage)?;
        scalar(&mut rows).await
    }

    pub async fn insert_issue(&self, issue: &AccessibilityIssue) -> Result<i64> {
        let mut rows = self
            .conn
            .query(
                "INSERT INTO accessibility_issues (page_id, batch_id, format, level, issue_code,
                                                   issue_message, element_selector, detected_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 RETURNING id",
                params![
                    issue.page_id.as_str(),
                    issue.batch_id.as_str(),
                    issue.format.as_str(),
                    issue.level.as_str(),
                    issue.code.as_str(),
                    issue.message.as_deref(),
                    issue.selector.as_deref(),
                    now(),
                ],
            )
            .await
            .map_err(WikiAccessError::storage)?;
        scalar(&mut rows).await
    }

    // -- links --------------------------------------------------------------

    pub async fn insert_link(&self, link: &LinkRecord) -> Result<i64> {
        let mut rows = self
            .conn
            .query(
                "INSERT INTO links (source_page_id, target_page_id, link_text, link_type,
                                    resolution_status, batch_id, detected_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 RETURNING id",
                params![
                    link.source_page_id.as_str(),
                    link.target.as_str(),
                    link.link_text.as_deref(),
                    link.link_type.as_str(),
                    link.resolution.as_str(),
                    link.batch_id.as_str(),
                    now(),
                ],
            )
            .await
            .map_err(WikiAccessError::storage)?;
        scalar(&mut rows).await
    }

    /// Replace the link set of one source page within one batch.
    pub async fn replace_page_links(
        &self,
        source_page_id: &str,
        batch_id: &str,
        links: &[LinkRecord],
    ) -> Result<usize> {
        self.conn
            .execute(
                "DELETE FROM links WHERE source_page_id = ?1 AND batch_id = ?2",
                params![source_page_id, batch_id],
            )
            .await
            .map_err(WikiAccessError::storage)?;
        for link in links {
            self.insert_link(link).await?;
        }
        self.conn
            .execute(
                "INSERT INTO page_resolutions (source_page_id, batch_id, resolved_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(source_page_id) DO UPDATE SET
                     batch_id = excluded.batch_id,
                     resolved_at = excluded.resolved_at",
                params![source_page_id, batch_id, now()],
            )
            .await
            .map_err(WikiAccessError::storage)?;
        Ok(links.len())
    }

    // -- discovery ----------------------------------------------------------

    pub async fn discovered_page(&self, target: &PageId) -> Result<Option<DiscoveredPage>> {
        fetch_discovered(&self.conn, target).await
    }

    /// Insert a candidate unless its target already exists.
    ///
    /// Returns the new row id, or `None` when the target was already known.
    pub async fn insert_discovered_page(&self, page: &NewDiscoveredPage) -> Result<Option<i64>> {
        let mut rows = self
            .conn
            .query(
                "INSERT INTO discovered_pages (target_page_id, wiki_url, discovery_depth,
                                               discovery_status, first_discovered_at,
                                               first_discovered_by_batch, reference_count)
                 VALUES (?1, ?2, ?3, 'discovered', ?4, ?5, ?6)
                 ON CONFLICT(target_page_id) DO NOTHING
                 RETURNING id",
                params![
                    page.target_page_id.as_str(),
                    page.wiki_url.as_str(),
                    i64::from(page.depth),
                    now(),
                    page.batch_id.as_str(),
                    i64::from(page.reference_count),
                ],
            )
            .await
            .map_err(WikiAccessError::storage)?;
        match rows.next().await.map_err(WikiAccessError::storage)? {
            Some(row) => Ok(Some(row.get::<i64>(0).map_err(WikiAccessError::storage)?)),
            None => Ok(None),
        }
    }

    /// Record a referencing page. Returns `false` if this (page, source,
    /// batch) triple was already recorded.
    pub async fn add_discovery_source(
        &self,
        discovered_page_id: i64,
        source: &LinkSource,
        batch_id: &str,
    ) -> Result<bool> {
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO discovery_sources
                   (discovered_page_id, source_page_id, link_text, batch_id, discovered_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    discovered_page_id,
                    source.source_page_id.as_str(),
                    source.link_text.as_deref(),
                    batch_id,
                    now(),
                ],
            )
            .await
            .map_err(WikiAccessError::storage)?;
        Ok(inserted > 0)
    }

    pub async fn increment_reference_count(&self, discovered_page_id: i64, by: u32) -> Result<()> {
        if by == 0 {
            return Ok(());
        }
        self.conn
            .execute(
                "UPDATE discovered_pages SET reference_count = reference_count + ?2 WHERE id = ?1",
                params![discovered_page_id, i64::from(by)],
            )
            .await
            .map_err(WikiAccessError::storage)?;
        Ok(())
    }

    /// Guarded status change: only applies while the row is in `from`.
    ///
    /// Returns whether the row changed.
    pub async fn transition_discovery(
        &self,
        discovered_page_id: i64,
        from: DiscoveryStatus,
        to: DiscoveryStatus,
        reason: Option<&str>,
        http_status: Option<u16>,
    ) -> Result<bool> {
        let at = now();
        let updated = self
            .conn
            .execute(
                "UPDATE discovered_pages SET
                   discovery_status = ?3,
                   decision_made_at = ?4,
                   decision_reason  = COALESCE(?5, decision_reason),
                   http_status_code = COALESCE(?6, http_status_code),
                   last_check_at    = CASE WHEN ?6 IS NULL THEN last_check_at ELSE ?4 END
                 WHERE id = ?1 AND discovery_status = ?2",
                params![
                    discovered_page_id,
                    from.as_str(),
                    to.as_str(),
                    at,
                    reason,
                    http_status.map(i64::from),
                ],
            )
            .await
            .map_err(WikiAccessError::storage)?;
        Ok(updated > 0)
    }

    /// Move every `discovered` row matching `filter` to `to`. Returns the count.
    pub async fn bulk_transition(
        &self,
        filter: &DiscoveryFilter,
        to: DiscoveryStatus,
        reason: Option<&str>,
    ) -> Result<u64> {
        self.conn
            .execute(
                &format!(
                    "UPDATE discovered_pages SET
                       discovery_status = ?1,
                       decision_made_at = ?7,
                       decision_reason  = COALESCE(?8, decision_reason)
                     WHERE discovery_status = 'discovered' AND {}",
                    DiscoveryFilter::SQL
                ),
                params![
                    to.as_str(),
                    filter.prefix(),
                    filter.min_references.map(i64::from),
                    filter.max_references.map(i64::from),
                    filter.depth.map(i64::from),
                    filter.max_depth.map(i64::from),
                    now(),
                    reason,
                ],
            )
            .await
            .map_err(WikiAccessError::storage)
    }

    /// Mark an approved candidate as converted by `batch_id`.
    pub async fn mark_converted(&self, target: &PageId, batch_id: &str) -> Result<bool> {
        let updated = self
            .conn
            .execute(
                "UPDATE discovered_pages SET
                   discovery_status = 'converted', converted_at = ?3, converted_batch_id = ?2
                 WHERE target_page_id = ?1 AND discovery_status = 'approved'",
                params![target.as_str(), batch_id, now()],
            )
            .await
            .map_err(WikiAccessError::storage)?;
        Ok(updated > 0)
    }

    /// Persist a definitive probe result without changing status.
    pub async fn record_probe_result(&self, target: &PageId, http_status: u16) -> Result<bool> {
        let updated = self
            .conn
            .execute(
                "UPDATE discovered_pages SET
                   http_status_code = ?2, last_check_at = ?3,
                   check_attempt_count = check_attempt_count + 1
                 WHERE target_page_id = ?1",
                params![target.as_str(), i64::from(http_status), now()],
            )
            .await
            .map_err(WikiAccessError::storage)?;
        Ok(updated > 0)
    }
}

impl Drop for StoreTx {
    fn drop(&mut self) {
        // The dedicated connection closes with the handle, which rolls back.
        if !self.finished {
            debug!("transaction dropped without commit; rolling back");
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn connect(db: &Database) -> Result<Connection> {
    let conn = db.connect().map_err(WikiAccessError::storage)?;
    conn.execute_batch(&format!(
        "PRAGMA foreign_keys = ON; PRAGMA busy_timeout = {BUSY_TIMEOUT_MS};"
    ))
    .await
    .map_err(WikiAccessError::storage)?;
    Ok(conn)
}

async fn collect<T>(mut rows: Rows, decode: fn(&Row) -> Result<T>) -> Result<Vec<T>> {
    let mut out = Vec::new();
    while let Some(row) = rows.next().await.map_err(WikiAccessError::storage)? {
        out.push(decode(&row)?);
    }
    Ok(out)
}

async fn fetch_batch(conn: &Connection, batch_id: &str) -> Result<Option<Batch>> {
    let mut rows = conn
        .query(
            &format!("SELECT {BATCH_COLUMNS} FROM batches WHERE batch_id = ?1"),
            params![batch_id],
        )
        .await
        .map_err(WikiAccessError::storage)?;
    match rows.next().await.map_err(WikiAccessError::storage)? {
        Some(row) => Ok(Some(row_to_batch(&row)?)),
        None => Ok(None),
    }
}

async fn fetch_discovered(conn: &Connection, target: &PageId) -> Result<Option<DiscoveredPage>> {
    let mut rows = conn
        .query(
            &format!("SELECT {DISCOVERED_COLUMNS} FROM discovered_pages WHERE target_page_id = ?1"),
            params![target.as_str()],
        )
        .await
        .map_err(WikiAccessError::storage)?;
    match rows.next().await.map_err(WikiAccessError::storage)? {
        Some(row) => Ok(Some(row_to_discovered(&row)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests;
