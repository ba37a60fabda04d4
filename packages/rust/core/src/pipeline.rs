//! Batch conversion: render → check → persist per page, then resolve links,
//! discover new candidates, and close the batch.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use wikiaccess_discovery::{DiscoveryEngine, DiscoveryStats, PageExistenceProbe};
use wikiaccess_links::{LinkResolver, LinkStats};
use wikiaccess_shared::{
    AccessibilityIssue, ArtifactPaths, Batch, DiscoveredPage, ImageRecord, NewBatch, NewPage,
    PageId, PageStatus, PipelineConfig, Result, Scores, WcagLevel, WikiSource, new_batch_id,
};
use wikiaccess_storage::{CloseBatch, Store};

use crate::collaborators::{
    AccessibilityChecker, DocumentRenderer, RenderOutput, RenderRequest, ReportSink,
};

// ---------------------------------------------------------------------------
// Requests and results
// ---------------------------------------------------------------------------

/// Pages to convert in one batch.
#[derive(Debug, Clone, Default)]
pub struct BatchRequest {
    pub pages: Vec<PageId>,
    /// Generated when `None`.
    pub batch_id: Option<String>,
    /// Discovery depth of the requested pages; 0 for an initial page list.
    pub discovery_depth: u32,
    pub parent_batch_id: Option<String>,
    /// Overrides [`PipelineConfig::skip_recent`].
    pub skip_recent: Option<bool>,
}

impl BatchRequest {
    pub fn new(pages: Vec<PageId>) -> Self {
        Self {
            pages,
            ..Self::default()
        }
    }

    /// Convert approved discoveries. Recent conversions are never skipped.
    ///
    /// The batch records the deepest approved depth; discovery still expands
    /// each page from its own depth.
    pub fn approved(pages: &[DiscoveredPage]) -> Self {
        Self {
            pages: pages.iter().map(|p| p.target_page_id.clone()).collect(),
            discovery_depth: pages.iter().map(|p| p.depth).max().unwrap_or(0),
            skip_recent: Some(false),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageOutcome {
    Converted,
    /// Rendered, but an accessibility check failed.
    Partial,
    Failed,
    /// Converted successfully within the freshness window.
    Skipped,
    /// Not attempted because the batch was cancelled.
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct PageResult {
    pub page_id: PageId,
    pub outcome: PageOutcome,
    pub duration_secs: f64,
    pub error: Option<String>,
}

impl PageResult {
    fn new(page_id: PageId, outcome: PageOutcome) -> Self {
        Self {
            page_id,
            outcome,
            duration_secs: 0.0,
            error: None,
        }
    }

    fn failed(page_id: PageId, duration_secs: f64, error: String) -> Self {
        Self {
            page_id,
            outcome: PageOutcome::Failed,
            duration_secs,
            error: Some(error),
        }
    }
}

/// Outcome of [`ConversionPipeline::run`].
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    /// The closed batch with its final counters.
    pub batch: Batch,
    /// Per-page results in request order.
    pub pages: Vec<PageResult>,
    pub links: Option<LinkStats>,
    pub discovery: Option<DiscoveryStats>,
}

impl BatchReport {
    pub fn count(&self, outcome: PageOutcome) -> usize {
        self.pages.iter().filter(|p| p.outcome == outcome).count()
    }
}

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    fn batch_started(&self, batch_id: &str, total: usize);
    /// Called once per page, in request order.
    fn page_done(&self, result: &PageResult, current: usize, total: usize);
    fn done(&self, report: &BatchReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn batch_started(&self, _batch_id: &str, _total: usize) {}
    fn page_done(&self, _result: &PageResult, _current: usize, _total: usize) {}
    fn done(&self, _report: &BatchReport) {}
}

// ---------------------------------------------------------------------------
// ConversionPipeline
// ---------------------------------------------------------------------------

pub struct ConversionPipeline {
    store: Arc<Store>,
    wiki: WikiSource,
    config: Arc<PipelineConfig>,
    renderer: Arc<dyn DocumentRenderer>,
    checker: Option<Arc<dyn AccessibilityChecker>>,
    resolver: LinkResolver,
    discovery: DiscoveryEngine,
    sink: Option<Arc<dyn ReportSink>>,
}

impl ConversionPipeline {
    pub fn new(
        store: Arc<Store>,
        wiki: WikiSource,
        config: PipelineConfig,
        renderer: Arc<dyn DocumentRenderer>,
    ) -> Result<Self> {
        Ok(Self {
            resolver: LinkResolver::new(store.clone(), wiki.clone())?,
            discovery: DiscoveryEngine::new(store.clone(), wiki.clone(), config.max_depth),
            store,
            wiki,
            config: Arc::new(config),
            renderer,
            checker: None,
            sink: None,
        })
    }

    pub fn with_checker(mut self, checker: Arc<dyn AccessibilityChecker>) -> Self {
        self.checker = Some(checker);
        self
    }

    /// Probe new discoveries and mark definitive 404s right away.
    pub fn with_probe(mut self, probe: Arc<PageExistenceProbe>) -> Self {
        self.discovery = self.discovery.with_probe(probe);
        self
    }

    pub fn with_report_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Run one batch end to end.
    ///
    /// Per-page failures are recorded and never abort the batch. Cancellation
    /// is checked before each page; a cancelled batch skips link resolution
    /// and discovery but is still closed with the counts it reached.
    #[instrument(skip_all, fields(pages = request.pages.len(), depth = request.discovery_depth))]
    pub async fn run(
        &self,
        request: BatchRequest,
        progress: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        let batch_id = request.batch_id.clone().unwrap_or_else(new_batch_id);
        let new_batch = NewBatch {
            batch_id: batch_id.clone(),
            wiki_url: self.wiki.base_url().to_string(),
            discovery_depth: request.discovery_depth,
            parent_batch_id: request.parent_batch_id.clone(),
            discovery_enabled: self.config.enable_discovery,
        };
        self.store
            .with_transaction(move |tx| Box::pin(async move { tx.open_batch(&new_batch).await }))
            .await?;
        info!(%batch_id, "batch opened");

        let pages = dedup(request.pages);
        let total = pages.len();
        progress.batch_started(&batch_id, total);
        progress.phase("Converting pages");

        let worker = PageWorker {
            store: self.store.clone(),
            wiki: self.wiki.clone(),
            config: self.config.clone(),
            renderer: self.renderer.clone(),
            checker: self
                .checker
                .clone()
                .filter(|_| self.config.check_accessibility),
            skip_recent: request.skip_recent.unwrap_or(self.config.skip_recent),
            batch_id: batch_id.clone(),
        };
        let results = self.convert_all(&worker, pages, progress, cancel).await;

        let cancelled = results.iter().any(|r| r.outcome == PageOutcome::Cancelled);
        let skipped = results
            .iter()
            .filter(|r| r.outcome == PageOutcome::Skipped)
            .count() as u32;

        let (links, discovery) = if cancelled {
            warn!(%batch_id, "batch cancelled; skipping link resolution and discovery");
            (None, None)
        } else {
            self.resolve_and_discover(&batch_id, progress).await
        };

        progress.phase("Closing batch");
        let close = CloseBatch {
            skipped_pages: skipped,
            cancelled,
        };
        let id = batch_id.clone();
        let batch = self
            .store
            .with_transaction(move |tx| Box::pin(async move { tx.close_batch(&id, close).await }))
            .await?;
        info!(
            %batch_id,
            total = batch.total_pages,
            succeeded = batch.successful_pages,
            failed = batch.failed_pages,
            skipped = batch.skipped_pages,
            "batch closed"
        );

        if let Some(sink) = &self.sink {
            if let Err(e) = sink.batch_closed(&self.store, &batch).await {
                warn!(%batch_id, error = %e, "report sink failed");
            }
        }

        let report = BatchReport {
            batch,
            pages: results,
            links,
            discovery,
        };
        progress.done(&report);
        Ok(report)
    }

    /// Up to `concurrency` pages in flight; results in request order.
    async fn convert_all(
        &self,
        worker: &PageWorker,
        pages: Vec<PageId>,
        progress: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> Vec<PageResult> {
        let total = pages.len();
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));

        let mut handles = Vec::with_capacity(total);
        for page_id in pages {
            let worker = worker.clone();
            let sem = semaphore.clone();
            let cancel = cancel.clone();
            let id = page_id.clone();
            let handle = tokio::spawn(async move {
                let Ok(_permit) = sem.acquire_owned().await else {
                    return PageResult::new(id, PageOutcome::Cancelled);
                };
                if cancel.is_cancelled() {
                    return PageResult::new(id, PageOutcome::Cancelled);
                }
                worker.convert(id).await
            });
            handles.push((page_id, handle));
        }

        let mut results = Vec::with_capacity(total);
        for (i, (page_id, handle)) in handles.into_iter().enumerate() {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => {
                    warn!(page = %page_id, error = %e, "page task aborted");
                    PageResult::failed(page_id, 0.0, format!("page task aborted: {e}"))
                }
            };
            progress.page_done(&result, i + 1, total);
            results.push(result);
        }
        results
    }

    async fn resolve_and_discover(
        &self,
        batch_id: &str,
        progress: &dyn ProgressReporter,
    ) -> (Option<LinkStats>, Option<DiscoveryStats>) {
        progress.phase("Resolving links");
        let links = match self.resolver.rewrite_all_links(batch_id).await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(batch_id, error = %e, "link resolution failed");
                return (None, None);
            }
        };
        if !self.config.enable_discovery || links.links_broken == 0 {
            return (Some(links), None);
        }

        progress.phase("Discovering pages");
        match self.discovery.auto_discover(batch_id).await {
            Ok(stats) => (Some(links), Some(stats)),
            Err(e) => {
                warn!(batch_id, error = %e, "discovery failed");
                (Some(links), None)
            }
        }
    }
}

/// Drop repeated page ids, keeping the first occurrence.
fn dedup(pages: Vec<PageId>) -> Vec<PageId> {
    let mut seen = HashSet::new();
    pages
        .into_iter()
        .filter(|p| {
            let first = seen.insert(p.clone());
            if !first {
                debug!(page = %p, "duplicate page in request");
            }
            first
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Per-page work
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct PageWorker {
    store: Arc<Store>,
    wiki: WikiSource,
    config: Arc<PipelineConfig>,
    renderer: Arc<dyn DocumentRenderer>,
    checker: Option<Arc<dyn AccessibilityChecker>>,
    skip_recent: bool,
    batch_id: String,
}

struct CheckOutcome {
    scores: Scores,
    issues: Vec<AccessibilityIssue>,
    error: Option<String>,
}

impl PageWorker {
    #[instrument(skip_all, fields(batch = %self.batch_id, page = %page_id))]
    async fn convert(&self, page_id: PageId) -> PageResult {
        let started = Instant::now();

        if self.skip_recent {
            match self
                .store
                .was_recently_converted(self.wiki.base_url(), &page_id, self.config.freshness)
                .await
            {
                Ok(true) => {
                    debug!("converted within freshness window; skipping");
                    return PageResult::new(page_id, PageOutcome::Skipped);
                }
                Ok(false) => {}
                Err(e) => warn!(error = %e, "freshness check failed; converting anyway"),
            }
        }

        let request = RenderRequest {
            page_url: self.wiki.page_url(&page_id),
            page_id: page_id.clone(),
            output_dir: self.config.output_dir.clone(),
            formats: self.config.formats.clone(),
        };
        let rendered =
            match tokio::time::timeout(self.config.render_timeout, self.renderer.render(&request))
                .await
            {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => return self.fail(page_id, started, e.to_string()).await,
                Err(_) => {
                    let msg = format!(
                        "render timed out after {}s",
                        self.config.render_timeout.as_secs()
                    );
                    return self.fail(page_id, started, msg).await;
                }
            };

        let checked = self.check(&page_id, &rendered).await;
        let status = if checked.error.is_some() {
            PageStatus::Partial
        } else {
            PageStatus::Success
        };
        let duration_secs = started.elapsed().as_secs_f64();

        let page = NewPage {
            wiki_url: self.wiki.base_url().to_string(),
            page_id: page_id.clone(),
            batch_id: self.batch_id.clone(),
            status,
            artifacts: ArtifactPaths {
                markdown: rendered.markdown_path.clone(),
                html: rendered.html_path.clone(),
                docx: rendered.docx_path.clone(),
            },
            scores: checked.scores,
            image_count: rendered.image_stats.total,
            image_success_count: rendered.image_stats.success,
            image_failed_count: rendered.image_stats.failed,
            duration_secs: Some(duration_secs),
            error_message: checked.error.clone(),
            converted_at: None,
        };
        let images: Vec<ImageRecord> = rendered
            .images
            .into_iter()
            .map(|image| image.into_record(&page_id, &self.batch_id))
            .collect();

        if let Err(e) = self.persist(page, images, checked.issues).await {
            return self
                .fail(page_id, started, format!("failed to persist page: {e}"))
                .await;
        }

        let outcome = match status {
            PageStatus::Partial => PageOutcome::Partial,
            _ => PageOutcome::Converted,
        };
        debug!(?outcome, duration_secs, "page converted");
        PageResult {
            page_id,
            outcome,
            duration_secs,
            error: checked.error,
        }
    }

    /// Check every produced artifact. Any checker failure is reported as
    /// an error string; scores of the other formats are kept.
    async fn check(&self, page_id: &PageId, rendered: &RenderOutput) -> CheckOutcome {
        let mut outcome = CheckOutcome {
            scores: Scores::default(),
            issues: Vec::new(),
            error: None,
        };
        let Some(checker) = &self.checker else {
            return outcome;
        };

        let mut errors = Vec::new();
        for (format, path) in rendered.checkable() {
            match checker.check(Path::new(path), format).await {
                Ok(report) => {
                    if !report.warnings.is_empty() {
                        debug!(%format, warnings = report.warnings.len(), "checker warnings");
                    }
                    outcome
                        .scores
                        .set(format, report.score_aa.min(100), report.score_aaa.min(100));
                    let levels = [
                        (WcagLevel::Aa, report.issues_aa),
                        (WcagLevel::Aaa, report.issues_aaa),
                    ];
                    for (level, issues) in levels {
                        outcome
                            .issues
                            .extend(issues.into_iter().map(|issue| AccessibilityIssue {
                                page_id: page_id.to_string(),
                                batch_id: self.batch_id.clone(),
                                format,
                                level,
                                code: issue.code,
                                message: issue.message,
                                selector: issue.selector,
                            }));
                    }
                }
                Err(e) => {
                    warn!(%format, error = %e, "accessibility check failed");
                    errors.push(format!("{format}: {e}"));
                }
            }
        }
        if !errors.is_empty() {
            outcome.error = Some(errors.join("; "));
        }
        outcome
    }

    /// Page row, images, issues and the discovery status in one transaction.
    async fn persist(
        &self,
        page: NewPage,
        images: Vec<ImageRecord>,
        issues: Vec<AccessibilityIssue>,
    ) -> Result<()> {
        self.store
            .with_transaction(move |tx| {
                Box::pin(async move {
                    tx.insert_page(&page).await?;
                    for image in &images {
                        tx.insert_image(image).await?;
                    }
                    for issue in &issues {
                        tx.insert_issue(issue).await?;
                    }
                    if page.status.is_success()
                        && tx.mark_converted(&page.page_id, &page.batch_id).await?
                    {
                        info!(page = %page.page_id, "approved discovery converted");
                    }
                    Ok(())
                })
            })
            .await
    }

    /// Record a FAILED row so the page still counts toward the batch.
    async fn fail(&self, page_id: PageId, started: Instant, error: String) -> PageResult {
        warn!(%error, "page conversion failed");
        let duration_secs = started.elapsed().as_secs_f64();
        let row = NewPage::failed(
            self.wiki.base_url(),
            page_id.clone(),
            &self.batch_id,
            error.clone(),
            duration_secs,
        );
        let recorded = self
            .store
            .with_transaction(move |tx| Box::pin(async move { tx.insert_page(&row).await }))
            .await;
        if let Err(e) = recorded {
            error!(error = %e, page_error = %error, "failed to record page failure");
        }
        PageResult::failed(page_id, duration_secs, error)
    }
}
