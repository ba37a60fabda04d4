//! Cross-reference resolution for rendered wiki pages.
//!
//! The [`LinkResolver`] reads rendered HTML artifacts, classifies every
//! `<a href>` as internal-found, internal-missing, or external, rewrites
//! internal references whose target has a local artifact, and records the
//! full link set of each page per batch in the [`Store`].

pub mod rewrite;

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use wikiaccess_shared::{BrokenLinkTarget, PageId, Result, WikiAccessError, WikiSource};
use wikiaccess_storage::Store;

pub use rewrite::{AvailablePages, LinkCounts, LinkRewriter, MAX_LINK_TEXT, Resolution};

/// Aggregate counts of one [`LinkResolver::rewrite_all_links`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    pub files_processed: usize,
    pub links_found: usize,
    pub links_rewritten: usize,
    pub links_broken: usize,
    pub external_links: usize,
}

impl LinkStats {
    fn add(&mut self, counts: LinkCounts) {
        self.files_processed += 1;
        self.links_found += counts.found;
        self.links_rewritten += counts.rewritten;
        self.links_broken += counts.broken;
        self.external_links += counts.external;
    }
}

/// Missing references grouped by target, most referenced first.
#[derive(Debug, Clone, Serialize)]
pub struct BrokenLinksReport {
    /// `None` when aggregated over every batch.
    pub batch_id: Option<String>,
    pub targets: Vec<BrokenLinkTarget>,
    pub total_references: u32,
}

impl BrokenLinksReport {
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

// ---------------------------------------------------------------------------
// LinkResolver
// ---------------------------------------------------------------------------

pub struct LinkResolver {
    store: Arc<Store>,
    rewriter: LinkRewriter,
}

impl LinkResolver {
    pub fn new(store: Arc<Store>, wiki: WikiSource) -> Result<Self> {
        Ok(Self {
            store,
            rewriter: LinkRewriter::new(wiki)?,
        })
    }

    pub fn wiki(&self) -> &WikiSource {
        self.rewriter.wiki()
    }

    /// Pages whose latest rendered HTML artifact still exists on disk.
    pub async fn available_pages(&self) -> Result<AvailablePages> {
        let rendered = self.store.rendered_pages(self.wiki().base_url()).await?;
        let ids = rendered.into_iter().filter_map(|page| {
            let html = page.artifacts.html.as_deref()?;
            Path::new(html).exists().then_some(page.page_id)
        });
        Ok(AvailablePages::new(ids))
    }

    /// Resolve one rendered artifact in place and record its link set.
    ///
    /// The file is only written back when at least one reference was
    /// rewritten. The page's links for `batch_id` are replaced atomically.
    #[instrument(skip(self, available), fields(page = %source))]
    pub async fn resolve_and_rewrite(
        &self,
        html_path: &Path,
        source: &PageId,
        available: &AvailablePages,
        batch_id: &str,
    ) -> Result<LinkCounts> {
        let html = tokio::fs::read_to_string(html_path)
            .await
            .map_err(|e| WikiAccessError::io(html_path, e))?;

        let resolution = self.rewriter.resolve(&html, source, available, batch_id);
        if resolution.counts.rewritten > 0 {
            tokio::fs::write(html_path, &resolution.html)
                .await
                .map_err(|e| WikiAccessError::io(html_path, e))?;
            debug!(
                path = %html_path.display(),
                rewritten = resolution.counts.rewritten,
                "rewrote internal links"
            );
        }

        let counts = resolution.counts;
        let links = resolution.links;
        let source_id = source.to_string();
        let batch = batch_id.to_string();
        self.store
            .with_transaction(move |tx| {
                Box::pin(async move { tx.replace_page_links(&source_id, &batch, &links).await })
            })
            .await?;

        Ok(counts)
    }

    /// Resolve every rendered page of this wiki, recording links under
    /// `batch_id`.
    ///
    /// Pages whose artifact is missing or unreadable are logged and skipped.
    #[instrument(skip(self))]
    pub async fn rewrite_all_links(&self, batch_id: &str) -> Result<LinkStats> {
        let rendered = self.store.rendered_pages(self.wiki().base_url()).await?;
        let available = self.available_pages().await?;
        let mut stats = LinkStats::default();

        for page in rendered {
            let Some(html) = page.artifacts.html.as_deref() else {
                continue;
            };
            let path = Path::new(html);
            if !path.exists() {
                warn!(page = %page.page_id, path = %path.display(), "rendered artifact missing");
                continue;
            }
            match self
                .resolve_and_rewrite(path, &page.page_id, &available, batch_id)
                .await
            {
                Ok(counts) => stats.add(counts),
                Err(e) => warn!(page = %page.page_id, error = %e, "link resolution failed"),
            }
        }

        info!(
            files = stats.files_processed,
            found = stats.links_found,
            rewritten = stats.links_rewritten,
            broken = stats.links_broken,
            external = stats.external_links,
            "link resolution complete"
        );
        Ok(stats)
    }

    /// Broken-link aggregate for one batch, or for every page's latest batch.
    pub async fn broken_links_report(&self, batch_id: Option<&str>) -> Result<BrokenLinksReport> {
        let targets = self.store.broken_links(batch_id).await?;
        let total_references = targets.iter().map(|t| t.reference_count).sum();
        Ok(BrokenLinksReport {
            batch_id: batch_id.map(str::to_string),
            targets,
            total_references,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use uuid::Uuid;
    use wikiaccess_shared::{
        ArtifactPaths, NewBatch, NewPage, PageStatus, ResolutionStatus, Scores,
    };

    const WIKI: &str = "https://wiki.example.org";

    struct Fixture {
        store: Arc<Store>,
        resolver: LinkResolver,
        html_dir: PathBuf,
    }

    async fn fixture() -> Fixture {
        let root = std::env::temp_dir().join(format!("wa_links_{}", Uuid::now_v7()));
        let html_dir = root.join("html");
        std::fs::create_dir_all(&html_dir).unwrap();
        let store = Arc::new(Store::open(&root.join("history.db")).await.unwrap());
        let resolver = LinkResolver::new(store.clone(), WikiSource::new(WIKI).unwrap()).unwrap();
        Fixture {
            store,
            resolver,
            html_dir,
        }
    }

    impl Fixture {
        async fn open_batch(&self, batch_id: &str) {
            let tx = self.store.begin().await.unwrap();
            tx.open_batch(&NewBatch {
                batch_id: batch_id.into(),
                wiki_url: WIKI.into(),
                discovery_depth: 0,
                parent_batch_id: None,
                discovery_enabled: true,
            })
            .await
            .unwrap();
            tx.commit().await.unwrap();
        }

        /// Write an artifact and record a successful conversion for it.
        async fn rendered(&self, page_id: &str, batch_id: &str, body: &str) -> PathBuf {
            let id = PageId::parse(page_id).unwrap();
            let path = self.html_dir.join(id.artifact_file("html"));
            std::fs::write(&path, body).unwrap();
            let tx = self.store.begin().await.unwrap();
            tx.insert_page(&NewPage {
                wiki_url: WIKI.into(),
                page_id: id,
                batch_id: batch_id.into(),
                status: PageStatus::Success,
                artifacts: ArtifactPaths {
                    markdown: None,
                    html: Some(path.display().to_string()),
                    docx: None,
                },
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
            tx.commit().await.unwrap();
            path
        }
    }

    const A: &str = r#"<p><a href="/doku.php?id=ns:b">B</a> <a href="/doku.php?id=ns:c">C</a>
<a href="https://other.example.com/x">X</a></p>"#;
    const B: &str = r#"<p><a href="/doku.php?id=ns:c">again C</a></p>"#;

    #[tokio::test]
    async fn rewrites_and_records_links() {
        let fx = fixture().await;
        fx.open_batch("b1").await;
        let a_path = fx.rendered("ns:a", "b1", A).await;
        fx.rendered("ns:b", "b1", B).await;

        let stats = fx.resolver.rewrite_all_links("b1").await.unwrap();
        assert_eq!(
            stats,
            LinkStats {
                files_processed: 2,
                links_found: 4,
                links_rewritten: 1,
                links_broken: 2,
                external_links: 1,
            }
        );

        let a_html = std::fs::read_to_string(&a_path).unwrap();
        assert!(a_html.contains(r#"href="ns_b.html""#));
        assert!(a_html.contains(r#"href="/doku.php?id=ns:c""#));

        let links = fx.store.page_links("ns:a", "b1").await.unwrap();
        assert_eq!(links.len(), 3);
        assert_eq!(
            fx.store
                .count_links("b1", ResolutionStatus::Missing)
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn second_run_is_idempotent() {
        let fx = fixture().await;
        fx.open_batch("b1").await;
        fx.rendered("ns:a", "b1", A).await;
        fx.rendered("ns:b", "b1", B).await;

        let first = fx.resolver.rewrite_all_links("b1").await.unwrap();
        let second = fx.resolver.rewrite_all_links("b1").await.unwrap();

        assert_eq!(second.links_rewritten, 0);
        assert_eq!(second.links_found, first.links_found);
        assert_eq!(second.links_broken, first.links_broken);
        assert_eq!(fx.store.page_links("ns:a", "b1").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn missing_artifact_is_skipped() {
        let fx = fixture().await;
        fx.open_batch("b1").await;
        let a_path = fx.rendered("ns:a", "b1", A).await;
        fx.rendered("ns:b", "b1", B).await;
        std::fs::remove_file(&a_path).unwrap();

        let stats = fx.resolver.rewrite_all_links("b1").await.unwrap();
        assert_eq!(stats.files_processed, 1);
        // ns:a has no artifact any more, so it is not available either.
        let available = fx.resolver.available_pages().await.unwrap();
        assert!(!available.contains(&PageId::parse("ns:a").unwrap()));
    }

    #[tokio::test]
    async fn broken_links_report_orders_by_references() {
        let fx = fixture().await;
        fx.open_batch("b1").await;
        fx.rendered("ns:a", "b1", A).await;
        fx.rendered("ns:b", "b1", B).await;
        fx.rendered("ns:d", "b1", r#"<a href="/doku.php?id=ns:e">E</a>"#)
            .await;
        fx.resolver.rewrite_all_links("b1").await.unwrap();

        let report = fx.resolver.broken_links_report(Some("b1")).await.unwrap();
        assert_eq!(report.total_references, 3);
        let targets: Vec<_> = report
            .targets
            .iter()
            .map(|t| (t.target_page_id.as_str(), t.reference_count))
            .collect();
        assert_eq!(targets, vec![("ns:c", 2), ("ns:e", 1)]);
        assert_eq!(report.targets[0].source_pages(), vec!["ns:a", "ns:b"]);

        let all = fx.resolver.broken_links_report(None).await.unwrap();
        assert_eq!(all.total_references, 3);
        assert!(all.batch_id.is_none());
    }
}
