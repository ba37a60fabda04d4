use super::*;
use chrono::Duration as ChronoDuration;
use uuid::Uuid;
use wikiaccess_shared::{
    ArtifactPaths, ImageStatus, ImageType, LinkType, PageStatus, Scores,
};

const WIKI: &str = "https://wiki.example.org";

/// Create a temp file store for testing.
async fn test_store() -> Store {
    let tmp = std::env::temp_dir().join(format!("wa_test_{}.db", Uuid::now_v7()));
    Store::open(&tmp).await.expect("open test db")
}

fn pid(s: &str) -> PageId {
    PageId::parse(s).expect("page id")
}

async fn open_batch(store: &Store, batch_id: &str) {
    let tx = store.begin().await.unwrap();
    tx.open_batch(&NewBatch {
        batch_id: batch_id.into(),
        wiki_url: WIKI.into(),
        discovery_depth: 0,
        parent_batch_id: None,
        discovery_enabled: true,
    })
    .await
    .expect("open batch");
    tx.commit().await.unwrap();
}

fn page(page_id: &str, batch_id: &str, status: PageStatus) -> NewPage {
    let id = pid(page_id);
    NewPage {
        wiki_url: WIKI.into(),
        batch_id: batch_id.into(),
        status,
        artifacts: ArtifactPaths {
            markdown: Some(format!("output/markdown/{}", id.artifact_file("md"))),
            html: (status != PageStatus::Failed)
                .then(|| format!("output/html/{}", id.artifact_file("html"))),
            docx: None,
        },
        scores: Scores::default(),
        image_count: 2,
        image_success_count: 1,
        image_failed_count: 1,
        duration_secs: Some(1.5),
        error_message: (status == PageStatus::Failed).then(|| "boom".to_string()),
        converted_at: None,
        page_id: id,
    }
}

async fn insert_pages(store: &Store, pages: Vec<NewPage>) {
    let tx = store.begin().await.unwrap();
    for p in &pages {
        tx.insert_page(p).await.expect("insert page");
    }
    tx.commit().await.unwrap();
}

fn link(source: &str, target: &str, resolution: ResolutionStatus, batch_id: &str) -> LinkRecord {
    LinkRecord {
        source_page_id: source.into(),
        target: target.into(),
        link_text: Some(format!("to {target}")),
        link_type: if resolution == ResolutionStatus::External {
            LinkType::External
        } else {
            LinkType::Internal
        },
        resolution,
        batch_id: batch_id.into(),
    }
}

async fn discover(store: &Store, target: &str, batch_id: &str, refs: u32) -> i64 {
    let tx = store.begin().await.unwrap();
    let id = tx
        .insert_discovered_page(&NewDiscoveredPage {
            target_page_id: pid(target),
            wiki_url: WIKI.into(),
            depth: 1,
            batch_id: batch_id.into(),
            reference_count: refs,
        })
        .await
        .unwrap()
        .expect("new row");
    tx.commit().await.unwrap();
    id
}

#[tokio::test]
async fn open_and_migrate() {
    let store = test_store().await;
    assert_eq!(store.schema_version().await, 3);
}

#[tokio::test]
async fn idempotent_migration() {
    let tmp = std::env::temp_dir().join(format!("wa_test_{}.db", Uuid::now_v7()));
    let s1 = Store::open(&tmp).await.expect("first open");
    drop(s1);
    let s2 = Store::open(&tmp).await.expect("second open");
    assert_eq!(s2.schema_version().await, 3);
}

#[tokio::test]
async fn readonly_store_rejects_writes() {
    let tmp = std::env::temp_dir().join(format!("wa_test_{}.db", Uuid::now_v7()));
    drop(Store::open(&tmp).await.unwrap());
    let ro = Store::open_readonly(&tmp).await.expect("open readonly");
    assert!(ro.begin().await.is_err());
    assert!(ro.list_batches(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn batch_close_derives_counters() {
    let store = test_store().await;
    open_batch(&store, "b1").await;
    insert_pages(
        &store,
        vec![
            page("a", "b1", PageStatus::Success),
            page("b", "b1", PageStatus::Partial),
            page("c", "b1", PageStatus::Failed),
        ],
    )
    .await;

    let tx = store.begin().await.unwrap();
    let batch = tx
        .close_batch(
            "b1",
            CloseBatch {
                skipped_pages: 2,
                cancelled: false,
            },
        )
        .await
        .expect("close");
    tx.commit().await.unwrap();

    assert!(batch.is_closed());
    assert_eq!(batch.total_pages, 5);
    assert_eq!(batch.successful_pages, 2);
    assert_eq!(batch.failed_pages, 1);
    assert_eq!(batch.skipped_pages, 2);
    assert_eq!(
        batch.successful_pages + batch.failed_pages + batch.skipped_pages,
        batch.total_pages
    );
    assert_eq!(batch.total_images, 6);
    assert_eq!(batch.failed_images, 3);

    // Closing twice is rejected and leaves the counters alone.
    let tx = store.begin().await.unwrap();
    let err = tx.close_batch("b1", CloseBatch::default()).await.unwrap_err();
    assert!(err.to_string().contains("already closed"));
    drop(tx);
    assert_eq!(store.get_batch("b1").await.unwrap().unwrap().skipped_pages, 2);

    let tx = store.begin().await.unwrap();
    let err = tx.close_batch("nope", CloseBatch::default()).await.unwrap_err();
    assert!(matches!(err, WikiAccessError::NotFound(_)));
}

#[tokio::test]
async fn duplicate_batch_id_fails() {
    let store = test_store().await;
    open_batch(&store, "dup").await;
    let tx = store.begin().await.unwrap();
    let result = tx
        .open_batch(&NewBatch {
            batch_id: "dup".into(),
            wiki_url: WIKI.into(),
            discovery_depth: 0,
            parent_batch_id: None,
            discovery_enabled: false,
        })
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn failed_transaction_leaves_no_rows() {
    let store = test_store().await;
    open_batch(&store, "b1").await;

    let result: Result<()> = store
        .with_transaction(|tx| {
            Box::pin(async move {
                tx.insert_page(&page("a", "b1", PageStatus::Success)).await?;
                Err(WikiAccessError::validation("abort"))
            })
        })
        .await;
    assert!(result.is_err());
    assert!(store.batch_pages("b1").await.unwrap().is_empty());

    // Dropped without commit.
    {
        let tx = store.begin().await.unwrap();
        tx.insert_page(&page("b", "b1", PageStatus::Success))
            .await
            .unwrap();
    }
    assert!(store.batch_pages("b1").await.unwrap().is_empty());

    let id = store
        .with_transaction(|tx| {
            Box::pin(async move { tx.insert_page(&page("c", "b1", PageStatus::Success)).await })
        })
        .await
        .expect("commit");
    assert!(id > 0);
    assert_eq!(store.batch_pages("b1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn page_insert_requires_existing_batch() {
    let store = test_store().await;
    let tx = store.begin().await.unwrap();
    assert!(tx.insert_page(&page("a", "missing", PageStatus::Success)).await.is_err());
}

#[tokio::test]
async fn history_and_freshness() {
    let store = test_store().await;
    open_batch(&store, "b1").await;
    let a = pid("ns:a");

    let mut old = page("ns:a", "b1", PageStatus::Success);
    old.converted_at = Some(Utc::now() - ChronoDuration::hours(3));
    let mut recent = page("ns:a", "b1", PageStatus::Success);
    recent.converted_at = Some(Utc::now() - ChronoDuration::minutes(10));
    let failed = page("ns:b", "b1", PageStatus::Failed);
    insert_pages(&store, vec![old, recent, failed]).await;

    let history = store.page_history(WIKI, &a, 10).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].converted_at > history[1].converted_at);

    let hour = Duration::from_secs(3600);
    assert!(store.was_recently_converted(WIKI, &a, hour).await.unwrap());
    assert!(
        !store
            .was_recently_converted(WIKI, &a, Duration::from_secs(300))
            .await
            .unwrap()
    );
    assert!(
        !store
            .was_recently_converted(WIKI, &pid("ns:b"), hour)
            .await
            .unwrap()
    );
    assert!(
        !store
            .was_recently_converted("https://other.org", &a, hour)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn converted_failed_and_rendered_pages() {
    let store = test_store().await;
    open_batch(&store, "b1").await;
    open_batch(&store, "b2").await;
    insert_pages(
        &store,
        vec![
            page("a", "b1", PageStatus::Success),
            page("b", "b1", PageStatus::Failed),
            page("c", "b1", PageStatus::Partial),
        ],
    )
    .await;
    insert_pages(
        &store,
        vec![page("a", "b2", PageStatus::Failed), page("b", "b2", PageStatus::Success)],
    )
    .await;

    let converted = store.converted_pages("b1").await.unwrap();
    assert_eq!(
        converted.iter().map(PageId::as_str).collect::<Vec<_>>(),
        vec!["a", "c"]
    );
    assert_eq!(store.failed_pages("b1").await.unwrap(), vec![pid("b")]);

    // Latest successful row per page, even if a later attempt failed.
    let rendered = store.rendered_pages(WIKI).await.unwrap();
    let summary: Vec<_> = rendered
        .iter()
        .map(|p| (p.page_id.as_str(), p.batch_id.as_str()))
        .collect();
    assert_eq!(summary, vec![("a", "b1"), ("b", "b2"), ("c", "b1")]);
}

#[tokio::test]
async fn broken_links_grouped_and_sorted() {
    let store = test_store().await;
    open_batch(&store, "b1").await;

    let tx = store.begin().await.unwrap();
    tx.replace_page_links(
        "a",
        "b1",
        &[
            link("a", "x", ResolutionStatus::Missing, "b1"),
            link("a", "y", ResolutionStatus::Missing, "b1"),
            link("a", "b", ResolutionStatus::Found, "b1"),
            link("a", "https://example.com", ResolutionStatus::External, "b1"),
        ],
    )
    .await
    .unwrap();
    tx.replace_page_links(
        "b",
        "b1",
        &[
            link("b", "y", ResolutionStatus::Missing, "b1"),
            link("b", "y", ResolutionStatus::Missing, "b1"),
        ],
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();

    let broken = store.broken_links(Some("b1")).await.unwrap();
    assert_eq!(broken.len(), 2);
    assert_eq!(broken[0].target_page_id, "y");
    assert_eq!(broken[0].reference_count, 3);
    assert_eq!(broken[0].source_pages(), vec!["a", "b"]);
    assert_eq!(broken[1].target_page_id, "x");
    assert_eq!(broken[1].reference_count, 1);

    assert_eq!(
        store.count_links("b1", ResolutionStatus::External).await.unwrap(),
        1
    );
    assert_eq!(store.page_links("a", "b1").await.unwrap().len(), 4);
}

#[tokio::test]
async fn replacing_links_is_idempotent_and_all_batches_uses_latest() {
    let store = test_store().await;
    open_batch(&store, "b1").await;
    open_batch(&store, "b2").await;

    let links = vec![link("a", "x", ResolutionStatus::Missing, "b1")];
    for _ in 0..2 {
        let tx = store.begin().await.unwrap();
        tx.replace_page_links("a", "b1", &links).await.unwrap();
        tx.commit().await.unwrap();
    }
    assert_eq!(store.page_links("a", "b1").await.unwrap().len(), 1);

    // In b2, `x` now resolves; across all batches `a` contributes only b2 rows.
    let tx = store.begin().await.unwrap();
    tx.replace_page_links("a", "b2", &[link("a", "x", ResolutionStatus::Found, "b2")])
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert_eq!(store.broken_links(Some("b1")).await.unwrap().len(), 1);
    assert!(store.broken_links(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn page_resolved_without_links_clears_its_broken_links() {
    let store = test_store().await;
    open_batch(&store, "b1").await;
    open_batch(&store, "b2").await;

    let tx = store.begin().await.unwrap();
    tx.replace_page_links("a", "b1", &[link("a", "c", ResolutionStatus::Missing, "b1")])
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert_eq!(store.broken_links(None).await.unwrap().len(), 1);

    // The link to `c` was removed from `a`; b2 records no links for it.
    let tx = store.begin().await.unwrap();
    assert_eq!(tx.replace_page_links("a", "b2", &[]).await.unwrap(), 0);
    tx.commit().await.unwrap();

    assert!(store.broken_links(None).await.unwrap().is_empty());
    assert_eq!(store.broken_links(Some("b1")).await.unwrap().len(), 1);
}

#[tokio::test]
async fn discovered_page_is_unique() {
    let store = test_store().await;
    open_batch(&store, "b1").await;
    let id = discover(&store, "c", "b1", 1).await;

    let tx = store.begin().await.unwrap();
    let again = tx
        .insert_discovered_page(&NewDiscoveredPage {
            target_page_id: pid("c"),
            wiki_url: WIKI.into(),
            depth: 2,
            batch_id: "b1".into(),
            reference_count: 5,
        })
        .await
        .unwrap();
    assert_eq!(again, None);

    let source = LinkSource {
        source_page_id: "a".into(),
        link_text: Some("see c".into()),
    };
    assert!(tx.add_discovery_source(id, &source, "b1").await.unwrap());
    assert!(!tx.add_discovery_source(id, &source, "b1").await.unwrap());
    tx.increment_reference_count(id, 2).await.unwrap();
    tx.commit().await.unwrap();

    let row = store.discovered_page(&pid("c")).await.unwrap().unwrap();
    assert_eq!(row.depth, 1);
    assert_eq!(row.reference_count, 3);
    assert_eq!(row.status, DiscoveryStatus::Discovered);
    assert_eq!(row.first_discovered_by_batch.as_deref(), Some("b1"));

    let sources = store.discovery_sources(id).await.unwrap();
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].link_text.as_deref(), Some("see c"));
}

#[tokio::test]
async fn guarded_transitions() {
    let store = test_store().await;
    open_batch(&store, "b1").await;
    let c = discover(&store, "ns:c", "b1", 3).await;
    let d = discover(&store, "ns:d", "b1", 1).await;
    let _e = discover(&store, "other:e", "b1", 1).await;

    let tx = store.begin().await.unwrap();
    assert!(
        tx.transition_discovery(
            c,
            DiscoveryStatus::Discovered,
            DiscoveryStatus::Skipped,
            Some("off topic"),
            None
        )
        .await
        .unwrap()
    );
    // Already left `discovered`.
    assert!(
        !tx.transition_discovery(
            c,
            DiscoveryStatus::Discovered,
            DiscoveryStatus::Approved,
            None,
            None
        )
        .await
        .unwrap()
    );
    let n = tx
        .bulk_transition(
            &DiscoveryFilter::namespace("ns:"),
            DiscoveryStatus::Approved,
            Some("bulk"),
        )
        .await
        .unwrap();
    assert_eq!(n, 1);
    // Re-running is a no-op.
    let n = tx
        .bulk_transition(
            &DiscoveryFilter::namespace("ns:"),
            DiscoveryStatus::Approved,
            None,
        )
        .await
        .unwrap();
    assert_eq!(n, 0);
    tx.commit().await.unwrap();

    let c_row = store.discovered_page_by_id(c).await.unwrap().unwrap();
    assert_eq!(c_row.status, DiscoveryStatus::Skipped);
    assert_eq!(c_row.decision_reason.as_deref(), Some("off topic"));
    let d_row = store.discovered_page_by_id(d).await.unwrap().unwrap();
    assert_eq!(d_row.status, DiscoveryStatus::Approved);

    let counts = store.discovery_status_counts().await.unwrap();
    assert_eq!(counts[&DiscoveryStatus::Discovered], 1);
    assert_eq!(counts[&DiscoveryStatus::Approved], 1);
    assert_eq!(counts[&DiscoveryStatus::Skipped], 1);
    assert_eq!(counts[&DiscoveryStatus::Converted], 0);
}

#[tokio::test]
async fn mark_converted_only_from_approved() {
    let store = test_store().await;
    open_batch(&store, "b1").await;
    open_batch(&store, "b2").await;
    let id = discover(&store, "c", "b1", 1).await;

    let tx = store.begin().await.unwrap();
    assert!(!tx.mark_converted(&pid("c"), "b2").await.unwrap());
    tx.transition_discovery(
        id,
        DiscoveryStatus::Discovered,
        DiscoveryStatus::Approved,
        None,
        None,
    )
    .await
    .unwrap();
    assert!(tx.mark_converted(&pid("c"), "b2").await.unwrap());
    tx.commit().await.unwrap();

    let row = store.discovered_page(&pid("c")).await.unwrap().unwrap();
    assert_eq!(row.status, DiscoveryStatus::Converted);
    assert_eq!(row.converted_batch_id.as_deref(), Some("b2"));
    assert!(row.converted_at.is_some());
}

#[tokio::test]
async fn probe_results_are_recorded() {
    let store = test_store().await;
    open_batch(&store, "b1").await;
    discover(&store, "gone", "b1", 1).await;

    let tx = store.begin().await.unwrap();
    assert!(tx.record_probe_result(&pid("gone"), 404).await.unwrap());
    assert!(tx.record_probe_result(&pid("gone"), 404).await.unwrap());
    assert!(!tx.record_probe_result(&pid("unknown"), 404).await.unwrap());
    tx.commit().await.unwrap();

    let row = store.discovered_page(&pid("gone")).await.unwrap().unwrap();
    assert_eq!(row.http_status_code, Some(404));
    assert_eq!(row.check_attempt_count, 2);
    assert_eq!(row.status, DiscoveryStatus::Discovered);
}

#[tokio::test]
async fn discovered_pages_ordering_and_filters() {
    let store = test_store().await;
    open_batch(&store, "b1").await;
    discover(&store, "low", "b1", 1).await;
    discover(&store, "high", "b1", 5).await;
    discover(&store, "mid", "b1", 3).await;

    let pending = store
        .discovered_pages(Some(DiscoveryStatus::Discovered), &DiscoveryFilter::all())
        .await
        .unwrap();
    let order: Vec<_> = pending.iter().map(|p| p.target_page_id.as_str()).collect();
    assert_eq!(order, vec!["high", "mid", "low"]);

    let popular = store
        .discovered_pages(None, &DiscoveryFilter::min_references(3))
        .await
        .unwrap();
    assert_eq!(popular.len(), 2);

    let depth_counts = store.discovery_depth_counts().await.unwrap();
    assert_eq!(
        depth_counts,
        vec![DepthCount {
            depth: 1,
            status: DiscoveryStatus::Discovered,
            count: 3
        }]
    );
}

#[tokio::test]
async fn image_stats_and_trends() {
    let store = test_store().await;
    open_batch(&store, "b1").await;
    let image = |status| ImageRecord {
        page_id: "a".into(),
        batch_id: "b1".into(),
        image_type: ImageType::WikiImage,
        source_url: "https://wiki.example.org/_media/x.png".into(),
        local_filename: Some("x.png".into()),
        status,
        file_size: Some(1024),
        dimensions: Some("10x10".into()),
        alt_text: None,
        alt_text_quality: Some(wikiaccess_shared::AltTextQuality::Missing),
        error_message: None,
    };

    let mut scored = page("a", "b1", PageStatus::Success);
    scored.scores.set(wikiaccess_shared::DocFormat::Html, 90, 70);

    let tx = store.begin().await.unwrap();
    tx.insert_image(&image(ImageStatus::Failed)).await.unwrap();
    tx.insert_image(&image(ImageStatus::Success)).await.unwrap();
    tx.insert_image(&image(ImageStatus::Failed)).await.unwrap();
    tx.insert_page(&scored).await.unwrap();
    tx.commit().await.unwrap();

    let stats = store.image_failure_stats().await.unwrap();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].failure_count, 2);
    assert_eq!(stats[0].total_attempts, 3);
    assert!((stats[0].failure_rate - 66.7).abs() < f64::EPSILON);
    assert_eq!(store.failed_images(Some("b1")).await.unwrap().len(), 2);
    assert_eq!(store.failed_images(Some("other")).await.unwrap().len(), 0);

    let trend = store.accessibility_trends(WIKI, &pid("a")).await.unwrap();
    assert_eq!(trend.len(), 1);
    assert_eq!(trend[0].scores.html_aa, Some(90));
    assert_eq!(trend[0].scores.docx_aa, None);
}
