//! JSON summary consumed by the reporting layer.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use wikiaccess_shared::{
    Batch, BrokenLinkTarget, ImageFailureStat, PageRecord, Result, WikiAccessError,
};
use wikiaccess_storage::Store;

use crate::collaborators::ReportSink;

#[derive(Debug, Serialize)]
pub struct Summary {
    pub generated_at: DateTime<Utc>,
    pub batch: Batch,
    /// Every conversion attempt of the batch.
    pub batch_pages: Vec<PageRecord>,
    /// Latest rendered row per page of the wiki, across batches.
    pub pages: Vec<PageRecord>,
    pub broken_links: Vec<BrokenLinkTarget>,
    pub image_failures: Vec<ImageFailureStat>,
}

impl Summary {
    pub async fn collect(store: &Store, batch: &Batch) -> Result<Self> {
        Ok(Self {
            generated_at: Utc::now(),
            batch: batch.clone(),
            batch_pages: store.batch_pages(&batch.batch_id).await?,
            pages: store.rendered_pages(&batch.wiki_url).await?,
            broken_links: store.broken_links(None).await?,
            image_failures: store.image_failure_stats().await?,
        })
    }
}

/// Writes `<output_dir>/reports/summary.json` after every batch.
pub struct JsonSummaryWriter {
    output_dir: PathBuf,
}

impl JsonSummaryWriter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.output_dir.join("reports").join("summary.json")
    }
}

#[async_trait]
impl ReportSink for JsonSummaryWriter {
    async fn batch_closed(&self, store: &Store, batch: &Batch) -> Result<()> {
        let summary = Summary::collect(store, batch).await?;
        let json = serde_json::to_string_pretty(&summary)
            .map_err(|e| WikiAccessError::validation(format!("summary serialization: {e}")))?;

        let path = self.path();
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| WikiAccessError::io(dir, e))?;
        }
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| WikiAccessError::io(&path, e))?;
        info!(path = %path.display(), "summary written");
        Ok(())
    }
}
