//! Interfaces to the external renderer, accessibility checker and reporting
//! layer, plus the data they exchange with the pipeline.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use wikiaccess_shared::{
    AltTextQuality, Batch, DocFormat, ImageRecord, ImageStatus, ImageType, PageId, Result,
};
use wikiaccess_storage::Store;

// ---------------------------------------------------------------------------
// Renderer
// ---------------------------------------------------------------------------

/// What to render and where.
#[derive(Debug, Clone, Serialize)]
pub struct RenderRequest {
    pub page_id: PageId,
    pub page_url: String,
    pub output_dir: PathBuf,
    /// Requested formats, e.g. `html`, `docx`.
    pub formats: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageStats {
    #[serde(default)]
    pub total: u32,
    #[serde(default)]
    pub success: u32,
    #[serde(default)]
    pub failed: u32,
}

/// One image handled by the renderer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageDetail {
    pub image_type: ImageType,
    pub source_url: String,
    pub status: ImageStatus,
    #[serde(default)]
    pub local_filename: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub dimensions: Option<String>,
    #[serde(default)]
    pub alt_text: Option<String>,
    #[serde(default)]
    pub alt_text_quality: Option<AltTextQuality>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl ImageDetail {
    pub fn into_record(self, page_id: &PageId, batch_id: &str) -> ImageRecord {
        ImageRecord {
            page_id: page_id.to_string(),
            batch_id: batch_id.to_string(),
            image_type: self.image_type,
            source_url: self.source_url,
            local_filename: self.local_filename,
            status: self.status,
            file_size: self.file_size,
            dimensions: self.dimensions,
            alt_text: self.alt_text,
            alt_text_quality: self.alt_text_quality,
            error_message: self.error_message,
        }
    }
}

/// Artifacts produced for one page. Paths are opaque to the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RenderOutput {
    #[serde(default)]
    pub markdown_path: Option<String>,
    #[serde(default)]
    pub html_path: Option<String>,
    #[serde(default)]
    pub docx_path: Option<String>,
    #[serde(default)]
    pub image_stats: ImageStats,
    #[serde(default)]
    pub images: Vec<ImageDetail>,
}

impl RenderOutput {
    /// Produced artifacts that can be checked, by format.
    pub fn checkable(&self) -> Vec<(DocFormat, &str)> {
        let mut out = Vec::new();
        if let Some(html) = &self.html_path {
            out.push((DocFormat::Html, html.as_str()));
        }
        if let Some(docx) = &self.docx_path {
            out.push((DocFormat::Docx, docx.as_str()));
        }
        out
    }
}

#[async_trait]
pub trait DocumentRenderer: Send + Sync {
    /// Fetch and render one page. Any error fails that page only.
    async fn render(&self, request: &RenderRequest) -> Result<RenderOutput>;
}

// ---------------------------------------------------------------------------
// Accessibility checker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckIssue {
    pub code: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub selector: Option<String>,
}

/// Audit of one artifact. Scores are 0-100.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckReport {
    pub score_aa: u8,
    pub score_aaa: u8,
    #[serde(default)]
    pub issues_aa: Vec<CheckIssue>,
    #[serde(default)]
    pub issues_aaa: Vec<CheckIssue>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[async_trait]
pub trait AccessibilityChecker: Send + Sync {
    async fn check(&self, artifact: &Path, format: DocFormat) -> Result<CheckReport>;
}

// ---------------------------------------------------------------------------
// Reporting
// ---------------------------------------------------------------------------

/// Consumer of store queries once a batch is closed.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn batch_closed(&self, store: &Store, batch: &Batch) -> Result<()>;
}
