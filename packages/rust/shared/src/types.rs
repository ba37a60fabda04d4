//! Core domain records for conversion history and discovery state.
//!
//! Every enum-valued column has a text form used in the database. Parsing
//! an unknown text value is an error rather than a silent default.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::WikiAccessError;
use crate::wiki::PageId;

/// Declares a closed set of values with a fixed text representation.
macro_rules! text_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            /// All values, in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Text form stored in the database.
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.pad(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = WikiAccessError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(WikiAccessError::validation(format!(
                        concat!("unknown ", stringify!($name), " value: {:?}"),
                        other
                    ))),
                }
            }
        }
    };
}

text_enum! {
    /// Outcome of one conversion attempt.
    PageStatus { Success => "SUCCESS", Failed => "FAILED", Partial => "PARTIAL" }
}

impl PageStatus {
    /// `PARTIAL` means rendered but not fully checked; it counts as succeeded.
    pub fn is_success(self) -> bool {
        matches!(self, PageStatus::Success | PageStatus::Partial)
    }
}

text_enum! {
    /// Where an embedded image came from.
    ImageType {
        WikiImage => "wiki_image",
        VideoThumbnail => "video_thumbnail",
        ExternalUrl => "external_url",
    }
}

text_enum! {
    /// Result of downloading or embedding one image.
    ImageStatus {
        Success => "success",
        Failed => "failed",
        Cached => "cached",
        Skipped => "skipped",
        Error => "error",
        Pending => "pending",
    }
}

text_enum! {
    /// How the alt text of an image was obtained.
    AltTextQuality { Missing => "missing", AutoGenerated => "auto_generated", Manual => "manual" }
}

text_enum! {
    LinkType { Internal => "internal", External => "external", Anchor => "anchor" }
}

text_enum! {
    /// Whether a cross-reference resolved to a local artifact.
    ResolutionStatus { Found => "found", Missing => "missing", External => "external" }
}

text_enum! {
    /// Rendered artifact format that an accessibility check applies to.
    DocFormat { Html => "HTML", Docx => "DOCX" }
}

text_enum! {
    WcagLevel { Aa => "AA", Aaa => "AAA" }
}

text_enum! {
    /// Lifecycle of a discovered page.
    ///
    /// `discovered` is the only non-terminal review state. `approved` moves
    /// on to `converted` once a batch renders the page.
    DiscoveryStatus {
        Discovered => "discovered",
        Approved => "approved",
        Skipped => "skipped",
        Failed404 => "failed_404",
        Converted => "converted",
    }
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

/// One pipeline run and its final counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: String,
    pub wiki_url: String,
    pub started_at: DateTime<Utc>,
    /// `None` while the batch is open.
    pub completed_at: Option<DateTime<Utc>>,
    pub total_pages: u32,
    pub successful_pages: u32,
    pub failed_pages: u32,
    pub skipped_pages: u32,
    pub total_images: u32,
    pub failed_images: u32,
    pub pages_discovered_count: u32,
    /// Discovery depth of the pages this batch converts (0 for a manual list).
    pub discovery_depth: u32,
    pub parent_batch_id: Option<String>,
    pub discovery_enabled: bool,
    pub cancelled: bool,
}

impl Batch {
    pub fn is_closed(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// Parameters for opening a new batch.
#[derive(Debug, Clone)]
pub struct NewBatch {
    pub batch_id: String,
    pub wiki_url: String,
    pub discovery_depth: u32,
    pub parent_batch_id: Option<String>,
    pub discovery_enabled: bool,
}

/// Generate a time-ordered batch identifier such as `batch_20250101_120000_1a2b3c4d`.
pub fn new_batch_id() -> String {
    let uuid = uuid::Uuid::now_v7().simple().to_string();
    format!(
        "batch_{}_{}",
        Utc::now().format("%Y%m%d_%H%M%S"),
        &uuid[uuid.len() - 8..]
    )
}

// ---------------------------------------------------------------------------
// Page conversion records
// ---------------------------------------------------------------------------

/// Accessibility scores (0-100) per format and level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scores {
    pub html_aa: Option<u8>,
    pub html_aaa: Option<u8>,
    pub docx_aa: Option<u8>,
    pub docx_aaa: Option<u8>,
}

impl Scores {
    pub fn set(&mut self, format: DocFormat, aa: u8, aaa: u8) {
        match format {
            DocFormat::Html => {
                self.html_aa = Some(aa);
                self.html_aaa = Some(aaa);
            }
            DocFormat::Docx => {
                self.docx_aa = Some(aa);
                self.docx_aaa = Some(aaa);
            }
        }
    }
}

/// Paths of the artifacts produced for one page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactPaths {
    pub markdown: Option<String>,
    pub html: Option<String>,
    pub docx: Option<String>,
}

/// A conversion attempt about to be recorded.
#[derive(Debug, Clone)]
pub struct NewPage {
    pub wiki_url: String,
    pub page_id: PageId,
    pub batch_id: String,
    pub status: PageStatus,
    pub artifacts: ArtifactPaths,
    pub scores: Scores,
    pub image_count: u32,
    pub image_success_count: u32,
    pub image_failed_count: u32,
    pub duration_secs: Option<f64>,
    pub error_message: Option<String>,
    /// Defaults to now when `None`.
    pub converted_at: Option<DateTime<Utc>>,
}

impl NewPage {
    /// A `FAILED` record carrying only the error text.
    pub fn failed(
        wiki_url: &str,
        page_id: PageId,
        batch_id: &str,
        error: impl Into<String>,
        duration_secs: f64,
    ) -> Self {
        Self {
            wiki_url: wiki_url.to_string(),
            page_id,
            batch_id: batch_id.to_string(),
            status: PageStatus::Failed,
            artifacts: ArtifactPaths::default(),
            scores: Scores::default(),
            image_count: 0,
            image_success_count: 0,
            image_failed_count: 0,
            duration_secs: Some(duration_secs),
            error_message: Some(error.into()),
            converted_at: None,
        }
    }
}

/// A stored conversion attempt. Rows are append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageRecord {
    pub id: i64,
    pub wiki_url: String,
    pub page_id: PageId,
    pub batch_id: String,
    pub status: PageStatus,
    pub artifacts: ArtifactPaths,
    pub scores: Scores,
    pub image_count: u32,
    pub image_success_count: u32,
    pub image_failed_count: u32,
    pub converted_at: DateTime<Utc>,
    pub duration_secs: Option<f64>,
    pub error_message: Option<String>,
}

/// One point of a page's accessibility score history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScorePoint {
    pub converted_at: DateTime<Utc>,
    pub batch_id: String,
    pub scores: Scores,
}

// ---------------------------------------------------------------------------
// Images
// ---------------------------------------------------------------------------

/// One image download/embed attempt for a page within a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub page_id: String,
    pub batch_id: String,
    pub image_type: ImageType,
    pub source_url: String,
    pub local_filename: Option<String>,
    pub status: ImageStatus,
    pub file_size: Option<u64>,
    pub dimensions: Option<String>,
    pub alt_text: Option<String>,
    pub alt_text_quality: Option<AltTextQuality>,
    pub error_message: Option<String>,
}

/// Failure statistics for one image source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageFailureStat {
    pub source_url: String,
    pub failure_count: u32,
    pub total_attempts: u32,
    /// Percentage, one decimal place.
    pub failure_rate: f64,
}

// ---------------------------------------------------------------------------
// Links
// ---------------------------------------------------------------------------

/// One cross-reference found in a rendered page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRecord {
    pub source_page_id: String,
    /// Page id for internal links, `scheme://host` for external ones.
    pub target: String,
    pub link_text: Option<String>,
    pub link_type: LinkType,
    pub resolution: ResolutionStatus,
    pub batch_id: String,
}

/// A page that references a missing target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSource {
    pub source_page_id: String,
    pub link_text: Option<String>,
}

/// Aggregated `missing` references to one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokenLinkTarget {
    pub target_page_id: String,
    /// Number of `missing` link rows pointing at the target.
    pub reference_count: u32,
    /// One entry per referencing link row, ordered by source page.
    pub sources: Vec<LinkSource>,
}

impl BrokenLinkTarget {
    /// Distinct referencing page ids, in order.
    pub fn source_pages(&self) -> Vec<&str> {
        let mut pages: Vec<&str> = Vec::new();
        for s in &self.sources {
            if pages.last() != Some(&s.source_page_id.as_str()) {
                pages.push(&s.source_page_id);
            }
        }
        pages
    }
}

// ---------------------------------------------------------------------------
// Accessibility issues
// ---------------------------------------------------------------------------

/// One violation or warning for a page, format and level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessibilityIssue {
    pub page_id: String,
    pub batch_id: String,
    pub format: DocFormat,
    pub level: WcagLevel,
    pub code: String,
    pub message: Option<String>,
    pub selector: Option<String>,
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// A candidate page found through a broken link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredPage {
    pub id: i64,
    pub target_page_id: PageId,
    pub wiki_url: String,
    pub depth: u32,
    pub status: DiscoveryStatus,
    pub first_discovered_at: DateTime<Utc>,
    pub first_discovered_by_batch: Option<String>,
    pub reference_count: u32,
    pub decision_made_at: Option<DateTime<Utc>>,
    pub decision_reason: Option<String>,
    pub converted_at: Option<DateTime<Utc>>,
    pub converted_batch_id: Option<String>,
    pub http_status_code: Option<u16>,
    pub last_check_at: Option<DateTime<Utc>>,
    pub check_attempt_count: u32,
}

/// A page that referenced a discovered candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoverySource {
    pub discovered_page_id: i64,
    pub source_page_id: String,
    pub link_text: Option<String>,
    pub batch_id: String,
    pub discovered_at: DateTime<Utc>,
}
