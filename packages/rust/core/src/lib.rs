//! Batch conversion for wikiaccess.
//!
//! [`pipeline::ConversionPipeline`] drives the external renderer and
//! accessibility checker over a page list, persists every attempt, then
//! hands the batch to link resolution and discovery.

pub mod collaborators;
pub mod external;
pub mod pipeline;
pub mod report;

pub use collaborators::{
    AccessibilityChecker, CheckIssue, CheckReport, DocumentRenderer, ImageDetail, ImageStats,
    RenderOutput, RenderRequest, ReportSink,
};
pub use external::{CommandChecker, CommandRenderer};
pub use pipeline::{
    BatchReport, BatchRequest, ConversionPipeline, PageOutcome, PageResult, ProgressReporter,
    SilentProgress,
};
pub use report::{JsonSummaryWriter, Summary};
