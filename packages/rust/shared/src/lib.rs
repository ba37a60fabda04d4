//! Shared types, error model, and configuration for WikiAccess.
//!
//! This crate is the foundation depended on by all other WikiAccess crates.
//! It provides:
//! - [`WikiAccessError`], the unified error type
//! - Domain records ([`Batch`], [`PageRecord`], [`DiscoveredPage`], ...)
//! - Page identifiers and wiki URL mapping ([`PageId`], [`WikiSource`])
//! - Configuration ([`AppConfig`], [`PipelineConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;
pub mod wiki;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CommandConfig, OutputConfig, PipelineConfig, PipelineSettings, ProbeConfig,
    ProbeSettings, StorageConfig, WikiConfig, config_dir, config_file_path, init_config,
    load_config, load_config_from,
};
pub use error::{Result, WikiAccessError};
pub use types::{
    AccessibilityIssue, AltTextQuality, ArtifactPaths, Batch, BrokenLinkTarget, DiscoveredPage,
    DiscoveryStatus, DiscoverySource, DocFormat, ImageFailureStat, ImageRecord, ImageStatus,
    ImageType, LinkRecord, LinkSource, LinkType, NewBatch, NewPage, PageRecord, PageStatus,
    ResolutionStatus, ScorePoint, Scores, WcagLevel, new_batch_id,
};
pub use wiki::{PageId, WikiSource, parse_page_list_line};
