//! Discovery of unconverted pages from broken cross-references.
//!
//! - [`PageExistenceProbe`] checks whether a candidate exists on the wiki.
//! - [`DiscoveryEngine`] turns a batch's missing links into candidates,
//!   bounded by a maximum depth.
//! - [`DiscoveryWorkflow`] drives the review lifecycle of those candidates
//!   and recommends the next pipeline action.

mod engine;
mod probe;
mod workflow;

pub use engine::{DiscoveryEngine, DiscoveryStats};
pub use probe::{PageExistenceProbe, ProbeResult};
pub use workflow::{
    CheckStats, DiscoveryProgress, DiscoverySummary, DiscoveryWorkflow, NextAction,
    recommend_next_action,
};
pub use wikiaccess_storage::{DepthCount, DiscoveryFilter};
