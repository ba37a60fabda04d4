//! Terminal rendering of pipeline progress and store queries.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use wikiaccess_core::{BatchReport, PageOutcome, PageResult, ProgressReporter};
use wikiaccess_discovery::{DiscoveryProgress, DiscoveryStats, DiscoverySummary};
use wikiaccess_links::{BrokenLinksReport, LinkStats};
use wikiaccess_shared::{
    AccessibilityIssue, Batch, DiscoveredPage, ImageFailureStat, ImageRecord, PageRecord,
    ScorePoint, Scores,
};

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
pub(crate) struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    pub(crate) fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn batch_started(&self, batch_id: &str, total: usize) {
        self.spinner
            .println(format!("  Batch {batch_id}: {total} page(s)"));
    }

    fn page_done(&self, result: &PageResult, current: usize, total: usize) {
        if let Some(error) = &result.error {
            self.spinner
                .println(format!("  {} {}: {error}", outcome_label(result.outcome), result.page_id));
        }
        self.spinner.set_message(format!(
            "Converting [{current}/{total}] {} ({})",
            result.page_id,
            outcome_label(result.outcome)
        ));
    }

    fn done(&self, _report: &BatchReport) {
        self.spinner.finish_and_clear();
    }
}

fn outcome_label(outcome: PageOutcome) -> &'static str {
    match outcome {
        PageOutcome::Converted => "ok",
        PageOutcome::Partial => "partial",
        PageOutcome::Failed => "FAILED",
        PageOutcome::Skipped => "skipped",
        PageOutcome::Cancelled => "cancelled",
    }
}

fn score(s: Option<u8>) -> String {
    s.map_or_else(|| "-".to_string(), |v| v.to_string())
}

fn scores(s: &Scores) -> String {
    format!(
        "html {}/{}  docx {}/{}",
        score(s.html_aa),
        score(s.html_aaa),
        score(s.docx_aa),
        score(s.docx_aaa)
    )
}

// ---------------------------------------------------------------------------
// Batches and pages
// ---------------------------------------------------------------------------

pub(crate) fn print_batch_report(report: &BatchReport) {
    let b = &report.batch;
    println!();
    if b.cancelled {
        println!("  Batch cancelled.");
    } else {
        println!("  Batch complete.");
    }
    println!("  ID:         {}", b.batch_id);
    println!("  Depth:      {}", b.discovery_depth);
    println!("  Pages:      {}", b.total_pages);
    println!("  Succeeded:  {}", b.successful_pages);
    println!("  Failed:     {}", b.failed_pages);
    println!("  Skipped:    {}", b.skipped_pages);
    println!("  Images:     {} ({} failed)", b.total_images, b.failed_images);
    if let Some(links) = &report.links {
        print_link_stats(links);
    }
    if let Some(stats) = &report.discovery {
        print_discovery_stats(stats);
    }
    println!();
}

pub(crate) fn print_link_stats(stats: &LinkStats) {
    println!("  Files:      {}", stats.files_processed);
    println!(
        "  Links:      {} found, {} rewritten, {} broken, {} external",
        stats.links_found, stats.links_rewritten, stats.links_broken, stats.external_links
    );
}

pub(crate) fn print_batches(batches: &[Batch]) {
    println!(
        "  {:<38} {:<20} {:>5} {:>5} {:>5} {:>5} {:>5}  state",
        "batch", "started", "depth", "pages", "ok", "fail", "disc"
    );
    for b in batches {
        let state = match (b.is_closed(), b.cancelled) {
            (_, true) => "cancelled",
            (true, false) => "closed",
            (false, false) => "open",
        };
        println!(
            "  {:<38} {:<20} {:>5} {:>5} {:>5} {:>5} {:>5}  {state}",
            b.batch_id,
            b.started_at.format("%Y-%m-%d %H:%M:%S"),
            b.discovery_depth,
            b.total_pages,
            b.successful_pages,
            b.failed_pages,
            b.pages_discovered_count,
        );
    }
}

pub(crate) fn print_pages(pages: &[PageRecord]) {
    for p in pages {
        let duration = p
            .duration_secs
            .map_or_else(String::new, |d| format!("{d:.1}s"));
        println!(
            "  {:<8} {:<40} {:<28} {:>7}  {}",
            p.status,
            p.page_id,
            scores(&p.scores),
            duration,
            p.converted_at.format("%Y-%m-%d %H:%M")
        );
        if let Some(error) = &p.error_message {
            println!("           {error}");
        }
    }
}

pub(crate) fn print_trends(points: &[ScorePoint]) {
    for p in points {
        println!(
            "  {}  {:<38} {}",
            p.converted_at.format("%Y-%m-%d %H:%M"),
            p.batch_id,
            scores(&p.scores)
        );
    }
}

pub(crate) fn print_issues(issues: &[AccessibilityIssue]) {
    for i in issues {
        println!(
            "    [{} {}] {} {}",
            i.format,
            i.level,
            i.code,
            i.message.as_deref().unwrap_or("")
        );
    }
}

// ---------------------------------------------------------------------------
// Links and images
// ---------------------------------------------------------------------------

pub(crate) fn print_broken_links(report: &BrokenLinksReport) {
    println!(
        "  {} missing page(s), {} reference(s)",
        report.targets.len(),
        report.total_references
    );
    for t in &report.targets {
        println!("  {:>4}  {}", t.reference_count, t.target_page_id);
        println!("        from: {}", t.source_pages().join(", "));
    }
}

pub(crate) fn print_failed_images(images: &[ImageRecord]) {
    for i in images {
        println!(
            "  {:<30} {}  {}",
            i.page_id,
            i.source_url,
            i.error_message.as_deref().unwrap_or("")
        );
    }
}

pub(crate) fn print_image_stats(stats: &[ImageFailureStat]) {
    if stats.is_empty() {
        println!("No image failures.");
        return;
    }
    for s in stats {
        println!(
            "  {:>5.1}%  {}/{}  {}",
            s.failure_rate * 100.0,
            s.failure_count,
            s.total_attempts,
            s.source_url
        );
    }
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

pub(crate) fn print_discovery_stats(stats: &DiscoveryStats) {
    if stats.depth_limit_reached {
        println!("  Discovery:  depth limit reached, nothing expanded");
        return;
    }
    println!(
        "  Discovery:  {} target(s): {} new, {} known, {} converted, {} not found",
        stats.total_broken_targets,
        stats.new_discoveries,
        stats.already_known,
        stats.already_converted,
        stats.failed_404
    );
}

pub(crate) fn print_discovered(pages: &[DiscoveredPage]) {
    println!("  {:>4} {:>5}  {:<40} {}", "refs", "depth", "page", "status");
    for p in pages {
        println!(
            "  {:>4} {:>5}  {:<40} {}",
            p.reference_count, p.depth, p.target_page_id, p.status
        );
    }
}

pub(crate) fn print_discovery_status(progress: &DiscoveryProgress, summary: &DiscoverySummary) {
    println!();
    for (status, count) in &progress.by_status {
        println!("  {:<12} {count}", status.as_str());
    }
    if !progress.by_depth.is_empty() {
        println!();
        for d in &progress.by_depth {
            println!("  depth {}  {:<12} {}", d.depth, d.status.as_str(), d.count);
        }
    }
    if summary.pending_count > 0 {
        println!();
        println!(
            "  Pending references: {} (avg {:.1})",
            summary.total_references, summary.avg_references
        );
        if let Some(top) = &summary.most_referenced {
            println!(
                "  Most referenced:    {} ({})",
                top.target_page_id, top.reference_count
            );
        }
    }
    println!();
    println!("  Next: {}", progress.next_action);
    println!();
}
