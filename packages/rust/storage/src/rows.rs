//! Row decoding and timestamp encoding.
//!
//! Timestamps are stored as fixed-width RFC 3339 UTC strings
//! (`2025-01-01T12:00:00.000000Z`) so that string comparison in SQL orders
//! them chronologically.

use chrono::{DateTime, SecondsFormat, Utc};
use libsql::Row;
use wikiaccess_shared::{
    AccessibilityIssue, ArtifactPaths, Batch, DiscoveredPage, DiscoverySource, ImageRecord,
    LinkRecord, PageId, PageRecord, Result, ScorePoint, Scores, WikiAccessError,
};

pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn now() -> String {
    ts(Utc::now())
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| WikiAccessError::Storage(format!("invalid timestamp {s:?}: {e}")))
}

// ---------------------------------------------------------------------------
// Column accessors
// ---------------------------------------------------------------------------

fn text(row: &Row, idx: i32) -> Result<String> {
    row.get::<String>(idx).map_err(WikiAccessError::storage)
}

fn opt_text(row: &Row, idx: i32) -> Option<String> {
    row.get::<String>(idx).ok()
}

fn int(row: &Row, idx: i32) -> Result<i64> {
    row.get::<i64>(idx).map_err(WikiAccessError::storage)
}

fn count(row: &Row, idx: i32) -> Result<u32> {
    Ok(int(row, idx)?.max(0) as u32)
}

fn opt_int(row: &Row, idx: i32) -> Option<i64> {
    row.get::<i64>(idx).ok()
}

fn opt_score(row: &Row, idx: i32) -> Option<u8> {
    opt_int(row, idx).map(|v| v.clamp(0, 100) as u8)
}

fn time(row: &Row, idx: i32) -> Result<DateTime<Utc>> {
    parse_ts(&text(row, idx)?)
}

fn opt_time(row: &Row, idx: i32) -> Result<Option<DateTime<Utc>>> {
    opt_text(row, idx).map(|s| parse_ts(&s)).transpose()
}

fn parsed<T>(row: &Row, idx: i32) -> Result<T>
where
    T: std::str::FromStr<Err = WikiAccessError>,
{
    text(row, idx)?
        .parse()
        .map_err(|e: WikiAccessError| WikiAccessError::Storage(e.to_string()))
}

fn page_id(row: &Row, idx: i32) -> Result<PageId> {
    parsed(row, idx)
}

// ---------------------------------------------------------------------------
// Entity decoders (column order matches the *_COLUMNS constants)
// ---------------------------------------------------------------------------

pub(crate) const BATCH_COLUMNS: &str = "batch_id, wiki_url, started_at, completed_at, \
     total_pages, successful_pages, failed_pages, skipped_pages, total_images, failed_images, \
     pages_discovered_count, discovery_depth, parent_batch_id, discovery_enabled, cancelled";

pub(crate) fn row_to_batch(row: &Row) -> Result<Batch> {
    Ok(Batch {
        batch_id: text(row, 0)?,
        wiki_url: text(row, 1)?,
        started_at: time(row, 2)?,
        completed_at: opt_time(row, 3)?,
        total_pages: count(row, 4)?,
        successful_pages: count(row, 5)?,
        failed_pages: count(row, 6)?,
        skipped_pages: count(row, 7)?,
        total_images: count(row, 8)?,
        failed_images: count(row, 9)?,
        pages_discovered_count: count(row, 10)?,
        discovery_depth: count(row, 11)?,
        parent_batch_id: opt_text(row, 12),
        discovery_enabled: int(row, 13)? != 0,
        cancelled: int(row, 14)? != 0,
    })
}

pub(crate) const PAGE_COLUMNS: &str = "id, wiki_url, page_id, batch_id, status, \
     markdown_path, html_path, docx_path, html_aa_score, html_aaa_score, docx_aa_score, \
     docx_aaa_score, image_count, image_success_count, image_failed_count, converted_at, \
     duration_secs, error_message";

pub(crate) fn row_to_page(row: &Row) -> Result<PageRecord> {
    Ok(PageRecord {
        id: int(row, 0)?,
        wiki_url: text(row, 1)?,
        page_id: page_id(row, 2)?,
        batch_id: text(row, 3)?,
        status: parsed(row, 4)?,
        artifacts: ArtifactPaths {
            markdown: opt_text(row, 5),
            html: opt_text(row, 6),
            docx: opt_text(row, 7),
        },
        scores: Scores {
            html_aa: opt_score(row, 8),
            html_aaa: opt_score(row, 9),
            docx_aa: opt_score(row, 10),
            docx_aaa: opt_score(row, 11),
        },
        image_count: count(row, 12)?,
        image_success_count: count(row, 13)?,
        image_failed_count: count(row, 14)?,
        converted_at: time(row, 15)?,
        duration_secs: row.get::<f64>(16).ok(),
        error_message: opt_text(row, 17),
    })
}

pub(crate) fn row_to_score_point(row: &Row) -> Result<ScorePoint> {
    Ok(ScorePoint {
        converted_at: time(row, 0)?,
        batch_id: text(row, 1)?,
        scores: Scores {
            html_aa: opt_score(row, 2),
            html_aaa: opt_score(row, 3),
            docx_aa: opt_score(row, 4),
            docx_aaa: opt_score(row, 5),
        },
    })
}

pub(crate) const IMAGE_COLUMNS: &str = "page_id, batch_id, image_type, source_url, \
     local_filename, status, file_size, dimensions, alt_text, alt_text_quality, error_message";

pub(crate) fn row_to_image(row: &Row) -> Result<ImageRecord> {
    Ok(ImageRecord {
        page_id: text(row, 0)?,
        batch_id: text(row, 1)?,
        image_type: parsed(row, 2)?,
        source_url: text(row, 3)?,
        local_filename: opt_text(row, 4),
        status: parsed(row, 5)?,
        file_size: opt_int(row, 6).map(|v| v.max(0) as u64),
        dimensions: opt_text(row, 7),
        alt_text: opt_text(row, 8),
        alt_text_quality: opt_text(row, 9)
            .map(|s| s.parse())
            .transpose()
            .map_err(|e: WikiAccessError| WikiAccessError::Storage(e.to_string()))?,
        error_message: opt_text(row, 10),
    })
}

pub(crate) const LINK_COLUMNS: &str =
    "source_page_id, target_page_id, link_text, link_type, resolution_status, batch_id";

pub(crate) fn row_to_link(row: &Row) -> Result<LinkRecord> {
    Ok(LinkRecord {
        source_page_id: text(row, 0)?,
        target: text(row, 1)?,
        link_text: opt_text(row, 2),
        link_type: parsed(row, 3)?,
        resolution: parsed(row, 4)?,
        batch_id: text(row, 5)?,
    })
}

pub(crate) const ISSUE_COLUMNS: &str =
    "page_id, batch_id, format, level, issue_code, issue_message, element_selector";

pub(crate) fn row_to_issue(row: &Row) -> Result<AccessibilityIssue> {
    Ok(AccessibilityIssue {
        page_id: text(row, 0)?,
        batch_id: text(row, 1)?,
        format: parsed(row, 2)?,
        level: parsed(row, 3)?,
        code: text(row, 4)?,
        message: opt_text(row, 5),
        selector: opt_text(row, 6),
    })
}

pub(crate) const DISCOVERED_COLUMNS: &str = "id, target_page_id, wiki_url, discovery_depth, \
     discovery_status, first_discovered_at, first_discovered_by_batch, reference_count, \
     decision_made_at, decision_reason, converted_at, converted_batch_id, http_status_code, \
     last_check_at, check_attempt_count";

pub(crate) fn row_to_discovered(row: &Row) -> Result<DiscoveredPage> {
    Ok(DiscoveredPage {
        id: int(row, 0)?,
        target_page_id: page_id(row, 1)?,
        wiki_url: text(row, 2)?,
        depth: count(row, 3)?,
        status: parsed(row, 4)?,
        first_discovered_at: time(row, 5)?,
        first_discovered_by_batch: opt_text(row, 6),
        reference_count: count(row, 7)?,
        decision_made_at: opt_time(row, 8)?,
        decision_reason: opt_text(row, 9),
        converted_at: opt_time(row, 10)?,
        converted_batch_id: opt_text(row, 11),
        http_status_code: opt_int(row, 12).map(|v| v as u16),
        last_check_at: opt_time(row, 13)?,
        check_attempt_count: count(row, 14)?,
    })
}

pub(crate) fn row_to_source(row: &Row) -> Result<DiscoverySource> {
    Ok(DiscoverySource {
        discovered_page_id: int(row, 0)?,
        source_page_id: text(row, 1)?,
        link_text: opt_text(row, 2),
        batch_id: text(row, 3)?,
        discovered_at: time(row, 4)?,
    })
}

/// Read a single integer from the first column of the first row.
pub(crate) async fn scalar(rows: &mut libsql::Rows) -> Result<i64> {
    match rows.next().await.map_err(WikiAccessError::storage)? {
        Some(row) => Ok(row.get::<i64>(0).unwrap_or(0)),
        None => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_sort_lexicographically() {
        let early = Utc::now();
        let late = early + chrono::Duration::milliseconds(1);
        assert!(ts(early) < ts(late));
        assert!(ts(early).ends_with('Z'));
        assert_eq!(ts(early).len(), ts(late).len());
        assert_eq!(
            parse_ts(&ts(early)).unwrap().timestamp_micros(),
            early.timestamp_micros()
        );
    }
}
