//! SQL migration definitions for the conversion history database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: batches, pages, images, links, accessibility issues",
            sql: r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS batches (
    batch_id               TEXT PRIMARY KEY,
    wiki_url               TEXT NOT NULL,
    started_at             TEXT NOT NULL,
    completed_at           TEXT,
    total_pages            INTEGER NOT NULL DEFAULT 0,
    successful_pages       INTEGER NOT NULL DEFAULT 0,
    failed_pages           INTEGER NOT NULL DEFAULT 0,
    skipped_pages          INTEGER NOT NULL DEFAULT 0,
    total_images           INTEGER NOT NULL DEFAULT 0,
    failed_images          INTEGER NOT NULL DEFAULT 0,
    cancelled              INTEGER NOT NULL DEFAULT 0
);

-- Conversion attempts, append-only
CREATE TABLE IF NOT EXISTS pages (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    wiki_url            TEXT NOT NULL,
    page_id             TEXT NOT NULL,
    batch_id            TEXT NOT NULL REFERENCES batches(batch_id),
    status              TEXT NOT NULL CHECK(status IN ('SUCCESS', 'FAILED', 'PARTIAL')),
    markdown_path       TEXT,
    html_path           TEXT,
    docx_path           TEXT,
    html_aa_score       INTEGER,
    html_aaa_score      INTEGER,
    docx_aa_score       INTEGER,
    docx_aaa_score      INTEGER,
    image_count         INTEGER NOT NULL DEFAULT 0,
    image_success_count INTEGER NOT NULL DEFAULT 0,
    image_failed_count  INTEGER NOT NULL DEFAULT 0,
    converted_at        TEXT NOT NULL,
    duration_secs       REAL,
    error_message       TEXT
);

CREATE INDEX IF NOT EXISTS idx_pages_lookup ON pages(wiki_url, page_id, converted_at DESC);
CREATE INDEX IF NOT EXISTS idx_pages_batch ON pages(batch_id);

CREATE TABLE IF NOT EXISTS images (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    page_id          TEXT NOT NULL,
    batch_id         TEXT NOT NULL REFERENCES batches(batch_id),
    image_type       TEXT NOT NULL CHECK(image_type IN ('wiki_image', 'video_thumbnail', 'external_url')),
    source_url       TEXT NOT NULL,
    local_filename   TEXT,
    status           TEXT NOT NULL CHECK(status IN ('success', 'failed', 'cached', 'skipped', 'error', 'pending')),
    file_size        INTEGER,
    dimensions       TEXT,
    alt_text         TEXT,
    alt_text_quality TEXT CHECK(alt_text_quality IN ('missing', 'auto_generated', 'manual')),
    error_message    TEXT,
    recorded_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_images_page ON images(page_id, batch_id);
CREATE INDEX IF NOT EXISTS idx_images_status ON images(status, source_url);

CREATE TABLE IF NOT EXISTS links (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    source_page_id    TEXT NOT NULL,
    target_page_id    TEXT NOT NULL,
    link_text         TEXT,
    link_type         TEXT NOT NULL CHECK(link_type IN ('internal', 'external', 'anchor')),
    resolution_status TEXT NOT NULL CHECK(resolution_status IN ('found', 'missing', 'external')),
    batch_id          TEXT NOT NULL REFERENCES batches(batch_id),
    detected_at       TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_links_source ON links(source_page_id, batch_id);
CREATE INDEX IF NOT EXISTS idx_links_target ON links(target_page_id, resolution_status);

CREATE TABLE IF NOT EXISTS accessibility_issues (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    page_id          TEXT NOT NULL,
    batch_id         TEXT NOT NULL REFERENCES batches(batch_id),
    format           TEXT NOT NULL CHECK(format IN ('HTML', 'DOCX')),
    level            TEXT NOT NULL CHECK(level IN ('AA', 'AAA')),
    issue_code       TEXT NOT NULL,
    issue_message    TEXT,
    element_selector TEXT,
    detected_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_accessibility_page ON accessibility_issues(page_id, batch_id);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Discovery: discovered_pages, discovery_sources, batch lineage columns",
            sql: r#"
ALTER TABLE batches ADD COLUMN discovery_enabled INTEGER NOT NULL DEFAULT 0;
ALTER TABLE batches ADD COLUMN discovery_depth INTEGER NOT NULL DEFAULT 0;
ALTER TABLE batches ADD COLUMN parent_batch_id TEXT REFERENCES batches(batch_id);
ALTER TABLE batches ADD COLUMN pages_discovered_count INTEGER NOT NULL DEFAULT 0;

CREATE TABLE IF NOT EXISTS discovered_pages (
    id                        INTEGER PRIMARY KEY AUTOINCREMENT,
    target_page_id            TEXT NOT NULL UNIQUE,
    wiki_url                  TEXT NOT NULL,
    discovery_depth           INTEGER NOT NULL DEFAULT 1,
    discovery_status          TEXT NOT NULL CHECK(
        discovery_status IN ('discovered', 'approved', 'skipped', 'failed_404', 'converted')
    ),
    first_discovered_at       TEXT NOT NULL,
    first_discovered_by_batch TEXT REFERENCES batches(batch_id),
    reference_count           INTEGER NOT NULL DEFAULT 0,
    decision_made_at          TEXT,
    decision_reason           TEXT,
    converted_at              TEXT,
    converted_batch_id        TEXT REFERENCES batches(batch_id),
    http_status_code          INTEGER,
    last_check_at             TEXT,
    check_attempt_count       INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_discovered_status ON discovered_pages(discovery_status, discovery_depth);

CREATE TABLE IF NOT EXISTS discovery_sources (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    discovered_page_id INTEGER NOT NULL REFERENCES discovered_pages(id),
    source_page_id     TEXT NOT NULL,
    link_text          TEXT,
    batch_id           TEXT NOT NULL REFERENCES batches(batch_id),
    discovered_at      TEXT NOT NULL,
    UNIQUE(discovered_page_id, source_page_id, batch_id)
);

CREATE INDEX IF NOT EXISTS idx_discovery_sources_batch ON discovery_sources(batch_id);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
        Migration {
            version: 3,
            description: "Latest link resolution per source page",
            sql: r#"
CREATE TABLE IF NOT EXISTS page_resolutions (
    source_page_id TEXT PRIMARY KEY,
    batch_id       TEXT NOT NULL REFERENCES batches(batch_id),
    resolved_at    TEXT NOT NULL
);

INSERT OR IGNORE INTO page_resolutions (source_page_id, batch_id, resolved_at)
SELECT l.source_page_id, l.batch_id, l.detected_at
FROM links l
WHERE l.id = (SELECT MAX(l2.id) FROM links l2 WHERE l2.source_page_id = l.source_page_id);

INSERT INTO schema_migrations (version) VALUES (3);
"#,
        },
    ]
}
