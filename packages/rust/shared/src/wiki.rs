//! Page identifiers and the mapping between wiki URLs, identifiers, and
//! local artifact file names.
//!
//! The local-name mapping (`:` becomes `_`) is shared by the link resolver
//! and by the renderer's output naming, so every caller must go through
//! [`PageId::local_name`] rather than rebuilding it by hand.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Result, WikiAccessError};

/// Namespace separator inside a page identifier.
pub const NAMESPACE_SEPARATOR: char = ':';

/// Separator used in local artifact names.
pub const LOCAL_SEPARATOR: char = '_';

// ---------------------------------------------------------------------------
// PageId
// ---------------------------------------------------------------------------

/// A validated wiki page identifier such as `course:notes:momentum`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PageId(String);

impl PageId {
    /// Parse and normalize a raw identifier.
    ///
    /// Surrounding whitespace and leading/trailing separators are removed.
    /// Empty identifiers and identifiers containing whitespace, `/`, `?`
    /// or `#` are rejected.
    pub fn parse(raw: &str) -> Result<Self> {
        let id = raw.trim().trim_matches(NAMESPACE_SEPARATOR);
        if id.is_empty() {
            return Err(WikiAccessError::validation(format!(
                "empty page id: {raw:?}"
            )));
        }
        if let Some(bad) = id
            .chars()
            .find(|c| c.is_whitespace() || matches!(c, '/' | '?' | '#'))
        {
            return Err(WikiAccessError::validation(format!(
                "page id {raw:?} contains invalid character {bad:?}"
            )));
        }
        if id.contains("::") {
            return Err(WikiAccessError::validation(format!(
                "page id {raw:?} has an empty namespace segment"
            )));
        }
        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-safe name: separators replaced by underscores.
    pub fn local_name(&self) -> String {
        self.0.replace(NAMESPACE_SEPARATOR, &LOCAL_SEPARATOR.to_string())
    }

    /// Artifact file name for a given format extension, e.g. `a_b.html`.
    pub fn artifact_file(&self, ext: &str) -> String {
        format!("{}.{}", self.local_name(), ext.trim_start_matches('.'))
    }

    /// Parent namespace, if any (`a:b:c` -> `a:b`).
    pub fn namespace(&self) -> Option<&str> {
        self.0.rsplit_once(NAMESPACE_SEPARATOR).map(|(ns, _)| ns)
    }

    /// Whether this page lives under `prefix` (a namespace or id prefix).
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix.trim_start_matches(NAMESPACE_SEPARATOR))
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(&self.0)
    }
}

impl std::str::FromStr for PageId {
    type Err = WikiAccessError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PageId {
    type Error = WikiAccessError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<PageId> for String {
    fn from(id: PageId) -> Self {
        id.0
    }
}

impl AsRef<str> for PageId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// WikiSource
// ---------------------------------------------------------------------------

/// The remote wiki that pages are converted from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WikiSource {
    base: Url,
    base_str: String,
}

impl WikiSource {
    /// Build from a base URL such as `https://wiki.example.org/wiki`.
    pub fn new(base_url: &str) -> Result<Self> {
        let trimmed = base_url.trim().trim_end_matches('/');
        let base = Url::parse(&format!("{trimmed}/"))
            .map_err(|e| WikiAccessError::config(format!("invalid wiki url {base_url:?}: {e}")))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(WikiAccessError::config(format!(
                "wiki url must be http(s): {base_url}"
            )));
        }
        Ok(Self {
            base,
            base_str: trimmed.to_string(),
        })
    }

    /// Base URL without a trailing slash. Stored on batch and page rows.
    pub fn base_url(&self) -> &str {
        &self.base_str
    }

    /// Remote URL of a page.
    pub fn page_url(&self, id: &PageId) -> String {
        format!("{}/doku.php?id={}", self.base_str, id)
    }

    /// Whether `url` has the same scheme, host and port as the wiki.
    pub fn is_same_origin(&self, url: &Url) -> bool {
        url.scheme() == self.base.scheme()
            && url.host_str() == self.base.host_str()
            && url.port_or_known_default() == self.base.port_or_known_default()
    }

    /// Extract a page identifier from an href if it points at a wiki page.
    ///
    /// Accepts absolute or relative hrefs in the `doku.php?id=ns:page` and
    /// `doku.php/ns:page` forms. Any anchor is ignored.
    pub fn page_id_from_href(&self, href: &str) -> Option<PageId> {
        let url = self.base.join(href.trim()).ok()?;
        if !self.is_same_origin(&url) {
            return None;
        }
        let path = url.path();
        if path.ends_with("doku.php") {
            let id = url
                .query_pairs()
                .find(|(k, _)| k == "id")
                .map(|(_, v)| v.into_owned())?;
            return PageId::parse(&id).ok();
        }
        let (_, rest) = path.split_once("doku.php/")?;
        PageId::parse(&rest.replace('/', ":")).ok()
    }
}

/// Parse one entry of a page list file.
///
/// Accepts a bare page id, a wiki URL, or a numbered `N→URL` export line.
/// Returns `Ok(None)` for blank lines and `#` comments.
pub fn parse_page_list_line(wiki: &WikiSource, line: &str) -> Result<Option<PageId>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let entry = match line.split_once('→') {
        Some((n, rest)) if n.trim().chars().all(|c| c.is_ascii_digit()) => rest.trim(),
        _ => line,
    };
    if entry.contains("://") || entry.contains("doku.php") {
        return wiki.page_id_from_href(entry).map(Some).ok_or_else(|| {
            WikiAccessError::validation(format!("not a page url on this wiki: {entry}"))
        });
    }
    PageId::parse(entry).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wiki() -> WikiSource {
        WikiSource::new("https://wiki.example.org/wiki/").expect("wiki")
    }

    #[test]
    fn page_id_normalizes_and_validates() {
        assert_eq!(PageId::parse(" :a:b ").unwrap().as_str(), "a:b");
        assert!(PageId::parse("").is_err());
        assert!(PageId::parse(":::").is_err());
        assert!(PageId::parse("a b").is_err());
        assert!(PageId::parse("a/b").is_err());
        assert!(PageId::parse("a::b").is_err());
    }

    #[test]
    fn local_name_mapping() {
        let id = PageId::parse("183_notes:momentum").unwrap();
        assert_eq!(id.local_name(), "183_notes_momentum");
        assert_eq!(id.artifact_file("html"), "183_notes_momentum.html");
        assert_eq!(id.artifact_file(".docx"), "183_notes_momentum.docx");
        assert_eq!(id.namespace(), Some("183_notes"));
        assert!(id.has_prefix("183_notes:"));
    }

    #[test]
    fn page_url_format() {
        let id = PageId::parse("a:b").unwrap();
        assert_eq!(
            wiki().page_url(&id),
            "https://wiki.example.org/wiki/doku.php?id=a:b"
        );
        assert_eq!(wiki().base_url(), "https://wiki.example.org/wiki");
    }

    #[test]
    fn href_extraction() {
        let w = wiki();
        let id = |s| w.page_id_from_href(s).map(|p| p.to_string());
        assert_eq!(
            id("https://wiki.example.org/wiki/doku.php?id=a:b#sec").as_deref(),
            Some("a:b")
        );
        assert_eq!(id("/wiki/doku.php?id=:c").as_deref(), Some("c"));
        assert_eq!(id("doku.php?id=ns:d&do=edit").as_deref(), Some("ns:d"));
        assert_eq!(id("/wiki/doku.php/ns:e").as_deref(), Some("ns:e"));
        assert_eq!(id("https://other.org/doku.php?id=a"), None);
        assert_eq!(id("https://wiki.example.org/wiki/lib/exe/fetch.php?media=x.png"), None);
        assert_eq!(id("a_b.html"), None);
        assert_eq!(id("https://wiki.example.org/wiki/doku.php"), None);
    }

    #[test]
    fn page_list_lines() {
        let w = wiki();
        assert_eq!(parse_page_list_line(&w, "  ").unwrap(), None);
        assert_eq!(parse_page_list_line(&w, "# comment").unwrap(), None);
        assert_eq!(
            parse_page_list_line(&w, "a:b").unwrap().unwrap().as_str(),
            "a:b"
        );
        assert_eq!(
            parse_page_list_line(&w, "3→https://wiki.example.org/wiki/doku.php?id=x:y")
                .unwrap()
                .unwrap()
                .as_str(),
            "x:y"
        );
        assert!(parse_page_list_line(&w, "https://elsewhere.org/page").is_err());
    }
}
