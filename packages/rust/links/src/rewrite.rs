//! Pure cross-reference classification and rewriting over rendered HTML.

use std::collections::HashMap;

use regex::{Captures, Regex};
use scraper::Html;
use url::Url;
use wikiaccess_shared::{
    LinkRecord, LinkType, PageId, ResolutionStatus, Result, WikiAccessError, WikiSource,
};

/// Longest link text kept on a link row.
pub const MAX_LINK_TEXT: usize = 200;

/// Local artifact extension that internal links are rewritten to.
const HTML_EXT: &str = "html";

// ---------------------------------------------------------------------------
// AvailablePages
// ---------------------------------------------------------------------------

/// Snapshot of pages that have a local rendered artifact, keyed by local name.
#[derive(Debug, Clone, Default)]
pub struct AvailablePages {
    by_local_name: HashMap<String, PageId>,
}

impl AvailablePages {
    pub fn new(ids: impl IntoIterator<Item = PageId>) -> Self {
        Self {
            by_local_name: ids.into_iter().map(|id| (id.local_name(), id)).collect(),
        }
    }

    pub fn contains(&self, id: &PageId) -> bool {
        self.by_local_name.contains_key(&id.local_name())
    }

    /// Identifier whose artifact is named `stem`, if one is available.
    pub fn by_local_name(&self, stem: &str) -> Option<&PageId> {
        self.by_local_name.get(stem)
    }

    pub fn len(&self) -> usize {
        self.by_local_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_local_name.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Resolution output
// ---------------------------------------------------------------------------

/// Per-page counts of classified references.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkCounts {
    /// References examined (internal and external).
    pub found: usize,
    /// Internal references rewritten to a local artifact in this pass.
    pub rewritten: usize,
    /// Internal references with no local artifact.
    pub broken: usize,
    pub external: usize,
}

/// Rewritten HTML plus every classified reference.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub html: String,
    pub links: Vec<LinkRecord>,
    pub counts: LinkCounts,
}

enum Target {
    Internal { id: PageId, anchor: Option<String> },
    /// Local artifact of an available page.
    LocalArtifact { id: PageId },
    External { origin: String },
}

// ---------------------------------------------------------------------------
// LinkRewriter
// ---------------------------------------------------------------------------

/// Attribute run inside a tag: quoted values may contain `>`.
const TAG_ATTRS: &str = r#"(?:[^>"']|"[^"]*"|'[^']*')"#;

/// Classifies `<a href>` references in rendered pages of one wiki.
///
/// Anchors are located with a quote-aware pattern so the `href` value can be
/// spliced in place; link text is extracted with scraper.
pub struct LinkRewriter {
    wiki: WikiSource,
    anchor_re: Regex,
}

impl LinkRewriter {
    pub fn new(wiki: WikiSource) -> Result<Self> {
        let pattern = format!(
            r#"(?is)<a\s(?:{TAG_ATTRS}*?\s)?href\s*=\s*(?:"([^"]*)"|'([^']*)'){TAG_ATTRS}*>(.*?)</a\s*>"#
        );
        let anchor_re = Regex::new(&pattern)
            .map_err(|e| WikiAccessError::validation(format!("link pattern: {e}")))?;
        Ok(Self { wiki, anchor_re })
    }

    pub fn wiki(&self) -> &WikiSource {
        &self.wiki
    }

    /// Classify every reference in `html` and rewrite the ones that resolve.
    ///
    /// References that already point at an available local artifact count
    /// as found without being rewritten again. Artifact references to pages
    /// that were never rendered are left out entirely.
    pub fn resolve(
        &self,
        html: &str,
        source: &PageId,
        available: &AvailablePages,
        batch_id: &str,
    ) -> Resolution {
        let mut links = Vec::new();
        let mut counts = LinkCounts::default();

        let rewritten = self.anchor_re.replace_all(html, |caps: &Captures<'_>| {
            let whole = &caps[0];
            let Some(href) = caps.get(1).or_else(|| caps.get(2)) else {
                return whole.to_string();
            };
            let Some(target) = self.classify(href.as_str(), available) else {
                return whole.to_string();
            };

            let text = link_text(caps.get(3).map_or("", |m| m.as_str()));
            counts.found += 1;
            let mut record = |target: String, link_type, resolution| {
                links.push(LinkRecord {
                    source_page_id: source.to_string(),
                    target,
                    link_text: text.clone(),
                    link_type,
                    resolution,
                    batch_id: batch_id.to_string(),
                });
            };

            match target {
                Target::External { origin } => {
                    counts.external += 1;
                    record(origin, LinkType::External, ResolutionStatus::External);
                    whole.to_string()
                }
                Target::LocalArtifact { id } => {
                    record(id.to_string(), LinkType::Internal, ResolutionStatus::Found);
                    whole.to_string()
                }
                Target::Internal { id, anchor } if available.contains(&id) => {
                    counts.rewritten += 1;
                    record(id.to_string(), LinkType::Internal, ResolutionStatus::Found);
                    let local = match anchor {
                        Some(a) => format!("{}#{a}", id.artifact_file(HTML_EXT)),
                        None => id.artifact_file(HTML_EXT),
                    };
                    splice(caps, href, &local)
                }
                Target::Internal { id, .. } => {
                    counts.broken += 1;
                    record(id.to_string(), LinkType::Internal, ResolutionStatus::Missing);
                    whole.to_string()
                }
            }
        });

        Resolution {
            html: rewritten.into_owned(),
            links,
            counts,
        }
    }

    fn classify(&self, raw_href: &str, available: &AvailablePages) -> Option<Target> {
        let href = raw_href.trim().replace("&amp;", "&");
        if href.is_empty() || href.starts_with('#') {
            return None;
        }
        let lower = href.to_ascii_lowercase();
        if ["mailto:", "javascript:", "tel:", "data:"]
            .iter()
            .any(|scheme| lower.starts_with(scheme))
        {
            return None;
        }

        if let Some(id) = self.wiki.page_id_from_href(&href) {
            let anchor = href
                .split_once('#')
                .map(|(_, a)| a.to_string())
                .filter(|a| !a.is_empty());
            return Some(Target::Internal { id, anchor });
        }

        match Url::parse(&href) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {
                let host = url.host_str()?;
                let origin = match url.port() {
                    Some(port) => format!("{}://{host}:{port}", url.scheme()),
                    None => format!("{}://{host}", url.scheme()),
                };
                Some(Target::External { origin })
            }
            Ok(_) => None,
            // Artifact names do not map back to identifiers; only a rendered
            // page with that name resolves them.
            Err(_) => local_artifact_stem(&href)
                .and_then(|stem| available.by_local_name(&stem).cloned())
                .map(|id| Target::LocalArtifact { id }),
        }
    }
}

/// Replace the `href` value inside one matched anchor tag.
fn splice(caps: &Captures<'_>, href: regex::Match<'_>, replacement: &str) -> String {
    let whole = &caps[0];
    let whole_start = caps.get(0).map_or(0, |m| m.start());
    let from = href.start() - whole_start;
    let to = href.end() - whole_start;
    format!("{}{}{}", &whole[..from], replacement, &whole[to..])
}

/// `ns_page.html#x` -> `ns_page`, for relative same-directory artifact links.
fn local_artifact_stem(href: &str) -> Option<String> {
    let path = href.split(['#', '?']).next()?;
    let name = path.strip_prefix("./").unwrap_or(path);
    if name.contains('/') {
        return None;
    }
    let stem = name.strip_suffix(".html")?;
    (!stem.is_empty()).then(|| stem.to_string())
}

/// Visible text of an anchor body, whitespace-collapsed and truncated.
fn link_text(inner_html: &str) -> Option<String> {
    let fragment = Html::parse_fragment(inner_html);
    let text: String = fragment.root_element().text().collect::<Vec<_>>().join(" ");
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return None;
    }
    Some(collapsed.chars().take(MAX_LINK_TEXT).collect())
}
