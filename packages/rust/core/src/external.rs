//! Subprocess-backed collaborators.
//!
//! Each call spawns the configured command with the request appended as
//! flags and expects exactly one JSON document on stdout. A non-zero exit
//! status, unparseable output, or exceeding the timeout fails the call.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::process::Command;
use tracing::debug;
use wikiaccess_shared::{CommandConfig, DocFormat, Result, WikiAccessError};

use crate::collaborators::{
    AccessibilityChecker, CheckReport, DocumentRenderer, RenderOutput, RenderRequest,
};

/// Longest stderr excerpt carried into an error message.
const STDERR_EXCERPT: usize = 500;

/// Renders pages by running an external command.
///
/// Invoked as `<command> <args..> --page-id ID --page-url URL
/// --output-dir DIR --formats html,docx`; prints a [`RenderOutput`].
pub struct CommandRenderer {
    config: CommandConfig,
}

impl CommandRenderer {
    pub fn new(config: CommandConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl DocumentRenderer for CommandRenderer {
    async fn render(&self, request: &RenderRequest) -> Result<RenderOutput> {
        let flags = vec![
            "--page-id".to_string(),
            request.page_id.to_string(),
            "--page-url".to_string(),
            request.page_url.clone(),
            "--output-dir".to_string(),
            request.output_dir.display().to_string(),
            "--formats".to_string(),
            request.formats.join(","),
        ];
        run_json(&self.config, flags, WikiAccessError::Render).await
    }
}

/// Audits artifacts by running an external command.
///
/// Invoked as `<command> <args..> --format HTML --file PATH`; prints a
/// [`CheckReport`].
pub struct CommandChecker {
    config: CommandConfig,
}

impl CommandChecker {
    pub fn new(config: CommandConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl AccessibilityChecker for CommandChecker {
    async fn check(&self, artifact: &Path, format: DocFormat) -> Result<CheckReport> {
        let flags = vec![
            "--format".to_string(),
            format.to_string(),
            "--file".to_string(),
            artifact.display().to_string(),
        ];
        run_json(&self.config, flags, WikiAccessError::Accessibility).await
    }
}

async fn run_json<T: DeserializeOwned>(
    config: &CommandConfig,
    flags: Vec<String>,
    fail: fn(String) -> WikiAccessError,
) -> Result<T> {
    debug!(command = %config.command, ?flags, "spawning collaborator");
    let child = Command::new(&config.command)
        .args(&config.args)
        .args(&flags)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| fail(format!("failed to spawn {}: {e}", config.command)))?;

    let output = tokio::time::timeout(config.timeout(), child.wait_with_output())
        .await
        .map_err(|_| {
            fail(format!(
                "{} timed out after {}s",
                config.command, config.timeout_secs
            ))
        })?
        .map_err(|e| fail(format!("{}: {e}", config.command)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let excerpt: String = stderr.trim().chars().take(STDERR_EXCERPT).collect();
        return Err(fail(format!(
            "{} exited with {}: {excerpt}",
            config.command, output.status
        )));
    }

    serde_json::from_slice(&output.stdout)
        .map_err(|e| fail(format!("{} printed invalid JSON: {e}", config.command)))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use wikiaccess_shared::PageId;

    /// `sh -c SCRIPT sh <flags..>`: flags land in `$@` and are ignored.
    fn shell(script: &str, timeout_secs: u64) -> CommandConfig {
        CommandConfig {
            command: "sh".into(),
            args: vec!["-c".into(), script.into(), "sh".into()],
            timeout_secs,
        }
    }

    fn request() -> RenderRequest {
        RenderRequest {
            page_id: PageId::parse("ns:a").unwrap(),
            page_url: "https://wiki.example.org/doku.php?id=ns:a".into(),
            output_dir: std::env::temp_dir(),
            formats: vec!["html".into()],
        }
    }

    #[tokio::test]
    async fn renderer_parses_stdout() {
        let renderer = CommandRenderer::new(shell(
            r#"printf '%s' '{"html_path":"out/ns_a.html","image_stats":{"total":2,"success":1,"failed":1}}'"#,
            10,
        ));
        let out = renderer.render(&request()).await.unwrap();
        assert_eq!(out.html_path.as_deref(), Some("out/ns_a.html"));
        assert_eq!(out.image_stats.failed, 1);
        assert!(out.images.is_empty());
    }

    #[tokio::test]
    async fn renderer_receives_request_flags() {
        // Echo the page id flag back as the markdown path.
        let renderer = CommandRenderer::new(shell(
            r#"printf '{"markdown_path":"%s"}' "$2""#,
            10,
        ));
        let out = renderer.render(&request()).await.unwrap();
        assert_eq!(out.markdown_path.as_deref(), Some("ns:a"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_render_error() {
        let renderer = CommandRenderer::new(shell("echo 'page not found' >&2; exit 3", 10));
        let err = renderer.render(&request()).await.unwrap_err();
        match err {
            WikiAccessError::Render(msg) => assert!(msg.contains("page not found")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn checker_times_out() {
        let checker = CommandChecker::new(shell("sleep 5", 1));
        let err = checker
            .check(Path::new("x.html"), DocFormat::Html)
            .await
            .unwrap_err();
        assert!(matches!(err, WikiAccessError::Accessibility(msg) if msg.contains("timed out")));
    }

    #[tokio::test]
    async fn checker_rejects_invalid_json() {
        let checker = CommandChecker::new(shell("echo not-json", 10));
        let err = checker
            .check(Path::new("x.html"), DocFormat::Html)
            .await
            .unwrap_err();
        assert!(matches!(err, WikiAccessError::Accessibility(_)));
    }
}
