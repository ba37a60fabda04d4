//! Application configuration for WikiAccess.
//!
//! Config is read from `./wikiaccess.toml` if present, otherwise from
//! `~/.wikiaccess/wikiaccess.toml`. CLI flags override config file values,
//! which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WikiAccessError};
use crate::wiki::WikiSource;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "wikiaccess.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".wikiaccess";

// ---------------------------------------------------------------------------
// Config structs (matching wikiaccess.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub wiki: WikiConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub output: OutputConfig,

    /// Conversion pipeline behaviour.
    #[serde(default)]
    pub pipeline: PipelineSettings,

    /// Remote existence checks for discovered pages.
    #[serde(default)]
    pub probe: ProbeSettings,

    /// External document renderer.
    #[serde(default = "default_renderer")]
    pub renderer: CommandConfig,

    /// External accessibility checker.
    #[serde(default = "default_checker")]
    pub checker: CommandConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            wiki: WikiConfig::default(),
            storage: StorageConfig::default(),
            output: OutputConfig::default(),
            pipeline: PipelineSettings::default(),
            probe: ProbeSettings::default(),
            renderer: default_renderer(),
            checker: default_checker(),
        }
    }
}

/// `[wiki]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WikiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl Default for WikiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
        }
    }
}

fn default_base_url() -> String {
    "https://wiki.example.org".into()
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "output/conversion_history.db".into()
}

/// `[output]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
        }
    }
}

fn default_output_dir() -> String {
    "output".into()
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Formats requested from the renderer.
    #[serde(default = "default_formats")]
    pub formats: Vec<String>,

    #[serde(default = "default_true")]
    pub check_accessibility: bool,

    #[serde(default = "default_true")]
    pub enable_discovery: bool,

    /// Skip pages converted successfully within the freshness window.
    #[serde(default = "default_true")]
    pub skip_recent: bool,

    #[serde(default = "default_freshness_minutes")]
    pub freshness_minutes: u64,

    /// Maximum discovery depth; discovery from a batch at this depth is a no-op.
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    /// Pages converted concurrently.
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,

    #[serde(default = "default_render_timeout")]
    pub render_timeout_secs: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            formats: default_formats(),
            check_accessibility: true,
            enable_discovery: true,
            skip_recent: true,
            freshness_minutes: default_freshness_minutes(),
            max_depth: default_max_depth(),
            concurrency: default_concurrency(),
            render_timeout_secs: default_render_timeout(),
        }
    }
}

fn default_formats() -> Vec<String> {
    vec!["html".into(), "docx".into()]
}
fn default_true() -> bool {
    true
}
fn default_freshness_minutes() -> u64 {
    60
}
fn default_max_depth() -> u32 {
    2
}
fn default_concurrency() -> u32 {
    1
}
fn default_render_timeout() -> u64 {
    300
}

/// `[probe]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSettings {
    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: u64,

    /// Extra attempts after a transient error.
    #[serde(default = "default_probe_retries")]
    pub retries: u32,

    #[serde(default = "default_probe_backoff")]
    pub backoff_ms: u64,

    /// Concurrent checks during a sweep.
    #[serde(default = "default_probe_concurrency")]
    pub concurrency: usize,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_probe_timeout(),
            retries: default_probe_retries(),
            backoff_ms: default_probe_backoff(),
            concurrency: default_probe_concurrency(),
        }
    }
}

fn default_probe_timeout() -> u64 {
    5
}
fn default_probe_retries() -> u32 {
    1
}
fn default_probe_backoff() -> u64 {
    250
}
fn default_probe_concurrency() -> usize {
    4
}

/// `[renderer]` / `[checker]` sections: an external command speaking JSON on stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default = "default_command_timeout")]
    pub timeout_secs: u64,
}

fn default_command_timeout() -> u64 {
    300
}

fn default_renderer() -> CommandConfig {
    CommandConfig {
        command: "wikiaccess-render".into(),
        args: Vec::new(),
        timeout_secs: default_command_timeout(),
    }
}

fn default_checker() -> CommandConfig {
    CommandConfig {
        command: "wikiaccess-check".into(),
        args: Vec::new(),
        timeout_secs: 120,
    }
}

impl CommandConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Runtime configs (merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub output_dir: PathBuf,
    pub formats: Vec<String>,
    pub check_accessibility: bool,
    pub enable_discovery: bool,
    pub skip_recent: bool,
    pub freshness: Duration,
    pub max_depth: u32,
    pub concurrency: usize,
    pub render_timeout: Duration,
}

impl From<&AppConfig> for PipelineConfig {
    fn from(config: &AppConfig) -> Self {
        let p = &config.pipeline;
        Self {
            output_dir: PathBuf::from(&config.output.dir),
            formats: p.formats.clone(),
            check_accessibility: p.check_accessibility,
            enable_discovery: p.enable_discovery,
            skip_recent: p.skip_recent,
            freshness: Duration::from_secs(p.freshness_minutes * 60),
            max_depth: p.max_depth,
            concurrency: p.concurrency.max(1) as usize,
            render_timeout: Duration::from_secs(p.render_timeout_secs),
        }
    }
}

/// Runtime existence-probe configuration.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub timeout: Duration,
    pub retries: u32,
    pub backoff: Duration,
    pub concurrency: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self::from(&ProbeSettings::default())
    }
}

impl From<&ProbeSettings> for ProbeConfig {
    fn from(p: &ProbeSettings) -> Self {
        Self {
            timeout: Duration::from_secs(p.timeout_secs),
            retries: p.retries,
            backoff: Duration::from_millis(p.backoff_ms),
            concurrency: p.concurrency.max(1),
        }
    }
}

impl AppConfig {
    /// Validated wiki source from `[wiki].base_url`.
    pub fn wiki_source(&self) -> Result<WikiSource> {
        WikiSource::new(&self.wiki.base_url)
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.wikiaccess/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| WikiAccessError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the user config file (`~/.wikiaccess/wikiaccess.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config. A `wikiaccess.toml` in the working directory
/// wins over the user config; defaults are used if neither exists.
pub fn load_config() -> Result<AppConfig> {
    let local = PathBuf::from(CONFIG_FILE_NAME);
    if local.exists() {
        return load_config_from(&local);
    }

    let path = config_file_path()?;
    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| WikiAccessError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        WikiAccessError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| WikiAccessError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| WikiAccessError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| WikiAccessError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("freshness_minutes"));
        assert!(toml_str.contains("conversion_history.db"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.pipeline.max_depth, 2);
        assert_eq!(parsed.probe.timeout_secs, 5);
        assert_eq!(parsed.renderer.command, "wikiaccess-render");
    }

    #[test]
    fn partial_file_uses_defaults() {
        let toml_str = r#"
[wiki]
base_url = "https://wiki.physics.example.edu/wiki"

[pipeline]
max_depth = 3
skip_recent = false
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.pipeline.max_depth, 3);
        assert!(!config.pipeline.skip_recent);
        assert_eq!(config.pipeline.freshness_minutes, 60);
        assert_eq!(
            config.wiki_source().unwrap().base_url(),
            "https://wiki.physics.example.edu/wiki"
        );
    }

    #[test]
    fn pipeline_config_from_app_config() {
        let mut app = AppConfig::default();
        app.pipeline.concurrency = 0;
        let p = PipelineConfig::from(&app);
        assert_eq!(p.freshness, Duration::from_secs(3600));
        assert_eq!(p.concurrency, 1);
        assert_eq!(p.formats, vec!["html", "docx"]);

        let probe = ProbeConfig::from(&app.probe);
        assert_eq!(probe.timeout, Duration::from_secs(5));
    }

    #[test]
    fn invalid_base_url_is_config_error() {
        let mut app = AppConfig::default();
        app.wiki.base_url = "not a url".into();
        let err = app.wiki_source().unwrap_err();
        assert!(err.to_string().starts_with("config error"));
    }
}
