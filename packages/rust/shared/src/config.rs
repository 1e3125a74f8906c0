//! Application configuration for the annotation build engine.
//!
//! User config lives at `~/.annotate/annotate.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AnnotateError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "annotate.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".annotate";

// ---------------------------------------------------------------------------
// Config structs (matching annotate.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Public-facing server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Where build directories live.
    #[serde(default)]
    pub storage: StorageConfig,

    /// External pipeline invocation.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Idle-build retention.
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Administrative access.
    #[serde(default)]
    pub admin: AdminConfig,
}

/// `[server]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Base URL that download references are built from.
    #[serde(default = "default_backend_url")]
    pub backend_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            backend_url: default_backend_url(),
        }
    }
}

fn default_backend_url() -> String {
    "http://localhost:8801".into()
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory holding one sub-directory per build fingerprint.
    #[serde(default = "default_builds_dir")]
    pub builds_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            builds_dir: default_builds_dir(),
        }
    }
}

fn default_builds_dir() -> String {
    "~/.annotate/builds".into()
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Build tool executed for every pipeline stage.
    #[serde(default = "default_make_program")]
    pub make_program: String,

    /// Parallelism degree handed to the build tool (`-j`).
    #[serde(default = "default_processes")]
    pub processes: u32,

    /// Command prefix that launches one annotation tool on the execution
    /// backend. Its occurrence in the build tool's output marks one tool
    /// invocation.
    #[serde(default = "default_launcher")]
    pub launcher: String,

    /// Directory with the annotation models.
    #[serde(default = "default_models_dir")]
    pub models_dir: String,

    /// Directory with the shared build-script rules.
    #[serde(default = "default_makefiles_dir")]
    pub makefiles_dir: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            make_program: default_make_program(),
            processes: default_processes(),
            launcher: default_launcher(),
            models_dir: default_models_dir(),
            makefiles_dir: default_makefiles_dir(),
        }
    }
}

fn default_make_program() -> String {
    "make".into()
}
fn default_processes() -> u32 {
    2
}
fn default_launcher() -> String {
    "~/.annotate/bin/launch ~/.annotate/pipeline.sock".into()
}
fn default_models_dir() -> String {
    "~/.annotate/pipeline/models".into()
}
fn default_makefiles_dir() -> String {
    "~/.annotate/pipeline/makefiles".into()
}

/// `[retention]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Finished builds idle for longer than this are eligible for cleanup.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

fn default_idle_timeout_secs() -> u64 {
    7 * 24 * 60 * 60
}

/// `[admin]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Name of the env var holding the admin secret (never store the secret itself).
    #[serde(default = "default_secret_key_env")]
    pub secret_key_env: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            secret_key_env: default_secret_key_env(),
        }
    }
}

fn default_secret_key_env() -> String {
    "ANNOTATE_SECRET_KEY".into()
}

impl AdminConfig {
    /// Read the admin secret from the configured env var. Empty counts as unset.
    pub fn resolve_secret(&self) -> Option<String> {
        std::env::var(&self.secret_key_env)
            .ok()
            .filter(|s| !s.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Engine config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime engine configuration with paths expanded and the secret resolved.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root of the per-fingerprint build directories.
    pub builds_dir: PathBuf,
    /// Base URL for download references.
    pub backend_url: String,
    /// Build tool program.
    pub make_program: String,
    /// Build tool parallelism.
    pub processes: u32,
    /// Tool launcher command prefix, also the invocation marker.
    pub launcher: String,
    /// Annotation model directory exported to the pipeline.
    pub models_dir: PathBuf,
    /// Build-script rules directory exported to the pipeline.
    pub makefiles_dir: PathBuf,
    /// Default idle window for cleanup.
    pub idle_timeout: Duration,
    /// Admin secret, if one is configured.
    pub secret_key: Option<String>,
}

impl From<&AppConfig> for EngineConfig {
    fn from(config: &AppConfig) -> Self {
        let launcher = config
            .pipeline
            .launcher
            .split_whitespace()
            .map(|token| expand_home(token).to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ");

        Self {
            builds_dir: expand_home(&config.storage.builds_dir),
            backend_url: config.server.backend_url.trim_end_matches('/').to_string(),
            make_program: config.pipeline.make_program.clone(),
            processes: config.pipeline.processes.max(1),
            launcher,
            models_dir: expand_home(&config.pipeline.models_dir),
            makefiles_dir: expand_home(&config.pipeline.makefiles_dir),
            idle_timeout: Duration::from_secs(config.retention.idle_timeout_secs),
            secret_key: config.admin.resolve_secret(),
        }
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => match dirs::home_dir() {
            Some(home) => home.join(rest.trim_start_matches('/')),
            None => PathBuf::from(path),
        },
        _ => PathBuf::from(path),
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.annotate/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| AnnotateError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.annotate/annotate.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| AnnotateError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| AnnotateError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| AnnotateError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| AnnotateError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| AnnotateError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}
