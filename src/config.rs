//! Configuration for databroker-pack.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (DATABROKER_PACK_CATALOG_PATH, DATABROKER_PACK_MONGO_URI)
//! 2. Config file (.databroker-pack/config.yaml)
//! 3. Defaults (~/.local/share/intake, /usr/local/share/intake)
//!
//! Config file discovery:
//! - Searches current directory and parents for .databroker-pack/config.yaml
//! - Falls back to <config dir>/databroker-pack/config.yaml
//! - Paths in config file are relative to the config file's parent directory

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Overrides the catalog search path (OS path-list syntax)
pub const CATALOG_PATH_ENV: &str = "DATABROKER_PACK_CATALOG_PATH";

/// Overrides the default MongoDB URI template used by unpack
pub const MONGO_URI_ENV: &str = "DATABROKER_PACK_MONGO_URI";

/// Default URI template; `{database}` is filled in by unpack
pub const DEFAULT_MONGO_URI: &str = "mongodb://localhost:27017/{database}";

/// Maximum number of lines per manifest file
pub const DEFAULT_MANIFEST_MAX_LINES: usize = 10_000;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    /// Directories searched for catalog files, in order
    #[serde(default)]
    pub catalog_path: Vec<String>,
    pub manifest_max_lines: Option<usize>,
    pub mongo_uri: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Catalog search path; unpack writes into the first entry
    pub catalog_path: Vec<PathBuf>,
    /// Maximum lines per manifest file
    pub manifest_max_lines: usize,
    /// MongoDB URI template
    pub mongo_uri: String,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

impl ResolvedConfig {
    /// Directory where unpack places new catalog files
    pub fn user_catalog_dir(&self) -> Result<&Path> {
        self.catalog_path
            .first()
            .map(PathBuf::as_path)
            .context("Catalog search path is empty")
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".databroker-pack").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    let user_config = dirs::config_dir()?.join("databroker-pack").join("config.yaml");
    user_config.exists().then_some(user_config)
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Default catalog search path: user data dir first, then the system one
pub fn default_catalog_path() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(data) = dirs::data_dir() {
        paths.push(data.join("intake"));
    }
    if cfg!(unix) {
        paths.push(PathBuf::from("/usr/local/share/intake"));
    }
    paths
}

/// Merge config file, environment and defaults.
fn resolve(
    config_file: Option<PathBuf>,
    env_catalog_path: Option<OsString>,
    env_mongo_uri: Option<String>,
) -> Result<ResolvedConfig> {
    let file = config_file.as_deref().map(load_config_file).transpose()?;

    let catalog_path = if let Some(raw) = env_catalog_path.filter(|p| !p.is_empty()) {
        std::env::split_paths(&raw).collect()
    } else if let (Some(file), Some(path)) = (&file, &config_file) {
        if file.catalog_path.is_empty() {
            default_catalog_path()
        } else {
            let base = path.parent().unwrap_or(Path::new("."));
            file.catalog_path
                .iter()
                .map(|p| resolve_path(base, p))
                .collect()
        }
    } else {
        default_catalog_path()
    };

    let manifest_max_lines = file
        .as_ref()
        .and_then(|f| f.manifest_max_lines)
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_MANIFEST_MAX_LINES);

    let mongo_uri = env_mongo_uri
        .or_else(|| file.as_ref().and_then(|f| f.mongo_uri.clone()))
        .unwrap_or_else(|| DEFAULT_MONGO_URI.to_string());

    Ok(ResolvedConfig {
        catalog_path,
        manifest_max_lines,
        mongo_uri,
        config_file,
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    resolve(
        find_config_file(),
        std::env::var_os(CATALOG_PATH_ENV),
        std::env::var(MONGO_URI_ENV).ok(),
    )
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}
