//! Configuration for deploygate paths and defaults.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (DEPLOYGATE_HOME)
//! 2. Config file (.deploygate/config.yaml)
//! 3. Defaults (~/.deploygate)
//!
//! Config file discovery:
//! - Searches current directory and parents for .deploygate/config.yaml
//! - Paths in the config file are relative to the config file's location

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub gate: Option<GateConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory: runs, locks (relative to the config file)
    pub home: Option<String>,
    /// Pipeline definitions directory (relative to the config file's parent)
    pub pipelines: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GateConfig {
    pub timeout_seconds: Option<u64>,
    pub ansible_binary: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to deploygate home (runs, locks)
    pub home: PathBuf,
    /// Absolute path to the pipelines directory
    pub pipelines: PathBuf,
    /// Path to the config file (if found)
    pub config_file: Option<PathBuf>,
    /// Gate defaults
    pub gate: GateSettings,
}

#[derive(Debug, Clone)]
pub struct GateSettings {
    /// Default wall-clock ceiling for pipelines that do not set one
    pub timeout_seconds: u64,
    /// Playbook runner binary
    pub ansible_binary: String,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            timeout_seconds: 1800,
            ansible_binary: "ansible-playbook".to_string(),
        }
    }
}

impl ResolvedConfig {
    /// Path to a pipeline definition by name
    pub fn pipeline_path(&self, name: &str) -> PathBuf {
        self.pipelines.join(format!("{}.yaml", name))
    }

    /// Directory holding run journals
    pub fn runs_dir(&self) -> PathBuf {
        self.home.join("runs")
    }

    /// Directory holding lock files
    pub fn locks_dir(&self) -> PathBuf {
        self.home.join("locks")
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".deploygate").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to a base directory
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

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("failed to determine home directory")?
        .join(".deploygate");

    let config_file = find_config_file();

    let (home, pipelines, gate) = if let Some(ref config_path) = config_file {
        let config = load_config_file(config_path)?;

        // Base directory is the parent of .deploygate/
        let base_dir = config_path
            .parent() // .deploygate/
            .and_then(|p| p.parent()) // project root
            .unwrap_or(Path::new("."));

        let home = if let Ok(env_home) = std::env::var("DEPLOYGATE_HOME") {
            PathBuf::from(env_home)
        } else if let Some(ref home_path) = config.paths.home {
            // home is relative to the .deploygate/ directory
            let gate_dir = config_path.parent().unwrap_or(Path::new("."));
            resolve_path(gate_dir, home_path)
        } else {
            default_home.clone()
        };

        let pipelines = if let Some(ref pipelines_path) = config.paths.pipelines {
            resolve_path(base_dir, pipelines_path)
        } else {
            home.join("pipelines")
        };

        let defaults = GateSettings::default();
        let gate = GateSettings {
            timeout_seconds: config
                .gate
                .as_ref()
                .and_then(|g| g.timeout_seconds)
                .unwrap_or(defaults.timeout_seconds),
            ansible_binary: config
                .gate
                .as_ref()
                .and_then(|g| g.ansible_binary.clone())
                .unwrap_or(defaults.ansible_binary),
        };

        (home, pipelines, gate)
    } else {
        let home = std::env::var("DEPLOYGATE_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_home.clone());

        let pipelines = home.join("pipelines");

        (home, pipelines, GateSettings::default())
    };

    Ok(ResolvedConfig {
        home,
        pipelines,
        config_file,
        gate,
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the deploygate home directory (state)
pub fn home_dir() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the runs directory ($DEPLOYGATE_HOME/runs)
pub fn runs_dir() -> Result<PathBuf> {
    Ok(config()?.runs_dir())
}

/// Get the locks directory ($DEPLOYGATE_HOME/locks)
pub fn locks_dir() -> Result<PathBuf> {
    Ok(config()?.locks_dir())
}
