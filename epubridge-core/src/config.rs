use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::decorations::DEFAULT_TINT;
use crate::Color;

pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const COVERS_DIR_NAME: &str = "Covers";

pub fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("org", "epubridge", "epubridge")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    pub cover: CoverConfig,
    pub highlights: HighlightConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoverConfig {
    /// Where extracted covers are written. Defaults to the platform cache
    /// directory.
    pub cache_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HighlightConfig {
    pub tint: Color,
}

impl Default for HighlightConfig {
    fn default() -> Self {
        Self { tint: DEFAULT_TINT }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive; `RUST_LOG` wins when set.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl BridgeConfig {
    pub fn from_toml(source: &str) -> Result<Self> {
        toml::from_str(source).context("failed to parse configuration")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let source = fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration {:?}", path))?;
        Self::from_toml(&source).with_context(|| format!("invalid configuration in {:?}", path))
    }

    /// Loads `path` when given; otherwise the per-user config file if it
    /// exists, else defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        let default_path = project_dirs()?.config_dir().join(CONFIG_FILE_NAME);
        if default_path.exists() {
            Self::load(&default_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn cover_cache_dir(&self) -> Result<PathBuf> {
        match &self.cover.cache_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(project_dirs()?.cache_dir().join(COVERS_DIR_NAME)),
        }
    }
}
