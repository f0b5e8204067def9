// daemon/src/config.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Optional JSON config file. Every key may be omitted.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DaemonConfig {
    #[serde(rename = "log-level")]
    pub log_level: String,
    #[serde(rename = "log-path")]
    pub log_path: Option<PathBuf>,
    #[serde(rename = "host")]
    pub host: String,
    #[serde(rename = "model")]
    pub model: String,
    #[serde(rename = "deps-dir")]
    pub deps_dir: Option<PathBuf>,
    #[serde(rename = "mirror")]
    pub mirror: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            log_level: "info".to_string(),
            log_path: None,
            host: snipper_core::rpc::DEFAULT_HOST.to_string(),
            model: "pix2text".to_string(),
            deps_dir: None,
            mirror: false,
        }
    }
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<DaemonConfig> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// `log-path`, or `<temp>/latexsnipper/daemon.log`.
    pub fn log_file(&self) -> PathBuf {
        self.log_path
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("latexsnipper").join("daemon.log"))
    }
}
