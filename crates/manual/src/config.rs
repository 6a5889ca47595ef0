//! Configuration file for the `manual` CLI.
//!
//! Every key is optional; command-line flags override whatever the file
//! sets.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::tools::{Tool, ToolsList};

/// Default agent data directory on the target host.
pub const DEFAULT_DATA_DIR: &str = "/var/lib/cluster";

/// Default local directory holding the environment's storage.
const DEFAULT_STORAGE_DIR: &str = "~/.cto/manual-storage";

/// Default environment name.
pub const DEFAULT_ENVIRON: &str = "manual";

/// Settings read from a YAML config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ManualConfig {
    /// Target in `user@host` form.
    pub host: Option<String>,
    /// Agent data directory on the host.
    pub data_dir: Option<PathBuf>,
    /// Local directory backing the environment's storage.
    pub storage_dir: Option<PathBuf>,
    /// Environment name.
    pub environ: Option<String>,
    /// Target OS series.
    pub series: Option<String>,
    /// Target architecture.
    pub arch: Option<String>,
    /// Path to a tools manifest.
    pub tools_manifest: Option<PathBuf>,
    /// Tools listed inline.
    pub tools: Vec<Tool>,
    /// SSH private key.
    pub identity_file: Option<PathBuf>,
    /// Deadline for the whole attempt, in seconds.
    pub timeout_secs: Option<u64>,
}

impl ManualConfig {
    /// Load a config file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Inline tools plus those from the manifest, in that order.
    ///
    /// # Errors
    /// Returns an error if the manifest cannot be loaded.
    pub fn tools_list(&self, manifest: Option<&Path>) -> Result<ToolsList> {
        let mut tools = self.tools.clone();
        if let Some(path) = manifest.or(self.tools_manifest.as_deref()) {
            let loaded = ToolsList::load(path).context("Failed to load tools manifest")?;
            tools.extend(loaded.tools);
        }
        Ok(ToolsList::new(tools))
    }
}

/// Expand a leading `~` to `$HOME`.
#[must_use]
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
    PathBuf::from(home).join(rest)
}

/// The default storage directory with `~` expanded.
#[must_use]
pub fn default_storage_dir() -> PathBuf {
    expand_home(Path::new(DEFAULT_STORAGE_DIR))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let yaml = r"
host: ubuntu@node1
data-dir: /var/lib/cluster
series: bionic
arch: amd64
timeout-secs: 600
tools:
  - version: 1.16.0
    series: bionic
    arch: amd64
    url: https://tools.example.com/clusterd.tgz
";
        let config: ManualConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.host.as_deref(), Some("ubuntu@node1"));
        assert_eq!(config.data_dir, Some(PathBuf::from("/var/lib/cluster")));
        assert_eq!(config.timeout_secs, Some(600));
        assert_eq!(config.tools.len(), 1);
        assert!(config.storage_dir.is_none());
    }

    #[test]
    fn test_empty_config() {
        let config: ManualConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, ManualConfig::default());
    }

    #[test]
    fn test_tools_list_merges_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("tools.yaml");
        std::fs::write(
            &manifest,
            "tools:\n  - version: 1.17.0\n    series: focal\n    arch: arm64\n    url: file:///srv/tools.tgz\n",
        )
        .unwrap();

        let config: ManualConfig = serde_yaml::from_str(
            "tools:\n  - version: 1.16.0\n    series: bionic\n    arch: amd64\n    url: https://x/t.tgz\n",
        )
        .unwrap();
        let list = config.tools_list(Some(&manifest)).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list.tools[1].series, "focal");
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home(Path::new("/abs/path")), PathBuf::from("/abs/path"));
        let expanded = expand_home(Path::new("~/.cto/x"));
        assert!(expanded.ends_with(".cto/x"));
        assert!(!expanded.starts_with("~"));
    }
}
