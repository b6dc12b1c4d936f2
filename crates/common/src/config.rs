//! storyrun configuration
//!
//! Loaded from a TOML file; every section and field is optional.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name, looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "storyrun.toml";

/// Environment variable carrying the config path into the runner
pub const CONFIG_ENV: &str = "STORYRUN_CONFIG";

/// Set in the runner's environment by the host
pub const CHILD_PROCESS_ENV: &str = "STORYRUN_CHILD_PROCESS";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoryrunConfig {
    /// Process bridge configuration
    pub bridge: BridgeConfig,

    /// Result batching configuration
    pub results: ResultsConfig,

    /// Coverage classification
    pub coverage: CoverageConfig,

    /// Catalog index access
    pub catalog: CatalogConfig,

    /// Test engine configuration
    pub engine: EngineConfig,

    /// Watch mode configuration
    pub watch: WatchConfig,
}

/// Process bridge configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Path to the storyrun-runner binary (None = auto-detect)
    pub runner_binary: Option<PathBuf>,

    /// Arguments passed to the runner binary
    pub runner_args: Vec<String>,

    /// Budget for the runner to signal readiness
    pub startup_timeout_secs: u64,

    /// Extra environment for the runner process
    pub extra_env: HashMap<String, String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            runner_binary: None,
            runner_args: Vec::new(),
            startup_timeout_secs: 30,
            extra_env: HashMap::new(),
        }
    }
}

/// Result batching configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultsConfig {
    /// Minimum interval between two result flushes
    pub flush_interval_ms: u64,
}

impl Default for ResultsConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 500,
        }
    }
}

/// Coverage watermarks, in percent
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoverageConfig {
    pub low_watermark: u8,
    pub high_watermark: u8,
}

impl Default for CoverageConfig {
    fn default() -> Self {
        Self {
            low_watermark: 50,
            high_watermark: 80,
        }
    }
}

/// Catalog index access
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// URL of the catalog's index.json
    pub index_url: String,

    pub request_timeout_secs: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            index_url: "http://127.0.0.1:6006/index.json".to_string(),
            request_timeout_secs: 10,
        }
    }
}

/// One engine project and the environment its tag filters come from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,

    /// Project root, relative to the engine root
    #[serde(default)]
    pub root: Option<PathBuf>,

    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Test engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root directory test files are discovered under
    pub root: PathBuf,

    /// Engine executable
    pub command: String,

    /// Arguments placed before the generated ones
    pub args: Vec<String>,

    /// File name suffixes of test-bearing files
    pub test_suffixes: Vec<String>,

    /// Directory names never descended into
    pub ignore_dirs: Vec<String>,

    pub projects: Vec<ProjectConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            command: "npx".to_string(),
            args: vec!["storyrun-engine".to_string()],
            test_suffixes: [".stories.tsx", ".stories.ts", ".stories.jsx", ".stories.js"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ignore_dirs: ["node_modules", ".git", "dist"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            projects: Vec::new(),
        }
    }
}

/// Watch mode configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Quiet period before a burst of file events is handled
    pub debounce_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self { debounce_ms: 100 }
    }
}

impl StoryrunConfig {
    /// Load configuration from file, falling back to defaults if absent
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the rest of the system cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.bridge.startup_timeout_secs == 0 {
            return Err(Error::InvalidConfig(
                "bridge.startup_timeout_secs must be positive".into(),
            ));
        }
        if self.results.flush_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "results.flush_interval_ms must be positive".into(),
            ));
        }
        let CoverageConfig {
            low_watermark,
            high_watermark,
        } = self.coverage;
        if low_watermark > high_watermark || high_watermark > 100 {
            return Err(Error::InvalidConfig(format!(
                "coverage watermarks must satisfy low <= high <= 100 (got {} / {})",
                low_watermark, high_watermark
            )));
        }
        if self.engine.command.trim().is_empty() {
            return Err(Error::InvalidConfig("engine.command must not be empty".into()));
        }
        Ok(())
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.bridge.startup_timeout_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.results.flush_interval_ms)
    }

    pub fn watch_debounce(&self) -> Duration {
        Duration::from_millis(self.watch.debounce_ms)
    }

    /// Get the runner binary path
    pub fn runner_binary(&self) -> PathBuf {
        self.bridge.runner_binary.clone().unwrap_or_else(|| {
            std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(|dir| dir.join("storyrun-runner")))
                .filter(|candidate| candidate.exists())
                .unwrap_or_else(|| PathBuf::from("storyrun-runner"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = StoryrunConfig::load(&tmp.path().join("absent.toml")).unwrap();
        assert_eq!(config, StoryrunConfig::default());
        assert_eq!(config.startup_timeout(), Duration::from_secs(30));
        assert_eq!(config.flush_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(
            &path,
            r#"
[coverage]
low_watermark = 40

[[engine.projects]]
name = "storybook"
env = { STORYRUN_INCLUDE_TAGS = "test,smoke" }
"#,
        )
        .unwrap();

        let config = StoryrunConfig::load(&path).unwrap();
        assert_eq!(config.coverage.low_watermark, 40);
        assert_eq!(config.coverage.high_watermark, 80);
        assert_eq!(config.engine.projects[0].env["STORYRUN_INCLUDE_TAGS"], "test,smoke");
        assert_eq!(config.results.flush_interval_ms, 500);
    }

    #[test]
    fn test_inverted_watermarks_rejected() {
        let mut config = StoryrunConfig::default();
        config.coverage.low_watermark = 90;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }
}
