//! Runner configuration: binary location, storage roots and budgets.
//!
//! Values are layered, lowest precedence first: built-in defaults, the
//! process environment, an optional JSON/YAML config file, then explicit
//! overrides (CLI flags). Every layer is a [`ConfigOverrides`] applied on top
//! of the previous result.

use crate::runner::{RunnerError, RunnerResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default wall-clock budget for one analysis process (5 minutes).
pub const DEFAULT_TIMEOUT_MS: u64 = 5 * 60 * 1000;

/// Upper bound accepted for the per-process timeout (24 hours).
pub const MAX_TIMEOUT_MS: u64 = 24 * 60 * 60 * 1000;

pub const ENV_BINARY_PATH: &str = "VOXLOGICA_BINARY_PATH";
pub const ENV_WORKSPACES_PATH: &str = "WORKSPACES_PATH";
pub const ENV_DATASET_PATH: &str = "DATASET_PATH";
pub const ENV_TIMEOUT_MS: &str = "VOXRUN_TIMEOUT_MS";
pub const ENV_MAX_CONCURRENT_CASES: &str = "VOXRUN_MAX_CONCURRENT_CASES";

/// Configuration injected into every orchestration call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Analysis binary; a bare name is looked up on `PATH`.
    pub binary_path: PathBuf,
    /// Root of the per-workspace run directory trees.
    pub workspaces_root: PathBuf,
    /// Root of the dataset trees (`<root>/<dataset>/<case>/*.nii.gz`).
    pub datasets_root: PathBuf,
    /// Wall-clock budget per analysis process, in milliseconds.
    pub timeout_ms: u64,
    /// Cap on simultaneously running analysis processes; unbounded when unset.
    #[serde(default)]
    pub max_concurrent_cases: Option<usize>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from("voxlogica"),
            workspaces_root: PathBuf::from("workspaces"),
            datasets_root: PathBuf::from("static").join("datasets"),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_concurrent_cases: None,
        }
    }
}

impl RunnerConfig {
    /// Defaults overlaid with the process environment.
    pub fn from_env() -> RunnerResult<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with variables read through `lookup`.
    pub fn from_env_with<F>(lookup: F) -> RunnerResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        config.apply(ConfigOverrides::from_lookup(lookup)?);
        Ok(config)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Apply every override that is set.
    pub fn apply(&mut self, overrides: ConfigOverrides) {
        if let Some(path) = overrides.binary_path {
            self.binary_path = path;
        }
        if let Some(path) = overrides.workspaces_root {
            self.workspaces_root = path;
        }
        if let Some(path) = overrides.datasets_root {
            self.datasets_root = path;
        }
        if let Some(ms) = overrides.timeout_ms {
            self.timeout_ms = ms;
        }
        if let Some(limit) = overrides.max_concurrent_cases {
            self.max_concurrent_cases = Some(limit);
        }
    }

    pub fn validate(&self) -> RunnerResult<()> {
        if self.binary_path.as_os_str().is_empty() {
            return Err(RunnerError::config("binary path must not be empty", None));
        }
        if self.timeout_ms == 0 || self.timeout_ms > MAX_TIMEOUT_MS {
            return Err(RunnerError::config(
                "timeout_ms out of range",
                Some(serde_json::json!({
                    "timeout_ms": self.timeout_ms,
                    "min": 1,
                    "max": MAX_TIMEOUT_MS,
                })),
            ));
        }
        if self.max_concurrent_cases == Some(0) {
            return Err(RunnerError::config(
                "max_concurrent_cases must be at least 1",
                None,
            ));
        }
        Ok(())
    }
}

/// A partial configuration layer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigOverrides {
    #[serde(default)]
    pub binary_path: Option<PathBuf>,
    #[serde(default)]
    pub workspaces_root: Option<PathBuf>,
    #[serde(default)]
    pub datasets_root: Option<PathBuf>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_concurrent_cases: Option<usize>,
}

impl ConfigOverrides {
    fn from_lookup<F>(lookup: F) -> RunnerResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        Ok(Self {
            binary_path: non_empty(ENV_BINARY_PATH).map(PathBuf::from),
            workspaces_root: non_empty(ENV_WORKSPACES_PATH).map(PathBuf::from),
            datasets_root: non_empty(ENV_DATASET_PATH).map(PathBuf::from),
            timeout_ms: non_empty(ENV_TIMEOUT_MS)
                .map(|raw| parse_env_number(ENV_TIMEOUT_MS, &raw))
                .transpose()?,
            max_concurrent_cases: non_empty(ENV_MAX_CONCURRENT_CASES)
                .map(|raw| parse_env_number(ENV_MAX_CONCURRENT_CASES, &raw))
                .transpose()?,
        })
    }
}

fn parse_env_number<T: std::str::FromStr>(key: &str, raw: &str) -> RunnerResult<T> {
    raw.trim().parse().map_err(|_| {
        RunnerError::config(
            format!("{key} must be a non-negative integer"),
            Some(serde_json::json!({ "value": raw })),
        )
    })
}

/// Load a config layer from a `.json`, `.yaml` or `.yml` file.
pub fn load_config_file(path: &Path) -> RunnerResult<ConfigOverrides> {
    let data = fs::read_to_string(path).map_err(|err| {
        RunnerError::config(
            "failed to read config file",
            Some(serde_json::json!({
                "path": path.display().to_string(),
                "source": err.to_string(),
            })),
        )
    })?;
    let is_yaml = matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml" | "yml")
    );
    let parsed = if is_yaml {
        serde_yml::from_str(&data).map_err(|err| err.to_string())
    } else {
        serde_json::from_str(&data).map_err(|err| err.to_string())
    };
    parsed.map_err(|source| {
        RunnerError::config(
            "failed to parse config file",
            Some(serde_json::json!({
                "path": path.display().to_string(),
                "source": source,
            })),
        )
    })
}

/// Fluent construction of a [`RunnerConfig`], mostly for tests and embedding.
#[derive(Clone, Debug, Default)]
pub struct RunnerConfigBuilder {
    config: RunnerConfig,
}

impl RunnerConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn binary_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.binary_path = path.into();
        self
    }

    #[must_use]
    pub fn workspaces_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.workspaces_root = path.into();
        self
    }

    #[must_use]
    pub fn datasets_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.datasets_root = path.into();
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn max_concurrent_cases(mut self, limit: usize) -> Self {
        self.config.max_concurrent_cases = Some(limit);
        self
    }

    #[must_use]
    pub fn build(self) -> RunnerConfig {
        self.config
    }
}
