//! Engine configuration.
//!
//! Read from TOML. Lookup order: an explicit path, then
//! `<config dir>/imprimatur/config.toml`, then built-in defaults.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use imprimatur_policy::policy::DEFAULT_REKOR_URL;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::VerificationError;

/// Default location of the configuration file, resolved lazily.
static DEFAULT_CONFIG_PATH: LazyLock<Option<PathBuf>> = LazyLock::new(|| {
    directories::ProjectDirs::from("dev", "imprimatur", "imprimatur")
        .map(|dirs| dirs.config_dir().join("config.toml"))
});

/// Tunables for the policy engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Rules, and images within a rule, evaluated at once.
    pub concurrency: usize,
    /// Budget for each external call, in seconds.
    pub call_timeout_secs: u64,
    /// Rekor URL used when a cosign entry does not set one.
    pub default_rekor_url: String,
    /// Offline signature store used by the CLI.
    pub signature_store: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            call_timeout_secs: 30,
            default_rekor_url: DEFAULT_REKOR_URL.to_owned(),
            signature_store: None,
        }
    }
}

impl EngineConfig {
    /// Per-call timeout, never below one second.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs.max(1))
    }

    /// Concurrency, never below one.
    pub fn concurrency(&self) -> usize {
        self.concurrency.max(1)
    }

    /// Load from `path`.
    pub fn from_file(path: &Path) -> Result<Self, VerificationError> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|source| VerificationError::InvalidConfig {
            path: path.display().to_string(),
            source,
        })
    }

    /// Load from `path` if given, else from the default location if it
    /// exists, else defaults.
    pub fn resolve(path: Option<&Path>) -> Result<Self, VerificationError> {
        if let Some(path) = path {
            return Self::from_file(path);
        }
        match DEFAULT_CONFIG_PATH.as_deref() {
            Some(default) if default.is_file() => {
                debug!(path = %default.display(), "loading engine configuration");
                Self::from_file(default)
            }
            _ => Ok(Self::default()),
        }
    }
}
