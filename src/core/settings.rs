use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::error::{ProvisionError, Result};
use crate::models::{ProvisionPolicy, RetryPolicy, DEFAULT_ENDPOINT, DEFAULT_REVISION};

const CONFIG_FILE: &str = "config.json";

pub const STORAGE_ENV: &str = "MODEL_STORAGE_PATH";
pub const POLICY_ENV: &str = "MODEL_PROVISION_POLICY";
pub const CATALOG_ENV: &str = "MODEL_CATALOG";
pub const ENDPOINT_ENV: &str = "HF_ENDPOINT";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub storage_path: PathBuf,
    pub policy: ProvisionPolicy,
    pub max_attempts: u32,
    pub backoff_unit_secs: f64,
    /// JSON manifest replacing the built-in catalog.
    pub catalog_path: Option<PathBuf>,
    pub endpoint: String,
    pub revision: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("/runpod-volume"),
            policy: ProvisionPolicy::Verify,
            max_attempts: 3,
            backoff_unit_secs: 1.0,
            catalog_path: None,
            endpoint: DEFAULT_ENDPOINT.into(),
            revision: DEFAULT_REVISION.into(),
        }
    }
}

impl Settings {
    /// Defaults, then the config file, then the environment.
    ///
    /// An explicit `path` must exist; the per-user config file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => load_settings(path)?,
            None => match default_config_path() {
                Some(path) if path.exists() => load_settings(&path)?,
                _ => Settings::default(),
            },
        };
        settings.apply_env(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        if let Some(storage) = lookup(STORAGE_ENV) {
            self.storage_path = PathBuf::from(storage);
        }
        if let Some(policy) = lookup(POLICY_ENV) {
            self.policy = policy.parse()?;
        }
        if let Some(catalog) = lookup(CATALOG_ENV) {
            self.catalog_path = Some(PathBuf::from(catalog));
        }
        if let Some(endpoint) = lookup(ENDPOINT_ENV) {
            self.endpoint = endpoint;
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        let unit = Duration::try_from_secs_f64(self.backoff_unit_secs).map_err(|_| {
            ProvisionError::Config(format!(
                "backoffUnitSecs must be a non-negative number of seconds, got {}",
                self.backoff_unit_secs
            ))
        })?;
        Ok(RetryPolicy::new(self.max_attempts, unit))
    }
}

fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("com", "AvatarApi", "model-preflight")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
}

fn load_settings(path: &Path) -> Result<Settings> {
    debug!(path = %path.display(), "loading settings");
    let bytes = fs::read(path).map_err(|error| {
        ProvisionError::Config(format!("failed reading {}: {error}", path.display()))
    })?;
    serde_json::from_slice(&bytes).map_err(|error| {
        ProvisionError::Config(format!("{} could not be parsed: {error}", path.display()))
    })
}
