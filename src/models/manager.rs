use std::path::{Path, PathBuf};
use std::time::Instant;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::core::error::{MissingArtifact, ProvisionError, Result};

use super::{
    catalog::{export_name, ArtifactDescriptor, Catalog},
    download::SnapshotSource,
    metadata,
    retry::{thread_sleeper, RetryPolicy, Sleeper},
};

pub const TOKEN_ENV: &str = "HF_TOKEN";

/// What to do about artifacts that are not on disk yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", try_from = "String")]
pub enum ProvisionPolicy {
    /// Fetch anything missing.
    Download,
    /// Fail closed; provisioning belongs to an external step.
    #[default]
    Verify,
    /// Trust the image or volume and only compute paths.
    Assume,
}

impl std::str::FromStr for ProvisionPolicy {
    type Err = ProvisionError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "download" | "ensure" => Ok(Self::Download),
            "verify" => Ok(Self::Verify),
            "assume" | "embedded" => Ok(Self::Assume),
            other => Err(ProvisionError::Config(format!(
                "unknown provisioning policy {other:?}, expected download, verify or assume"
            ))),
        }
    }
}

impl TryFrom<String> for ProvisionPolicy {
    type Error = ProvisionError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl std::fmt::Display for ProvisionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Download => "download",
            Self::Verify => "verify",
            Self::Assume => "assume",
        })
    }
}

/// Logical name to local directory, in catalog order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ResolvedPaths(IndexMap<String, PathBuf>);

impl ResolvedPaths {
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Path> {
        self.0.get(name).map(PathBuf::as_path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.0
            .iter()
            .map(|(name, path)| (name.as_str(), path.as_path()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `export MODEL_PATH_<NAME>='<path>'` lines for a startup script to eval.
    #[must_use]
    pub fn to_shell_exports(&self) -> String {
        self.iter()
            .map(|(name, path)| {
                let quoted = path.display().to_string().replace('\'', r"'\''");
                format!("export {}='{}'\n", export_name(name), quoted)
            })
            .collect()
    }
}

pub struct ModelManager {
    root: PathBuf,
    catalog: Catalog,
    token: Option<String>,
    source: Box<dyn SnapshotSource>,
    retry: RetryPolicy,
    sleeper: Sleeper,
}

impl ModelManager {
    /// A relative `root` is anchored at the current directory so every
    /// resolved path is absolute.
    pub fn new(
        root: impl Into<PathBuf>,
        catalog: Catalog,
        source: Box<dyn SnapshotSource>,
    ) -> Self {
        let root = root.into();
        let root = std::path::absolute(&root).unwrap_or(root);
        info!(root = %root.display(), models = catalog.len(), "model manager initialized");
        Self {
            root,
            catalog,
            token: None,
            source,
            retry: RetryPolicy::default(),
            sleeper: thread_sleeper(),
        }
    }

    /// Reads the access token from `HF_TOKEN`; only public repositories work without it.
    #[must_use]
    pub fn with_credential_from_env(self) -> Self {
        let token = std::env::var(TOKEN_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty());
        self.with_credential(token)
    }

    #[must_use]
    pub fn with_credential(mut self, token: Option<String>) -> Self {
        if token.is_none() {
            warn!("{TOKEN_ENV} not set, only public models can be downloaded");
        }
        self.token = token;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_sleeper(mut self, sleeper: Sleeper) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn root(&self) -> &Path {
        self.root.as_path()
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }

    pub fn presence_check(&self, name: &str) -> Result<bool> {
        let descriptor = self.catalog.get(name)?;
        let path = descriptor.path(&self.root);
        let present = metadata::has_entries(&path);
        if present {
            info!(model = name, path = %path.display(), "model already present");
        } else {
            info!(model = name, path = %path.display(), "model not found");
        }
        Ok(present)
    }

    pub fn fetch(&self, name: &str, max_attempts: u32) -> Result<PathBuf> {
        let descriptor = self.catalog.get(name)?;
        let retry = self.retry.with_max_attempts(max_attempts);
        let local_path = descriptor.path(&self.root);

        info!(
            model = name,
            description = %descriptor.description,
            repo = %descriptor.repo_id,
            size_gb = descriptor.size_gb,
            destination = %local_path.display(),
            "downloading model"
        );

        let mut attempt = 1;
        loop {
            info!(model = name, attempt, max_attempts = retry.max_attempts(), "download attempt");
            let started = Instant::now();
            match self
                .source
                .fetch_snapshot(&descriptor.repo_id, &local_path, self.token.as_deref())
            {
                Ok(outcome) => {
                    info!(
                        model = name,
                        elapsed_secs = started.elapsed().as_secs_f64(),
                        files = outcome.files,
                        skipped = outcome.skipped,
                        bytes = outcome.bytes_downloaded,
                        on_disk = metadata::total_size(&local_path),
                        "model downloaded"
                    );
                    return Ok(local_path);
                }
                Err(source) => {
                    error!(model = name, attempt, "download attempt failed: {source:#}");
                    match retry.delay_after(attempt) {
                        Some(delay) => {
                            info!(model = name, delay_secs = delay.as_secs_f64(), "retrying");
                            (self.sleeper)(delay);
                            attempt += 1;
                        }
                        None => {
                            return Err(ProvisionError::DownloadExhausted {
                                name: name.to_string(),
                                attempts: attempt,
                                source,
                            });
                        }
                    }
                }
            }
        }
    }

    pub fn ensure_all(&self) -> Result<ResolvedPaths> {
        info!("checking model availability");

        let mut pending = Vec::new();
        for name in self.catalog.names() {
            if !self.presence_check(name)? {
                pending.push(name);
            }
        }

        if pending.is_empty() {
            info!("all models already present, skipping download phase");
        } else {
            info!(
                pending = pending.len(),
                total_size_gb = self.catalog.total_size_gb(pending.iter().copied()),
                "models need downloading"
            );
            for name in &pending {
                self.fetch(name, self.retry.max_attempts())?;
            }
        }

        info!("model check complete");
        Ok(self.resolved_paths())
    }

    pub fn verify_all(&self) -> Result<ResolvedPaths> {
        info!(root = %self.root.display(), "verifying model cache");

        let mut missing = Vec::new();
        for (name, descriptor) in self.catalog.iter() {
            let path = descriptor.path(&self.root);
            if metadata::has_entries(&path) {
                info!(
                    model = name,
                    files = metadata::count_entries(&path),
                    path = %path.display(),
                    "{}", descriptor.description
                );
            } else {
                error!(model = name, path = %path.display(), "{} not found", descriptor.description);
                missing.push(missing_artifact(name, descriptor, path));
            }
        }

        if !missing.is_empty() {
            return Err(ProvisionError::ArtifactsMissing(missing));
        }

        info!("all models cached");
        Ok(self.resolved_paths())
    }

    /// Paths for every catalog entry without touching the filesystem.
    #[must_use]
    pub fn resolved_paths(&self) -> ResolvedPaths {
        ResolvedPaths(
            self.catalog
                .iter()
                .map(|(name, descriptor)| (name.to_string(), descriptor.path(&self.root)))
                .collect(),
        )
    }

    pub fn provision(&self, policy: ProvisionPolicy) -> Result<ResolvedPaths> {
        match policy {
            ProvisionPolicy::Download => self.ensure_all(),
            ProvisionPolicy::Verify => self.verify_all(),
            ProvisionPolicy::Assume => Ok(self.resolved_paths()),
        }
    }
}

fn missing_artifact(name: &str, descriptor: &ArtifactDescriptor, path: PathBuf) -> MissingArtifact {
    MissingArtifact {
        name: name.to_string(),
        repo_id: descriptor.repo_id.clone(),
        description: descriptor.description.clone(),
        path,
    }
}
