use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = ProvisionError> = std::result::Result<T, E>;

/// A catalog entry whose local directory was absent or empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingArtifact {
    pub name: String,
    pub repo_id: String,
    pub description: String,
    pub path: PathBuf,
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("unknown model: {0}")]
    UnknownArtifact(String),

    #[error("failed to download '{name}' after {attempts} attempts")]
    DownloadExhausted {
        name: String,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("{} required model(s) missing: {}", .0.len(), missing_names(.0))]
    ArtifactsMissing(Vec<MissingArtifact>),

    #[error("invalid catalog: {0}")]
    InvalidCatalog(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ProvisionError {
    /// Missing entries carried by [`ProvisionError::ArtifactsMissing`], empty otherwise.
    #[must_use]
    pub fn missing(&self) -> &[MissingArtifact] {
        match self {
            ProvisionError::ArtifactsMissing(missing) => missing,
            _ => &[],
        }
    }
}

fn missing_names(missing: &[MissingArtifact]) -> String {
    missing
        .iter()
        .map(|artifact| format!("{} ({})", artifact.name, artifact.repo_id))
        .collect::<Vec<_>>()
        .join(", ")
}
