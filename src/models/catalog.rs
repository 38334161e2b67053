use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Component, Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::core::error::{ProvisionError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactDescriptor {
    pub repo_id: String,
    pub local_dir: String,
    /// Advisory only, never checked against the downloaded files.
    #[serde(default)]
    pub size_gb: f64,
    #[serde(default)]
    pub description: String,
}

impl ArtifactDescriptor {
    #[must_use]
    pub fn path(&self, base_dir: &Path) -> PathBuf {
        base_dir.join(&self.local_dir)
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.repo_id.trim().is_empty() {
            return Err(ProvisionError::InvalidCatalog(format!(
                "'{name}' has an empty repo id"
            )));
        }
        let components: Vec<_> = Path::new(&self.local_dir).components().collect();
        let escapes = components
            .iter()
            .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir));
        let names_a_dir = components
            .iter()
            .any(|component| matches!(component, Component::Normal(_)));
        if escapes || !names_a_dir {
            return Err(ProvisionError::InvalidCatalog(format!(
                "'{name}' has local dir {:?}, expected a relative path inside the storage root",
                self.local_dir
            )));
        }
        Ok(())
    }
}

/// Ordered set of artifacts a deployment requires.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(transparent)]
pub struct Catalog {
    entries: IndexMap<String, ArtifactDescriptor>,
}

impl Catalog {
    pub fn new(entries: IndexMap<String, ArtifactDescriptor>) -> Result<Self> {
        if entries.is_empty() {
            return Err(ProvisionError::InvalidCatalog("catalog has no entries".into()));
        }
        let mut exports: HashMap<String, &str> = HashMap::new();
        for (name, descriptor) in &entries {
            descriptor.validate(name)?;
            if let Some(previous) = exports.insert(export_name(name), name) {
                return Err(ProvisionError::InvalidCatalog(format!(
                    "'{previous}' and '{name}' both export {}",
                    export_name(name)
                )));
            }
        }
        Ok(Self { entries })
    }

    /// Artifacts required by the talking-avatar inference service.
    #[must_use]
    pub fn builtin() -> Self {
        let entries = default_artifacts().into_iter().collect();
        Self { entries }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|error| {
            ProvisionError::InvalidCatalog(format!("open {}: {error}", path.display()))
        })?;
        let entries: IndexMap<String, ArtifactDescriptor> =
            serde_json::from_reader(BufReader::new(file)).map_err(|error| {
                ProvisionError::InvalidCatalog(format!("parse {}: {error}", path.display()))
            })?;
        Self::new(entries)
    }

    pub fn get(&self, name: &str) -> Result<&ArtifactDescriptor> {
        self.entries
            .get(name)
            .ok_or_else(|| ProvisionError::UnknownArtifact(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArtifactDescriptor)> {
        self.entries
            .iter()
            .map(|(name, descriptor)| (name.as_str(), descriptor))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of advisory sizes; names outside the catalog contribute nothing.
    #[must_use]
    pub fn total_size_gb<'a, I>(&self, names: I) -> f64
    where
        I: IntoIterator<Item = &'a str>,
    {
        names
            .into_iter()
            .filter_map(|name| self.entries.get(name))
            .map(|descriptor| descriptor.size_gb)
            .sum()
    }
}

/// Shell variable carrying the resolved path of `name`.
pub(crate) fn export_name(name: &str) -> String {
    let suffix: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("MODEL_PATH_{suffix}")
}

fn default_artifacts() -> Vec<(String, ArtifactDescriptor)> {
    vec![
        (
            "wan2.1-i2v-14b".into(),
            ArtifactDescriptor {
                repo_id: "Wan-AI/Wan2.1-I2V-14B-480P".into(),
                local_dir: "Wan-AI/Wan2.1-I2V-14B-480P".into(),
                size_gb: 77.0,
                description: "Wan 2.1 Image-to-Video 14B model".into(),
            },
        ),
        (
            "chinese-wav2vec2".into(),
            ArtifactDescriptor {
                repo_id: "TencentGameMate/chinese-wav2vec2-base".into(),
                local_dir: "TencentGameMate/chinese-wav2vec2-base".into(),
                size_gb: 1.5,
                description: "Chinese Wav2Vec2 audio encoder".into(),
            },
        ),
        (
            "infinitetalk".into(),
            ArtifactDescriptor {
                repo_id: "MeiGen-AI/InfiniteTalk".into(),
                local_dir: "MeiGen-AI/InfiniteTalk".into(),
                size_gb: 158.0,
                description: "InfiniteTalk weights and audio conditioning".into(),
            },
        ),
    ]
}
