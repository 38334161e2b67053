mod catalog;
mod download;
mod manager;
mod metadata;
mod retry;

pub use catalog::{ArtifactDescriptor, Catalog};
pub use download::{HubSnapshot, SnapshotOutcome, SnapshotSource, DEFAULT_ENDPOINT, DEFAULT_REVISION};
pub use manager::{ModelManager, ProvisionPolicy, ResolvedPaths, TOKEN_ENV};
pub use metadata::{compute_sha256, count_entries, has_entries, total_size};
pub use retry::{thread_sleeper, RetryPolicy, Sleeper, DEFAULT_MAX_ATTEMPTS};
