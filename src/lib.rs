//! Start-up gate for the inference service: makes sure every model the
//! service needs is present under the storage root, fetching or failing
//! according to the configured policy.

pub mod core;
pub mod models;

pub use crate::core::{ProvisionError, Result, Settings};
pub use crate::models::{Catalog, ModelManager, ProvisionPolicy, ResolvedPaths};
