pub mod error;
pub mod settings;

pub use error::{MissingArtifact, ProvisionError, Result};
pub use settings::Settings;
