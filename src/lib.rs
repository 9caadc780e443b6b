pub mod config;
pub mod fileio;
pub mod geom;
pub mod mem;
pub mod progress;
pub mod records;
pub mod stages;
pub mod types;

pub use config::ImportParameter;
pub use stages::Importer;

/// Common result type used throughout the importer
pub type Result<T> = anyhow::Result<T>;

/// Importer-wide error types
#[derive(thiserror::Error, Debug)]
pub enum ImportError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Format error in '{path}': {reason}")]
    Format { path: String, reason: String },

    #[error("Input data is not sorted by increasing id: {0}")]
    Ordering(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Temporary file '{0}' is not required by any import stage")]
    Provenance(String),

    #[error("Error while executing step '{0}'")]
    Stage(String),

    #[error("Import was aborted")]
    Aborted,
}

impl ImportError {
    /// Attach a path to a raw I/O error
    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        ImportError::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    pub fn format(path: impl AsRef<std::path::Path>, reason: impl Into<String>) -> Self {
        ImportError::Format {
            path: path.as_ref().display().to_string(),
            reason: reason.into(),
        }
    }
}
