use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    InvalidConfig(#[from] config::ConfigError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error("malformed dataset {}: {reason}", path.display())]
    MalformedDataset { path: PathBuf, reason: String },
    #[error("invalid topology: {0}")]
    InvalidTopology(String),
    #[error("can not connect to decision service at {addr}: {source}")]
    Connect { addr: String, source: std::io::Error },
    #[error("decision service did not answer after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
    #[error("malformed decision response `{raw}`: {reason}")]
    MalformedResponse { raw: String, reason: String },
    #[error("decision service chose action {action:?} outside of {candidates} candidates")]
    InvalidAction { action: Vec<i64>, candidates: usize },
    #[error(transparent)]
    Others(#[from] anyhow::Error),
}

/// A type alias that forces the usage of the custom error type.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn malformed_dataset(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::MalformedDataset {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn malformed_response(raw: &str, reason: impl Into<String>) -> Self {
        Self::MalformedResponse {
            raw: raw.to_owned(),
            reason: reason.into(),
        }
    }
}

impl From<tracing::subscriber::SetGlobalDefaultError> for Error {
    fn from(err: tracing::subscriber::SetGlobalDefaultError) -> Self {
        Self::Others(anyhow::Error::from(err))
    }
}

impl From<tracing_subscriber::util::TryInitError> for Error {
    fn from(err: tracing_subscriber::util::TryInitError) -> Self {
        Self::Others(anyhow::Error::from(err))
    }
}
