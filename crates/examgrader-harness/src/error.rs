use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("io on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("fixture '{fixture_id}': {message}")]
    InvalidDescriptor { fixture_id: String, message: String },
    #[error("framework '{name}': {message}")]
    Framework { name: String, message: String },
    #[error("config: {0}")]
    Config(String),
    #[error("report: {0}")]
    Report(String),
    #[error(transparent)]
    Exec(#[from] examgrader_exec::ExecError),
}

impl HarnessError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn invalid(fixture_id: &str, message: impl Into<String>) -> Self {
        Self::InvalidDescriptor {
            fixture_id: fixture_id.to_string(),
            message: message.into(),
        }
    }
}
