use std::path::PathBuf;

use thiserror::Error;

/// Infrastructure failures. Anything the child itself does (nonzero exit, crash,
/// hang) is reported as data in [`crate::ExecutionResult`], never as an error.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed waiting on child pid {pid}: {source}")]
    Wait {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("failed capturing {stream}: {source}")]
    Capture {
        stream: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{stream} reader thread panicked")]
    ReaderPanicked { stream: &'static str },
    #[error("io on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
