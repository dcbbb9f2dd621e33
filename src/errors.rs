use std::path::PathBuf;

use thiserror::Error;

use crate::structures::{MhcClass, PredictorVersion};

/// Everything the engine can fail with. Launch and execution failures are
/// reported per job; the pool itself never aborts because one job failed.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The external binary could not be started (missing, not executable, ...).
    #[error("failed to launch job {job_id} (`{program}`): {message}")]
    ProcessLaunch {
        job_id: String,
        program: String,
        message: String,
    },
    /// The process ran but exited non-zero or printed the tool's error marker.
    #[error("job {job_id} failed (exit code {exit_code:?})\n--- stdout ---\n{stdout}\n--- stderr ---\n{stderr}")]
    ProcessExecution {
        job_id: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    /// Tool output did not follow the expected grammar.
    #[error("could not parse {what}: {detail}")]
    ParseFormat { what: String, detail: String },
    #[error("no prediction column layout for class {class} output of version {version}")]
    UnsupportedLayout {
        class: MhcClass,
        version: PredictorVersion,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("run was cancelled")]
    Cancelled,
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl PipelineError {
    pub fn parse_format(what: impl Into<String>, detail: impl Into<String>) -> Self {
        PipelineError::ParseFormat {
            what: what.into(),
            detail: detail.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
