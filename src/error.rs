use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failure taxonomy for a load run.
///
/// `MalformedRow` only escapes the chunk reader under
/// `MalformedRowPolicy::FailFile`; the skip-and-count policy absorbs it.
/// `ConnectionLost` is the only variant that aborts the whole run; every
/// other variant fails a single file.
#[derive(Debug, Clone, Error)]
pub enum IngestError {
    #[error("file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("cannot read {path}: {detail}")]
    FileUnreadable { path: PathBuf, detail: String },

    #[error("malformed row at line {line}: {detail}")]
    MalformedRow { line: u64, detail: String },

    #[error("batch rejected by warehouse: {detail}")]
    UploadFailed { detail: String },

    #[error("batch upload timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("warehouse connection lost: {detail}")]
    ConnectionLost { detail: String },

    #[error("run cancelled")]
    Cancelled,
}

impl IngestError {
    /// Short stable cause class used in reports, e.g. `Timeout`.
    pub fn cause_label(&self) -> &'static str {
        match self {
            IngestError::FileNotFound { .. } => "FileNotFound",
            IngestError::FileUnreadable { .. } => "FileUnreadable",
            IngestError::MalformedRow { .. } => "MalformedRow",
            IngestError::UploadFailed { .. } => "UploadFailure",
            IngestError::Timeout { .. } => "Timeout",
            IngestError::ConnectionLost { .. } => "ConnectionLost",
            IngestError::Cancelled => "Cancelled",
        }
    }

    /// True when further uploads are pointless for the entire run, not just
    /// for the file that observed the error.
    pub fn is_run_fatal(&self) -> bool {
        matches!(self, IngestError::ConnectionLost { .. })
    }
}
