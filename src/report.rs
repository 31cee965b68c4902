//! Per-file outcomes and the aggregated run report.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::IngestError;

/// Terminal state of one source file.
#[derive(Debug, Clone)]
pub enum FileOutcome {
    Completed {
        batches: u32,
        rows_loaded: u64,
        rows_skipped: u64,
    },
    Failed {
        cause: IngestError,
        /// Rows committed before the failure. They stay in the destination;
        /// no compensating delete is attempted.
        rows_loaded: u64,
    },
}

impl FileOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, FileOutcome::Completed { .. })
    }
}

/// A file that loaded completely.
#[derive(Debug, Clone, Serialize)]
pub struct LoadedFile {
    pub path: PathBuf,
    pub rows_loaded: u64,
    pub rows_skipped: u64,
}

/// A file that failed, and why.
#[derive(Debug, Clone, Serialize)]
pub struct FileFailure {
    pub path: PathBuf,
    /// Short cause class, e.g. `Timeout` or `FileUnreadable`.
    pub cause: String,
    pub detail: String,
    /// Rows committed before the failure (accepted partial ingestion).
    pub rows_loaded: u64,
}

/// Aggregated result of one run, finalized once at the end.
///
/// Every attempted file appears in exactly one of `succeeded`/`failed`.
/// `files_not_attempted` is only non-zero when the run stopped early
/// (connection lost or cancelled).
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub table: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub succeeded: Vec<LoadedFile>,
    pub failed: Vec<FileFailure>,
    pub files_not_attempted: usize,
    /// Total rows committed to the destination, including partial rows of
    /// failed files.
    pub rows_loaded: u64,
    pub rows_skipped: u64,
    pub duration_secs: f64,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.files_not_attempted == 0
    }

    /// Final one-line summary for the operator.
    pub fn summary_line(&self) -> String {
        let total = self.succeeded.len() + self.failed.len() + self.files_not_attempted;
        if self.failed.is_empty() && self.files_not_attempted == 0 {
            format!("all {} files loaded successfully", total)
        } else if self.files_not_attempted > 0 {
            format!(
                "{} of {} files failed ({} not attempted)",
                self.failed.len(),
                total,
                self.files_not_attempted
            )
        } else {
            format!("{} of {} files failed", self.failed.len(), total)
        }
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Load Summary")?;
        writeln!(f, "============")?;
        writeln!(f, "Run ID: {}", self.run_id)?;
        writeln!(f, "Table: {}", self.table)?;
        writeln!(f, "Files succeeded: {}", self.succeeded.len())?;
        writeln!(f, "Files failed: {}", self.failed.len())?;
        writeln!(f, "Rows loaded: {}", self.rows_loaded)?;
        if self.rows_skipped > 0 {
            writeln!(f, "Malformed rows skipped: {}", self.rows_skipped)?;
        }
        writeln!(f, "Duration: {:.2}s", self.duration_secs)?;

        for failure in &self.failed {
            writeln!(
                f,
                "failed: {} ({}): {}",
                failure.path.display(),
                failure.cause,
                failure.detail
            )?;
        }

        writeln!(f, "{}", self.summary_line())
    }
}
