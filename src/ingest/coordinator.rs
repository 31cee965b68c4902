use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use derive_builder::Builder;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::file_ingestor::FileIngestor;
use super::uploader::BatchSink;
use crate::db::TableRef;
use crate::formats::{DelimitedConfig, MalformedRowPolicy};
use crate::report::{FileFailure, FileOutcome, LoadedFile, RunReport};
use crate::telemetry::{ProgressStats, TelemetryEvent};

/// Immutable settings for one load run, passed to the coordinator at
/// construction. There is no process-wide mutable configuration.
#[derive(Debug, Clone, Builder)]
pub struct IngestConfig {
    pub table: TableRef,
    pub delimited: DelimitedConfig,
    #[builder(default = "crate::config::DEFAULT_CHUNK_SIZE")]
    pub chunk_size: usize,
    /// Concurrent batch uploads per file.
    #[builder(default = "4")]
    pub upload_concurrency: usize,
    /// Files processed in parallel.
    #[builder(default = "1")]
    pub file_concurrency: usize,
    #[builder(default = "MalformedRowPolicy::SkipAndCount")]
    pub policy: MalformedRowPolicy,
    #[builder(default = "false")]
    pub quiet: bool,
}

/// The Coordinator orchestrates one run across all discovered files.
///
/// Files are processed with bounded cross-file concurrency; a failed file
/// never stops the run. The one exception is a lost warehouse connection,
/// which cancels dispatch and finalizes whatever partial report exists.
pub struct Coordinator {
    sink: Arc<dyn BatchSink>,
    config: IngestConfig,
}

impl Coordinator {
    pub fn new(sink: Arc<dyn BatchSink>, config: IngestConfig) -> Self {
        Self { sink, config }
    }

    /// Process every file and aggregate the final report.
    ///
    /// Cancelling `cancel` stops dispatch of new files and batches
    /// immediately; uploads already in flight finish or time out, and a
    /// best-effort partial report is still returned.
    pub async fn run(&self, files: Vec<PathBuf>, cancel: CancellationToken) -> RunReport {
        let start_time = Instant::now();
        let started_at = Utc::now();
        let run_id = Uuid::new_v4().to_string();
        let total = files.len();

        info!(
            run_id = %run_id,
            files = total,
            table = %self.config.table,
            "starting load run"
        );

        let (telemetry_tx, telemetry_rx) = mpsc::unbounded_channel::<TelemetryEvent>();
        let prog_jh = self.spawn_progress_task(total, telemetry_rx);

        let ingestor = Arc::new(FileIngestor::new(
            Arc::clone(&self.sink),
            self.config.table.clone(),
            self.config.delimited.clone(),
            self.config.chunk_size,
            self.config.upload_concurrency,
            self.config.policy,
            telemetry_tx,
        ));

        let file_concurrency = self.config.file_concurrency.max(1);
        let mut pending = files.into_iter();
        let mut in_flight: JoinSet<(PathBuf, FileOutcome)> = JoinSet::new();
        let mut outcomes: Vec<(PathBuf, FileOutcome)> = Vec::with_capacity(total);
        let mut dispatched = 0usize;
        let mut run_fatal = false;

        loop {
            // Keep `file_concurrency` files in flight until the queue drains
            // or the run stops accepting work.
            while in_flight.len() < file_concurrency && !run_fatal && !cancel.is_cancelled() {
                match pending.next() {
                    Some(path) => {
                        dispatched += 1;
                        let ingestor = Arc::clone(&ingestor);
                        let cancel = cancel.clone();
                        in_flight.spawn(async move {
                            let outcome = ingestor.ingest(&path, &cancel).await;
                            (path, outcome)
                        });
                    }
                    None => break,
                }
            }

            match in_flight.join_next().await {
                Some(Ok((path, outcome))) => {
                    if let FileOutcome::Failed { cause, .. } = &outcome
                        && cause.is_run_fatal()
                    {
                        warn!(file = %path.display(), %cause, "aborting run");
                        run_fatal = true;
                        cancel.cancel();
                    }
                    outcomes.push((path, outcome));
                }
                Some(Err(join_err)) => {
                    warn!("file task panicked: {:#}", join_err);
                }
                None => break,
            }
        }

        // The ingestor owns the last telemetry sender; dropping it lets the
        // progress task drain and exit.
        drop(ingestor);
        if let Some(jh) = prog_jh {
            let _ = jh.await;
        }

        self.finalize(
            run_id, started_at, total, dispatched, outcomes, start_time,
        )
    }

    fn finalize(
        &self,
        run_id: String,
        started_at: chrono::DateTime<Utc>,
        total: usize,
        dispatched: usize,
        outcomes: Vec<(PathBuf, FileOutcome)>,
        start_time: Instant,
    ) -> RunReport {
        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        let mut rows_loaded = 0u64;
        let mut rows_skipped = 0u64;

        for (path, outcome) in outcomes {
            match outcome {
                FileOutcome::Completed {
                    rows_loaded: rows,
                    rows_skipped: skipped,
                    ..
                } => {
                    rows_loaded += rows;
                    rows_skipped += skipped;
                    succeeded.push(LoadedFile {
                        path,
                        rows_loaded: rows,
                        rows_skipped: skipped,
                    });
                }
                FileOutcome::Failed {
                    cause,
                    rows_loaded: partial,
                } => {
                    rows_loaded += partial;
                    failed.push(FileFailure {
                        path,
                        cause: cause.cause_label().to_string(),
                        detail: cause.to_string(),
                        rows_loaded: partial,
                    });
                }
            }
        }

        // Completion order is nondeterministic under file concurrency.
        succeeded.sort_by(|a, b| a.path.cmp(&b.path));
        failed.sort_by(|a, b| a.path.cmp(&b.path));

        let report = RunReport {
            run_id,
            table: self.config.table.to_string(),
            started_at,
            finished_at: Utc::now(),
            succeeded,
            failed,
            files_not_attempted: total - dispatched,
            rows_loaded,
            rows_skipped,
            duration_secs: start_time.elapsed().as_secs_f64(),
        };

        info!(
            run_id = %report.run_id,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            rows_loaded = report.rows_loaded,
            "load run finished: {}",
            report.summary_line()
        );

        report
    }

    /// Setup progress tracking with progress bars
    fn spawn_progress_task(
        &self,
        total_files: usize,
        mut telemetry_rx: mpsc::UnboundedReceiver<TelemetryEvent>,
    ) -> Option<tokio::task::JoinHandle<()>> {
        if self.config.quiet {
            return None;
        }

        let multi_progress = MultiProgress::new();

        let files_bar = multi_progress.add(ProgressBar::new(total_files as u64));
        files_bar.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] Files: [{bar:30.cyan/blue}] {pos}/{len} ({percent}%)")
                .unwrap()
                .progress_chars("=>-"),
        );

        let rows_bar = multi_progress.add(ProgressBar::no_length());
        rows_bar.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] Rows:  {human_pos} | {per_sec}")
                .unwrap(),
        );

        let stats_bar = multi_progress.add(ProgressBar::new(0));
        stats_bar.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] Batch Time: {msg}")
                .unwrap(),
        );

        Some(tokio::spawn(async move {
            let mut stats = ProgressStats::new();

            while let Some(event) = telemetry_rx.recv().await {
                stats.update(&event);

                files_bar.set_position(stats.files_finished as u64);
                rows_bar.set_position(stats.rows_loaded);

                let (p50, p90, p99) = stats.get_percentiles();
                if let (Some(p50), Some(p90), Some(p99)) = (p50, p90, p99) {
                    stats_bar
                        .set_message(format!("p50: {}ms, p90: {}ms, p99: {}ms", p50, p90, p99));
                }
            }

            files_bar.finish();
            rows_bar.finish();

            let (p50, p90, p99) = stats.get_percentiles();
            if let (Some(p50), Some(p90), Some(p99)) = (p50, p90, p99) {
                stats_bar
                    .finish_with_message(format!("p50: {}ms, p90: {}ms, p99: {}ms", p50, p90, p99));
            } else {
                stats_bar.finish();
            }
        }))
    }
}
