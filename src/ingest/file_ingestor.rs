use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::uploader::{BatchSink, UploadOutcome};
use crate::db::TableRef;
use crate::error::IngestError;
use crate::formats::{ChunkReader, DelimitedConfig, MalformedRowPolicy};
use crate::report::FileOutcome;
use crate::telemetry::TelemetryEvent;

/// Drives one source file from open to a terminal outcome:
/// `Opening -> Streaming -> {Completed, Failed}`.
///
/// Batches are dispatched into a `JoinSet` capped at `upload_concurrency`.
/// The first failed upload, any reader error, or cancellation stops
/// dispatch; uploads already in flight are allowed to finish, but their
/// outcomes no longer change the file's fate. Errors never escape this
/// boundary — everything is folded into the returned `FileOutcome`.
pub struct FileIngestor {
    sink: Arc<dyn BatchSink>,
    table: TableRef,
    delimited: DelimitedConfig,
    chunk_size: usize,
    upload_concurrency: usize,
    policy: MalformedRowPolicy,
    telemetry_tx: mpsc::UnboundedSender<TelemetryEvent>,
}

impl FileIngestor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sink: Arc<dyn BatchSink>,
        table: TableRef,
        delimited: DelimitedConfig,
        chunk_size: usize,
        upload_concurrency: usize,
        policy: MalformedRowPolicy,
        telemetry_tx: mpsc::UnboundedSender<TelemetryEvent>,
    ) -> Self {
        Self {
            sink,
            table,
            delimited,
            chunk_size,
            upload_concurrency: upload_concurrency.max(1),
            policy,
            telemetry_tx,
        }
    }

    pub async fn ingest(&self, path: &Path, cancel: &CancellationToken) -> FileOutcome {
        let _ = self.telemetry_tx.send(TelemetryEvent::FileStarted);

        let mut reader = match ChunkReader::open(
            path,
            self.delimited.clone(),
            self.chunk_size,
            self.policy,
        ) {
            Ok(reader) => reader,
            Err(cause) => return self.finish(path, Some(cause), 0, 0, 0),
        };

        let mut in_flight: JoinSet<UploadOutcome> = JoinSet::new();
        let mut rows_loaded = 0u64;
        let mut rows_skipped = 0u64;
        let mut batches = 0u32;
        let mut failure: Option<IngestError> = None;

        'dispatch: loop {
            // Cap in-flight uploads before dispatching another batch.
            while in_flight.len() >= self.upload_concurrency {
                match observe(in_flight.join_next().await) {
                    Ok(rows) => rows_loaded += rows,
                    Err(cause) => {
                        failure = Some(cause);
                        break 'dispatch;
                    }
                }
            }

            let next = tokio::select! {
                // Cancellation wins over a ready batch so that stopping
                // dispatch is immediate and deterministic.
                biased;
                _ = cancel.cancelled() => {
                    failure = Some(IngestError::Cancelled);
                    break;
                }
                next = reader.next_batch() => next,
            };

            match next {
                None => break,
                Some(Err(cause)) => {
                    failure = Some(cause);
                    break;
                }
                Some(Ok(batch)) => {
                    rows_skipped += batch.malformed_skipped;
                    if batch.rows.is_empty() {
                        // Trailing skipped rows produced no uploadable batch.
                        continue;
                    }

                    batches += 1;
                    let sink = Arc::clone(&self.sink);
                    let table = self.table.clone();
                    let telemetry_tx = self.telemetry_tx.clone();
                    in_flight.spawn(async move {
                        let outcome = sink.put_rows(&table, &batch).await;
                        if let Ok(receipt) = &outcome {
                            let _ = telemetry_tx.send(TelemetryEvent::BatchUploaded {
                                rows: receipt.rows,
                                duration_ms: receipt.duration.as_millis() as u64,
                            });
                        }
                        outcome
                    });
                }
            }
        }

        // Stops the reader task and releases the file handle.
        drop(reader);

        if failure.is_none() {
            while let Some(joined) = in_flight.join_next().await {
                match observe(Some(joined)) {
                    Ok(rows) => rows_loaded += rows,
                    Err(cause) => {
                        failure = Some(cause);
                        break;
                    }
                }
            }
        }

        // After a failure, in-flight uploads run to completion but their
        // outcomes are discarded; rows they committed are still counted so
        // the report reflects what reached the destination.
        while let Some(joined) = in_flight.join_next().await {
            if let Ok(Ok(receipt)) = joined {
                rows_loaded += receipt.rows;
            }
        }

        self.finish(path, failure, rows_loaded, rows_skipped, batches)
    }

    fn finish(
        &self,
        path: &Path,
        failure: Option<IngestError>,
        rows_loaded: u64,
        rows_skipped: u64,
        batches: u32,
    ) -> FileOutcome {
        let success = failure.is_none();
        let _ = self.telemetry_tx.send(TelemetryEvent::FileFinished {
            success,
            rows_skipped,
        });

        match failure {
            None => {
                debug!(file = %path.display(), batches, rows_loaded, rows_skipped, "file completed");
                FileOutcome::Completed {
                    batches,
                    rows_loaded,
                    rows_skipped,
                }
            }
            Some(cause) => {
                warn!(file = %path.display(), %cause, rows_loaded, "file failed");
                FileOutcome::Failed { cause, rows_loaded }
            }
        }
    }
}

fn observe(
    joined: Option<Result<UploadOutcome, tokio::task::JoinError>>,
) -> Result<u64, IngestError> {
    match joined {
        Some(Ok(Ok(receipt))) => Ok(receipt.rows),
        Some(Ok(Err(cause))) => Err(cause),
        Some(Err(join_err)) => Err(IngestError::UploadFailed {
            detail: format!("upload task panicked: {}", join_err),
        }),
        None => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UPLOAD_TIMEOUT;
    use crate::ingest::uploader::BatchReceipt;
    use crate::formats::RowBatch;
    use async_trait::async_trait;
    use std::io::Write;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Sink that records every batch it sees and fails on one scripted seq.
    struct ScriptedSink {
        seen: Mutex<Vec<(u32, u64)>>,
        fail_on_seq: Option<u32>,
        failure: IngestError,
    }

    impl ScriptedSink {
        fn ok() -> Self {
            Self {
                seen: Mutex::new(Vec::new()),
                fail_on_seq: None,
                failure: IngestError::Cancelled,
            }
        }

        fn failing_on(seq: u32, failure: IngestError) -> Self {
            Self {
                seen: Mutex::new(Vec::new()),
                fail_on_seq: Some(seq),
                failure,
            }
        }

        fn seen(&self) -> Vec<(u32, u64)> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BatchSink for ScriptedSink {
        async fn put_rows(&self, _table: &TableRef, batch: &RowBatch) -> UploadOutcome {
            self.seen
                .lock()
                .unwrap()
                .push((batch.seq, batch.rows.len() as u64));

            if self.fail_on_seq == Some(batch.seq) {
                return Err(self.failure.clone());
            }

            Ok(BatchReceipt {
                seq: batch.seq,
                rows: batch.rows.len() as u64,
                duration: Duration::from_millis(1),
            })
        }
    }

    fn write_csv(dir: &TempDir, name: &str, num_rows: usize) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "id,name").unwrap();
        for i in 0..num_rows {
            writeln!(file, "{},name_{}", i, i).unwrap();
        }
        path
    }

    fn ingestor(sink: Arc<ScriptedSink>, chunk_size: usize, concurrency: usize) -> FileIngestor {
        let (telemetry_tx, mut telemetry_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move { while telemetry_rx.recv().await.is_some() {} });

        FileIngestor::new(
            sink,
            TableRef::parse("events").unwrap(),
            DelimitedConfig::csv(),
            chunk_size,
            concurrency,
            MalformedRowPolicy::SkipAndCount,
            telemetry_tx,
        )
    }

    #[tokio::test]
    async fn test_completed_file() {
        let dir = TempDir::new().unwrap();
        let path = write_csv(&dir, "data.csv", 25);
        let sink = Arc::new(ScriptedSink::ok());

        let outcome = ingestor(Arc::clone(&sink), 10, 1)
            .ingest(&path, &CancellationToken::new())
            .await;

        match outcome {
            FileOutcome::Completed {
                batches,
                rows_loaded,
                rows_skipped,
            } => {
                assert_eq!(batches, 3);
                assert_eq!(rows_loaded, 25);
                assert_eq!(rows_skipped, 0);
            }
            other => panic!("expected Completed, got {:?}", other),
        }

        let seen = sink.seen();
        assert_eq!(seen, vec![(0, 10), (1, 10), (2, 5)]);
    }

    #[tokio::test]
    async fn test_empty_file_completes_with_zero_batches() {
        let dir = TempDir::new().unwrap();
        let path = write_csv(&dir, "empty.csv", 0);
        let sink = Arc::new(ScriptedSink::ok());

        let outcome = ingestor(Arc::clone(&sink), 10, 2)
            .ingest(&path, &CancellationToken::new())
            .await;

        match outcome {
            FileOutcome::Completed {
                batches,
                rows_loaded,
                ..
            } => {
                assert_eq!(batches, 0);
                assert_eq!(rows_loaded, 0);
            }
            other => panic!("expected Completed, got {:?}", other),
        }
        assert!(sink.seen().is_empty());
    }

    #[tokio::test]
    async fn test_failed_upload_fails_file_and_keeps_earlier_rows() {
        let dir = TempDir::new().unwrap();
        let path = write_csv(&dir, "data.csv", 25);
        let sink = Arc::new(ScriptedSink::failing_on(
            1,
            IngestError::Timeout {
                timeout: UPLOAD_TIMEOUT,
            },
        ));

        // Single worker: batch 0 commits before batch 1 times out.
        let outcome = ingestor(Arc::clone(&sink), 10, 1)
            .ingest(&path, &CancellationToken::new())
            .await;

        match outcome {
            FileOutcome::Failed { cause, rows_loaded } => {
                assert_eq!(cause.cause_label(), "Timeout");
                assert_eq!(rows_loaded, 10);
            }
            other => panic!("expected Failed, got {:?}", other),
        }

        // Batch 2 was never dispatched.
        let seen = sink.seen();
        assert_eq!(seen, vec![(0, 10), (1, 10)]);
    }

    #[tokio::test]
    async fn test_reingesting_failed_file_is_at_least_once() {
        let dir = TempDir::new().unwrap();
        let path = write_csv(&dir, "data.csv", 25);

        let first = Arc::new(ScriptedSink::failing_on(
            2,
            IngestError::UploadFailed {
                detail: "constraint violation".to_string(),
            },
        ));
        let outcome = ingestor(Arc::clone(&first), 10, 1)
            .ingest(&path, &CancellationToken::new())
            .await;
        assert!(!outcome.is_completed());

        // A retry of the whole file re-uploads the batches that already
        // committed; never fewer.
        let second = Arc::new(ScriptedSink::ok());
        let outcome = ingestor(Arc::clone(&second), 10, 1)
            .ingest(&path, &CancellationToken::new())
            .await;
        assert!(outcome.is_completed());
        assert_eq!(second.seen(), vec![(0, 10), (1, 10), (2, 5)]);
    }

    #[tokio::test]
    async fn test_missing_file_fails_without_uploads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.csv");
        let sink = Arc::new(ScriptedSink::ok());

        let outcome = ingestor(Arc::clone(&sink), 10, 2)
            .ingest(&path, &CancellationToken::new())
            .await;

        match outcome {
            FileOutcome::Failed { cause, .. } => {
                assert_eq!(cause.cause_label(), "FileNotFound");
            }
            other => panic!("expected Failed, got {:?}", other),
        }
        assert!(sink.seen().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = TempDir::new().unwrap();
        let path = write_csv(&dir, "data.csv", 25);
        let sink = Arc::new(ScriptedSink::ok());

        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = ingestor(Arc::clone(&sink), 10, 1).ingest(&path, &cancel).await;
        match outcome {
            FileOutcome::Failed { cause, .. } => {
                assert_eq!(cause.cause_label(), "Cancelled");
            }
            other => panic!("expected Failed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_uploads_all_observed() {
        let dir = TempDir::new().unwrap();
        let path = write_csv(&dir, "data.csv", 100);
        let sink = Arc::new(ScriptedSink::ok());

        let outcome = ingestor(Arc::clone(&sink), 10, 4)
            .ingest(&path, &CancellationToken::new())
            .await;

        match outcome {
            FileOutcome::Completed {
                batches,
                rows_loaded,
                ..
            } => {
                assert_eq!(batches, 10);
                assert_eq!(rows_loaded, 100);
            }
            other => panic!("expected Completed, got {:?}", other),
        }

        let mut seqs: Vec<u32> = sink.seen().iter().map(|(seq, _)| *seq).collect();
        seqs.sort_unstable();
        assert_eq!(seqs, (0..10).collect::<Vec<u32>>());
    }
}
