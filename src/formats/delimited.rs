use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use super::batch::{DelimitedConfig, MalformedRowPolicy, Record, RowBatch};
use crate::config::READ_AHEAD_BATCHES;
use crate::error::IngestError;

/// Lazy, non-restartable stream of bounded row batches from one delimited file.
///
/// A blocking reader task owns the file handle and feeds a bounded channel of
/// finished batches; the channel capacity is the read-ahead window. Dropping
/// the `ChunkReader` closes the channel, which stops the task and releases
/// the handle, so the file is closed on every exit path — exhaustion, error,
/// and early abandonment alike.
pub struct ChunkReader {
    rx: mpsc::Receiver<Result<RowBatch, IngestError>>,
}

impl ChunkReader {
    /// Open `path` and start reading batches of at most `chunk_size` rows.
    ///
    /// Open failures are fatal to this file only: a missing file maps to
    /// `FileNotFound`, anything else (permissions, corruption) to
    /// `FileUnreadable`.
    pub fn open(
        path: &Path,
        config: DelimitedConfig,
        chunk_size: usize,
        policy: MalformedRowPolicy,
    ) -> Result<Self, IngestError> {
        let file = File::open(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => IngestError::FileNotFound {
                path: path.to_path_buf(),
            },
            _ => IngestError::FileUnreadable {
                path: path.to_path_buf(),
                detail: e.to_string(),
            },
        })?;

        let (tx, rx) = mpsc::channel(READ_AHEAD_BATCHES);
        let path = path.to_path_buf();
        let chunk_size = chunk_size.max(1);

        tokio::task::spawn_blocking(move || {
            read_batches(file, path, config, chunk_size, policy, tx)
        });

        Ok(Self { rx })
    }

    /// Next batch in file order; `None` once the file is exhausted.
    pub async fn next_batch(&mut self) -> Option<Result<RowBatch, IngestError>> {
        self.rx.recv().await
    }
}

/// Blocking reader loop. Runs on the blocking pool until the file is
/// exhausted, a fatal error is hit, or the consumer goes away.
fn read_batches(
    file: File,
    path: PathBuf,
    config: DelimitedConfig,
    chunk_size: usize,
    policy: MalformedRowPolicy,
    tx: mpsc::Sender<Result<RowBatch, IngestError>>,
) {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(config.delimiter)
        .quote(config.quote)
        .has_headers(config.has_header)
        .from_reader(file);

    // The header is consumed once and shared by every batch of the file; it
    // never counts toward row totals.
    let columns = if config.has_header {
        match reader.headers() {
            Ok(headers) => Some(Arc::new(
                headers.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            )),
            Err(e) => {
                let _ = tx.blocking_send(Err(IngestError::FileUnreadable {
                    path,
                    detail: format!("failed to read header: {}", e),
                }));
                return;
            }
        }
    } else {
        None
    };

    let mut seq = 0u32;
    let mut rows: Vec<Record> = Vec::with_capacity(chunk_size);
    let mut malformed_skipped = 0u64;

    for result in reader.into_records() {
        match result {
            Ok(record) => {
                rows.push(Record {
                    fields: record.iter().map(|s| s.to_string()).collect(),
                });

                if rows.len() == chunk_size {
                    let batch = RowBatch {
                        seq,
                        columns: columns.clone(),
                        rows: std::mem::replace(&mut rows, Vec::with_capacity(chunk_size)),
                        malformed_skipped,
                    };
                    malformed_skipped = 0;
                    seq += 1;

                    if tx.blocking_send(Ok(batch)).is_err() {
                        // Consumer dropped the reader; stop and release the file.
                        return;
                    }
                }
            }
            Err(e) => {
                let line = e.position().map(|p| p.line()).unwrap_or(0);
                match classify_record_error(&path, e, policy) {
                    RecordError::Skip { detail } => {
                        debug!(file = %path.display(), line, %detail, "skipping malformed row");
                        malformed_skipped += 1;
                    }
                    RecordError::Fatal(err) => {
                        let _ = tx.blocking_send(Err(err));
                        return;
                    }
                }
            }
        }
    }

    // Final short batch; also carries trailing skip counts when the file
    // ends in malformed rows.
    if !rows.is_empty() || malformed_skipped > 0 {
        let _ = tx.blocking_send(Ok(RowBatch {
            seq,
            columns,
            rows,
            malformed_skipped,
        }));
    }
}

enum RecordError {
    Skip { detail: String },
    Fatal(IngestError),
}

/// Row-level parse problems (wrong field count) follow the configured
/// policy; a broken byte stream (I/O, invalid UTF-8) is always fatal.
fn classify_record_error(path: &Path, err: csv::Error, policy: MalformedRowPolicy) -> RecordError {
    let line = err.position().map(|p| p.line()).unwrap_or(0);

    match err.kind() {
        csv::ErrorKind::Io(_) | csv::ErrorKind::Utf8 { .. } => {
            RecordError::Fatal(IngestError::FileUnreadable {
                path: path.to_path_buf(),
                detail: err.to_string(),
            })
        }
        _ => match policy {
            MalformedRowPolicy::SkipAndCount => RecordError::Skip {
                detail: err.to_string(),
            },
            MalformedRowPolicy::FailFile => RecordError::Fatal(IngestError::MalformedRow {
                line,
                detail: err.to_string(),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(content).unwrap();
        path
    }

    fn csv_with_rows(num_rows: usize) -> String {
        let mut content = String::from("id,name,amount\n");
        for i in 0..num_rows {
            content.push_str(&format!("{},name_{},{}\n", i, i, i * 10));
        }
        content
    }

    async fn collect_batches(
        path: &Path,
        chunk_size: usize,
        policy: MalformedRowPolicy,
    ) -> Vec<Result<RowBatch, IngestError>> {
        let mut reader =
            ChunkReader::open(path, DelimitedConfig::csv(), chunk_size, policy).unwrap();
        let mut batches = Vec::new();
        while let Some(batch) = reader.next_batch().await {
            batches.push(batch);
        }
        batches
    }

    #[tokio::test]
    async fn test_batch_count_and_sizes() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "data.csv", csv_with_rows(25_000).as_bytes());

        let batches = collect_batches(&path, 10_000, MalformedRowPolicy::SkipAndCount).await;
        let batches: Vec<RowBatch> = batches.into_iter().map(|b| b.unwrap()).collect();

        let sizes: Vec<usize> = batches.iter().map(|b| b.rows.len()).collect();
        assert_eq!(sizes, vec![10_000, 10_000, 5_000]);
        assert!(batches.iter().all(|b| b.rows.len() <= 10_000));

        let seqs: Vec<u32> = batches.iter().map(|b| b.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_row_order_preserved_within_file() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "data.csv", csv_with_rows(25).as_bytes());

        let batches = collect_batches(&path, 10, MalformedRowPolicy::SkipAndCount).await;
        let rows: Vec<String> = batches
            .into_iter()
            .flat_map(|b| b.unwrap().rows)
            .map(|r| r.fields[0].clone())
            .collect();

        let expected: Vec<String> = (0..25).map(|i| i.to_string()).collect();
        assert_eq!(rows, expected);
    }

    #[tokio::test]
    async fn test_header_shared_and_excluded_from_rows() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "data.csv", csv_with_rows(5).as_bytes());

        let batches = collect_batches(&path, 10, MalformedRowPolicy::SkipAndCount).await;
        let batch = batches.into_iter().next().unwrap().unwrap();

        assert_eq!(
            batch.columns.as_deref(),
            Some(&vec![
                "id".to_string(),
                "name".to_string(),
                "amount".to_string()
            ])
        );
        assert_eq!(batch.rows.len(), 5);
        assert_eq!(batch.rows[0].fields, vec!["0", "name_0", "0"]);
    }

    #[tokio::test]
    async fn test_headerless_input() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "data.csv", b"1,a\n2,b\n");

        let config = DelimitedConfig {
            has_header: false,
            ..DelimitedConfig::csv()
        };
        let mut reader =
            ChunkReader::open(&path, config, 10, MalformedRowPolicy::SkipAndCount).unwrap();

        let batch = reader.next_batch().await.unwrap().unwrap();
        assert!(batch.columns.is_none());
        assert_eq!(batch.rows.len(), 2);
        assert!(reader.next_batch().await.is_none());
    }

    #[tokio::test]
    async fn test_empty_file_yields_no_batches() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "empty.csv", b"");

        let batches = collect_batches(&path, 10, MalformedRowPolicy::SkipAndCount).await;
        assert!(batches.is_empty());
    }

    #[tokio::test]
    async fn test_header_only_file_yields_no_batches() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "header.csv", b"id,name,amount\n");

        let batches = collect_batches(&path, 10, MalformedRowPolicy::SkipAndCount).await;
        assert!(batches.is_empty());
    }

    #[tokio::test]
    async fn test_missing_file_is_file_not_found() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nope.csv");

        let err = ChunkReader::open(
            &path,
            DelimitedConfig::csv(),
            10,
            MalformedRowPolicy::SkipAndCount,
        )
        .err()
        .unwrap();
        assert!(matches!(err, IngestError::FileNotFound { .. }));
    }

    #[tokio::test]
    async fn test_malformed_rows_skipped_and_counted() {
        let dir = TempDir::new().unwrap();
        // Rows 2 and 4 have the wrong field count.
        let path = write_file(
            &dir,
            "data.csv",
            b"id,name\n1,a\n2,b,extra\n3,c\n4\n5,e\n",
        );

        let batches = collect_batches(&path, 100, MalformedRowPolicy::SkipAndCount).await;
        let batch = batches.into_iter().next().unwrap().unwrap();

        assert_eq!(batch.rows.len(), 3);
        assert_eq!(batch.malformed_skipped, 2);
    }

    #[tokio::test]
    async fn test_malformed_row_fails_file_under_fail_policy() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "data.csv", b"id,name\n1,a\n2,b,extra\n3,c\n");

        let batches = collect_batches(&path, 100, MalformedRowPolicy::FailFile).await;
        let err = batches.into_iter().next().unwrap().err().unwrap();
        assert!(matches!(err, IngestError::MalformedRow { .. }));
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "data.csv", b"id,name\n1,a\n2,\xff\xfe\n3,c\n");

        let batches = collect_batches(&path, 100, MalformedRowPolicy::SkipAndCount).await;
        assert!(batches.iter().any(|b| matches!(
            b,
            Err(IngestError::FileUnreadable { .. })
        )));
    }

    #[tokio::test]
    async fn test_trailing_malformed_rows_still_counted() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "data.csv", b"id,name\n1,a\n2,b,extra\n");

        let batches = collect_batches(&path, 1, MalformedRowPolicy::SkipAndCount).await;
        let batches: Vec<RowBatch> = batches.into_iter().map(|b| b.unwrap()).collect();

        let total_rows: usize = batches.iter().map(|b| b.rows.len()).sum();
        let total_skipped: u64 = batches.iter().map(|b| b.malformed_skipped).sum();
        assert_eq!(total_rows, 1);
        assert_eq!(total_skipped, 1);
    }

    #[tokio::test]
    async fn test_abandoning_reader_stops_cleanly() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "data.csv", csv_with_rows(1_000).as_bytes());

        let mut reader = ChunkReader::open(
            &path,
            DelimitedConfig::csv(),
            10,
            MalformedRowPolicy::SkipAndCount,
        )
        .unwrap();

        // Take one batch, then abandon the rest mid-file.
        let first = reader.next_batch().await.unwrap().unwrap();
        assert_eq!(first.seq, 0);
        drop(reader);
    }
}
