//! High-level runner API for the warehouse loader.
//!
//! This module provides a simplified public interface that encapsulates the
//! internal setup of connection pools, readers, and the coordinator.
//!
//! This is the primary API for external users and for the CLI.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::db::pool::PoolArgsBuilder;
use crate::db::{self, TableRef};
use crate::discover;
use crate::ingest::{Coordinator, IngestConfigBuilder, WarehouseSink};

pub use crate::db::WarehouseConfig;
pub use crate::formats::{DelimitedConfig, MalformedRowPolicy};
pub use crate::report::RunReport;

/// Arguments for running a data load operation
#[derive(Debug, Clone)]
pub struct LoadArgs {
    // Connection configuration
    pub warehouse: WarehouseConfig,

    // Source configuration
    pub source_dir: PathBuf,
    pub extension: String,
    pub target_table: String,
    pub delimited: DelimitedConfig,

    // Performance tuning
    pub chunk_size: usize,
    pub upload_concurrency: usize,
    pub file_concurrency: usize,

    // Options
    pub policy: MalformedRowPolicy,
    pub quiet: bool,

    // Test-only: inject a pre-created pool (for SQLite testing)
    #[cfg(test)]
    pub test_pool: Option<crate::db::Pool>,
}

/// Run a data load operation with the specified arguments.
///
/// This is the main entry point. It opens the connection pool once before
/// the first file, discovers the source files, runs the coordinator over all
/// of them, and returns the aggregated report. The pool is released when
/// this future completes — on success, error, and cancellation alike.
///
/// # Example
///
/// ```no_run
/// use warehouse_loader::runner::{
///     DelimitedConfig, LoadArgs, MalformedRowPolicy, WarehouseConfig, run_load,
/// };
///
/// # async fn example() -> anyhow::Result<()> {
/// let args = LoadArgs {
///     warehouse: WarehouseConfig::from_env()?,
///     source_dir: "/data/exports".into(),
///     extension: "csv".to_string(),
///     target_table: "analytics.public.events".to_string(),
///     delimited: DelimitedConfig::csv(),
///     chunk_size: 10_000,
///     upload_concurrency: 4,
///     file_concurrency: 2,
///     policy: MalformedRowPolicy::SkipAndCount,
///     quiet: true,
/// };
///
/// let report = run_load(args).await?;
/// println!("{}", report.summary_line());
/// # Ok(())
/// # }
/// ```
pub async fn run_load(args: LoadArgs) -> Result<RunReport> {
    run_load_with_cancel(args, CancellationToken::new()).await
}

/// `run_load` with an externally-owned cancellation token.
///
/// Cancelling stops dispatch of new files and batches immediately; uploads
/// already in flight finish or time out, and a best-effort partial report is
/// returned.
pub async fn run_load_with_cancel(args: LoadArgs, cancel: CancellationToken) -> Result<RunReport> {
    let table = TableRef::parse(&args.target_table)?;

    let files = discover::files_with_extension(&args.source_dir, &args.extension)?;
    if files.is_empty() {
        tracing::warn!(
            dir = %args.source_dir.display(),
            extension = args.extension,
            "no matching files found"
        );
    }

    // Size the pool to the peak number of concurrent batch uploads.
    let pool_size = (args.upload_concurrency.max(1) * args.file_concurrency.max(1)) as u32;

    #[cfg(test)]
    let pool = if let Some(test_pool) = args.test_pool {
        test_pool
    } else {
        db::pool::pool(
            PoolArgsBuilder::default()
                .config(args.warehouse.clone())
                .max_pool_size(pool_size)
                .build()?,
        )
        .await?
    };

    #[cfg(not(test))]
    let pool = db::pool::pool(
        PoolArgsBuilder::default()
            .config(args.warehouse.clone())
            .max_pool_size(pool_size)
            .build()?,
    )
    .await?;

    let sink = Arc::new(WarehouseSink::new(pool));

    let config = IngestConfigBuilder::default()
        .table(table)
        .delimited(args.delimited.clone())
        .chunk_size(args.chunk_size)
        .upload_concurrency(args.upload_concurrency)
        .file_concurrency(args.file_concurrency)
        .policy(args.policy)
        .quiet(args.quiet)
        .build()?;

    let coordinator = Coordinator::new(sink, config);
    Ok(coordinator.run(files, cancel).await)
}
