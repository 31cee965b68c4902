//! Configuration constants for the loader
//!
//! This module centralizes the tunable timeouts and defaults used throughout
//! the application. Per-run settings live in `ingest::IngestConfig`.

use std::time::Duration;

// ============================================================================
// Connection Pool Configuration
// ============================================================================

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub const PING_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Upload Configuration
// ============================================================================

/// Timeout for a single batch INSERT
///
/// Multi-row inserts against a loaded warehouse can take a while when the
/// table carries indexes or constraints. Expiry marks the batch (and with it
/// the whole file) as failed with cause `Timeout`; the run continues with
/// the remaining files.
pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// Default number of rows per upload batch
pub const DEFAULT_CHUNK_SIZE: usize = 10_000;

// ============================================================================
// I/O Configuration
// ============================================================================

/// Batches buffered between the reader task and the uploaders
///
/// This is the read-ahead window: the reader may run at most this many
/// finished batches ahead of the slowest uploader, which caps per-file
/// memory at roughly `chunk_size * (READ_AHEAD_BATCHES + upload_concurrency)`
/// rows.
pub const READ_AHEAD_BATCHES: usize = 2;
