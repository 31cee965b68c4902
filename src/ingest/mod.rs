//! Ingestion pipeline: per-batch uploads, per-file ingestion, run coordination

pub mod coordinator;
pub mod file_ingestor;
pub mod uploader;

pub use coordinator::{Coordinator, IngestConfig, IngestConfigBuilder};
pub use file_ingestor::FileIngestor;
pub use uploader::{BatchReceipt, BatchSink, UploadOutcome, WarehouseSink};
