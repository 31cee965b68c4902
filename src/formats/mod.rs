//! Delimited file parsing and batching

pub mod batch;
pub mod delimited;

pub use batch::{DelimitedConfig, MalformedRowPolicy, Record, RowBatch};
pub use delimited::ChunkReader;
