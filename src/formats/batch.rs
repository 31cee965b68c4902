use std::sync::Arc;

use anyhow::Result;

/// A single record (row) from a source file; column order follows the file.
#[derive(Debug, Clone)]
pub struct Record {
    pub fields: Vec<String>,
}

/// A bounded slice of rows from one file, the unit of one upload call.
#[derive(Debug, Clone)]
pub struct RowBatch {
    /// Index of this batch within its file, starting at 0.
    pub seq: u32,
    /// Header names shared by every batch of the file; `None` for headerless input.
    pub columns: Option<Arc<Vec<String>>>,
    pub rows: Vec<Record>,
    /// Rows dropped by the skip-and-count policy while this batch was assembled.
    pub malformed_skipped: u64,
}

/// Configuration for delimited file reading (CSV, TSV, etc.)
#[derive(Debug, Clone)]
pub struct DelimitedConfig {
    pub delimiter: u8,
    pub has_header: bool,
    pub quote: u8,
}

impl Default for DelimitedConfig {
    fn default() -> Self {
        Self {
            delimiter: b',',
            has_header: true,
            quote: b'"',
        }
    }
}

impl DelimitedConfig {
    pub fn csv() -> Self {
        Self::default()
    }

    pub fn tsv() -> Self {
        Self {
            delimiter: b'\t',
            has_header: true,
            quote: b'"',
        }
    }

    /// Build from CLI string flags (single characters, or `\t` for tab).
    pub fn from_flags(delimiter: &str, quote: &str, has_header: bool) -> Result<Self> {
        let delimiter_byte = if delimiter == "\\t" {
            b'\t'
        } else if delimiter.len() == 1 {
            delimiter.as_bytes()[0]
        } else {
            anyhow::bail!("Delimiter must be a single character or \\t");
        };

        let quote_byte = if quote.len() == 1 {
            quote.as_bytes()[0]
        } else {
            anyhow::bail!("Quote must be a single character");
        };

        Ok(Self {
            delimiter: delimiter_byte,
            has_header,
            quote: quote_byte,
        })
    }
}

/// What to do with a row that fails to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedRowPolicy {
    /// Drop the row, count it, keep reading.
    SkipAndCount,
    /// The first malformed row fails the file.
    FailFile,
}

impl MalformedRowPolicy {
    /// Parse from CLI string (case-insensitive): `skip` or `fail`.
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "skip" => Ok(MalformedRowPolicy::SkipAndCount),
            "fail" => Ok(MalformedRowPolicy::FailFile),
            _ => Err(anyhow::anyhow!(
                "Unsupported malformed-row policy: {}. Supported policies: skip, fail",
                s
            )),
        }
    }
}
