//! The `backlog.json` document.
//!
//! ```json
//! {
//!   "config": { "batch_size": { "min": 10, "max": 256 } },
//!   "files": ["0BFD7754/", "0BFD7754/00000001/", "0BFD7754/00000001/00000001.MF4"]
//! }
//! ```
//!
//! Every key shown is mandatory. Validation happens here, before any listing.

use serde::Deserialize;

use crate::error::ConfigError;

/// Object key of the backlog document at the root of the input store.
pub const BACKLOG_KEY: &str = "backlog.json";

#[derive(Debug, Deserialize)]
struct RawBacklog {
    config: RawConfig,
    files: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    batch_size: RawBatchSize,
}

#[derive(Debug, Deserialize)]
struct RawBatchSize {
    min: i64,
    max: i64,
}

/// Validated batch size bounds, `1 <= min <= max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSize {
    pub min: usize,
    pub max: usize,
}

impl BatchSize {
    pub fn new(min: usize, max: usize) -> Result<Self, ConfigError> {
        if min == 0 {
            return Err(ConfigError::NonPositiveBatch { field: "min" });
        }
        if max == 0 {
            return Err(ConfigError::NonPositiveBatch { field: "max" });
        }
        if min > max {
            return Err(ConfigError::BatchBounds { min, max });
        }
        Ok(Self { min, max })
    }
}

/// A parsed, validated backlog.
#[derive(Debug, Clone)]
pub struct BacklogFile {
    pub batch_size: BatchSize,
    pub entries: Vec<String>,
}

impl BacklogFile {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ConfigError> {
        let raw: RawBacklog = serde_json::from_slice(bytes).map_err(|source| ConfigError::Parse {
            document: BACKLOG_KEY,
            source,
        })?;

        let to_usize = |value: i64, field: &'static str| {
            usize::try_from(value).map_err(|_| ConfigError::NonPositiveBatch { field })
        };
        let batch_size = BatchSize::new(
            to_usize(raw.config.batch_size.min, "min")?,
            to_usize(raw.config.batch_size.max, "max")?,
        )?;

        Ok(Self {
            batch_size,
            entries: raw.files,
        })
    }
}
