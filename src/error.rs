//! Error types shared by the backlog and aggregation engines.
//!
//! Configuration and resolution failures are fatal for a run and are raised
//! before any file is touched. Per-device problems are not errors at all:
//! they are reported through [`SkipReason`] and the run carries on with
//! the remaining devices.

use std::fmt;

/// A malformed or incomplete backlog / aggregation document.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {document}: {source}")]
    Parse {
        document: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("{document} not found at `{key}`")]
    Missing { document: &'static str, key: String },

    #[error("batch_size.{field} must be a positive integer")]
    NonPositiveBatch { field: &'static str },

    #[error("batch_size.min ({min}) must not exceed batch_size.max ({max})")]
    BatchBounds { min: usize, max: usize },

    #[error("unknown aggregation function `{name}` for message `{message}`")]
    UnknownFunction { name: String, message: String },

    #[error("aggregation for message `{0}` lists no signals")]
    NoSignals(String),

    #[error("aggregation for message `{0}` lists no functions")]
    NoFunctions(String),

    #[error("date.{0} is required when mode is `specific_period`")]
    MissingDate(&'static str),

    #[error("date.{field} `{value}` is not a YYYY-MM-DD date")]
    InvalidDate { field: &'static str, value: String },

    #[error("date.start_date {start} is after date.end_date {end}")]
    DateOrder { start: String, end: String },

    #[error("trip.{field} must be a finite, non-negative number of minutes (got {value})")]
    InvalidTrip { field: &'static str, value: f64 },

    #[error("cluster `{0}` has no entry in cluster_details")]
    MissingClusterDetails(String),

    #[error("cluster `{0}` has an empty trip_identifier.message")]
    MissingTripIdentifier(String),
}

/// A backlog entry that could not be turned into concrete files.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("backlog entry `{entry}` is not a device prefix, session prefix or file path")]
    Unrecognized { entry: String },

    #[error("listing `{prefix}` failed")]
    Listing {
        prefix: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Why a device produced no output in an aggregation run, or on one day of it.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Not listed in any `device_clusters` entry and no catch-all is configured.
    NoCluster,
    /// Reading, decoding or aggregating the device's data for `day` failed.
    Failed { day: chrono::NaiveDate, error: String },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoCluster => write!(f, "no matching cluster and no catch-all cluster"),
            SkipReason::Failed { day, error } => write!(f, "failed on {day}: {error}"),
        }
    }
}
