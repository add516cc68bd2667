//! Data types produced by the aggregation pipeline.

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SkipReason;

/// A contiguous period of device activity, `[start, end)` for sample selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TripWindow {
    pub device_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TripWindow {
    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    /// `<device>_<YYYYmmddTHHMMSS.ffffff>` of the trip start.
    pub fn trip_id(&self) -> String {
        format!("{}_{}", self.device_id, self.start.format("%Y%m%dT%H%M%S%.6f"))
    }
}

/// One computed summary value; a row of the trip summary table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationRecord {
    pub device_id: String,
    pub message: String,
    pub signal: String,
    pub aggregation: String,
    pub value: f64,
    /// Samples that contributed to `value`.
    pub count: usize,
    /// Seconds between the first and last contributing sample.
    pub duration_s: f64,
    pub trip_start: DateTime<Utc>,
    pub trip_end: DateTime<Utc>,
    pub trip_id: String,
    pub cluster: String,
}

/// A device left out of a run, and why.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedDevice {
    pub device_id: String,
    pub reason: SkipReason,
}

/// Summary of an aggregation run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub days: usize,
    pub days_with_data: usize,
    pub devices: usize,
    pub records_written: usize,
    pub outputs: Vec<String>,
    pub skipped: Vec<SkippedDevice>,
}
