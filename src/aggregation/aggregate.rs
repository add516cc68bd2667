//! Per-trip signal summaries.

use chrono::{DateTime, Utc};
use tracing::debug;

use super::config::{AggregationFunction, AggregationRule, ClusterProfile};
use super::types::{AggregationRecord, TripWindow};
use super::utility::{deltas, mean, median};
use crate::frame::Frame;

impl AggregationFunction {
    /// Applies the function to chronologically ordered samples.
    ///
    /// `None` only for empty input. Delta functions over a single sample are `0`.
    pub fn apply(&self, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        let value = match self {
            Self::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            Self::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Self::Avg => mean(values)?,
            Self::Median => median(values)?,
            Self::Sum => values.iter().sum(),
            Self::First => values[0],
            Self::Last => values[values.len() - 1],
            Self::DeltaSum => deltas(values).sum(),
            Self::DeltaSumPos => deltas(values).filter(|d| *d > 0.0).sum(),
            Self::DeltaSumNeg => deltas(values).filter(|d| *d < 0.0).sum(),
        };
        Some(value)
    }
}

/// Computes a cluster's rules over the frames of one trip.
pub struct SignalAggregator<'a> {
    profile: &'a ClusterProfile,
}

impl<'a> SignalAggregator<'a> {
    pub fn new(profile: &'a ClusterProfile) -> Self {
        Self { profile }
    }

    /// One record per (signal, function) with at least one sample in the trip.
    /// `frame` holds the rule's message and must be sorted by time.
    pub fn aggregate(
        &self,
        trip: &TripWindow,
        rule: &AggregationRule,
        frame: &Frame,
    ) -> Vec<AggregationRecord> {
        let trip_id = trip.trip_id();
        let mut records = Vec::new();

        for signal in &rule.signals {
            let samples = frame.samples(signal, trip.start, trip.end);
            if samples.is_empty() {
                debug!(
                    trip_id = %trip_id,
                    message_name = %rule.message,
                    signal = %signal,
                    "No samples in trip"
                );
                continue;
            }
            let values: Vec<f64> = samples.iter().map(|(_, v)| *v).collect();
            let duration_s = span_seconds(samples[0].0, samples[samples.len() - 1].0);

            for function in &rule.functions {
                let Some(value) = function.apply(&values) else {
                    continue;
                };
                records.push(AggregationRecord {
                    device_id: trip.device_id.clone(),
                    message: rule.message.clone(),
                    signal: signal.clone(),
                    aggregation: function.to_string(),
                    value,
                    count: values.len(),
                    duration_s,
                    trip_start: trip.start,
                    trip_end: trip.end,
                    trip_id: trip_id.clone(),
                    cluster: self.profile.name.clone(),
                });
            }
        }
        records
    }
}

fn span_seconds(first: DateTime<Utc>, last: DateTime<Utc>) -> f64 {
    (last - first).num_microseconds().unwrap_or(i64::MAX) as f64 / 1_000_000.0
}
