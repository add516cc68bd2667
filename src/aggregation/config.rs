//! The `aggregations.json` document, parsed once into validated types.
//!
//! Raw serde structs mirror the JSON shape; [`AggregationConfig::from_slice`]
//! turns them into [`AggregationConfig`], rejecting unknown aggregation
//! functions, incomplete date ranges and clusters without details before any
//! data is read.

use chrono::{Days, NaiveDate, TimeDelta};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Object key of the aggregation document at the root of the input store.
pub const AGGREGATIONS_KEY: &str = "aggregations.json";

pub const DEFAULT_TRIP_GAP_MIN: f64 = 10.0;
pub const DEFAULT_TRIP_MIN_LENGTH_MIN: f64 = 1.0;

#[derive(Debug, Deserialize)]
struct RawDocument {
    config: RawRunConfig,
    device_clusters: Vec<RawDeviceCluster>,
    cluster_details: Vec<RawClusterDetail>,
}

#[derive(Debug, Deserialize)]
struct RawRunConfig {
    date: RawDate,
    #[serde(default)]
    trip: RawTrip,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum RawDateMode {
    SpecificPeriod,
    PreviousDay,
}

#[derive(Debug, Deserialize)]
struct RawDate {
    mode: RawDateMode,
    start_date: Option<String>,
    end_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTrip {
    #[serde(default = "default_gap")]
    trip_gap_min: f64,
    #[serde(default = "default_min_length")]
    trip_min_length_min: f64,
}

impl Default for RawTrip {
    fn default() -> Self {
        Self {
            trip_gap_min: DEFAULT_TRIP_GAP_MIN,
            trip_min_length_min: DEFAULT_TRIP_MIN_LENGTH_MIN,
        }
    }
}

fn default_gap() -> f64 {
    DEFAULT_TRIP_GAP_MIN
}

fn default_min_length() -> f64 {
    DEFAULT_TRIP_MIN_LENGTH_MIN
}

#[derive(Debug, Deserialize)]
struct RawDeviceCluster {
    #[serde(default)]
    devices: Vec<String>,
    cluster: String,
}

#[derive(Debug, Deserialize)]
struct RawClusterDetail {
    clusters: Vec<String>,
    details: RawDetails,
}

#[derive(Debug, Deserialize)]
struct RawDetails {
    trip_identifier: RawTripIdentifier,
    #[serde(default)]
    aggregations: Vec<RawAggregation>,
}

#[derive(Debug, Deserialize)]
struct RawTripIdentifier {
    message: String,
}

#[derive(Debug, Deserialize)]
struct RawAggregation {
    message: String,
    signal: Vec<String>,
    aggregation: Vec<String>,
}

/// A summary function applied to the samples of one signal within one trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregationFunction {
    Min,
    Max,
    Avg,
    Median,
    Sum,
    First,
    Last,
    DeltaSum,
    DeltaSumPos,
    DeltaSumNeg,
}

impl AggregationFunction {
    pub const ALL: [AggregationFunction; 10] = [
        Self::Min,
        Self::Max,
        Self::Avg,
        Self::Median,
        Self::Sum,
        Self::First,
        Self::Last,
        Self::DeltaSum,
        Self::DeltaSumPos,
        Self::DeltaSumNeg,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Min => "min",
            Self::Max => "max",
            Self::Avg => "avg",
            Self::Median => "median",
            Self::Sum => "sum",
            Self::First => "first",
            Self::Last => "last",
            Self::DeltaSum => "delta_sum",
            Self::DeltaSumPos => "delta_sum_pos",
            Self::DeltaSumNeg => "delta_sum_neg",
        }
    }
}

impl FromStr for AggregationFunction {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or(())
    }
}

impl fmt::Display for AggregationFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl serde::Serialize for AggregationFunction {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// One aggregation instruction: every function over every signal of a message.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationRule {
    pub message: String,
    pub signals: Vec<String>,
    pub functions: Vec<AggregationFunction>,
}

/// Everything bound to a cluster name: its trip message and rules.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterProfile {
    pub name: String,
    pub trip_message: String,
    pub rules: Vec<AggregationRule>,
}

/// A `device_clusters` entry. No devices means "every unclaimed device".
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceCluster {
    pub cluster: String,
    pub devices: Vec<String>,
}

impl DeviceCluster {
    pub fn is_catch_all(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Gap and minimum length used to cut trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TripParams {
    pub gap: TimeDelta,
    pub min_length: TimeDelta,
}

impl TripParams {
    pub fn from_minutes(gap: f64, min_length: f64) -> Result<Self, ConfigError> {
        Ok(Self {
            gap: minutes("trip_gap_min", gap)?,
            min_length: minutes("trip_min_length_min", min_length)?,
        })
    }
}

impl Default for TripParams {
    fn default() -> Self {
        Self {
            gap: TimeDelta::minutes(10),
            min_length: TimeDelta::minutes(1),
        }
    }
}

fn minutes(field: &'static str, value: f64) -> Result<TimeDelta, ConfigError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::InvalidTrip { field, value });
    }
    Ok(TimeDelta::milliseconds((value * 60_000.0).round() as i64))
}

/// Which days a run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateSelection {
    PreviousDay,
    Period { start: NaiveDate, end: NaiveDate },
}

impl DateSelection {
    /// Pins the selection to concrete days, relative to `today` when needed.
    pub fn resolve(&self, today: NaiveDate) -> DateRange {
        match *self {
            DateSelection::PreviousDay => {
                let day = today.pred_opt().unwrap_or(today);
                DateRange { start: day, end: day }
            }
            DateSelection::Period { start, end } => DateRange { start, end },
        }
    }
}

/// An inclusive range of days.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + use<> {
        let end = self.end;
        std::iter::successors(Some(self.start), |d| d.checked_add_days(Days::new(1)))
            .take_while(move |d| *d <= end)
    }

    pub fn len(&self) -> usize {
        self.days().count()
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }
}

fn parse_date(field: &'static str, value: Option<String>) -> Result<NaiveDate, ConfigError> {
    let value = value.ok_or(ConfigError::MissingDate(field))?;
    NaiveDate::parse_from_str(&value, "%Y-%m-%d")
        .map_err(|_| ConfigError::InvalidDate { field, value })
}

/// A fully validated aggregation configuration. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationConfig {
    pub dates: DateSelection,
    pub trip: TripParams,
    pub device_clusters: Vec<DeviceCluster>,
    pub profiles: Vec<ClusterProfile>,
}

impl AggregationConfig {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ConfigError> {
        let raw: RawDocument = serde_json::from_slice(bytes).map_err(|source| ConfigError::Parse {
            document: AGGREGATIONS_KEY,
            source,
        })?;

        let dates = match raw.config.date.mode {
            RawDateMode::PreviousDay => DateSelection::PreviousDay,
            RawDateMode::SpecificPeriod => {
                let start = parse_date("start_date", raw.config.date.start_date)?;
                let end = parse_date("end_date", raw.config.date.end_date)?;
                if start > end {
                    return Err(ConfigError::DateOrder {
                        start: start.to_string(),
                        end: end.to_string(),
                    });
                }
                DateSelection::Period { start, end }
            }
        };

        let trip =
            TripParams::from_minutes(raw.config.trip.trip_gap_min, raw.config.trip.trip_min_length_min)?;

        // Validate every details block, referenced or not.
        let mut details: Vec<(Vec<String>, String, Vec<AggregationRule>)> = Vec::new();
        for entry in raw.cluster_details {
            let rules = entry
                .details
                .aggregations
                .into_iter()
                .map(validate_rule)
                .collect::<Result<Vec<_>, _>>()?;
            details.push((entry.clusters, entry.details.trip_identifier.message, rules));
        }

        let device_clusters: Vec<DeviceCluster> = raw
            .device_clusters
            .into_iter()
            .map(|c| DeviceCluster {
                cluster: c.cluster,
                devices: c.devices,
            })
            .collect();

        let mut profiles: Vec<ClusterProfile> = Vec::new();
        for cluster in &device_clusters {
            if profiles.iter().any(|p| p.name == cluster.cluster) {
                continue;
            }
            let (_, trip_message, rules) = details
                .iter()
                .find(|(names, _, _)| names.contains(&cluster.cluster))
                .ok_or_else(|| ConfigError::MissingClusterDetails(cluster.cluster.clone()))?;
            if trip_message.trim().is_empty() {
                return Err(ConfigError::MissingTripIdentifier(cluster.cluster.clone()));
            }
            profiles.push(ClusterProfile {
                name: cluster.cluster.clone(),
                trip_message: trip_message.clone(),
                rules: rules.clone(),
            });
        }

        Ok(Self {
            dates,
            trip,
            device_clusters,
            profiles,
        })
    }

    pub fn profile(&self, cluster: &str) -> Option<&ClusterProfile> {
        self.profiles.iter().find(|p| p.name == cluster)
    }
}

fn validate_rule(raw: RawAggregation) -> Result<AggregationRule, ConfigError> {
    if raw.signal.is_empty() {
        return Err(ConfigError::NoSignals(raw.message));
    }
    if raw.aggregation.is_empty() {
        return Err(ConfigError::NoFunctions(raw.message));
    }
    let functions = raw
        .aggregation
        .iter()
        .map(|name| {
            name.parse::<AggregationFunction>()
                .map_err(|_| ConfigError::UnknownFunction {
                    name: name.clone(),
                    message: raw.message.clone(),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(AggregationRule {
        message: raw.message,
        signals: raw.signal,
        functions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "config": {
            "date": { "mode": "specific_period", "start_date": "2024-01-01", "end_date": "2024-01-03" },
            "trip": { "trip_gap_min": 10, "trip_min_length_min": 1.5 }
        },
        "device_clusters": [
            { "devices": ["0BFD7754", "2F6913DB"], "cluster": "trucks" },
            { "devices": [], "cluster": "default" }
        ],
        "cluster_details": [
            { "clusters": ["trucks", "default"], "details": {
                "trip_identifier": { "message": "CAN9_GnssSpeed" },
                "aggregations": [
                    { "message": "CAN9_GnssSpeed", "signal": ["Speed"], "aggregation": ["avg", "max", "delta_sum_pos"] }
                ]
            } }
        ]
    }"#;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_parses_sample_document() {
        let config = AggregationConfig::from_slice(SAMPLE.as_bytes()).unwrap();

        assert_eq!(
            config.dates,
            DateSelection::Period {
                start: date("2024-01-01"),
                end: date("2024-01-03")
            }
        );
        assert_eq!(config.trip.gap, TimeDelta::minutes(10));
        assert_eq!(config.trip.min_length, TimeDelta::seconds(90));
        assert_eq!(config.profiles.len(), 2);

        let trucks = config.profile("trucks").unwrap();
        assert_eq!(trucks.trip_message, "CAN9_GnssSpeed");
        assert_eq!(
            trucks.rules[0].functions,
            vec![
                AggregationFunction::Avg,
                AggregationFunction::Max,
                AggregationFunction::DeltaSumPos
            ]
        );
        assert!(config.device_clusters[1].is_catch_all());
    }

    #[test]
    fn test_unknown_function_fails_fast() {
        let doc = SAMPLE.replace("\"delta_sum_pos\"", "\"p95\"");
        let err = AggregationConfig::from_slice(doc.as_bytes()).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownFunction { ref name, .. } if name == "p95"));
    }

    #[test]
    fn test_specific_period_requires_dates() {
        let doc = SAMPLE.replace(r#", "end_date": "2024-01-03""#, "");
        let err = AggregationConfig::from_slice(doc.as_bytes()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingDate("end_date")));
    }

    #[test]
    fn test_invalid_and_reversed_dates() {
        let doc = SAMPLE.replace("2024-01-03", "03/01/2024");
        assert!(matches!(
            AggregationConfig::from_slice(doc.as_bytes()),
            Err(ConfigError::InvalidDate { field: "end_date", .. })
        ));

        let doc = SAMPLE.replace("2024-01-03", "2023-12-31");
        assert!(matches!(
            AggregationConfig::from_slice(doc.as_bytes()),
            Err(ConfigError::DateOrder { .. })
        ));
    }

    #[test]
    fn test_previous_day_needs_no_dates() {
        let doc = SAMPLE.replace(
            r#"{ "mode": "specific_period", "start_date": "2024-01-01", "end_date": "2024-01-03" }"#,
            r#"{ "mode": "previous_day" }"#,
        );
        let config = AggregationConfig::from_slice(doc.as_bytes()).unwrap();

        let range = config.dates.resolve(date("2024-03-01"));
        assert_eq!(range.start, date("2024-02-29"));
        assert_eq!(range.end, date("2024-02-29"));
    }

    #[test]
    fn test_unknown_date_mode() {
        let doc = SAMPLE.replace("specific_period", "last_week");
        assert!(matches!(
            AggregationConfig::from_slice(doc.as_bytes()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_trip_defaults_when_block_missing() {
        let doc = SAMPLE.replace(r#""trip": { "trip_gap_min": 10, "trip_min_length_min": 1.5 }"#, r#""trip": {}"#);
        let config = AggregationConfig::from_slice(doc.as_bytes()).unwrap();
        assert_eq!(config.trip, TripParams::default());
    }

    #[test]
    fn test_negative_trip_length_rejected() {
        let doc = SAMPLE.replace("1.5", "-1");
        assert!(matches!(
            AggregationConfig::from_slice(doc.as_bytes()),
            Err(ConfigError::InvalidTrip {
                field: "trip_min_length_min",
                ..
            })
        ));
    }

    #[test]
    fn test_cluster_without_details() {
        let doc = SAMPLE.replace(r#""cluster": "trucks""#, r#""cluster": "vans""#);
        let err = AggregationConfig::from_slice(doc.as_bytes()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingClusterDetails(ref c) if c == "vans"));
    }

    #[test]
    fn test_date_range_days() {
        let range = DateRange {
            start: date("2024-02-28"),
            end: date("2024-03-01"),
        };
        let days: Vec<_> = range.days().collect();
        assert_eq!(days, vec![date("2024-02-28"), date("2024-02-29"), date("2024-03-01")]);
        assert_eq!(range.len(), 3);
    }

    #[test]
    fn test_function_names_round_trip_through_from_str() {
        for f in AggregationFunction::ALL {
            assert_eq!(f.as_str().parse::<AggregationFunction>(), Ok(f));
        }
        assert!("count".parse::<AggregationFunction>().is_err());
    }
}
