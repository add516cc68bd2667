//! Trip aggregation engine: clusters, trips and per-trip signal summaries.

pub mod aggregate;
pub mod analyzer;
pub mod cluster;
pub mod config;
pub mod output;
pub mod trip;
pub mod types;
pub mod utility;

pub use aggregate::SignalAggregator;
pub use analyzer::{Aggregator, load_config};
pub use cluster::ClusterResolver;
pub use config::{AggregationConfig, AggregationFunction, DateRange, DateSelection, TripParams};
pub use output::SummaryFormat;
pub use trip::TripSegmenter;
pub use types::{AggregationRecord, RunReport, SkippedDevice, TripWindow};
