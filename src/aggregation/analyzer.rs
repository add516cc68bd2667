//! Drives an aggregation run over the data lake, one day at a time.

use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{Instrument, debug, info, warn};

use super::aggregate::SignalAggregator;
use super::cluster::ClusterResolver;
use super::config::{AGGREGATIONS_KEY, AggregationConfig, ClusterProfile, DateRange, TripParams};
use super::output::{SummaryFormat, output_key};
use super::trip::TripSegmenter;
use super::types::{AggregationRecord, RunReport, SkippedDevice};
use crate::calculators::SignalCalculator;
use crate::error::{ConfigError, SkipReason};
use crate::frame::{self, Frame};
use crate::storage::ObjectStore;

/// Reads and validates the aggregation document stored under `key`.
pub async fn load_config(store: &dyn ObjectStore, key: &str) -> Result<AggregationConfig> {
    let body = store.get(key).await?.ok_or_else(|| ConfigError::Missing {
        document: AGGREGATIONS_KEY,
        key: key.to_string(),
    })?;

    let config = AggregationConfig::from_slice(&body)?;
    info!(
        clusters = config.profiles.len(),
        device_clusters = config.device_clusters.len(),
        "Aggregation config loaded"
    );
    Ok(config)
}

/// True for 8 upper-case hex characters, the shape of a logger serial.
pub fn is_device_id(name: &str) -> bool {
    name.len() == 8 && name.bytes().all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b))
}

/// Devices a run covers: the configured ones in config order, then any other
/// device-like root prefix of the lake in sorted order.
pub async fn discover_devices(lake: &dyn ObjectStore, resolver: &ClusterResolver<'_>) -> Result<Vec<String>> {
    let mut devices = resolver.explicit_devices();
    let explicit = devices.len();

    for name in lake.list_dirs("").await.context("failed to list devices")? {
        if is_device_id(&name) && !devices.contains(&name) {
            devices.push(name);
        }
    }
    debug!(explicit, discovered = devices.len() - explicit, "Devices discovered");
    Ok(devices)
}

/// `<device>/<message>/<YYYY>/<MM>/<DD>/`
pub fn day_prefix(device_id: &str, message: &str, day: NaiveDate) -> String {
    format!("{}/{}/{}/", device_id, message, day.format("%Y/%m/%d"))
}

/// Loads every frame of a device/message/day, concatenated and sorted by time.
/// `None` when the day has no frames.
pub async fn load_frame(
    lake: &dyn ObjectStore,
    device_id: &str,
    message: &str,
    day: NaiveDate,
) -> Result<Option<Frame>> {
    let prefix = day_prefix(device_id, message, day);
    let keys: Vec<String> = lake
        .list(&prefix)
        .await?
        .into_iter()
        .filter(|k| frame::is_frame_key(k))
        .collect();
    if keys.is_empty() {
        return Ok(None);
    }

    let mut frames = Vec::with_capacity(keys.len());
    for key in &keys {
        // Deleted between list and get.
        let Some(body) = lake.get(key).await? else {
            continue;
        };
        frames.push(frame::decode(key, body)?);
    }

    let mut frame = Frame::concat(frames);
    frame.sort_by_time();
    Ok(Some(frame))
}

/// Segments one device-day into trips and aggregates every rule over them.
///
/// Records come out trip by trip, then in rule, signal and function order.
pub async fn aggregate_device_day(
    lake: &dyn ObjectStore,
    profile: &ClusterProfile,
    params: TripParams,
    calculators: &[Arc<dyn SignalCalculator>],
    device_id: &str,
    day: NaiveDate,
) -> Result<Vec<AggregationRecord>> {
    let Some(trip_frame) = load_frame(lake, device_id, &profile.trip_message, day).await? else {
        debug!(trip_message = %profile.trip_message, "No trip identifier data");
        return Ok(Vec::new());
    };

    let trips = TripSegmenter::new(params).segment(device_id, trip_frame.timestamps().iter().copied());
    if trips.is_empty() {
        debug!(samples = trip_frame.len(), "No qualifying trips");
        return Ok(Vec::new());
    }
    debug!(trips = trips.len(), "Trips segmented");

    let mut frames: HashMap<&str, Option<Frame>> = HashMap::new();
    for rule in &profile.rules {
        let message = rule.message.as_str();
        if frames.contains_key(message) {
            continue;
        }
        let mut frame = load_frame(lake, device_id, message, day).await?;
        match frame.as_mut() {
            Some(frame) => {
                for calculator in calculators {
                    calculator.apply(device_id, message, frame).with_context(|| {
                        format!("calculator `{}` failed on {device_id}/{message}", calculator.name())
                    })?;
                }
            }
            None => debug!(message_name = message, "No data for message"),
        }
        frames.insert(message, frame);
    }

    let aggregator = SignalAggregator::new(profile);
    let mut records = Vec::new();
    for trip in &trips {
        for rule in &profile.rules {
            if let Some(Some(frame)) = frames.get(rule.message.as_str()) {
                records.extend(aggregator.aggregate(trip, rule, frame));
            }
        }
    }
    Ok(records)
}

/// Runs trip aggregation over a range of days.
///
/// Devices are resolved to clusters once per run. Each day's devices are
/// aggregated concurrently and the day's records are written to a single
/// deterministic key, so reruns overwrite rather than append. A device whose
/// data cannot be read or aggregated is reported as skipped for that day; the
/// other devices are unaffected.
pub struct Aggregator {
    lake: Arc<dyn ObjectStore>,
    output: Arc<dyn ObjectStore>,
    config: Arc<AggregationConfig>,
    calculators: Vec<Arc<dyn SignalCalculator>>,
    concurrency: usize,
    format: SummaryFormat,
}

impl Aggregator {
    /// Reads frames from and writes summaries to `lake`.
    pub fn new(lake: Arc<dyn ObjectStore>, config: AggregationConfig) -> Self {
        Self {
            output: lake.clone(),
            lake,
            config: Arc::new(config),
            calculators: Vec::new(),
            concurrency: 1,
            format: SummaryFormat::default(),
        }
    }

    pub fn with_output(mut self, output: Arc<dyn ObjectStore>) -> Self {
        self.output = output;
        self
    }

    pub fn with_calculator(mut self, calculator: impl SignalCalculator + 'static) -> Self {
        self.calculators.push(Arc::new(calculator));
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_format(mut self, format: SummaryFormat) -> Self {
        self.format = format;
        self
    }

    pub fn config(&self) -> &AggregationConfig {
        &self.config
    }

    #[tracing::instrument(skip_all, fields(start = %range.start, end = %range.end))]
    pub async fn run(&self, range: DateRange) -> Result<RunReport> {
        let resolver = ClusterResolver::new(&self.config);
        let devices = discover_devices(self.lake.as_ref(), &resolver).await?;

        let mut report = RunReport {
            start: Some(range.start),
            end: Some(range.end),
            days: range.len(),
            ..Default::default()
        };

        let mut assigned: Vec<(String, String)> = Vec::new();
        for device_id in devices {
            match resolver.resolve(&device_id) {
                Some(profile) => assigned.push((device_id, profile.name.clone())),
                None => {
                    let reason = SkipReason::NoCluster;
                    warn!(device_id = %device_id, reason = %reason, "Skipping device");
                    report.skipped.push(SkippedDevice { device_id, reason });
                }
            }
        }
        report.devices = assigned.len();
        info!(devices = assigned.len(), skipped = report.skipped.len(), days = report.days, "Starting aggregation");

        for day in range.days() {
            let (records, failed) = self
                .aggregate_day(day, &assigned)
                .instrument(tracing::info_span!("day", %day))
                .await;
            report.skipped.extend(failed);

            let key = output_key(day, self.format);
            if records.is_empty() {
                // Overwrite a summary left by an earlier run over different input.
                if self.output.list(&key).await?.iter().any(|k| *k == key) {
                    self.write_summary(&key, &records).await?;
                    info!(%day, key = %key, "No trips with data, cleared previous summary");
                    report.outputs.push(key);
                } else {
                    info!(%day, "No trips with data");
                }
                continue;
            }

            self.write_summary(&key, &records).await?;
            info!(%day, key = %key, records = records.len(), "Trip summary written");

            report.days_with_data += 1;
            report.records_written += records.len();
            report.outputs.push(key);
        }

        info!(
            days_with_data = report.days_with_data,
            records = report.records_written,
            skipped = report.skipped.len(),
            "Aggregation run finished"
        );
        Ok(report)
    }

    async fn write_summary(&self, key: &str, records: &[AggregationRecord]) -> Result<()> {
        let body = self.format.encode(records)?;
        self.output
            .put(key, Bytes::from(body))
            .await
            .with_context(|| format!("failed to write {key}"))
    }

    /// Aggregates every device for one day. Returns the records in device order
    /// plus the devices whose data could not be processed.
    async fn aggregate_day(
        &self,
        day: NaiveDate,
        devices: &[(String, String)],
    ) -> (Vec<AggregationRecord>, Vec<SkippedDevice>) {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.concurrency));
        let calculators = Arc::new(self.calculators.clone());
        let mut tasks = Vec::with_capacity(devices.len());

        for (device_id, cluster) in devices {
            let sem = semaphore.clone();
            let lake = self.lake.clone();
            let config = self.config.clone();
            let calculators = calculators.clone();
            let device = device_id.clone();
            let cluster = cluster.clone();

            let span = tracing::info_span!("device", device_id = %device, cluster = %cluster);
            let task = tokio::spawn(
                async move {
                    let _permit = sem.acquire_owned().await?;
                    let profile = config
                        .profile(&cluster)
                        .with_context(|| format!("cluster `{cluster}` has no profile"))?;
                    aggregate_device_day(lake.as_ref(), profile, config.trip, &calculators, &device, day).await
                }
                .instrument(span),
            );
            tasks.push((device_id.clone(), task));
        }

        // Awaited in device order so output is stable across runs.
        let mut records = Vec::new();
        let mut failed = Vec::new();
        for (device_id, task) in tasks {
            let error = match task.await {
                Ok(Ok(device_records)) => {
                    records.extend(device_records);
                    continue;
                }
                Ok(Err(e)) => format!("{e:#}"),
                Err(e) => format!("device task panicked: {e}"),
            };
            warn!(device_id = %device_id, %day, error = %error, "Device failed, skipping for this day");
            failed.push(SkippedDevice {
                device_id,
                reason: SkipReason::Failed { day, error },
            });
        }
        (records, failed)
    }
}
