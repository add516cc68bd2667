use anyhow::Result;
use bytes::Bytes;
use chrono::NaiveDate;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use telemetry_lake::aggregation::{AggregationConfig, Aggregator, DateRange, SummaryFormat};
use telemetry_lake::backlog::{BacklogProcessor, load_backlog, plan};
use telemetry_lake::decoder::Decoder;
use telemetry_lake::error::{ConfigError, SkipReason};
use telemetry_lake::frame::Frame;
use telemetry_lake::storage::{MemoryStore, ObjectStore};

/// Counts listings so tests can tell whether any file enumeration happened.
struct CountingStore {
    inner: MemoryStore,
    lists: AtomicUsize,
}

#[async_trait::async_trait]
impl ObjectStore for CountingStore {
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        self.inner.list(prefix).await
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, body: Bytes) -> Result<()> {
        self.inner.put(key, body).await
    }
}

struct NoopDecoder;

#[async_trait::async_trait]
impl Decoder for NoopDecoder {
    async fn decode(&self, _: &std::path::Path, _: &std::path::Path) -> Result<()> {
        Ok(())
    }
}

fn raw_logs() -> Vec<(&'static str, &'static str)> {
    vec![
        ("2F6913DB/00000001/00000001-00000001.MF4", "a"),
        ("2F6913DB/00000001/00000001-00000002.MF4", "b"),
        ("2F6913DB/00000002/00000002-00000001.MF4", "c"),
        ("2F6913DB/00000002/notes.txt", "skip"),
        ("0BFD7754/00000005/00000005-00000001.mfc", "d"),
        ("0BFD7754/00000005/00000005-00000002.MFE", "e"),
        ("0BFD7754/00000006/00000006-00000001.MF4", "f"),
    ]
}

#[tokio::test]
async fn test_backlog_batches_cover_each_file_once() {
    let store = MemoryStore::with_objects(raw_logs());
    store.insert(
        "backlog.json",
        r#"{
            "config": { "batch_size": { "min": 2, "max": 3 } },
            "files": [
                "2F6913DB/",
                "0BFD7754/00000005",
                "2F6913DB/00000001/00000001-00000002.MF4",
                "0BFD7754/00000006/00000006-00000001.MF4"
            ]
        }"#,
    );

    let backlog = load_backlog(&store).await.unwrap();
    let batches = plan(&store, &backlog).await.unwrap();

    let planned: Vec<String> = batches
        .iter()
        .flat_map(|b| b.files.iter().map(|f| f.full_path.clone()))
        .collect();
    assert_eq!(
        planned,
        vec![
            "2F6913DB/00000001/00000001-00000001.MF4",
            "2F6913DB/00000001/00000001-00000002.MF4",
            "2F6913DB/00000002/00000002-00000001.MF4",
            "0BFD7754/00000005/00000005-00000001.mfc",
            "0BFD7754/00000005/00000005-00000002.MFE",
            "0BFD7754/00000006/00000006-00000001.MF4",
        ]
    );
    assert_eq!(planned.iter().collect::<HashSet<_>>().len(), planned.len());

    let (last, rest) = batches.split_last().unwrap();
    for batch in rest {
        assert!((2..=3).contains(&batch.len()));
    }
    assert!(last.len() <= 3);
}

#[tokio::test]
async fn test_missing_max_aborts_before_listing() {
    let store = Arc::new(CountingStore {
        inner: MemoryStore::with_objects(raw_logs()),
        lists: AtomicUsize::new(0),
    });
    store.inner.insert(
        "backlog.json",
        r#"{ "config": { "batch_size": { "min": 2 } }, "files": ["2F6913DB/"] }"#,
    );

    let processor = BacklogProcessor::new(store.clone(), Arc::new(MemoryStore::new()), Arc::new(NoopDecoder));
    let err = processor.run().await.unwrap_err();

    let config_err = err.downcast_ref::<ConfigError>().expect("config error");
    assert!(config_err.to_string().contains("max"));
    assert_eq!(store.lists.load(Ordering::SeqCst), 0);
}

const AGGREGATIONS: &str = r#"{
    "config": {
        "date": { "mode": "specific_period", "start_date": "2024-03-10", "end_date": "2024-03-10" },
        "trip": { "trip_gap_min": 10, "trip_min_length_min": 1 }
    },
    "device_clusters": [
        { "devices": ["0BFD7754"], "cluster": "vans" },
        { "devices": ["2F6913DB"], "cluster": "trucks" }
    ],
    "cluster_details": [
        { "clusters": ["vans", "trucks"], "details": {
            "trip_identifier": { "message": "CAN9_GnssSpeed" },
            "aggregations": [
                { "message": "CAN9_GnssSpeed", "signal": ["Speed"],
                  "aggregation": ["min", "max", "avg", "median", "delta_sum_pos"] }
            ]
        } }
    ]
}"#;

const SPEED: &str = "t,Speed\n\
    1710061200000000,10\n\
    1710061500000000,7\n\
    1710061740000000,12\n\
    1710061800000000,9\n\
    1710062460000000,3\n\
    1710062700000000,4\n";

fn lake() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::with_objects([
        ("0BFD7754/CAN9_GnssSpeed/2024/03/10/00000001-00000001.csv", SPEED),
        ("2F6913DB/CAN9_GnssSpeed/2024/03/10/00000002-00000001.csv", SPEED),
        ("9A0E2C11/CAN9_GnssSpeed/2024/03/10/00000003-00000001.csv", SPEED),
    ]))
}

fn march_10() -> DateRange {
    let day = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
    DateRange { start: day, end: day }
}

#[tokio::test]
async fn test_aggregation_is_idempotent() {
    let lake = lake();
    let config = AggregationConfig::from_slice(AGGREGATIONS.as_bytes()).unwrap();

    let first = Aggregator::new(lake.clone(), config.clone()).run(march_10()).await.unwrap();
    let key = &first.outputs[0];
    let first_body = lake.get(key).await.unwrap().unwrap();

    let second = Aggregator::new(lake.clone(), config).with_concurrency(3).run(march_10()).await.unwrap();
    let second_body = lake.get(key).await.unwrap().unwrap();

    assert_eq!(first.outputs, second.outputs);
    assert_eq!(first_body, second_body);
}

#[tokio::test]
async fn test_unclustered_device_skipped_while_others_aggregate() {
    let lake = lake();
    let config = AggregationConfig::from_slice(AGGREGATIONS.as_bytes()).unwrap();
    let report = Aggregator::new(lake.clone(), config)
        .with_format(SummaryFormat::Csv)
        .run(march_10())
        .await
        .unwrap();

    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].device_id, "9A0E2C11");
    assert_eq!(report.skipped[0].reason, SkipReason::NoCluster);

    let body = lake.get(&report.outputs[0]).await.unwrap().unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("0BFD7754"));
    assert!(text.contains("2F6913DB"));
    assert!(!text.contains("9A0E2C11"));

    // Two trips per device: 09:00-09:10 then 09:21-09:25.
    let mut rdr = csv::Reader::from_reader(text.as_bytes());
    let rows: Vec<csv::StringRecord> = rdr.records().collect::<Result<_, _>>().unwrap();
    assert_eq!(rows.len(), 2 * 2 * 5);
    assert_eq!(report.records_written, rows.len());
}

#[tokio::test]
async fn test_failing_device_is_isolated() {
    let lake = lake();
    lake.insert(
        "2F6913DB/CAN9_GnssSpeed/2024/03/10/00000002-00000002.csv",
        "t,Speed\n1710061200000000,fast\n",
    );
    let config = AggregationConfig::from_slice(AGGREGATIONS.as_bytes()).unwrap();

    let report = Aggregator::new(lake.clone(), config)
        .with_format(SummaryFormat::Csv)
        .run(march_10())
        .await
        .unwrap();

    let failed: Vec<&str> = report
        .skipped
        .iter()
        .filter(|s| matches!(s.reason, SkipReason::Failed { .. }))
        .map(|s| s.device_id.as_str())
        .collect();
    assert_eq!(failed, vec!["2F6913DB"]);

    let body = lake.get(&report.outputs[0]).await.unwrap().unwrap();
    let mut rdr = csv::Reader::from_reader(&body[..]);
    let devices: HashSet<String> = rdr
        .records()
        .map(|r| r.unwrap()[0].to_string())
        .collect();
    assert_eq!(devices, HashSet::from(["0BFD7754".to_string()]));
}

#[tokio::test]
async fn test_parquet_frames_from_decoder_are_aggregated() {
    let speed = Frame::from_csv(SPEED.as_bytes()).unwrap().to_parquet().unwrap();
    let lake = Arc::new(MemoryStore::with_objects([(
        "0BFD7754/CAN9_GnssSpeed/2024/03/10/00000001-00000001.parquet",
        speed,
    )]));
    let config = AggregationConfig::from_slice(AGGREGATIONS.as_bytes()).unwrap();

    let report = Aggregator::new(lake, config).run(march_10()).await.unwrap();

    assert_eq!(report.records_written, 2 * 5);
    assert_eq!(
        report.outputs,
        vec!["aggregations/tripsummary/2024/03/10/20240310.parquet"]
    );
}
