//! Trip summary encoding and output keys.

use anyhow::Result;
use arrow::array::{ArrayRef, Float64Array, StringArray, TimestampMicrosecondArray, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::NaiveDate;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::sync::Arc;

use super::types::AggregationRecord;
use crate::frame;

/// Columns of the trip summary table, in order.
pub const SUMMARY_COLUMNS: [&str; 11] = [
    "device_id",
    "message",
    "signal",
    "aggregation",
    "value",
    "count",
    "duration_s",
    "trip_start",
    "trip_end",
    "trip_id",
    "cluster",
];

/// File format of the daily trip summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum SummaryFormat {
    #[default]
    Parquet,
    Csv,
    CsvGz,
}

impl SummaryFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            SummaryFormat::Parquet => "parquet",
            SummaryFormat::Csv => "csv",
            SummaryFormat::CsvGz => "csv.gz",
        }
    }

    /// Encodes records in this format. An empty slice still yields a valid
    /// file carrying the header or schema.
    pub fn encode(&self, records: &[AggregationRecord]) -> Result<Vec<u8>> {
        match self {
            SummaryFormat::Parquet => to_parquet(records),
            SummaryFormat::Csv => to_csv(records),
            SummaryFormat::CsvGz => frame::gzip(&to_csv(records)?),
        }
    }
}

/// `aggregations/tripsummary/<YYYY>/<MM>/<DD>/<YYYYMMDD>.<ext>`
pub fn output_key(day: NaiveDate, format: SummaryFormat) -> String {
    format!(
        "aggregations/tripsummary/{}/{}.{}",
        day.format("%Y/%m/%d"),
        day.format("%Y%m%d"),
        format.extension()
    )
}

fn to_csv(records: &[AggregationRecord]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    if records.is_empty() {
        writer.write_record(SUMMARY_COLUMNS)?;
    }
    for record in records {
        writer.serialize(record)?;
    }
    Ok(writer.into_inner()?)
}

fn strings<'a>(records: &'a [AggregationRecord], field: impl Fn(&'a AggregationRecord) -> &'a str) -> ArrayRef {
    Arc::new(StringArray::from(records.iter().map(field).collect::<Vec<_>>()))
}

fn timestamps(values: Vec<i64>) -> ArrayRef {
    Arc::new(TimestampMicrosecondArray::from(values).with_timezone("UTC"))
}

fn to_parquet(records: &[AggregationRecord]) -> Result<Vec<u8>> {
    let utc = DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()));
    let schema = Arc::new(Schema::new(vec![
        Field::new(SUMMARY_COLUMNS[0], DataType::Utf8, false),
        Field::new(SUMMARY_COLUMNS[1], DataType::Utf8, false),
        Field::new(SUMMARY_COLUMNS[2], DataType::Utf8, false),
        Field::new(SUMMARY_COLUMNS[3], DataType::Utf8, false),
        Field::new(SUMMARY_COLUMNS[4], DataType::Float64, false),
        Field::new(SUMMARY_COLUMNS[5], DataType::UInt64, false),
        Field::new(SUMMARY_COLUMNS[6], DataType::Float64, false),
        Field::new(SUMMARY_COLUMNS[7], utc.clone(), false),
        Field::new(SUMMARY_COLUMNS[8], utc, false),
        Field::new(SUMMARY_COLUMNS[9], DataType::Utf8, false),
        Field::new(SUMMARY_COLUMNS[10], DataType::Utf8, false),
    ]));

    let columns: Vec<ArrayRef> = vec![
        strings(records, |r| r.device_id.as_str()),
        strings(records, |r| r.message.as_str()),
        strings(records, |r| r.signal.as_str()),
        strings(records, |r| r.aggregation.as_str()),
        Arc::new(Float64Array::from(records.iter().map(|r| r.value).collect::<Vec<_>>())),
        Arc::new(UInt64Array::from(records.iter().map(|r| r.count as u64).collect::<Vec<_>>())),
        Arc::new(Float64Array::from(records.iter().map(|r| r.duration_s).collect::<Vec<_>>())),
        timestamps(records.iter().map(|r| r.trip_start.timestamp_micros()).collect()),
        timestamps(records.iter().map(|r| r.trip_end.timestamp_micros()).collect()),
        strings(records, |r| r.trip_id.as_str()),
        strings(records, |r| r.cluster.as_str()),
    ];
    let batch = RecordBatch::try_new(schema.clone(), columns)?;

    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(Vec::new(), schema, Some(props))?;
    writer.write(&batch)?;
    Ok(writer.into_inner()?)
}
