//! Columnar frames of decoded telemetry.
//!
//! A frame is one message's samples: a `t` timestamp column plus any number of
//! numeric signal columns. The decoder writes frames as Parquet files with a
//! timestamp (or epoch-microsecond `Int64`) column named `t`. CSV frames are
//! accepted too, optionally gzip-compressed, with a header starting at `t`:
//!
//! ```text
//! t,Speed,SpeedValid
//! 2024-01-02T08:00:00Z,12.5,1
//! 2024-01-02T08:00:01Z,,1
//! ```
//!
//! CSV timestamps are RFC 3339 or integer microseconds since the Unix epoch.
//! Empty cells and Parquet nulls are missing values.

use anyhow::{Context, Result};
use arrow::array::{Array, ArrayRef, AsArray, Float64Array, TimestampMicrosecondArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Float64Type, Int64Type, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::debug;

/// Name of the timestamp column.
pub const TIME_COLUMN: &str = "t";

/// A named signal column. `values[i]` belongs to the frame's `i`th timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub values: Vec<Option<f64>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    timestamps: Vec<DateTime<Utc>>,
    columns: Vec<Column>,
}

impl Frame {
    pub fn new(timestamps: Vec<DateTime<Utc>>) -> Self {
        Self {
            timestamps,
            columns: Vec::new(),
        }
    }

    /// Builder form of [`Frame::push_column`].
    pub fn with_column(mut self, name: impl Into<String>, values: Vec<Option<f64>>) -> Result<Self> {
        self.push_column(name, values)?;
        Ok(self)
    }

    /// Adds a column, replacing any existing column of the same name.
    pub fn push_column(&mut self, name: impl Into<String>, values: Vec<Option<f64>>) -> Result<()> {
        let name = name.into();
        if values.len() != self.timestamps.len() {
            anyhow::bail!(
                "column `{}` has {} values but the frame has {} rows",
                name,
                values.len(),
                self.timestamps.len()
            );
        }
        match self.columns.iter_mut().find(|c| c.name == name) {
            Some(existing) => existing.values = values,
            None => self.columns.push(Column { name, values }),
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn timestamps(&self) -> &[DateTime<Utc>] {
        &self.timestamps
    }

    pub fn column(&self, name: &str) -> Option<&[Option<f64>]> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.values.as_slice())
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// Reorders all rows by ascending timestamp. Ties keep their relative order.
    pub fn sort_by_time(&mut self) {
        if self.timestamps.is_sorted() {
            return;
        }
        let mut order: Vec<usize> = (0..self.timestamps.len()).collect();
        order.sort_by_key(|&i| self.timestamps[i]);

        self.timestamps = order.iter().map(|&i| self.timestamps[i]).collect();
        for column in &mut self.columns {
            column.values = order.iter().map(|&i| column.values[i]).collect();
        }
    }

    /// Stacks frames row-wise. Columns missing from a frame are filled with `None`.
    pub fn concat(frames: Vec<Frame>) -> Frame {
        let mut names: Vec<String> = Vec::new();
        for frame in &frames {
            for name in frame.column_names() {
                if !names.iter().any(|n| n == name) {
                    names.push(name.to_string());
                }
            }
        }

        let mut out = Frame {
            timestamps: Vec::new(),
            columns: names
                .into_iter()
                .map(|name| Column {
                    name,
                    values: Vec::new(),
                })
                .collect(),
        };

        for frame in frames {
            let rows = frame.len();
            for column in &mut out.columns {
                match frame.column(&column.name) {
                    Some(values) => column.values.extend_from_slice(values),
                    None => column.values.extend(std::iter::repeat_n(None, rows)),
                }
            }
            out.timestamps.extend(frame.timestamps);
        }
        out
    }

    /// Non-missing samples of `signal` with `start <= t < end`, in row order.
    pub fn samples(
        &self,
        signal: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<(DateTime<Utc>, f64)> {
        let Some(values) = self.column(signal) else {
            return Vec::new();
        };
        self.timestamps
            .iter()
            .zip(values)
            .filter(|(t, _)| **t >= start && **t < end)
            .filter_map(|(t, v)| v.map(|v| (*t, v)))
            .collect()
    }

    /// Parses a CSV frame.
    pub fn from_csv(bytes: &[u8]) -> Result<Self> {
        let mut rdr = csv::Reader::from_reader(bytes);
        let headers = rdr.headers()?.clone();

        let time_idx = headers
            .iter()
            .position(|h| h == TIME_COLUMN)
            .with_context(|| format!("frame has no `{TIME_COLUMN}` column"))?;
        let signal_idx: Vec<usize> = (0..headers.len()).filter(|&i| i != time_idx).collect();

        let mut timestamps = Vec::new();
        let mut values: Vec<Vec<Option<f64>>> = vec![Vec::new(); signal_idx.len()];

        for (row, record) in rdr.records().enumerate() {
            let record = record?;
            let raw_t = record.get(time_idx).unwrap_or_default();
            timestamps.push(
                parse_timestamp(raw_t)
                    .with_context(|| format!("row {}: invalid timestamp `{raw_t}`", row + 1))?,
            );

            for (slot, &idx) in values.iter_mut().zip(&signal_idx) {
                let cell = record.get(idx).unwrap_or_default().trim();
                let value = if cell.is_empty() {
                    None
                } else {
                    Some(cell.parse::<f64>().with_context(|| {
                        format!("row {}: `{}` is not numeric in column `{}`", row + 1, cell, &headers[idx])
                    })?)
                };
                slot.push(value);
            }
        }

        let columns = signal_idx
            .iter()
            .zip(values)
            .map(|(&idx, values)| Column {
                name: headers[idx].to_string(),
                values,
            })
            .collect();

        Ok(Frame {
            timestamps,
            columns,
        })
    }

    /// Serializes the frame as CSV with RFC 3339 timestamps.
    pub fn to_csv(&self) -> Result<Vec<u8>> {
        let mut writer = csv::Writer::from_writer(Vec::new());

        let mut header = vec![TIME_COLUMN.to_string()];
        header.extend(self.columns.iter().map(|c| c.name.clone()));
        writer.write_record(&header)?;

        for (i, t) in self.timestamps.iter().enumerate() {
            let mut record = vec![t.to_rfc3339()];
            record.extend(
                self.columns
                    .iter()
                    .map(|c| c.values[i].map(|v| v.to_string()).unwrap_or_default()),
            );
            writer.write_record(&record)?;
        }

        Ok(writer.into_inner()?)
    }

    /// Converts one Arrow record batch. Non-numeric columns other than `t` are
    /// left out.
    pub fn from_record_batch(batch: &RecordBatch) -> Result<Self> {
        let schema = batch.schema();
        let time_idx = schema
            .index_of(TIME_COLUMN)
            .with_context(|| format!("frame has no `{TIME_COLUMN}` column"))?;
        let mut frame = Frame::new(timestamps_of(batch.column(time_idx))?);

        for (idx, field) in schema.fields().iter().enumerate() {
            if idx == time_idx {
                continue;
            }
            let data_type = field.data_type();
            if !data_type.is_numeric() && *data_type != DataType::Boolean {
                debug!(column = %field.name(), %data_type, "Skipping non-numeric column");
                continue;
            }
            let values = cast(batch.column(idx), &DataType::Float64)
                .with_context(|| format!("column `{}` is not numeric", field.name()))?;
            frame.push_column(field.name().clone(), values.as_primitive::<Float64Type>().iter().collect())?;
        }
        Ok(frame)
    }

    /// Parses a Parquet frame.
    pub fn from_parquet(body: Bytes) -> Result<Self> {
        let reader = ParquetRecordBatchReaderBuilder::try_new(body)?.build()?;
        let mut frames = Vec::new();
        for batch in reader {
            frames.push(Frame::from_record_batch(&batch?)?);
        }
        Ok(Frame::concat(frames))
    }

    /// Serializes the frame as Parquet with a UTC microsecond `t` column.
    pub fn to_parquet(&self) -> Result<Vec<u8>> {
        let mut fields = vec![Field::new(
            TIME_COLUMN,
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            false,
        )];
        let mut arrays: Vec<ArrayRef> = vec![Arc::new(
            TimestampMicrosecondArray::from(
                self.timestamps.iter().map(|t| t.timestamp_micros()).collect::<Vec<_>>(),
            )
            .with_timezone("UTC"),
        )];
        for column in &self.columns {
            fields.push(Field::new(&column.name, DataType::Float64, true));
            arrays.push(Arc::new(Float64Array::from(column.values.clone())));
        }

        let schema = Arc::new(Schema::new(fields));
        let batch = RecordBatch::try_new(schema.clone(), arrays)?;
        let mut writer = ArrowWriter::try_new(Vec::new(), schema, None)?;
        writer.write(&batch)?;
        Ok(writer.into_inner()?)
    }
}

/// Epoch timestamps of a `t` column: any Arrow timestamp unit, or `Int64` microseconds.
fn timestamps_of(column: &ArrayRef) -> Result<Vec<DateTime<Utc>>> {
    let micros = match column.data_type() {
        DataType::Timestamp(_, tz) => {
            cast(column, &DataType::Timestamp(TimeUnit::Microsecond, tz.clone()))?
        }
        DataType::Int64 => column.clone(),
        other => anyhow::bail!("`{TIME_COLUMN}` column has unsupported type {other}"),
    };
    let micros = cast(&micros, &DataType::Int64)?;

    micros
        .as_primitive::<Int64Type>()
        .iter()
        .enumerate()
        .map(|(row, value)| {
            value
                .and_then(DateTime::from_timestamp_micros)
                .with_context(|| format!("row {}: missing or out-of-range timestamp", row + 1))
        })
        .collect()
}


fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(micros) = raw.parse::<i64>() {
        return DateTime::from_timestamp_micros(micros);
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// True for keys that hold a frame: `*.parquet`, `*.csv` or `*.csv.gz`.
pub fn is_frame_key(key: &str) -> bool {
    key.ends_with(".parquet") || key.ends_with(".csv") || key.ends_with(".csv.gz")
}

/// Decodes a stored frame by its key's extension.
pub fn decode(key: &str, body: Bytes) -> Result<Frame> {
    let frame = if key.ends_with(".parquet") {
        Frame::from_parquet(body)
    } else if key.ends_with(".gz") {
        let mut raw = Vec::new();
        GzDecoder::new(&body[..])
            .read_to_end(&mut raw)
            .with_context(|| format!("failed to decompress {key}"))?;
        Frame::from_csv(&raw)
    } else {
        Frame::from_csv(&body)
    };
    frame.with_context(|| format!("failed to parse frame {key}"))
}

/// Gzip-compresses a body with the default level.
pub fn gzip(body: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body)?;
    Ok(encoder.finish()?)
}
