//! Derived signals computed on loaded frames before aggregation.

use anyhow::Result;

use crate::frame::Frame;

/// Adds or rewrites columns of a message frame.
///
/// Calculators run on every aggregation frame of every device, in registration
/// order, after the frame is loaded and sorted. A calculator decides for itself
/// whether a given device/message concerns it.
pub trait SignalCalculator: Send + Sync {
    fn name(&self) -> &str;

    fn apply(&self, device_id: &str, message: &str, frame: &mut Frame) -> Result<()>;
}

/// Appends the sample-to-sample difference of `source` as `output`.
///
/// The first row, and any row whose current or previous value is missing, gets
/// no value. Typical use is turning an odometer into distance per sample.
#[derive(Debug, Clone)]
pub struct DeltaSignal {
    pub message: String,
    pub source: String,
    pub output: String,
    /// Restricts the calculator to these devices. `None` applies to all.
    pub devices: Option<Vec<String>>,
}

impl DeltaSignal {
    pub fn new(message: impl Into<String>, source: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: source.into(),
            output: output.into(),
            devices: None,
        }
    }

    pub fn for_devices(mut self, devices: Vec<String>) -> Self {
        self.devices = Some(devices);
        self
    }
}

impl SignalCalculator for DeltaSignal {
    fn name(&self) -> &str {
        "delta_signal"
    }

    fn apply(&self, device_id: &str, message: &str, frame: &mut Frame) -> Result<()> {
        if message != self.message {
            return Ok(());
        }
        if let Some(devices) = &self.devices {
            if !devices.iter().any(|d| d == device_id) {
                return Ok(());
            }
        }
        let Some(source) = frame.column(&self.source) else {
            return Ok(());
        };

        let mut values = Vec::with_capacity(source.len());
        let mut previous: Option<f64> = None;
        for current in source {
            values.push(match (previous, current) {
                (Some(p), Some(c)) => Some(c - p),
                _ => None,
            });
            previous = *current;
        }
        frame.push_column(self.output.clone(), values)
    }
}
