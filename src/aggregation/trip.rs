//! Cuts a device's activity stream into trips.
//!
//! A trip stays open while consecutive samples are at most `gap` apart. A
//! larger gap closes it; the closed window is kept only if it lasts at least
//! `min_length`. Input must already be sorted ascending.

use chrono::{DateTime, Utc};
use tracing::trace;

use super::config::TripParams;
use super::types::TripWindow;

#[derive(Debug, Clone, Copy)]
enum State {
    Idle,
    Open {
        start: DateTime<Utc>,
        last: DateTime<Utc>,
    },
}

pub struct TripSegmenter {
    params: TripParams,
}

impl TripSegmenter {
    pub fn new(params: TripParams) -> Self {
        Self { params }
    }

    pub fn segment(
        &self,
        device_id: &str,
        timestamps: impl IntoIterator<Item = DateTime<Utc>>,
    ) -> Vec<TripWindow> {
        let mut windows = Vec::new();
        let mut state = State::Idle;

        for t in timestamps {
            state = match state {
                State::Idle => State::Open { start: t, last: t },
                State::Open { start, last } if t - last <= self.params.gap => {
                    State::Open { start, last: t }
                }
                State::Open { start, last } => {
                    self.close(device_id, start, last, &mut windows);
                    State::Open { start: t, last: t }
                }
            };
        }

        if let State::Open { start, last } = state {
            self.close(device_id, start, last, &mut windows);
        }
        windows
    }

    fn close(
        &self,
        device_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        windows: &mut Vec<TripWindow>,
    ) {
        let window = TripWindow {
            device_id: device_id.to_string(),
            start,
            end,
        };
        if window.duration() >= self.params.min_length {
            windows.push(window);
        } else {
            trace!(device_id, %start, %end, "Discarding short trip");
        }
    }
}
