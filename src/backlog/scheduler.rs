//! Partitions resolved files into bounded batches.
//!
//! Files of one session stay together where the bounds allow it. A session is
//! split when it alone exceeds `max`, or when the open batch is still below
//! `min` and the whole session would overflow it; in that case the batch is
//! topped up to exactly `max`. Every batch but the last therefore holds
//! between `min` and `max` files.

use serde::Serialize;
use tracing::debug;

use super::config::BatchSize;
use super::resolver::ResolvedFile;

/// A group of files handed to one decoder invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Batch {
    pub index: usize,
    pub files: Vec<ResolvedFile>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

pub struct BatchScheduler {
    size: BatchSize,
}

impl BatchScheduler {
    pub fn new(size: BatchSize) -> Self {
        Self { size }
    }

    pub fn schedule(&self, files: Vec<ResolvedFile>) -> Vec<Batch> {
        let BatchSize { min, max } = self.size;
        let mut groups: Vec<Vec<ResolvedFile>> = Vec::new();

        if files.is_empty() {
            return Vec::new();
        }

        if files.len() < min {
            groups.push(files);
        } else {
            let mut current: Vec<ResolvedFile> = Vec::with_capacity(max);
            for mut run in session_runs(files) {
                if current.len() + run.len() > max && current.len() >= min {
                    groups.push(std::mem::take(&mut current));
                }
                while current.len() + run.len() > max {
                    let rest = run.split_off(max - current.len());
                    current.append(&mut run);
                    groups.push(std::mem::take(&mut current));
                    run = rest;
                }
                current.append(&mut run);
            }
            if !current.is_empty() {
                groups.push(current);
            }
        }

        debug!(batches = groups.len(), min, max, "Scheduled batches");
        groups
            .into_iter()
            .enumerate()
            .map(|(index, files)| Batch { index, files })
            .collect()
    }
}

/// Splits the sequence into maximal runs of consecutive files from one session.
fn session_runs(files: Vec<ResolvedFile>) -> Vec<Vec<ResolvedFile>> {
    let mut runs: Vec<Vec<ResolvedFile>> = Vec::new();
    for file in files {
        match runs.last_mut() {
            Some(run)
                if run[0].device_id == file.device_id && run[0].session_id == file.session_id =>
            {
                run.push(file)
            }
            _ => runs.push(vec![file]),
        }
    }
    runs
}
