//! End-to-end backlog run: load `backlog.json`, plan batches, decode each batch.

use anyhow::{Context, Result};
use bytes::Bytes;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{Instrument, error, info, warn};

use super::config::{BACKLOG_KEY, BacklogFile};
use super::dedup::dedup;
use super::resolver::PathResolver;
use super::scheduler::{Batch, BatchScheduler};
use crate::decoder::Decoder;
use crate::error::ConfigError;
use crate::storage::ObjectStore;

/// Reads and validates the backlog document from the root of `store`.
pub async fn load_backlog(store: &dyn ObjectStore) -> Result<BacklogFile> {
    let body = store
        .get(BACKLOG_KEY)
        .await?
        .ok_or_else(|| ConfigError::Missing {
            document: BACKLOG_KEY,
            key: BACKLOG_KEY.to_string(),
        })?;

    let backlog = BacklogFile::from_slice(&body)?;
    info!(
        entries = backlog.entries.len(),
        min = backlog.batch_size.min,
        max = backlog.batch_size.max,
        "Backlog loaded"
    );
    Ok(backlog)
}

/// Resolves, deduplicates and batches a backlog.
pub async fn plan(store: &dyn ObjectStore, backlog: &BacklogFile) -> Result<Vec<Batch>> {
    let resolved = PathResolver::new(store).resolve(&backlog.entries).await?;
    let unique = dedup(resolved);
    let batches = BatchScheduler::new(backlog.batch_size).schedule(unique);

    info!(
        files = batches.iter().map(Batch::len).sum::<usize>(),
        batches = batches.len(),
        "Backlog planned"
    );
    Ok(batches)
}

/// Outcome of a backlog run.
#[derive(Debug, Default, Serialize)]
pub struct BacklogReport {
    pub batches: usize,
    pub files: usize,
    pub uploaded: usize,
    pub failed_batches: Vec<usize>,
}

impl BacklogReport {
    pub fn is_success(&self) -> bool {
        self.failed_batches.is_empty()
    }
}

/// Drives decoding of every batch with bounded concurrency.
///
/// Batches share nothing: each downloads its own files into a private scratch
/// directory and uploads under keys derived from the decoded paths.
pub struct BacklogProcessor {
    input: Arc<dyn ObjectStore>,
    output: Arc<dyn ObjectStore>,
    decoder: Arc<dyn Decoder>,
    concurrency: usize,
    scratch: PathBuf,
}

impl BacklogProcessor {
    pub fn new(
        input: Arc<dyn ObjectStore>,
        output: Arc<dyn ObjectStore>,
        decoder: Arc<dyn Decoder>,
    ) -> Self {
        Self {
            input,
            output,
            decoder,
            concurrency: 1,
            scratch: std::env::temp_dir(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Directory under which per-batch scratch directories are created.
    pub fn with_scratch_dir(mut self, scratch: impl Into<PathBuf>) -> Self {
        self.scratch = scratch.into();
        self
    }

    #[tracing::instrument(skip(self), fields(concurrency = self.concurrency))]
    pub async fn run(&self) -> Result<BacklogReport> {
        // Validation and planning complete before any batch starts.
        let backlog = load_backlog(self.input.as_ref()).await?;
        let batches = plan(self.input.as_ref(), &backlog).await?;

        let mut report = BacklogReport {
            batches: batches.len(),
            files: batches.iter().map(Batch::len).sum(),
            ..Default::default()
        };

        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.concurrency));
        let total = batches.len();
        let mut tasks = Vec::with_capacity(total);

        for batch in batches {
            let sem = semaphore.clone();
            let input = self.input.clone();
            let output = self.output.clone();
            let decoder = self.decoder.clone();
            let scratch = self
                .scratch
                .join(format!("telemetry_lake_{}_batch_{}", std::process::id(), batch.index));
            let index = batch.index;

            let span = tracing::info_span!("batch", index, files = batch.len());
            let task = tokio::spawn(
                async move {
                    let _permit = sem.acquire_owned().await?;
                    info!(total, "Processing batch");
                    let result =
                        process_batch(input.as_ref(), output.as_ref(), decoder.as_ref(), &batch, &scratch)
                            .await;
                    if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
                        warn!(dir = %scratch.display(), error = %e, "Failed to clean up scratch directory");
                    }
                    result
                }
                .instrument(span),
            );
            tasks.push((index, task));
        }

        for (index, task) in tasks {
            match task.await {
                Ok(Ok(uploaded)) => report.uploaded += uploaded,
                Ok(Err(e)) => {
                    let message = format!("{e:#}");
                    error!(batch = index, error = %message, "Batch failed");
                    report.failed_batches.push(index);
                }
                Err(e) => {
                    error!(batch = index, error = %e, "Batch task panicked");
                    report.failed_batches.push(index);
                }
            }
        }

        info!(
            batches = report.batches,
            files = report.files,
            uploaded = report.uploaded,
            failed = report.failed_batches.len(),
            "Backlog run finished"
        );
        Ok(report)
    }
}

/// Downloads, decodes and uploads one batch. Returns the number of uploaded objects.
async fn process_batch(
    input: &dyn ObjectStore,
    output: &dyn ObjectStore,
    decoder: &dyn Decoder,
    batch: &Batch,
    scratch: &Path,
) -> Result<usize> {
    let logfiles = scratch.join("logfiles");
    let decoded = scratch.join("output");
    tokio::fs::create_dir_all(&logfiles).await?;
    tokio::fs::create_dir_all(&decoded).await?;

    for file in &batch.files {
        let body = input
            .get(&file.full_path)
            .await?
            .with_context(|| format!("log file `{}` not found", file.full_path))?;
        let local = logfiles
            .join(&file.device_id)
            .join(&file.session_id)
            .join(&file.file_name);
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&local, &body)
            .await
            .with_context(|| format!("failed to stage {}", local.display()))?;
    }

    decoder.decode(&logfiles, &decoded).await?;

    let root = decoded.clone();
    let mut produced = tokio::task::spawn_blocking(move || {
        let mut produced = Vec::new();
        collect_files(&root, &mut produced)?;
        Ok::<_, anyhow::Error>(produced)
    })
    .await??;
    produced.sort();

    for path in &produced {
        let key = relative_key(&decoded, path)?;
        let body = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read decoded file {}", path.display()))?;
        output.put(&key, Bytes::from(body)).await?;
    }

    info!(uploaded = produced.len(), "Uploaded decoded files");
    Ok(produced.len())
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            collect_files(&entry.path(), out)?;
        } else {
            out.push(entry.path());
        }
    }
    Ok(())
}

fn relative_key(root: &Path, path: &Path) -> Result<String> {
    let relative = path
        .strip_prefix(root)
        .with_context(|| format!("{} is outside {}", path.display(), root.display()))?;
    Ok(relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backlog::resolver::ResolvedFile;
    use crate::storage::{LocalStore, MemoryStore};

    /// Writes one output file per input file, named after the input.
    struct EchoDecoder;

    #[async_trait::async_trait]
    impl Decoder for EchoDecoder {
        async fn decode(&self, input_dir: &Path, output_dir: &Path) -> Result<()> {
            let mut inputs = Vec::new();
            collect_files(input_dir, &mut inputs)?;
            for input in inputs {
                let rel = relative_key(input_dir, &input)?;
                let (device, rest) = rel.split_once('/').unwrap();
                let target = output_dir
                    .join(device)
                    .join("CAN1_GnssSpeed")
                    .join("2024/01/02")
                    .join(format!("{}.csv", rest.replace('/', "_")));
                fs::create_dir_all(target.parent().unwrap())?;
                fs::write(target, "t,Speed\n")?;
            }
            Ok(())
        }
    }

    struct FailingDecoder;

    #[async_trait::async_trait]
    impl Decoder for FailingDecoder {
        async fn decode(&self, _: &Path, _: &Path) -> Result<()> {
            anyhow::bail!("decoder exited with 1")
        }
    }

    fn input_store(backlog: &str) -> Arc<MemoryStore> {
        Arc::new(MemoryStore::with_objects([
            ("backlog.json", backlog.to_string()),
            ("0BFD7754/00000001/00000001.MF4", "raw".to_string()),
            ("0BFD7754/00000001/00000002.MF4", "raw".to_string()),
            ("0BFD7754/00000002/00000001.MF4", "raw".to_string()),
        ]))
    }

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(name);
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[tokio::test]
    async fn test_run_decodes_and_uploads_every_file_once() {
        let input = input_store(
            r#"{ "config": { "batch_size": { "min": 1, "max": 2 } },
                 "files": ["0BFD7754/", "0BFD7754/00000001/00000002.MF4"] }"#,
        );
        let output = Arc::new(MemoryStore::new());

        let processor = BacklogProcessor::new(input, output.clone(), Arc::new(EchoDecoder))
            .with_concurrency(2)
            .with_scratch_dir(scratch("telemetry_lake_processor_ok"));
        let report = processor.run().await.unwrap();

        assert!(report.is_success());
        assert_eq!(report.files, 3);
        assert_eq!(report.batches, 2);
        assert_eq!(report.uploaded, 3);
        assert_eq!(
            output.keys(),
            vec![
                "0BFD7754/CAN1_GnssSpeed/2024/01/02/00000001_00000001.MF4.csv",
                "0BFD7754/CAN1_GnssSpeed/2024/01/02/00000001_00000002.MF4.csv",
                "0BFD7754/CAN1_GnssSpeed/2024/01/02/00000002_00000001.MF4.csv",
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_decoder_is_reported_per_batch() {
        let input = input_store(
            r#"{ "config": { "batch_size": { "min": 1, "max": 5 } }, "files": ["0BFD7754/"] }"#,
        );
        let processor =
            BacklogProcessor::new(input, Arc::new(MemoryStore::new()), Arc::new(FailingDecoder))
                .with_scratch_dir(scratch("telemetry_lake_processor_fail"));

        let report = processor.run().await.unwrap();
        assert_eq!(report.failed_batches, vec![0]);
        assert!(!report.is_success());
    }

    /// Copies every staged file to the output tree, suffixed `.csv`.
    struct CopyDecoder;

    #[async_trait::async_trait]
    impl Decoder for CopyDecoder {
        async fn decode(&self, input_dir: &Path, output_dir: &Path) -> Result<()> {
            let mut inputs = Vec::new();
            collect_files(input_dir, &mut inputs)?;
            for input in inputs {
                let rel = relative_key(input_dir, &input)?;
                let target = output_dir.join(format!("{rel}.csv"));
                fs::create_dir_all(target.parent().unwrap())?;
                fs::copy(&input, target)?;
            }
            Ok(())
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_batch_staged_and_uploaded_between_local_stores() {
        let root = scratch("telemetry_lake_processor_local");
        let input = LocalStore::new(root.join("raw")).unwrap();
        let output = LocalStore::new(root.join("decoded")).unwrap();
        input.put("0BFD7754/00000001/00000001.MF4", Bytes::from_static(b"one")).await.unwrap();
        input.put("0BFD7754/00000002/00000001.MF4", Bytes::from_static(b"two")).await.unwrap();

        let batch = Batch {
            index: 0,
            files: ["0BFD7754/00000001/00000001.MF4", "0BFD7754/00000002/00000001.MF4"]
                .into_iter()
                .filter_map(ResolvedFile::from_key)
                .collect(),
        };
        let uploaded = process_batch(&input, &output, &CopyDecoder, &batch, &root.join("scratch"))
            .await
            .unwrap();

        assert_eq!(uploaded, 2);
        assert_eq!(
            output.get("0BFD7754/00000002/00000001.MF4.csv").await.unwrap().unwrap(),
            Bytes::from_static(b"two")
        );
        assert_eq!(
            output.list("").await.unwrap(),
            vec!["0BFD7754/00000001/00000001.MF4.csv", "0BFD7754/00000002/00000001.MF4.csv"]
        );
    }

    #[tokio::test]
    async fn test_missing_backlog_is_config_error() {
        let store = MemoryStore::new();
        let err = load_backlog(&store).await.unwrap_err();
        assert!(err.downcast_ref::<ConfigError>().is_some());
    }
}
