//! The raw log decoder collaborator.
//!
//! Decoding MDF logs into columnar frames is done by an external executable;
//! this crate only stages its input and collects its output.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

/// Converts every raw file below `input_dir` into frame files below `output_dir`,
/// laid out as `<device>/<message>/<YYYY>/<MM>/<DD>/<file>`.
#[async_trait::async_trait]
pub trait Decoder: Send + Sync {
    async fn decode(&self, input_dir: &Path, output_dir: &Path) -> Result<()>;
}

/// Runs a decoder executable as `<program> -i <input> -O <output> --verbosity=1 -X`.
pub struct CommandDecoder {
    program: PathBuf,
}

impl CommandDecoder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn args(input_dir: &Path, output_dir: &Path) -> Vec<String> {
        vec![
            "-i".to_string(),
            input_dir.display().to_string(),
            "-O".to_string(),
            output_dir.display().to_string(),
            "--verbosity=1".to_string(),
            "-X".to_string(),
        ]
    }
}

#[async_trait::async_trait]
impl Decoder for CommandDecoder {
    async fn decode(&self, input_dir: &Path, output_dir: &Path) -> Result<()> {
        let args = Self::args(input_dir, output_dir);
        debug!(program = %self.program.display(), ?args, "Running decoder");

        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .await
            .with_context(|| format!("failed to start decoder {}", self.program.display()))?;

        if !output.status.success() {
            anyhow::bail!(
                "decoder {} exited with {}: {}",
                self.program.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        info!(program = %self.program.display(), "Decoding finished");
        Ok(())
    }
}
