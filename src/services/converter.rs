use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("failed to start converter {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("converter exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("converter timed out after {0:?}")]
    TimedOut(Duration),
}

/// Black-box format converter: reads `source`, writes `target`.
#[async_trait]
pub trait Converter: Send + Sync {
    async fn convert(&self, source: &Path, target: &Path) -> Result<(), ConvertError>;
}

/// Runs an external executable as `<program> <source> <target>`.
///
/// Exit code 0 means the output was written. The child is killed if the
/// returned future is dropped, so cancelling a pipeline does not leave
/// orphaned converters behind.
pub struct ProcessConverter {
    program: PathBuf,
    timeout: Option<Duration>,
}

impl ProcessConverter {
    pub fn new(program: impl Into<PathBuf>, timeout: Option<Duration>) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Converter for ProcessConverter {
    async fn convert(&self, source: &Path, target: &Path) -> Result<(), ConvertError> {
        let child = Command::new(&self.program)
            .arg(source)
            .arg(target)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child)
                .await
                .map_err(|_| ConvertError::TimedOut(limit))?,
            None => child.await,
        }
        .map_err(|source| ConvertError::Spawn {
            program: self.program.display().to_string(),
            source,
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ConvertError::Failed {
                status: output.status.to_string(),
                stderr,
            });
        }

        tracing::trace!(
            "Converter stdout: {}",
            String::from_utf8_lossy(&output.stdout).trim()
        );
        Ok(())
    }
}
