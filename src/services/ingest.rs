use axum::extract::Multipart;
use axum::extract::multipart::{Field, MultipartError};
use axum::http::StatusCode;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::services::pipeline::PipelineError;
use crate::utils::validation::{FilePolicy, sanitize_filename_within};

/// A pending conversion job. Produced once the source file is fully written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestionRecord {
    pub source: PathBuf,
    pub target: PathBuf,
}

impl IngestionRecord {
    /// Progress field name for this record: the output's file name.
    pub fn progress_field(&self) -> String {
        self.target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.target.display().to_string())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestSummary {
    pub accepted: usize,
    pub skipped: usize,
    pub bytes: u64,
}

impl From<MultipartError> for PipelineError {
    fn from(e: MultipartError) -> Self {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            PipelineError::PayloadTooLarge(e.body_text())
        } else {
            PipelineError::Transport(e.body_text())
        }
    }
}

/// Reads the multipart body part by part, persists every eligible file into
/// `dir` and queues one [`IngestionRecord`] per file, in upload order.
///
/// Parts are read strictly one after another; the next part cannot be
/// opened while the current one is still streaming. The queue is closed when
/// this returns (the sender is dropped), on success and on error alike.
pub async fn ingest(
    mut multipart: Multipart,
    dir: &Path,
    policy: &FilePolicy,
    queue: mpsc::Sender<IngestionRecord>,
    cancel: &CancellationToken,
) -> Result<IngestSummary, PipelineError> {
    tokio::fs::create_dir_all(dir).await?;

    let mut summary = IngestSummary::default();
    // Earlier batches of the same session share this directory
    let mut seen = existing_names(dir).await?;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            next = multipart.next_field() => next?,
        };
        let Some(mut field) = next else { break };

        if !policy.accepts(field.name(), field.file_name()) {
            tracing::debug!(
                field = field.name().unwrap_or_default(),
                file = field.file_name().unwrap_or_default(),
                "Skipping ineligible part"
            );
            summary.skipped += 1;
            continue;
        }

        let original = field.file_name().unwrap_or_default().to_string();
        let filename = match sanitize_filename_within(&original, policy.max_source_name_len()) {
            Ok(name) => unique_name(&mut seen, name),
            Err(e) => {
                tracing::warn!("Skipping upload {:?}: {}", original, e);
                summary.skipped += 1;
                continue;
            }
        };

        let source = dir.join(&filename);
        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            written = persist(&mut field, &source) => written?,
        };
        tracing::info!("📥 Stored {} ({} bytes)", filename, written);

        let record = IngestionRecord {
            target: policy.target_for(&source),
            source,
        };
        if queue.send(record).await.is_err() {
            // The conversion stage only goes away when the batch is cancelled
            return Err(PipelineError::Cancelled);
        }

        summary.accepted += 1;
        summary.bytes += written;
    }

    Ok(summary)
}

async fn persist(field: &mut Field<'_>, path: &Path) -> Result<u64, PipelineError> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut written = 0u64;

    while let Some(chunk) = field.chunk().await? {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;

    Ok(written)
}

async fn existing_names(dir: &Path) -> std::io::Result<HashSet<String>> {
    let mut names = HashSet::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        names.insert(entry.file_name().to_string_lossy().to_lowercase());
    }
    Ok(names)
}

/// Two uploads with the same name in one session must not overwrite each
/// other, so later ones get a numeric suffix: `a.HEIC`, `a-1.HEIC`, ...
fn unique_name(seen: &mut HashSet<String>, name: String) -> String {
    if seen.insert(name.to_lowercase()) {
        return name;
    }

    let path = Path::new(&name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let mut n = 1;
    loop {
        let candidate = format!("{}-{}{}", stem, n, ext);
        if seen.insert(candidate.to_lowercase()) {
            return candidate;
        }
        n += 1;
    }
}
