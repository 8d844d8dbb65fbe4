use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use zip::CompressionMethod;
use zip::write::FileOptions;

use crate::utils::validation::FilePolicy;

/// Name the browser saves the archive under.
pub const ARCHIVE_NAME: &str = "jpegs.zip";

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("no converted files to package")]
    Empty,

    #[error("failed to read session storage: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to write archive: {0}")]
    Zip(#[from] zip::result::ZipError),
}

/// Builds a deflate-compressed zip of every regular, non-source file in a
/// session directory.
///
/// Nothing is cached: each call re-reads the directory. Entries are added in
/// file-name order so the same directory always yields the same entry list.
pub struct ArchiveAssembler {
    policy: FilePolicy,
}

impl ArchiveAssembler {
    pub fn new(policy: FilePolicy) -> Self {
        Self { policy }
    }

    /// Files that would go into the archive, sorted by name.
    pub fn eligible_files(&self, dir: &Path) -> Result<Vec<PathBuf>, ArchiveError> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            // Session issued but nothing uploaded yet
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let path = entry.path();
            if self.policy.is_source(&path) {
                continue;
            }
            files.push(path);
        }
        files.sort();
        Ok(files)
    }

    pub fn build(&self, dir: &Path) -> Result<Vec<u8>, ArchiveError> {
        let files = self.eligible_files(dir)?;
        if files.is_empty() {
            return Err(ArchiveError::Empty);
        }

        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

        for path in &files {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            writer.start_file(name, options)?;
            let mut file = std::fs::File::open(path)?;
            std::io::copy(&mut file, &mut writer)?;
        }
        writer.flush()?;

        let bytes = writer.finish()?.into_inner();
        tracing::info!(
            "📦 Packaged {} file(s) from {} ({} bytes)",
            files.len(),
            dir.display(),
            bytes.len()
        );
        Ok(bytes)
    }

    /// [`build`](Self::build) on the blocking pool.
    pub async fn build_async(&self, dir: PathBuf) -> Result<Vec<u8>, ArchiveError> {
        let assembler = Self::new(self.policy.clone());
        tokio::task::spawn_blocking(move || assembler.build(&dir))
            .await
            .map_err(|e| ArchiveError::Io(std::io::Error::other(e)))?
    }
}
