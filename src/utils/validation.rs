use anyhow::{Result, anyhow};
use std::path::{Path, PathBuf};

use crate::config::ConvertConfig;

/// Longest file name most filesystems accept, in bytes.
pub const MAX_FILENAME_LEN: usize = 255;

/// Room kept for the `-N` suffix given to duplicate names.
const DUPLICATE_SUFFIX_RESERVE: usize = 8;

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Which uploads are accepted and what their converted outputs are called.
///
/// Extensions are compared ASCII case-insensitively, so `IMG_01.heic` and
/// `IMG_01.HEIC` are both source files.
#[derive(Debug, Clone)]
pub struct FilePolicy {
    pub upload_field: String,
    pub source_extension: String,
    pub target_extension: String,
}

impl FilePolicy {
    pub fn new(
        upload_field: impl Into<String>,
        source_extension: impl Into<String>,
        target_extension: impl Into<String>,
    ) -> Self {
        Self {
            upload_field: upload_field.into(),
            source_extension: source_extension.into(),
            target_extension: target_extension.into(),
        }
    }

    pub fn from_config(config: &ConvertConfig) -> Self {
        Self::new(
            config.upload_field.clone(),
            config.source_extension.clone(),
            config.target_extension.clone(),
        )
    }

    /// A multipart part is eligible when it arrives on the upload field and
    /// its filename carries the source extension.
    pub fn accepts(&self, field_name: Option<&str>, file_name: Option<&str>) -> bool {
        field_name == Some(self.upload_field.as_str())
            && file_name.is_some_and(|name| self.is_source(Path::new(name)))
    }

    pub fn is_source(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(&self.source_extension))
    }

    /// Same base name, target extension.
    pub fn target_for(&self, source: &Path) -> PathBuf {
        source.with_extension(&self.target_extension)
    }

    /// Longest stored upload name for which both a de-duplicated name and
    /// its converted output still fit in [`MAX_FILENAME_LEN`].
    pub fn max_source_name_len(&self) -> usize {
        let growth = self
            .target_extension
            .len()
            .saturating_sub(self.source_extension.len());
        MAX_FILENAME_LEN - DUPLICATE_SUFFIX_RESERVE - growth.min(MAX_FILENAME_LEN / 2)
    }
}

/// Sanitizes an uploaded filename so it can only ever name a file directly
/// inside the session directory.
pub fn sanitize_filename(filename: &str) -> Result<String> {
    sanitize_filename_within(filename, MAX_FILENAME_LEN)
}

/// [`sanitize_filename`] with a byte limit. Over-long names lose the end of
/// their stem, never their extension.
pub fn sanitize_filename_within(filename: &str, max_len: usize) -> Result<String> {
    // Browsers on Windows may send full client paths
    let name = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("")
        .trim();

    if filename.contains("..") || filename.contains('/') || filename.contains('\\') {
        tracing::warn!("Path traversal attempt detected: {}", filename);
    }

    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_control()
                || c == ':'
                || c == '*'
                || c == '?'
                || c == '"'
                || c == '<'
                || c == '>'
                || c == '|'
                || c == ';'
            {
                '_'
            } else {
                c
            }
        })
        .collect();

    let sanitized = truncate_keeping_extension(sanitized, max_len);

    if sanitized.is_empty() || sanitized == "." || sanitized == ".." {
        return Err(anyhow!(ValidationError {
            code: "INVALID_FILENAME",
            message: "Filename cannot be empty".to_string(),
        }));
    }

    if sanitized.starts_with('.') {
        return Err(anyhow!(ValidationError {
            code: "HIDDEN_FILE",
            message: "Hidden files (starting with '.') are not allowed".to_string(),
        }));
    }

    Ok(sanitized)
}

fn truncate_keeping_extension(name: String, max_len: usize) -> String {
    if name.len() <= max_len {
        return name;
    }

    let (stem, ext) = match name.rfind('.') {
        Some(dot) if dot > 0 && name.len() - dot < max_len => name.split_at(dot),
        _ => (name.as_str(), ""),
    };

    // Limit length safely for UTF-8
    let mut end = max_len - ext.len();
    while !stem.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &stem[..end], ext)
}
