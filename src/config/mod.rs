use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration for the conversion service
#[derive(Debug, Clone)]
pub struct ConvertConfig {
    /// Root directory holding one sub-directory per session
    pub storage_root: PathBuf,

    /// External converter executable, invoked as `<converter> <source> <target>`
    pub converter_path: PathBuf,

    /// Per-file converter timeout in seconds, 0 disables it (default: 300)
    pub converter_timeout_secs: u64,

    /// Multipart field carrying the uploaded files (default: "uploadfile")
    pub upload_field: String,

    /// Accepted source extension, without the dot (default: "HEIC")
    pub source_extension: String,

    /// Extension given to converted outputs (default: "jpg")
    pub target_extension: String,

    /// Session cookie lifetime and storage retention in seconds (default: 600)
    pub session_ttl_secs: u64,

    /// Progress notifier poll interval in milliseconds (default: 100)
    pub poll_interval_ms: u64,

    /// Capacity of the ingestion queue (default: 32)
    pub queue_capacity: usize,

    /// Number of files converted at once (default: 1)
    pub conversion_concurrency: usize,

    /// Maximum request body size in bytes (default: 512 MB)
    pub max_upload_size: usize,

    /// Redis URL for the progress store; in-memory store when unset
    pub redis_url: Option<String>,

    /// How often expired sessions are swept, in seconds (default: 60)
    pub sweep_interval_secs: u64,

    /// Mark the session cookie `Secure`
    pub secure_cookie: bool,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            storage_root: env::temp_dir().join("imgconvert"),
            converter_path: PathBuf::from("tifig"),
            converter_timeout_secs: 300,
            upload_field: "uploadfile".to_string(),
            source_extension: "HEIC".to_string(),
            target_extension: "jpg".to_string(),
            session_ttl_secs: 600,
            poll_interval_ms: 100,
            queue_capacity: 32,
            conversion_concurrency: 1,
            max_upload_size: 512 * 1024 * 1024, // 512 MB
            redis_url: None,
            sweep_interval_secs: 60,
            secure_cookie: false,
        }
    }
}

impl ConvertConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            storage_root: env::var("STORAGE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(default.storage_root),

            converter_path: env::var("CONVERTER_PATH")
                .map(PathBuf::from)
                .unwrap_or(default.converter_path),

            converter_timeout_secs: parse_var("CONVERTER_TIMEOUT_SECS")
                .unwrap_or(default.converter_timeout_secs),

            upload_field: env::var("UPLOAD_FIELD").unwrap_or(default.upload_field),

            source_extension: env::var("SOURCE_EXTENSION")
                .map(|v| v.trim_start_matches('.').to_string())
                .unwrap_or(default.source_extension),

            target_extension: env::var("TARGET_EXTENSION")
                .map(|v| v.trim_start_matches('.').to_string())
                .unwrap_or(default.target_extension),

            session_ttl_secs: parse_var("SESSION_TTL_SECS").unwrap_or(default.session_ttl_secs),

            poll_interval_ms: parse_var("POLL_INTERVAL_MS")
                .filter(|v| *v > 0)
                .unwrap_or(default.poll_interval_ms),

            queue_capacity: parse_var("QUEUE_CAPACITY")
                .filter(|v| *v > 0)
                .unwrap_or(default.queue_capacity),

            conversion_concurrency: parse_var("CONVERSION_CONCURRENCY")
                .filter(|v| *v > 0)
                .unwrap_or(default.conversion_concurrency),

            max_upload_size: parse_var("MAX_UPLOAD_SIZE").unwrap_or(default.max_upload_size),

            redis_url: env::var("REDIS_URL").ok().filter(|v| !v.trim().is_empty()),

            sweep_interval_secs: parse_var("SWEEP_INTERVAL_SECS")
                .filter(|v| *v > 0)
                .unwrap_or(default.sweep_interval_secs),

            secure_cookie: env::var("SECURE_COOKIE")
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(default.secure_cookie),
        }
    }

    /// Create config for local development (fast polling, short retention)
    pub fn development() -> Self {
        Self {
            converter_timeout_secs: 60,
            session_ttl_secs: 300,
            sweep_interval_secs: 30,
            ..Self::default()
        }
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn converter_timeout(&self) -> Option<Duration> {
        (self.converter_timeout_secs > 0).then(|| Duration::from_secs(self.converter_timeout_secs))
    }
}

fn parse_var<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}
