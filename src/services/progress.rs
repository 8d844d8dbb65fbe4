use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// Field set once every ingestion record of a batch has been processed.
pub const COMPLETE_FIELD: &str = "complete";

/// Field set when a batch was abandoned (bad upload stream, storage error, cancel).
pub const ABORTED_FIELD: &str = "aborted";

/// Client-facing view of a progress record: output name → finished flag,
/// plus the `complete` / `aborted` markers.
pub type ProgressSnapshot = BTreeMap<String, bool>;

/// Key-value collaborator holding per-session progress records.
///
/// The pipeline never locks progress state itself; writes are independent
/// `set_fields` calls and readers poll `get_all`.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Set several fields of a named record, creating it if needed
    async fn set_fields(&self, key: &str, fields: &[(String, bool)]) -> Result<()>;

    /// All fields of a named record, empty when the record does not exist
    async fn get_all(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Drop the record after `ttl`
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;

    /// Check the store is reachable
    async fn ping(&self) -> Result<()>;

    fn backend(&self) -> &'static str;
}

pub fn encode_flag(flag: bool) -> &'static str {
    if flag { "true" } else { "false" }
}

/// Redis clients commonly write booleans as `1`/`0`, so both spellings decode.
pub fn decode_flag(raw: &str) -> bool {
    matches!(raw.trim(), "true" | "1")
}

pub async fn snapshot(store: &dyn ProgressStore, key: &str) -> Result<ProgressSnapshot> {
    Ok(store
        .get_all(key)
        .await?
        .into_iter()
        .map(|(field, value)| {
            let flag = decode_flag(&value);
            (field, flag)
        })
        .collect())
}

struct MemoryRecord {
    fields: HashMap<String, String>,
    expires_at: Option<Instant>,
}

impl MemoryRecord {
    fn is_live(&self) -> bool {
        self.expires_at.is_none_or(|at| Instant::now() < at)
    }
}

/// Single-process progress store used when no Redis URL is configured.
#[derive(Default)]
pub struct MemoryProgressStore {
    records: DashMap<String, MemoryRecord>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProgressStore for MemoryProgressStore {
    async fn set_fields(&self, key: &str, fields: &[(String, bool)]) -> Result<()> {
        let mut record = self
            .records
            .entry(key.to_string())
            .or_insert_with(|| MemoryRecord {
                fields: HashMap::new(),
                expires_at: None,
            });
        if !record.is_live() {
            record.fields.clear();
            record.expires_at = None;
        }
        for (field, flag) in fields {
            record
                .fields
                .insert(field.clone(), encode_flag(*flag).to_string());
        }
        Ok(())
    }

    async fn get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self
            .records
            .get(key)
            .filter(|r| r.is_live())
            .map(|r| r.fields.clone())
            .unwrap_or_default())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        if let Some(mut record) = self.records.get_mut(key) {
            record.expires_at = Instant::now().checked_add(ttl);
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.records.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

/// Redis-backed store. One multiplexed, auto-reconnecting connection is
/// opened at startup and shared by every request.
pub struct RedisProgressStore {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisProgressStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            prefix: "imgconvert:progress:".to_string(),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl ProgressStore for RedisProgressStore {
    async fn set_fields(&self, key: &str, fields: &[(String, bool)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let items: Vec<(&str, &str)> = fields
            .iter()
            .map(|(field, flag)| (field.as_str(), encode_flag(*flag)))
            .collect();
        let mut conn = self.conn.clone();
        conn.hset_multiple::<_, _, _, ()>(self.key(key), &items)
            .await?;
        Ok(())
    }

    async fn get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(self.key(key)).await?;
        Ok(fields)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX).max(1);
        conn.expire::<_, ()>(self.key(key), secs).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(self.key(key)).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
