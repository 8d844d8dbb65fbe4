use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use utoipa::ToSchema;
use uuid::Uuid;

/// Name of the cookie carrying the session token.
pub const SESSION_COOKIE: &str = "txid";

/// Opaque per-batch token scoping storage, progress and downloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Parses a client-supplied token. Anything that is not a UUID is
    /// rejected, which also keeps it safe to use as a directory name.
    pub fn parse(raw: &str) -> Option<Self> {
        Uuid::parse_str(raw.trim())
            .ok()
            .map(|id| Self(id.simple().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-session pipeline state: `Idle → Ingesting → Converting → Complete`.
///
/// `Aborted` is reserved for session-level failures (malformed upload stream,
/// storage errors, client cancellation). Per-file conversion failures never
/// move a session there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Ingesting,
    Converting,
    Complete,
    Aborted,
}

impl PipelineState {
    pub fn is_active(self) -> bool {
        matches!(self, PipelineState::Ingesting | PipelineState::Converting)
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub token: SessionToken,
    pub dir: PathBuf,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub state: PipelineState,
}

/// In-process index of issued sessions.
pub struct SessionRegistry {
    root: PathBuf,
    sessions: DashMap<SessionToken, Session>,
}

impl SessionRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sessions: DashMap::new(),
        }
    }

    /// Every session owns `root/<token>`; there is no shared directory.
    pub fn dir_for(&self, token: &SessionToken) -> PathBuf {
        self.root.join(token.as_str())
    }

    pub fn issue(&self) -> Session {
        let token = SessionToken::generate();
        let now = Utc::now();
        let session = Session {
            dir: self.dir_for(&token),
            token: token.clone(),
            created_at: now,
            updated_at: now,
            state: PipelineState::Idle,
        };
        self.sessions.insert(token, session.clone());
        tracing::debug!(session = %session.token, "Issued session");
        session
    }

    pub fn get(&self, token: &SessionToken) -> Option<Session> {
        self.sessions.get(token).map(|s| s.clone())
    }

    pub fn contains(&self, token: &SessionToken) -> bool {
        self.sessions.contains_key(token)
    }

    /// Returns the existing session for `token`, or issues a fresh one when
    /// the token is absent or unknown.
    pub fn resolve_or_issue(&self, token: Option<&SessionToken>) -> Session {
        token
            .and_then(|t| self.get(t))
            .unwrap_or_else(|| self.issue())
    }

    pub fn set_state(&self, token: &SessionToken, state: PipelineState) {
        if let Some(mut session) = self.sessions.get_mut(token) {
            tracing::debug!(session = %token, from = ?session.state, to = ?state, "Pipeline state change");
            session.state = state;
            session.updated_at = Utc::now();
        }
    }

    /// Moves an idle or finished session into `Ingesting`. Returns false
    /// when a batch is already running for this session.
    pub fn begin(&self, token: &SessionToken) -> bool {
        match self.sessions.get_mut(token) {
            Some(mut session) if !session.state.is_active() => {
                session.state = PipelineState::Ingesting;
                session.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    /// Sessions untouched for longer than `ttl` that are not mid-pipeline.
    pub fn expired(&self, ttl: Duration) -> Vec<Session> {
        let Some(cutoff) = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_sub_signed(ttl))
        else {
            return Vec::new();
        };
        self.sessions
            .iter()
            .filter(|s| !s.state.is_active() && s.updated_at <= cutoff)
            .map(|s| s.clone())
            .collect()
    }

    pub fn remove(&self, token: &SessionToken) -> Option<Session> {
        self.sessions.remove(token).map(|(_, s)| s)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
