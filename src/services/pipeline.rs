use axum::extract::Multipart;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

use crate::services::conversion::{ConversionReport, ConversionStage};
use crate::services::converter::Converter;
use crate::services::ingest::{IngestSummary, ingest};
use crate::services::progress::{ABORTED_FIELD, COMPLETE_FIELD, ProgressStore};
use crate::services::session::{PipelineState, Session, SessionRegistry, SessionToken};
use crate::utils::validation::FilePolicy;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("malformed upload stream: {0}")]
    Transport(String),

    #[error("upload too large: {0}")]
    PayloadTooLarge(String),

    #[error("session storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("a batch is already running for this session")]
    Busy,

    #[error("upload cancelled")]
    Cancelled,

    #[error("conversion task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PipelineSummary {
    pub session: String,
    pub ingested: usize,
    pub skipped: usize,
    pub converted: usize,
    pub failed: usize,
    pub state: PipelineState,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub policy: FilePolicy,
    pub queue_capacity: usize,
    pub conversion_concurrency: usize,
    pub session_ttl: Duration,
}

/// Wires ingestion into conversion for one upload request.
///
/// The conversion stage is spawned first and consumes records while the
/// upload is still streaming. The session only moves to `Converting` once
/// ingestion has closed the queue, and to `Complete` once the conversion
/// stage has drained it and written the `complete` flag.
pub struct Pipeline {
    registry: Arc<SessionRegistry>,
    store: Arc<dyn ProgressStore>,
    converter: Arc<dyn Converter>,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        registry: Arc<SessionRegistry>,
        store: Arc<dyn ProgressStore>,
        converter: Arc<dyn Converter>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            registry,
            store,
            converter,
            settings,
        }
    }

    pub async fn run(
        &self,
        session: &Session,
        multipart: Multipart,
        cancel: CancellationToken,
    ) -> Result<PipelineSummary, PipelineError> {
        let token = session.token.as_str().to_string();
        if !self.registry.begin(&session.token) {
            return Err(PipelineError::Busy);
        }
        tracing::info!(session = %token, "🚚 Batch started");
        let mut batch = BatchGuard::new(self.registry.clone(), self.store.clone(), &session.token);

        if let Err(e) = self.open_progress_record(&token).await {
            tracing::warn!(session = %token, "Failed to initialise progress record: {:?}", e);
        }

        let (tx, rx) = mpsc::channel(self.settings.queue_capacity.max(1));
        let stage = ConversionStage::new(
            self.converter.clone(),
            self.store.clone(),
            self.settings.conversion_concurrency,
        );
        let conversion = {
            let token = token.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { stage.run(&token, rx, cancel).await })
        };

        let ingested = ingest(multipart, &session.dir, &self.settings.policy, tx, &cancel).await;

        let ingested: IngestSummary = match ingested {
            Ok(summary) => summary,
            Err(e) => {
                cancel.cancel();
                let _ = conversion.await;
                self.abort(session, &e).await;
                batch.disarm();
                return Err(e);
            }
        };

        // Barrier: every record is queued and the queue is closed
        self.registry
            .set_state(&session.token, PipelineState::Converting);
        tracing::info!(
            session = %token,
            accepted = ingested.accepted,
            skipped = ingested.skipped,
            "Ingestion finished"
        );

        let report: ConversionReport = match conversion.await {
            Ok(report) => report,
            Err(e) => {
                let err = PipelineError::Task(e.to_string());
                self.abort(session, &err).await;
                batch.disarm();
                return Err(err);
            }
        };
        if report.cancelled {
            let err = PipelineError::Cancelled;
            self.abort(session, &err).await;
            batch.disarm();
            return Err(err);
        }

        self.registry
            .set_state(&session.token, PipelineState::Complete);
        batch.disarm();

        Ok(PipelineSummary {
            session: token,
            ingested: ingested.accepted,
            skipped: ingested.skipped,
            converted: report.converted,
            failed: report.failed,
            state: PipelineState::Complete,
        })
    }

    /// Starts the batch from an empty record so flags left by an earlier
    /// batch of the same session do not leak into this one.
    async fn open_progress_record(&self, token: &str) -> anyhow::Result<()> {
        self.store.remove(token).await?;
        self.store
            .set_fields(token, &[(COMPLETE_FIELD.to_string(), false)])
            .await?;
        self.store.expire(token, self.settings.session_ttl).await
    }

    async fn abort(&self, session: &Session, cause: &PipelineError) {
        tracing::warn!(session = %session.token, "🛑 Batch aborted: {}", cause);
        self.registry
            .set_state(&session.token, PipelineState::Aborted);
        if let Err(e) = self
            .store
            .set_fields(
                session.token.as_str(),
                &[(ABORTED_FIELD.to_string(), true)],
            )
            .await
        {
            tracing::error!(session = %session.token, "Failed to mark batch aborted: {:?}", e);
        }
    }
}

/// Marks the session aborted if [`Pipeline::run`] is dropped before it
/// reaches a terminal state, which is what happens when the client
/// disconnects mid-batch and axum drops the handler future.
struct BatchGuard {
    registry: Arc<SessionRegistry>,
    store: Arc<dyn ProgressStore>,
    token: SessionToken,
    armed: bool,
}

impl BatchGuard {
    fn new(
        registry: Arc<SessionRegistry>,
        store: Arc<dyn ProgressStore>,
        token: &SessionToken,
    ) -> Self {
        Self {
            registry,
            store,
            token: token.clone(),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::warn!(session = %self.token, "🛑 Batch dropped before it finished");
        self.registry
            .set_state(&self.token, PipelineState::Aborted);

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = self.store.clone();
        let token = self.token.clone();
        handle.spawn(async move {
            if let Err(e) = store
                .set_fields(token.as_str(), &[(ABORTED_FIELD.to_string(), true)])
                .await
            {
                tracing::error!(session = %token, "Failed to mark batch aborted: {:?}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::converter::ConvertError;
    use crate::services::progress::{MemoryProgressStore, snapshot};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::extract::FromRequest;
    use axum::http::Request;
    use std::path::Path;
    use tempfile::TempDir;

    const BOUNDARY: &str = "----pipeline-test";

    struct CopyConverter;

    #[async_trait]
    impl Converter for CopyConverter {
        async fn convert(&self, source: &Path, target: &Path) -> Result<(), ConvertError> {
            tokio::fs::copy(source, target)
                .await
                .map(|_| ())
                .map_err(|e| ConvertError::Failed {
                    status: "copy".to_string(),
                    stderr: e.to_string(),
                })
        }
    }

    struct SlowConverter(Duration);

    #[async_trait]
    impl Converter for SlowConverter {
        async fn convert(&self, source: &Path, target: &Path) -> Result<(), ConvertError> {
            tokio::time::sleep(self.0).await;
            CopyConverter.convert(source, target).await
        }
    }

    async fn multipart(files: &[&str], terminated: bool) -> Multipart {
        let mut body = String::new();
        for name in files {
            body.push_str(&format!(
                "--{BOUNDARY}\r\n\
                Content-Disposition: form-data; name=\"uploadfile\"; filename=\"{name}\"\r\n\r\n\
                data-{name}\r\n"
            ));
        }
        if terminated {
            body.push_str(&format!("--{BOUNDARY}--\r\n"));
        }
        let req = Request::builder()
            .method("POST")
            .header(
                "Content-Type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap();
        Multipart::from_request(req, &()).await.unwrap()
    }

    fn pipeline(root: &Path) -> (Pipeline, Arc<SessionRegistry>, Arc<MemoryProgressStore>) {
        pipeline_with(root, Arc::new(CopyConverter))
    }

    fn pipeline_with(
        root: &Path,
        converter: Arc<dyn Converter>,
    ) -> (Pipeline, Arc<SessionRegistry>, Arc<MemoryProgressStore>) {
        let registry = Arc::new(SessionRegistry::new(root));
        let store = Arc::new(MemoryProgressStore::new());
        let pipeline = Pipeline::new(
            registry.clone(),
            store.clone(),
            converter,
            PipelineSettings {
                policy: FilePolicy::new("uploadfile", "HEIC", "jpg"),
                queue_capacity: 1,
                conversion_concurrency: 1,
                session_ttl: Duration::from_secs(600),
            },
        );
        (pipeline, registry, store)
    }

    #[tokio::test]
    async fn test_run_reaches_complete() {
        let root = TempDir::new().unwrap();
        let (pipeline, registry, store) = pipeline(root.path());
        let session = registry.issue();

        let summary = pipeline
            .run(
                &session,
                multipart(&["a.HEIC", "b.HEIC", "c.HEIC", "notes.txt"], true).await,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(summary.ingested, 3);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.converted, 3);
        assert_eq!(summary.state, PipelineState::Complete);
        assert_eq!(
            registry.get(&session.token).unwrap().state,
            PipelineState::Complete
        );

        let snap = snapshot(store.as_ref(), session.token.as_str()).await.unwrap();
        assert_eq!(snap.len(), 4);
        assert_eq!(snap[COMPLETE_FIELD], true);
        assert!(!snap.contains_key(ABORTED_FIELD));
        assert_eq!(snap["a.jpg"], true);
        assert_eq!(snap["c.jpg"], true);
        assert!(session.dir.join("b.jpg").exists());
    }

    #[tokio::test]
    async fn test_transport_failure_aborts_only_this_session() {
        let root = TempDir::new().unwrap();
        let (pipeline, registry, store) = pipeline(root.path());
        let session = registry.issue();

        let err = pipeline
            .run(
                &session,
                multipart(&["a.HEIC"], false).await,
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Transport(_)));
        assert_eq!(
            registry.get(&session.token).unwrap().state,
            PipelineState::Aborted
        );

        let snap = snapshot(store.as_ref(), session.token.as_str()).await.unwrap();
        assert_eq!(snap[ABORTED_FIELD], true);
        assert_eq!(snap[COMPLETE_FIELD], false);

        // The service keeps working for other sessions
        let other = registry.issue();
        let summary = pipeline
            .run(
                &other,
                multipart(&["x.HEIC"], true).await,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(summary.converted, 1);
    }

    #[tokio::test]
    async fn test_busy_session_is_rejected() {
        let root = TempDir::new().unwrap();
        let (pipeline, registry, _store) = pipeline(root.path());
        let session = registry.issue();
        registry.set_state(&session.token, PipelineState::Converting);

        let err = pipeline
            .run(
                &session,
                multipart(&["a.HEIC"], true).await,
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Busy));
    }

    #[tokio::test]
    async fn test_cancelled_run_is_aborted() {
        let root = TempDir::new().unwrap();
        let (pipeline, registry, store) = pipeline(root.path());
        let session = registry.issue();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = pipeline
            .run(&session, multipart(&["a.HEIC"], true).await, cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));

        let snap = snapshot(store.as_ref(), session.token.as_str()).await.unwrap();
        assert_eq!(snap.get(COMPLETE_FIELD), Some(&false));
    }

    #[tokio::test]
    async fn test_new_batch_starts_from_clean_progress_record() {
        let root = TempDir::new().unwrap();
        let (pipeline, registry, store) = pipeline(root.path());
        let session = registry.issue();

        pipeline
            .run(
                &session,
                multipart(&["a.HEIC"], false).await,
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        let snap = snapshot(store.as_ref(), session.token.as_str()).await.unwrap();
        assert_eq!(snap[ABORTED_FIELD], true);

        pipeline
            .run(
                &session,
                multipart(&["b.HEIC"], true).await,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let snap = snapshot(store.as_ref(), session.token.as_str()).await.unwrap();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap["b.jpg"], true);
        assert_eq!(snap[COMPLETE_FIELD], true);
        assert!(!snap.contains_key(ABORTED_FIELD));
    }

    #[tokio::test]
    async fn test_dropped_run_leaves_session_aborted_and_reusable() {
        let root = TempDir::new().unwrap();
        let (pipeline, registry, store) = pipeline_with(
            root.path(),
            Arc::new(SlowConverter(Duration::from_millis(500))),
        );
        let pipeline = Arc::new(pipeline);
        let session = registry.issue();

        // Same shape as the upload handler: the token is cancelled when the
        // request future goes away
        let handle = {
            let pipeline = pipeline.clone();
            let session = session.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                let _guard = cancel.clone().drop_guard();
                pipeline
                    .run(&session, multipart(&["a.HEIC"], true).await, cancel)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.get(&session.token).unwrap().state.is_active());

        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());

        assert_eq!(
            registry.get(&session.token).unwrap().state,
            PipelineState::Aborted
        );

        let mut aborted = false;
        for _ in 0..50 {
            let snap = snapshot(store.as_ref(), session.token.as_str()).await.unwrap();
            if snap.get(ABORTED_FIELD) == Some(&true) {
                assert_ne!(snap.get(COMPLETE_FIELD), Some(&true));
                aborted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(aborted);

        // Sweepable, and a new batch can start
        let expired = registry.expired(Duration::ZERO);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].token, session.token);
        assert!(registry.begin(&session.token));
    }
}
