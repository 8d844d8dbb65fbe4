use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::services::converter::Converter;
use crate::services::ingest::IngestionRecord;
use crate::services::progress::{COMPLETE_FIELD, ProgressStore};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConversionReport {
    pub converted: usize,
    pub failed: usize,
    pub cancelled: bool,
}

impl ConversionReport {
    pub fn processed(&self) -> usize {
        self.converted + self.failed
    }
}

enum Outcome {
    Converted,
    Failed,
}

/// Drains the ingestion queue, runs the converter per record and writes one
/// progress field per record (`true` on success, `false` on failure).
///
/// A failing file never stops the batch. Once the queue is closed and
/// drained the session's `complete` flag is written; a cancelled stage
/// leaves it unset.
pub struct ConversionStage {
    converter: Arc<dyn Converter>,
    store: Arc<dyn ProgressStore>,
    concurrency: usize,
}

impl ConversionStage {
    pub fn new(
        converter: Arc<dyn Converter>,
        store: Arc<dyn ProgressStore>,
        concurrency: usize,
    ) -> Self {
        Self {
            converter,
            store,
            concurrency: concurrency.max(1),
        }
    }

    pub async fn run(
        &self,
        session: &str,
        queue: mpsc::Receiver<IngestionRecord>,
        cancel: CancellationToken,
    ) -> ConversionReport {
        let records = futures::stream::unfold(queue, |mut queue| async move {
            queue.recv().await.map(|record| (record, queue))
        });

        // With concurrency 1 records are converted strictly in arrival order
        let outcomes: Vec<Option<Outcome>> = records
            .take_until(cancel.cancelled())
            .map(|record| self.process(session, record, &cancel))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = ConversionReport::default();
        for outcome in outcomes {
            match outcome {
                Some(Outcome::Converted) => report.converted += 1,
                Some(Outcome::Failed) => report.failed += 1,
                None => report.cancelled = true,
            }
        }

        if cancel.is_cancelled() {
            report.cancelled = true;
            tracing::warn!(
                session,
                processed = report.processed(),
                "Conversion cancelled before the queue drained"
            );
            return report;
        }

        if let Err(e) = self
            .store
            .set_fields(session, &[(COMPLETE_FIELD.to_string(), true)])
            .await
        {
            tracing::error!(session, "Failed to mark batch complete: {:?}", e);
        }

        tracing::info!(
            session,
            converted = report.converted,
            failed = report.failed,
            "✅ Batch conversion complete"
        );
        report
    }

    async fn process(
        &self,
        session: &str,
        record: IngestionRecord,
        cancel: &CancellationToken,
    ) -> Option<Outcome> {
        tracing::info!(
            session,
            "Converting {} to {}",
            record.source.display(),
            record.target.display()
        );

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                // Dropping the converter future kills the child process
                discard_partial_output(&record).await;
                return None;
            }
            result = self.converter.convert(&record.source, &record.target) => result,
        };

        let succeeded = match result {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(session, "❌ Conversion failed for {}: {}", record.source.display(), e);
                discard_partial_output(&record).await;
                false
            }
        };

        if let Err(e) = self
            .store
            .set_fields(session, &[(record.progress_field(), succeeded)])
            .await
        {
            tracing::error!(session, "Failed to record progress for {}: {:?}", record.progress_field(), e);
        }

        Some(if succeeded {
            Outcome::Converted
        } else {
            Outcome::Failed
        })
    }
}

async fn discard_partial_output(record: &IngestionRecord) {
    match tokio::fs::remove_file(&record.target).await {
        Ok(()) => tracing::debug!("Removed partial output {}", record.target.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove partial output {}: {}", record.target.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::converter::ConvertError;
    use crate::services::progress::{MemoryProgressStore, snapshot};
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Copies source to target, except for sources whose name starts with `bad`.
    struct ScriptedConverter {
        calls: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl Converter for ScriptedConverter {
        async fn convert(&self, source: &Path, target: &Path) -> Result<(), ConvertError> {
            self.calls.lock().unwrap().push(source.to_path_buf());
            let name = source.file_name().unwrap().to_string_lossy();
            if name.starts_with("bad") {
                tokio::fs::write(target, b"partial").await.unwrap();
                return Err(ConvertError::Failed {
                    status: "exit status: 1".to_string(),
                    stderr: "unsupported".to_string(),
                });
            }
            tokio::fs::copy(source, target).await.unwrap();
            Ok(())
        }
    }

    /// Never finishes on its own.
    struct StuckConverter;

    #[async_trait]
    impl Converter for StuckConverter {
        async fn convert(&self, _source: &Path, _target: &Path) -> Result<(), ConvertError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    async fn record(dir: &Path, stem: &str) -> IngestionRecord {
        let source = dir.join(format!("{stem}.HEIC"));
        tokio::fs::write(&source, stem.as_bytes()).await.unwrap();
        IngestionRecord {
            target: dir.join(format!("{stem}.jpg")),
            source,
        }
    }

    #[tokio::test]
    async fn test_every_record_gets_one_field_and_complete_is_set() {
        let dir = TempDir::new().unwrap();
        let converter = Arc::new(ScriptedConverter {
            calls: Mutex::new(Vec::new()),
        });
        let store = Arc::new(MemoryProgressStore::new());
        let stage = ConversionStage::new(converter.clone(), store.clone(), 1);

        let (tx, rx) = mpsc::channel(8);
        for stem in ["a", "bad", "c"] {
            tx.send(record(dir.path(), stem).await).await.unwrap();
        }
        drop(tx);

        let report = stage.run("s1", rx, CancellationToken::new()).await;
        assert_eq!(
            report,
            ConversionReport {
                converted: 2,
                failed: 1,
                cancelled: false
            }
        );

        let snap = snapshot(store.as_ref(), "s1").await.unwrap();
        assert_eq!(snap.len(), 4);
        assert_eq!(snap["a.jpg"], true);
        assert_eq!(snap["bad.jpg"], false);
        assert_eq!(snap["c.jpg"], true);
        assert_eq!(snap[COMPLETE_FIELD], true);

        // Arrival order, and no partial output for the failed file
        let calls = converter.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                dir.path().join("a.HEIC"),
                dir.path().join("bad.HEIC"),
                dir.path().join("c.HEIC")
            ]
        );
        assert!(!dir.path().join("bad.jpg").exists());
    }

    #[tokio::test]
    async fn test_empty_queue_still_completes() {
        let store = Arc::new(MemoryProgressStore::new());
        let stage = ConversionStage::new(Arc::new(StuckConverter), store.clone(), 1);
        let (tx, rx) = mpsc::channel::<IngestionRecord>(1);
        drop(tx);

        let report = stage.run("s1", rx, CancellationToken::new()).await;
        assert_eq!(report.processed(), 0);

        let snap = snapshot(store.as_ref(), "s1").await.unwrap();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[COMPLETE_FIELD], true);
    }

    #[tokio::test]
    async fn test_concurrent_conversion_counts_every_record() {
        let dir = TempDir::new().unwrap();
        let converter = Arc::new(ScriptedConverter {
            calls: Mutex::new(Vec::new()),
        });
        let store = Arc::new(MemoryProgressStore::new());
        let stage = ConversionStage::new(converter, store.clone(), 4);

        let (tx, rx) = mpsc::channel(16);
        for i in 0..10 {
            tx.send(record(dir.path(), &format!("img{i}")).await)
                .await
                .unwrap();
        }
        drop(tx);

        let report = stage.run("s1", rx, CancellationToken::new()).await;
        assert_eq!(report.converted, 10);

        let snap = snapshot(store.as_ref(), "s1").await.unwrap();
        assert_eq!(snap.len(), 11);
        assert!(snap.values().all(|done| *done));
    }

    #[tokio::test]
    async fn test_cancellation_abandons_in_flight_work() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryProgressStore::new());
        let stage = ConversionStage::new(Arc::new(StuckConverter), store.clone(), 1);

        let (tx, rx) = mpsc::channel(8);
        tx.send(record(dir.path(), "a").await).await.unwrap();

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let report = stage.run("s1", rx, cancel).await;
        assert!(report.cancelled);
        assert_eq!(report.processed(), 0);
        assert!(snapshot(store.as_ref(), "s1").await.unwrap().is_empty());
        drop(tx);
    }
}
