//! Moves a completed upload into permanent storage.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::error::{TusError, TusResult};
use crate::filesystem::{
    file_store::{sanitize_file_name, FileStore},
    session::{SessionState, UploadSession},
    session_store::SessionGuard,
};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Where a finalized upload ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermanentArtifact {
    pub id: String,
    pub content_type: String,
    pub length: u64,
    pub last_modified: DateTime<Utc>,
}

impl PermanentArtifact {
    fn from_session(session: &UploadSession, id: String) -> Self {
        let content_type = session
            .metadata
            .content_type()
            .map(str::to_string)
            .unwrap_or_else(|| {
                mime_guess::from_path(&id)
                    .first_raw()
                    .unwrap_or(DEFAULT_CONTENT_TYPE)
                    .to_string()
            });

        Self {
            id,
            content_type,
            length: session.declared_length,
            last_modified: session.last_activity_at,
        }
    }
}

pub struct FinalizePipeline<S> {
    file_store: Arc<S>,
}

impl<S: FileStore> FinalizePipeline<S> {
    pub fn new(file_store: Arc<S>) -> Self {
        Self { file_store }
    }

    pub fn file_store(&self) -> &Arc<S> {
        &self.file_store
    }

    /// Finalizes the locked session. Calling it again on a finalized session
    /// returns the same artifact without touching storage. A failed move leaves
    /// the session `Completed` with its temporary artifact intact.
    pub async fn finalize(&self, guard: &mut SessionGuard<'_>) -> TusResult<PermanentArtifact> {
        let session = guard.session();

        match session.state {
            SessionState::Completed => {}
            SessionState::Finalized => {
                let id = session
                    .permanent_id
                    .clone()
                    .ok_or_else(|| TusError::FinalizeFailed(format!("session {} has no permanent id", session.id)))?;
                return Ok(PermanentArtifact::from_session(&session, id));
            }
            from => {
                return Err(TusError::IllegalTransition {
                    from,
                    to: SessionState::Finalized,
                })
            }
        }

        let declared_name = session
            .metadata
            .filename()
            .and_then(sanitize_file_name)
            .unwrap_or_else(|| session.id.clone());

        let Some(temp_path) = session.temp_path.as_deref() else {
            return Err(TusError::FinalizeFailed(format!(
                "session {} has no temporary artifact",
                session.id
            )));
        };

        let id = match self.file_store.adopt(temp_path, &declared_name).await {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(session_id = %session.id, error = %e, "finalize failed, session stays completed");
                return Err(TusError::FinalizeFailed(e.to_string()));
            }
        };

        // The bytes are in permanent storage now; a failed record write only
        // delays the durable copy of the state until the next record sync.
        let finalized = match guard.mark_finalized(id.clone()).await {
            Ok(finalized) => finalized,
            Err(e) => {
                tracing::error!(
                    session_id = %session.id,
                    permanent_id = %id,
                    error = %e,
                    "artifact moved but session record could not be written"
                );
                guard.session()
            }
        };

        tracing::info!(
            session_id = %finalized.id,
            permanent_id = %id,
            length = finalized.declared_length,
            "upload finalized"
        );

        Ok(PermanentArtifact::from_session(&finalized, id))
    }

    /// Whether `bytes` at `offset` repeat the chunk that completed this
    /// finalized session, compared against the permanent artifact.
    pub async fn is_final_chunk_retry(&self, session: &UploadSession, offset: u64, bytes: &[u8]) -> bool {
        let (Some(last), Some(permanent_id)) = (session.last_chunk, session.permanent_id.as_deref()) else {
            return false;
        };

        if bytes.is_empty() || last.offset != offset || last.length != bytes.len() as u64 {
            return false;
        }

        let stored = match self.file_store.fetch(permanent_id).await {
            Ok(stored) => stored,
            Err(e) => {
                tracing::debug!(session_id = %session.id, permanent_id, error = %e, "permanent artifact unavailable for retry check");
                return false;
            }
        };

        let (Ok(start), Ok(end)) = (usize::try_from(offset), usize::try_from(offset + last.length)) else {
            return false;
        };

        stored.bytes.get(start..end) == Some(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::{
        chunk_writer::ChunkWriter, file_store::LocalFileStore, metadata::Metadata,
        session_store::SessionStore,
    };
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        sessions: SessionStore,
        pipeline: FinalizePipeline<LocalFileStore>,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let sessions = SessionStore::open(dir.path().join("tmp")).await.unwrap();
        let files = LocalFileStore::new(dir.path().join("uploads")).await.unwrap();

        Fixture {
            _dir: dir,
            sessions,
            pipeline: FinalizePipeline::new(Arc::new(files)),
        }
    }

    async fn completed_session(fx: &Fixture, metadata: Metadata, body: &[u8]) -> String {
        let session = fx.sessions.create(body.len() as i64, metadata).await.unwrap();
        let mut guard = fx.sessions.lock(&session.id).await.unwrap();
        ChunkWriter::new().write_chunk(&mut guard, 0, body).await.unwrap();
        guard.mark_state(SessionState::Completed).await.unwrap();
        session.id
    }

    #[tokio::test]
    async fn test_finalize_moves_artifact_under_declared_name() {
        let fx = fixture().await;
        let metadata: Metadata = [("filename", "report.pdf")].into_iter().collect();
        let id = completed_session(&fx, metadata, b"%PDF").await;

        let mut guard = fx.sessions.lock(&id).await.unwrap();
        let artifact = fx.pipeline.finalize(&mut guard).await.unwrap();

        assert_eq!(artifact.id, "report.pdf");
        assert_eq!(artifact.content_type, "application/pdf");
        assert_eq!(artifact.length, 4);
        assert_eq!(guard.session().state, SessionState::Finalized);
        assert!(guard.session().temp_path.is_none());
        assert!(!fx.sessions.artifact_path(&id).exists());

        let stored = fx.pipeline.file_store().fetch("report.pdf").await.unwrap();
        assert_eq!(&stored.bytes[..], b"%PDF");
    }

    #[tokio::test]
    async fn test_finalize_is_idempotent() {
        let fx = fixture().await;
        let metadata: Metadata = [("filename", "a.bin")].into_iter().collect();
        let id = completed_session(&fx, metadata, b"abc").await;

        let mut guard = fx.sessions.lock(&id).await.unwrap();
        let first = fx.pipeline.finalize(&mut guard).await.unwrap();
        let second = fx.pipeline.finalize(&mut guard).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(fx.pipeline.file_store().list_metadata().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_traversal_in_filename_is_stripped() {
        let fx = fixture().await;
        let metadata: Metadata = [("filename", "../../outside.txt")].into_iter().collect();
        let id = completed_session(&fx, metadata, b"x").await;

        let mut guard = fx.sessions.lock(&id).await.unwrap();
        let artifact = fx.pipeline.finalize(&mut guard).await.unwrap();

        assert_eq!(artifact.id, "outside.txt");
        assert!(fx.pipeline.file_store().exists("outside.txt").await);
    }

    #[tokio::test]
    async fn test_missing_filename_falls_back_to_session_id() {
        let fx = fixture().await;
        let id = completed_session(&fx, Metadata::new(), b"x").await;

        let mut guard = fx.sessions.lock(&id).await.unwrap();
        let artifact = fx.pipeline.finalize(&mut guard).await.unwrap();

        assert_eq!(artifact.id, id);
        assert_eq!(artifact.content_type, DEFAULT_CONTENT_TYPE);
    }

    #[tokio::test]
    async fn test_active_session_cannot_be_finalized() {
        let fx = fixture().await;
        let session = fx.sessions.create(10, Metadata::new()).await.unwrap();

        let mut guard = fx.sessions.lock(&session.id).await.unwrap();
        let result = fx.pipeline.finalize(&mut guard).await;

        assert!(matches!(
            result,
            Err(TusError::IllegalTransition {
                from: SessionState::Active,
                to: SessionState::Finalized
            })
        ));
    }

    #[tokio::test]
    async fn test_failed_move_keeps_session_completed() {
        let fx = fixture().await;
        let metadata: Metadata = [("filename", "a.bin")].into_iter().collect();
        let id = completed_session(&fx, metadata, b"abc").await;

        std::fs::remove_dir_all(fx.pipeline.file_store().root_path()).unwrap();

        let mut guard = fx.sessions.lock(&id).await.unwrap();
        let result = fx.pipeline.finalize(&mut guard).await;

        assert!(matches!(result, Err(TusError::FinalizeFailed(_))));
        assert_eq!(guard.session().state, SessionState::Completed);
        assert_eq!(std::fs::read(fx.sessions.artifact_path(&id)).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_unwritable_record_after_move_still_finalizes() {
        let fx = fixture().await;
        let metadata: Metadata = [("filename", "a.bin")].into_iter().collect();
        let id = completed_session(&fx, metadata, b"abc").await;

        // A directory where the staging record goes makes the record write fail.
        let staging = fx.sessions.record_path(&id).with_extension("info.tmp");
        std::fs::create_dir(&staging).unwrap();

        let mut guard = fx.sessions.lock(&id).await.unwrap();
        let artifact = fx.pipeline.finalize(&mut guard).await.unwrap();
        assert_eq!(artifact.id, "a.bin");
        assert_eq!(guard.session().state, SessionState::Finalized);

        let again = fx.pipeline.finalize(&mut guard).await.unwrap();
        assert_eq!(again.id, "a.bin");
        assert_eq!(fx.pipeline.file_store().list_metadata().await.unwrap().len(), 1);
        drop(guard);

        std::fs::remove_dir(&staging).unwrap();
        assert_eq!(fx.sessions.sync_records().await, 0);

        let reopened = SessionStore::open(fx.sessions.root()).await.unwrap();
        reopened.restore().await.unwrap();
        let restored = reopened.get(&id).unwrap();
        assert_eq!(restored.state, SessionState::Finalized);
        assert_eq!(restored.permanent_id.as_deref(), Some("a.bin"));
    }
}
