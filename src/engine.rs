//! The tus protocol state machine.
//!
//! ```text
//! Active --(last byte)--> Completed --(finalize)--> Finalized
//!    \                        \
//!     `----(ttl / cancel)------`--> Expired
//! ```

use chrono::{DateTime, Utc};
use std::{io::ErrorKind, sync::Arc};

use crate::config::EngineConfig;
use crate::error::{TusError, TusResult};
use crate::filesystem::{
    chunk_writer::ChunkWriter,
    file_store::FileStore,
    metadata::Metadata,
    session::{SessionState, UploadSession},
    session_store::{SessionGuard, SessionStore},
};
use crate::finalize::{FinalizePipeline, PermanentArtifact};

/// What a `HEAD` reports about an upload.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadStatus {
    pub id: String,
    pub received_offset: u64,
    pub declared_length: u64,
    pub state: SessionState,
    pub metadata: Metadata,
    /// `None` once the session is finalized or expired.
    pub expires_at: Option<DateTime<Utc>>,
    pub permanent_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppendOutcome {
    pub status: UploadStatus,
    /// Set when this chunk completed the upload and finalize succeeded.
    pub artifact: Option<PermanentArtifact>,
}

pub struct UploadEngine<S> {
    sessions: SessionStore,
    writer: ChunkWriter,
    finalizer: FinalizePipeline<S>,
    config: EngineConfig,
    ttl: chrono::Duration,
}

impl<S: FileStore> UploadEngine<S> {
    /// Opens the session store under `config.temp_dir` and restores whatever
    /// sessions survived the previous run.
    pub async fn open(config: EngineConfig, file_store: Arc<S>) -> TusResult<Self> {
        let sessions = SessionStore::open(&config.temp_dir).await?;
        sessions.restore().await?;

        let ttl = chrono::Duration::from_std(config.session_ttl)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 1000));

        Ok(Self {
            sessions,
            writer: ChunkWriter::new(),
            finalizer: FinalizePipeline::new(file_store),
            config,
            ttl,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn file_store(&self) -> &Arc<S> {
        self.finalizer.file_store()
    }

    pub(crate) fn ttl(&self) -> chrono::Duration {
        self.ttl
    }

    /// CREATE. A zero-length upload is complete on arrival and is finalized
    /// before this returns. If that finalize fails the session is still
    /// handed back, left `Completed`, so the client has an id to retry with.
    pub async fn create(&self, declared_length: i64, metadata: Metadata) -> TusResult<UploadStatus> {
        if let (Some(max), Ok(length)) = (self.config.max_size, u64::try_from(declared_length)) {
            if length > max {
                return Err(TusError::MaxSizeExceeded { length, max });
            }
        }

        let session = self.sessions.create(declared_length, metadata).await?;

        tracing::info!(
            session_id = %session.id,
            declared_length = session.declared_length,
            filename = session.metadata.filename().unwrap_or_default(),
            "created upload session"
        );

        if session.declared_length > 0 {
            return Ok(self.status_of(&session));
        }

        let mut guard = self.sessions.lock(&session.id).await?;
        guard.mark_state(SessionState::Completed).await?;
        if let Err(e) = self.finalizer.finalize(&mut guard).await {
            tracing::warn!(session_id = %session.id, error = %e, "empty upload left completed for a finalize retry");
        }

        Ok(self.status_of(&guard.session()))
    }

    /// APPEND. Applies one chunk and, if it was the last one, finalizes.
    ///
    /// When finalize fails the chunk still counts: the session stays
    /// `Completed` and the error is returned so the caller can retry.
    pub async fn append(&self, id: &str, offset: u64, bytes: &[u8]) -> TusResult<AppendOutcome> {
        let mut guard = self.sessions.lock(id).await?;
        let session = guard.session();

        if !session.state.is_terminal() && self.is_expired(&session, Utc::now()) {
            self.expire(guard).await?;
            return Err(TusError::Expired(id.to_string()));
        }

        // The response to the final chunk may have been lost after finalize
        // already moved the bytes; a byte-identical resend gets the same answer.
        if session.state == SessionState::Finalized
            && self.finalizer.is_final_chunk_retry(&session, offset, bytes).await
        {
            tracing::debug!(session_id = %id, offset, "final chunk resent after finalize");
            guard.touch();
            let artifact = self.finalizer.finalize(&mut guard).await?;
            return Ok(AppendOutcome {
                status: self.status_of(&guard.session()),
                artifact: Some(artifact),
            });
        }

        let written = match self.writer.write_chunk(&mut guard, offset, bytes).await {
            Ok(written) => written,
            Err(e @ TusError::OverLength { .. }) => {
                tracing::warn!(session_id = %id, error = %e, "chunk overran declared length, terminating session");
                self.expire(guard).await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let mut session = guard.session();

        if session.state == SessionState::Active && session.is_complete() {
            session = guard.mark_state(SessionState::Completed).await?;
            tracing::info!(session_id = %id, length = session.declared_length, "upload completed");
        }

        if session.state != SessionState::Completed {
            return Ok(AppendOutcome {
                status: self.status_of(&session),
                artifact: None,
            });
        }

        if written.duplicate {
            tracing::debug!(session_id = %id, "retrying finalize after duplicate final chunk");
        }

        let artifact = self.finalizer.finalize(&mut guard).await?;

        Ok(AppendOutcome {
            status: self.status_of(&guard.session()),
            artifact: Some(artifact),
        })
    }

    /// STATUS. Only `last_activity_at` moves. The snapshot is read without the
    /// write lock; the touch is written through to the record when the lock is
    /// free and otherwise left for the next sweep.
    pub async fn status(&self, id: &str) -> TusResult<UploadStatus> {
        let session = self.sessions.touch(id)?;
        if let Err(e) = self.sessions.persist_activity(id).await {
            tracing::warn!(session_id = %id, error = %e, "failed to record status activity");
        }

        Ok(self.status_of(&session))
    }

    /// Explicit finalize retry for a `Completed` session. On an already
    /// finalized session this returns the recorded artifact.
    pub async fn finalize(&self, id: &str) -> TusResult<PermanentArtifact> {
        let mut guard = self.sessions.lock(id).await?;
        guard.touch();
        self.finalizer.finalize(&mut guard).await
    }

    /// CANCEL. Same effect as the session expiring right now.
    pub async fn cancel(&self, id: &str) -> TusResult<()> {
        let guard = self.sessions.lock(id).await?;
        let state = guard.session().state;

        if state == SessionState::Finalized {
            return Err(TusError::IllegalTransition {
                from: state,
                to: SessionState::Expired,
            });
        }

        self.expire(guard).await?;
        tracing::info!(session_id = %id, "upload cancelled");

        Ok(())
    }

    pub(crate) fn is_expired(&self, session: &UploadSession, now: DateTime<Utc>) -> bool {
        self.expires_at(session).map_or(false, |at| at <= now)
    }

    fn expires_at(&self, session: &UploadSession) -> Option<DateTime<Utc>> {
        session.last_activity_at.checked_add_signed(self.ttl)
    }

    /// Marks the session expired, deletes its temporary artifact and drops it
    /// from the registry. Consumes the guard.
    pub(crate) async fn expire(&self, mut guard: SessionGuard<'_>) -> TusResult<UploadSession> {
        let session = match guard.session().state {
            SessionState::Expired => guard.session(),
            _ => guard.mark_state(SessionState::Expired).await?,
        };

        if let Some(path) = session.temp_path.as_deref() {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        guard.remove().await
    }

    fn status_of(&self, session: &UploadSession) -> UploadStatus {
        let expires_at = if session.state.is_terminal() {
            None
        } else {
            self.expires_at(session)
        };

        UploadStatus {
            id: session.id.clone(),
            received_offset: session.received_offset,
            declared_length: session.declared_length,
            state: session.state,
            metadata: session.metadata.clone(),
            expires_at,
            permanent_id: session.permanent_id.clone(),
        }
    }
}
