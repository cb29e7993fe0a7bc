use std::path::Path;
use tokio::{
    fs::OpenOptions,
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom},
};

use super::{
    session::{ChunkRange, SessionState, UploadSession},
    session_store::SessionGuard,
};
use crate::error::{TusError, TusResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkWrite {
    pub new_offset: u64,
    /// The chunk repeated the last applied one byte for byte; nothing was written.
    pub duplicate: bool,
}

/// Appends byte ranges to a session's temporary artifact.
///
/// A chunk is either fully applied (bytes on disk and offset advanced) or not
/// at all; on any failure the artifact is truncated back to the old offset.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChunkWriter;

impl ChunkWriter {
    pub fn new() -> Self {
        Self
    }

    pub async fn write_chunk(
        &self,
        guard: &mut SessionGuard<'_>,
        offset: u64,
        bytes: &[u8],
    ) -> TusResult<ChunkWrite> {
        let session = guard.session();

        if self.is_retry_of_last_chunk(&session, offset, bytes).await? {
            tracing::debug!(session_id = %session.id, offset, "duplicate chunk acknowledged");
            guard.touch();
            return Ok(ChunkWrite {
                new_offset: session.received_offset,
                duplicate: true,
            });
        }

        if session.state != SessionState::Active {
            return Err(TusError::IllegalTransition {
                from: session.state,
                to: SessionState::Active,
            });
        }

        if offset != session.received_offset {
            return Err(TusError::OffsetMismatch {
                expected: session.received_offset,
                actual: offset,
            });
        }

        let length = bytes.len() as u64;
        if offset + length > session.declared_length {
            return Err(TusError::OverLength {
                declared: session.declared_length,
                attempted: offset + length,
            });
        }

        let Some(path) = session.temp_path.as_deref() else {
            return Err(TusError::NotFound(session.id));
        };

        if bytes.is_empty() {
            guard.touch();
            return Ok(ChunkWrite {
                new_offset: offset,
                duplicate: false,
            });
        }

        if let Err(e) = append_at(path, offset, bytes).await {
            rollback(path, offset).await;
            return Err(e.into());
        }

        match guard.advance_offset(ChunkRange { offset, length }).await {
            Ok(updated) => {
                tracing::debug!(
                    session_id = %updated.id,
                    offset,
                    length,
                    received = updated.received_offset,
                    declared = updated.declared_length,
                    "chunk applied"
                );
                Ok(ChunkWrite {
                    new_offset: updated.received_offset,
                    duplicate: false,
                })
            }
            Err(e) => {
                rollback(path, offset).await;
                Err(e)
            }
        }
    }

    async fn is_retry_of_last_chunk(
        &self,
        session: &UploadSession,
        offset: u64,
        bytes: &[u8],
    ) -> TusResult<bool> {
        if !matches!(session.state, SessionState::Active | SessionState::Completed) {
            return Ok(false);
        }

        let Some(last) = session.last_chunk else {
            return Ok(false);
        };

        if bytes.is_empty() || last.offset != offset || last.length != bytes.len() as u64 {
            return Ok(false);
        }

        let Some(path) = session.temp_path.as_deref() else {
            return Ok(false);
        };

        let mut file = OpenOptions::new().read(true).open(path).await?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut on_disk = vec![0u8; bytes.len()];
        file.read_exact(&mut on_disk).await?;

        Ok(on_disk == bytes)
    }
}

async fn append_at(path: &Path, offset: u64, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).open(path).await?;

    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_data().await
}

async fn rollback(path: &Path, offset: u64) {
    let truncated = async {
        let file = OpenOptions::new().write(true).open(path).await?;
        file.set_len(offset).await
    };

    if let Err(e) = truncated.await {
        tracing::warn!(path = %path.display(), offset, error = %e, "failed to roll back partial chunk");
    }
}
