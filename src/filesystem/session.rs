use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::metadata::Metadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Accepting chunks.
    Active,
    /// Every declared byte has landed; waiting on (or retrying) finalize.
    Completed,
    /// Moved into permanent storage.
    Finalized,
    /// Reclaimed by the sweeper or cancelled by the client.
    Expired,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;

        matches!(
            (self, next),
            (Active, Completed) | (Active, Expired) | (Completed, Finalized) | (Completed, Expired)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Finalized | SessionState::Expired)
    }
}

/// Byte range of the last chunk applied to a session, kept so that a client
/// retrying a chunk whose response was lost gets the same answer back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRange {
    pub offset: u64,
    pub length: u64,
}

/// One resumable transfer. This is also the durable record written next to
/// the temporary artifact, so every field here survives a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadSession {
    pub id: String,
    pub declared_length: u64,
    pub received_offset: u64,
    pub metadata: Metadata,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    /// Cleared once finalize has consumed the artifact.
    pub temp_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_chunk: Option<ChunkRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permanent_id: Option<String>,
}

impl UploadSession {
    pub fn new(id: String, declared_length: u64, metadata: Metadata, temp_path: PathBuf) -> Self {
        let now = Utc::now();

        Self {
            id,
            declared_length,
            received_offset: 0,
            metadata,
            state: SessionState::Active,
            created_at: now,
            last_activity_at: now,
            temp_path: Some(temp_path),
            last_chunk: None,
            permanent_id: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.received_offset == self.declared_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_transitions() {
        use SessionState::*;

        assert!(Active.can_transition_to(Completed));
        assert!(Active.can_transition_to(Expired));
        assert!(Completed.can_transition_to(Finalized));
        assert!(Completed.can_transition_to(Expired));

        assert!(!Finalized.can_transition_to(Active));
        assert!(!Finalized.can_transition_to(Expired));
        assert!(!Expired.can_transition_to(Active));
        assert!(!Active.can_transition_to(Finalized));
        assert!(!Completed.can_transition_to(Active));
    }

    #[test]
    fn test_record_serializes_state_in_lowercase() {
        let session = UploadSession::new("abc".into(), 10, Metadata::new(), PathBuf::from("/tmp/abc"));
        let json = serde_json::to_value(&session).unwrap();

        assert_eq!(json["state"], "active");
        assert_eq!(json["received_offset"], 0);
        assert!(json.get("permanent_id").is_none());
    }
}
