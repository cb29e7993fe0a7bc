//! Registry of in-progress upload sessions.
//!
//! Every session owns an exclusive async lock. All mutations go through a
//! [`SessionGuard`] obtained from [`SessionStore::lock`], so the chunk writer,
//! the finalize pipeline and the sweeper can never race on the same record.
//! Readers get an atomically swapped snapshot and never wait on the lock.

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc,
    },
};
use tokio::{
    fs,
    sync::{Mutex, OwnedMutexGuard},
};
use uuid::Uuid;

use super::{
    metadata::Metadata,
    session::{ChunkRange, SessionState, UploadSession},
};
use crate::error::{TusError, TusResult};

const RECORD_EXTENSION: &str = "info";

struct SessionSlot {
    lock: Arc<Mutex<()>>,
    record: RwLock<Arc<UploadSession>>,
    /// Millisecond timestamp bumped by status queries, which never take the lock.
    touched_at: AtomicI64,
    /// The in-memory record is ahead of the one on disk.
    unsynced: AtomicBool,
    removed: AtomicBool,
}

impl SessionSlot {
    fn new(session: UploadSession) -> Self {
        let touched_at = session.last_activity_at.timestamp_millis();

        Self {
            lock: Arc::new(Mutex::new(())),
            record: RwLock::new(Arc::new(session)),
            touched_at: AtomicI64::new(touched_at),
            unsynced: AtomicBool::new(false),
            removed: AtomicBool::new(false),
        }
    }

    fn snapshot(&self) -> UploadSession {
        let mut session = UploadSession::clone(&self.record.read());
        let touched = self.touched_at.load(Ordering::Acquire);

        if touched > session.last_activity_at.timestamp_millis() {
            if let Some(at) = Utc.timestamp_millis_opt(touched).single() {
                session.last_activity_at = at;
            }
        }

        session
    }

    fn touch(&self, at: DateTime<Utc>) {
        self.touched_at.fetch_max(at.timestamp_millis(), Ordering::AcqRel);
    }

    fn needs_sync(&self) -> bool {
        self.unsynced.load(Ordering::Acquire)
            || self.touched_at.load(Ordering::Acquire) > self.record.read().last_activity_at.timestamp_millis()
    }
}

pub struct SessionStore {
    root: PathBuf,
    sessions: RwLock<HashMap<String, Arc<SessionSlot>>>,
}

impl SessionStore {
    /// Opens the store rooted at `root`, creating the directory if needed.
    /// Call [`SessionStore::restore`] afterwards to pick up surviving sessions.
    pub async fn open(root: impl AsRef<Path>) -> TusResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;

        Ok(Self {
            root,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifact_path(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    pub fn record_path(&self, id: &str) -> PathBuf {
        self.root.join(id).with_extension(RECORD_EXTENSION)
    }

    /// Allocates a session in `Active` with an empty temporary artifact.
    pub async fn create(&self, declared_length: i64, metadata: Metadata) -> TusResult<UploadSession> {
        let declared_length = u64::try_from(declared_length)
            .map_err(|_| TusError::InvalidLength(declared_length))?;

        let id = Uuid::new_v4().simple().to_string();
        let temp_path = self.artifact_path(&id);

        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .await?;

        let session = UploadSession::new(id.clone(), declared_length, metadata, temp_path.clone());

        if let Err(e) = self.persist(&session).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e);
        }

        self.sessions
            .write()
            .insert(id, Arc::new(SessionSlot::new(session.clone())));

        Ok(session)
    }

    pub fn get(&self, id: &str) -> TusResult<UploadSession> {
        self.slot(id).map(|slot| slot.snapshot())
    }

    /// Records read activity on a session without taking its write lock.
    pub fn touch(&self, id: &str) -> TusResult<UploadSession> {
        let slot = self.slot(id)?;
        slot.touch(Utc::now());
        Ok(slot.snapshot())
    }

    /// Waits for the session's exclusive lock.
    pub async fn lock(&self, id: &str) -> TusResult<SessionGuard<'_>> {
        let slot = self.slot(id)?;
        let held = Arc::clone(&slot.lock).lock_owned().await;

        // The sweeper or a cancel may have won the race for the lock.
        if slot.removed.load(Ordering::Acquire) {
            return Err(TusError::NotFound(id.to_string()));
        }

        Ok(SessionGuard {
            store: self,
            slot,
            _held: held,
        })
    }

    /// Writes a status touch through to the session record if the lock is
    /// free. A held lock means a writer is mid-operation; whatever it leaves
    /// unwritten is picked up by [`SessionStore::sync_records`].
    pub async fn persist_activity(&self, id: &str) -> TusResult<()> {
        let slot = self.slot(id)?;
        let Ok(held) = Arc::clone(&slot.lock).try_lock_owned() else {
            return Ok(());
        };

        if slot.removed.load(Ordering::Acquire) || !slot.needs_sync() {
            return Ok(());
        }

        let mut guard = SessionGuard {
            store: self,
            slot,
            _held: held,
        };
        guard.sync().await
    }

    /// Rewrites every record that lags behind its in-memory session: touches
    /// made while the lock was busy and commits whose record write failed.
    /// Returns how many records still could not be written.
    pub async fn sync_records(&self) -> usize {
        let pending: Vec<String> = self
            .sessions
            .read()
            .iter()
            .filter(|(_, slot)| slot.needs_sync())
            .map(|(id, _)| id.clone())
            .collect();

        let mut failures = 0;
        for id in pending {
            let mut guard = match self.lock(&id).await {
                Ok(guard) => guard,
                Err(_) => continue,
            };

            if let Err(e) = guard.sync().await {
                failures += 1;
                tracing::warn!(session_id = %id, error = %e, "failed to write session record");
            }
        }

        failures
    }

    pub fn snapshots(&self) -> Vec<UploadSession> {
        self.sessions
            .read()
            .values()
            .map(|slot| slot.snapshot())
            .collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reloads every persisted record under the root. Records are
    /// authoritative: trailing bytes past `received_offset` are truncated, and
    /// unfinished sessions whose artifact went missing are dropped.
    pub async fn restore(&self) -> TusResult<usize> {
        let mut entries = fs::read_dir(&self.root).await?;
        let mut restored = 0;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }

            let session = match read_record(&path).await {
                Ok(session) => session,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable session record");
                    continue;
                }
            };

            match self.reconcile(session).await {
                Ok(Some(session)) => {
                    tracing::debug!(session_id = %session.id, state = ?session.state, "restored upload session");
                    self.sessions
                        .write()
                        .insert(session.id.clone(), Arc::new(SessionSlot::new(session)));
                    restored += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to restore session record");
                }
            }
        }

        if restored > 0 {
            tracing::info!(count = restored, "restored upload sessions");
        }

        Ok(restored)
    }

    async fn reconcile(&self, session: UploadSession) -> TusResult<Option<UploadSession>> {
        match session.state {
            SessionState::Finalized => Ok(Some(session)),
            SessionState::Expired => {
                self.discard_files(&session.id).await;
                Ok(None)
            }
            SessionState::Active | SessionState::Completed => {
                let artifact = self.artifact_path(&session.id);
                let on_disk = match fs::metadata(&artifact).await {
                    Ok(meta) => Some(meta.len()),
                    Err(e) if e.kind() == ErrorKind::NotFound => None,
                    Err(e) => return Err(e.into()),
                };

                match on_disk {
                    Some(len) if len >= session.received_offset => {
                        if len > session.received_offset {
                            let file = fs::OpenOptions::new().write(true).open(&artifact).await?;
                            file.set_len(session.received_offset).await?;
                        }
                        Ok(Some(UploadSession {
                            temp_path: Some(artifact),
                            ..session
                        }))
                    }
                    _ => {
                        tracing::warn!(session_id = %session.id, "temporary artifact lost, dropping session");
                        self.discard_files(&session.id).await;
                        Ok(None)
                    }
                }
            }
        }
    }

    async fn discard_files(&self, id: &str) {
        for path in [self.artifact_path(id), self.record_path(id)] {
            if let Err(e) = fs::remove_file(&path).await {
                if e.kind() != ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove session file");
                }
            }
        }
    }

    fn slot(&self, id: &str) -> TusResult<Arc<SessionSlot>> {
        self.sessions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| TusError::NotFound(id.to_string()))
    }

    async fn persist(&self, session: &UploadSession) -> TusResult<()> {
        let record = self.record_path(&session.id);
        let staging = record.with_extension("info.tmp");

        fs::write(&staging, serde_json::to_vec(session)?).await?;
        fs::rename(&staging, &record).await?;

        Ok(())
    }
}

async fn read_record(path: &Path) -> TusResult<UploadSession> {
    let raw = fs::read(path).await?;
    Ok(serde_json::from_slice(&raw)?)
}

/// Exclusive access to one session. Dropping the guard releases the lock.
pub struct SessionGuard<'a> {
    store: &'a SessionStore,
    slot: Arc<SessionSlot>,
    _held: OwnedMutexGuard<()>,
}

impl SessionGuard<'_> {
    pub fn session(&self) -> UploadSession {
        self.slot.snapshot()
    }

    /// Moves `received_offset` forward by exactly `applied.length`.
    /// The single place where offset monotonicity is enforced.
    pub async fn advance_offset(&mut self, applied: ChunkRange) -> TusResult<UploadSession> {
        let mut session = self.session();

        if applied.offset != session.received_offset {
            return Err(TusError::OffsetMismatch {
                expected: session.received_offset,
                actual: applied.offset,
            });
        }

        let new_offset = applied.offset + applied.length;
        if new_offset > session.declared_length {
            return Err(TusError::OverLength {
                declared: session.declared_length,
                attempted: new_offset,
            });
        }

        session.received_offset = new_offset;
        session.last_chunk = Some(applied);
        session.last_activity_at = Utc::now();

        self.commit(session).await
    }

    pub async fn mark_state(&mut self, state: SessionState) -> TusResult<UploadSession> {
        let mut session = self.session();
        check_transition(session.state, state)?;

        session.state = state;
        session.last_activity_at = Utc::now();

        self.commit(session).await
    }

    /// `Completed -> Finalized`, recording where the bytes went.
    ///
    /// The artifact has already left the temp directory when this runs, so the
    /// in-memory session moves first and stays `Finalized` even if the record
    /// write fails. The record is then flagged for [`SessionStore::sync_records`]
    /// and the write error is returned.
    pub async fn mark_finalized(&mut self, permanent_id: String) -> TusResult<UploadSession> {
        let mut session = self.session();
        check_transition(session.state, SessionState::Finalized)?;

        session.state = SessionState::Finalized;
        session.permanent_id = Some(permanent_id);
        session.temp_path = None;
        session.last_activity_at = Utc::now();

        *self.slot.record.write() = Arc::new(session.clone());

        if let Err(e) = self.store.persist(&session).await {
            self.slot.unsynced.store(true, Ordering::Release);
            return Err(e);
        }

        self.slot.unsynced.store(false, Ordering::Release);
        Ok(session)
    }

    /// Records activity without changing anything else.
    pub fn touch(&self) {
        self.slot.touch(Utc::now());
    }

    /// Drops the session from the registry and deletes its record file.
    /// The temporary artifact is left for the caller to dispose of.
    pub async fn remove(self) -> TusResult<UploadSession> {
        let session = self.session();

        self.slot.removed.store(true, Ordering::Release);
        self.store.sessions.write().remove(&session.id);

        match fs::remove_file(self.store.record_path(&session.id)).await {
            Ok(()) => Ok(session),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(session),
            Err(e) => Err(e.into()),
        }
    }

    async fn sync(&mut self) -> TusResult<()> {
        let session = self.session();
        self.commit(session).await.map(|_| ())
    }

    async fn commit(&mut self, session: UploadSession) -> TusResult<UploadSession> {
        self.store.persist(&session).await?;
        *self.slot.record.write() = Arc::new(session.clone());
        self.slot.unsynced.store(false, Ordering::Release);
        Ok(session)
    }
}

fn check_transition(from: SessionState, to: SessionState) -> TusResult<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(TusError::IllegalTransition { from, to })
    }
}
