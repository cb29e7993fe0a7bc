//! Background reclamation of abandoned uploads.

use chrono::{DateTime, Utc};
use std::{collections::HashSet, io::ErrorKind, path::Path, sync::Arc, time::Duration};
use tokio::{fs, sync::watch, task::JoinHandle};

use crate::engine::UploadEngine;
use crate::error::TusResult;
use crate::filesystem::{
    file_store::FileStore,
    session::{SessionState, UploadSession},
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Unfinished sessions reclaimed after exceeding the TTL.
    pub expired: usize,
    /// Finalized sessions dropped after their grace period.
    pub pruned: usize,
    /// Temporary files with no session behind them.
    pub orphans: usize,
    pub failures: usize,
}

enum Verdict {
    Expire,
    Prune,
    Keep,
}

impl<S: FileStore> UploadEngine<S> {
    /// One pass over every session and the temp directory. A failure on one
    /// session is logged and counted; it never stops the pass.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport {
            failures: self.sessions().sync_records().await,
            ..Default::default()
        };
        let grace = chrono::Duration::from_std(self.config().finalized_grace).unwrap_or_else(|_| chrono::Duration::zero());

        for candidate in self.sessions().snapshots() {
            if matches!(self.verdict(&candidate, now, grace), Verdict::Keep) {
                continue;
            }

            // Waits out any in-flight chunk write or finalize.
            let guard = match self.sessions().lock(&candidate.id).await {
                Ok(guard) => guard,
                Err(_) => continue,
            };

            // Re-judge under the lock; the session may have moved on.
            let session = guard.session();
            let outcome = match self.verdict(&session, now, grace) {
                Verdict::Keep => continue,
                Verdict::Expire => self.expire(guard).await.map(|_| report.expired += 1),
                Verdict::Prune => guard.remove().await.map(|_| report.pruned += 1),
            };

            match outcome {
                Ok(()) => tracing::debug!(session_id = %session.id, state = ?session.state, "swept upload session"),
                Err(e) => {
                    report.failures += 1;
                    tracing::warn!(session_id = %session.id, error = %e, "failed to sweep upload session");
                }
            }
        }

        match self.sweep_orphans(now, &mut report).await {
            Ok(()) => {}
            Err(e) => {
                report.failures += 1;
                tracing::warn!(error = %e, "failed to scan temporary directory");
            }
        }

        if report != SweepReport::default() {
            tracing::info!(
                expired = report.expired,
                pruned = report.pruned,
                orphans = report.orphans,
                failures = report.failures,
                "upload sweep finished"
            );
        }

        report
    }

    fn verdict(
        &self,
        session: &UploadSession,
        now: DateTime<Utc>,
        grace: chrono::Duration,
    ) -> Verdict {
        match session.state {
            SessionState::Active | SessionState::Completed if self.is_expired(session, now) => Verdict::Expire,
            SessionState::Expired => Verdict::Expire,
            SessionState::Finalized
                if session
                    .last_activity_at
                    .checked_add_signed(grace)
                    .map_or(false, |at| at <= now) =>
            {
                Verdict::Prune
            }
            _ => Verdict::Keep,
        }
    }

    async fn sweep_orphans(&self, now: DateTime<Utc>, report: &mut SweepReport) -> TusResult<()> {
        let store = self.sessions();
        let known: HashSet<String> = store.snapshots().into_iter().map(|s| s.id).collect();
        let cutoff = now.checked_sub_signed(self.ttl()).unwrap_or(now);

        let mut entries = fs::read_dir(store.root()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(id) = session_id_of(&path) else {
                continue;
            };

            if known.contains(id) || store.contains(id) {
                continue;
            }

            let modified: DateTime<Utc> = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(modified) => modified.into(),
                Err(e) => {
                    report.failures += 1;
                    tracing::warn!(path = %path.display(), error = %e, "failed to stat temporary file");
                    continue;
                }
            };

            if modified > cutoff {
                continue;
            }

            match fs::remove_file(&path).await {
                Ok(()) => {
                    report.orphans += 1;
                    tracing::debug!(path = %path.display(), "removed orphaned temporary file");
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    report.failures += 1;
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove orphaned temporary file");
                }
            }
        }

        Ok(())
    }
}

/// `<id>`, `<id>.info` and `<id>.info.tmp` all belong to session `<id>`.
fn session_id_of(path: &Path) -> Option<&str> {
    let name = path.file_name()?.to_str()?;
    name.split('.').next().filter(|id| !id.is_empty())
}

/// Handle to the periodic sweep task.
pub struct ExpirySweeper {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ExpirySweeper {
    pub fn spawn<S>(engine: Arc<UploadEngine<S>>, every: Duration) -> Self
    where
        S: FileStore + 'static,
    {
        let (shutdown, mut stop) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        engine.sweep(Utc::now()).await;
                    }
                    _ = stop.changed() => break,
                }
            }

            let failures = engine.sessions().sync_records().await;
            if failures > 0 {
                tracing::warn!(failures, "session records left unwritten at shutdown");
            }

            tracing::debug!("expiry sweeper stopped");
        });

        Self { shutdown, handle }
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "expiry sweeper task ended abnormally");
        }
    }
}
