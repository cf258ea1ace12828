//! Persistence Debouncer.
//!
//! A background task owns the pending snapshot and the timer. Each
//! `schedule` replaces the pending value and pushes the deadline out; when
//! the deadline passes, the task performs one write and awaits it before
//! looking at the next command, so at most one write is ever in flight.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::remote::{DiagramStore, SaveRequest};
use crate::snapshot_store::Snapshot;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebounceStats {
    pub writes: u64,
    pub failures: u64,
    /// Writes dropped because no document id was set
    pub skipped: u64,
}

#[derive(Default)]
struct AtomicDebounceStats {
    writes: AtomicU64,
    failures: AtomicU64,
    skipped: AtomicU64,
}

struct Pending {
    snapshot: Snapshot,
    ai_run_id: Option<String>,
}

enum Command {
    Schedule(Pending),
    Flush(oneshot::Sender<()>),
}

pub struct PersistenceDebouncer {
    store: Arc<dyn DiagramStore>,
    document_id: Option<String>,
    delay: Duration,
    stats: Arc<AtomicDebounceStats>,
}

impl PersistenceDebouncer {
    /// Start the debounce task on the current runtime.
    pub fn spawn(
        store: Arc<dyn DiagramStore>,
        document_id: Option<String>,
        delay: Duration,
    ) -> DebouncerHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(AtomicDebounceStats::default());
        let debouncer = Self {
            store,
            document_id,
            delay,
            stats: stats.clone(),
        };
        tokio::spawn(debouncer.run(rx));
        DebouncerHandle { tx, stats }
    }

    async fn run(self, mut rx: mpsc::UnboundedReceiver<Command>) {
        let mut pending: Option<Pending> = None;
        let timer = tokio::time::sleep(self.delay);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(Command::Schedule(next)) => {
                        if pending.replace(next).is_some() {
                            log::trace!("Coalesced pending write");
                        }
                        timer.as_mut().reset(Instant::now() + self.delay);
                    }
                    Some(Command::Flush(done)) => {
                        if let Some(p) = pending.take() {
                            self.write(p).await;
                        }
                        let _ = done.send(());
                    }
                    None => {
                        // Handle dropped; don't lose the last edit.
                        if let Some(p) = pending.take() {
                            self.write(p).await;
                        }
                        break;
                    }
                },
                () = &mut timer, if pending.is_some() => {
                    if let Some(p) = pending.take() {
                        self.write(p).await;
                    }
                }
            }
        }
        log::debug!("Persistence debouncer stopped");
    }

    async fn write(&self, pending: Pending) {
        let Some(document_id) = self.document_id.as_deref() else {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            log::debug!("No document id; skipping persistence write");
            return;
        };
        let request = SaveRequest::from_snapshot(&pending.snapshot, pending.ai_run_id);
        match self.store.save(document_id, &request).await {
            Ok(()) => {
                self.stats.writes.fetch_add(1, Ordering::Relaxed);
                log::debug!("Saved diagram {document_id} ({} bytes)", pending.snapshot.len());
            }
            Err(e) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                log::error!("Failed to save diagram {document_id}: {e}");
            }
        }
    }
}

/// Cloneable front end of a running debouncer.
#[derive(Clone)]
pub struct DebouncerHandle {
    tx: mpsc::UnboundedSender<Command>,
    stats: Arc<AtomicDebounceStats>,
}

impl DebouncerHandle {
    pub fn schedule(&self, snapshot: Snapshot) {
        self.send(Command::Schedule(Pending {
            snapshot,
            ai_run_id: None,
        }));
    }

    /// Schedule a write attributed to an AI generation run.
    pub fn schedule_tagged(&self, snapshot: Snapshot, ai_run_id: impl Into<String>) {
        self.send(Command::Schedule(Pending {
            snapshot,
            ai_run_id: Some(ai_run_id.into()),
        }));
    }

    /// Write any pending snapshot now and wait for the write to finish.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        self.send(Command::Flush(done));
        let _ = wait.await;
    }

    pub fn stats(&self) -> DebounceStats {
        DebounceStats {
            writes: self.stats.writes.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
            skipped: self.stats.skipped.load(Ordering::Relaxed),
        }
    }

    fn send(&self, cmd: Command) {
        if self.tx.send(cmd).is_err() {
            log::warn!("Persistence debouncer is gone; dropping write");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryDiagramStore;
    use serde_json::json;

    fn snapshot(n: usize) -> Snapshot {
        Arc::from(format!(r#"{{"rev":{n}}}"#))
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_to_last() {
        let store = Arc::new(MemoryDiagramStore::new());
        let handle = PersistenceDebouncer::spawn(store.clone(), Some("d1".into()), DEFAULT_DEBOUNCE);

        for n in 1..=8 {
            handle.schedule(snapshot(n));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(store.saves().is_empty());

        tokio::time::sleep(Duration::from_millis(400)).await;
        let saves = store.saves();
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0].1.model_json, json!({"rev": 8}));
        assert_eq!(handle.stats().writes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_separate_quiet_periods_write_separately() {
        let store = Arc::new(MemoryDiagramStore::new());
        let handle = PersistenceDebouncer::spawn(store.clone(), Some("d1".into()), DEFAULT_DEBOUNCE);

        handle.schedule(snapshot(1));
        tokio::time::sleep(Duration::from_millis(500)).await;
        handle.schedule(snapshot(2));
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(store.saves().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_does_not_block_next_write() {
        let store = Arc::new(MemoryDiagramStore::new());
        store.fail_next_saves(1);
        let handle = PersistenceDebouncer::spawn(store.clone(), Some("d1".into()), DEFAULT_DEBOUNCE);

        handle.schedule(snapshot(1));
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(handle.stats().failures, 1);
        assert!(store.saves().is_empty());

        handle.schedule(snapshot(2));
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(store.saves().len(), 1);
        assert_eq!(handle.stats().writes, 1);
    }

    #[tokio::test]
    async fn test_without_document_id_skips() {
        let store = Arc::new(MemoryDiagramStore::new());
        let handle = PersistenceDebouncer::spawn(store.clone(), None, DEFAULT_DEBOUNCE);
        handle.schedule(snapshot(1));
        handle.flush().await;
        assert!(store.saves().is_empty());
        assert_eq!(handle.stats().skipped, 1);
    }

    #[tokio::test]
    async fn test_flush_writes_immediately_with_tag() {
        let store = Arc::new(MemoryDiagramStore::new());
        let handle =
            PersistenceDebouncer::spawn(store.clone(), Some("d1".into()), Duration::from_secs(60));
        handle.schedule_tagged(snapshot(3), "run-1");
        handle.flush().await;
        let saves = store.saves();
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0].1.ai_run_id.as_deref(), Some("run-1"));
    }
}
