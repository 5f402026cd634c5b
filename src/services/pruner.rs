use crate::messages::{CoreEvent, EventSink, PruneCommand, emit};
use crate::storage::{SpaceGauge, StorageIndex};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::time::MissedTickBehavior;

/// Outcome of one pruning pass
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PruneReport {
    /// Deleted segments, oldest first
    pub deleted: Vec<PathBuf>,
    /// Segments whose file could not be removed
    pub failed: Vec<PathBuf>,
    pub free_bytes: u64,
    /// Free space reached the threshold
    pub satisfied: bool,
}

/// Deletes the oldest finalized segments until the volume has enough free space
#[derive(Clone)]
pub struct StoragePruner {
    index: StorageIndex,
    gauge: Arc<dyn SpaceGauge>,
    min_free_bytes: u64,
}

impl StoragePruner {
    pub fn new(index: StorageIndex, gauge: Arc<dyn SpaceGauge>, min_free_bytes: u64) -> Self {
        Self {
            index,
            gauge,
            min_free_bytes,
        }
    }

    pub fn min_free_bytes(&self) -> u64 {
        self.min_free_bytes
    }

    /// Run one pass. On return free space is at the threshold, or the
    /// index has nothing left to delete.
    ///
    /// Only indexed segments are candidates, so the segment being written
    /// is never touched. A file that fails to delete is skipped and the
    /// next oldest is tried.
    pub fn prune_once(&self) -> io::Result<PruneReport> {
        let root = self.index.root();
        let mut report = PruneReport::default();

        loop {
            report.free_bytes = self.gauge.free_bytes(root)?;
            if report.free_bytes >= self.min_free_bytes {
                report.satisfied = true;
                break;
            }

            let Some(oldest) = self.index.oldest() else {
                break;
            };
            match self.index.remove_and_delete(&oldest) {
                Ok(freed) => {
                    tracing::info!(
                        "Deleted oldest segment {:?} ({} bytes) to free space",
                        oldest.path,
                        freed
                    );
                    report.deleted.push(oldest.path);
                }
                Err(e) => {
                    tracing::warn!("Failed to delete segment {:?}: {}", oldest.path, e);
                    report.failed.push(oldest.path);
                }
            }
        }

        Ok(report)
    }
}

/// Runs the pruner on a fixed interval and whenever the recorder asks
///
/// Wake-ups are best effort and skipped while storage is exhausted.
/// `PruneCommand::RunNow` always runs a pass and replies when it is done.
pub struct PruneService {
    pruner: StoragePruner,
    interval: Duration,
    requests: mpsc::Receiver<PruneCommand>,
    wake: Arc<Notify>,
    events: EventSink,
    exhausted: bool,
}

impl PruneService {
    pub fn new(
        pruner: StoragePruner,
        interval: Duration,
        requests: mpsc::Receiver<PruneCommand>,
        wake: Arc<Notify>,
        events: EventSink,
    ) -> Self {
        Self {
            pruner,
            interval,
            requests,
            wake,
            events,
            exhausted: false,
        }
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let reply = tokio::select! {
                biased;

                _ = ticker.tick() => None,
                Some(PruneCommand::RunNow(reply)) = self.requests.recv() => Some(reply),
                // Nothing left to delete: wait for the next scheduled check
                _ = self.wake.notified(), if !self.exhausted => None,
            };

            let pruner = self.pruner.clone();
            match tokio::task::spawn_blocking(move || pruner.prune_once()).await {
                Ok(result) => self.settle(result),
                Err(e) => tracing::error!("Pruning task panicked: {}", e),
            }

            if let Some(reply) = reply {
                let _ = reply.send(());
            }
        }
    }

    /// Turn a pass result into events, announcing exhaustion once per episode
    fn settle(&mut self, result: io::Result<PruneReport>) {
        let report = match result {
            Ok(report) => report,
            Err(e) => {
                tracing::error!("Cannot query free space: {}", e);
                emit(
                    &self.events,
                    CoreEvent::StorageUnavailable {
                        error: e.to_string(),
                    },
                );
                self.exhausted = true;
                return;
            }
        };

        if !report.failed.is_empty() {
            tracing::warn!(
                "{} segments could not be deleted and were dropped from the index",
                report.failed.len()
            );
        }

        if !report.deleted.is_empty() {
            emit(
                &self.events,
                CoreEvent::SegmentsPruned {
                    deleted: report.deleted.len(),
                    free_bytes: report.free_bytes,
                },
            );
        }

        if report.satisfied {
            if self.exhausted {
                tracing::info!("Free space back above threshold: {} bytes", report.free_bytes);
                emit(
                    &self.events,
                    CoreEvent::StorageRecovered {
                        free_bytes: report.free_bytes,
                    },
                );
            }
            self.exhausted = false;
        } else if !self.exhausted {
            tracing::warn!(
                "Storage exhausted: {} bytes free, {} required, nothing left to delete",
                report.free_bytes,
                self.pruner.min_free_bytes()
            );
            emit(
                &self.events,
                CoreEvent::StorageExhausted {
                    free_bytes: report.free_bytes,
                    min_free_bytes: self.pruner.min_free_bytes(),
                },
            );
            self.exhausted = true;
        }
    }
}

/// Handle for asking the PruneService for passes
#[derive(Clone)]
pub struct PruneHandle {
    tx: mpsc::Sender<PruneCommand>,
    wake: Arc<Notify>,
}

impl PruneHandle {
    pub fn new(tx: mpsc::Sender<PruneCommand>, wake: Arc<Notify>) -> Self {
        Self { tx, wake }
    }

    /// A handle with no service behind it; passes return immediately
    #[cfg(test)]
    pub fn detached() -> Self {
        let (tx, _) = mpsc::channel(1);
        Self::new(tx, Arc::new(Notify::new()))
    }

    /// Ask for a pass without waiting for it
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Run a pass and wait for it to finish. False if the service is gone.
    pub async fn prune_now(&self) -> bool {
        let (reply, done) = oneshot::channel();
        if self.tx.send(PruneCommand::RunNow(reply)).await.is_err() {
            return false;
        }
        done.await.is_ok()
    }
}
