//! Best-effort access write-back.
//!
//! `search` hands returned ids to `AccessRecorder::record`, which never
//! blocks: a full queue drops the update with a warning. One worker task
//! drains the queue in order, so `flush` resolves once everything queued
//! before it has been written.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::backend::MemoryBackend;

enum AccessCommand {
    Record {
        memory_ids: Vec<String>,
        at: DateTime<Utc>,
    },
    Flush(oneshot::Sender<()>),
    Shutdown,
}

pub struct AccessRecorder {
    tx: mpsc::Sender<AccessCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
    dropped: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

impl AccessRecorder {
    /// Start the worker on the current runtime
    pub fn spawn(backend: Arc<dyn MemoryBackend>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<AccessCommand>(capacity.max(1));
        let failed = Arc::new(AtomicU64::new(0));
        let worker_failed = failed.clone();

        let worker = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    AccessCommand::Record { memory_ids, at } => {
                        if let Err(e) = backend.record_access(&memory_ids, at).await {
                            worker_failed.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                "Failed to record access for {} memories: {}",
                                memory_ids.len(),
                                e
                            );
                        }
                    }
                    AccessCommand::Flush(done) => {
                        let _ = done.send(());
                    }
                    AccessCommand::Shutdown => break,
                }
            }
            debug!("Access recorder stopped");
        });

        Self {
            tx,
            worker: Mutex::new(Some(worker)),
            dropped: Arc::new(AtomicU64::new(0)),
            failed,
        }
    }

    /// Queue an access update without waiting
    pub fn record(&self, memory_ids: Vec<String>, at: DateTime<Utc>) {
        if memory_ids.is_empty() {
            return;
        }
        match self.tx.try_send(AccessCommand::Record { memory_ids, at }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Access queue full, dropping update");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Access recorder stopped, dropping update");
            }
        }
    }

    /// Wait until every update queued so far has been written
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(AccessCommand::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Drain the queue and stop the worker
    pub async fn shutdown(&self) {
        let _ = self.tx.send(AccessCommand::Shutdown).await;
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }

    /// Updates lost to a full or closed queue
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Updates the backend rejected
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}
