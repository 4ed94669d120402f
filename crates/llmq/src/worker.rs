//! Bounded-queue worker threads
//!
//! Every worker-owning component drives its state from one named thread fed
//! by a bounded channel. The thread drains whatever is queued into a batch
//! before calling the handler, so handlers can batch signature verification.
//!
//! All workers follow the same shutdown protocol: `interrupt` wakes the
//! thread and makes it exit before its next batch, `stop` interrupts and
//! joins. Gossip is submitted with `submit` (dropped when the queue is full);
//! block-derived events use `submit_ordered`, which waits for space so their
//! order is preserved.

use llmq_core::{LlmqError, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Largest batch handed to a handler in one call
const MAX_BATCH: usize = 256;

enum Envelope<M> {
    Message(M),
    Interrupt,
}

/// Counters shared with the worker thread
#[derive(Default)]
struct WorkerShared {
    interrupted: AtomicBool,
    pending: AtomicUsize,
}

/// One bounded queue and the thread draining it
pub struct Worker<M: Send + 'static> {
    name: &'static str,
    tx: mpsc::Sender<Envelope<M>>,
    rx: Mutex<Option<mpsc::Receiver<Envelope<M>>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    shared: Arc<WorkerShared>,
}

impl<M: Send + 'static> Worker<M> {
    /// Create the queue; the thread is spawned by `start`
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            name,
            tx,
            rx: Mutex::new(Some(rx)),
            handle: Mutex::new(None),
            shared: Arc::new(WorkerShared::default()),
        }
    }

    /// Spawn the thread. A worker can be started once.
    pub fn start<F>(&self, mut handler: F) -> Result<()>
    where
        F: FnMut(Vec<M>) + Send + 'static,
    {
        let mut rx = self
            .rx
            .lock()
            .take()
            .ok_or_else(|| LlmqError::invariant(format!("worker {} started twice", self.name)))?;
        let shared = Arc::clone(&self.shared);
        let name = self.name;

        let handle = std::thread::Builder::new()
            .name(format!("llmq-{name}"))
            .spawn(move || {
                debug!(worker = name, "worker started");
                while let Some(first) = rx.blocking_recv() {
                    if shared.interrupted.load(Ordering::Acquire) {
                        break;
                    }
                    let mut batch = Vec::new();
                    if let Envelope::Message(m) = first {
                        batch.push(m);
                    }
                    while batch.len() < MAX_BATCH {
                        match rx.try_recv() {
                            Ok(Envelope::Message(m)) => batch.push(m),
                            Ok(Envelope::Interrupt) => {}
                            Err(_) => break,
                        }
                    }
                    if batch.is_empty() {
                        continue;
                    }
                    let n = batch.len();
                    trace!(worker = name, batch = n, "processing batch");
                    handler(batch);
                    shared.pending.fetch_sub(n, Ordering::AcqRel);
                }
                debug!(worker = name, "worker exited");
            })
            .map_err(|e| LlmqError::internal(format!("spawn worker {name}: {e}")))?;

        *self.handle.lock() = Some(handle);
        Ok(())
    }

    /// Queue a message, dropping it when the queue is full or the worker is interrupted
    pub fn submit(&self, msg: M) -> bool {
        if self.is_interrupted() {
            return false;
        }
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        match self.tx.try_send(Envelope::Message(msg)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.shared.pending.fetch_sub(1, Ordering::AcqRel);
                warn!(worker = self.name, "queue full, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.shared.pending.fetch_sub(1, Ordering::AcqRel);
                false
            }
        }
    }

    /// Queue a message, waiting for space. Must not be called from the worker's own thread.
    pub fn submit_ordered(&self, msg: M) -> bool {
        if self.is_interrupted() {
            return false;
        }
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        if self.tx.blocking_send(Envelope::Message(msg)).is_err() {
            self.shared.pending.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// Wake the thread and make it exit before its next batch
    pub fn interrupt(&self) {
        if !self.shared.interrupted.swap(true, Ordering::AcqRel) {
            debug!(worker = self.name, "interrupt");
            // A full queue still wakes the thread, which checks the flag per batch.
            let _ = self.tx.try_send(Envelope::Interrupt);
        }
    }

    /// Interrupt and join the thread
    pub fn stop(&self) {
        self.interrupt();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(worker = self.name, "worker thread panicked");
            }
        }
        // Anything still queued is abandoned.
        self.shared.pending.store(0, Ordering::Release);
    }

    /// Whether `interrupt` has been called
    pub fn is_interrupted(&self) -> bool {
        self.shared.interrupted.load(Ordering::Acquire)
    }

    /// Whether the thread is running
    pub fn is_running(&self) -> bool {
        self.handle.lock().is_some() && !self.is_interrupted()
    }

    /// Messages queued or being handled
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    /// Whether nothing is queued or being handled
    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }
}

impl<M: Send + 'static> Drop for Worker<M> {
    fn drop(&mut self) {
        self.interrupt();
    }
}
