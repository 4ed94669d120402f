//! Shared BLS verification pool
//!
//! Pairing checks dominate the cost of share and lock ingestion. Workers
//! hand whole batches to this pool, which splits them across its threads
//! and blocks the caller until every result is in. The pool lives for the
//! whole context: it is started at construction and stopped at destruction.
//! When it is not running, batches are verified on the calling thread.

use llmq_core::crypto::{PublicKey, Signature};
use llmq_core::{Hash32, LlmqError, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// One signature check
#[derive(Debug, Clone)]
pub struct VerifyJob {
    /// Expected signer
    pub public_key: PublicKey,
    /// Signed hash
    pub msg: Hash32,
    /// Signature under test
    pub sig: Signature,
}

impl VerifyJob {
    /// Create a job
    pub fn new(public_key: PublicKey, msg: Hash32, sig: Signature) -> Self {
        Self {
            public_key,
            msg,
            sig,
        }
    }

    fn run(&self) -> bool {
        self.sig.verify(&self.public_key, &self.msg)
    }
}

struct Task {
    jobs: Vec<VerifyJob>,
    reply: oneshot::Sender<Vec<bool>>,
}

struct Pool {
    tx: mpsc::Sender<Task>,
    handles: Vec<JoinHandle<()>>,
}

/// Thread pool for batched signature verification
pub struct BlsWorker {
    threads: usize,
    pool: Mutex<Option<Pool>>,
}

impl BlsWorker {
    /// Create a stopped pool
    pub fn new(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
            pool: Mutex::new(None),
        }
    }

    /// Spawn the threads
    pub fn start(&self) -> Result<()> {
        let mut slot = self.pool.lock();
        if slot.is_some() {
            return Err(LlmqError::invariant("bls worker started twice"));
        }
        let (tx, rx) = mpsc::channel::<Task>(self.threads * 4);
        let rx = Arc::new(Mutex::new(rx));
        let mut handles = Vec::with_capacity(self.threads);
        for i in 0..self.threads {
            let rx = Arc::clone(&rx);
            let handle = std::thread::Builder::new()
                .name(format!("llmq-bls-{i}"))
                .spawn(move || loop {
                    // Only one idle thread waits on the queue at a time.
                    let task = rx.lock().blocking_recv();
                    let Some(task) = task else { break };
                    let results = task.jobs.iter().map(VerifyJob::run).collect();
                    let _ = task.reply.send(results);
                })
                .map_err(|e| LlmqError::internal(format!("spawn bls worker: {e}")))?;
            handles.push(handle);
        }
        debug!(threads = self.threads, "bls worker started");
        *slot = Some(Pool { tx, handles });
        Ok(())
    }

    /// Close the queue and join the threads
    pub fn stop(&self) {
        let pool = self.pool.lock().take();
        if let Some(pool) = pool {
            drop(pool.tx);
            for handle in pool.handles {
                if handle.join().is_err() {
                    warn!("bls worker thread panicked");
                }
            }
            debug!("bls worker stopped");
        }
    }

    /// Whether the threads are running
    pub fn is_running(&self) -> bool {
        self.pool.lock().is_some()
    }

    /// Verify one signature
    pub fn verify(&self, job: VerifyJob) -> bool {
        self.verify_batch(vec![job]).first().copied().unwrap_or(false)
    }

    /// Verify a batch; results are index-aligned with `jobs`
    pub fn verify_batch(&self, jobs: Vec<VerifyJob>) -> Vec<bool> {
        if jobs.len() <= 1 {
            return jobs.iter().map(VerifyJob::run).collect();
        }
        let tx = match self.pool.lock().as_ref() {
            Some(pool) => pool.tx.clone(),
            None => return jobs.iter().map(VerifyJob::run).collect(),
        };

        let chunk = jobs.len().div_ceil(self.threads);
        let mut pending = Vec::new();
        let mut inline = 0usize;
        let mut iter = jobs.into_iter().peekable();
        while iter.peek().is_some() {
            let part: Vec<VerifyJob> = iter.by_ref().take(chunk).collect();
            let (reply, rx) = oneshot::channel();
            let len = part.len();
            match tx.blocking_send(Task { jobs: part, reply }) {
                Ok(()) => pending.push((len, Some(rx), Vec::new())),
                Err(mpsc::error::SendError(task)) => {
                    inline += 1;
                    pending.push((len, None, task.jobs));
                }
            }
        }

        let mut results = Vec::new();
        for (len, rx, jobs) in pending {
            match rx {
                Some(rx) => match rx.blocking_recv() {
                    Ok(r) => results.extend(r),
                    Err(_) => results.extend(std::iter::repeat(false).take(len)),
                },
                None => results.extend(jobs.iter().map(VerifyJob::run)),
            }
        }
        if inline > 0 {
            debug!(chunks = inline, "bls pool closed, verified inline");
        }
        results
    }
}

impl Drop for BlsWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmq_core::crypto::SecretKey;
    use llmq_core::sha256d;

    fn jobs(n: u8) -> Vec<VerifyJob> {
        (0..n)
            .map(|i| {
                let sk = SecretKey::from_seed(&[i]).unwrap();
                let msg = sha256d(&[i, i]);
                VerifyJob::new(sk.public_key(), msg, sk.sign(&msg))
            })
            .collect()
    }

    #[test]
    fn test_batch_results_aligned() {
        let worker = BlsWorker::new(3);
        worker.start().unwrap();
        let mut batch = jobs(7);
        batch[4].msg = sha256d(b"tampered");
        let results = worker.verify_batch(batch);
        assert_eq!(results.len(), 7);
        assert_eq!(results.iter().filter(|ok| **ok).count(), 6);
        assert!(!results[4]);
        worker.stop();
    }

    #[test]
    fn test_inline_when_stopped() {
        let worker = BlsWorker::new(2);
        assert!(worker.verify_batch(jobs(3)).into_iter().all(|ok| ok));
        assert!(worker.start().is_ok());
        assert!(worker.start().is_err());
        worker.stop();
        assert!(!worker.is_running());
        assert!(worker.verify_batch(jobs(2)).into_iter().all(|ok| ok));
    }
}
