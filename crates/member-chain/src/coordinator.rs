//! The parallel validation coordinator.
//!
//! A fixed pool of worker threads validates candidate blocks against
//! private coins forks. Tasks are keyed by their parent hash; when two
//! candidates race for the same parent, both validate in parallel and the
//! first to finish successfully commits, flipping the cancellation flag of
//! its siblings. Losers return cleanly without touching shared state and
//! stay valid in the index.

use crate::chain::{ChainState, CommitOutcome};
use crate::{ChainResult, ChainError};
use member_consensus::{Block, CancelToken, Hash256, ValidationError};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Result of a submitted validation task.
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    /// Committed as the new tip.
    Committed,
    /// Validated but lost the commit race for its parent.
    Lost,
    /// Not a tip extension; chain activation ran instead.
    Activated,
    /// Canceled by a sibling's commit.
    Canceled,
    /// Failed validation.
    Invalid(ValidationError),
    /// Infrastructure failure (storage and friends).
    Error(String),
}

struct TaskShared {
    result: Mutex<Option<SubmitOutcome>>,
    done: Condvar,
}

/// Handle for awaiting one submitted block's outcome.
pub struct TaskHandle {
    shared: Arc<TaskShared>,
}

impl TaskHandle {
    /// Block until the task resolves.
    pub fn wait(&self) -> SubmitOutcome {
        let mut result = self.shared.result.lock();
        while result.is_none() {
            self.shared.done.wait(&mut result);
        }
        result.clone().expect("checked above")
    }
}

struct Task {
    id: crate::BlockIndexId,
    hash: Hash256,
    prev: Hash256,
    cancel: Arc<CancelToken>,
    shared: Arc<TaskShared>,
}

struct InflightEntry {
    hash: Hash256,
    cancel: Arc<CancelToken>,
}

struct QueueState {
    pending: Mutex<VecDeque<Task>>,
    wakeup: Condvar,
    inflight: Mutex<HashMap<Hash256, Vec<InflightEntry>>>,
    shutdown: AtomicBool,
}

/// The coordinator: owns the worker pool and the submission queue.
pub struct ValidationCoordinator {
    chain: Arc<ChainState>,
    queue: Arc<QueueState>,
    workers: Vec<JoinHandle<()>>,
}

impl ValidationCoordinator {
    /// Spawn `workers` validation threads (0 selects half the cores).
    pub fn new(chain: Arc<ChainState>, workers: usize) -> Self {
        let workers = if workers == 0 {
            (num_cpus::get() / 2).max(1)
        } else {
            workers
        };

        let queue = Arc::new(QueueState {
            pending: Mutex::new(VecDeque::new()),
            wakeup: Condvar::new(),
            inflight: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
        });

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let chain = Arc::clone(&chain);
            let queue = Arc::clone(&queue);
            let handle = std::thread::Builder::new()
                .name(format!("validation-worker-{}", worker_id))
                .spawn(move || Self::worker_loop(worker_id, chain, queue))
                .expect("failed to spawn validation worker");
            handles.push(handle);
        }

        info!(workers, "Validation coordinator started");
        Self {
            chain,
            queue,
            workers: handles,
        }
    }

    /// The chain this coordinator drives.
    pub fn chain(&self) -> &Arc<ChainState> {
        &self.chain
    }

    /// Accept a block and schedule it for validation. Returns a handle the
    /// caller can wait on.
    pub fn submit(&self, block: &Block, now: u64) -> ChainResult<TaskHandle> {
        if self.queue.shutdown.load(Ordering::SeqCst) {
            return Err(ChainError::Validation(ValidationError::canceled()));
        }

        let id = self.chain.accept_block(block, now)?;
        let hash = block.hash();
        let prev = block.header.prev_hash;
        let cancel = Arc::new(CancelToken::new());
        let shared = Arc::new(TaskShared {
            result: Mutex::new(None),
            done: Condvar::new(),
        });

        self.queue
            .inflight
            .lock()
            .entry(prev)
            .or_default()
            .push(InflightEntry {
                hash,
                cancel: Arc::clone(&cancel),
            });

        self.queue.pending.lock().push_back(Task {
            id,
            hash,
            prev,
            cancel,
            shared: Arc::clone(&shared),
        });
        self.queue.wakeup.notify_one();

        Ok(TaskHandle { shared })
    }

    fn worker_loop(worker_id: usize, chain: Arc<ChainState>, queue: Arc<QueueState>) {
        loop {
            let task = {
                let mut pending = queue.pending.lock();
                loop {
                    if let Some(task) = pending.pop_front() {
                        break task;
                    }
                    if queue.shutdown.load(Ordering::SeqCst) {
                        return;
                    }
                    queue.wakeup.wait(&mut pending);
                }
            };

            debug!(worker_id, hash = %task.hash, "Validating block");
            let outcome = match chain.validate_and_commit(task.id, &task.cancel) {
                Ok(CommitOutcome::Committed) => {
                    // Commit wins: siblings racing for the same parent are
                    // quit cooperatively.
                    let mut inflight = queue.inflight.lock();
                    if let Some(entries) = inflight.get(&task.prev) {
                        for entry in entries {
                            if entry.hash != task.hash {
                                entry.cancel.cancel();
                            }
                        }
                    }
                    inflight.remove(&task.prev);
                    SubmitOutcome::Committed
                }
                Ok(CommitOutcome::Lost) => SubmitOutcome::Lost,
                Ok(CommitOutcome::Activated) => SubmitOutcome::Activated,
                Ok(CommitOutcome::Canceled) => SubmitOutcome::Canceled,
                Ok(CommitOutcome::Invalid(err)) => {
                    warn!(hash = %task.hash, error = %err, "Block failed validation");
                    SubmitOutcome::Invalid(err)
                }
                Err(err) => SubmitOutcome::Error(err.to_string()),
            };

            // Drop this task's inflight registration if it is still there.
            {
                let mut inflight = queue.inflight.lock();
                if let Some(entries) = inflight.get_mut(&task.prev) {
                    entries.retain(|e| e.hash != task.hash);
                    if entries.is_empty() {
                        inflight.remove(&task.prev);
                    }
                }
            }

            *task.shared.result.lock() = Some(outcome);
            task.shared.done.notify_all();
        }
    }

    /// Quiesce: stop intake, cancel in-flight work, join every worker, and
    /// only then flush the shared cache to the base.
    pub fn shutdown(mut self) -> ChainResult<()> {
        self.queue.shutdown.store(true, Ordering::SeqCst);
        {
            let inflight = self.queue.inflight.lock();
            for entries in inflight.values() {
                for entry in entries {
                    entry.cancel.cancel();
                }
            }
        }
        self.queue.wakeup.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        // Unresolved queued tasks report cancellation to their waiters.
        for task in self.queue.pending.lock().drain(..) {
            *task.shared.result.lock() = Some(SubmitOutcome::Canceled);
            task.shared.done.notify_all();
        }
        self.chain.flush()?;
        info!("Validation coordinator stopped");
        Ok(())
    }
}
