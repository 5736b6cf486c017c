//! Mining worker threads.
//!
//! Workers scan disjoint nonce ranges of a broadcast task, checking each
//! candidate header's Blake3 outer hash against the target. Solutions flow
//! back to the coordinator over a channel; new work is broadcast over a
//! watch channel so workers abandon stale tasks between batches.

use member_consensus::pow::decode_compact;
use member_consensus::BlockHeader;
use num_bigint::BigUint;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

/// Nonce attempts between new-work checks.
const BATCH_SIZE: u32 = 4_096;

/// Nonce-space partitions across workers.
const MAX_NONCE_PARTITIONS: u64 = 256;

/// A unit of mining work: a header template whose nonce the workers own.
#[derive(Clone, Debug)]
pub struct MiningTask {
    /// Header template; workers vary the nonce.
    pub header: BlockHeader,
    /// Block height the template builds.
    pub height: u32,
}

/// A solved header found by a worker.
#[derive(Debug)]
pub struct FoundBlock {
    /// The header with the winning nonce.
    pub header: BlockHeader,
    /// Height of the solved template.
    pub height: u32,
    /// Worker that found it.
    pub worker_id: usize,
    /// Hashes this worker computed on the task.
    pub hashes_computed: u64,
}

/// A mining worker thread.
pub struct MiningWorker {
    id: usize,
    handle: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    hash_count: Arc<AtomicU64>,
}

impl MiningWorker {
    /// Spawn a worker consuming tasks from `task_rx`.
    pub fn spawn(
        id: usize,
        task_rx: watch::Receiver<Option<MiningTask>>,
        solution_tx: mpsc::Sender<FoundBlock>,
    ) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let hash_count = Arc::new(AtomicU64::new(0));

        let running_clone = Arc::clone(&running);
        let hash_count_clone = Arc::clone(&hash_count);

        let handle = thread::Builder::new()
            .name(format!("mining-worker-{}", id))
            .spawn(move || {
                Self::worker_loop(id, task_rx, solution_tx, running_clone, hash_count_clone);
            })
            .expect("failed to spawn mining worker thread");

        info!(worker_id = id, "Mining worker spawned");

        Self {
            id,
            handle: Some(handle),
            running,
            hash_count,
        }
    }

    fn worker_loop(
        id: usize,
        mut task_rx: watch::Receiver<Option<MiningTask>>,
        solution_tx: mpsc::Sender<FoundBlock>,
        running: Arc<AtomicBool>,
        hash_count: Arc<AtomicU64>,
    ) {
        // Partition the nonce space so workers do not duplicate effort; a
        // random offset inside the partition keeps restarts from replaying
        // the same range.
        let partition = (id as u64) % MAX_NONCE_PARTITIONS;
        let partition_size = (u32::MAX as u64 + 1) / MAX_NONCE_PARTITIONS;
        let random_offset = rand::thread_rng().gen_range(0..partition_size);
        let nonce_base = (partition * partition_size + random_offset) as u32;

        debug!(worker_id = id, partition, "Worker starting");

        while running.load(Ordering::Relaxed) {
            let task = task_rx.borrow_and_update().clone();

            let Some(task) = task else {
                trace!(worker_id = id, "No work, idling");
                thread::sleep(std::time::Duration::from_millis(100));
                continue;
            };

            let target = decode_compact(task.header.bits);
            if !target.is_valid() {
                warn!(worker_id = id, bits = task.header.bits, "Unusable target in task");
                thread::sleep(std::time::Duration::from_millis(100));
                continue;
            }

            let mut header = task.header;
            let mut nonce = nonce_base;
            let mut task_hashes = 0u64;
            let mut solved = false;

            'mining: loop {
                if !running.load(Ordering::Relaxed) {
                    break;
                }
                if task_rx.has_changed().unwrap_or(true) {
                    trace!(worker_id = id, "New work received");
                    break;
                }

                for _ in 0..BATCH_SIZE {
                    header.nonce = nonce;
                    let hash = BigUint::from_bytes_le(header.hash().as_bytes());
                    task_hashes += 1;
                    if hash < target.target {
                        hash_count.fetch_add(task_hashes, Ordering::Relaxed);
                        info!(
                            worker_id = id,
                            height = task.height,
                            nonce,
                            "Found valid header"
                        );
                        let found = FoundBlock {
                            header,
                            height: task.height,
                            worker_id: id,
                            hashes_computed: task_hashes,
                        };
                        if solution_tx.blocking_send(found).is_err() {
                            warn!(worker_id = id, "Solution channel closed");
                            return;
                        }
                        solved = true;
                        break 'mining;
                    }
                    nonce = nonce.wrapping_add(1);
                }
                hash_count.fetch_add(BATCH_SIZE as u64, Ordering::Relaxed);
                task_hashes = 0;
            }

            // A solved template is spent; idle until new work arrives.
            while solved
                && running.load(Ordering::Relaxed)
                && !task_rx.has_changed().unwrap_or(true)
            {
                thread::sleep(std::time::Duration::from_millis(50));
            }
        }

        info!(
            worker_id = id,
            total_hashes = hash_count.load(Ordering::Relaxed),
            "Worker shutting down"
        );
    }

    /// Request the worker to stop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// Worker id.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Hashes computed so far.
    pub fn hash_count(&self) -> u64 {
        self.hash_count.load(Ordering::Relaxed)
    }

    /// Join the worker thread.
    pub fn join(mut self) -> thread::Result<()> {
        self.stop();
        match self.handle.take() {
            Some(handle) => handle.join(),
            None => Ok(()),
        }
    }
}

impl Drop for MiningWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A pool of mining workers sharing one task broadcast.
pub struct WorkerPool {
    workers: Vec<MiningWorker>,
    task_tx: watch::Sender<Option<MiningTask>>,
    solution_rx: mpsc::Receiver<FoundBlock>,
}

impl WorkerPool {
    /// Spawn `num_workers` workers.
    pub fn new(num_workers: usize) -> Self {
        let (task_tx, task_rx) = watch::channel(None);
        let (solution_tx, solution_rx) = mpsc::channel(num_workers.max(1) * 2);

        let workers = (0..num_workers)
            .map(|id| MiningWorker::spawn(id, task_rx.clone(), solution_tx.clone()))
            .collect();

        info!(num_workers, "Mining worker pool created");
        Self {
            workers,
            task_tx,
            solution_rx,
        }
    }

    /// Broadcast a new task to every worker.
    pub fn broadcast_task(&self, task: MiningTask) {
        if self.task_tx.send(Some(task)).is_err() {
            warn!("No workers subscribed to task channel");
        }
    }

    /// Clear the current task; workers idle.
    pub fn clear_task(&self) {
        let _ = self.task_tx.send(None);
    }

    /// Receive the next solution.
    pub async fn recv_solution(&mut self) -> Option<FoundBlock> {
        self.solution_rx.recv().await
    }

    /// Try to receive a solution without blocking.
    pub fn try_recv_solution(&mut self) -> Option<FoundBlock> {
        self.solution_rx.try_recv().ok()
    }

    /// Total hashes across workers.
    pub fn total_hash_count(&self) -> u64 {
        self.workers.iter().map(|w| w.hash_count()).sum()
    }

    /// Number of workers.
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Stop and join every worker.
    pub fn shutdown(self) {
        for worker in &self.workers {
            worker.stop();
        }
        let _ = self.task_tx.send(None);
        for worker in self.workers {
            let _ = worker.join();
        }
        info!("Mining worker pool shutdown complete");
    }
}
