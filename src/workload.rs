//! Synthetic workloads
//!
//! Inputs with deterministic hashes and outputs, plus a thread pool that
//! drains the pending queue like a real compile farm would.

use crate::hash::{ContentHasher, InputHash};
use crate::job::{JobInput, JobOutput, Priority, WorkerKind};
use crate::manager::JobCache;
use bytes::{BufMut, BytesMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Input identified by a seed. Equal seeds hash equally.
#[derive(Debug, Clone)]
pub struct SyntheticInput {
    pub seed: u64,
    pub name: String,
    pub preprocess_ok: bool,
    pub allow_remote: bool,
}

impl SyntheticInput {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            name: format!("shader_{seed:05}.hlsl"),
            preprocess_ok: true,
            allow_remote: true,
        }
    }

    pub fn local_only(mut self) -> Self {
        self.allow_remote = false;
        self
    }

    pub fn rejected(mut self) -> Self {
        self.preprocess_ok = false;
        self
    }

    pub fn into_input(self) -> Arc<dyn JobInput> {
        Arc::new(self)
    }
}

impl JobInput for SyntheticInput {
    fn hash_input(&self, hasher: &mut ContentHasher) {
        hasher.update_str("synthetic").update_u64(self.seed);
    }

    fn preprocess(&self) -> bool {
        self.preprocess_ok
    }

    fn allow_remote(&self) -> bool {
        self.allow_remote
    }

    fn debug_name(&self) -> String {
        self.name.clone()
    }
}

/// Input hash a job of `kind` over `input` will be looked up under
pub fn input_hash_for(kind: u32, input: &dyn JobInput) -> InputHash {
    let mut hasher = ContentHasher::new();
    hasher.update_u32(kind);
    input.hash_input(&mut hasher);
    hasher.finish_input()
}

/// Deterministic output of `size` bytes derived from `hash`
pub fn synthesize_output(hash: &InputHash, size: usize) -> JobOutput {
    let mut data = BytesMut::with_capacity(size);
    let mut state = hash.prefix() | 1;
    while data.len() < size {
        // xorshift64
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        let take = (size - data.len()).min(8);
        data.put_slice(&state.to_le_bytes()[..take]);
    }
    JobOutput::new(data.freeze())
}

/// Worker pool settings
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub workers: usize,
    /// Most jobs a worker pulls per request
    pub batch_size: usize,
    pub output_bytes: usize,
    /// Simulated compile time per job
    pub work: Duration,
    pub worker_kind: WorkerKind,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            batch_size: 16,
            output_bytes: 4096,
            work: Duration::ZERO,
            worker_kind: WorkerKind::Local,
        }
    }
}

/// Threads that pull pending jobs, "compile" them and report results
pub struct WorkerPool {
    stop: Arc<AtomicBool>,
    executed: Arc<AtomicU64>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(cache: Arc<JobCache>, options: PoolOptions) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let executed = Arc::new(AtomicU64::new(0));
        let workers = options.workers.max(1);

        let handles = (0..workers)
            .filter_map(|id| {
                let cache = cache.clone();
                let stop = stop.clone();
                let executed = executed.clone();
                let options = options.clone();
                thread::Builder::new()
                    .name(format!("jobcache-worker-{id}"))
                    .spawn(move || work_loop(&cache, &options, &stop, &executed))
                    .map_err(|e| warn!("Failed to spawn worker {}: {}", id, e))
                    .ok()
            })
            .collect::<Vec<_>>();

        debug!("Started {} workers", handles.len());
        Self {
            stop,
            executed,
            handles,
        }
    }

    /// Jobs executed so far
    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    /// Stop all workers and wait for them. Returns the executed count.
    pub fn shutdown(mut self) -> u64 {
        self.stop_and_join();
        self.executed()
    }

    fn stop_and_join(&mut self) {
        self.stop.store(true, Ordering::Release);
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("Worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

fn work_loop(cache: &JobCache, options: &PoolOptions, stop: &AtomicBool, executed: &AtomicU64) {
    let batch = options.batch_size.max(1);
    while !stop.load(Ordering::Acquire) {
        let jobs = Priority::ALL
            .iter()
            .rev()
            .map(|&p| cache.get_pending_jobs(options.worker_kind, p, 1, batch))
            .find(|jobs| !jobs.is_empty());

        let Some(jobs) = jobs else {
            thread::sleep(Duration::from_millis(1));
            continue;
        };

        for job in jobs {
            if !options.work.is_zero() {
                thread::sleep(options.work);
            }
            let output = match job.input_hash() {
                Some(hash) => synthesize_output(&hash, options.output_bytes),
                None => JobOutput::default(),
            };
            executed.fetch_add(1, Ordering::Relaxed);
            cache.process_finished_job(&job, output, true);
        }
    }
}
