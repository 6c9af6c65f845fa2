//! In-process remote cache
//!
//! Stands in for a shared store in tests and the simulator. It can answer
//! inline or after a delay, and can be switched offline to exercise the
//! miss-on-failure path.

use super::{Outcome, RemoteCache};
use crate::hash::InputHash;
use crate::job::{JobOutput, Priority};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// How lookups are answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteMode {
    /// Answer on the calling thread
    Immediate,
    /// Answer from a future after `latency`
    Deferred { latency: Duration },
}

#[derive(Default)]
struct Counts {
    gets: AtomicU64,
    puts: AtomicU64,
}

pub struct InMemoryRemoteCache {
    store: Arc<RwLock<HashMap<InputHash, JobOutput>>>,
    mode: RemoteMode,
    online: Arc<AtomicBool>,
    counts: Counts,
}

impl InMemoryRemoteCache {
    pub fn new(mode: RemoteMode) -> Self {
        Self {
            store: Arc::new(RwLock::new(HashMap::new())),
            mode,
            online: Arc::new(AtomicBool::new(true)),
            counts: Counts::default(),
        }
    }

    /// Seed an entry directly
    pub fn insert(&self, hash: InputHash, output: JobOutput) {
        self.store.write().insert(hash, output);
    }

    pub fn contains(&self, hash: &InputHash) -> bool {
        self.store.read().contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// While offline every lookup misses and every put is dropped
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    pub fn num_gets(&self) -> u64 {
        self.counts.gets.load(Ordering::Relaxed)
    }

    pub fn num_puts(&self) -> u64 {
        self.counts.puts.load(Ordering::Relaxed)
    }

    fn lookup(
        store: &RwLock<HashMap<InputHash, JobOutput>>,
        online: &AtomicBool,
        hash: &InputHash,
    ) -> Option<JobOutput> {
        if !online.load(Ordering::Acquire) {
            debug!("Remote store offline, treating {} as a miss", hash);
            return None;
        }
        store.read().get(hash).cloned()
    }
}

#[async_trait]
impl RemoteCache for InMemoryRemoteCache {
    fn get(&self, hash: &InputHash, _priority: Priority) -> Outcome {
        self.counts.gets.fetch_add(1, Ordering::Relaxed);
        match self.mode {
            RemoteMode::Immediate => Outcome::Immediate(Self::lookup(&self.store, &self.online, hash)),
            RemoteMode::Deferred { latency } => {
                let store = self.store.clone();
                let online = self.online.clone();
                let hash = *hash;
                Outcome::Pending(Box::pin(async move {
                    tokio::time::sleep(latency).await;
                    Self::lookup(&store, &online, &hash)
                }))
            }
        }
    }

    async fn put(&self, hash: InputHash, output: JobOutput) {
        if !self.online.load(Ordering::Acquire) {
            return;
        }
        self.counts.puts.fetch_add(1, Ordering::Relaxed);
        self.store.write().insert(hash, output);
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
