//! Job identity table
//!
//! Jobs are registered by `(kind, batch, key)`. The table is a fixed array of
//! independently locked shards chosen by the high bits of the identity hash,
//! so concurrent `prepare` calls for different identities rarely contend.

use crate::job::{Job, JobHandle, JobIdentity, NOT_IN_TABLE};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use tracing::trace;

/// Result of `JobTable::prepare`
#[derive(Debug, Clone)]
pub enum Prepared {
    New(JobHandle),
    Existing(JobHandle),
}

impl Prepared {
    pub fn job(&self) -> &JobHandle {
        match self {
            Prepared::New(job) | Prepared::Existing(job) => job,
        }
    }

    pub fn into_job(self) -> JobHandle {
        match self {
            Prepared::New(job) | Prepared::Existing(job) => job,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Prepared::New(_))
    }
}

#[derive(Default)]
struct Shard {
    slots: Vec<JobHandle>,
    by_identity: HashMap<JobIdentity, usize>,
}

pub struct JobTable {
    shards: Box<[RwLock<Shard>]>,
    shard_bits: u32,
}

impl JobTable {
    pub fn new(shard_bits: u8) -> Self {
        let shard_bits = u32::from(shard_bits);
        let shards = (0..1usize << shard_bits)
            .map(|_| RwLock::new(Shard::default()))
            .collect();
        Self { shards, shard_bits }
    }

    fn shard_index(&self, identity: &JobIdentity) -> usize {
        if self.shard_bits == 0 {
            return 0;
        }
        let mut hasher = DefaultHasher::new();
        identity.hash(&mut hasher);
        (hasher.finish() >> (64 - self.shard_bits)) as usize
    }

    /// Find the job registered under `identity`, or register the one built by
    /// `create`. Both happen under a single shard write lock.
    pub fn prepare(&self, identity: JobIdentity, create: impl FnOnce() -> Job) -> Prepared {
        let mut shard = self.shards[self.shard_index(&identity)].write();
        if let Some(&slot) = shard.by_identity.get(&identity) {
            return Prepared::Existing(shard.slots[slot].clone());
        }

        let job = Arc::new(create());
        debug_assert_eq!(job.identity(), identity);
        let slot = shard.slots.len();
        job.set_table_slot(slot);
        shard.slots.push(job.clone());
        shard.by_identity.insert(identity, slot);
        trace!("Registered job {:?} in slot {}", identity, slot);
        Prepared::New(job)
    }

    pub fn find(&self, identity: &JobIdentity) -> Option<JobHandle> {
        let shard = self.shards[self.shard_index(identity)].read();
        shard
            .by_identity
            .get(identity)
            .map(|&slot| shard.slots[slot].clone())
    }

    /// Remove a job that is no longer linked anywhere else.
    /// Returns false if the job is not registered.
    pub fn remove(&self, job: &JobHandle) -> bool {
        let identity = job.identity();
        let mut shard = self.shards[self.shard_index(&identity)].write();
        let slot = job.table_slot();
        if slot == NOT_IN_TABLE || slot >= shard.slots.len() || !Arc::ptr_eq(&shard.slots[slot], job) {
            return false;
        }

        shard.slots.swap_remove(slot);
        shard.by_identity.remove(&identity);
        job.set_table_slot(NOT_IN_TABLE);

        if let Some(moved) = shard.slots.get(slot).cloned() {
            moved.set_table_slot(slot);
            shard.by_identity.insert(moved.identity(), slot);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().slots.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::test_support::SeedInput;
    use crate::job::{Priority, ResultGroup};
    use std::thread;

    fn identity(batch: u32, key: u64) -> JobIdentity {
        JobIdentity {
            kind: 7,
            batch,
            key,
        }
    }

    fn make(id: JobIdentity) -> impl FnOnce() -> Job {
        move || {
            Job::new(
                id,
                Priority::Normal,
                SeedInput::new(id.key),
                Arc::new(ResultGroup::new()),
            )
        }
    }

    #[test]
    fn prepare_is_idempotent() {
        let table = JobTable::new(4);
        let first = table.prepare(identity(1, 1), make(identity(1, 1)));
        let second = table.prepare(identity(1, 1), make(identity(1, 1)));

        assert!(first.is_new());
        assert!(!second.is_new());
        assert!(Arc::ptr_eq(first.job(), second.job()));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn remove_fixes_up_moved_slot() {
        let table = JobTable::new(0);
        let jobs: Vec<_> = (0..4)
            .map(|k| table.prepare(identity(1, k), make(identity(1, k))).into_job())
            .collect();

        assert!(table.remove(&jobs[1]));
        assert!(!table.remove(&jobs[1]));
        assert_eq!(table.len(), 3);

        // the last job was swapped into slot 1
        assert_eq!(jobs[3].table_slot(), 1);
        let found = table.find(&identity(1, 3)).unwrap();
        assert!(Arc::ptr_eq(&found, &jobs[3]));
        assert!(table.find(&identity(1, 1)).is_none());

        for job in [&jobs[0], &jobs[2], &jobs[3]] {
            assert!(table.remove(job));
        }
        assert!(table.is_empty());
    }

    #[test]
    fn concurrent_prepare_creates_one_job_per_identity() {
        let table = Arc::new(JobTable::new(3));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = table.clone();
                thread::spawn(move || {
                    (0..200u64)
                        .filter(|&k| table.prepare(identity(1, k), make(identity(1, k))).is_new())
                        .count()
                })
            })
            .collect();

        let created: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(created, 200);
        assert_eq!(table.len(), 200);
    }
}
