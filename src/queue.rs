//! Pending queue and scheduler bookkeeping
//!
//! Everything here sits behind the cache's single scheduler mutex: the
//! per-priority FIFO lists, the list of jobs still being submitted, and the
//! registry of jobs parked as duplicates.

use crate::cache::CacheRef;
use crate::job::{BatchId, JobHandle, JobStatus, Link, Priority, WorkerKind};
use rand::Rng;
use tracing::trace;

const NIL: usize = usize::MAX;

struct Node {
    job: Option<JobHandle>,
    prev: usize,
    next: usize,
}

/// Doubly linked list of jobs stored in a slab.
///
/// Slots stay valid until removed, giving O(1) tail insert and O(1)
/// removal from any position.
pub struct JobList {
    nodes: Vec<Node>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    len: usize,
}

impl JobList {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append at the tail and return the job's slot
    pub fn push_back(&mut self, job: JobHandle) -> usize {
        let node = Node {
            job: Some(job),
            prev: self.tail,
            next: NIL,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = node;
                slot
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };

        if self.tail == NIL {
            self.head = slot;
        } else {
            self.nodes[self.tail].next = slot;
        }
        self.tail = slot;
        self.len += 1;
        slot
    }

    pub fn remove(&mut self, slot: usize) -> Option<JobHandle> {
        let job = self.nodes.get_mut(slot)?.job.take()?;
        let (prev, next) = (self.nodes[slot].prev, self.nodes[slot].next);

        if prev == NIL {
            self.head = next;
        } else {
            self.nodes[prev].next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.nodes[next].prev = prev;
        }

        self.nodes[slot].prev = NIL;
        self.nodes[slot].next = NIL;
        self.free.push(slot);
        self.len -= 1;
        Some(job)
    }

    pub fn get(&self, slot: usize) -> Option<&JobHandle> {
        self.nodes.get(slot)?.job.as_ref()
    }

    pub fn head(&self) -> Option<usize> {
        (self.head != NIL).then_some(self.head)
    }

    pub fn next(&self, slot: usize) -> Option<usize> {
        let next = self.nodes.get(slot)?.next;
        (next != NIL).then_some(next)
    }

    /// Iterate jobs from head to tail
    pub fn iter(&self) -> impl Iterator<Item = &JobHandle> + '_ {
        let mut cursor = self.head();
        std::iter::from_fn(move || {
            let slot = cursor?;
            cursor = self.next(slot);
            self.get(slot)
        })
    }
}

impl Default for JobList {
    fn default() -> Self {
        Self::new()
    }
}

/// Scheduler state guarded by one coarse lock
#[derive(Default)]
pub struct PendingQueue {
    pending: [JobList; Priority::COUNT],
    submitting: JobList,
    duplicates: Vec<JobHandle>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_pending(&self, priority: Priority) -> usize {
        self.pending[priority.index()].len()
    }

    pub fn num_pending_total(&self) -> usize {
        self.pending.iter().map(JobList::len).sum()
    }

    pub fn num_duplicates(&self) -> usize {
        self.duplicates.len()
    }

    pub(crate) fn link_submitting(&mut self, job: &JobHandle) {
        let slot = self.submitting.push_back(job.clone());
        let mut state = job.state();
        debug_assert_eq!(state.link, Link::Detached);
        state.link = Link::Submitting(slot);
        state.status = JobStatus::Preprocessing;
    }

    pub(crate) fn is_submitting(&self, job: &JobHandle) -> bool {
        matches!(job.link(), Link::Submitting(_))
    }

    /// Returns false if the job was no longer in the submitting list
    pub(crate) fn unlink_submitting(&mut self, job: &JobHandle) -> bool {
        let mut state = job.state();
        let Link::Submitting(slot) = state.link else {
            return false;
        };
        let removed = self.submitting.remove(slot);
        debug_assert!(removed.is_some_and(|j| std::sync::Arc::ptr_eq(&j, job)));
        state.link = Link::Detached;
        true
    }

    pub(crate) fn link_pending(&mut self, job: &JobHandle, priority: Priority) {
        let slot = self.pending[priority.index()].push_back(job.clone());
        let mut state = job.state();
        debug_assert_eq!(state.link, Link::Detached);
        state.link = Link::Pending { priority, slot };
        state.status = JobStatus::Pending(priority);
        trace!("Queued {:?} at {} priority", job.identity(), priority);
    }

    /// Returns false if the job was no longer queued
    pub(crate) fn unlink_pending(&mut self, job: &JobHandle) -> bool {
        let mut state = job.state();
        let Link::Pending { priority, slot } = state.link else {
            return false;
        };
        self.pending[priority.index()].remove(slot);
        state.link = Link::Detached;
        true
    }

    /// Move a queued job to a new priority level. Returns false if not queued.
    pub(crate) fn relink_pending(&mut self, job: &JobHandle, priority: Priority) -> bool {
        if !self.unlink_pending(job) {
            return false;
        }
        self.link_pending(job, priority);
        true
    }

    pub(crate) fn register_duplicate(&mut self, job: &JobHandle, cache_ref: CacheRef, wait: usize) {
        let registry = self.duplicates.len();
        self.duplicates.push(job.clone());
        let mut state = job.state();
        debug_assert_eq!(state.link, Link::Detached);
        state.link = Link::Duplicate {
            cache_ref,
            wait,
            registry,
        };
        state.status = JobStatus::Duplicate;
        state.is_duplicate = true;
    }

    /// Swap-remove the job from the duplicate registry.
    /// Returns its wait-list position, or `None` if it was not registered.
    pub(crate) fn unregister_duplicate(&mut self, job: &JobHandle) -> Option<usize> {
        let (wait, registry) = {
            let mut state = job.state();
            let Link::Duplicate { wait, registry, .. } = state.link else {
                return None;
            };
            state.link = Link::Detached;
            (wait, registry)
        };

        self.duplicates.swap_remove(registry);
        if let Some(moved) = self.duplicates.get(registry) {
            let mut state = moved.state();
            if let Link::Duplicate {
                registry: ref mut index,
                ..
            } = state.link
            {
                *index = registry;
            }
        }
        Some(wait)
    }

    /// Take up to `max` jobs of `priority` if at least `min` are queued.
    ///
    /// The first job is always the head. With `randomize`, jobs below High
    /// priority are sampled by skipping a random number of entries after each
    /// pick, bounded so the batch can always be filled.
    pub(crate) fn take_pending(
        &mut self,
        worker: WorkerKind,
        priority: Priority,
        min: usize,
        max: usize,
        randomize: bool,
    ) -> Vec<JobHandle> {
        let list = &mut self.pending[priority.index()];
        let available = list.len();
        if max == 0 || available == 0 || available < min {
            return Vec::new();
        }

        let wanted = max.min(available);
        let mut skippable = available - wanted;
        let sample = randomize && priority < Priority::High;
        let mut rng = rand::thread_rng();
        let mut taken = Vec::with_capacity(wanted);
        let mut cursor = list.head();

        while taken.len() < wanted {
            let Some(slot) = cursor else {
                break;
            };
            cursor = list.next(slot);
            let Some(job) = list.remove(slot) else {
                break;
            };
            {
                let mut state = job.state();
                state.link = Link::Dispatched;
                state.status = JobStatus::Dispatched(worker);
            }
            taken.push(job);

            if sample && skippable > 0 {
                let skip = rng.gen_range(0..=skippable);
                skippable -= skip;
                for _ in 0..skip {
                    cursor = cursor.and_then(|s| list.next(s));
                }
            }
        }

        debug_assert_eq!(taken.len(), wanted);
        taken
    }

    /// Mark a dispatched job as returned by its worker
    pub(crate) fn finish_dispatched(&mut self, job: &JobHandle) -> bool {
        let mut state = job.state();
        if state.link != Link::Dispatched {
            return false;
        }
        state.link = Link::Detached;
        true
    }

    pub(crate) fn submitting_with_batch(&self, batch: BatchId) -> Vec<JobHandle> {
        self.submitting
            .iter()
            .filter(|job| job.batch_id() == batch)
            .cloned()
            .collect()
    }

    pub(crate) fn pending_with_batch(&self, batch: BatchId) -> Vec<JobHandle> {
        self.pending
            .iter()
            .flat_map(JobList::iter)
            .filter(|job| job.batch_id() == batch)
            .cloned()
            .collect()
    }

    pub(crate) fn duplicates_with_batch(&self, batch: BatchId) -> Vec<JobHandle> {
        self.duplicates
            .iter()
            .filter(|job| job.batch_id() == batch)
            .cloned()
            .collect()
    }
}
