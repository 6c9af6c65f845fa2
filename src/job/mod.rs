//! Jobs: the unit of work tracked by the cache
//!
//! A job is shared as `Arc<Job>`. Identity and input never change; the
//! mutable lifecycle lives behind a small per-job mutex that is always the
//! innermost lock taken by the cache.

mod group;

pub use group::ResultGroup;

use crate::cache::CacheRef;
use crate::hash::{ContentHasher, InputHash, OutputHash};
use crate::remote::RemoteRequest;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

/// Shared handle to a job
pub type JobHandle = Arc<Job>;

/// Caller-chosen id shared by jobs that are cancelled together
pub type BatchId = u32;

/// Caller-defined job family (e.g. one per compiler or job type)
pub type JobKind = u32;

/// Caller key identifying a job within its kind and batch
pub type JobKey = u64;

/// Dispatch priority, lowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    /// Must run on a local worker
    ForceLocal,
}

impl Priority {
    pub const COUNT: usize = 4;
    pub const ALL: [Priority; Self::COUNT] = [
        Priority::Low,
        Priority::Normal,
        Priority::High,
        Priority::ForceLocal,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    fn from_index(index: u8) -> Self {
        match index {
            0 => Priority::Low,
            1 => Priority::Normal,
            2 => Priority::High,
            _ => Priority::ForceLocal,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::ForceLocal => write!(f, "force-local"),
        }
    }
}

/// Where a dispatched job executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerKind {
    Local,
    Distributed,
}

/// Lifecycle status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Created,
    Preprocessing,
    /// Waiting on a remote cache lookup
    PendingRemote,
    /// Waiting on the in-flight job for the same input hash
    Duplicate,
    Pending(Priority),
    Dispatched(WorkerKind),
    CompleteCacheHit,
    CompleteRemoteHit,
    Complete,
    Failed,
    /// Preprocessing rejected the input
    Skipped,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::CompleteCacheHit
                | JobStatus::CompleteRemoteHit
                | JobStatus::Complete
                | JobStatus::Failed
                | JobStatus::Skipped
                | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Created => write!(f, "created"),
            JobStatus::Preprocessing => write!(f, "preprocessing"),
            JobStatus::PendingRemote => write!(f, "pending-remote"),
            JobStatus::Duplicate => write!(f, "duplicate"),
            JobStatus::Pending(priority) => write!(f, "pending({})", priority),
            JobStatus::Dispatched(WorkerKind::Local) => write!(f, "dispatched(local)"),
            JobStatus::Dispatched(WorkerKind::Distributed) => write!(f, "dispatched(distributed)"),
            JobStatus::CompleteCacheHit => write!(f, "cache-hit"),
            JobStatus::CompleteRemoteHit => write!(f, "remote-hit"),
            JobStatus::Complete => write!(f, "complete"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Skipped => write!(f, "skipped"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Input description supplied by the caller.
///
/// `hash_input` must be deterministic: equal inputs must feed identical
/// bytes to the hasher.
pub trait JobInput: Send + Sync + 'static {
    fn hash_input(&self, hasher: &mut ContentHasher);

    /// Runs on a blocking task before hashing. Returning false finishes the
    /// job as `Skipped`.
    fn preprocess(&self) -> bool {
        true
    }

    /// Whether this input may be looked up in or written to the remote cache
    fn allow_remote(&self) -> bool {
        true
    }

    fn debug_name(&self) -> String;
}

/// Output payload produced by a worker.
///
/// Cloning is cheap: the buffers are reference counted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOutput {
    pub data: Bytes,
    /// Large auxiliary buffers (e.g. compiled code)
    pub blobs: Vec<Bytes>,
}

impl JobOutput {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            blobs: Vec::new(),
        }
    }

    pub fn with_blob(mut self, blob: impl Into<Bytes>) -> Self {
        self.blobs.push(blob.into());
        self
    }

    pub fn size_bytes(&self) -> usize {
        self.data.len() + self.blobs.iter().map(Bytes::len).sum::<usize>()
    }

    pub fn hash(&self) -> OutputHash {
        let mut hasher = ContentHasher::new();
        hasher.update_u64(self.data.len() as u64).update(&self.data);
        for blob in &self.blobs {
            hasher.update_u64(blob.len() as u64).update(blob);
        }
        hasher.finish_output()
    }
}

/// Table identity of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobIdentity {
    pub kind: JobKind,
    pub batch: BatchId,
    pub key: JobKey,
}

/// Which scheduler structure currently owns the job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Link {
    Detached,
    Submitting(usize),
    Pending {
        priority: Priority,
        slot: usize,
    },
    Duplicate {
        cache_ref: CacheRef,
        /// Position in the cache entry's wait-list
        wait: usize,
        /// Position in the scheduler's duplicate registry
        registry: usize,
    },
    Dispatched,
}

pub(crate) struct JobState {
    pub status: JobStatus,
    pub output: Option<JobOutput>,
    pub succeeded: bool,
    pub is_duplicate: bool,
    pub link: Link,
    /// Set while this job is the in-flight representative for its hash
    pub cache_ref: Option<CacheRef>,
    pub remote: Option<Arc<RemoteRequest>>,
}

pub(crate) const NOT_IN_TABLE: usize = usize::MAX;

pub struct Job {
    identity: JobIdentity,
    input: Arc<dyn JobInput>,
    group: Arc<ResultGroup>,
    priority: AtomicU8,
    input_hash: OnceLock<InputHash>,
    delivered: AtomicBool,
    table_slot: AtomicUsize,
    state: Mutex<JobState>,
}

impl Job {
    pub(crate) fn new(
        identity: JobIdentity,
        priority: Priority,
        input: Arc<dyn JobInput>,
        group: Arc<ResultGroup>,
    ) -> Self {
        Self {
            identity,
            input,
            group,
            priority: AtomicU8::new(priority as u8),
            input_hash: OnceLock::new(),
            delivered: AtomicBool::new(false),
            table_slot: AtomicUsize::new(NOT_IN_TABLE),
            state: Mutex::new(JobState {
                status: JobStatus::Created,
                output: None,
                succeeded: false,
                is_duplicate: false,
                link: Link::Detached,
                cache_ref: None,
                remote: None,
            }),
        }
    }

    pub fn identity(&self) -> JobIdentity {
        self.identity
    }

    pub fn batch_id(&self) -> BatchId {
        self.identity.batch
    }

    pub fn kind(&self) -> JobKind {
        self.identity.kind
    }

    pub fn key(&self) -> JobKey {
        self.identity.key
    }

    pub fn input(&self) -> &Arc<dyn JobInput> {
        &self.input
    }

    pub fn group(&self) -> &Arc<ResultGroup> {
        &self.group
    }

    pub fn priority(&self) -> Priority {
        Priority::from_index(self.priority.load(Ordering::Acquire))
    }

    pub(crate) fn set_priority(&self, priority: Priority) {
        self.priority.store(priority as u8, Ordering::Release);
    }

    /// Input hash, available once the job has been preprocessed
    pub fn input_hash(&self) -> Option<InputHash> {
        self.input_hash.get().copied()
    }

    /// Compute the input hash on first use
    pub(crate) fn ensure_input_hash(&self) -> InputHash {
        *self.input_hash.get_or_init(|| {
            let mut hasher = ContentHasher::new();
            hasher.update_u32(self.identity.kind);
            self.input.hash_input(&mut hasher);
            hasher.finish_input()
        })
    }

    pub fn status(&self) -> JobStatus {
        self.state.lock().status
    }

    pub fn output(&self) -> Option<JobOutput> {
        self.state.lock().output.clone()
    }

    pub fn succeeded(&self) -> bool {
        self.state.lock().succeeded
    }

    /// True if the job was served by another job with the same input hash
    pub fn is_duplicate(&self) -> bool {
        self.state.lock().is_duplicate
    }

    pub fn debug_name(&self) -> String {
        self.input.debug_name()
    }

    pub(crate) fn state(&self) -> parking_lot::MutexGuard<'_, JobState> {
        self.state.lock()
    }

    pub(crate) fn link(&self) -> Link {
        self.state.lock().link
    }

    pub(crate) fn set_result(&self, output: JobOutput, succeeded: bool) {
        let mut state = self.state.lock();
        state.output = Some(output);
        state.succeeded = succeeded;
    }

    pub(crate) fn table_slot(&self) -> usize {
        self.table_slot.load(Ordering::Acquire)
    }

    pub(crate) fn set_table_slot(&self, slot: usize) {
        self.table_slot.store(slot, Ordering::Release);
    }

    pub fn is_delivered(&self) -> bool {
        self.delivered.load(Ordering::Acquire)
    }

    /// Record the terminal status and notify the result group.
    /// Returns false, and does nothing, if the job was already delivered.
    pub(crate) fn deliver(self: &Arc<Self>, status: JobStatus) -> bool {
        debug_assert!(status.is_terminal(), "delivering non-terminal status {status}");
        if self.delivered.swap(true, Ordering::AcqRel) {
            debug_assert!(false, "job {} delivered twice", self.debug_name());
            return false;
        }
        {
            let mut state = self.state.lock();
            state.status = status;
            state.link = Link::Detached;
            state.cache_ref = None;
            state.remote = None;
        }
        self.group.job_finished(self, status);
        true
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("identity", &self.identity)
            .field("priority", &self.priority())
            .field("input_hash", &self.input_hash())
            .field("status", &self.status())
            .finish()
    }
}
