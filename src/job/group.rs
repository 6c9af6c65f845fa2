//! Result groups collect the completions of related jobs

use super::{Job, JobHandle, JobStatus};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

type JobCallback = Box<dyn Fn(&JobHandle, JobStatus) + Send + Sync>;
type GroupCallback = Box<dyn Fn(&ResultGroup) + Send + Sync>;

/// A caller-owned set of jobs that is notified as its members resolve.
///
/// Jobs own their group, so the group only keeps weak references to the jobs
/// it has seen finish. The per-job callback fires once for every delivered
/// job, and the group callback fires each time the pending count drops to zero.
pub struct ResultGroup {
    pending: AtomicUsize,
    all_succeeded: AtomicBool,
    finished: Mutex<Vec<Weak<Job>>>,
    drained: Condvar,
    on_job: Option<JobCallback>,
    on_all: Option<GroupCallback>,
}

impl ResultGroup {
    pub fn new() -> Self {
        Self {
            pending: AtomicUsize::new(0),
            all_succeeded: AtomicBool::new(true),
            finished: Mutex::new(Vec::new()),
            drained: Condvar::new(),
            on_job: None,
            on_all: None,
        }
    }

    /// Invoke `callback` once per completed job
    pub fn on_job_complete(
        mut self,
        callback: impl Fn(&JobHandle, JobStatus) + Send + Sync + 'static,
    ) -> Self {
        self.on_job = Some(Box::new(callback));
        self
    }

    /// Invoke `callback` when every submitted job has resolved
    pub fn on_all_complete(mut self, callback: impl Fn(&ResultGroup) + Send + Sync + 'static) -> Self {
        self.on_all = Some(Box::new(callback));
        self
    }

    pub(crate) fn add_pending(&self, count: usize) {
        self.pending.fetch_add(count, Ordering::AcqRel);
    }

    pub(crate) fn job_finished(&self, job: &JobHandle, status: JobStatus) {
        if !job.succeeded() {
            self.all_succeeded.store(false, Ordering::Release);
        }
        self.finished.lock().push(Arc::downgrade(job));

        if let Some(callback) = &self.on_job {
            callback(job, status);
        }

        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(callback) = &self.on_all {
                callback(self);
            }
            let _guard = self.finished.lock();
            self.drained.notify_all();
        }
    }

    /// Jobs submitted but not yet resolved
    pub fn num_pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        self.num_pending() == 0
    }

    /// False once any member finished without a successful output
    pub fn all_succeeded(&self) -> bool {
        self.all_succeeded.load(Ordering::Acquire)
    }

    pub fn num_finished(&self) -> usize {
        self.finished.lock().len()
    }

    /// Resolved jobs in completion order that are still referenced elsewhere
    pub fn finished_jobs(&self) -> Vec<JobHandle> {
        self.finished.lock().iter().filter_map(Weak::upgrade).collect()
    }

    /// Block until every submitted job resolved or `timeout` elapsed.
    /// Returns whether the group drained.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut finished = self.finished.lock();
        if self.is_complete() {
            return true;
        }
        let _ = self
            .drained
            .wait_while_for(&mut finished, |_| !self.is_complete(), timeout);
        self.is_complete()
    }
}

impl Default for ResultGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ResultGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultGroup")
            .field("pending", &self.num_pending())
            .field("all_succeeded", &self.all_succeeded())
            .finish()
    }
}
