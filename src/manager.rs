//! Job cache facade
//!
//! `JobCache` ties the job table, cache index, output store, pending queue
//! and optional remote tier together. It is the only type callers need.
//!
//! Lock order, outermost first: cache shard, scheduler queue, job state,
//! output store. Caller-supplied code (input preprocessing, remote lookups,
//! result callbacks) never runs while any of these are held.

use crate::cache::{CacheIndex, IndexShard, OutputStore};
use crate::config::Config;
use crate::error::{JobCacheError, JobCacheResult};
use crate::hash::InputHash;
use crate::job::{
    BatchId, Job, JobHandle, JobIdentity, JobInput, JobKey, JobKind, JobOutput, JobStatus, Link,
    Priority, ResultGroup, WorkerKind,
};
use crate::queue::PendingQueue;
use crate::remote::{Outcome, RemoteCache, RemoteRequest};
use crate::stats::{format_bytes, CacheStats, Counters, NoopStats, PendingCounts, StatsSink};
use crate::table::{JobTable, Prepared};
use parking_lot::Mutex;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone)]
struct Settings {
    memory_budget: Option<usize>,
    overflow_reduce_percent: u8,
    debug_validate: bool,
    discard_outputs: bool,
    remote_enabled: bool,
    write_through: bool,
    randomize_batches: bool,
}

impl Settings {
    fn from_config(config: &Config) -> Self {
        Self {
            memory_budget: config.cache.memory_budget_bytes(),
            overflow_reduce_percent: config.cache.overflow_reduce_percent,
            debug_validate: config.cache.debug_validate,
            discard_outputs: config.cache.discard_outputs,
            remote_enabled: config.remote.enabled,
            write_through: config.remote.write_through,
            randomize_batches: config.scheduler.randomize_batches,
        }
    }

    fn cull_target(&self, budget: usize) -> usize {
        (budget as u128 * u128::from(self.overflow_reduce_percent) / 100) as usize
    }
}

/// Builder for `JobCache`
pub struct JobCacheBuilder {
    config: Config,
    remote: Option<Arc<dyn RemoteCache>>,
    stats_sink: Option<Arc<dyn StatsSink>>,
    runtime: Option<Handle>,
}

impl JobCacheBuilder {
    /// Attach a remote cache tier
    pub fn remote(mut self, remote: Arc<dyn RemoteCache>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn stats_sink(mut self, sink: Arc<dyn StatsSink>) -> Self {
        self.stats_sink = Some(sink);
        self
    }

    /// Runtime used for preprocessing tasks and remote requests.
    /// Defaults to the runtime the builder is called from.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    pub fn build(self) -> JobCacheResult<Arc<JobCache>> {
        self.config.validate()?;
        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|_| JobCacheError::RuntimeUnavailable)?,
        };
        let settings = Settings::from_config(&self.config);
        let shard_bits = self.config.cache.shard_bits;

        info!(
            "Job cache ready: {} shards, budget {}, remote {}",
            1usize << shard_bits,
            settings
                .memory_budget
                .map_or_else(|| "unlimited".to_string(), |b| format_bytes(b as u64)),
            match (&self.remote, settings.remote_enabled) {
                (Some(remote), true) => remote.name(),
                _ => "disabled",
            }
        );
        if settings.debug_validate {
            warn!("Debug validation enabled: every job executes and cache tiers are bypassed");
        }

        Ok(Arc::new(JobCache {
            settings,
            runtime,
            table: JobTable::new(shard_bits),
            index: CacheIndex::new(shard_bits),
            outputs: OutputStore::new(),
            queue: Mutex::new(PendingQueue::new()),
            remote: self.remote,
            stats_sink: self.stats_sink.unwrap_or_else(|| Arc::new(NoopStats)),
            counters: Counters::default(),
            outstanding: AtomicUsize::new(0),
            cull_cursor: AtomicUsize::new(0),
        }))
    }
}

pub struct JobCache {
    settings: Settings,
    runtime: Handle,
    table: JobTable,
    index: CacheIndex,
    outputs: OutputStore,
    queue: Mutex<PendingQueue>,
    remote: Option<Arc<dyn RemoteCache>>,
    stats_sink: Arc<dyn StatsSink>,
    counters: Counters,
    outstanding: AtomicUsize,
    cull_cursor: AtomicUsize,
}

impl JobCache {
    pub fn builder(config: &Config) -> JobCacheBuilder {
        JobCacheBuilder {
            config: config.clone(),
            remote: None,
            stats_sink: None,
            runtime: None,
        }
    }

    /// Find or create the job for `(kind, batch, key)`.
    ///
    /// An existing job is returned as is, except that its priority is raised
    /// to `priority` if that is higher.
    pub fn prepare_job(
        &self,
        kind: JobKind,
        batch: BatchId,
        key: JobKey,
        priority: Priority,
        input: Arc<dyn JobInput>,
        group: &Arc<ResultGroup>,
    ) -> Prepared {
        let identity = JobIdentity { kind, batch, key };
        let prepared = self
            .table
            .prepare(identity, || Job::new(identity, priority, input, group.clone()));

        if let Prepared::Existing(job) = &prepared {
            if priority > job.priority() {
                self.raise_priority(job, priority);
            }
        }
        prepared
    }

    fn raise_priority(&self, job: &JobHandle, priority: Priority) {
        let relinked = {
            let mut queue = self.queue.lock();
            job.set_priority(priority);
            queue.relink_pending(job, priority)
        };
        if relinked {
            debug!("Raised {} to {} priority", job.debug_name(), priority);
            self.stats_sink.job_pending(job, priority);
        }
    }

    /// Submit prepared jobs.
    ///
    /// Each job is preprocessed and hashed on a blocking task, then looked up
    /// in the local and remote tiers. Every accepted job later receives
    /// exactly one completion through its result group.
    pub fn submit_jobs(self: &Arc<Self>, jobs: Vec<JobHandle>) {
        let mut accepted = Vec::with_capacity(jobs.len());
        {
            let mut queue = self.queue.lock();
            for job in jobs {
                if job.is_delivered() || job.link() != Link::Detached {
                    warn!("Ignoring resubmission of {:?}", job.identity());
                    continue;
                }
                job.group().add_pending(1);
                self.outstanding.fetch_add(1, Ordering::AcqRel);
                queue.link_submitting(&job);
                accepted.push(job);
            }
        }

        debug!("Submitting {} jobs", accepted.len());
        for job in accepted {
            let cache = Arc::clone(self);
            self.runtime
                .spawn_blocking(move || cache.preprocess_and_submit(&job));
        }
    }

    fn preprocess_and_submit(self: &Arc<Self>, job: &JobHandle) {
        if !job.input().preprocess() {
            let unlinked = self.queue.lock().unlink_submitting(job);
            if unlinked {
                debug!("Preprocessing rejected {}", job.debug_name());
                self.complete(job, JobStatus::Skipped);
            }
            return;
        }
        job.ensure_input_hash();
        self.submit_job(job);
    }

    fn remote_for(&self, allow_remote: bool) -> Option<Arc<dyn RemoteCache>> {
        if !self.settings.remote_enabled || !allow_remote {
            return None;
        }
        self.remote.clone()
    }

    fn submit_job(self: &Arc<Self>, job: &JobHandle) {
        let hash = job.ensure_input_hash();
        let remote = self.remote_for(job.input().allow_remote());
        Counters::bump(&self.counters.search_attempts);

        if self.settings.debug_validate {
            let priority = job.priority();
            let queued = {
                let mut queue = self.queue.lock();
                let linked = queue.unlink_submitting(job);
                if linked {
                    queue.link_pending(job, priority);
                }
                linked
            };
            if queued {
                self.stats_sink.job_pending(job, priority);
            }
            return;
        }

        let mut shard = self.index.lock_for(&hash);
        let mut queue = self.queue.lock();
        if !queue.is_submitting(job) {
            trace!("Input {} cancelled before lookup", hash);
            return;
        }
        let (cache_ref, entry) = shard.find_or_add(hash);

        // Local hit
        if let Some(output) = entry.output.and_then(|h| self.outputs.get_for_hit(&h)) {
            queue.unlink_submitting(job);
            drop(queue);
            drop(shard);
            Counters::bump(&self.counters.hits);
            job.set_result(output, true);
            self.complete(job, JobStatus::CompleteCacheHit);
            return;
        }

        // Another job is already producing this output
        if entry.in_flight.is_some() {
            queue.unlink_submitting(job);
            let wait = entry.duplicates.len();
            entry.duplicates.push(job.clone());
            queue.register_duplicate(job, cache_ref, wait);
            Counters::bump(&self.counters.duplicates);
            trace!("Input {} queued behind in-flight job ({} waiting)", hash, wait + 1);
            return;
        }

        entry.in_flight = Some(job.clone());
        let priority = job.priority();

        let Some(remote) = remote else {
            queue.unlink_submitting(job);
            job.state().cache_ref = Some(cache_ref);
            queue.link_pending(job, priority);
            drop(queue);
            drop(shard);
            self.stats_sink.job_pending(job, priority);
            return;
        };

        let request = Arc::new(RemoteRequest::new());
        {
            let mut state = job.state();
            state.cache_ref = Some(cache_ref);
            state.remote = Some(request.clone());
            state.status = JobStatus::PendingRemote;
        }
        drop(queue);
        drop(shard);

        if request.token().is_cancelled() {
            request.finish();
            return;
        }
        Counters::bump(&self.counters.remote_queries);

        match remote.get(&hash, priority) {
            Outcome::Immediate(result) => {
                self.on_remote_result(job, result);
                request.finish();
            }
            Outcome::Pending(lookup) => {
                let cache = Arc::clone(self);
                let job = job.clone();
                self.runtime.spawn(async move {
                    tokio::select! {
                        _ = request.token().cancelled() => {
                            debug!("Remote lookup for {} cancelled", job.debug_name());
                        }
                        result = lookup => cache.on_remote_result(&job, result),
                    }
                    request.finish();
                });
            }
        }
    }

    /// Resolve a remote lookup. A no-op if the job was cancelled meanwhile.
    fn on_remote_result(&self, job: &JobHandle, result: Option<JobOutput>) {
        let Some(hash) = job.input_hash() else {
            return;
        };
        let name = job.debug_name();
        let priority = job.priority();

        let mut shard = self.index.lock_for(&hash);
        let mut queue = self.queue.lock();
        if !queue.unlink_submitting(job) {
            trace!("Remote result for {} arrived after cancellation", name);
            return;
        }
        let cache_ref = {
            let mut state = job.state();
            state.remote = None;
            state.cache_ref.take()
        };

        let Some(output) = result else {
            job.state().cache_ref = cache_ref;
            queue.link_pending(job, priority);
            drop(queue);
            drop(shard);
            trace!("Remote miss for {}", name);
            self.stats_sink.job_pending(job, priority);
            return;
        };

        Counters::bump(&self.counters.remote_hits);
        let entry = match cache_ref {
            Some(cache_ref) => shard.get_mut(cache_ref),
            None => None,
        };
        let duplicates = match entry {
            Some(entry) => {
                entry.in_flight = None;
                let duplicates = mem::take(&mut entry.duplicates);
                if !self.settings.discard_outputs {
                    let output_hash = output.hash();
                    self.outputs
                        .add_output(output_hash, &output, duplicates.len() as u64, Some(name));
                    if let Some(previous) = entry.output.replace(output_hash) {
                        self.outputs.release(&previous);
                    }
                }
                duplicates
            }
            None => {
                error!("Cache entry for input {} vanished during remote lookup", hash);
                debug_assert!(false, "remote hit without cache entry");
                Vec::new()
            }
        };
        for duplicate in &duplicates {
            queue.unregister_duplicate(duplicate);
        }
        drop(queue);
        drop(shard);

        self.enforce_memory_budget();
        self.finish_with_output(job, output, true, JobStatus::CompleteRemoteHit, &duplicates);
    }

    /// Pull up to `max` queued jobs of `priority` for a worker, but only if
    /// at least `min` are queued.
    pub fn get_pending_jobs(
        &self,
        worker: WorkerKind,
        priority: Priority,
        min: usize,
        max: usize,
    ) -> Vec<JobHandle> {
        if max == 0 {
            return Vec::new();
        }
        let jobs = self.queue.lock().take_pending(
            worker,
            priority,
            min,
            max,
            self.settings.randomize_batches,
        );
        for job in &jobs {
            self.stats_sink.job_assigned(job, worker);
        }
        jobs
    }

    /// Report the result of a dispatched job.
    ///
    /// On success the output is cached, duplicates waiting on the same input
    /// receive it, and it is written through to the remote tier.
    pub fn process_finished_job(&self, job: &JobHandle, output: JobOutput, succeeded: bool) {
        if !self.queue.lock().finish_dispatched(job) {
            warn!("Ignoring result for {} which is not dispatched", job.debug_name());
            return;
        }
        let status = if succeeded {
            JobStatus::Complete
        } else {
            JobStatus::Failed
        };
        let Some(hash) = job.input_hash() else {
            error!("Dispatched job {} has no input hash", job.debug_name());
            job.set_result(output, succeeded);
            self.complete(job, status);
            return;
        };
        let name = job.debug_name();

        if self.settings.debug_validate {
            if succeeded && self.record_validated(hash, &output, &name) {
                self.enforce_memory_budget();
            }
            job.set_result(output, succeeded);
            self.complete(job, status);
            return;
        }

        let mut stored = false;
        let mut shard = self.index.lock_for(&hash);
        let cache_ref = job.state().cache_ref.take();
        let entry = match cache_ref {
            Some(cache_ref) => shard.get_mut(cache_ref),
            None => None,
        };
        let duplicates = match entry {
            Some(entry) if entry.in_flight.as_ref().is_some_and(|j| Arc::ptr_eq(j, job)) => {
                entry.in_flight = None;
                let duplicates = mem::take(&mut entry.duplicates);
                if succeeded && !self.settings.discard_outputs {
                    let output_hash = output.hash();
                    self.outputs.add_output(
                        output_hash,
                        &output,
                        duplicates.len() as u64,
                        Some(name.clone()),
                    );
                    if let Some(previous) = entry.output.replace(output_hash) {
                        self.outputs.release(&previous);
                    }
                    stored = true;
                }
                duplicates
            }
            _ => {
                error!("{} finished without owning the entry for input {}", name, hash);
                debug_assert!(false, "finished job does not own its cache entry");
                Vec::new()
            }
        };
        if !duplicates.is_empty() {
            let mut queue = self.queue.lock();
            for duplicate in &duplicates {
                queue.unregister_duplicate(duplicate);
            }
        }
        drop(shard);

        trace!(
            "{} finished ({}), serving {} duplicates",
            name,
            status,
            duplicates.len()
        );
        if stored {
            self.write_through(job, hash, &output);
            self.enforce_memory_budget();
        }
        self.finish_with_output(job, output, succeeded, status, &duplicates);
    }

    /// Compare a validated output with the first one recorded for `hash`.
    /// Returns true if the output was newly recorded.
    fn record_validated(&self, hash: InputHash, output: &JobOutput, name: &str) -> bool {
        if self.settings.discard_outputs {
            return false;
        }
        let output_hash = output.hash();
        let mut shard = self.index.lock_for(&hash);
        let (_, entry) = shard.find_or_add(hash);
        match entry.output {
            Some(existing) if existing != output_hash => {
                let cached = self
                    .outputs
                    .debug_name(&existing)
                    .unwrap_or_else(|| "<unknown>".to_string());
                Counters::bump(&self.counters.validation_mismatches);
                warn!(
                    "Output mismatch for input {}: {} produced {}, {} produced {}",
                    hash, cached, existing, name, output_hash
                );
                false
            }
            Some(_) => false,
            None => {
                entry.output = Some(output_hash);
                self.outputs
                    .add_output(output_hash, output, 0, Some(name.to_string()));
                true
            }
        }
    }

    fn write_through(&self, job: &JobHandle, hash: InputHash, output: &JobOutput) {
        if !self.settings.write_through {
            return;
        }
        let Some(remote) = self.remote_for(job.input().allow_remote()) else {
            return;
        };
        let output = output.clone();
        self.runtime.spawn(async move {
            remote.put(hash, output).await;
        });
    }

    fn finish_with_output(
        &self,
        job: &JobHandle,
        output: JobOutput,
        succeeded: bool,
        status: JobStatus,
        duplicates: &[JobHandle],
    ) {
        for duplicate in duplicates {
            duplicate.set_result(output.clone(), succeeded);
        }
        job.set_result(output, succeeded);
        self.complete(job, status);
        for duplicate in duplicates {
            self.complete(duplicate, status);
        }
    }

    fn complete(&self, job: &JobHandle, status: JobStatus) {
        self.table.remove(job);
        if job.deliver(status) {
            self.stats_sink.job_finished(job, status);
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Cancel every job of `batch` that has not been dispatched to a worker.
    ///
    /// Reaches jobs that are still preprocessing, waiting on the remote tier,
    /// queued, or parked as duplicates. Remote lookups are cancelled and
    /// acknowledged before this returns, so it blocks briefly and must not be
    /// called from a current-thread runtime. When a cancelled job was the
    /// in-flight job for its input, a waiting duplicate from another batch
    /// takes over. Returns the number of jobs cancelled.
    pub fn cancel(&self, batch: BatchId) -> usize {
        let mut cancelled = Vec::new();
        let mut promoted = Vec::new();

        let mut submitting = Vec::new();
        {
            let mut queue = self.queue.lock();
            for job in queue.submitting_with_batch(batch) {
                if queue.unlink_submitting(&job) {
                    submitting.push(job);
                }
            }
        }
        for job in &submitting {
            let request = job.state().remote.take();
            if let Some(request) = request {
                request.cancel();
                request.wait();
            }
        }
        for job in submitting {
            let cache_ref = job.state().cache_ref;
            if let Some(cache_ref) = cache_ref {
                let mut shard = self.index.lock(cache_ref.shard());
                let mut queue = self.queue.lock();
                promoted.extend(self.release_entry(&mut shard, &mut queue, &job, &mut cancelled));
            }
            cancelled.push(job);
        }

        let pending = self.queue.lock().pending_with_batch(batch);
        for job in pending {
            let Some(hash) = job.input_hash() else {
                continue;
            };
            let mut shard = self.index.lock_for(&hash);
            let mut queue = self.queue.lock();
            if !queue.unlink_pending(&job) {
                continue;
            }
            promoted.extend(self.release_entry(&mut shard, &mut queue, &job, &mut cancelled));
            cancelled.push(job);
        }

        let duplicates = self.queue.lock().duplicates_with_batch(batch);
        for duplicate in duplicates {
            let Link::Duplicate { cache_ref, .. } = duplicate.link() else {
                continue;
            };
            let mut shard = self.index.lock(cache_ref.shard());
            let mut queue = self.queue.lock();
            if let Some(wait) = queue.unregister_duplicate(&duplicate) {
                shard.remove_duplicate(cache_ref, wait);
                cancelled.push(duplicate);
            }
        }

        for job in &promoted {
            debug!("Promoted {} to in-flight after cancellation", job.debug_name());
            self.stats_sink.job_pending(job, job.priority());
        }

        let count = cancelled.len();
        for job in &cancelled {
            self.complete(job, JobStatus::Cancelled);
        }
        if count > 0 {
            info!("Cancelled {} jobs in batch {}", count, batch);
        }
        count
    }

    /// Give up `job`'s ownership of its cache entry. Waiting duplicates from
    /// the same batch are moved to `cancelled`; the first remaining duplicate
    /// becomes the in-flight job and is queued. Returns the promoted job.
    fn release_entry(
        &self,
        shard: &mut IndexShard,
        queue: &mut PendingQueue,
        job: &JobHandle,
        cancelled: &mut Vec<JobHandle>,
    ) -> Option<JobHandle> {
        let cache_ref = job.state().cache_ref.take()?;
        let batch = job.batch_id();

        let same_batch: Vec<JobHandle> = {
            let entry = shard.get_mut(cache_ref)?;
            if !entry.in_flight.as_ref().is_some_and(|j| Arc::ptr_eq(j, job)) {
                return None;
            }
            entry.in_flight = None;
            entry
                .duplicates
                .iter()
                .filter(|d| d.batch_id() == batch)
                .cloned()
                .collect()
        };
        for duplicate in same_batch {
            if let Some(wait) = queue.unregister_duplicate(&duplicate) {
                shard.remove_duplicate(cache_ref, wait);
                cancelled.push(duplicate);
            }
        }

        let next = shard.get(cache_ref)?.duplicates.first().cloned()?;
        let wait = queue.unregister_duplicate(&next)?;
        shard.remove_duplicate(cache_ref, wait);
        {
            let mut state = next.state();
            state.is_duplicate = false;
            state.cache_ref = Some(cache_ref);
        }
        if let Some(entry) = shard.get_mut(cache_ref) {
            entry.in_flight = Some(next.clone());
        }
        queue.link_pending(&next, next.priority());
        Some(next)
    }

    /// Cull old entries once stored outputs exceed the memory budget
    fn enforce_memory_budget(&self) {
        let Some(budget) = self.settings.memory_budget else {
            return;
        };
        let before = self.outputs.memory_used();
        if before <= budget {
            return;
        }

        let target = self.settings.cull_target(budget);
        let shards = self.index.num_shards();
        let start = self.cull_cursor.fetch_add(1, Ordering::Relaxed) % shards;
        let mut culled = 0;
        for i in 0..shards {
            if self.outputs.memory_used() <= target {
                break;
            }
            culled += self.index.lock((start + i) % shards).cull(&self.outputs, target);
        }
        Counters::add(&self.counters.culled_entries, culled as u64);

        info!(
            "Culled {} cache entries: {} -> {} (budget {})",
            culled,
            format_bytes(before as u64),
            format_bytes(self.outputs.memory_used() as u64),
            format_bytes(budget as u64)
        );
    }

    /// Jobs queued at `priority`
    pub fn num_pending(&self, priority: Priority) -> usize {
        self.queue.lock().num_pending(priority)
    }

    pub fn num_pending_total(&self) -> usize {
        self.queue.lock().num_pending_total()
    }

    /// Submitted jobs that have not yet been delivered
    pub fn num_outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Memory budget for stored outputs, `None` when unlimited
    pub fn memory_budget(&self) -> Option<usize> {
        self.settings.memory_budget
    }

    pub fn memory_used(&self) -> usize {
        self.outputs.memory_used()
    }

    /// Job registered under an identity, if any
    pub fn find_job(&self, kind: JobKind, batch: BatchId, key: JobKey) -> Option<JobHandle> {
        self.table.find(&JobIdentity { kind, batch, key })
    }

    /// Jobs prepared or in progress that have not been delivered
    pub fn num_registered_jobs(&self) -> usize {
        self.table.len()
    }

    pub fn stats(&self) -> CacheStats {
        let pending = {
            let queue = self.queue.lock();
            PendingCounts {
                low: queue.num_pending(Priority::Low),
                normal: queue.num_pending(Priority::Normal),
                high: queue.num_pending(Priority::High),
                force_local: queue.num_pending(Priority::ForceLocal),
            }
        };
        CacheStats {
            search_attempts: Counters::read(&self.counters.search_attempts),
            hits: Counters::read(&self.counters.hits),
            duplicates: Counters::read(&self.counters.duplicates),
            remote_queries: Counters::read(&self.counters.remote_queries),
            remote_hits: Counters::read(&self.counters.remote_hits),
            validation_mismatches: Counters::read(&self.counters.validation_mismatches),
            culled_entries: Counters::read(&self.counters.culled_entries),
            unique_inputs: self.index.len(),
            unique_outputs: self.outputs.len(),
            memory_used: self.outputs.memory_used(),
            memory_budget: self.settings.memory_budget.unwrap_or(0),
            pending,
            outstanding: self.num_outstanding(),
        }
    }
}
