//! Simulate command - drive a synthetic workload through a real cache

use crate::cli::args::{OutputFormat, SimulateArgs};
use crate::config::Config;
use crate::error::{JobCacheError, JobCacheResult};
use crate::job::{BatchId, JobStatus, Priority, ResultGroup};
use crate::manager::JobCache;
use crate::remote::{InMemoryRemoteCache, RemoteMode};
use crate::stats::{format_bytes, CacheStats, MemoryStatus};
use crate::ui::{self, SimulationProgress, UiContext};
use crate::workload::{input_hash_for, synthesize_output, PoolOptions, SyntheticInput, WorkerPool};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const JOB_KIND: u32 = 1;
const JOBS_PER_BATCH: usize = 256;
const REMOTE_LATENCY: Duration = Duration::from_millis(2);
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Resolved simulation parameters
#[derive(Debug, Clone, Serialize)]
struct Plan {
    jobs: usize,
    distinct_inputs: usize,
    workers: usize,
    batch_size: usize,
    output_bytes: usize,
    remote_seeded: usize,
    async_remote: bool,
    validate: bool,
}

impl Plan {
    fn resolve(args: &SimulateArgs, config: &Config) -> JobCacheResult<Self> {
        let defaults = &config.simulate;
        let distinct_inputs = args.distinct.unwrap_or(defaults.distinct_inputs);
        if distinct_inputs == 0 {
            return Err(JobCacheError::User(
                "--distinct must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            jobs: args.jobs.unwrap_or(defaults.jobs),
            distinct_inputs,
            workers: args.workers.unwrap_or(defaults.workers).max(1),
            batch_size: args.batch.unwrap_or(defaults.batch_size).max(1),
            output_bytes: defaults.output_bytes,
            remote_seeded: (distinct_inputs as f64 * args.remote_hit_rate).round() as usize,
            async_remote: args.async_remote,
            validate: args.validate || config.cache.debug_validate,
        })
    }

    /// Spread jobs over the distinct inputs so repeats are interleaved
    fn seed_for(&self, job: usize) -> u64 {
        ((job as u64).wrapping_mul(7919)) % self.distinct_inputs as u64
    }

    fn priority_for(job: usize) -> Priority {
        if job % 16 == 0 {
            Priority::High
        } else {
            Priority::Normal
        }
    }
}

/// Terminal statuses seen by the result group
#[derive(Debug, Default)]
struct Tally {
    cache_hits: AtomicU64,
    remote_hits: AtomicU64,
    completed: AtomicU64,
    other: AtomicU64,
}

impl Tally {
    fn record(&self, status: JobStatus) {
        let counter = match status {
            JobStatus::CompleteCacheHit => &self.cache_hits,
            JobStatus::CompleteRemoteHit => &self.remote_hits,
            JobStatus::Complete => &self.completed,
            _ => &self.other,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StatusCounts {
        StatusCounts {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            remote_hits: self.remote_hits.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            other: self.other.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
struct StatusCounts {
    cache_hits: u64,
    remote_hits: u64,
    completed: u64,
    other: u64,
}

#[derive(Debug, Serialize)]
struct SimulationReport {
    plan: Plan,
    elapsed_ms: u128,
    executed: u64,
    statuses: StatusCounts,
    remote_entries: usize,
    remote_puts: u64,
    cache: CacheStats,
}

/// Execute the simulate command
pub async fn execute(args: SimulateArgs, config: &Config) -> JobCacheResult<()> {
    let ctx = UiContext::detect();
    let plan = Plan::resolve(&args, config)?;
    let mut config = config.clone();
    config.cache.debug_validate = plan.validate;

    let mode = if plan.async_remote {
        RemoteMode::Deferred {
            latency: REMOTE_LATENCY,
        }
    } else {
        RemoteMode::Immediate
    };
    let remote = Arc::new(InMemoryRemoteCache::new(mode));
    for seed in 0..plan.remote_seeded as u64 {
        let hash = input_hash_for(JOB_KIND, &SyntheticInput::new(seed));
        remote.insert(hash, synthesize_output(&hash, plan.output_bytes));
    }
    debug!("Seeded remote cache with {} entries", remote.len());

    let cache = JobCache::builder(&config).remote(remote.clone()).build()?;

    let tally = Arc::new(Tally::default());
    let group = {
        let tally = tally.clone();
        Arc::new(ResultGroup::new().on_job_complete(move |_, status| tally.record(status)))
    };

    if args.format == OutputFormat::Table {
        ui::intro(&ctx, "Job cache simulation");
    }
    info!(
        "Simulating {} jobs over {} inputs with {} workers",
        plan.jobs, plan.distinct_inputs, plan.workers
    );

    let started = Instant::now();
    let pool = WorkerPool::spawn(
        cache.clone(),
        PoolOptions {
            workers: plan.workers,
            batch_size: plan.batch_size,
            output_bytes: plan.output_bytes,
            work: Duration::from_micros(config.simulate.work_micros),
            ..PoolOptions::default()
        },
    );

    let mut submitted = Vec::with_capacity(JOBS_PER_BATCH);
    for job in 0..plan.jobs {
        let batch = (job / JOBS_PER_BATCH) as BatchId;
        let input = SyntheticInput::new(plan.seed_for(job)).into_input();
        let prepared = cache.prepare_job(
            JOB_KIND,
            batch,
            job as u64,
            Plan::priority_for(job),
            input,
            &group,
        );
        submitted.push(prepared.into_job());
        if submitted.len() == JOBS_PER_BATCH {
            cache.submit_jobs(std::mem::take(&mut submitted));
        }
    }
    cache.submit_jobs(submitted);

    let progress = SimulationProgress::new(
        &(if args.format == OutputFormat::Table {
            ctx
        } else {
            UiContext::non_interactive()
        }),
        plan.jobs as u64,
    );
    while !group.is_complete() {
        progress.set_done(group.num_finished() as u64, pool.executed());
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    progress.finish();

    let executed = tokio::task::spawn_blocking(move || pool.shutdown())
        .await
        .map_err(|e| JobCacheError::Internal(format!("worker pool shutdown failed: {e}")))?;

    let report = SimulationReport {
        elapsed_ms: started.elapsed().as_millis(),
        executed,
        statuses: tally.snapshot(),
        remote_entries: remote.len(),
        remote_puts: remote.num_puts(),
        cache: cache.stats(),
        plan,
    };

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Table => print_report(&ctx, &report),
    }

    Ok(())
}

fn percent(rate: f64) -> String {
    format!("{:.1}%", rate * 100.0)
}

fn print_report(ctx: &UiContext, report: &SimulationReport) {
    let stats = &report.cache;

    ui::section(ctx, "Workload");
    ui::key_value(ctx, "Jobs", &report.plan.jobs.to_string());
    ui::key_value(ctx, "Distinct inputs", &report.plan.distinct_inputs.to_string());
    ui::key_value(ctx, "Workers", &report.plan.workers.to_string());
    ui::key_value(ctx, "Executed", &report.executed.to_string());
    ui::key_value(ctx, "Elapsed", &format!("{} ms", report.elapsed_ms));

    ui::section(ctx, "Results");
    ui::key_value(ctx, "Local hits", &report.statuses.cache_hits.to_string());
    ui::key_value(ctx, "Remote hits", &report.statuses.remote_hits.to_string());
    ui::key_value(ctx, "Completed", &report.statuses.completed.to_string());
    if report.statuses.other > 0 {
        ui::key_value_status(ctx, "Other", &report.statuses.other.to_string(), false);
    }

    ui::section(ctx, "Cache");
    ui::key_value(ctx, "Search attempts", &stats.search_attempts.to_string());
    ui::key_value(ctx, "Duplicates", &stats.duplicates.to_string());
    ui::key_value(ctx, "Local hit rate", &percent(stats.local_hit_rate()));
    ui::key_value(
        ctx,
        "Remote hit rate",
        &format!(
            "{} of {} queries",
            percent(stats.remote_hit_rate()),
            stats.remote_queries
        ),
    );
    ui::key_value(ctx, "Unique inputs", &stats.unique_inputs.to_string());
    ui::key_value(ctx, "Unique outputs", &stats.unique_outputs.to_string());
    ui::key_value(ctx, "Remote writes", &report.remote_puts.to_string());

    let budget = if stats.memory_budget == 0 {
        "unlimited".to_string()
    } else {
        format_bytes(stats.memory_budget as u64)
    };
    ui::key_value_status(
        ctx,
        "Memory",
        &format!("{} / {}", format_bytes(stats.memory_used as u64), budget),
        stats.memory_status() != MemoryStatus::Exceeded,
    );
    if stats.culled_entries > 0 {
        ui::key_value(ctx, "Culled entries", &stats.culled_entries.to_string());
    }
    if report.plan.validate {
        ui::key_value_status(
            ctx,
            "Validation mismatches",
            &stats.validation_mismatches.to_string(),
            stats.validation_mismatches == 0,
        );
    }

    if report.statuses.other == 0 && stats.validation_mismatches == 0 {
        ui::outro_success(ctx, "Simulation complete");
    } else {
        ui::outro_warn(ctx, "Simulation finished with unexpected results");
    }
}
