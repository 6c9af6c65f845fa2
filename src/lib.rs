//! jobcache - content-addressed compile job cache
//!
//! Deduplicates compile jobs by input hash, answers repeats from a local
//! in-memory cache or an optional remote tier, and schedules the remaining
//! unique jobs by priority for a worker pool.

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod hash;
pub mod job;
pub mod manager;
pub mod queue;
pub mod remote;
pub mod stats;
pub mod table;
pub mod ui;
pub mod workload;

pub use error::{JobCacheError, JobCacheResult};
pub use hash::{ContentHasher, InputHash, OutputHash};
pub use job::{
    BatchId, Job, JobHandle, JobInput, JobKey, JobKind, JobOutput, JobStatus, Priority,
    ResultGroup, WorkerKind,
};
pub use manager::{JobCache, JobCacheBuilder};
pub use remote::{Outcome, RemoteCache};
pub use stats::{CacheStats, StatsSink};
pub use table::Prepared;
