//! Remote cache tier
//!
//! The remote store is optional and shared. Lookups may be answered inline
//! (`Outcome::Immediate`) or later (`Outcome::Pending`); the cache handles
//! both through the same completion path, so no re-entrancy detection is
//! needed. Any failure inside an implementation should surface as a miss.

pub mod memory;

pub use memory::{InMemoryRemoteCache, RemoteMode};

use crate::hash::InputHash;
use crate::job::{JobOutput, Priority};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use tokio_util::sync::CancellationToken;

/// Result of a remote lookup
pub enum Outcome {
    /// The store answered synchronously
    Immediate(Option<JobOutput>),
    /// The answer arrives when the future resolves
    Pending(BoxFuture<'static, Option<JobOutput>>),
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Immediate(output) => f
                .debug_tuple("Immediate")
                .field(&output.as_ref().map(JobOutput::size_bytes))
                .finish(),
            Outcome::Pending(_) => f.write_str("Pending"),
        }
    }
}

/// Shared content-addressable store keyed by input hash
#[async_trait]
pub trait RemoteCache: Send + Sync {
    /// Look up `hash`. Never blocks on I/O; slow paths return `Pending`.
    fn get(&self, hash: &InputHash, priority: Priority) -> Outcome;

    /// Store `output` under `hash`. Errors are swallowed by the implementation.
    async fn put(&self, hash: InputHash, output: JobOutput);

    /// Get the store name for logging
    fn name(&self) -> &'static str;
}

/// In-flight remote lookup owned by a submitting job
pub(crate) struct RemoteRequest {
    token: CancellationToken,
    done: Mutex<bool>,
    finished: Condvar,
}

impl RemoteRequest {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            done: Mutex::new(false),
            finished: Condvar::new(),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Acknowledge that the lookup will not touch its job again
    pub fn finish(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.finished.notify_all();
    }

    /// Block until `finish` has been called
    pub fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.finished.wait(&mut done);
        }
    }
}
