//! Content hashing for job inputs and outputs
//!
//! Both hashes are SHA-256 digests. `InputHash` keys the cache index and the
//! remote store; `OutputHash` deduplicates stored payloads across inputs.

use sha2::{Digest, Sha256};
use std::fmt;

macro_rules! digest_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name([u8; 32]);

        impl $name {
            /// Wrap raw digest bytes
            pub const fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Leading 64 bits, used for shard selection
            pub fn prefix(&self) -> u64 {
                let mut head = [0u8; 8];
                head.copy_from_slice(&self.0[..8]);
                u64::from_be_bytes(head)
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(&self.0[..8]))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }
    };
}

digest_type!(
    /// Deterministic hash over a job's full input description
    InputHash
);

digest_type!(
    /// Hash over a completed output payload
    OutputHash
);

/// Incremental hasher handed to `JobInput::hash_input`
#[derive(Clone, Default)]
pub struct ContentHasher {
    inner: Sha256,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) -> &mut Self {
        self.inner.update(bytes);
        self
    }

    /// Length-prefixed so adjacent strings cannot collide
    pub fn update_str(&mut self, value: &str) -> &mut Self {
        self.update_u64(value.len() as u64);
        self.inner.update(value.as_bytes());
        self
    }

    pub fn update_u32(&mut self, value: u32) -> &mut Self {
        self.inner.update(value.to_le_bytes());
        self
    }

    pub fn update_u64(&mut self, value: u64) -> &mut Self {
        self.inner.update(value.to_le_bytes());
        self
    }

    pub fn finish_input(self) -> InputHash {
        InputHash(self.inner.finalize().into())
    }

    pub fn finish_output(self) -> OutputHash {
        OutputHash(self.inner.finalize().into())
    }
}
