//! Local cache tier
//!
//! The index maps input hashes to entries; the output store holds the
//! deduplicated payloads those entries point at.
//!
//! | Entry state | `output` | `in_flight` | Meaning |
//! |-------------|----------|-------------|---------|
//! | Cached | some | none | Hits are served synchronously |
//! | In flight | none | some | New submissions wait as duplicates |
//! | Empty | none | none | Seen before, result not kept |

pub mod index;
pub mod output;

pub use index::{CacheEntry, CacheIndex, CacheRef, IndexShard, BLOCK_SIZE};
pub use output::OutputStore;
