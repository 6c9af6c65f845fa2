//! Reference-counted store of completed outputs
//!
//! Outputs are keyed by their own hash, so distinct inputs that produce
//! byte-identical results share one stored payload. Each cache entry that
//! points at an output holds one reference.

use crate::hash::OutputHash;
use crate::job::JobOutput;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::trace;

struct StoredOutput {
    output: JobOutput,
    refs: u32,
    hits: u64,
    size: usize,
    /// Name of the job that first produced this output
    debug_name: Option<String>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<OutputHash, StoredOutput>,
}

/// Deduplicated output payloads with memory accounting
#[derive(Default)]
pub struct OutputStore {
    inner: Mutex<Inner>,
    memory_used: AtomicUsize,
}

impl OutputStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn footprint(output: &JobOutput) -> usize {
        output.size_bytes() + mem::size_of::<StoredOutput>() + output.blobs.len() * mem::size_of::<bytes::Bytes>()
    }

    /// Take a reference on `hash`, storing `output` if it is not present yet.
    /// Returns true if a new entry was created.
    pub fn add_output(
        &self,
        hash: OutputHash,
        output: &JobOutput,
        initial_hits: u64,
        debug_name: Option<String>,
    ) -> bool {
        let mut inner = self.inner.lock();
        if let Some(stored) = inner.entries.get_mut(&hash) {
            stored.refs += 1;
            stored.hits += initial_hits;
            return false;
        }

        let size = Self::footprint(output);
        inner.entries.insert(
            hash,
            StoredOutput {
                output: output.clone(),
                refs: 1,
                hits: initial_hits,
                size,
                debug_name,
            },
        );
        self.memory_used.fetch_add(size, Ordering::AcqRel);
        trace!("Stored output {} ({} bytes)", hash, size);
        true
    }

    /// Drop one reference. Returns true if the entry was freed.
    pub fn release(&self, hash: &OutputHash) -> bool {
        let mut inner = self.inner.lock();
        let Some(stored) = inner.entries.get_mut(hash) else {
            debug_assert!(false, "releasing unknown output {hash}");
            return false;
        };
        stored.refs -= 1;
        if stored.refs > 0 {
            return false;
        }

        if let Some(stored) = inner.entries.remove(hash) {
            self.memory_used.fetch_sub(stored.size, Ordering::AcqRel);
            trace!("Freed output {} ({} bytes)", hash, stored.size);
        }
        true
    }

    /// Fetch a stored payload for a cache hit
    pub fn get_for_hit(&self, hash: &OutputHash) -> Option<JobOutput> {
        let mut inner = self.inner.lock();
        let stored = inner.entries.get_mut(hash)?;
        stored.hits += 1;
        Some(stored.output.clone())
    }

    pub fn contains(&self, hash: &OutputHash) -> bool {
        self.inner.lock().entries.contains_key(hash)
    }

    pub fn refs(&self, hash: &OutputHash) -> u32 {
        self.inner.lock().entries.get(hash).map_or(0, |s| s.refs)
    }

    pub fn hits(&self, hash: &OutputHash) -> u64 {
        self.inner.lock().entries.get(hash).map_or(0, |s| s.hits)
    }

    pub fn debug_name(&self, hash: &OutputHash) -> Option<String> {
        self.inner.lock().entries.get(hash)?.debug_name.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tracked bytes across all stored outputs
    pub fn memory_used(&self) -> usize {
        self.memory_used.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn output(byte: u8, len: usize) -> JobOutput {
        JobOutput::new(vec![byte; len])
    }

    #[test]
    fn identical_outputs_share_one_entry() {
        let store = OutputStore::new();
        let out = output(1, 100);
        let hash = out.hash();

        assert!(store.add_output(hash, &out, 0, Some("first".into())));
        assert!(!store.add_output(hash, &out, 2, Some("second".into())));
        assert_eq!(store.len(), 1);
        assert_eq!(store.refs(&hash), 2);
        assert_eq!(store.hits(&hash), 2);
        assert_eq!(store.debug_name(&hash).as_deref(), Some("first"));
    }

    #[test]
    fn release_frees_at_zero() {
        let store = OutputStore::new();
        let out = output(2, 1000);
        let hash = out.hash();
        store.add_output(hash, &out, 0, None);
        store.add_output(hash, &out, 0, None);
        let used = store.memory_used();
        assert!(used >= 1000);

        assert!(!store.release(&hash));
        assert_eq!(store.memory_used(), used);
        assert!(store.release(&hash));
        assert_eq!(store.memory_used(), 0);
        assert!(store.get_for_hit(&hash).is_none());
    }

    #[test]
    fn hit_returns_shared_payload() {
        let store = OutputStore::new();
        let out = output(3, 64).with_blob(vec![9u8; 32]);
        let hash = out.hash();
        store.add_output(hash, &out, 0, None);

        let fetched = store.get_for_hit(&hash).unwrap();
        assert_eq!(fetched, out);
        assert_eq!(fetched.data.as_ptr(), out.data.as_ptr());
        assert_eq!(store.hits(&hash), 1);
    }

    proptest! {
        #[test]
        fn memory_returns_to_zero(sizes in prop::collection::vec((0u8..8, 1usize..256), 1..40)) {
            let store = OutputStore::new();
            let mut held = Vec::new();
            for (byte, len) in sizes {
                let out = output(byte, len);
                let hash = out.hash();
                store.add_output(hash, &out, 0, None);
                held.push(hash);
            }
            for hash in &held {
                store.release(hash);
            }
            prop_assert_eq!(store.memory_used(), 0);
            prop_assert!(store.is_empty());
        }
    }
}
