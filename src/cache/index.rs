//! Input-hash index
//!
//! Each shard stores its entries in an append-only arena of fixed-size
//! blocks. A `CacheRef` names a slot by absolute block number, so refs held by
//! in-flight jobs stay valid while new blocks are appended or fully empty
//! leading blocks are dropped (only the base offset moves).

use super::output::OutputStore;
use crate::hash::{InputHash, OutputHash};
use crate::job::{JobHandle, Link};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{HashMap, VecDeque};
use tracing::trace;

/// Entries per arena block
pub const BLOCK_SIZE: usize = 512;

/// Stable address of a cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheRef {
    shard: u32,
    block: u32,
    slot: u32,
}

impl CacheRef {
    pub(crate) const fn new(shard: u32, block: u32, slot: u32) -> Self {
        Self { shard, block, slot }
    }

    pub fn shard(&self) -> usize {
        self.shard as usize
    }
}

/// What the cache knows about one input hash
#[derive(Debug)]
pub struct CacheEntry {
    pub hash: InputHash,
    pub output: Option<OutputHash>,
    /// The unique job currently producing this hash's output
    pub in_flight: Option<JobHandle>,
    /// Jobs waiting on `in_flight`
    pub duplicates: Vec<JobHandle>,
}

impl CacheEntry {
    fn new(hash: InputHash) -> Self {
        Self {
            hash,
            output: None,
            in_flight: None,
            duplicates: Vec::new(),
        }
    }

    /// Entries with a live job must never be culled
    pub fn is_evictable(&self) -> bool {
        self.in_flight.is_none() && self.duplicates.is_empty()
    }
}

struct Block {
    entries: Vec<Option<CacheEntry>>,
    live: usize,
}

impl Block {
    fn new() -> Self {
        Self {
            entries: Vec::with_capacity(BLOCK_SIZE),
            live: 0,
        }
    }

    fn is_spent(&self) -> bool {
        self.live == 0 && self.entries.len() == BLOCK_SIZE
    }
}

/// One independently locked slice of the index
pub struct IndexShard {
    id: u32,
    blocks: VecDeque<Block>,
    /// Absolute block number of `blocks[0]`
    base_block: u32,
    lookup: HashMap<InputHash, CacheRef>,
}

impl IndexShard {
    fn new(id: u32) -> Self {
        Self {
            id,
            blocks: VecDeque::new(),
            base_block: 0,
            lookup: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.lookup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lookup.is_empty()
    }

    pub fn find(&self, hash: &InputHash) -> Option<CacheRef> {
        self.lookup.get(hash).copied()
    }

    /// Look up `hash`, appending a new entry at the young end if absent
    pub fn find_or_add(&mut self, hash: InputHash) -> (CacheRef, &mut CacheEntry) {
        let cache_ref = match self.lookup.get(&hash) {
            Some(&cache_ref) => cache_ref,
            None => self.append(hash),
        };
        let offset = (cache_ref.block - self.base_block) as usize;
        let slot = &mut self.blocks[offset].entries[cache_ref.slot as usize];
        (cache_ref, slot.get_or_insert_with(|| CacheEntry::new(hash)))
    }

    fn append(&mut self, hash: InputHash) -> CacheRef {
        if self.blocks.back().map_or(true, |b| b.entries.len() == BLOCK_SIZE) {
            self.blocks.push_back(Block::new());
        }
        let block_index = self.blocks.len() - 1;
        let block = &mut self.blocks[block_index];
        let slot = block.entries.len();
        block.entries.push(Some(CacheEntry::new(hash)));
        block.live += 1;

        let cache_ref = CacheRef::new(self.id, self.base_block + block_index as u32, slot as u32);
        self.lookup.insert(hash, cache_ref);
        cache_ref
    }

    fn block_offset(&self, cache_ref: CacheRef) -> Option<usize> {
        debug_assert_eq!(cache_ref.shard, self.id);
        cache_ref
            .block
            .checked_sub(self.base_block)
            .map(|offset| offset as usize)
    }

    pub fn get(&self, cache_ref: CacheRef) -> Option<&CacheEntry> {
        let block = self.blocks.get(self.block_offset(cache_ref)?)?;
        block.entries.get(cache_ref.slot as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, cache_ref: CacheRef) -> Option<&mut CacheEntry> {
        let offset = self.block_offset(cache_ref)?;
        let block = self.blocks.get_mut(offset)?;
        block.entries.get_mut(cache_ref.slot as usize)?.as_mut()
    }

    /// Swap-remove the duplicate at `wait` from the entry's wait-list and fix
    /// up the wait index of the job moved into its place.
    pub(crate) fn remove_duplicate(&mut self, cache_ref: CacheRef, wait: usize) -> Option<JobHandle> {
        let entry = self.get_mut(cache_ref)?;
        if wait >= entry.duplicates.len() {
            return None;
        }
        let removed = entry.duplicates.swap_remove(wait);
        if let Some(moved) = entry.duplicates.get(wait) {
            let mut state = moved.state();
            if let Link::Duplicate {
                wait: ref mut index,
                ..
            } = state.link
            {
                *index = wait;
            }
        }
        Some(removed)
    }

    /// Evict entries from the oldest end until `outputs` is at or below
    /// `target` bytes. Entries with an in-flight job or waiting duplicates
    /// are skipped. Returns the number of entries removed.
    pub fn cull(&mut self, outputs: &OutputStore, target: usize) -> usize {
        let mut removed = 0;

        'blocks: for block in self.blocks.iter_mut() {
            for slot in block.entries.iter_mut() {
                if outputs.memory_used() <= target {
                    break 'blocks;
                }
                if !slot.as_ref().is_some_and(CacheEntry::is_evictable) {
                    continue;
                }
                if let Some(entry) = slot.take() {
                    if let Some(output) = entry.output {
                        outputs.release(&output);
                    }
                    self.lookup.remove(&entry.hash);
                    block.live -= 1;
                    removed += 1;
                }
            }
        }

        while self.blocks.front().is_some_and(Block::is_spent) {
            self.blocks.pop_front();
            self.base_block += 1;
        }

        if removed > 0 {
            trace!(
                "Shard {} culled {} entries, {} blocks remain",
                self.id,
                removed,
                self.blocks.len()
            );
        }
        removed
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }
}

/// Sharded map from input hash to cache entry
pub struct CacheIndex {
    shards: Box<[Mutex<IndexShard>]>,
    shard_bits: u32,
}

impl CacheIndex {
    pub fn new(shard_bits: u8) -> Self {
        let shard_bits = u32::from(shard_bits);
        let shards = (0..1u32 << shard_bits)
            .map(|id| Mutex::new(IndexShard::new(id)))
            .collect();
        Self { shards, shard_bits }
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_for(&self, hash: &InputHash) -> usize {
        if self.shard_bits == 0 {
            return 0;
        }
        (hash.prefix() >> (64 - self.shard_bits)) as usize
    }

    pub fn lock(&self, shard: usize) -> MutexGuard<'_, IndexShard> {
        self.shards[shard].lock()
    }

    pub fn lock_for(&self, hash: &InputHash) -> MutexGuard<'_, IndexShard> {
        self.lock(self.shard_for(hash))
    }

    /// Number of tracked input hashes
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for CacheIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheIndex")
            .field("shards", &self.shards.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::ContentHasher;
    use crate::job::test_support::job;
    use crate::job::JobOutput;
    use std::sync::Arc;

    fn hash(n: u64) -> InputHash {
        let mut hasher = ContentHasher::new();
        hasher.update_u64(n);
        hasher.finish_input()
    }

    fn store_output(shard: &mut IndexShard, outputs: &OutputStore, n: u64, len: usize) {
        let out = JobOutput::new(vec![(n % 251) as u8; len]).with_blob(n.to_le_bytes().to_vec());
        let out_hash = out.hash();
        outputs.add_output(out_hash, &out, 0, None);
        shard.find_or_add(hash(n)).1.output = Some(out_hash);
    }

    #[test]
    fn find_or_add_is_stable() {
        let mut shard = IndexShard::new(0);
        let a = shard.find_or_add(hash(1)).0;
        let b = shard.find_or_add(hash(1)).0;
        assert_eq!(a, b);
        assert_eq!(shard.len(), 1);
        assert_eq!(shard.get(a).unwrap().hash, hash(1));
        assert_eq!(shard.find(&hash(2)), None);
    }

    #[test]
    fn refs_survive_block_growth() {
        let mut shard = IndexShard::new(0);
        let refs: Vec<_> = (0..(BLOCK_SIZE as u64 * 3)).map(|n| shard.find_or_add(hash(n)).0).collect();
        assert_eq!(shard.num_blocks(), 3);
        for (n, cache_ref) in refs.iter().enumerate() {
            assert_eq!(shard.get(*cache_ref).unwrap().hash, hash(n as u64));
        }
    }

    #[test]
    fn cull_removes_oldest_and_drops_leading_blocks() {
        let outputs = OutputStore::new();
        let mut shard = IndexShard::new(0);
        let total = BLOCK_SIZE as u64 * 2 + 10;
        for n in 0..total {
            store_output(&mut shard, &outputs, n, 100);
        }
        let newest = shard.find(&hash(total - 1)).unwrap();

        let target = outputs.memory_used() / 4;
        let removed = shard.cull(&outputs, target);
        assert!(removed > BLOCK_SIZE);
        assert!(outputs.memory_used() <= target);
        assert!(shard.find(&hash(0)).is_none());
        assert_eq!(shard.num_blocks(), 2);

        // refs into surviving blocks still resolve after the base moved
        assert_eq!(shard.get(newest).unwrap().hash, hash(total - 1));
    }

    #[test]
    fn cull_skips_entries_with_live_jobs() {
        let outputs = OutputStore::new();
        let mut shard = IndexShard::new(0);
        for n in 0..4 {
            store_output(&mut shard, &outputs, n, 1000);
        }
        let pinned = shard.find(&hash(0)).unwrap();
        shard.get_mut(pinned).unwrap().in_flight = Some(job(1, 1, 0));

        shard.cull(&outputs, 0);
        assert_eq!(shard.len(), 1);
        assert!(shard.get(pinned).is_some());
        assert!(outputs.memory_used() > 0);
    }

    #[test]
    fn shared_output_survives_until_last_entry_culled() {
        let outputs = OutputStore::new();
        let mut shard = IndexShard::new(0);
        let out = JobOutput::new(vec![7u8; 500]);
        let out_hash = out.hash();
        for n in 0..2 {
            outputs.add_output(out_hash, &out, 0, None);
            shard.find_or_add(hash(n)).1.output = Some(out_hash);
        }
        let second = shard.find(&hash(1)).unwrap();
        shard.get_mut(second).unwrap().in_flight = Some(job(1, 1, 1));

        shard.cull(&outputs, 0);
        assert!(outputs.contains(&out_hash));
        assert_eq!(outputs.refs(&out_hash), 1);
    }

    #[test]
    fn remove_duplicate_fixes_wait_index() {
        let mut shard = IndexShard::new(0);
        let cache_ref = shard.find_or_add(hash(9)).0;
        let dups: Vec<_> = (0..3).map(|k| job(1, k, 9)).collect();
        for (i, d) in dups.iter().enumerate() {
            d.state().link = Link::Duplicate {
                cache_ref,
                wait: i,
                registry: i,
            };
            shard.get_mut(cache_ref).unwrap().duplicates.push(d.clone());
        }

        let removed = shard.remove_duplicate(cache_ref, 0).unwrap();
        assert!(Arc::ptr_eq(&removed, &dups[0]));
        match dups[2].link() {
            Link::Duplicate { wait, .. } => assert_eq!(wait, 0),
            other => panic!("unexpected link {other:?}"),
        }
        assert_eq!(shard.get(cache_ref).unwrap().duplicates.len(), 2);
    }

    #[test]
    fn shard_selection_uses_high_bits() {
        let index = CacheIndex::new(2);
        assert_eq!(index.num_shards(), 4);
        let mut bytes = [0u8; 32];
        bytes[0] = 0b1100_0000;
        assert_eq!(index.shard_for(&InputHash::from_bytes(bytes)), 3);
        assert_eq!(CacheIndex::new(0).shard_for(&InputHash::from_bytes(bytes)), 0);
    }
}
