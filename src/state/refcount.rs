use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{ChronoError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockRefEntry {
    pub block_num: u32,
    /// Always > 0 while the entry exists.
    pub refcount: u32,
    pub checksum: u32,
}

struct RefTable {
    entries: HashMap<u32, BlockRefEntry>,
    capacity: usize,
}

/// Counts the logical owners of shared blocks. A block that is not in the
/// table has exactly one owner and may be freed directly.
pub struct BlockRefCounter {
    table: Mutex<RefTable>,
}

impl BlockRefCounter {
    pub fn new(capacity: usize) -> Self {
        Self {
            table: Mutex::new(RefTable {
                entries: HashMap::new(),
                capacity,
            }),
        }
    }

    /// Add one owner, registering the block at count 0 first if needed.
    pub fn inc(&self, block: u32) -> Result<u32> {
        let mut t = self.table.lock();
        if !t.entries.contains_key(&block) && t.entries.len() >= t.capacity {
            warn!("refcount table full ({} entries)", t.capacity);
            return Err(ChronoError::TableFull("block refcount"));
        }
        let entry = t.entries.entry(block).or_insert(BlockRefEntry {
            block_num: block,
            refcount: 0,
            checksum: 0,
        });
        entry.refcount += 1;
        Ok(entry.refcount)
    }

    /// Drop one owner. Untracked blocks stay at 0; an entry that reaches 0
    /// is removed.
    pub fn dec(&self, block: u32) -> u32 {
        let mut t = self.table.lock();
        let Some(entry) = t.entries.get_mut(&block) else {
            return 0;
        };
        entry.refcount = entry.refcount.saturating_sub(1);
        let count = entry.refcount;
        if count == 0 {
            t.entries.remove(&block);
            debug!("block {} no longer shared", block);
        }
        count
    }

    pub fn get(&self, block: u32) -> u32 {
        self.table
            .lock()
            .entries
            .get(&block)
            .map_or(0, |e| e.refcount)
    }

    pub fn is_tracked(&self, block: u32) -> bool {
        self.table.lock().entries.contains_key(&block)
    }

    /// Force a count; 0 removes the entry.
    pub fn set(&self, block: u32, count: u32) -> Result<()> {
        let mut t = self.table.lock();
        if count == 0 {
            t.entries.remove(&block);
            return Ok(());
        }
        if !t.entries.contains_key(&block) && t.entries.len() >= t.capacity {
            return Err(ChronoError::TableFull("block refcount"));
        }
        let entry = t.entries.entry(block).or_insert(BlockRefEntry {
            block_num: block,
            refcount: 0,
            checksum: 0,
        });
        entry.refcount = count;
        Ok(())
    }

    /// Remember the content checksum of a tracked block.
    pub fn set_checksum(&self, block: u32, checksum: u32) {
        if let Some(entry) = self.table.lock().entries.get_mut(&block) {
            entry.checksum = checksum;
        }
    }

    pub fn entry(&self, block: u32) -> Option<BlockRefEntry> {
        self.table.lock().entries.get(&block).copied()
    }

    pub fn len(&self) -> usize {
        self.table.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn free_slots(&self) -> usize {
        let t = self.table.lock();
        t.capacity.saturating_sub(t.entries.len())
    }

    pub fn clear(&self) {
        self.table.lock().entries.clear();
    }
}
