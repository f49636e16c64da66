use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use crate::error::{ChronoError, Result};
use crate::fs::cas;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DedupEntry {
    pub checksum: u32,
    pub block_num: u32,
    pub refcount: u32,
}

struct DedupTable {
    by_block: HashMap<u32, DedupEntry>,
    /// checksum -> blocks, in registration order
    by_checksum: HashMap<u32, Vec<u32>>,
    capacity: usize,
}

impl DedupTable {
    fn unlink_checksum(&mut self, checksum: u32, block: u32) {
        if let Some(list) = self.by_checksum.get_mut(&checksum) {
            list.retain(|&b| b != block);
            if list.is_empty() {
                self.by_checksum.remove(&checksum);
            }
        }
    }
}

/// Content checksum -> block index. Hits are candidates only: the
/// checksum is not collision-free, so callers compare bytes before reuse.
pub struct DedupIndex {
    table: Mutex<DedupTable>,
}

impl DedupIndex {
    pub fn new(capacity: usize) -> Self {
        Self {
            table: Mutex::new(DedupTable {
                by_block: HashMap::new(),
                by_checksum: HashMap::new(),
                capacity,
            }),
        }
    }

    pub fn hash(data: &[u8]) -> u32 {
        cas::block_checksum(data)
    }

    /// First registered block with this checksum. A match is only a
    /// candidate; its bytes still have to be compared.
    pub fn find(&self, checksum: u32) -> Option<u32> {
        let t = self.table.lock();
        t.by_checksum.get(&checksum).and_then(|blocks| {
            blocks
                .iter()
                .copied()
                .find(|b| t.by_block.get(b).is_some_and(|e| e.refcount > 0))
        })
    }

    /// Every registered block with this checksum, oldest registration first.
    /// Versioning goes through this rather than [`find`](Self::find) so a
    /// checksum collision on the first entry does not hide a real match
    /// further down.
    pub fn candidates(&self, checksum: u32) -> Vec<u32> {
        self.table
            .lock()
            .by_checksum
            .get(&checksum)
            .cloned()
            .unwrap_or_default()
    }

    /// Register a reference to `block` under `checksum`. A block already
    /// present has its checksum refreshed and its count bumped.
    pub fn insert(&self, checksum: u32, block: u32) -> Result<()> {
        let mut t = self.table.lock();
        if let Some(entry) = t.by_block.get_mut(&block) {
            let old = entry.checksum;
            entry.checksum = checksum;
            entry.refcount += 1;
            if old != checksum {
                t.unlink_checksum(old, block);
                t.by_checksum.entry(checksum).or_default().push(block);
            }
            return Ok(());
        }
        if t.by_block.len() >= t.capacity {
            warn!("dedup table full ({} entries)", t.capacity);
            return Err(ChronoError::TableFull("dedup"));
        }
        t.by_block.insert(
            block,
            DedupEntry {
                checksum,
                block_num: block,
                refcount: 1,
            },
        );
        t.by_checksum.entry(checksum).or_default().push(block);
        Ok(())
    }

    /// Drop one reference; the entry disappears at 0. Returns the new count.
    pub fn remove(&self, block: u32) -> Result<u32> {
        let mut t = self.table.lock();
        let Some(entry) = t.by_block.get_mut(&block) else {
            return Err(ChronoError::NotFound(format!("dedup entry for block {}", block)));
        };
        entry.refcount = entry.refcount.saturating_sub(1);
        let (count, checksum) = (entry.refcount, entry.checksum);
        if count == 0 {
            t.by_block.remove(&block);
            t.unlink_checksum(checksum, block);
        }
        Ok(count)
    }

    /// Forget a block entirely (it went back to the free pool).
    pub fn purge(&self, block: u32) {
        let mut t = self.table.lock();
        if let Some(entry) = t.by_block.remove(&block) {
            t.unlink_checksum(entry.checksum, block);
        }
    }

    pub fn get(&self, block: u32) -> Option<DedupEntry> {
        self.table.lock().by_block.get(&block).copied()
    }

    pub fn len(&self) -> usize {
        self.table.lock().by_block.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn free_slots(&self) -> usize {
        let t = self.table.lock();
        t.capacity.saturating_sub(t.by_block.len())
    }

    pub fn clear(&self) {
        let mut t = self.table.lock();
        t.by_block.clear();
        t.by_checksum.clear();
    }
}
