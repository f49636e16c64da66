//! Staged reference-table changes.
//!
//! An operation records its refcount and dedup mutations here while its
//! journal transaction is open, reading through the staged state so it sees
//! its own changes. Capacity is checked while staging, so a `TableFull`
//! aborts the transaction with nothing applied. [`RefLedger::apply`] runs
//! only after the commit.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use super::dedup::DedupIndex;
use super::refcount::BlockRefCounter;
use crate::error::{ChronoError, Result};

#[derive(Debug, Clone, Copy)]
enum DedupOp {
    Insert { checksum: u32, block: u32 },
    Remove { block: u32 },
    Purge { block: u32 },
}

/// What releasing one reference to a block means for its storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Other owners remain.
    Shared,
    /// The last owner is gone; the block goes back to the free pool.
    Free,
}

pub struct RefLedger<'a> {
    refs: &'a BlockRefCounter,
    dedup: &'a DedupIndex,
    deltas: HashMap<u32, i64>,
    /// Blocks this ledger starts tracking.
    new_refs: HashSet<u32>,
    dedup_ops: Vec<DedupOp>,
    /// Staged dedup registrations: block -> (checksum, net count change).
    dedup_staged: HashMap<u32, (u32, i64)>,
    dedup_new: HashSet<u32>,
    purged: HashSet<u32>,
    checksums: Vec<(u32, u32)>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LedgerSummary {
    pub refs_changed: usize,
    pub dedup_ops: usize,
}

impl<'a> RefLedger<'a> {
    pub fn new(refs: &'a BlockRefCounter, dedup: &'a DedupIndex) -> Self {
        Self {
            refs,
            dedup,
            deltas: HashMap::new(),
            new_refs: HashSet::new(),
            dedup_ops: Vec::new(),
            dedup_staged: HashMap::new(),
            dedup_new: HashSet::new(),
            purged: HashSet::new(),
            checksums: Vec::new(),
        }
    }

    /// Effective owner count including staged changes.
    pub fn count(&self, block: u32) -> u32 {
        let base = self.refs.get(block) as i64;
        (base + self.deltas.get(&block).copied().unwrap_or(0)).max(0) as u32
    }

    pub fn is_tracked(&self, block: u32) -> bool {
        self.count(block) > 0
    }

    pub fn inc(&mut self, block: u32) -> Result<u32> {
        if !self.refs.is_tracked(block) && !self.new_refs.contains(&block) {
            if self.new_refs.len() >= self.refs.free_slots() {
                warn!("refcount table cannot take block {}", block);
                return Err(ChronoError::TableFull("block refcount"));
            }
            self.new_refs.insert(block);
        }
        *self.deltas.entry(block).or_insert(0) += 1;
        Ok(self.count(block))
    }

    /// Give up one reference. Untracked blocks have a single owner, so
    /// releasing them always frees.
    pub fn release(&mut self, block: u32) -> Release {
        if self.count(block) == 0 {
            return Release::Free;
        }
        *self.deltas.entry(block).or_insert(0) -= 1;
        if self.count(block) == 0 {
            Release::Free
        } else {
            Release::Shared
        }
    }

    /// Dedup candidates for a checksum as this operation sees them.
    pub fn dedup_candidates(&self, checksum: u32) -> Vec<u32> {
        let mut out: Vec<u32> = self
            .dedup
            .candidates(checksum)
            .into_iter()
            .filter(|b| !self.purged.contains(b))
            .filter(|b| match self.dedup_staged.get(b) {
                Some(&(c, n)) => c == checksum && self.dedup_count(*b, n) > 0,
                None => true,
            })
            .collect();
        let mut staged: Vec<u32> = self
            .dedup_staged
            .iter()
            .filter(|&(b, &(c, n))| c == checksum && !out.contains(b) && self.dedup_count(*b, n) > 0)
            .map(|(b, _)| *b)
            .collect();
        staged.sort_unstable();
        out.extend(staged);
        out
    }

    fn dedup_count(&self, block: u32, staged: i64) -> i64 {
        let base = if self.purged.contains(&block) {
            0
        } else {
            self.dedup.get(block).map_or(0, |e| e.refcount as i64)
        };
        base + staged
    }

    pub fn dedup_insert(&mut self, checksum: u32, block: u32) -> Result<()> {
        let known = self.dedup.get(block).is_some() && !self.purged.contains(&block);
        if !known && !self.dedup_new.contains(&block) {
            if self.dedup_new.len() >= self.dedup.free_slots() {
                warn!("dedup table cannot take block {}", block);
                return Err(ChronoError::TableFull("dedup"));
            }
            self.dedup_new.insert(block);
        }
        let slot = self.dedup_staged.entry(block).or_insert((checksum, 0));
        slot.0 = checksum;
        slot.1 += 1;
        self.dedup_ops.push(DedupOp::Insert { checksum, block });
        self.checksums.push((block, checksum));
        Ok(())
    }

    pub fn dedup_remove(&mut self, block: u32) {
        let checksum = self
            .dedup_staged
            .get(&block)
            .map(|s| s.0)
            .or_else(|| self.dedup.get(block).map(|e| e.checksum))
            .unwrap_or(0);
        let slot = self.dedup_staged.entry(block).or_insert((checksum, 0));
        slot.1 -= 1;
        self.dedup_ops.push(DedupOp::Remove { block });
    }

    /// The block returns to the free pool: no index may point at it.
    pub fn dedup_purge(&mut self, block: u32) {
        self.purged.insert(block);
        self.dedup_staged.remove(&block);
        self.dedup_new.remove(&block);
        self.dedup_ops.push(DedupOp::Purge { block });
    }

    /// Drop every trace of a block from both tables.
    pub fn forget(&mut self, block: u32) {
        let base = self.refs.get(block) as i64;
        self.deltas.insert(block, -base);
        self.new_refs.remove(&block);
        self.dedup_purge(block);
    }

    /// Apply staged changes to the live tables. Call only after commit.
    pub fn apply(self) -> LedgerSummary {
        let mut summary = LedgerSummary::default();
        for (&block, &delta) in &self.deltas {
            if delta == 0 {
                continue;
            }
            summary.refs_changed += 1;
            let target = (self.refs.get(block) as i64 + delta).max(0) as u32;
            if let Err(e) = self.refs.set(block, target) {
                // Capacity was reserved while staging.
                warn!("refcount for block {} not applied: {}", block, e);
            }
        }
        for op in &self.dedup_ops {
            summary.dedup_ops += 1;
            match *op {
                DedupOp::Insert { checksum, block } => {
                    if let Err(e) = self.dedup.insert(checksum, block) {
                        warn!("dedup insert for block {} not applied: {}", block, e);
                    }
                }
                DedupOp::Remove { block } => {
                    if let Err(e) = self.dedup.remove(block) {
                        debug!("dedup remove skipped: {}", e);
                    }
                }
                DedupOp::Purge { block } => self.dedup.purge(block),
            }
        }
        for &(block, checksum) in &self.checksums {
            self.refs.set_checksum(block, checksum);
        }
        summary
    }
}
