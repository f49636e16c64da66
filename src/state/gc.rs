use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::dedup::DedupIndex;
use super::ledger::{RefLedger, Release};
use super::refcount::BlockRefCounter;
use crate::error::Result;
use crate::fs::Volume;
use crate::version::{self, PruneStats};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GcStats {
    pub blocks_freed: u64,
    pub versions_pruned: u64,
    pub last_run_time: u64,
    pub total_runs: u64,
}

impl GcStats {
    pub fn record(&mut self, pruned: PruneStats, swept: u64, at: u64) {
        self.versions_pruned += pruned.versions_pruned;
        self.blocks_freed += pruned.blocks_freed + swept;
        self.last_run_time = at;
        self.total_runs += 1;
    }
}

/// Give up one owner of `block`, returning it to the free pool when it was
/// the last. Returns whether the block was freed.
pub fn release_block(vol: &Volume, ledger: &mut RefLedger<'_>, block: u32) -> Result<bool> {
    match ledger.release(block) {
        Release::Shared => Ok(false),
        Release::Free => {
            vol.free_block(block)?;
            ledger.dedup_purge(block);
            Ok(true)
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Owners {
    live: u32,
    versions: u32,
}

/// Who references what, as found on disk.
#[derive(Debug, Default)]
pub struct Census {
    owners: HashMap<u32, Owners>,
    nodes: HashSet<u32>,
}

impl Census {
    /// Walk every live file and every chain reachable from it or from
    /// `extra_heads` (chains of deleted files).
    pub fn take(vol: &Volume, extra_heads: &[u32]) -> Result<Self> {
        let mut census = Census::default();
        let mut heads: Vec<u32> = extra_heads.to_vec();
        for (_, inode) in vol.file_inodes()? {
            for b in inode.blocks() {
                census.owners.entry(b).or_default().live += 1;
            }
            heads.extend(inode.version_head);
        }
        for head in heads {
            let mut cur = Some(head);
            while let Some(handle) = cur {
                if !census.nodes.insert(handle) {
                    break;
                }
                let node = version::load_node(vol, handle)?;
                for &b in &node.data_blocks {
                    census.owners.entry(b).or_default().versions += 1;
                }
                cur = node.prev_version;
            }
        }
        Ok(census)
    }

    pub fn is_reachable(&self, block: u32) -> bool {
        self.owners.contains_key(&block) || self.nodes.contains(&block)
    }

    /// Every block the census found: data blocks and version nodes.
    pub fn blocks(&self) -> impl Iterator<Item = u32> + '_ {
        self.owners.keys().chain(self.nodes.iter()).copied()
    }

    pub fn version_nodes(&self) -> usize {
        self.nodes.len()
    }
}

/// Repopulate the in-memory tables from disk at mount.
pub fn rebuild_tables(
    vol: &Volume,
    refs: &BlockRefCounter,
    dedup: &DedupIndex,
    extra_heads: &[u32],
) -> Result<()> {
    refs.clear();
    dedup.clear();
    let census = Census::take(vol, extra_heads)?;
    let mut blocks: Vec<(u32, Owners)> = census.owners.iter().map(|(b, o)| (*b, *o)).collect();
    blocks.sort_unstable_by_key(|(b, _)| *b);

    for (block, owners) in blocks {
        if owners.versions == 0 && owners.live < 2 {
            continue;
        }
        refs.set(block, owners.live + owners.versions)?;
        if owners.versions == 0 {
            continue;
        }
        let checksum = DedupIndex::hash(&vol.read_block(block)?);
        refs.set_checksum(block, checksum);
        for _ in 0..owners.versions {
            if let Err(e) = dedup.insert(checksum, block) {
                warn!("block {} left out of the dedup index: {}", block, e);
                break;
            }
        }
    }
    info!(
        "rebuilt tables: {} shared blocks, {} dedup entries, {} version nodes",
        refs.len(),
        dedup.len(),
        census.version_nodes()
    );
    Ok(())
}

/// Free allocated data blocks that nothing references. Runs inside a
/// transaction; returns the number freed.
pub fn collect_blocks(vol: &Volume, ledger: &mut RefLedger<'_>, census: &Census) -> Result<u64> {
    let mut freed = 0;
    for block in vol.allocated_data_blocks()? {
        if census.is_reachable(block) {
            continue;
        }
        debug!("block {} is unreachable", block);
        vol.free_block(block)?;
        ledger.forget(block);
        freed += 1;
    }
    if freed > 0 {
        warn!("reclaimed {} leaked blocks", freed);
    }
    Ok(freed)
}
