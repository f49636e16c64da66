//! Version chains.
//!
//! A file's versions form a singly-linked list of [`VersionNode`]s on disk,
//! newest first, headed by the inode's `version_head`. Node block numbers
//! double as handles. Ordinal 0 is always the oldest surviving version.

pub mod node;

use std::collections::HashSet;

use serde::Serialize;
use tracing::{debug, info};

pub use self::node::VersionNode;
use crate::error::{ChronoError, Result};
use crate::fs::layout::{InodeFlags, InodeType, NAME_MAX};
use crate::fs::{now, Volume};
use crate::state::dedup::DedupIndex;
use crate::state::gc::release_block;
use crate::state::ledger::RefLedger;

/// A version as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionInfo {
    pub version_num: u32,
    pub handle: u32,
    pub timestamp: u64,
    pub file_size: u32,
    pub block_count: u32,
    pub description: String,
    pub snapshot_id: Option<u32>,
}

impl VersionInfo {
    fn new(version_num: usize, handle: u32, node: &VersionNode) -> Self {
        Self {
            version_num: version_num as u32,
            handle,
            timestamp: node.timestamp,
            file_size: node.file_size,
            block_count: node.block_count() as u32,
            description: node.description.clone(),
            snapshot_id: node.snapshot_id,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PruneStats {
    pub versions_pruned: u64,
    pub blocks_freed: u64,
}

impl PruneStats {
    pub fn absorb(&mut self, other: PruneStats) {
        self.versions_pruned += other.versions_pruned;
        self.blocks_freed += other.blocks_freed;
    }
}

pub fn check_description(description: &str) -> Result<()> {
    if description.len() > NAME_MAX || description.as_bytes().contains(&0) {
        return Err(ChronoError::InvalidArgument(format!(
            "description {:?} longer than {} bytes",
            description, NAME_MAX
        )));
    }
    Ok(())
}

pub fn load_node(vol: &Volume, handle: u32) -> Result<VersionNode> {
    if !vol.superblock().is_data_block(handle) {
        return Err(ChronoError::CorruptData(format!(
            "version handle {} outside the data region",
            handle
        )));
    }
    VersionNode::decode(handle, &vol.read_block(handle)?)
}

pub fn store_node(vol: &Volume, handle: u32, node: &VersionNode) -> Result<()> {
    vol.write_block(handle, &node.encode())
}

/// Up to `limit` nodes from `head`, newest first.
pub fn walk(vol: &Volume, head: Option<u32>, limit: usize) -> Result<Vec<(u32, VersionNode)>> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let mut cur = head;
    while let Some(handle) = cur {
        if out.len() >= limit {
            break;
        }
        if !seen.insert(handle) {
            return Err(ChronoError::CorruptData(format!(
                "version chain loops at node {}",
                handle
            )));
        }
        let node = load_node(vol, handle)?;
        cur = node.prev_version;
        out.push((handle, node));
    }
    Ok(out)
}

pub fn chain_len(vol: &Volume, head: Option<u32>) -> Result<usize> {
    Ok(walk(vol, head, usize::MAX)?.len())
}

/// Snapshot the live content of file `inum` as a new chain head.
///
/// Each live block is checked against the dedup index; a candidate is
/// reused only after a byte comparison. Unmatched blocks are shared between
/// the live file and the version, so both owners are counted.
pub fn create(
    vol: &Volume,
    ledger: &mut RefLedger<'_>,
    inum: u32,
    description: &str,
    snapshot_id: Option<u32>,
) -> Result<u32> {
    check_description(description)?;
    let mut inode = vol.read_inode(inum)?;
    if inode.kind != InodeType::File {
        return Err(ChronoError::InvalidArgument(format!("inode {} is not a file", inum)));
    }
    if !inode.flags.contains(InodeFlags::VERSIONED) {
        return Err(ChronoError::InvalidArgument(format!(
            "inode {} is not versioned",
            inum
        )));
    }

    let mut data_blocks = Vec::new();
    let mut reused = 0;
    for b in inode.blocks() {
        let data = vol.read_block(b)?;
        let checksum = DedupIndex::hash(&data);
        let mut hit = None;
        for k in ledger.dedup_candidates(checksum) {
            if k == b || vol.read_block(k)? == data {
                hit = Some(k);
                break;
            }
        }
        let target = match hit {
            Some(k) => {
                reused += 1;
                k
            }
            None => {
                if !ledger.is_tracked(b) {
                    // The live file becomes one of two owners.
                    ledger.inc(b)?;
                }
                b
            }
        };
        ledger.inc(target)?;
        ledger.dedup_insert(checksum, target)?;
        data_blocks.push(target);
    }

    let handle = vol.alloc_block()?;
    let node = VersionNode::new(
        now(),
        inode.version_head,
        data_blocks,
        inode.size,
        description,
        snapshot_id,
    );
    store_node(vol, handle, &node)?;
    inode.version_head = Some(handle);
    vol.write_inode(inum, &inode)?;
    debug!(
        "inode {}: version node {} ({} blocks, {} deduplicated)",
        inum,
        handle,
        node.block_count(),
        reused
    );
    Ok(handle)
}

/// The newest `max` versions, oldest first.
pub fn list(vol: &Volume, head: Option<u32>, max: usize) -> Result<Vec<VersionInfo>> {
    let total = chain_len(vol, head)?;
    let mut out: Vec<VersionInfo> = walk(vol, head, max)?
        .iter()
        .enumerate()
        .map(|(depth, (handle, node))| VersionInfo::new(total - 1 - depth, *handle, node))
        .collect();
    out.reverse();
    Ok(out)
}

/// Node for ordinal `index`.
pub fn resolve(vol: &Volume, head: Option<u32>, index: u32) -> Result<(u32, VersionNode)> {
    let mut chain = walk(vol, head, usize::MAX)?;
    let len = chain.len();
    let index = index as usize;
    if index >= len {
        return Err(ChronoError::InvalidArgument(format!(
            "version {} out of range ({} versions)",
            index, len
        )));
    }
    Ok(chain.swap_remove(len - 1 - index))
}

/// Recorded content of version `index`, at most `cap` bytes.
pub fn get_content(vol: &Volume, head: Option<u32>, index: u32, cap: usize) -> Result<Vec<u8>> {
    let (_, node) = resolve(vol, head, index)?;
    let mut content = vol.read_blocks(&node.data_blocks, node.file_size as usize)?;
    content.truncate(cap);
    Ok(content)
}

/// Replace the live content of `inum` with a copy of version `index`.
pub fn restore(vol: &Volume, ledger: &mut RefLedger<'_>, inum: u32, index: u32) -> Result<()> {
    let mut inode = vol.read_inode(inum)?;
    if inode.flags.contains(InodeFlags::IMMUTABLE) {
        return Err(ChronoError::InvalidArgument(format!("inode {} is immutable", inum)));
    }
    let (handle, node) = resolve(vol, inode.version_head, index)?;
    let addrs = vol.copy_blocks(&node.data_blocks)?;
    for b in inode.blocks() {
        release_block(vol, ledger, b)?;
    }
    inode.addrs = addrs;
    inode.size = node.file_size;
    vol.write_inode(inum, &inode)?;
    info!("inode {}: restored version {} (node {})", inum, index, handle);
    Ok(())
}

/// Drop one chain's link to a node, reclaiming it when no chain remains.
fn unlink_node(
    vol: &Volume,
    ledger: &mut RefLedger<'_>,
    handle: u32,
    mut node: VersionNode,
    stats: &mut PruneStats,
) -> Result<()> {
    node.refcount = node.refcount.saturating_sub(1);
    if node.refcount > 0 {
        return store_node(vol, handle, &node);
    }
    for &b in &node.data_blocks {
        ledger.dedup_remove(b);
        if release_block(vol, ledger, b)? {
            stats.blocks_freed += 1;
        }
    }
    vol.free_block(handle)?;
    stats.blocks_freed += 1;
    stats.versions_pruned += 1;
    Ok(())
}

/// Keep the newest `keep` nodes of the chain at `head`; returns the new head.
pub fn prune_chain(
    vol: &Volume,
    ledger: &mut RefLedger<'_>,
    head: Option<u32>,
    keep: usize,
) -> Result<(Option<u32>, PruneStats)> {
    let mut stats = PruneStats::default();
    let mut chain = walk(vol, head, usize::MAX)?;
    if chain.len() <= keep {
        return Ok((head, stats));
    }
    let dropped = chain.split_off(keep);
    let new_head = match chain.last_mut() {
        Some((handle, node)) => {
            node.relink(None);
            store_node(vol, *handle, node)?;
            head
        }
        None => None,
    };
    for (handle, node) in dropped {
        unlink_node(vol, ledger, handle, node, &mut stats)?;
    }
    Ok((new_head, stats))
}

/// Number of nodes newer than `now - max_age`, never less than one.
pub fn keep_for_age(vol: &Volume, head: Option<u32>, max_age: u64, now: u64) -> Result<usize> {
    let cutoff = now.saturating_sub(max_age);
    let chain = walk(vol, head, usize::MAX)?;
    let fresh = chain
        .iter()
        .position(|(_, node)| node.timestamp < cutoff)
        .unwrap_or(chain.len());
    Ok(fresh.max(1))
}

pub fn prune_by_age(
    vol: &Volume,
    ledger: &mut RefLedger<'_>,
    head: Option<u32>,
    max_age: u64,
) -> Result<(Option<u32>, PruneStats)> {
    let keep = keep_for_age(vol, head, max_age, now())?;
    prune_chain(vol, ledger, head, keep)
}

/// Newest version recorded at or before `timestamp`.
pub fn at_time(vol: &Volume, head: Option<u32>, timestamp: u64) -> Result<Option<VersionInfo>> {
    let chain = walk(vol, head, usize::MAX)?;
    let total = chain.len();
    Ok(chain
        .iter()
        .enumerate()
        .find(|(_, (_, node))| node.timestamp <= timestamp)
        .map(|(depth, (handle, node))| VersionInfo::new(total - 1 - depth, *handle, node)))
}
