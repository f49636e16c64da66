//! Named snapshot records.
//!
//! Each snapshot occupies one 128-byte slot in the snapshot region. Slot `i`
//! is identified by the reserved inode number `SNAPSHOT_INODE_START + i`.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{ChronoError, Result};
use crate::fs::layout::{
    check_name, get_name, get_u32, get_u64, put_name, put_u32, put_u64, BSIZE, NAME_MAX,
    ROOTINO, SNAPSHOT_INODE_START, SNAPSHOT_SLOT_SIZE,
};
use crate::fs::{now, Volume};

const SLOTS_PER_BLOCK: u32 = (BSIZE / SNAPSHOT_SLOT_SIZE) as u32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotMetadata {
    pub id: u32,
    pub name: String,
    pub timestamp: u64,
    pub root_inum: u32,
    pub file_count: u32,
    pub total_blocks: u32,
    pub creator_pid: u32,
}

impl SnapshotMetadata {
    fn encode_into(&self, buf: &mut [u8]) {
        buf[..SNAPSHOT_SLOT_SIZE].fill(0);
        put_u32(buf, 0, 1);
        put_u64(buf, 4, self.timestamp);
        put_name(buf, 12, NAME_MAX + 1, &self.name);
        put_u32(buf, 44, self.id);
        put_u32(buf, 48, self.root_inum);
        put_u32(buf, 52, self.file_count);
        put_u32(buf, 56, self.total_blocks);
        put_u32(buf, 60, self.creator_pid);
    }

    fn decode_from(buf: &[u8]) -> Option<Self> {
        if get_u32(buf, 0) == 0 {
            return None;
        }
        Some(Self {
            timestamp: get_u64(buf, 4),
            name: get_name(buf, 12, NAME_MAX + 1),
            id: get_u32(buf, 44),
            root_inum: get_u32(buf, 48),
            file_count: get_u32(buf, 52),
            total_blocks: get_u32(buf, 56),
            creator_pid: get_u32(buf, 60),
        })
    }
}

#[derive(Default)]
struct SnapshotIndex {
    slots: Vec<Option<SnapshotMetadata>>,
    by_name: HashMap<String, u32>,
}

/// In-memory view of the snapshot region.
pub struct SnapshotTable {
    index: Mutex<SnapshotIndex>,
}

fn slot_pos(vol: &Volume, slot: u32) -> (u32, usize) {
    (
        vol.superblock().snapstart + slot / SLOTS_PER_BLOCK,
        (slot % SLOTS_PER_BLOCK) as usize * SNAPSHOT_SLOT_SIZE,
    )
}

fn write_slot(vol: &Volume, slot: u32, meta: Option<&SnapshotMetadata>) -> Result<()> {
    let (blk, off) = slot_pos(vol, slot);
    let mut buf = vol.read_block(blk)?;
    match meta {
        Some(m) => m.encode_into(&mut buf[off..off + SNAPSHOT_SLOT_SIZE]),
        None => buf[off..off + SNAPSHOT_SLOT_SIZE].fill(0),
    }
    vol.write_block(blk, &buf)
}

impl SnapshotTable {
    pub fn new() -> Self {
        Self {
            index: Mutex::new(SnapshotIndex::default()),
        }
    }

    /// Re-read every slot.
    pub fn load(&self, vol: &Volume) -> Result<()> {
        let nslots = vol.superblock().nsnapslots;
        let mut index = SnapshotIndex::default();
        let mut cached: Option<(u32, [u8; BSIZE])> = None;
        for slot in 0..nslots {
            let (blk, off) = slot_pos(vol, slot);
            let buf = match cached {
                Some((b, buf)) if b == blk => buf,
                _ => {
                    let buf = vol.read_block(blk)?;
                    cached = Some((blk, buf));
                    buf
                }
            };
            let meta = SnapshotMetadata::decode_from(&buf[off..off + SNAPSHOT_SLOT_SIZE]);
            if let Some(m) = &meta {
                index.by_name.insert(m.name.clone(), slot);
            }
            index.slots.push(meta);
        }
        *self.index.lock() = index;
        Ok(())
    }

    /// Record a new snapshot. Names are unique.
    pub fn create(
        &self,
        vol: &Volume,
        name: &str,
        file_count: u32,
        total_blocks: u32,
    ) -> Result<SnapshotMetadata> {
        check_name("snapshot name", name, NAME_MAX)?;
        let mut index = self.index.lock();
        if index.by_name.contains_key(name) {
            return Err(ChronoError::InvalidArgument(format!(
                "snapshot {} already exists",
                name
            )));
        }
        let slot = index
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(ChronoError::TableFull("snapshot"))? as u32;
        let meta = SnapshotMetadata {
            id: SNAPSHOT_INODE_START + slot,
            name: name.to_string(),
            timestamp: now(),
            root_inum: ROOTINO,
            file_count,
            total_blocks,
            creator_pid: std::process::id(),
        };
        write_slot(vol, slot, Some(&meta))?;
        index.by_name.insert(meta.name.clone(), slot);
        index.slots[slot as usize] = Some(meta.clone());
        info!("snapshot {} created as id {}", name, meta.id);
        Ok(meta)
    }

    /// Up to `max` snapshots in slot order.
    pub fn list(&self, max: usize) -> Vec<SnapshotMetadata> {
        self.index
            .lock()
            .slots
            .iter()
            .flatten()
            .take(max)
            .cloned()
            .collect()
    }

    pub fn find(&self, name: &str) -> Option<SnapshotMetadata> {
        let index = self.index.lock();
        let slot = *index.by_name.get(name)?;
        index.slots.get(slot as usize).cloned().flatten()
    }

    pub fn find_by_id(&self, id: u32) -> Option<SnapshotMetadata> {
        let slot = id.checked_sub(SNAPSHOT_INODE_START)?;
        self.index.lock().slots.get(slot as usize).cloned().flatten()
    }

    pub fn delete(&self, vol: &Volume, name: &str) -> Result<SnapshotMetadata> {
        let mut index = self.index.lock();
        let slot = *index
            .by_name
            .get(name)
            .ok_or_else(|| ChronoError::NotFound(format!("snapshot {}", name)))?;
        write_slot(vol, slot, None)?;
        index.by_name.remove(name);
        let meta = index.slots[slot as usize]
            .take()
            .ok_or_else(|| ChronoError::Fatal(format!("snapshot index lost slot {}", slot)))?;
        debug!("snapshot {} deleted", name);
        Ok(meta)
    }

    pub fn len(&self) -> usize {
        self.index.lock().by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SnapshotTable {
    fn default() -> Self {
        Self::new()
    }
}
