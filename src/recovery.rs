//! Deleted-file registry.
//!
//! Unlinking a file with versions leaves its chain in a registry slot so the
//! file can be brought back later. Slots are 32 bytes:
//! `{valid u16, inum u16, version_head u32, delete_time u64, name[14], flags u16}`.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{ChronoError, Result};
use crate::fs::layout::{
    get_name, get_u16, get_u32, get_u64, put_name, put_u16, put_u32, put_u64, InodeFlags,
    BSIZE, DELETED_SLOT_SIZE, DIRSIZ,
};
use crate::fs::{file_name, Volume};
use crate::version;

const SLOTS_PER_BLOCK: u32 = (BSIZE / DELETED_SLOT_SIZE) as u32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeletedEntry {
    pub name: String,
    pub inum: u32,
    pub version_head: u32,
    pub delete_time: u64,
    /// Inode flags at deletion, given back on recovery.
    #[serde(skip)]
    pub flags: InodeFlags,
}

impl DeletedEntry {
    fn encode_into(&self, buf: &mut [u8]) {
        buf[..DELETED_SLOT_SIZE].fill(0);
        put_u16(buf, 0, 1);
        put_u16(buf, 2, self.inum as u16);
        put_u32(buf, 4, self.version_head);
        put_u64(buf, 8, self.delete_time);
        put_name(buf, 16, DIRSIZ, &self.name);
        put_u16(buf, 30, self.flags.bits() as u16);
    }

    fn decode_from(buf: &[u8]) -> Option<Self> {
        if get_u16(buf, 0) == 0 {
            return None;
        }
        Some(Self {
            inum: get_u16(buf, 2) as u32,
            version_head: get_u32(buf, 4),
            delete_time: get_u64(buf, 8),
            name: get_name(buf, 16, DIRSIZ),
            flags: InodeFlags::from_bits_truncate(get_u16(buf, 30) as u32),
        })
    }
}

#[derive(Default)]
struct RegistryIndex {
    slots: Vec<Option<DeletedEntry>>,
    /// Several deletions of the same name may be registered.
    by_name: HashMap<String, Vec<u32>>,
}

impl RegistryIndex {
    fn newest(&self, name: &str) -> Option<(u32, DeletedEntry)> {
        self.by_name
            .get(name)?
            .iter()
            .filter_map(|&s| self.slots[s as usize].clone().map(|e| (s, e)))
            .enumerate()
            .max_by_key(|(order, (_, e))| (e.delete_time, *order))
            .map(|(_, found)| found)
    }

    fn forget(&mut self, slot: u32) -> Option<DeletedEntry> {
        let entry = self.slots.get_mut(slot as usize)?.take()?;
        if let Some(list) = self.by_name.get_mut(&entry.name) {
            list.retain(|&s| s != slot);
            if list.is_empty() {
                self.by_name.remove(&entry.name);
            }
        }
        Some(entry)
    }
}

pub struct DeletedRegistry {
    index: Mutex<RegistryIndex>,
}

fn slot_pos(vol: &Volume, slot: u32) -> (u32, usize) {
    (
        vol.superblock().delstart + slot / SLOTS_PER_BLOCK,
        (slot % SLOTS_PER_BLOCK) as usize * DELETED_SLOT_SIZE,
    )
}

fn write_slot(vol: &Volume, slot: u32, entry: Option<&DeletedEntry>) -> Result<()> {
    let (blk, off) = slot_pos(vol, slot);
    let mut buf = vol.read_block(blk)?;
    match entry {
        Some(e) => e.encode_into(&mut buf[off..off + DELETED_SLOT_SIZE]),
        None => buf[off..off + DELETED_SLOT_SIZE].fill(0),
    }
    vol.write_block(blk, &buf)
}

impl DeletedRegistry {
    pub fn new() -> Self {
        Self {
            index: Mutex::new(RegistryIndex::default()),
        }
    }

    pub fn load(&self, vol: &Volume) -> Result<()> {
        let mut index = RegistryIndex::default();
        for slot in 0..vol.superblock().ndelslots {
            let (blk, off) = slot_pos(vol, slot);
            let buf = vol.read_block(blk)?;
            let entry = DeletedEntry::decode_from(&buf[off..off + DELETED_SLOT_SIZE]);
            if let Some(e) = &entry {
                index.by_name.entry(e.name.clone()).or_default().push(slot);
            }
            index.slots.push(entry);
        }
        *self.index.lock() = index;
        Ok(())
    }

    /// Remember a deleted file's chain. Never evicts: a full registry fails.
    pub fn register_deletion(
        &self,
        vol: &Volume,
        name: &str,
        inum: u32,
        flags: InodeFlags,
        version_head: u32,
        delete_time: u64,
    ) -> Result<u32> {
        let mut index = self.index.lock();
        let Some(slot) = index.slots.iter().position(Option::is_none) else {
            warn!("deleted-file registry full, cannot keep {}", name);
            return Err(ChronoError::TableFull("deleted file"));
        };
        let slot = slot as u32;
        let entry = DeletedEntry {
            name: name.to_string(),
            inum,
            version_head,
            delete_time,
            flags,
        };
        write_slot(vol, slot, Some(&entry))?;
        index.by_name.entry(entry.name.clone()).or_default().push(slot);
        index.slots[slot as usize] = Some(entry);
        debug!("{} registered as deleted in slot {}", name, slot);
        Ok(slot)
    }

    /// Most recent deletion registered under `name`.
    pub fn find(&self, name: &str) -> Option<DeletedEntry> {
        self.index.lock().newest(name).map(|(_, e)| e)
    }

    /// Up to `max` entries in slot order.
    pub fn list(&self, max: usize) -> Vec<DeletedEntry> {
        self.index
            .lock()
            .slots
            .iter()
            .flatten()
            .take(max)
            .cloned()
            .collect()
    }

    /// `(slot, version_head)` of every registered chain.
    pub fn heads(&self) -> Vec<(u32, u32)> {
        self.index
            .lock()
            .slots
            .iter()
            .enumerate()
            .filter_map(|(s, e)| e.as_ref().map(|e| (s as u32, e.version_head)))
            .collect()
    }

    /// Chain head currently registered in `slot`.
    pub fn head(&self, slot: u32) -> Option<u32> {
        self.index
            .lock()
            .slots
            .get(slot as usize)?
            .as_ref()
            .map(|e| e.version_head)
    }

    pub fn clear(&self, vol: &Volume, slot: u32) -> Result<()> {
        write_slot(vol, slot, None)?;
        self.index.lock().forget(slot);
        Ok(())
    }

    /// Point a slot at a pruned chain. An emptied chain drops the entry.
    pub fn set_head(&self, vol: &Volume, slot: u32, head: Option<u32>) -> Result<()> {
        let Some(head) = head else {
            return self.clear(vol, slot);
        };
        let mut index = self.index.lock();
        let Some(Some(entry)) = index.slots.get_mut(slot as usize) else {
            return Err(ChronoError::NotFound(format!("deleted-file slot {}", slot)));
        };
        entry.version_head = head;
        let entry = entry.clone();
        write_slot(vol, slot, Some(&entry))
    }

    /// Bring back the newest deletion of `name` under a fresh inode holding
    /// a copy of the chain's newest version. The chain moves with it.
    pub fn recover(&self, vol: &Volume, name: &str) -> Result<u32> {
        let name = file_name(name)?;
        if vol.dir_lookup(name).is_some() {
            return Err(ChronoError::InvalidArgument(format!("{} already exists", name)));
        }
        let (slot, entry) = self
            .index
            .lock()
            .newest(name)
            .ok_or_else(|| ChronoError::NotFound(format!("deleted file {}", name)))?;

        let node = version::load_node(vol, entry.version_head)?;
        let (inum, mut inode) = vol.alloc_file_inode()?;
        inode.addrs = vol.copy_blocks(&node.data_blocks)?;
        inode.size = node.file_size;
        inode.version_head = Some(entry.version_head);
        inode.flags |= entry.flags;
        vol.write_inode(inum, &inode)?;
        vol.dir_link(name, inum)?;
        self.clear(vol, slot)?;
        info!(
            "recovered {} as inode {} ({} bytes, was inode {})",
            name, inum, inode.size, entry.inum
        );
        Ok(inum)
    }

    pub fn len(&self) -> usize {
        self.index.lock().slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DeletedRegistry {
    fn default() -> Self {
        Self::new()
    }
}
