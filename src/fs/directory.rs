//! Flat root directory: a table of `{inum, name}` slots in its own region,
//! indexed in memory by name.

use dashmap::DashMap;

use super::layout::{get_name, get_u16, put_name, put_u16, DIRENT_SIZE, DIRSIZ, DPB};
use super::Volume;
use crate::error::{ChronoError, Result};

#[derive(Debug, Clone, Copy)]
pub struct DirSlot {
    pub slot: u32,
    pub inum: u32,
}

pub struct Directory {
    names: DashMap<String, DirSlot>,
}

impl Directory {
    pub fn new() -> Self {
        Self {
            names: DashMap::new(),
        }
    }

    /// Rebuild the index from disk (as seen through the journal).
    pub fn load(&self, vol: &Volume) -> Result<()> {
        self.names.clear();
        let sb = vol.superblock();
        for i in 0..sb.ndirblocks {
            let buf = vol.read_block(sb.dirstart + i)?;
            for j in 0..DPB {
                let off = j * DIRENT_SIZE;
                let inum = get_u16(&buf, off) as u32;
                if inum != 0 {
                    let slot = i * DPB as u32 + j as u32;
                    self.names
                        .insert(get_name(&buf, off + 2, DIRSIZ), DirSlot { slot, inum });
                }
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<DirSlot> {
        self.names.get(name).map(|r| *r.value())
    }
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

impl Volume {
    fn write_dirent(&self, slot: u32, inum: u32, name: &str) -> Result<()> {
        let sb = self.superblock();
        let blk = sb.dirstart + slot / DPB as u32;
        let off = (slot as usize % DPB) * DIRENT_SIZE;
        let mut buf = self.read_block(blk)?;
        put_u16(&mut buf, off, inum as u16);
        put_name(&mut buf, off + 2, DIRSIZ, name);
        self.write_block(blk, &buf)
    }

    pub fn dir_lookup(&self, name: &str) -> Option<u32> {
        self.directory().get(name).map(|s| s.inum)
    }

    pub fn dir_link(&self, name: &str, inum: u32) -> Result<()> {
        if self.dir_lookup(name).is_some() {
            return Err(ChronoError::InvalidArgument(format!("{} already exists", name)));
        }
        let capacity = self.superblock().ndirblocks * DPB as u32;
        let used: std::collections::HashSet<u32> = self
            .directory()
            .names
            .iter()
            .map(|e| e.value().slot)
            .collect();
        let slot = (0..capacity)
            .find(|s| !used.contains(s))
            .ok_or(ChronoError::TableFull("directory"))?;
        self.write_dirent(slot, inum, name)?;
        self.directory()
            .names
            .insert(name.to_string(), DirSlot { slot, inum });
        Ok(())
    }

    /// Remove a name, returning the inode it referred to.
    pub fn dir_unlink(&self, name: &str) -> Result<u32> {
        let entry = self
            .directory()
            .get(name)
            .ok_or_else(|| ChronoError::NotFound(name.to_string()))?;
        self.write_dirent(entry.slot, 0, "")?;
        self.directory().names.remove(name);
        Ok(entry.inum)
    }

    /// Names in slot order.
    pub fn dir_entries(&self) -> Vec<(String, u32)> {
        let mut entries: Vec<(u32, String, u32)> = self
            .directory()
            .names
            .iter()
            .map(|e| (e.value().slot, e.key().clone(), e.value().inum))
            .collect();
        entries.sort_by_key(|e| e.0);
        entries.into_iter().map(|(_, n, i)| (n, i)).collect()
    }
}
