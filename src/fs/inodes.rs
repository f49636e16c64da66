use super::layout::{
    DiskInode, InodeFlags, InodeType, DINODE_SIZE, ROOTINO, SNAPSHOT_INODE_END,
    SNAPSHOT_INODE_START,
};
use super::{now, Volume};
use crate::error::{ChronoError, Result};

/// Inode numbers reserved for snapshot metadata slots. Never handed out
/// to files.
pub fn is_reserved(inum: u32) -> bool {
    (SNAPSHOT_INODE_START..=SNAPSHOT_INODE_END).contains(&inum)
}

impl Volume {
    fn check_inum(&self, inum: u32) -> Result<()> {
        if inum == 0 || inum >= self.superblock().ninodes {
            return Err(ChronoError::InvalidArgument(format!("inode {} out of range", inum)));
        }
        Ok(())
    }

    pub fn read_inode(&self, inum: u32) -> Result<DiskInode> {
        self.check_inum(inum)?;
        let (blk, off) = self.superblock().inode_pos(inum);
        let buf = self.read_block(blk)?;
        DiskInode::decode_from(&buf[off..off + DINODE_SIZE])
    }

    pub fn write_inode(&self, inum: u32, inode: &DiskInode) -> Result<()> {
        self.check_inum(inum)?;
        let (blk, off) = self.superblock().inode_pos(inum);
        let mut buf = self.read_block(blk)?;
        inode.encode_into(&mut buf[off..off + DINODE_SIZE]);
        self.write_block(blk, &buf)
    }

    /// Claim a free inode for a new regular file.
    pub fn alloc_file_inode(&self) -> Result<(u32, DiskInode)> {
        for inum in (ROOTINO + 1)..self.superblock().ninodes {
            if is_reserved(inum) {
                continue;
            }
            if self.read_inode(inum)?.kind == InodeType::Free {
                let mut inode = DiskInode::empty();
                inode.kind = InodeType::File;
                inode.nlink = 1;
                inode.flags = InodeFlags::COW_ENABLED | InodeFlags::VERSIONED;
                inode.create_time = now() as u32;
                self.write_inode(inum, &inode)?;
                return Ok((inum, inode));
            }
        }
        Err(ChronoError::TableFull("inode"))
    }

    pub fn free_inode(&self, inum: u32) -> Result<()> {
        let inode = self.read_inode(inum)?;
        if inode.kind == InodeType::Free {
            return Err(ChronoError::Fatal(format!("freeing free inode {}", inum)));
        }
        self.write_inode(inum, &DiskInode::empty())
    }

    /// All regular-file inodes in use.
    pub fn file_inodes(&self) -> Result<Vec<(u32, DiskInode)>> {
        let mut out = Vec::new();
        for inum in (ROOTINO + 1)..self.superblock().ninodes {
            if is_reserved(inum) {
                continue;
            }
            let inode = self.read_inode(inum)?;
            if inode.kind == InodeType::File {
                out.push((inum, inode));
            }
        }
        Ok(out)
    }
}
