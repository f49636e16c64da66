//! On-disk format.
//!
//! Disk layout:
//! `[ boot | super | journal | inodes | root dir | snapshot slots |
//!    deleted registry | free bitmap | data ]`
//!
//! All integers are little-endian.

use bitflags::bitflags;

use crate::error::{ChronoError, Result};

pub const BSIZE: usize = 512;
pub const ROOTINO: u32 = 1;
pub const NDIRECT: usize = 10;
pub const MAXFILE_BYTES: usize = NDIRECT * BSIZE;
pub const DIRSIZ: usize = 14;
/// Descriptions and snapshot names occupy 32 bytes including the terminator.
pub const NAME_MAX: usize = 31;

pub const MAX_VERSIONS_PER_FILE: usize = 10;
pub const MAX_SNAPSHOTS: u32 = 100;
pub const SNAPSHOT_INODE_START: u32 = 100;
pub const SNAPSHOT_INODE_END: u32 = 199;
pub const JOURNAL_BLOCKS: u32 = 100;
pub const JOURNAL_MAGIC: u32 = 0x4A4F_524E;
pub const MAX_DELETED_FILES: u32 = 32;
pub const MAX_REFCOUNT_ENTRIES: usize = 10_000;
pub const DEDUP_TABLE_SIZE: usize = 1000;
pub const VNODE_DATA_BLOCKS: usize = 10;

pub const DEFAULT_FS_BLOCKS: u32 = 2048;
pub const DEFAULT_NINODES: u32 = 256;
pub const DIR_BLOCKS: u32 = 4;

pub const FS_MAGIC: u32 = 0x4348_524E;
pub const DINODE_SIZE: usize = 64;
pub const IPB: usize = BSIZE / DINODE_SIZE;
pub const DIRENT_SIZE: usize = 16;
pub const DPB: usize = BSIZE / DIRENT_SIZE;
pub const SNAPSHOT_SLOT_SIZE: usize = 128;
pub const DELETED_SLOT_SIZE: usize = 32;
/// Bitmap bits per block.
pub const BPB: u32 = (BSIZE * 8) as u32;

pub type Block = [u8; BSIZE];

bitflags! {
    /// Per-inode capability flags.
    pub struct InodeFlags: u32 {
        const COW_ENABLED = 0x01;
        const IMMUTABLE = 0x02;
        const VERSIONED = 0x04;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeType {
    Free,
    Dir,
    File,
}

impl InodeType {
    fn to_raw(self) -> u16 {
        match self {
            InodeType::Free => 0,
            InodeType::Dir => 1,
            InodeType::File => 2,
        }
    }

    fn from_raw(raw: u16) -> Result<Self> {
        match raw {
            0 => Ok(InodeType::Free),
            1 => Ok(InodeType::Dir),
            2 => Ok(InodeType::File),
            other => Err(ChronoError::CorruptData(format!("inode type {}", other))),
        }
    }
}

pub fn get_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

pub fn put_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

pub fn get_u32(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(b)
}

pub fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

pub fn get_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

pub fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

/// Write a NUL-padded fixed-width string field.
pub fn put_name(buf: &mut [u8], off: usize, width: usize, name: &str) {
    let field = &mut buf[off..off + width];
    field.fill(0);
    let bytes = name.as_bytes();
    let n = bytes.len().min(width);
    field[..n].copy_from_slice(&bytes[..n]);
}

pub fn get_name(buf: &[u8], off: usize, width: usize) -> String {
    let field = &buf[off..off + width];
    let end = field.iter().position(|&b| b == 0).unwrap_or(width);
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Reject names that do not fit their fixed-width on-disk field.
pub fn check_name(kind: &str, name: &str, max: usize) -> Result<()> {
    if name.is_empty() {
        return Err(ChronoError::InvalidArgument(format!("empty {}", kind)));
    }
    if name.len() > max || name.as_bytes().contains(&0) {
        return Err(ChronoError::InvalidArgument(format!(
            "{} {:?} longer than {} bytes",
            kind, name, max
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    /// Size of the image in blocks.
    pub size: u32,
    /// Number of data blocks.
    pub nblocks: u32,
    pub ninodes: u32,
    pub journalstart: u32,
    pub njournalblocks: u32,
    pub inodestart: u32,
    pub dirstart: u32,
    pub ndirblocks: u32,
    pub snapstart: u32,
    pub nsnapslots: u32,
    pub delstart: u32,
    pub ndelslots: u32,
    pub bmapstart: u32,
    pub datastart: u32,
}

impl Superblock {
    pub const BLOCK: u32 = 1;

    /// Compute a layout for the given geometry.
    pub fn plan(
        size: u32,
        ninodes: u32,
        njournalblocks: u32,
        nsnapslots: u32,
        ndelslots: u32,
    ) -> Result<Self> {
        if ninodes <= SNAPSHOT_INODE_END {
            return Err(ChronoError::InvalidArgument(format!(
                "need more than {} inodes, got {}",
                SNAPSHOT_INODE_END, ninodes
            )));
        }
        if ninodes > u16::MAX as u32 {
            return Err(ChronoError::InvalidArgument(format!(
                "at most {} inodes",
                u16::MAX
            )));
        }
        if nsnapslots > SNAPSHOT_INODE_END - SNAPSHOT_INODE_START + 1 {
            return Err(ChronoError::InvalidArgument(format!(
                "at most {} snapshot slots",
                SNAPSHOT_INODE_END - SNAPSHOT_INODE_START + 1
            )));
        }
        let div_up = |n: u32, per: usize| (n as usize).div_ceil(per) as u32;

        let journalstart = 2;
        let inodestart = journalstart + njournalblocks;
        let dirstart = inodestart + div_up(ninodes, IPB);
        let snapstart = dirstart + DIR_BLOCKS;
        let delstart = snapstart + div_up(nsnapslots, BSIZE / SNAPSHOT_SLOT_SIZE);
        let bmapstart = delstart + div_up(ndelslots, BSIZE / DELETED_SLOT_SIZE);
        let datastart = bmapstart + size.div_ceil(BPB);
        if datastart >= size {
            return Err(ChronoError::InvalidArgument(format!(
                "{} blocks leave no room for data (metadata ends at {})",
                size, datastart
            )));
        }
        Ok(Self {
            size,
            nblocks: size - datastart,
            ninodes,
            journalstart,
            njournalblocks,
            inodestart,
            dirstart,
            ndirblocks: DIR_BLOCKS,
            snapstart,
            nsnapslots,
            delstart,
            ndelslots,
            bmapstart,
            datastart,
        })
    }

    pub fn encode(&self) -> Block {
        let mut b = [0u8; BSIZE];
        let fields = [
            FS_MAGIC,
            self.size,
            self.nblocks,
            self.ninodes,
            self.journalstart,
            self.njournalblocks,
            self.inodestart,
            self.dirstart,
            self.ndirblocks,
            self.snapstart,
            self.nsnapslots,
            self.delstart,
            self.ndelslots,
            self.bmapstart,
            self.datastart,
        ];
        for (i, v) in fields.iter().enumerate() {
            put_u32(&mut b, i * 4, *v);
        }
        b
    }

    pub fn decode(b: &Block) -> Result<Self> {
        if get_u32(b, 0) != FS_MAGIC {
            return Err(ChronoError::CorruptData("bad superblock magic".to_string()));
        }
        let f = |i: usize| get_u32(b, i * 4);
        Ok(Self {
            size: f(1),
            nblocks: f(2),
            ninodes: f(3),
            journalstart: f(4),
            njournalblocks: f(5),
            inodestart: f(6),
            dirstart: f(7),
            ndirblocks: f(8),
            snapstart: f(9),
            nsnapslots: f(10),
            delstart: f(11),
            ndelslots: f(12),
            bmapstart: f(13),
            datastart: f(14),
        })
    }

    /// Block holding inode `inum` and the byte offset inside it.
    pub fn inode_pos(&self, inum: u32) -> (u32, usize) {
        (
            self.inodestart + inum / IPB as u32,
            (inum as usize % IPB) * DINODE_SIZE,
        )
    }

    /// Bitmap block holding the bit for block `b`.
    pub fn bmap_block(&self, b: u32) -> u32 {
        self.bmapstart + b / BPB
    }

    pub fn is_data_block(&self, b: u32) -> bool {
        b >= self.datastart && b < self.size
    }
}

/// Inode record as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskInode {
    pub kind: InodeType,
    pub nlink: u16,
    pub flags: InodeFlags,
    pub size: u32,
    pub addrs: [u32; NDIRECT],
    pub create_time: u32,
    /// Newest version node, if any.
    pub version_head: Option<u32>,
}

impl DiskInode {
    pub fn empty() -> Self {
        Self {
            kind: InodeType::Free,
            nlink: 0,
            flags: InodeFlags::empty(),
            size: 0,
            addrs: [0; NDIRECT],
            create_time: 0,
            version_head: None,
        }
    }

    /// Live data blocks in address order.
    pub fn blocks(&self) -> impl Iterator<Item = u32> + '_ {
        self.addrs.iter().copied().filter(|&b| b != 0)
    }

    pub fn encode_into(&self, buf: &mut [u8]) {
        buf[..DINODE_SIZE].fill(0);
        put_u16(buf, 0, self.kind.to_raw());
        put_u16(buf, 2, self.nlink);
        put_u32(buf, 4, self.flags.bits());
        put_u32(buf, 8, self.size);
        for (i, a) in self.addrs.iter().enumerate() {
            put_u32(buf, 12 + i * 4, *a);
        }
        put_u32(buf, 52, self.create_time);
        put_u32(buf, 56, self.version_head.unwrap_or(0));
    }

    pub fn decode_from(buf: &[u8]) -> Result<Self> {
        let mut addrs = [0u32; NDIRECT];
        for (i, a) in addrs.iter_mut().enumerate() {
            *a = get_u32(buf, 12 + i * 4);
        }
        let head = get_u32(buf, 56);
        Ok(Self {
            kind: InodeType::from_raw(get_u16(buf, 0))?,
            nlink: get_u16(buf, 2),
            flags: InodeFlags::from_bits_truncate(get_u32(buf, 4)),
            size: get_u32(buf, 8),
            addrs,
            create_time: get_u32(buf, 52),
            version_head: (head != 0).then_some(head),
        })
    }
}
