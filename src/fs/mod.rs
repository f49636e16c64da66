pub mod bitmap;
pub mod cas;
pub mod device;
pub mod directory;
pub mod inodes;
pub mod layout;

use std::sync::Arc;

use tracing::{debug, error, info};

use self::device::BlockDevice;
use self::directory::Directory;
use self::layout::*;
use crate::config::FormatOptions;
use crate::error::{ChronoError, Result};
use crate::journal::{Journal, RecoveryOutcome};

/// Seconds since the Unix epoch.
pub fn now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// The host block filesystem: layout, allocation, inodes, the root
/// directory and journaled block I/O.
///
/// Every block write goes through the journal, so writes are only legal
/// inside [`Volume::transact`]. Reads see the open transaction's writes.
pub struct Volume {
    dev: Arc<dyn BlockDevice>,
    sb: Superblock,
    journal: Journal,
    dir: Directory,
    recovery: RecoveryOutcome,
}

impl Volume {
    /// Lay down a fresh filesystem on `dev` and mount it.
    pub fn format(dev: Arc<dyn BlockDevice>, opts: &FormatOptions) -> Result<Self> {
        if opts.total_blocks > dev.block_count() {
            return Err(ChronoError::InvalidArgument(format!(
                "{} blocks requested, device holds {}",
                opts.total_blocks,
                dev.block_count()
            )));
        }
        let sb = Superblock::plan(
            opts.total_blocks,
            opts.ninodes,
            opts.journal_blocks,
            opts.snapshot_slots,
            opts.deleted_slots,
        )?;

        let zero = [0u8; BSIZE];
        for b in 0..sb.datastart {
            dev.write_block(b, &zero)?;
        }
        dev.write_block(Superblock::BLOCK, &sb.encode())?;

        // Metadata blocks are permanently in use.
        let mut map = [0u8; BSIZE];
        let mut current = sb.bmap_block(0);
        for b in 0..sb.datastart {
            let bb = sb.bmap_block(b);
            if bb != current {
                dev.write_block(current, &map)?;
                map = [0u8; BSIZE];
                current = bb;
            }
            let bit = (b % BPB) as usize;
            map[bit / 8] |= 1 << (bit % 8);
        }
        dev.write_block(current, &map)?;

        let mut root = DiskInode::empty();
        root.kind = InodeType::Dir;
        root.nlink = 1;
        root.create_time = now() as u32;
        let (blk, off) = sb.inode_pos(ROOTINO);
        let mut buf = [0u8; BSIZE];
        dev.read_block(blk, &mut buf)?;
        root.encode_into(&mut buf[off..]);
        dev.write_block(blk, &buf)?;
        dev.flush()?;

        info!(
            "formatted {} blocks: journal {}+{}, data from {}",
            sb.size, sb.journalstart, sb.njournalblocks, sb.datastart
        );
        Self::open(dev)
    }

    /// Mount: read the superblock, recover the journal, index the directory.
    pub fn open(dev: Arc<dyn BlockDevice>) -> Result<Self> {
        let mut buf = [0u8; BSIZE];
        dev.read_block(Superblock::BLOCK, &mut buf)?;
        let sb = Superblock::decode(&buf)?;
        if sb.size > dev.block_count() {
            return Err(ChronoError::CorruptData(format!(
                "superblock claims {} blocks, device holds {}",
                sb.size,
                dev.block_count()
            )));
        }

        let journal = Journal::new(Arc::clone(&dev), sb.journalstart, sb.njournalblocks);
        let recovery = journal.recover()?;
        if recovery != RecoveryOutcome::Clean {
            info!("journal recovery: {:?}", recovery);
        }

        let vol = Self {
            dev,
            sb,
            journal,
            dir: Directory::new(),
            recovery,
        };
        vol.dir.load(&vol)?;
        debug!("mounted: {} directory entries", vol.dir.len());
        Ok(vol)
    }

    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// What the journal did at mount time.
    pub fn recovery(&self) -> &RecoveryOutcome {
        &self.recovery
    }

    pub(crate) fn directory(&self) -> &Directory {
        &self.dir
    }

    pub fn read_block(&self, block: u32) -> Result<Block> {
        if let Some(data) = self.journal.pending(block) {
            return Ok(data);
        }
        let mut buf = [0u8; BSIZE];
        self.dev.read_block(block, &mut buf)?;
        Ok(buf)
    }

    pub fn write_block(&self, block: u32, data: &Block) -> Result<()> {
        self.journal.log_write(block, data)
    }

    /// Run `f` as one journal transaction. Its writes become durable
    /// together when it returns `Ok`, and vanish when it returns `Err`.
    pub fn transact<T>(&self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        self.journal.begin_tx()?;
        let value = match f(self) {
            Ok(v) => v,
            Err(e) => {
                self.journal.abort_tx()?;
                // The name index may have seen writes that never happened.
                self.dir.load(self)?;
                return Err(e);
            }
        };
        let tx = match self.journal.commit_tx() {
            Ok(tx) => tx,
            Err(e) => {
                self.dir.load(self)?;
                return Err(e);
            }
        };
        if let Err(e) = self.journal.install(&tx) {
            error!("committed tx {} could not be installed: {}", tx.sequence, e);
            return Err(ChronoError::Fatal(format!(
                "tx {} is durable but not installed ({})",
                tx.sequence, e
            )));
        }
        Ok(value)
    }

    /// Content of a file as described by its inode.
    pub fn read_content(&self, inode: &DiskInode) -> Result<Vec<u8>> {
        self.read_blocks(&inode.addrs, inode.size as usize)
    }

    /// Concatenate `size` bytes from a list of blocks.
    pub fn read_blocks(&self, blocks: &[u32], size: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(size);
        for &b in blocks {
            if out.len() >= size {
                break;
            }
            if b == 0 {
                return Err(ChronoError::CorruptData(format!(
                    "hole inside a {}-byte file",
                    size
                )));
            }
            let data = self.read_block(b)?;
            let n = (size - out.len()).min(BSIZE);
            out.extend_from_slice(&data[..n]);
        }
        if out.len() < size {
            return Err(ChronoError::CorruptData(format!(
                "{} blocks cannot hold {} bytes",
                blocks.len(),
                size
            )));
        }
        Ok(out)
    }

    /// Allocate fresh blocks and fill them with `content`.
    pub fn write_fresh(&self, content: &[u8]) -> Result<[u32; NDIRECT]> {
        if content.len() > MAXFILE_BYTES {
            return Err(ChronoError::InvalidArgument(format!(
                "{} bytes exceed the {}-byte file limit",
                content.len(),
                MAXFILE_BYTES
            )));
        }
        let mut addrs = [0u32; NDIRECT];
        for (i, chunk) in content.chunks(BSIZE).enumerate() {
            let b = self.alloc_block()?;
            let mut buf = [0u8; BSIZE];
            buf[..chunk.len()].copy_from_slice(chunk);
            self.write_block(b, &buf)?;
            addrs[i] = b;
        }
        Ok(addrs)
    }

    /// Copy whole blocks into freshly allocated ones.
    pub fn copy_blocks(&self, blocks: &[u32]) -> Result<[u32; NDIRECT]> {
        if blocks.len() > NDIRECT {
            return Err(ChronoError::InvalidArgument(format!(
                "{} blocks exceed the {}-block file limit",
                blocks.len(),
                NDIRECT
            )));
        }
        let mut addrs = [0u32; NDIRECT];
        for (i, &src) in blocks.iter().enumerate() {
            let data = self.read_block(src)?;
            let dst = self.alloc_block()?;
            self.write_block(dst, &data)?;
            addrs[i] = dst;
        }
        Ok(addrs)
    }
}

/// Split a user path into a root-directory name.
pub fn file_name(path: &str) -> Result<&str> {
    let name = path.strip_prefix('/').unwrap_or(path);
    if name.contains('/') || name == "." || name == ".." {
        return Err(ChronoError::InvalidArgument(format!(
            "malformed path {:?}",
            path
        )));
    }
    check_name("file name", name, DIRSIZ)?;
    Ok(name)
}
