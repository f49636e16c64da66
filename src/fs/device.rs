use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use super::layout::{Block, BSIZE};

/// Raw block storage underneath a volume.
pub trait BlockDevice: Send + Sync {
    fn block_count(&self) -> u32;
    fn read_block(&self, block: u32, buf: &mut Block) -> io::Result<()>;
    fn write_block(&self, block: u32, buf: &Block) -> io::Result<()>;
    fn flush(&self) -> io::Result<()>;
}

fn out_of_range(block: u32, count: u32) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("block {} out of range (device has {})", block, count),
    )
}

/// In-memory device. Clones share the same storage, so dropping every
/// volume built on a clone and reopening is a crash with no lost writes.
#[derive(Clone)]
pub struct MemDevice {
    data: Arc<Mutex<Vec<u8>>>,
    blocks: u32,
}

impl MemDevice {
    pub fn new(blocks: u32) -> Self {
        Self {
            data: Arc::new(Mutex::new(vec![0u8; blocks as usize * BSIZE])),
            blocks,
        }
    }
}

impl BlockDevice for MemDevice {
    fn block_count(&self) -> u32 {
        self.blocks
    }

    fn read_block(&self, block: u32, buf: &mut Block) -> io::Result<()> {
        if block >= self.blocks {
            return Err(out_of_range(block, self.blocks));
        }
        let off = block as usize * BSIZE;
        buf.copy_from_slice(&self.data.lock()[off..off + BSIZE]);
        Ok(())
    }

    fn write_block(&self, block: u32, buf: &Block) -> io::Result<()> {
        if block >= self.blocks {
            return Err(out_of_range(block, self.blocks));
        }
        let off = block as usize * BSIZE;
        self.data.lock()[off..off + BSIZE].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Image file on the host filesystem.
pub struct FileDevice {
    file: File,
    blocks: u32,
}

impl FileDevice {
    /// Create (or truncate) an image of `blocks` zeroed blocks.
    pub fn create(path: &Path, blocks: u32) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(blocks as u64 * BSIZE as u64)?;
        Ok(Self { file, blocks })
    }

    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len % BSIZE as u64 != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("image size {} is not a multiple of {}", len, BSIZE),
            ));
        }
        Ok(Self {
            file,
            blocks: (len / BSIZE as u64) as u32,
        })
    }
}

impl BlockDevice for FileDevice {
    fn block_count(&self) -> u32 {
        self.blocks
    }

    fn read_block(&self, block: u32, buf: &mut Block) -> io::Result<()> {
        if block >= self.blocks {
            return Err(out_of_range(block, self.blocks));
        }
        self.file.read_exact_at(buf, block as u64 * BSIZE as u64)
    }

    fn write_block(&self, block: u32, buf: &Block) -> io::Result<()> {
        if block >= self.blocks {
            return Err(out_of_range(block, self.blocks));
        }
        self.file.write_all_at(buf, block as u64 * BSIZE as u64)
    }

    fn flush(&self) -> io::Result<()> {
        self.file.sync_data()
    }
}
