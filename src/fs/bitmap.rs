use tracing::warn;

use super::layout::{BPB, BSIZE};
use super::Volume;
use crate::error::{ChronoError, Result};

fn bit(b: u32) -> (usize, u8) {
    let bi = (b % BPB) as usize;
    (bi / 8, 1 << (bi % 8))
}

impl Volume {
    /// Allocate a zeroed data block.
    pub fn alloc_block(&self) -> Result<u32> {
        let sb = self.superblock();
        let mut base = sb.datastart - sb.datastart % BPB;
        while base < sb.size {
            let bmap = sb.bmap_block(base);
            let mut map = self.read_block(bmap)?;
            let end = (base + BPB).min(sb.size);
            for b in base.max(sb.datastart)..end {
                let (byte, mask) = bit(b);
                if map[byte] & mask == 0 {
                    map[byte] |= mask;
                    self.write_block(bmap, &map)?;
                    self.write_block(b, &[0u8; BSIZE])?;
                    return Ok(b);
                }
            }
            base += BPB;
        }
        warn!("out of data blocks");
        Err(ChronoError::TableFull("data block"))
    }

    /// Return a data block to the free pool.
    pub fn free_block(&self, b: u32) -> Result<()> {
        let sb = self.superblock();
        if !sb.is_data_block(b) {
            return Err(ChronoError::Fatal(format!("freeing non-data block {}", b)));
        }
        let bmap = sb.bmap_block(b);
        let mut map = self.read_block(bmap)?;
        let (byte, mask) = bit(b);
        if map[byte] & mask == 0 {
            return Err(ChronoError::Fatal(format!("freeing free block {}", b)));
        }
        map[byte] &= !mask;
        self.write_block(bmap, &map)
    }

    pub fn is_allocated(&self, b: u32) -> Result<bool> {
        let sb = self.superblock();
        if b >= sb.size {
            return Ok(false);
        }
        let map = self.read_block(sb.bmap_block(b))?;
        let (byte, mask) = bit(b);
        Ok(map[byte] & mask != 0)
    }

    /// Every data block currently marked in use.
    pub fn allocated_data_blocks(&self) -> Result<Vec<u32>> {
        let sb = self.superblock();
        let mut out = Vec::new();
        let mut cached: Option<(u32, [u8; BSIZE])> = None;
        for b in sb.datastart..sb.size {
            let bmap = sb.bmap_block(b);
            let map = match cached {
                Some((blk, map)) if blk == bmap => map,
                _ => {
                    let map = self.read_block(bmap)?;
                    cached = Some((bmap, map));
                    map
                }
            };
            let (byte, mask) = bit(b);
            if map[byte] & mask != 0 {
                out.push(b);
            }
        }
        Ok(out)
    }
}
