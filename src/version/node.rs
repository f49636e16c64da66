use crate::error::{ChronoError, Result};
use crate::fs::cas::record_checksum;
use crate::fs::layout::{
    get_name, get_u32, get_u64, put_name, put_u32, put_u64, Block, BSIZE, NAME_MAX,
    VNODE_DATA_BLOCKS,
};

const VNODE_MAGIC: u32 = 0x564E_4F44;

// Field offsets inside a version-node block.
const OFF_MAGIC: usize = 0;
const OFF_TIMESTAMP: usize = 4;
const OFF_PREV: usize = 12;
const OFF_NBLOCKS: usize = 16;
const OFF_SIZE: usize = 20;
const OFF_REFCOUNT: usize = 24;
const OFF_SNAPSHOT: usize = 28;
const OFF_CHECKSUM: usize = 32;
const OFF_BLOCKS: usize = 36;
const OFF_DESC: usize = OFF_BLOCKS + VNODE_DATA_BLOCKS * 4;
const NODE_LEN: usize = OFF_DESC + NAME_MAX + 1;

/// One immutable snapshot of a file. Stored in its own block, whose number
/// is the node's handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionNode {
    pub timestamp: u64,
    pub prev_version: Option<u32>,
    pub data_blocks: Vec<u32>,
    pub file_size: u32,
    /// Number of chains linking this node.
    pub refcount: u32,
    pub description: String,
    pub checksum: u32,
    pub snapshot_id: Option<u32>,
}

impl VersionNode {
    pub fn new(
        timestamp: u64,
        prev_version: Option<u32>,
        data_blocks: Vec<u32>,
        file_size: u32,
        description: &str,
        snapshot_id: Option<u32>,
    ) -> Self {
        let mut node = Self {
            timestamp,
            prev_version,
            data_blocks,
            file_size,
            refcount: 1,
            description: description.to_string(),
            checksum: 0,
            snapshot_id,
        };
        node.checksum = node.integrity();
        node
    }

    pub fn block_count(&self) -> usize {
        self.data_blocks.len()
    }

    /// Checksum over every field except `refcount` and `checksum`.
    fn integrity(&self) -> u32 {
        let buf = self.encode_fields(0);
        record_checksum(&buf[..NODE_LEN])
    }

    /// Re-link the node (used when older versions are pruned away).
    pub fn relink(&mut self, prev_version: Option<u32>) {
        self.prev_version = prev_version;
        self.checksum = self.integrity();
    }

    fn encode_fields(&self, checksum: u32) -> Block {
        let mut b = [0u8; BSIZE];
        put_u32(&mut b, OFF_MAGIC, VNODE_MAGIC);
        put_u64(&mut b, OFF_TIMESTAMP, self.timestamp);
        put_u32(&mut b, OFF_PREV, self.prev_version.unwrap_or(0));
        put_u32(&mut b, OFF_NBLOCKS, self.data_blocks.len() as u32);
        put_u32(&mut b, OFF_SIZE, self.file_size);
        put_u32(&mut b, OFF_SNAPSHOT, self.snapshot_id.unwrap_or(0));
        put_u32(&mut b, OFF_CHECKSUM, checksum);
        for (i, blk) in self.data_blocks.iter().enumerate() {
            put_u32(&mut b, OFF_BLOCKS + i * 4, *blk);
        }
        put_name(&mut b, OFF_DESC, NAME_MAX + 1, &self.description);
        b
    }

    pub fn encode(&self) -> Block {
        let mut b = self.encode_fields(self.checksum);
        put_u32(&mut b, OFF_REFCOUNT, self.refcount);
        b
    }

    pub fn decode(handle: u32, b: &Block) -> Result<Self> {
        if get_u32(b, OFF_MAGIC) != VNODE_MAGIC {
            return Err(ChronoError::CorruptData(format!(
                "block {} is not a version node",
                handle
            )));
        }
        let nblocks = get_u32(b, OFF_NBLOCKS) as usize;
        if nblocks > VNODE_DATA_BLOCKS {
            return Err(ChronoError::CorruptData(format!(
                "version node {} claims {} blocks",
                handle, nblocks
            )));
        }
        let prev = get_u32(b, OFF_PREV);
        let snap = get_u32(b, OFF_SNAPSHOT);
        let node = Self {
            timestamp: get_u64(b, OFF_TIMESTAMP),
            prev_version: (prev != 0).then_some(prev),
            data_blocks: (0..nblocks).map(|i| get_u32(b, OFF_BLOCKS + i * 4)).collect(),
            file_size: get_u32(b, OFF_SIZE),
            refcount: get_u32(b, OFF_REFCOUNT),
            description: get_name(b, OFF_DESC, NAME_MAX + 1),
            checksum: get_u32(b, OFF_CHECKSUM),
            snapshot_id: (snap != 0).then_some(snap),
        };
        if node.integrity() != node.checksum {
            return Err(ChronoError::CorruptData(format!(
                "version node {} fails its checksum",
                handle
            )));
        }
        Ok(node)
    }
}
