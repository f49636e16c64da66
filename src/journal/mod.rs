//! Write-ahead journal.
//!
//! The journal region is a byte stream laid over `njournalblocks` blocks:
//! one [`JournalHeader`] followed by `entry_count` [`JournalEntry`] records,
//! each carrying a target block number, the payload checksum and one full
//! block of payload.
//!
//! A transaction is durable once its header is on disk with
//! `commit_flag == 1` and a valid checksum. Installing the logged blocks at
//! their home locations is a separate step ([`Journal::install`]); a crash
//! between the two is repaired by [`Journal::recover`].

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{ChronoError, Result};
use crate::fs::cas::{block_checksum, record_checksum};
use crate::fs::device::BlockDevice;
use crate::fs::layout::{get_u32, put_u32, Block, BSIZE, JOURNAL_MAGIC};

pub const HEADER_SIZE: usize = 20;
pub const ENTRY_SIZE: usize = 8 + BSIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalHeader {
    pub magic: u32,
    pub sequence: u32,
    pub entry_count: u32,
    pub commit_flag: u32,
    pub header_checksum: u32,
}

impl JournalHeader {
    fn new(sequence: u32, entry_count: u32, committed: bool) -> Self {
        let mut hdr = Self {
            magic: JOURNAL_MAGIC,
            sequence,
            entry_count,
            commit_flag: committed as u32,
            header_checksum: 0,
        };
        hdr.header_checksum = hdr.compute_checksum();
        hdr
    }

    /// Header left behind once a transaction is fully installed.
    fn retired(sequence: u32) -> Self {
        Self {
            magic: 0,
            sequence,
            entry_count: 0,
            commit_flag: 0,
            header_checksum: 0,
        }
    }

    fn compute_checksum(&self) -> u32 {
        let mut b = [0u8; 16];
        put_u32(&mut b, 0, self.magic);
        put_u32(&mut b, 4, self.sequence);
        put_u32(&mut b, 8, self.entry_count);
        put_u32(&mut b, 12, self.commit_flag);
        record_checksum(&b)
    }

    /// A header is evidence of a transaction only if its checksum verifies.
    pub fn verify(&self) -> bool {
        self.magic == JOURNAL_MAGIC && self.header_checksum == self.compute_checksum()
    }

    pub fn is_committed(&self) -> bool {
        self.commit_flag == 1
    }

    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut b = [0u8; HEADER_SIZE];
        put_u32(&mut b, 0, self.magic);
        put_u32(&mut b, 4, self.sequence);
        put_u32(&mut b, 8, self.entry_count);
        put_u32(&mut b, 12, self.commit_flag);
        put_u32(&mut b, 16, self.header_checksum);
        b
    }

    fn decode(b: &[u8]) -> Self {
        Self {
            magic: get_u32(b, 0),
            sequence: get_u32(b, 4),
            entry_count: get_u32(b, 8),
            commit_flag: get_u32(b, 12),
            header_checksum: get_u32(b, 16),
        }
    }
}

#[derive(Clone)]
pub struct JournalEntry {
    pub block_num: u32,
    pub checksum: u32,
    pub data: Box<Block>,
}

impl JournalEntry {
    fn new(block_num: u32, data: &Block) -> Self {
        Self {
            block_num,
            checksum: block_checksum(data),
            data: Box::new(*data),
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut b = vec![0u8; ENTRY_SIZE];
        put_u32(&mut b, 0, self.block_num);
        put_u32(&mut b, 4, self.checksum);
        b[8..].copy_from_slice(&self.data[..]);
        b
    }

    fn decode(b: &[u8]) -> Self {
        let mut data = Box::new([0u8; BSIZE]);
        data.copy_from_slice(&b[8..8 + BSIZE]);
        Self {
            block_num: get_u32(b, 0),
            checksum: get_u32(b, 4),
            data,
        }
    }
}

impl std::fmt::Debug for JournalEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalEntry")
            .field("block_num", &self.block_num)
            .field("checksum", &self.checksum)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Idle,
    InTransaction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    Committed,
    Aborted,
}

/// A durable transaction whose blocks still have to reach their homes.
#[derive(Debug)]
pub struct CommittedTx {
    pub sequence: u32,
    pub entries: Vec<JournalEntry>,
}

/// What mount-time recovery did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// No transaction in the journal.
    Clean,
    /// A transaction was found but was incomplete or corrupt.
    Discarded(String),
    /// A committed transaction was replayed.
    Replayed { sequence: u32, blocks: usize },
}

struct JournalState {
    state: TxState,
    last_outcome: Option<TxOutcome>,
    sequence: u32,
    entries: Vec<JournalEntry>,
    /// block number -> index into `entries`
    index: HashMap<u32, usize>,
    /// A committed transaction is still waiting in the journal because its
    /// install failed.
    needs_recovery: bool,
}

pub struct Journal {
    dev: Arc<dyn BlockDevice>,
    start: u32,
    nblocks: u32,
    capacity: usize,
    inner: Mutex<JournalState>,
}

impl Journal {
    pub fn new(dev: Arc<dyn BlockDevice>, start: u32, nblocks: u32) -> Self {
        let bytes = nblocks as usize * BSIZE;
        let capacity = bytes.saturating_sub(HEADER_SIZE) / ENTRY_SIZE;
        Self {
            dev,
            start,
            nblocks,
            capacity,
            inner: Mutex::new(JournalState {
                state: TxState::Idle,
                last_outcome: None,
                sequence: 0,
                entries: Vec::new(),
                index: HashMap::new(),
                needs_recovery: false,
            }),
        }
    }

    /// Maximum number of distinct blocks one transaction may log.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn state(&self) -> TxState {
        self.inner.lock().state
    }

    pub fn last_outcome(&self) -> Option<TxOutcome> {
        self.inner.lock().last_outcome
    }

    /// True while a committed transaction has not reached its home blocks.
    pub fn needs_recovery(&self) -> bool {
        self.inner.lock().needs_recovery
    }

    pub fn sequence(&self) -> u32 {
        self.inner.lock().sequence
    }

    /// Payload logged for `block` by the open transaction, if any.
    pub fn pending(&self, block: u32) -> Option<Block> {
        let inner = self.inner.lock();
        if inner.state != TxState::InTransaction {
            return None;
        }
        inner.index.get(&block).map(|&i| *inner.entries[i].data)
    }

    pub fn begin_tx(&self) -> Result<u32> {
        let mut inner = self.inner.lock();
        if inner.state == TxState::InTransaction {
            return Err(ChronoError::StateViolation(
                "transaction already in progress".to_string(),
            ));
        }
        if inner.needs_recovery {
            self.settle(&mut inner)?;
        }
        let sequence = inner.sequence.wrapping_add(1);
        self.write_header(&JournalHeader::new(sequence, 0, false))?;
        inner.sequence = sequence;
        inner.state = TxState::InTransaction;
        inner.entries.clear();
        inner.index.clear();
        debug!("journal: begin tx {}", sequence);
        Ok(sequence)
    }

    /// Log a full-block write. Logging a block twice in one transaction
    /// replaces the earlier payload.
    pub fn log_write(&self, block: u32, data: &Block) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != TxState::InTransaction {
            return Err(ChronoError::StateViolation(
                "log_write outside a transaction".to_string(),
            ));
        }
        if block >= self.start && block < self.start + self.nblocks {
            return Err(ChronoError::InvalidArgument(format!(
                "block {} lies inside the journal",
                block
            )));
        }
        let entry = JournalEntry::new(block, data);
        let slot = match inner.index.get(&block) {
            Some(&slot) => slot,
            None => {
                if inner.entries.len() >= self.capacity {
                    warn!(
                        "journal: tx {} exceeds {} entries",
                        inner.sequence, self.capacity
                    );
                    return Err(ChronoError::TableFull("journal"));
                }
                inner.entries.len()
            }
        };
        self.write_region(HEADER_SIZE + slot * ENTRY_SIZE, &entry.encode())?;
        if slot == inner.entries.len() {
            inner.index.insert(block, slot);
            inner.entries.push(entry);
        } else {
            inner.entries[slot] = entry;
        }
        Ok(())
    }

    /// Make the open transaction durable and return it for installation.
    pub fn commit_tx(&self) -> Result<CommittedTx> {
        let mut inner = self.inner.lock();
        if inner.state != TxState::InTransaction {
            return Err(ChronoError::StateViolation(
                "commit without a transaction".to_string(),
            ));
        }
        let hdr = JournalHeader::new(inner.sequence, inner.entries.len() as u32, true);
        if let Err(e) = self.write_header(&hdr).and_then(|_| Ok(self.dev.flush()?)) {
            // Nothing reached the home locations; the transaction is gone.
            inner.state = TxState::Idle;
            inner.last_outcome = Some(TxOutcome::Aborted);
            inner.entries.clear();
            inner.index.clear();
            return Err(e);
        }
        inner.state = TxState::Idle;
        inner.last_outcome = Some(TxOutcome::Committed);
        inner.index.clear();
        let entries = std::mem::take(&mut inner.entries);
        debug!("journal: committed tx {} ({} blocks)", inner.sequence, entries.len());
        Ok(CommittedTx {
            sequence: inner.sequence,
            entries,
        })
    }

    pub fn abort_tx(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != TxState::InTransaction {
            return Err(ChronoError::StateViolation(
                "abort without a transaction".to_string(),
            ));
        }
        debug!(
            "journal: aborted tx {} ({} blocks discarded)",
            inner.sequence,
            inner.entries.len()
        );
        inner.state = TxState::Idle;
        inner.last_outcome = Some(TxOutcome::Aborted);
        inner.entries.clear();
        inner.index.clear();
        Ok(())
    }

    /// Write a committed transaction's blocks home, then retire it.
    /// A failure leaves the transaction committed in the journal and
    /// blocks new transactions until it is replayed.
    pub fn install(&self, tx: &CommittedTx) -> Result<()> {
        let result = tx
            .entries
            .iter()
            .try_for_each(|entry| self.dev.write_block(entry.block_num, &entry.data))
            .and_then(|_| self.dev.flush())
            .map_err(ChronoError::from)
            .and_then(|_| self.clear(tx.sequence));
        if result.is_err() {
            self.inner.lock().needs_recovery = true;
        }
        result
    }

    /// Replay and retire the committed transaction a failed install left
    /// behind. The journal header is never overwritten before this succeeds.
    fn settle(&self, inner: &mut JournalState) -> Result<()> {
        let settled = self.read_header().and_then(|hdr| {
            let blocks = self.replay()?;
            self.clear(hdr.sequence)?;
            Ok((hdr.sequence, blocks))
        });
        match settled {
            Ok((sequence, blocks)) => {
                info!("journal: installed pending tx {} ({} blocks)", sequence, blocks);
                inner.needs_recovery = false;
                Ok(())
            }
            Err(e) => {
                warn!("journal: pending tx still not installed: {}", e);
                Err(ChronoError::Fatal(format!(
                    "committed transaction still not installed ({})",
                    e
                )))
            }
        }
    }

    /// Replay the committed transaction currently in the journal without
    /// retiring it. Writes are absolute overwrites, so replaying twice has
    /// the same effect as once. Returns the number of blocks written.
    pub fn replay(&self) -> Result<usize> {
        let hdr = self.read_header()?;
        if hdr.magic == 0 {
            return Ok(0);
        }
        if !hdr.verify() {
            return Err(ChronoError::CorruptData(
                "journal header checksum mismatch".to_string(),
            ));
        }
        if !hdr.is_committed() {
            return Ok(0);
        }
        let entries = self.read_entries(&hdr)?;
        for entry in &entries {
            self.dev.write_block(entry.block_num, &entry.data)?;
        }
        self.dev.flush()?;
        Ok(entries.len())
    }

    /// Mount-time recovery. Committed transactions are replayed; anything
    /// else in the journal is discarded as if it never happened.
    pub fn recover(&self) -> Result<RecoveryOutcome> {
        let hdr = self.read_header()?;
        {
            let mut inner = self.inner.lock();
            if inner.state == TxState::InTransaction {
                return Err(ChronoError::StateViolation(
                    "recovery during a transaction".to_string(),
                ));
            }
            if hdr.magic == 0 || hdr.verify() {
                inner.sequence = hdr.sequence;
            }
        }

        if hdr.magic == 0 {
            return Ok(RecoveryOutcome::Clean);
        }
        if !hdr.verify() {
            warn!("journal: header checksum invalid, discarding");
            self.clear(0)?;
            return Ok(RecoveryOutcome::Discarded("bad header checksum".to_string()));
        }
        if !hdr.is_committed() {
            info!("journal: tx {} was never committed, discarding", hdr.sequence);
            self.clear(hdr.sequence)?;
            return Ok(RecoveryOutcome::Discarded(format!(
                "tx {} not committed",
                hdr.sequence
            )));
        }
        match self.replay() {
            Ok(blocks) => {
                info!("journal: replayed tx {} ({} blocks)", hdr.sequence, blocks);
                self.clear(hdr.sequence)?;
                self.inner.lock().needs_recovery = false;
                Ok(RecoveryOutcome::Replayed {
                    sequence: hdr.sequence,
                    blocks,
                })
            }
            Err(ChronoError::CorruptData(why)) => {
                warn!("journal: tx {} corrupt ({}), discarding", hdr.sequence, why);
                self.clear(hdr.sequence)?;
                Ok(RecoveryOutcome::Discarded(why))
            }
            Err(e) => Err(e),
        }
    }

    fn read_entries(&self, hdr: &JournalHeader) -> Result<Vec<JournalEntry>> {
        let count = hdr.entry_count as usize;
        if count > self.capacity {
            return Err(ChronoError::CorruptData(format!(
                "journal claims {} entries, capacity {}",
                count, self.capacity
            )));
        }
        let bytes = self.read_region(HEADER_SIZE, count * ENTRY_SIZE)?;
        let limit = self.dev.block_count();
        let mut entries = Vec::with_capacity(count);
        for chunk in bytes.chunks_exact(ENTRY_SIZE) {
            let entry = JournalEntry::decode(chunk);
            if entry.block_num >= limit
                || (entry.block_num >= self.start && entry.block_num < self.start + self.nblocks)
            {
                return Err(ChronoError::CorruptData(format!(
                    "journal entry targets block {}",
                    entry.block_num
                )));
            }
            if block_checksum(&entry.data[..]) != entry.checksum {
                return Err(ChronoError::CorruptData(format!(
                    "journal entry for block {} fails its checksum",
                    entry.block_num
                )));
            }
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Retire the journal contents. Only the sequence number survives.
    fn clear(&self, sequence: u32) -> Result<()> {
        self.write_header(&JournalHeader::retired(sequence))?;
        self.dev.flush()?;
        Ok(())
    }

    fn read_header(&self) -> Result<JournalHeader> {
        let bytes = self.read_region(0, HEADER_SIZE)?;
        Ok(JournalHeader::decode(&bytes))
    }

    fn write_header(&self, hdr: &JournalHeader) -> Result<()> {
        self.write_region(0, &hdr.encode())
    }

    fn read_region(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        let mut pos = offset;
        let end = offset + len;
        let mut buf = [0u8; BSIZE];
        while pos < end {
            let blk = (pos / BSIZE) as u32;
            let within = pos % BSIZE;
            let n = (BSIZE - within).min(end - pos);
            self.dev.read_block(self.start + blk, &mut buf)?;
            out.extend_from_slice(&buf[within..within + n]);
            pos += n;
        }
        Ok(out)
    }

    fn write_region(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        if offset + bytes.len() > self.nblocks as usize * BSIZE {
            return Err(ChronoError::TableFull("journal"));
        }
        let mut pos = 0;
        let mut buf = [0u8; BSIZE];
        while pos < bytes.len() {
            let abs = offset + pos;
            let blk = (abs / BSIZE) as u32;
            let within = abs % BSIZE;
            let n = (BSIZE - within).min(bytes.len() - pos);
            if n < BSIZE {
                self.dev.read_block(self.start + blk, &mut buf)?;
            }
            buf[within..within + n].copy_from_slice(&bytes[pos..pos + n]);
            self.dev.write_block(self.start + blk, &buf)?;
            pos += n;
        }
        Ok(())
    }
}
