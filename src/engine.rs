//! The storage engine: one owned aggregate holding the volume and every
//! table, with one entry point per operation.
//!
//! Mutating operations run under a single writer lock as one journal
//! transaction each. Table changes are staged in a [`RefLedger`] and only
//! applied after the transaction commits.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{ChronoConfig, FormatOptions};
use crate::diff::{self, DiffReport};
use crate::error::{ChronoError, Result};
use crate::fs::device::{BlockDevice, FileDevice};
use crate::fs::layout::{DiskInode, InodeFlags, MAXFILE_BYTES};
use crate::fs::{file_name, now, Volume};
use crate::recovery::{DeletedEntry, DeletedRegistry};
use crate::snapshot::{SnapshotMetadata, SnapshotTable};
use crate::state::dedup::DedupIndex;
use crate::state::gc::{self, Census, GcStats};
use crate::state::ledger::RefLedger;
use crate::state::refcount::BlockRefCounter;
use crate::version::{self, PruneStats, VersionInfo};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    pub name: String,
    pub inum: u32,
    pub size: u32,
    pub versions: usize,
    pub immutable: bool,
}

/// Per-file result of restoring files to a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRestore {
    pub file: String,
    pub version: Option<u32>,
    pub error: Option<String>,
}

pub struct StorageEngine {
    volume: Volume,
    refs: BlockRefCounter,
    dedup: DedupIndex,
    snapshots: SnapshotTable,
    deleted: DeletedRegistry,
    config: ChronoConfig,
    op_lock: Mutex<()>,
    gc_stats: Mutex<GcStats>,
    /// Set by the first `Fatal`; every later operation is refused.
    halted: Mutex<Option<String>>,
}

fn lookup(vol: &Volume, path: &str) -> Result<(u32, DiskInode)> {
    let name = file_name(path)?;
    let inum = vol
        .dir_lookup(name)
        .ok_or_else(|| ChronoError::NotFound(name.to_string()))?;
    Ok((inum, vol.read_inode(inum)?))
}

fn release_all(vol: &Volume, ledger: &mut RefLedger<'_>, inode: &DiskInode) -> Result<usize> {
    let mut freed = 0;
    for b in inode.blocks() {
        if gc::release_block(vol, ledger, b)? {
            freed += 1;
        }
    }
    Ok(freed)
}

impl StorageEngine {
    /// Format `dev` and mount the result.
    pub fn format(
        dev: Arc<dyn BlockDevice>,
        opts: &FormatOptions,
        config: ChronoConfig,
    ) -> Result<Self> {
        Self::mount(Volume::format(dev, opts)?, config)
    }

    pub fn open(dev: Arc<dyn BlockDevice>, config: ChronoConfig) -> Result<Self> {
        Self::mount(Volume::open(dev)?, config)
    }

    pub fn create_image(path: &Path, opts: &FormatOptions, config: ChronoConfig) -> Result<Self> {
        let dev = FileDevice::create(path, opts.total_blocks)?;
        Self::format(Arc::new(dev), opts, config)
    }

    pub fn open_image(path: &Path, config: ChronoConfig) -> Result<Self> {
        let dev = FileDevice::open(path)?;
        Self::open(Arc::new(dev), config)
    }

    fn mount(volume: Volume, config: ChronoConfig) -> Result<Self> {
        let engine = Self {
            refs: BlockRefCounter::new(config.refcount_capacity),
            dedup: DedupIndex::new(config.dedup_capacity),
            snapshots: SnapshotTable::new(),
            deleted: DeletedRegistry::new(),
            volume,
            config,
            op_lock: Mutex::new(()),
            gc_stats: Mutex::new(GcStats::default()),
            halted: Mutex::new(None),
        };
        engine.snapshots.load(&engine.volume)?;
        engine.deleted.load(&engine.volume)?;
        gc::rebuild_tables(&engine.volume, &engine.refs, &engine.dedup, &engine.deleted_heads())?;
        Ok(engine)
    }

    pub fn volume(&self) -> &Volume {
        &self.volume
    }

    pub fn refs(&self) -> &BlockRefCounter {
        &self.refs
    }

    pub fn dedup(&self) -> &DedupIndex {
        &self.dedup
    }

    pub fn config(&self) -> &ChronoConfig {
        &self.config
    }

    fn deleted_heads(&self) -> Vec<u32> {
        self.deleted.heads().into_iter().map(|(_, h)| h).collect()
    }

    /// Run `f` as one transaction, applying its staged table changes only
    /// once the transaction has committed.
    fn mutate<T>(&self, f: impl FnOnce(&Volume, &mut RefLedger<'_>) -> Result<T>) -> Result<T> {
        let _guard = self.op_lock.lock();
        self.check_running()?;
        let mut ledger = RefLedger::new(&self.refs, &self.dedup);
        match self.volume.transact(|vol| f(vol, &mut ledger)) {
            Ok(value) => {
                let summary = ledger.apply();
                debug!(
                    "applied {} refcount changes, {} dedup ops",
                    summary.refs_changed, summary.dedup_ops
                );
                Ok(value)
            }
            Err(ChronoError::Fatal(why)) => {
                error!("storage engine halted: {}", why);
                *self.halted.lock() = Some(why.clone());
                Err(ChronoError::Fatal(why))
            }
            Err(e) => {
                // The slot indexes may hold changes that were rolled back.
                if let Err(reload) = self
                    .snapshots
                    .load(&self.volume)
                    .and_then(|_| self.deleted.load(&self.volume))
                {
                    warn!("reloading slot tables failed: {}", reload);
                }
                Err(e)
            }
        }
    }

    fn read<T>(&self, f: impl FnOnce(&Volume) -> Result<T>) -> Result<T> {
        let _guard = self.op_lock.lock();
        self.check_running()?;
        f(&self.volume)
    }

    /// Disk and tables disagree after a failed install until the volume is
    /// mounted again.
    fn check_running(&self) -> Result<()> {
        match &*self.halted.lock() {
            Some(why) => Err(ChronoError::Fatal(format!(
                "engine halted, remount to recover ({})",
                why
            ))),
            None => Ok(()),
        }
    }

    // Files

    pub fn create_file(&self, path: &str) -> Result<u32> {
        let name = file_name(path)?;
        self.mutate(|vol, _| {
            if vol.dir_lookup(name).is_some() {
                return Err(ChronoError::InvalidArgument(format!("{} already exists", name)));
            }
            let (inum, _) = vol.alloc_file_inode()?;
            vol.dir_link(name, inum)?;
            debug!("created {} as inode {}", name, inum);
            Ok(inum)
        })
    }

    /// Replace a file's whole content, creating it if needed. Old blocks
    /// are released, never overwritten.
    pub fn write_file(&self, path: &str, content: &[u8]) -> Result<()> {
        let name = file_name(path)?;
        if content.len() > MAXFILE_BYTES {
            return Err(ChronoError::InvalidArgument(format!(
                "{} bytes exceed the {}-byte file limit",
                content.len(),
                MAXFILE_BYTES
            )));
        }
        self.mutate(|vol, ledger| {
            let (inum, mut inode) = match vol.dir_lookup(name) {
                Some(inum) => (inum, vol.read_inode(inum)?),
                None => {
                    let (inum, inode) = vol.alloc_file_inode()?;
                    vol.dir_link(name, inum)?;
                    (inum, inode)
                }
            };
            if inode.flags.contains(InodeFlags::IMMUTABLE) {
                return Err(ChronoError::InvalidArgument(format!("{} is immutable", name)));
            }
            let addrs = vol.write_fresh(content)?;
            release_all(vol, ledger, &inode)?;
            inode.addrs = addrs;
            inode.size = content.len() as u32;
            vol.write_inode(inum, &inode)
        })
    }

    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.read(|vol| {
            let (_, inode) = lookup(vol, path)?;
            vol.read_content(&inode)
        })
    }

    pub fn set_immutable(&self, path: &str, immutable: bool) -> Result<()> {
        self.mutate(|vol, _| {
            let (inum, mut inode) = lookup(vol, path)?;
            inode.flags.set(InodeFlags::IMMUTABLE, immutable);
            vol.write_inode(inum, &inode)
        })
    }

    /// Remove a file. A file with versions is registered as deleted so it
    /// can be recovered; a full registry fails the unlink.
    pub fn unlink(&self, path: &str) -> Result<()> {
        let name = file_name(path)?;
        self.mutate(|vol, ledger| {
            let (inum, inode) = lookup(vol, name)?;
            vol.dir_unlink(name)?;
            if let Some(head) = inode.version_head {
                self.deleted
                    .register_deletion(vol, name, inum, inode.flags, head, now())?;
            }
            release_all(vol, ledger, &inode)?;
            vol.free_inode(inum)?;
            info!("removed {} (inode {})", name, inum);
            Ok(())
        })
    }

    pub fn list_files(&self) -> Result<Vec<FileInfo>> {
        self.read(|vol| {
            vol.dir_entries()
                .into_iter()
                .map(|(name, inum)| {
                    let inode = vol.read_inode(inum)?;
                    Ok(FileInfo {
                        name,
                        inum,
                        size: inode.size,
                        versions: version::chain_len(vol, inode.version_head)?,
                        immutable: inode.flags.contains(InodeFlags::IMMUTABLE),
                    })
                })
                .collect()
        })
    }

    // Versions

    /// Record the file's current content as its newest version.
    pub fn version_create(&self, path: &str, description: &str) -> Result<u32> {
        self.mutate(|vol, ledger| {
            let (inum, _) = lookup(vol, path)?;
            version::create(vol, ledger, inum, description, None)
        })
    }

    /// Up to `max` of the newest versions, oldest first.
    pub fn version_list(&self, path: &str, max: usize) -> Result<Vec<VersionInfo>> {
        self.read(|vol| {
            let (_, inode) = lookup(vol, path)?;
            version::list(vol, inode.version_head, max)
        })
    }

    pub fn version_get_content(&self, path: &str, index: u32, cap: usize) -> Result<Vec<u8>> {
        self.read(|vol| {
            let (_, inode) = lookup(vol, path)?;
            version::get_content(vol, inode.version_head, index, cap)
        })
    }

    pub fn version_restore(&self, path: &str, index: u32) -> Result<()> {
        self.mutate(|vol, ledger| {
            let (inum, _) = lookup(vol, path)?;
            version::restore(vol, ledger, inum, index)
        })
    }

    pub fn version_count(&self, path: &str) -> Result<usize> {
        self.read(|vol| {
            let (_, inode) = lookup(vol, path)?;
            version::chain_len(vol, inode.version_head)
        })
    }

    /// Newest version recorded at or before `timestamp`.
    pub fn version_at_time(&self, path: &str, timestamp: u64) -> Result<Option<VersionInfo>> {
        self.read(|vol| {
            let (_, inode) = lookup(vol, path)?;
            version::at_time(vol, inode.version_head, timestamp)
        })
    }

    pub fn version_diff(&self, path: &str, from: u32, to: u32) -> Result<DiffReport> {
        self.read(|vol| {
            let (_, inode) = lookup(vol, path)?;
            let old = version::get_content(vol, inode.version_head, from, MAXFILE_BYTES)?;
            let new = version::get_content(vol, inode.version_head, to, MAXFILE_BYTES)?;
            Ok(diff::diff_versions(from, to, &old, &new))
        })
    }

    // Snapshots

    fn tree_stats(vol: &Volume) -> Result<(u32, u32)> {
        let files = vol.file_inodes()?;
        let blocks = files.iter().map(|(_, i)| i.blocks().count() as u32).sum();
        Ok((files.len() as u32, blocks))
    }

    /// Record a named checkpoint of the whole tree.
    pub fn snapshot_create(&self, name: &str) -> Result<SnapshotMetadata> {
        self.mutate(|vol, _| {
            let (files, blocks) = Self::tree_stats(vol)?;
            self.snapshots.create(vol, name, files, blocks)
        })
    }

    /// Create a snapshot and version each file (all files when `files` is
    /// empty) with the snapshot's name as description.
    pub fn snapshot_capture(&self, name: &str, files: &[String]) -> Result<SnapshotMetadata> {
        self.mutate(|vol, ledger| {
            let targets: Vec<(u32, DiskInode)> = if files.is_empty() {
                vol.file_inodes()?
            } else {
                files
                    .iter()
                    .map(|f| lookup(vol, f))
                    .collect::<Result<_>>()?
            };
            let blocks = targets.iter().map(|(_, i)| i.blocks().count() as u32).sum();
            let meta = self
                .snapshots
                .create(vol, name, targets.len() as u32, blocks)?;
            for (inum, _) in &targets {
                version::create(vol, ledger, *inum, name, Some(meta.id))?;
            }
            info!("snapshot {} captured {} files", name, targets.len());
            Ok(meta)
        })
    }

    pub fn snapshot_list(&self, max: usize) -> Vec<SnapshotMetadata> {
        self.snapshots.list(max)
    }

    pub fn snapshot_find(&self, name: &str) -> Option<SnapshotMetadata> {
        self.snapshots.find(name)
    }

    pub fn snapshot_find_by_id(&self, id: u32) -> Option<SnapshotMetadata> {
        self.snapshots.find_by_id(id)
    }

    pub fn snapshot_delete(&self, name: &str) -> Result<SnapshotMetadata> {
        self.mutate(|vol, _| self.snapshots.delete(vol, name))
    }

    /// Whole-tree rollback is not provided; see
    /// [`StorageEngine::snapshot_restore_files`].
    pub fn snapshot_restore(&self, name: &str) -> Result<()> {
        Err(ChronoError::Unsupported(format!(
            "whole-tree restore of snapshot {}; restore files individually",
            name
        )))
    }

    /// Restore each file (all files when `files` is empty) to its newest
    /// version described by `name`. Failures are reported per file.
    pub fn snapshot_restore_files(&self, name: &str, files: &[String]) -> Result<Vec<FileRestore>> {
        if self.snapshot_find(name).is_none() {
            return Err(ChronoError::NotFound(format!("snapshot {}", name)));
        }
        let targets: Vec<String> = if files.is_empty() {
            self.list_files()?.into_iter().map(|f| f.name).collect()
        } else {
            files.to_vec()
        };
        let mut outcomes = Vec::with_capacity(targets.len());
        for file in targets {
            let result = self
                .version_list(&file, usize::MAX)
                .and_then(|versions| {
                    versions
                        .iter()
                        .rev()
                        .find(|v| v.description == name)
                        .map(|v| v.version_num)
                        .ok_or_else(|| {
                            ChronoError::NotFound(format!("version {:?} of {}", name, file))
                        })
                })
                .and_then(|index| self.version_restore(&file, index).map(|_| index));
            if let Err(e) = &result {
                warn!("restoring {} to snapshot {} failed: {}", file, name, e);
            }
            outcomes.push(FileRestore {
                file,
                version: result.as_ref().ok().copied(),
                error: result.err().map(|e| e.to_string()),
            });
        }
        Ok(outcomes)
    }

    // Recovery

    pub fn recover_file(&self, path: &str) -> Result<u32> {
        self.mutate(|vol, _| self.deleted.recover(vol, path))
    }

    pub fn list_deleted(&self, max: usize) -> Vec<DeletedEntry> {
        self.deleted.list(max)
    }

    pub fn find_deleted(&self, name: &str) -> Option<DeletedEntry> {
        self.deleted.find(name)
    }

    // Garbage collection

    fn prune_all(
        &self,
        mut keep_for: impl FnMut(&Volume, Option<u32>) -> Result<usize>,
    ) -> Result<PruneStats> {
        let mut total = PruneStats::default();
        let files = self.read(|vol| vol.file_inodes())?;
        for (inum, inode) in files {
            if inode.version_head.is_none() {
                continue;
            }
            let stats = self.mutate(|vol, ledger| {
                let mut inode = vol.read_inode(inum)?;
                let keep = keep_for(vol, inode.version_head)?;
                let (head, stats) = version::prune_chain(vol, ledger, inode.version_head, keep)?;
                if head != inode.version_head {
                    inode.version_head = head;
                    vol.write_inode(inum, &inode)?;
                }
                Ok(stats)
            })?;
            total.absorb(stats);
        }
        for (slot, seen) in self.deleted.heads() {
            let stats = self.mutate(|vol, ledger| {
                // The slot may have been recovered or reused since it was listed.
                if self.deleted.head(slot) != Some(seen) {
                    return Ok(PruneStats::default());
                }
                let head = seen;
                let keep = keep_for(vol, Some(head))?;
                let (new_head, stats) = version::prune_chain(vol, ledger, Some(head), keep)?;
                if new_head != Some(head) {
                    self.deleted.set_head(vol, slot, new_head)?;
                }
                Ok(stats)
            })?;
            total.absorb(stats);
        }
        Ok(total)
    }

    /// Trim every chain, live and deleted, to its newest `keep` versions.
    pub fn gc_prune_by_count(&self, keep: usize) -> Result<PruneStats> {
        let stats = self.prune_all(|_, _| Ok(keep))?;
        if stats.versions_pruned > 0 {
            info!("pruned {} versions beyond {} per file", stats.versions_pruned, keep);
        }
        Ok(stats)
    }

    /// Drop versions older than `max_age` seconds, keeping each chain's
    /// newest version.
    pub fn gc_prune_old_versions(&self, max_age: u64) -> Result<PruneStats> {
        let at = now();
        let stats = self.prune_all(|vol, head| version::keep_for_age(vol, head, max_age, at))?;
        if stats.versions_pruned > 0 {
            info!("pruned {} versions older than {}s", stats.versions_pruned, max_age);
        }
        Ok(stats)
    }

    /// Free allocated blocks that no file or version references.
    pub fn gc_collect_blocks(&self) -> Result<u64> {
        self.mutate(|vol, ledger| {
            let census = Census::take(vol, &self.deleted_heads())?;
            gc::collect_blocks(vol, ledger, &census)
        })
    }

    /// Full collection: prune by count (default: the configured per-file
    /// limit), optionally by age, then sweep.
    pub fn gc_run(&self, keep: Option<usize>, max_age: Option<u64>) -> Result<GcStats> {
        let keep = keep.unwrap_or(self.config.max_versions_per_file);
        let mut pruned = self.gc_prune_by_count(keep)?;
        if let Some(age) = max_age {
            pruned.absorb(self.gc_prune_old_versions(age)?);
        }
        let swept = self.gc_collect_blocks()?;
        let mut stats = self.gc_stats.lock();
        stats.record(pruned, swept, now());
        info!(
            "gc run {}: {} versions pruned, {} blocks freed",
            stats.total_runs,
            pruned.versions_pruned,
            pruned.blocks_freed + swept
        );
        Ok(*stats)
    }

    pub fn gc_stats(&self) -> GcStats {
        *self.gc_stats.lock()
    }
}
