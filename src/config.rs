use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::fs::layout::{
    DEDUP_TABLE_SIZE, DEFAULT_FS_BLOCKS, DEFAULT_NINODES, JOURNAL_BLOCKS, MAX_DELETED_FILES,
    MAX_REFCOUNT_ENTRIES, MAX_SNAPSHOTS, MAX_VERSIONS_PER_FILE,
};

#[derive(Parser, Debug)]
#[command(name = "chronofs", about = "Versioned block store with snapshots and crash-safe journaling")]
pub struct Cli {
    /// Path to the filesystem image
    #[arg(short, long, default_value = "chronofs.img")]
    pub image: PathBuf,

    /// Also write logs to this file
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Print listings as JSON
    #[arg(long)]
    pub json: bool,

    /// Capacity of the block reference table
    #[arg(long, default_value_t = MAX_REFCOUNT_ENTRIES)]
    pub refcount_capacity: usize,

    /// Capacity of the deduplication index
    #[arg(long, default_value_t = DEDUP_TABLE_SIZE)]
    pub dedup_capacity: usize,

    /// Versions kept per file by the garbage collector
    #[arg(long, default_value_t = MAX_VERSIONS_PER_FILE)]
    pub max_versions: usize,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a fresh filesystem image
    Mkfs {
        /// Total size in blocks
        #[arg(long, default_value_t = DEFAULT_FS_BLOCKS)]
        blocks: u32,

        /// Number of inodes
        #[arg(long, default_value_t = DEFAULT_NINODES)]
        inodes: u32,

        /// Overwrite an existing image
        #[arg(short, long)]
        force: bool,
    },
    /// Replace a file's content, creating the file if needed
    Write {
        file: String,
        /// Literal content
        text: Option<String>,
        /// Read content from a host file instead
        #[arg(long)]
        from: Option<PathBuf>,
    },
    /// Print a file's content
    Cat { file: String },
    /// List files
    Ls,
    /// Delete a file
    Rm { file: String },
    /// Record a version of a file
    Mkver { file: String, description: String },
    /// List a file's versions
    Lsver { file: String },
    /// Print the content of one version
    Catver { file: String, version: u32 },
    /// Restore a file to one of its versions
    Restorever { file: String, version: u32 },
    /// Line diff between two versions of a file
    Diff { file: String, from: u32, to: u32 },
    /// Create a named snapshot, versioning each listed file
    Mksnap { name: String, files: Vec<String> },
    /// List snapshots
    Lssnap,
    /// Restore files to the versions captured by a snapshot
    Restoresnap { name: String, files: Vec<String> },
    /// Delete a snapshot record
    Rmsnap { name: String },
    /// Bring back a deleted file from its newest version
    Recover { file: String },
    /// List deleted files that can be recovered
    Lsdel,
    /// Prune version chains and free unreachable blocks
    Gc {
        /// Versions to keep per file (defaults to --max-versions)
        #[arg(long)]
        keep: Option<usize>,
        /// Also drop versions older than this many seconds
        #[arg(long)]
        max_age: Option<u64>,
    },
}

/// Capacities of the in-memory tables. Geometry lives in the superblock.
#[derive(Debug, Clone)]
pub struct ChronoConfig {
    pub refcount_capacity: usize,
    pub dedup_capacity: usize,
    pub max_versions_per_file: usize,
}

impl Default for ChronoConfig {
    fn default() -> Self {
        Self {
            refcount_capacity: MAX_REFCOUNT_ENTRIES,
            dedup_capacity: DEDUP_TABLE_SIZE,
            max_versions_per_file: MAX_VERSIONS_PER_FILE,
        }
    }
}

impl From<&Cli> for ChronoConfig {
    fn from(cli: &Cli) -> Self {
        Self {
            refcount_capacity: cli.refcount_capacity,
            dedup_capacity: cli.dedup_capacity,
            max_versions_per_file: cli.max_versions,
        }
    }
}

/// mkfs geometry.
#[derive(Debug, Clone)]
pub struct FormatOptions {
    pub total_blocks: u32,
    pub ninodes: u32,
    pub journal_blocks: u32,
    pub snapshot_slots: u32,
    pub deleted_slots: u32,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            total_blocks: DEFAULT_FS_BLOCKS,
            ninodes: DEFAULT_NINODES,
            journal_blocks: JOURNAL_BLOCKS,
            snapshot_slots: MAX_SNAPSHOTS,
            deleted_slots: MAX_DELETED_FILES,
        }
    }
}
