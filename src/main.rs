use std::io::Write;
use std::path::Path;
use std::process::ExitCode;

use chrono::{DateTime, Utc};
use clap::Parser;
use serde::Serialize;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use chronofs::config::{ChronoConfig, Cli, Command, FormatOptions};
use chronofs::fs::layout::MAXFILE_BYTES;
use chronofs::{ChronoError, Result, StorageEngine};

/// Install the stderr logger, plus a file logger when asked. The returned
/// guard must live until exit so buffered file output is flushed.
fn init_logging(log_file: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("chronofs.log"));
            let appender = tracing_appender::rolling::never(dir, name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        );
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("chronofs: logging unavailable: {}", e);
    }
    guard
}

fn timestamp(secs: u64) -> String {
    DateTime::<Utc>::from_timestamp(secs as i64, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| secs.to_string())
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{}", s),
        Err(e) => eprintln!("chronofs: cannot encode output: {}", e),
    }
}

/// Command name and the object it acts on, for diagnostics.
fn describe(cli: &Cli) -> (&'static str, String) {
    let image = cli.image.display().to_string();
    match &cli.command {
        Command::Mkfs { .. } => ("mkfs", image),
        Command::Write { file, .. } => ("write", file.clone()),
        Command::Cat { file } => ("cat", file.clone()),
        Command::Ls => ("ls", image),
        Command::Rm { file } => ("rm", file.clone()),
        Command::Mkver { file, .. } => ("mkver", file.clone()),
        Command::Lsver { file } => ("lsver", file.clone()),
        Command::Catver { file, version } => ("catver", format!("{}@{}", file, version)),
        Command::Restorever { file, version } => ("restorever", format!("{}@{}", file, version)),
        Command::Diff { file, from, to } => ("diff", format!("{} {}..{}", file, from, to)),
        Command::Mksnap { name, .. } => ("mksnap", name.clone()),
        Command::Lssnap => ("lssnap", image),
        Command::Restoresnap { name, .. } => ("restoresnap", name.clone()),
        Command::Rmsnap { name } => ("rmsnap", name.clone()),
        Command::Recover { file } => ("recover", file.clone()),
        Command::Lsdel => ("lsdel", image),
        Command::Gc { .. } => ("gc", image),
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = ChronoConfig::from(cli);

    if let Command::Mkfs {
        blocks,
        inodes,
        force,
    } = &cli.command
    {
        if cli.image.exists() && !force {
            return Err(ChronoError::InvalidArgument(
                "image exists, pass --force to overwrite".to_string(),
            ));
        }
        let opts = FormatOptions {
            total_blocks: *blocks,
            ninodes: *inodes,
            ..FormatOptions::default()
        };
        let engine = StorageEngine::create_image(&cli.image, &opts, config)?;
        let sb = engine.volume().superblock();
        println!(
            "formatted {}: {} blocks, {} inodes, {} data blocks",
            cli.image.display(),
            sb.size,
            sb.ninodes,
            sb.nblocks
        );
        return Ok(());
    }

    let engine = StorageEngine::open_image(&cli.image, config)?;
    info!("opened {}", cli.image.display());

    match &cli.command {
        Command::Mkfs { .. } => {}
        Command::Write { file, text, from } => {
            let content = match (text, from) {
                (Some(t), None) => t.as_bytes().to_vec(),
                (None, Some(path)) => std::fs::read(path)?,
                _ => {
                    return Err(ChronoError::InvalidArgument(
                        "give either literal text or --from".to_string(),
                    ))
                }
            };
            engine.write_file(file, &content)?;
            println!("wrote {} bytes to {}", content.len(), file);
        }
        Command::Cat { file } => {
            let data = engine.read_file(file)?;
            std::io::stdout().write_all(&data)?;
        }
        Command::Ls => {
            let files = engine.list_files()?;
            if cli.json {
                print_json(&files);
            } else {
                for f in &files {
                    println!(
                        "{:<14} {:>5} bytes  {} versions{}",
                        f.name,
                        f.size,
                        f.versions,
                        if f.immutable { "  immutable" } else { "" }
                    );
                }
            }
        }
        Command::Rm { file } => {
            engine.unlink(file)?;
            println!("removed {}", file);
        }
        Command::Mkver { file, description } => {
            engine.version_create(file, description)?;
            let n = engine.version_count(file)?;
            println!("created version {} of {}", n.saturating_sub(1), file);
        }
        Command::Lsver { file } => {
            let versions = engine.version_list(file, usize::MAX)?;
            if cli.json {
                print_json(&versions);
            } else if versions.is_empty() {
                println!("{} has no versions", file);
            } else {
                for v in &versions {
                    println!(
                        "{:>3}  {}  {:>5} bytes  {:>2} blocks  {}",
                        v.version_num,
                        timestamp(v.timestamp),
                        v.file_size,
                        v.block_count,
                        v.description
                    );
                }
            }
        }
        Command::Catver { file, version } => {
            let data = engine.version_get_content(file, *version, MAXFILE_BYTES)?;
            std::io::stdout().write_all(&data)?;
        }
        Command::Restorever { file, version } => {
            engine.version_restore(file, *version)?;
            println!("restored {} to version {}", file, version);
        }
        Command::Diff { file, from, to } => {
            let report = engine.version_diff(file, *from, *to)?;
            if cli.json {
                print_json(&report);
            } else {
                println!("comparing {}: version {} -> version {}", file, from, to);
                if report.identical {
                    println!("versions are identical");
                } else {
                    for line in report.render() {
                        println!("{}", line);
                    }
                    println!(
                        "{} line(s) added, {} line(s) removed",
                        report.added.len(),
                        report.removed.len()
                    );
                }
            }
        }
        Command::Mksnap { name, files } => {
            let meta = engine.snapshot_capture(name, files)?;
            println!(
                "snapshot {} (id {}): {} files, {} blocks",
                meta.name, meta.id, meta.file_count, meta.total_blocks
            );
        }
        Command::Lssnap => {
            let snaps = engine.snapshot_list(usize::MAX);
            if cli.json {
                print_json(&snaps);
            } else {
                for s in &snaps {
                    println!(
                        "{:>4}  {:<31}  {}  {} files  {} blocks",
                        s.id,
                        s.name,
                        timestamp(s.timestamp),
                        s.file_count,
                        s.total_blocks
                    );
                }
            }
        }
        Command::Restoresnap { name, files } => {
            let outcomes = engine.snapshot_restore_files(name, files)?;
            if cli.json {
                print_json(&outcomes);
            } else {
                for o in &outcomes {
                    match (&o.version, &o.error) {
                        (Some(v), _) => println!("restored {} to version {}", o.file, v),
                        (None, Some(e)) => eprintln!("restoresnap: {} ({})", e, o.file),
                        (None, None) => {}
                    }
                }
            }
        }
        Command::Rmsnap { name } => {
            let meta = engine.snapshot_delete(name)?;
            println!("deleted snapshot {} (id {})", meta.name, meta.id);
        }
        Command::Recover { file } => {
            let inum = engine.recover_file(file)?;
            println!("recovered {} as inode {}", file, inum);
        }
        Command::Lsdel => {
            let deleted = engine.list_deleted(usize::MAX);
            if cli.json {
                print_json(&deleted);
            } else {
                for d in &deleted {
                    println!(
                        "{:<14}  deleted {}  (was inode {})",
                        d.name,
                        timestamp(d.delete_time),
                        d.inum
                    );
                }
            }
        }
        Command::Gc { keep, max_age } => {
            let stats = engine.gc_run(*keep, *max_age)?;
            if cli.json {
                print_json(&stats);
            } else {
                println!(
                    "gc: {} versions pruned, {} blocks freed",
                    stats.versions_pruned, stats.blocks_freed
                );
            }
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _guard = init_logging(cli.log_file.as_deref());

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let (cmd, target) = describe(&cli);
            eprintln!("{}: {} ({})", cmd, e, target);
            if e.is_fatal() {
                error!("{} aborted on a broken invariant", cmd);
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}
