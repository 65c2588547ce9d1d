#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use o2::{
    DirAction, FeatureDiagnostics, FileType, Filesystem, IterFlags, OpenOptions, ScanEvent,
    ScanSummary, SystemInodes,
};
use serde::Serialize;
use std::env::VarError;
use std::io::Write;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info, info_span};
use tracing_subscriber::EnvFilter;

// ── Logging ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Human,
    Json,
}

impl LogFormat {
    const ENV_KEY: &'static str = "O2_LOG_FORMAT";

    fn parse(raw: &str) -> Result<Self> {
        <Self as ValueEnum>::from_str(raw.trim(), true).map_err(|_| {
            anyhow::anyhow!(
                "invalid {key}={raw:?}; expected one of: human, json",
                key = Self::ENV_KEY
            )
        })
    }

    fn from_env() -> Result<Option<Self>> {
        match std::env::var(Self::ENV_KEY) {
            Ok(value) => Ok(Some(Self::parse(&value)?)),
            Err(VarError::NotPresent) => Ok(None),
            Err(VarError::NotUnicode(_)) => {
                bail!("{key} contains non-UTF-8 bytes", key = Self::ENV_KEY)
            }
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Json => "json",
        }
    }
}

fn default_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
}

/// Install the global subscriber. Logs go to stderr so `cat` output stays
/// clean.
fn init_logging(log_format_override: Option<LogFormat>) -> Result<LogFormat> {
    let format = log_format_override
        .or(LogFormat::from_env()?)
        .unwrap_or(LogFormat::Human);

    match format {
        LogFormat::Human => tracing_subscriber::fmt()
            .with_env_filter(default_env_filter())
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_level(true)
            .compact()
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to initialize human logger: {err}"))?,
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_env_filter(default_env_filter())
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_level(true)
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to initialize JSON logger: {err}"))?,
    }

    Ok(format)
}

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "o2", about = "Inspect and maintain o2 clustered filesystem volumes")]
struct Cli {
    /// Log output format (`human` or `json`).
    ///
    /// Precedence: `--log-format` > `O2_LOG_FORMAT` > `human`.
    #[arg(long, value_enum, global = true)]
    log_format: Option<LogFormat>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show superblock fields, feature words, and system inodes.
    Inspect {
        image: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// List a directory, resolving the path from the volume root.
    Ls {
        image: PathBuf,
        #[arg(default_value = "/")]
        path: String,
        #[arg(long)]
        json: bool,
    },
    /// Write a file's contents to stdout.
    Cat { image: PathBuf, path: String },
    /// Classify every block of a slot's journal.
    Journal {
        image: PathBuf,
        #[arg(long, default_value_t = 0)]
        slot: u16,
        #[arg(long)]
        json: bool,
    },
    /// Flag a slot's journal for recovery on the next mount.
    MarkDirty {
        image: PathBuf,
        #[arg(long)]
        slot: u16,
    },
}

impl Command {
    const fn name(&self) -> &'static str {
        match self {
            Self::Inspect { .. } => "inspect",
            Self::Ls { .. } => "ls",
            Self::Cat { .. } => "cat",
            Self::Journal { .. } => "journal",
            Self::MarkDirty { .. } => "mark-dirty",
        }
    }
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let log_format = init_logging(cli.log_format)?;
    let command_name = cli.command.name();
    let run_span = info_span!(
        target: "o2::cli",
        "command",
        command = command_name,
        log_format = log_format.as_str()
    );
    let _run_guard = run_span.enter();
    let started = Instant::now();
    info!(target: "o2::cli", command = command_name, "command_start");

    let result = match cli.command {
        Command::Inspect { image, json } => inspect(&image, json),
        Command::Ls { image, path, json } => ls(&image, &path, json),
        Command::Cat { image, path } => cat(&image, &path),
        Command::Journal { image, slot, json } => journal(&image, slot, json),
        Command::MarkDirty { image, slot } => mark_dirty(&image, slot),
    };

    let duration_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
    if let Err(err) = &result {
        error!(
            target: "o2::cli",
            command = command_name,
            duration_us,
            error = %err,
            "command_failed"
        );
    } else {
        info!(target: "o2::cli", command = command_name, duration_us, "command_succeeded");
    }
    result
}

fn open(image: &Path, writable: bool) -> Result<Filesystem> {
    Filesystem::open(image, &OpenOptions::new().writable(writable))
        .with_context(|| format!("failed to open volume {}", image.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serialize output")?
    );
    Ok(())
}

// ── inspect ─────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct InspectOutput {
    label: String,
    uuid: String,
    revision: String,
    block_size: u32,
    cluster_size: u32,
    blocks: u64,
    clusters: u64,
    max_slots: u16,
    mount_count: u16,
    max_mount_count: u16,
    root_blkno: u64,
    system_dir_blkno: u64,
    first_cluster_group: u64,
    local_mount: bool,
    features: FeatureDiagnostics,
    backup_superblocks: Vec<u64>,
    system_inodes: SystemInodes,
}

fn inspect(image: &Path, json: bool) -> Result<()> {
    let fs = open(image, false)?;
    let sb = fs.superblock();
    let geom = fs.geometry();
    let output = InspectOutput {
        label: sb.label_str(),
        uuid: sb.uuid_hex(),
        revision: format!("{}.{}", sb.major_rev_level, sb.minor_rev_level),
        block_size: geom.block_size(),
        cluster_size: geom.cluster_size(),
        blocks: geom.block_count(),
        clusters: geom.cluster_count(),
        max_slots: sb.max_slots,
        mount_count: sb.mnt_count,
        max_mount_count: sb.max_mnt_count,
        root_blkno: sb.root_blkno,
        system_dir_blkno: sb.system_dir_blkno,
        first_cluster_group: sb.first_cluster_group,
        local_mount: fs.is_local_mount(),
        features: fs.feature_diagnostics(),
        backup_superblocks: fs.backup_super_blocks(),
        system_inodes: fs.system_inodes().clone(),
    };
    fs.close().context("close volume")?;

    if json {
        return print_json(&output);
    }
    println!("o2 volume inspector");
    println!("label: {}", output.label);
    println!("uuid: {}", output.uuid);
    println!("revision: {}", output.revision);
    println!("block_size: {}", output.block_size);
    println!("cluster_size: {}", output.cluster_size);
    println!("blocks: {}", output.blocks);
    println!("clusters: {}", output.clusters);
    println!("max_slots: {}", output.max_slots);
    println!("mount_count: {}/{}", output.mount_count, output.max_mount_count);
    println!("root: {}", output.root_blkno);
    println!("system_dir: {}", output.system_dir_blkno);
    println!("features: {}", output.features);
    if !output.backup_superblocks.is_empty() {
        println!("backup_superblocks: {:?}", output.backup_superblocks);
    }
    println!("system inodes:");
    for entry in output.system_inodes.iter() {
        let name = entry
            .file
            .file_name(entry.slot)
            .unwrap_or_else(|| entry.file.to_string());
        println!("  {name:<20} {}", entry.blkno);
    }
    Ok(())
}

// ── ls / cat ────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ListEntry {
    inode: u64,
    file_type: FileType,
    name: String,
}

fn type_tag(file_type: FileType) -> &'static str {
    match file_type {
        FileType::Regular => "file",
        FileType::Directory => "dir",
        FileType::Symlink => "symlink",
        FileType::CharDevice => "chr",
        FileType::BlockDevice => "blk",
        FileType::Fifo => "fifo",
        FileType::Socket => "sock",
        FileType::Unknown => "?",
    }
}

fn ls(image: &Path, path: &str, json: bool) -> Result<()> {
    let fs = open(image, false)?;
    let inode = fs
        .resolve_path(path)
        .with_context(|| format!("resolve {path}"))?;
    let dinode = fs.read_inode(inode).with_context(|| format!("read inode {inode}"))?;
    let mut entries = Vec::new();
    if dinode.is_dir() {
        fs.dir_iterate(inode, IterFlags::default(), |entry, _| {
            entries.push(ListEntry {
                inode: entry.inode,
                file_type: entry.file_type,
                name: String::from_utf8_lossy(&entry.name).into_owned(),
            });
            Ok(DirAction::Continue)
        })
        .with_context(|| format!("list {path}"))?;
    } else {
        entries.push(ListEntry {
            inode,
            file_type: if dinode.is_symlink() {
                FileType::Symlink
            } else {
                FileType::Regular
            },
            name: path.to_owned(),
        });
    }
    fs.close().context("close volume")?;

    if json {
        return print_json(&entries);
    }
    for entry in &entries {
        println!("{:>12} {:<8} {}", entry.inode, type_tag(entry.file_type), entry.name);
    }
    Ok(())
}

fn cat(image: &Path, path: &str) -> Result<()> {
    let fs = open(image, false)?;
    let inode = fs
        .resolve_path(path)
        .with_context(|| format!("resolve {path}"))?;
    let bytes = fs.read_file(inode).with_context(|| format!("read {path}"))?;
    fs.close().context("close volume")?;
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&bytes).context("write stdout")?;
    stdout.flush().context("flush stdout")?;
    Ok(())
}

// ── journal ─────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct JournalOutput {
    slot: u16,
    inode: u64,
    dirty: bool,
    summary: ScanSummary,
    events: Vec<ScanEvent>,
}

fn describe_event(event: &ScanEvent) -> String {
    match event {
        ScanEvent::Superblock { block, superblock } => format!(
            "{block:>8}  superblock {} maxlen={} first={} sequence={} start={}",
            superblock.header.blocktype,
            superblock.maxlen,
            superblock.first,
            superblock.sequence,
            superblock.start
        ),
        ScanEvent::Journal {
            block,
            header,
            tags,
            revoked,
        } => {
            let mut line = format!("{block:>8}  {} seq={}", header.blocktype, header.sequence);
            if !tags.is_empty() {
                line.push_str(&format!(" tags={}", tags.len()));
            }
            if !revoked.is_empty() {
                line.push_str(&format!(" revoked={}", revoked.len()));
            }
            line
        }
        ScanEvent::Metadata { block, block_type } => format!("{block:>8}  {block_type}"),
        ScanEvent::Unknown { first, last } => format!("{first:>8}..={last}  unknown"),
    }
}

fn journal(image: &Path, slot: u16, json: bool) -> Result<()> {
    let fs = open(image, false)?;
    let inode = fs
        .journal_inode(slot)
        .with_context(|| format!("journal slot {slot}"))?;
    let dirty = fs.journal_is_dirty(slot)?;
    let mut events = Vec::new();
    let summary = fs
        .scan_journal(slot, |event| {
            events.push(event);
            Ok(ControlFlow::Continue(()))
        })
        .with_context(|| format!("scan journal slot {slot}"))?;
    fs.close().context("close volume")?;

    let output = JournalOutput {
        slot,
        inode,
        dirty,
        summary,
        events,
    };
    if json {
        return print_json(&output);
    }
    println!(
        "journal slot {} (inode {}){}",
        output.slot,
        output.inode,
        if output.dirty { " [dirty]" } else { "" }
    );
    for event in &output.events {
        println!("{}", describe_event(event));
    }
    println!(
        "blocks={} journal={} metadata={} unknown={}",
        output.summary.blocks,
        output.summary.journal_blocks,
        output.summary.metadata_blocks,
        output.summary.unknown_blocks
    );
    Ok(())
}

fn mark_dirty(image: &Path, slot: u16) -> Result<()> {
    let fs = open(image, true)?;
    fs.mark_journal_dirty(slot)
        .with_context(|| format!("mark journal slot {slot} dirty"))?;
    fs.close().context("close volume")?;
    println!("journal slot {slot} marked dirty");
    Ok(())
}
