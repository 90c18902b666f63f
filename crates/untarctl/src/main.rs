//! Command-line frontend for the `untar` extraction engine.
//!
//! Reads a tar archive (optionally gzip- or zstd-compressed, selected by
//! file extension) from a file or standard input and extracts it, or
//! lists its members with `--list`.  Extraction runs on the parallel
//! engine by default; `--sync` selects the sequential one.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_compression::tokio::bufread::{GzipDecoder, ZstdDecoder};
use clap::Parser;
use tokio::io::{AsyncBufRead, AsyncRead, BufReader};
use untar::{UnpackOptions, UnpackSummary, WarnCode};

/// untarctl
#[derive(Debug, Parser)]
#[clap(name = "untarctl", version)]
struct App {
    /// Archive to read, or '-' for standard input
    archive: PathBuf,

    /// Extract into DIR instead of the current directory
    #[clap(short = 'C', long = "directory", value_name = "DIR")]
    directory: Option<PathBuf>,

    /// List member names instead of extracting
    #[clap(short = 't', long)]
    list: bool,

    /// Drop the first N path segments of each member name
    #[clap(long, value_name = "N", default_value_t = 0)]
    strip_components: usize,

    /// Never replace existing filesystem objects
    #[clap(short = 'k', long)]
    keep_existing: bool,

    /// Skip members that are older than what is already on disk
    #[clap(long)]
    keep_newer: bool,

    /// Do not restore modification times
    #[clap(long)]
    no_mtime: bool,

    /// Do not restore permission bits
    #[clap(long)]
    no_chmod: bool,

    /// Apply archive uid/gid even when not running as root
    #[clap(long)]
    preserve_owner: bool,

    /// Allow '..' segments and absolute member names
    #[clap(short = 'P', long)]
    preserve_paths: bool,

    /// Unlink targets before creating them (disables in-place reuse)
    #[clap(long)]
    unlink: bool,

    /// Treat warnings as fatal
    #[clap(long)]
    strict: bool,

    /// Use the sequential single-threaded engine
    #[clap(long)]
    sync: bool,

    /// Concurrent filesystem operations in the parallel engine
    #[clap(short, long, value_name = "N")]
    jobs: Option<usize>,

    /// Maximum member name depth
    #[clap(long, value_name = "N")]
    max_depth: Option<usize>,

    /// Log engine detail to stderr
    #[clap(short, long)]
    verbose: bool,
}

enum Compression {
    Plain,
    Gzip,
    Zstd,
}

fn compression_for(path: &Path) -> Compression {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("gz") | Some("tgz") => Compression::Gzip,
        Some("zst") | Some("tzst") => Compression::Zstd,
        _ => Compression::Plain,
    }
}

fn unpack_options(app: &App) -> UnpackOptions {
    let cwd = app
        .directory
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));
    let mut opts = UnpackOptions::new(cwd);
    opts.strip = app.strip_components;
    if let Some(depth) = app.max_depth {
        opts.max_depth = Some(depth);
    }
    opts.keep = app.keep_existing;
    opts.newer = app.keep_newer;
    opts.no_mtime = app.no_mtime;
    opts.no_chmod = app.no_chmod;
    if app.preserve_owner {
        opts.preserve_owner = true;
    }
    opts.preserve_paths = app.preserve_paths;
    opts.unlink = app.unlink;
    opts.strict = app.strict;
    opts.jobs = app.jobs;
    opts
}

fn report(summary: UnpackSummary) -> Result<()> {
    for warning in &summary.warnings {
        eprintln!("untarctl: {warning}");
    }
    let failed = summary
        .warnings
        .iter()
        .filter(|w| w.code == WarnCode::EntryError)
        .count();
    if failed > 0 {
        bail!("{failed} members could not be extracted");
    }
    Ok(())
}

fn run_sync(app: &App) -> Result<()> {
    let raw: Box<dyn Read> = if app.archive == Path::new("-") {
        Box::new(std::io::stdin().lock())
    } else {
        Box::new(
            File::open(&app.archive)
                .with_context(|| format!("cannot open {}", app.archive.display()))?,
        )
    };
    let reader: Box<dyn Read> = match compression_for(&app.archive) {
        Compression::Plain => raw,
        Compression::Gzip => Box::new(flate2::read::GzDecoder::new(raw)),
        Compression::Zstd => Box::new(zstd::stream::read::Decoder::new(raw)?),
    };
    let summary = untar::unpack(reader, unpack_options(app))?;
    report(summary)
}

async fn open_async(app: &App) -> Result<Box<dyn AsyncBufRead + Unpin>> {
    let raw: Box<dyn AsyncRead + Unpin> = if app.archive == Path::new("-") {
        Box::new(tokio::io::stdin())
    } else {
        Box::new(
            tokio::fs::File::open(&app.archive)
                .await
                .with_context(|| format!("cannot open {}", app.archive.display()))?,
        )
    };
    let buffered = BufReader::new(raw);
    Ok(match compression_for(&app.archive) {
        Compression::Plain => Box::new(buffered),
        Compression::Gzip => Box::new(BufReader::new(GzipDecoder::new(buffered))),
        Compression::Zstd => Box::new(BufReader::new(ZstdDecoder::new(buffered))),
    })
}

async fn run_async(app: &App) -> Result<()> {
    let reader = open_async(app).await?;
    if app.list {
        for entry in untar::list(reader).await? {
            println!("{}", entry.path);
        }
        return Ok(());
    }
    let summary = untar::unpack_async(reader, unpack_options(app)).await?;
    report(summary)
}

fn main() -> Result<()> {
    let app = App::parse();

    let level = if app.verbose {
        tracing_subscriber::filter::LevelFilter::DEBUG
    } else {
        tracing_subscriber::filter::LevelFilter::ERROR
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .init();

    if app.sync && !app.list {
        run_sync(&app)
    } else {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("cannot build runtime")?
            .block_on(run_async(&app))
    }
}
