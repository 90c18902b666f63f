//! The extraction engine.
//!
//! One blocking state machine (sanitize, reserve, reconcile, materialize,
//! release) serves two execution profiles:
//!
//! - [`unpack`] is sequential and synchronous: entries come from the `tar`
//!   crate's iterator and are processed one at a time, so the reservation
//!   scheduler is never needed.
//! - [`unpack_async`] parses headers from an async stream and fans entries
//!   out to blocking workers.  Payloads flow through bounded [`Bytes`]
//!   channels (small ones are buffered whole); the reservation scheduler
//!   keeps concurrent workers off each other's paths and a semaphore caps
//!   how many are in flight.
//!
//! Both return an [`UnpackSummary`] once the archive is done and every
//! in-flight operation has completed.

use std::io::{self, Read};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use bytes::Bytes;
use tar::Header;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tokio::sync::{mpsc, Notify, Semaphore};
use tracing::trace;

use crate::dircache::{ensure_cwd, DirCache};
use crate::entry::UnpackEntry;
use crate::error::{Result, UnpackError, WarnCode, Warning};
use crate::materialize::make_fs;
use crate::options::UnpackOptions;
use crate::platform;
use crate::reconcile::{check_fs, invalidate_cache, Action};
use crate::reservations::{PathReservations, PendingReservation};
use crate::sanitize::{sanitize, Outcome};
use crate::util::{lock, read_exactish_async, ChannelReader, PayloadReader};

/// File payloads up to this size are buffered in memory instead of being
/// streamed chunk-by-chunk to the worker.
const INLINE_PAYLOAD_MAX: u64 = 128 * 1024;

/// Upper bound on GNU long name / PAX extension payloads; anything bigger
/// is a malformed or hostile archive.
const METADATA_MAX: u64 = 1024 * 1024;

/// Chunks buffered per large-file payload channel.
const PAYLOAD_CHANNEL_DEPTH: usize = 4;

/// What an extraction did.
#[derive(Debug, Default)]
pub struct UnpackSummary {
    /// Entries materialized on disk.
    pub written: u64,
    /// Entries skipped (sanitizer rejections, `keep`/`newer`, unsupported
    /// kinds, per-entry errors).
    pub skipped: u64,
    /// Everything that went wrong without stopping the extraction.
    pub warnings: Vec<Warning>,
}

struct Engine {
    opts: UnpackOptions,
    cache: Arc<DirCache>,
    cwd_checked: OnceLock<bool>,
    warnings: Mutex<Vec<Warning>>,
    fatal: Mutex<Option<UnpackError>>,
    written: AtomicU64,
    skipped: AtomicU64,
}

impl Engine {
    fn new(opts: UnpackOptions) -> Self {
        let cache = opts
            .dir_cache
            .clone()
            .unwrap_or_else(|| Arc::new(DirCache::new()));
        Self {
            opts,
            cache,
            cwd_checked: OnceLock::new(),
            warnings: Mutex::new(Vec::new()),
            fatal: Mutex::new(None),
            written: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        }
    }

    fn warn(&self, warning: Warning) {
        tracing::warn!(
            code = warning.code.as_str(),
            path = ?warning.path,
            "{}",
            warning.message
        );
        if self.opts.strict || !warning.recoverable() {
            self.set_fatal(UnpackError::Strict(warning.clone()));
        }
        lock(&self.warnings).push(warning);
    }

    fn set_fatal(&self, error: UnpackError) {
        let mut fatal = lock(&self.fatal);
        if fatal.is_none() {
            *fatal = Some(error);
        }
    }

    fn is_fatal(&self) -> bool {
        lock(&self.fatal).is_some()
    }

    fn skipped_one(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Validate the extraction root exactly once per extraction.
    fn cwd_ok(&self) -> bool {
        *self
            .cwd_checked
            .get_or_init(|| match ensure_cwd(&self.opts, &self.cache) {
                Ok(()) => true,
                Err(error) => {
                    self.set_fatal(error);
                    false
                }
            })
    }

    /// The per-entry state machine.  Runs with the entry's reservation
    /// held (parallel profile) or as the only operation (sequential).
    fn process<R: Read>(&self, entry: &UnpackEntry, payload: &mut R) {
        let Some(absolute) = entry.absolute() else {
            return;
        };

        invalidate_cache(entry, &self.opts, &self.cache);

        if !self.cwd_ok() {
            drain(payload);
            return;
        }

        let action = match check_fs(entry, absolute, &self.opts, &self.cache) {
            Ok(action) => action,
            Err(error) => {
                self.entry_failed(error);
                drain(payload);
                return;
            }
        };

        match action {
            Action::Skip => {
                self.skipped_one();
                drain(payload);
            }
            Action::Write => {
                match make_fs(entry, absolute, payload, &self.opts, &self.cache) {
                    Ok(()) => {
                        self.written.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(error) => self.entry_failed(error),
                }
                invalidate_cache(entry, &self.opts, &self.cache);
                drain(payload);
            }
        }
    }

    /// Route a failure from reconcile/materialize: entry-scoped problems
    /// become warnings, anything else stops the extraction.
    fn entry_failed(&self, error: UnpackError) {
        match error {
            UnpackError::Entry { path, source } => {
                self.skipped_one();
                self.warn(Warning::new(
                    WarnCode::EntryError,
                    source.to_string(),
                    Some(path),
                ));
            }
            UnpackError::Symlink { path } => {
                self.skipped_one();
                self.warn(Warning::new(
                    WarnCode::EntryError,
                    "symbolic link in directory chain",
                    Some(path),
                ));
            }
            other => self.set_fatal(other),
        }
    }

    fn finish(&self) -> Result<UnpackSummary> {
        if let Some(error) = lock(&self.fatal).take() {
            return Err(error);
        }
        trace!("pre-finish");
        trace!("finish");
        trace!("end");
        Ok(UnpackSummary {
            written: self.written.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            warnings: std::mem::take(&mut lock(&self.warnings)),
        })
    }

    /// Sanitizer + unsupported-kind gate shared by both drivers.  Returns
    /// false if the entry is not to be materialized.
    fn admit(&self, entry: &mut UnpackEntry) -> bool {
        if entry.kind.is_unsupported() {
            self.skipped_one();
            self.warn(Warning::new(
                WarnCode::EntryUnsupported,
                format!("unsupported entry type: {:?}", entry.kind),
                Some(entry.path.clone().into()),
            ));
            return false;
        }
        match sanitize(entry, &self.opts) {
            Outcome::Accept(warning) => {
                if let Some(warning) = warning {
                    self.warn(warning);
                }
                !self.is_fatal()
            }
            Outcome::Skip(warning) => {
                self.skipped_one();
                if let Some(warning) = warning {
                    self.warn(warning);
                }
                false
            }
        }
    }
}

fn drain(payload: &mut impl Read) {
    let _ = io::copy(payload, &mut io::sink());
}

/// Extract an archive sequentially, blocking on each entry in turn.
pub fn unpack<R: Read>(reader: R, opts: UnpackOptions) -> Result<UnpackSummary> {
    opts.validate()?;
    let engine = Engine::new(opts);

    let mut archive = tar::Archive::new(reader);
    for next in archive.entries().map_err(UnpackError::BadArchive)? {
        if engine.is_fatal() {
            break;
        }
        let mut tar_entry = next.map_err(UnpackError::BadArchive)?;
        let header_type = tar_entry.header().entry_type();
        if header_type.is_pax_global_extensions()
            || header_type.is_pax_local_extensions()
            || header_type.is_gnu_longname()
            || header_type.is_gnu_longlink()
        {
            continue;
        }

        let path = String::from_utf8_lossy(&tar_entry.path_bytes()).into_owned();
        let linkpath = tar_entry
            .link_name_bytes()
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());
        let mut entry = UnpackEntry::from_tar_header(tar_entry.header(), path, linkpath);
        entry.size = tar_entry.size();

        if !engine.admit(&mut entry) {
            continue;
        }
        engine.process(&entry, &mut tar_entry);
    }

    engine.finish()
}

/// The parser side of the parallel profile: reads raw 512-byte headers and
/// folds GNU long name/link and PAX records into the entry they describe.
struct AsyncEntryStream<R> {
    reader: R,
    gnu_longname: Vec<u8>,
    gnu_longlink: Vec<u8>,
    pax_path: Option<Vec<u8>>,
    pax_linkpath: Option<Vec<u8>>,
    pax_mtime: Option<i64>,
    pax_atime: Option<i64>,
}

impl<R: AsyncBufRead + Unpin> AsyncEntryStream<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            gnu_longname: Vec::new(),
            gnu_longlink: Vec::new(),
            pax_path: None,
            pax_linkpath: None,
            pax_mtime: None,
            pax_atime: None,
        }
    }

    /// The next actual entry, or `None` at end of archive.  The caller
    /// must consume `padded_size(entry)` payload bytes before the next
    /// call.
    async fn next(&mut self) -> Result<Option<UnpackEntry>> {
        loop {
            let mut header = Header::new_gnu();
            if !read_exactish_async(&mut self.reader, header.as_mut_bytes())
                .await
                .map_err(UnpackError::BadArchive)?
            {
                return Ok(None);
            }
            if header.as_bytes() == &[0u8; 512] {
                continue;
            }

            let size = header.entry_size().map_err(UnpackError::BadArchive)?;
            let type_byte = header.entry_type().as_byte();
            match type_byte {
                b'L' => {
                    self.gnu_longname = self.metadata_payload(size).await?;
                    continue;
                }
                b'K' => {
                    self.gnu_longlink = self.metadata_payload(size).await?;
                    continue;
                }
                b'x' => {
                    let content = self.metadata_payload(size).await?;
                    self.apply_pax(&content);
                    continue;
                }
                b'g' => {
                    // global defaults are not tracked
                    self.skip(padded(size)?).await?;
                    continue;
                }
                _ => {}
            }

            let path = self.take_path(&header);
            let linkpath = self.take_linkpath(&header);
            let mut entry = UnpackEntry::from_tar_header(&header, path, linkpath);
            entry.size = size;
            if let Some(mtime) = self.pax_mtime.take() {
                entry.mtime = Some(mtime);
            }
            if let Some(atime) = self.pax_atime.take() {
                entry.atime = Some(atime);
            }
            return Ok(Some(entry));
        }
    }

    fn take_path(&mut self, header: &Header) -> String {
        let bytes = if let Some(pax) = self.pax_path.take() {
            pax
        } else if !self.gnu_longname.is_empty() {
            std::mem::take(&mut self.gnu_longname)
        } else {
            header.path_bytes().into_owned()
        };
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn take_linkpath(&mut self, header: &Header) -> Option<String> {
        let bytes = if let Some(pax) = self.pax_linkpath.take() {
            Some(pax)
        } else if !self.gnu_longlink.is_empty() {
            Some(std::mem::take(&mut self.gnu_longlink))
        } else {
            header.link_name_bytes().map(|b| b.into_owned())
        };
        bytes
            .filter(|b| !b.is_empty())
            .map(|b| String::from_utf8_lossy(&b).into_owned())
    }

    fn apply_pax(&mut self, content: &[u8]) {
        for extension in tar::PaxExtensions::new(content) {
            let Ok(extension) = extension else { continue };
            let Ok(key) = extension.key() else { continue };
            match key {
                "path" => self.pax_path = Some(extension.value_bytes().to_vec()),
                "linkpath" => self.pax_linkpath = Some(extension.value_bytes().to_vec()),
                "mtime" => self.pax_mtime = parse_pax_time(extension.value_bytes()),
                "atime" => self.pax_atime = parse_pax_time(extension.value_bytes()),
                _ => {}
            }
        }
    }

    async fn metadata_payload(&mut self, size: u64) -> Result<Vec<u8>> {
        if size > METADATA_MAX {
            return Err(UnpackError::BadArchive(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("metadata entry of {size} bytes"),
            )));
        }
        let mut data = self.payload(size).await?;
        if data.last() == Some(&0) {
            data.pop();
        }
        Ok(data)
    }

    /// Read `size` payload bytes plus block padding.
    async fn payload(&mut self, size: u64) -> Result<Vec<u8>> {
        let mut data = vec![0u8; size as usize];
        self.reader
            .read_exact(&mut data)
            .await
            .map_err(UnpackError::BadArchive)?;
        self.skip(padded(size)? - size).await?;
        Ok(data)
    }

    async fn skip(&mut self, mut remaining: u64) -> Result<()> {
        while remaining > 0 {
            let chunk = self
                .reader
                .fill_buf()
                .await
                .map_err(UnpackError::BadArchive)?;
            if chunk.is_empty() {
                return Err(UnpackError::BadArchive(io::ErrorKind::UnexpectedEof.into()));
            }
            let n = remaining.min(chunk.len() as u64) as usize;
            self.reader.consume(n);
            remaining -= n as u64;
        }
        Ok(())
    }

    /// Stream `size` payload bytes into `tx` and consume the padding.  If
    /// the receiver has gone away the stream is still consumed, to keep
    /// the archive position valid.
    async fn stream(&mut self, size: u64, tx: mpsc::Sender<Bytes>) -> Result<()> {
        let mut remaining = size;
        let mut receiver_alive = true;
        while remaining > 0 {
            let chunk = self
                .reader
                .fill_buf()
                .await
                .map_err(UnpackError::BadArchive)?;
            if chunk.is_empty() {
                return Err(UnpackError::BadArchive(io::ErrorKind::UnexpectedEof.into()));
            }
            let n = remaining.min(chunk.len() as u64) as usize;
            if receiver_alive {
                receiver_alive = tx.send(Bytes::copy_from_slice(&chunk[..n])).await.is_ok();
            }
            self.reader.consume(n);
            remaining -= n as u64;
        }
        drop(tx);
        self.skip(padded(size)? - size).await
    }
}

fn padded(size: u64) -> Result<u64> {
    size.checked_next_multiple_of(512)
        .ok_or_else(|| UnpackError::BadArchive(io::ErrorKind::InvalidData.into()))
}

fn parse_pax_time(value: &[u8]) -> Option<i64> {
    let text = std::str::from_utf8(value).ok()?;
    text.split('.').next()?.parse().ok()
}

/// Balance of reservations taken versus released; drives the terminal
/// signal once the upstream is done and nothing is in flight.
struct Tracker {
    state: Mutex<(u64, bool)>,
    notify: Notify,
}

impl Tracker {
    fn new() -> Self {
        Self {
            state: Mutex::new((0, false)),
            notify: Notify::new(),
        }
    }

    fn add(&self) {
        lock(&self.state).0 += 1;
    }

    fn done(&self) {
        let mut state = lock(&self.state);
        state.0 -= 1;
        if state.0 == 0 {
            drop(state);
            self.notify.notify_waiters();
        }
    }

    fn ended(&self) {
        lock(&self.state).1 = true;
        self.notify.notify_waiters();
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.notify.notified();
            {
                let state = lock(&self.state);
                if state.0 == 0 && state.1 {
                    return;
                }
            }
            notified.await;
        }
    }
}

/// Extract an archive with concurrent filesystem operations.
///
/// Entries are parsed in archive order (which also fixes the reservation
/// order, so colliding paths are still processed first-to-last), then
/// materialized on the blocking pool as their path reservations allow.
pub async fn unpack_async<R: AsyncBufRead + Unpin>(
    reader: R,
    opts: UnpackOptions,
) -> Result<UnpackSummary> {
    opts.validate()?;
    let serial = opts.win32 || platform::parallel_unsafe();
    let win32 = opts.win32;
    let jobs = opts
        .jobs
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(4)
        })
        .max(1);

    let engine = Arc::new(Engine::new(opts));
    let reservations = Arc::new(PathReservations::new(serial, win32));
    let semaphore = Arc::new(Semaphore::new(jobs));
    let tracker = Arc::new(Tracker::new());

    let mut stream = AsyncEntryStream::new(reader);
    let driven = drive(&mut stream, &engine, &reservations, &semaphore, &tracker).await;

    // even a failed parse waits for in-flight entries before returning
    tracker.ended();
    tracker.wait_idle().await;
    driven?;
    engine.finish()
}

async fn drive<R: AsyncBufRead + Unpin>(
    stream: &mut AsyncEntryStream<R>,
    engine: &Arc<Engine>,
    reservations: &Arc<PathReservations>,
    semaphore: &Arc<Semaphore>,
    tracker: &Arc<Tracker>,
) -> Result<()> {
    loop {
        if engine.is_fatal() {
            return Ok(());
        }
        let Some(mut entry) = stream.next().await? else {
            return Ok(());
        };
        let size = entry.size;

        if !engine.admit(&mut entry) {
            stream.skip(padded(size)?).await?;
            continue;
        }

        let mut targets: Vec<&Path> = Vec::with_capacity(2);
        if let Some(absolute) = entry.absolute() {
            targets.push(absolute);
        }
        if let Some(link_target) = entry.link_absolute.as_deref() {
            targets.push(link_target);
        }
        let pending = reservations.reserve(&targets);
        tracker.add();

        if !entry.kind.is_file() {
            // non-file payloads (dump directory listings) are never
            // materialized; consume them here
            stream.skip(padded(size)?).await?;
            spawn_worker(
                engine,
                tracker,
                semaphore,
                pending,
                entry,
                PayloadReader::Inline(io::Cursor::new(Bytes::new())),
            );
        } else if size > INLINE_PAYLOAD_MAX {
            let (tx, rx) = mpsc::channel::<Bytes>(PAYLOAD_CHANNEL_DEPTH);
            spawn_worker(
                engine,
                tracker,
                semaphore,
                pending,
                entry,
                PayloadReader::Streamed(ChannelReader::new(rx)),
            );
            stream.stream(size, tx).await?;
        } else {
            let data = stream.payload(size).await?;
            spawn_worker(
                engine,
                tracker,
                semaphore,
                pending,
                entry,
                PayloadReader::Inline(io::Cursor::new(Bytes::from(data))),
            );
        }
    }
}

fn spawn_worker(
    engine: &Arc<Engine>,
    tracker: &Arc<Tracker>,
    semaphore: &Arc<Semaphore>,
    pending: PendingReservation,
    entry: UnpackEntry,
    payload: PayloadReader,
) {
    let engine = Arc::clone(engine);
    let tracker = Arc::clone(tracker);
    let semaphore = Arc::clone(semaphore);
    tokio::spawn(async move {
        let guard = pending.acquired().await;
        let permit = semaphore.acquire_owned().await.ok();

        let worker_engine = Arc::clone(&engine);
        let outcome = tokio::task::spawn_blocking(move || {
            let mut payload = payload;
            worker_engine.process(&entry, &mut payload);
        })
        .await;
        if let Err(join_error) = outcome {
            engine.set_fatal(UnpackError::Io(io::Error::other(join_error)));
        }

        drop(permit);
        guard.release();
        tracker.done();
    });
}

/// Walk an archive without touching the filesystem, returning its entries
/// in order.
pub async fn list<R: AsyncBufRead + Unpin>(reader: R) -> Result<Vec<UnpackEntry>> {
    let mut stream = AsyncEntryStream::new(reader);
    let mut entries = Vec::new();
    while let Some(entry) = stream.next().await? {
        let size = entry.size;
        entries.push(entry);
        stream.skip(padded(size)?).await?;
    }
    Ok(entries)
}
