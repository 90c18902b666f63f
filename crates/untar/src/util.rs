//! Small I/O helpers shared by both execution profiles.

use std::io::{ErrorKind, Read, Result};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::{Buf, Bytes};
use rustix::io::{Errno, Result as ErrnoResult};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Read exactly `buf.len()` bytes, treating an immediate EOF as a clean
/// end of stream (`Ok(false)`) rather than an error.  An EOF after a
/// partial read is still `ErrorKind::UnexpectedEof`.
pub(crate) async fn read_exactish_async(
    reader: &mut (impl AsyncRead + Unpin),
    buf: &mut [u8],
) -> Result<bool> {
    let buflen = buf.len();
    let mut todo: &mut [u8] = buf;

    while !todo.is_empty() {
        match reader.read(todo).await {
            Ok(0) => {
                return match todo.len() {
                    s if s == buflen => Ok(false),
                    _ => Err(ErrorKind::UnexpectedEof.into()),
                };
            }
            Ok(n) => todo = &mut todo[n..],
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(true)
}

pub(crate) trait ErrnoFilter<T> {
    fn filter_errno(self, ignored: Errno) -> ErrnoResult<Option<T>>;
}

impl<T> ErrnoFilter<T> for ErrnoResult<T> {
    fn filter_errno(self, ignored: Errno) -> ErrnoResult<Option<T>> {
        match self {
            Ok(result) => Ok(Some(result)),
            Err(err) if err == ignored => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Name a doomed file for two-step removal on filesystems where unlink is
/// not atomic with respect to a subsequent create.  128 random bits keep
/// concurrent extractions from colliding.
pub(crate) fn delete_name(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".DELETE.{}", hex::encode(rand::random::<[u8; 16]>())));
    PathBuf::from(name)
}

/// Blocking `Read` over the worker end of a payload channel.
pub(crate) struct ChannelReader {
    rx: mpsc::Receiver<Bytes>,
    current: Bytes,
}

impl ChannelReader {
    pub(crate) fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            rx,
            current: Bytes::new(),
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        while self.current.is_empty() {
            match self.rx.blocking_recv() {
                Some(chunk) => self.current = chunk,
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);
        Ok(n)
    }
}

/// Payload source handed to the blocking state machine: small payloads are
/// buffered whole, large ones stream through a channel.
pub(crate) enum PayloadReader {
    Inline(std::io::Cursor<Bytes>),
    Streamed(ChannelReader),
}

impl Read for PayloadReader {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self {
            PayloadReader::Inline(cursor) => std::io::Read::read(cursor, buf),
            PayloadReader::Streamed(channel) => channel.read(buf),
        }
    }
}
