//! The archive entry model consumed by the engine.
//!
//! Entries are produced by an upstream parser — either the `tar` crate's
//! iterator (sequential profile) or this crate's own async header loop —
//! and normalized into [`UnpackEntry`] before any filesystem work starts.

use std::path::{Path, PathBuf};

use tar::Header;

/// The closed set of tar entry kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Regular file (`0`).
    File,
    /// Pre-POSIX regular file (NUL type byte).
    OldFile,
    /// Contiguous file (`7`); extracted as a regular file.
    ContiguousFile,
    /// Directory (`5`).
    Directory,
    /// GNU dump directory (`D`); extracted as a directory, listing drained.
    GnuDumpDir,
    /// Hard link (`1`).
    Link,
    /// Symbolic link (`2`).
    Symlink,
    /// Character device (`3`); not materialized.
    CharDevice,
    /// Block device (`4`); not materialized.
    BlockDevice,
    /// FIFO (`6`); not materialized.
    Fifo,
    /// Anything else.
    Unknown,
}

impl EntryKind {
    /// Map a raw header type byte.
    pub fn from_type_byte(byte: u8) -> Self {
        match byte {
            b'0' => EntryKind::File,
            b'\0' => EntryKind::OldFile,
            b'7' => EntryKind::ContiguousFile,
            b'5' => EntryKind::Directory,
            b'D' => EntryKind::GnuDumpDir,
            b'1' => EntryKind::Link,
            b'2' => EntryKind::Symlink,
            b'3' => EntryKind::CharDevice,
            b'4' => EntryKind::BlockDevice,
            b'6' => EntryKind::Fifo,
            _ => EntryKind::Unknown,
        }
    }

    /// Kinds written as regular files.
    pub fn is_file(self) -> bool {
        matches!(
            self,
            EntryKind::File | EntryKind::OldFile | EntryKind::ContiguousFile
        )
    }

    /// Kinds written as directories.
    pub fn is_directory(self) -> bool {
        matches!(self, EntryKind::Directory | EntryKind::GnuDumpDir)
    }

    /// Kinds this engine never materializes.
    pub fn is_unsupported(self) -> bool {
        matches!(
            self,
            EntryKind::CharDevice | EntryKind::BlockDevice | EntryKind::Fifo | EntryKind::Unknown
        )
    }
}

/// One archive member, with metadata resolved (GNU long names and PAX
/// records already folded in by the parser).
#[derive(Debug, Clone)]
pub struct UnpackEntry {
    /// Entry kind.
    pub kind: EntryKind,
    /// Archive-relative `/`-separated member name.
    pub path: String,
    /// Link target: archive-relative for hard links, literal for symlinks.
    pub linkpath: Option<String>,
    /// POSIX permission bits, when the header carried them.
    pub mode: Option<u32>,
    /// Numeric owner.
    pub uid: Option<u32>,
    /// Numeric group.
    pub gid: Option<u32>,
    /// Modification time, seconds since the epoch.
    pub mtime: Option<i64>,
    /// Access time, seconds since the epoch.
    pub atime: Option<i64>,
    /// Payload length in bytes.
    pub size: u64,
    pub(crate) absolute: Option<PathBuf>,
    pub(crate) link_absolute: Option<PathBuf>,
}

impl UnpackEntry {
    pub fn new(kind: EntryKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            linkpath: None,
            mode: None,
            uid: None,
            gid: None,
            mtime: None,
            atime: None,
            size: 0,
            absolute: None,
            link_absolute: None,
        }
    }

    /// Build an entry from a raw tar header plus already-resolved name
    /// fields (PAX `path`/`linkpath` take precedence over GNU long names,
    /// which take precedence over the header fields).
    pub fn from_tar_header(header: &Header, path: String, linkpath: Option<String>) -> Self {
        Self {
            kind: EntryKind::from_type_byte(header.entry_type().as_byte()),
            path,
            linkpath,
            mode: header.mode().ok(),
            uid: header.uid().ok().map(|v| v as u32),
            gid: header.gid().ok().map(|v| v as u32),
            mtime: header.mtime().ok().map(|v| v as i64),
            atime: None,
            size: header.entry_size().unwrap_or(0),
            absolute: None,
            link_absolute: None,
        }
    }

    /// The fully resolved host filesystem target, set once the sanitizer
    /// accepts the entry.
    pub fn absolute(&self) -> Option<&Path> {
        self.absolute.as_deref()
    }
}
