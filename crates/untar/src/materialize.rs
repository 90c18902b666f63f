//! Filesystem materialization of a single entry.
//!
//! By the time an entry gets here the target path is clear (or being
//! reused), its parents exist, and the reservation guarantees nobody else
//! is touching the path.  All that is left is to create the object and
//! restore its metadata.

use std::fs::OpenOptions;
use std::io::{self, Read};
use std::os::fd::AsFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use rustix::fs::{fchmod, futimens, utimensat, AtFlags, Mode, Timespec, Timestamps, CWD};

use crate::dircache::{ensure_dir, DirCache};
use crate::entry::{EntryKind, UnpackEntry};
use crate::error::UnpackError;
use crate::options::UnpackOptions;
use crate::platform;

fn entry_error(path: &Path, source: io::Error) -> UnpackError {
    UnpackError::Entry {
        path: path.to_owned(),
        source,
    }
}

/// The DOCHOWN predicate: whether this entry's ownership should be
/// applied, and with which ids.
pub(crate) fn owner_for(entry: &UnpackEntry, opts: &UnpackOptions) -> Option<(u32, u32)> {
    let process_uid = platform::process_uid();
    let process_gid = platform::process_gid();
    let wanted = opts.force_chown
        || (opts.preserve_owner
            && (entry.uid.is_some_and(|uid| uid != process_uid)
                || entry.gid.is_some_and(|gid| gid != process_gid)))
        || opts.uid.is_some_and(|uid| uid != process_uid)
        || opts.gid.is_some_and(|gid| gid != process_gid);
    if !wanted {
        return None;
    }
    let uid = opts.uid.or(entry.uid).unwrap_or(process_uid);
    let gid = opts.gid.or(entry.gid).unwrap_or(process_gid);
    Some((uid, gid))
}

fn timestamps(entry: &UnpackEntry, mtime: i64) -> Timestamps {
    let atime = entry.atime.unwrap_or(mtime);
    Timestamps {
        last_access: Timespec {
            tv_sec: atime,
            tv_nsec: 0,
        },
        last_modification: Timespec {
            tv_sec: mtime,
            tv_nsec: 0,
        },
    }
}

pub(crate) fn make_fs<R: Read>(
    entry: &UnpackEntry,
    absolute: &Path,
    payload: &mut R,
    opts: &UnpackOptions,
    cache: &DirCache,
) -> Result<(), UnpackError> {
    match entry.kind {
        kind if kind.is_file() => write_file(entry, absolute, payload, opts),
        kind if kind.is_directory() => make_directory(entry, absolute, opts, cache),
        EntryKind::Link => hard_link(entry, absolute),
        EntryKind::Symlink => make_symlink(entry, absolute),
        _ => Err(entry_error(
            absolute,
            io::Error::other("entry kind cannot be materialized"),
        )),
    }
}

fn write_file<R: Read>(
    entry: &UnpackEntry,
    absolute: &Path,
    payload: &mut R,
    opts: &UnpackOptions,
) -> Result<(), UnpackError> {
    let mode = entry
        .mode
        .map(|m| m & 0o7777)
        .unwrap_or_else(|| opts.default_fmode());

    let mut open = OpenOptions::new();
    open.write(true).create(true).truncate(true).mode(mode);
    let file = open
        .open(absolute)
        .map_err(|e| entry_error(absolute, e))?;
    if !opts.no_chmod {
        // open() masks the requested mode with the process umask
        fchmod(file.as_fd(), Mode::from_raw_mode(mode))
            .map_err(|e| entry_error(absolute, e.into()))?;
    }

    let mut source: Box<dyn Read + '_> = Box::new(&mut *payload);
    if let Some(transform) = &opts.transform {
        source = transform(entry, source);
    }
    io::copy(&mut source, &mut &file).map_err(|e| entry_error(absolute, e))?;

    if !opts.no_mtime {
        if let Some(mtime) = entry.mtime {
            let times = timestamps(entry, mtime);
            futimens(file.as_fd(), &times)
                .or_else(|_| utimensat(CWD, absolute, &times, AtFlags::empty()))
                .map_err(|e| entry_error(absolute, e.into()))?;
        }
    }
    if let Some((uid, gid)) = owner_for(entry, opts) {
        std::os::unix::fs::fchown(&file, Some(uid), Some(gid))
            .or_else(|_| std::os::unix::fs::chown(absolute, Some(uid), Some(gid)))
            .map_err(|e| entry_error(absolute, e))?;
    }
    drop(file);
    Ok(())
}

fn make_directory(
    entry: &UnpackEntry,
    absolute: &Path,
    opts: &UnpackOptions,
    cache: &DirCache,
) -> Result<(), UnpackError> {
    let mode = entry
        .mode
        .map(|m| m & 0o7777)
        .unwrap_or_else(|| opts.default_dmode());
    ensure_dir(absolute, mode, opts, cache)?;

    if !opts.no_mtime {
        if let Some(mtime) = entry.mtime {
            utimensat(CWD, absolute, &timestamps(entry, mtime), AtFlags::empty())
                .map_err(|e| entry_error(absolute, e.into()))?;
        }
    }
    if let Some((uid, gid)) = owner_for(entry, opts) {
        std::os::unix::fs::chown(absolute, Some(uid), Some(gid))
            .map_err(|e| entry_error(absolute, e))?;
    }
    Ok(())
}

fn hard_link(entry: &UnpackEntry, absolute: &Path) -> Result<(), UnpackError> {
    let Some(target) = entry.link_absolute.as_deref() else {
        return Err(entry_error(
            absolute,
            io::Error::other("hard link entry has no resolved target"),
        ));
    };
    rustix::fs::link(target, absolute).map_err(|e| entry_error(absolute, e.into()))
}

fn make_symlink(entry: &UnpackEntry, absolute: &Path) -> Result<(), UnpackError> {
    let Some(target) = entry.linkpath.as_deref() else {
        return Err(entry_error(
            absolute,
            io::Error::other("symlink entry has no target"),
        ));
    };
    rustix::fs::symlink(target, absolute).map_err(|e| entry_error(absolute, e.into()))
}
