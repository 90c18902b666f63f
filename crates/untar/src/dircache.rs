//! Shared directory cache and recursive directory creation.
//!
//! Creating parent directories is by far the most repeated filesystem
//! operation during an extraction, so successes are memoized in a cache
//! keyed by [`crate::paths::cache_key`].  The cache may be shared across
//! extractions into the same tree; the reconciler invalidates it whenever
//! an entry could change the meaning of a cached path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rustix::fs::{FileType, Mode};
use rustix::io::Errno;

use crate::error::UnpackError;
use crate::options::UnpackOptions;
use crate::paths;
use crate::util::lock;

/// Map from canonical directory key to "known to exist as a directory".
#[derive(Debug, Default)]
pub struct DirCache {
    map: Mutex<HashMap<String, bool>>,
}

impl DirCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self, key: &str) -> Option<bool> {
        lock(&self.map).get(key).copied()
    }

    pub fn set(&self, key: String, exists: bool) {
        lock(&self.map).insert(key, exists);
    }

    /// Drop everything.  Used when a symlink lands anywhere in the tree,
    /// since it can redirect any cached path.
    pub fn clear(&self) {
        lock(&self.map).clear();
    }

    /// Drop `key` and every cached descendant of it.
    pub fn invalidate_below(&self, key: &str) {
        lock(&self.map).retain(|cached, _| {
            !(cached == key
                || (cached.starts_with(key) && cached.as_bytes().get(key.len()) == Some(&b'/')))
        });
    }
}

fn entry_io(path: &Path, errno: Errno) -> UnpackError {
    UnpackError::Entry {
        path: path.to_owned(),
        source: errno.into(),
    }
}

/// Validate the extraction root itself.  Anything but an existing
/// directory is fatal.
pub(crate) fn ensure_cwd(opts: &UnpackOptions, cache: &DirCache) -> Result<(), UnpackError> {
    match rustix::fs::stat(&opts.cwd) {
        Ok(st) if FileType::from_raw_mode(st.st_mode) == FileType::Directory => {
            let key = paths::cache_key(&opts.cwd.to_string_lossy(), opts.win32);
            cache.set(key, true);
            Ok(())
        }
        Ok(_) => Err(UnpackError::Cwd {
            path: opts.cwd.clone(),
            source: Errno::NOTDIR.into(),
        }),
        Err(errno) => Err(UnpackError::Cwd {
            path: opts.cwd.clone(),
            source: errno.into(),
        }),
    }
}

/// Create `dir` and any missing ancestors below the extraction root,
/// recording each directory in the cache.
///
/// A symbolic link found along the chain is refused (or unlinked, when the
/// `unlink` option is set): following one would let an archive redirect
/// later entries outside the root.
pub(crate) fn ensure_dir(
    dir: &Path,
    mode: u32,
    opts: &UnpackOptions,
    cache: &DirCache,
) -> Result<(), UnpackError> {
    let key = paths::cache_key(&dir.to_string_lossy(), opts.win32);
    if cache.check(&key) == Some(true) {
        return Ok(());
    }

    let base = if dir.starts_with(&opts.cwd) {
        opts.cwd.clone()
    } else {
        PathBuf::from("/")
    };
    let relative = dir.strip_prefix(&base).unwrap_or(dir).to_owned();

    let mut current = base;
    for component in relative.components() {
        current.push(component);
        let current_key = paths::cache_key(&current.to_string_lossy(), opts.win32);
        if cache.check(&current_key) == Some(true) {
            continue;
        }
        make_one(&current, mode, opts)?;
        cache.set(current_key, true);
    }
    Ok(())
}

fn make_one(dir: &Path, mode: u32, opts: &UnpackOptions) -> Result<(), UnpackError> {
    match rustix::fs::mkdir(dir, Mode::from_raw_mode(mode)) {
        Ok(()) => created(dir, mode, opts),
        Err(Errno::EXIST) => {
            let st = rustix::fs::lstat(dir).map_err(|e| entry_io(dir, e))?;
            match FileType::from_raw_mode(st.st_mode) {
                FileType::Directory => Ok(()),
                FileType::Symlink => {
                    if opts.unlink {
                        rustix::fs::unlink(dir).map_err(|e| entry_io(dir, e))?;
                        rustix::fs::mkdir(dir, Mode::from_raw_mode(mode))
                            .map_err(|e| entry_io(dir, e))?;
                        created(dir, mode, opts)
                    } else {
                        Err(UnpackError::Symlink {
                            path: dir.to_owned(),
                        })
                    }
                }
                _ => Err(entry_io(dir, Errno::NOTDIR)),
            }
        }
        Err(errno) => Err(entry_io(dir, errno)),
    }
}

fn created(dir: &Path, mode: u32, opts: &UnpackOptions) -> Result<(), UnpackError> {
    if !opts.no_chmod {
        // mkdir() masks the requested mode with the process umask
        rustix::fs::chmod(dir, Mode::from_raw_mode(mode)).map_err(|e| entry_io(dir, e))?;
    }
    if let (Some(uid), Some(gid)) = (opts.uid, opts.gid) {
        std::os::unix::fs::chown(dir, Some(uid), Some(gid)).map_err(|source| {
            UnpackError::Entry {
                path: dir.to_owned(),
                source,
            }
        })?;
    }
    Ok(())
}
