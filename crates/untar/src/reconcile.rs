//! On-disk reconciliation for a single entry.
//!
//! Runs inside the entry's reservation, after the sanitizer.  Looks at
//! whatever currently occupies the target path and decides how to make
//! room: reuse the existing file in place, adjust a directory's mode,
//! remove the obstruction, or skip the entry entirely (`keep`/`newer`).

use std::path::{Path, PathBuf};

use rustix::fs::{FileType, Mode};
use rustix::io::Errno;

use crate::dircache::{ensure_dir, DirCache};
use crate::entry::UnpackEntry;
use crate::error::UnpackError;
use crate::options::UnpackOptions;
use crate::paths;
use crate::platform;
use crate::util::{delete_name, ErrnoFilter};

/// What the materializer should do once the path is clear.
pub(crate) enum Action {
    Skip,
    Write,
}

fn entry_io(path: &Path, errno: Errno) -> UnpackError {
    UnpackError::Entry {
        path: path.to_owned(),
        source: errno.into(),
    }
}

/// Drop cache entries this entry could invalidate.  A symlink can redirect
/// anything, so it clears the whole cache; any other non-directory kind
/// clears the target and everything below it.  Called both before and
/// after the filesystem work, to cover state other handlers observed in
/// between.
pub(crate) fn invalidate_cache(entry: &UnpackEntry, opts: &UnpackOptions, cache: &DirCache) {
    use crate::entry::EntryKind;
    match entry.kind {
        EntryKind::Symlink => cache.clear(),
        kind if kind.is_directory() => {}
        _ => {
            if let Some(absolute) = entry.absolute() {
                cache.invalidate_below(&paths::cache_key(&absolute.to_string_lossy(), opts.win32));
            }
        }
    }
}

/// In-place reuse of an existing regular file is only safe when nothing
/// else links to the inode and unlink semantics are trustworthy.
fn may_reuse(opts: &UnpackOptions) -> bool {
    !opts.unlink && !opts.win32 && platform::reliable_nlink()
}

pub(crate) fn check_fs(
    entry: &UnpackEntry,
    absolute: &Path,
    opts: &UnpackOptions,
    cache: &DirCache,
) -> Result<Action, UnpackError> {
    if absolute != opts.cwd {
        if let Some(parent) = absolute.parent() {
            if parent != opts.cwd {
                ensure_dir(parent, opts.default_dmode(), opts, cache)?;
            }
        }
    }

    let st = match rustix::fs::lstat(absolute).filter_errno(Errno::NOENT) {
        Ok(Some(st)) => st,
        Ok(None) => return Ok(Action::Write),
        Err(errno) => return Err(entry_io(absolute, errno)),
    };

    if opts.keep {
        return Ok(Action::Skip);
    }
    if opts.newer {
        if let Some(mtime) = entry.mtime {
            if (st.st_mtime as i64) > mtime {
                return Ok(Action::Skip);
            }
        }
    }

    // the extraction root is never removed or replaced, though a
    // directory entry for it may still tune its mode
    if absolute == opts.cwd {
        tune_directory_mode(entry, absolute, &st, opts)?;
        return Ok(Action::Write);
    }

    match FileType::from_raw_mode(st.st_mode) {
        FileType::RegularFile if entry.kind.is_file() && may_reuse(opts) && st.st_nlink <= 1 => {
            // overwrite in place; create-truncate leaves the inode alone
            Ok(Action::Write)
        }
        FileType::Directory => {
            if entry.kind.is_directory() {
                tune_directory_mode(entry, absolute, &st, opts)?;
            } else {
                // fails on a non-empty directory; that failure is the
                // entry's error, not ours to paper over
                rustix::fs::rmdir(absolute).map_err(|e| entry_io(absolute, e))?;
            }
            Ok(Action::Write)
        }
        _ => {
            remove_for_replace(absolute, opts)?;
            Ok(Action::Write)
        }
    }
}

fn tune_directory_mode(
    entry: &UnpackEntry,
    absolute: &Path,
    st: &rustix::fs::Stat,
    opts: &UnpackOptions,
) -> Result<(), UnpackError> {
    if !entry.kind.is_directory() || opts.no_chmod {
        return Ok(());
    }
    if let Some(mode) = entry.mode {
        let want = mode & 0o7777;
        if want != (st.st_mode & 0o7777) {
            rustix::fs::chmod(absolute, Mode::from_raw_mode(want))
                .map_err(|e| entry_io(absolute, e))?;
        }
    }
    Ok(())
}

/// Remove whatever sits at `path` so it can be replaced.
///
/// Under Windows semantics the directory entry's removal is not atomic
/// with respect to a same-named create, and a plain unlink can swallow the
/// replacement.  Renaming to a random doomed name first makes the original
/// name free synchronously.
pub(crate) fn remove_for_replace(path: &Path, opts: &UnpackOptions) -> Result<(), UnpackError> {
    if opts.win32 {
        let doomed: PathBuf = delete_name(path);
        rustix::fs::rename(path, &doomed).map_err(|e| entry_io(path, e))?;
        rustix::fs::unlink(&doomed).map_err(|e| entry_io(&doomed, e))?;
    } else {
        rustix::fs::unlink(path).map_err(|e| entry_io(path, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use similar_asserts::assert_eq;

    use super::*;
    use crate::entry::EntryKind;

    fn opts_for(dir: &Path) -> UnpackOptions {
        let mut opts = UnpackOptions::new(dir);
        opts.preserve_owner = false;
        opts.win32 = false;
        opts
    }

    fn entry_at(kind: EntryKind, opts: &UnpackOptions, name: &str) -> (UnpackEntry, PathBuf) {
        let mut entry = UnpackEntry::new(kind, name);
        let absolute = opts.cwd.join(name);
        entry.absolute = Some(absolute.clone());
        (entry, absolute)
    }

    #[test]
    fn missing_target_writes_directly() {
        let td = tempfile::tempdir().unwrap();
        let opts = opts_for(td.path());
        let cache = DirCache::new();
        let (entry, absolute) = entry_at(EntryKind::File, &opts, "new");
        assert!(matches!(
            check_fs(&entry, &absolute, &opts, &cache).unwrap(),
            Action::Write
        ));
    }

    #[test]
    fn keep_skips_existing() {
        let td = tempfile::tempdir().unwrap();
        let mut opts = opts_for(td.path());
        opts.keep = true;
        let cache = DirCache::new();
        let (entry, absolute) = entry_at(EntryKind::File, &opts, "present");
        std::fs::write(&absolute, b"old").unwrap();
        assert!(matches!(
            check_fs(&entry, &absolute, &opts, &cache).unwrap(),
            Action::Skip
        ));
        assert_eq!(std::fs::read(&absolute).unwrap(), b"old");
    }

    #[test]
    fn newer_on_disk_skips_older_entry() {
        let td = tempfile::tempdir().unwrap();
        let mut opts = opts_for(td.path());
        opts.newer = true;
        let cache = DirCache::new();
        let (mut entry, absolute) = entry_at(EntryKind::File, &opts, "present");
        std::fs::write(&absolute, b"current").unwrap();
        entry.mtime = Some(1); // 1970; everything on disk is newer
        assert!(matches!(
            check_fs(&entry, &absolute, &opts, &cache).unwrap(),
            Action::Skip
        ));
    }

    #[test]
    fn symlink_is_cleared_for_file() {
        let td = tempfile::tempdir().unwrap();
        let opts = opts_for(td.path());
        let cache = DirCache::new();
        let (entry, absolute) = entry_at(EntryKind::File, &opts, "link");
        std::os::unix::fs::symlink("/etc", &absolute).unwrap();
        assert!(matches!(
            check_fs(&entry, &absolute, &opts, &cache).unwrap(),
            Action::Write
        ));
        assert!(!absolute.exists() || !absolute.is_symlink());
    }

    #[test]
    fn directory_mode_is_tuned_for_directory_entry() {
        let td = tempfile::tempdir().unwrap();
        let opts = opts_for(td.path());
        let cache = DirCache::new();
        let (mut entry, absolute) = entry_at(EntryKind::Directory, &opts, "dir");
        std::fs::create_dir(&absolute).unwrap();
        std::fs::set_permissions(&absolute, std::fs::Permissions::from_mode(0o700)).unwrap();
        entry.mode = Some(0o755);
        assert!(matches!(
            check_fs(&entry, &absolute, &opts, &cache).unwrap(),
            Action::Write
        ));
        let mode = std::fs::metadata(&absolute).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o755);
    }

    #[test]
    fn nonempty_directory_fails_replacement_as_entry_error() {
        let td = tempfile::tempdir().unwrap();
        let opts = opts_for(td.path());
        let cache = DirCache::new();
        let (entry, absolute) = entry_at(EntryKind::File, &opts, "dir");
        std::fs::create_dir(&absolute).unwrap();
        std::fs::write(absolute.join("occupant"), b"x").unwrap();
        assert!(matches!(
            check_fs(&entry, &absolute, &opts, &cache),
            Err(UnpackError::Entry { .. })
        ));
        assert!(absolute.is_dir());
    }

    #[test]
    fn two_step_removal_under_win32_semantics() {
        let td = tempfile::tempdir().unwrap();
        let mut opts = opts_for(td.path());
        opts.win32 = true;
        let target = td.path().join("victim");
        std::fs::write(&target, b"x").unwrap();
        remove_for_replace(&target, &opts).unwrap();
        assert!(!target.exists());
        // nothing left behind under the doomed name either
        assert_eq!(std::fs::read_dir(td.path()).unwrap().count(), 0);
    }
}
