//! Extraction configuration.

use std::fmt;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use crate::dircache::DirCache;
use crate::entry::UnpackEntry;
use crate::error::UnpackError;
use crate::platform;
use crate::DEFAULT_MAX_DEPTH;

/// A user-supplied payload filter.  Applied to regular-file payloads
/// between the archive stream and the output file; errors it raises
/// surface as per-entry errors.
pub type Transform =
    Arc<dyn for<'a> Fn(&UnpackEntry, Box<dyn Read + 'a>) -> Box<dyn Read + 'a> + Send + Sync>;

/// Options controlling one extraction.
///
/// `UnpackOptions::new(dir)` gives the defaults: paths sanitized, nothing
/// overwritten destructively beyond what the archive asks for, ownership
/// preserved only when running as the superuser.
#[derive(Clone)]
pub struct UnpackOptions {
    /// Extraction root.  Must exist and be a directory.
    pub cwd: PathBuf,
    /// Path segments to drop from each member name (and hard link target).
    pub strip: usize,
    /// Reject entries with more than this many segments.  `None` means
    /// unlimited.
    pub max_depth: Option<usize>,
    /// Disable `..` rejection, absolute-prefix stripping and the escape
    /// check.
    pub preserve_paths: bool,
    /// Always unlink before creating files and symlinks (forbids in-place
    /// file reuse); also unlink symlinks found in ancestor chains.
    pub unlink: bool,
    /// Never replace anything that already exists on disk.
    pub keep: bool,
    /// Skip entries older than what is already on disk.
    pub newer: bool,
    /// Do not restore modification times.
    pub no_mtime: bool,
    /// Do not set permission bits (the umask is treated as zero).
    pub no_chmod: bool,
    /// Apply ownership unconditionally.
    pub force_chown: bool,
    /// Apply archive ownership where it differs from the process.
    /// Defaults to true for the superuser.
    pub preserve_owner: bool,
    /// Explicit owner override; requires `gid` as well and excludes
    /// `preserve_owner`.
    pub uid: Option<u32>,
    /// Explicit group override.
    pub gid: Option<u32>,
    /// Umask for computing default modes.  Defaults to the process umask.
    pub umask: u32,
    /// Default directory mode when an entry carries none.
    pub dmode: Option<u32>,
    /// Default file mode when an entry carries none.
    pub fmode: Option<u32>,
    /// Apply Windows filesystem semantics (reserved-character encoding,
    /// serialized scheduling, two-step unlink) even on other hosts.
    pub win32: bool,
    /// Promote warnings to fatal errors.
    pub strict: bool,
    /// Payload filter for regular files.
    pub transform: Option<Transform>,
    /// Directory cache shared across extractions into the same tree.
    pub dir_cache: Option<Arc<DirCache>>,
    /// Parallel-profile width.  Defaults to available parallelism.
    pub jobs: Option<usize>,
}

impl UnpackOptions {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            strip: 0,
            max_depth: Some(DEFAULT_MAX_DEPTH),
            preserve_paths: false,
            unlink: false,
            keep: false,
            newer: false,
            no_mtime: false,
            no_chmod: false,
            force_chown: false,
            preserve_owner: platform::is_superuser(),
            uid: None,
            gid: None,
            umask: platform::process_umask(),
            dmode: None,
            fmode: None,
            win32: cfg!(windows),
            strict: false,
            transform: None,
            dir_cache: None,
            jobs: None,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), UnpackError> {
        if self.uid.is_some() != self.gid.is_some() {
            return Err(UnpackError::InvalidOptions(
                "uid and gid must be set together".into(),
            ));
        }
        if self.uid.is_some() && self.preserve_owner {
            return Err(UnpackError::InvalidOptions(
                "explicit uid/gid excludes preserve_owner".into(),
            ));
        }
        Ok(())
    }

    fn effective_umask(&self) -> u32 {
        if self.no_chmod {
            0
        } else {
            self.umask
        }
    }

    pub(crate) fn default_dmode(&self) -> u32 {
        self.dmode.unwrap_or(0o0777 & !self.effective_umask())
    }

    pub(crate) fn default_fmode(&self) -> u32 {
        self.fmode.unwrap_or(0o0666 & !self.effective_umask())
    }
}

impl Default for UnpackOptions {
    fn default() -> Self {
        Self::new(".")
    }
}

impl fmt::Debug for UnpackOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnpackOptions")
            .field("cwd", &self.cwd)
            .field("strip", &self.strip)
            .field("max_depth", &self.max_depth)
            .field("preserve_paths", &self.preserve_paths)
            .field("unlink", &self.unlink)
            .field("keep", &self.keep)
            .field("newer", &self.newer)
            .field("no_mtime", &self.no_mtime)
            .field("no_chmod", &self.no_chmod)
            .field("force_chown", &self.force_chown)
            .field("preserve_owner", &self.preserve_owner)
            .field("uid", &self.uid)
            .field("gid", &self.gid)
            .field("umask", &format_args!("0o{:03o}", self.umask))
            .field("win32", &self.win32)
            .field("strict", &self.strict)
            .field("transform", &self.transform.as_ref().map(|_| ".."))
            .field("jobs", &self.jobs)
            .finish()
    }
}
