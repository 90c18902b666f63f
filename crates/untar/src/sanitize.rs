//! Per-entry path policy.
//!
//! Runs before any reservation is taken.  An accepted entry leaves with
//! its `absolute` target resolved (and, for hard links, the resolved link
//! target); a rejected entry is skipped, optionally with a warning.
//!
//! The `..` rejection exists to stop directory traversal from malicious
//! archives (see the long history of CVEs around tar extraction); the
//! final prefix check on the resolved path is defense in depth on top of
//! it.

use std::path::PathBuf;

use crate::entry::{EntryKind, UnpackEntry};
use crate::error::{WarnCode, Warning};
use crate::options::UnpackOptions;
use crate::paths;

/// The sanitizer's verdict on one entry.  Either way there may be a
/// warning to record.
pub(crate) enum Outcome {
    Accept(Option<Warning>),
    Skip(Option<Warning>),
}

fn reject(entry: &UnpackEntry, message: &str) -> Outcome {
    Outcome::Skip(Some(Warning::new(
        WarnCode::EntryError,
        message,
        Some(PathBuf::from(&entry.path)),
    )))
}

/// A Windows drive-relative parent reference (`c:..`), which escapes the
/// root just like a plain `..` segment.
fn is_drive_relative_dotdot(segment: &str) -> bool {
    let bytes = segment.as_bytes();
    bytes.len() == 4 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' && &bytes[2..] == b".."
}

fn clean_segments(relative: &str) -> Vec<&str> {
    relative
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect()
}

pub(crate) fn sanitize(entry: &mut UnpackEntry, opts: &UnpackOptions) -> Outcome {
    let normalized = paths::normalize_separators(&entry.path, opts.win32).into_owned();
    let (mut root, relative) = paths::split_absolute(&normalized, opts.win32);
    let mut segments = clean_segments(relative);

    if opts.strip > 0 {
        if segments.len() < opts.strip {
            return Outcome::Skip(None);
        }
        segments.drain(..opts.strip);
        if segments.is_empty() {
            return Outcome::Skip(None);
        }
    }

    if let Some(max_depth) = opts.max_depth {
        if segments.len() > max_depth {
            return reject(entry, "path excessively deep");
        }
    }

    if !opts.preserve_paths {
        let escapes = |s: &&str| **s == *".." || (opts.win32 && is_drive_relative_dotdot(s));
        if segments.iter().any(escapes) {
            return reject(entry, "path contains '..'");
        }
    }

    let mut warning = None;
    if !opts.preserve_paths && !root.is_empty() {
        warning = Some(Warning::new(
            WarnCode::EntryInfo,
            format!("stripping {root} from absolute path"),
            Some(PathBuf::from(&entry.path)),
        ));
        root = "";
    }

    entry.path = if root.is_empty() {
        segments.join("/")
    } else {
        format!("{root}{}", segments.join("/"))
    };

    let mut absolute = if !root.is_empty() {
        PathBuf::from(&entry.path)
    } else if entry.path.is_empty() {
        opts.cwd.clone()
    } else {
        opts.cwd.join(&entry.path)
    };

    if !opts.preserve_paths && absolute != opts.cwd && !absolute.starts_with(&opts.cwd) {
        return reject(entry, "path escaped extraction target");
    }

    if absolute == opts.cwd && !entry.kind.is_directory() {
        return Outcome::Skip(warning);
    }

    if entry.kind == EntryKind::Link {
        match sanitize_linkpath(entry, opts) {
            Ok(target) => entry.link_absolute = Some(target),
            Err(outcome) => return outcome,
        }
    }

    if opts.win32 {
        entry.path = paths::encode_windows_chars(&entry.path);
        absolute = PathBuf::from(paths::encode_windows_chars(&absolute.to_string_lossy()));
        if let Some(target) = entry.link_absolute.take() {
            entry.link_absolute = Some(PathBuf::from(paths::encode_windows_chars(
                &target.to_string_lossy(),
            )));
        }
    }

    entry.absolute = Some(absolute);
    Outcome::Accept(warning)
}

/// Resolve and screen a hard link's target the same way as the entry path:
/// same strip count, same `..` rejection, resolved against the extraction
/// root unless `preserve_paths` admits absolute targets.
fn sanitize_linkpath(entry: &mut UnpackEntry, opts: &UnpackOptions) -> Result<PathBuf, Outcome> {
    let Some(linkpath) = entry.linkpath.clone() else {
        return Err(reject(entry, "hard link entry has no link target"));
    };
    let normalized = paths::normalize_separators(&linkpath, opts.win32).into_owned();
    let (root, relative) = paths::split_absolute(&normalized, opts.win32);
    let mut segments = clean_segments(relative);

    if opts.strip > 0 {
        if segments.len() < opts.strip {
            return Err(Outcome::Skip(None));
        }
        segments.drain(..opts.strip);
        if segments.is_empty() {
            return Err(Outcome::Skip(None));
        }
    }

    if !opts.preserve_paths && segments.iter().any(|s| *s == "..") {
        return Err(reject(entry, "link target contains '..'"));
    }

    let rebuilt = segments.join("/");
    entry.linkpath = Some(rebuilt.clone());

    if opts.preserve_paths && !root.is_empty() {
        Ok(PathBuf::from(format!("{root}{rebuilt}")))
    } else {
        Ok(opts.cwd.join(&rebuilt))
    }
}
