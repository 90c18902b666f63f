//! Pure path transforms.
//!
//! Archive member names arrive in whatever form the archive's creator used:
//! backslashes, trailing slashes, absolute prefixes, unicode that is
//! visually but not byte-wise equal.  Everything that keys a shared
//! structure (the directory cache, the reservation queues) goes through
//! [`cache_key`] so that two spellings of the same on-disk location always
//! collide.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use unicode_normalization::UnicodeNormalization;

use crate::util::lock;

static NORMALIZE_MEMO: Lazy<Mutex<HashMap<String, String>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// NFKC-normalize a path, so that compatibility-equivalent names compare
/// equal.  Memoized: archives repeat directory prefixes constantly.
pub fn normalize_unicode(path: &str) -> String {
    if path.is_ascii() {
        return path.to_owned();
    }
    let mut memo = lock(&NORMALIZE_MEMO);
    if let Some(hit) = memo.get(path) {
        return hit.clone();
    }
    let normalized: String = path.nfkc().collect();
    memo.insert(path.to_owned(), normalized.clone());
    normalized
}

/// Remove trailing `/` characters, except when the whole path is `/`.
pub fn strip_trailing_slashes(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() && !path.is_empty() {
        "/"
    } else {
        trimmed
    }
}

/// Replace `\` separators with `/` when Windows semantics are active.
pub fn normalize_separators(path: &str, windows: bool) -> Cow<'_, str> {
    if windows && path.contains('\\') {
        Cow::Owned(path.replace('\\', "/"))
    } else {
        Cow::Borrowed(path)
    }
}

/// Split a path into its absolute root prefix and the remainder.
///
/// The prefix is empty for a relative path; otherwise it is the leading
/// run of `/` characters, a drive-letter root (`c:` or `c:/`), or a UNC
/// share root (`//host/share/`).  Separators must already be normalized.
pub fn split_absolute(path: &str, windows: bool) -> (&str, &str) {
    let mut idx = 0;
    loop {
        let took = root_len(&path[idx..], windows);
        if took == 0 {
            break;
        }
        idx += took;
    }
    (&path[..idx], &path[idx..])
}

fn root_len(path: &str, windows: bool) -> usize {
    let bytes = path.as_bytes();
    if windows && bytes.starts_with(b"//") {
        // UNC: //host/share/ — consume through the slash after the share
        let mut slashes = 0;
        for (i, b) in bytes.iter().enumerate().skip(2) {
            if *b == b'/' {
                slashes += 1;
                if slashes == 2 {
                    return i + 1;
                }
            }
        }
        return path.len();
    }
    if bytes.first() == Some(&b'/') {
        return 1;
    }
    if windows && bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return if bytes.get(2) == Some(&b'/') { 3 } else { 2 };
    }
    0
}

/// The canonical lowercase key for a path: separators normalized, trailing
/// slashes stripped, NFKC, lowercased.
pub fn cache_key(path: &str, windows: bool) -> String {
    let separators = normalize_separators(path, windows);
    let stripped = strip_trailing_slashes(&separators);
    normalize_unicode(stripped).to_lowercase()
}

/// Characters that are legal in archive member names but reserved on
/// Windows filesystems, mapped into the unicode private use area at
/// `0xF000 + codepoint` so the original name round-trips.
pub fn encode_windows_chars(path: &str) -> String {
    let bytes = path.as_bytes();
    let keep = if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        2
    } else {
        0
    };
    let mut out = String::with_capacity(path.len());
    out.push_str(&path[..keep]);
    for c in path[keep..].chars() {
        match c {
            '<' | '>' | ':' | '"' | '|' | '?' | '*' => {
                out.push(char::from_u32(0xF000 + c as u32).unwrap_or(c));
            }
            _ => out.push(c),
        }
    }
    out
}

/// Every proper ancestor directory of `key`, ordered from the filesystem
/// root down to the immediate parent.
pub fn ancestors(key: &str) -> Vec<String> {
    if key == "/" {
        return Vec::new();
    }
    let (absolute, relative) = match key.strip_prefix('/') {
        Some(rest) => (true, rest),
        None => (false, key),
    };
    let mut out = Vec::new();
    if absolute {
        out.push(String::from("/"));
    }
    let segments: Vec<&str> = relative.split('/').filter(|s| !s.is_empty()).collect();
    let mut prefix = String::new();
    for segment in segments.iter().take(segments.len().saturating_sub(1)) {
        if !prefix.is_empty() {
            prefix.push('/');
        }
        prefix.push_str(segment);
        out.push(if absolute {
            format!("/{prefix}")
        } else {
            prefix.clone()
        });
    }
    out
}
