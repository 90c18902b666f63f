//! Capability probes for platform-dependent behavior.
//!
//! These replace host-name string matching: each quirk the engine cares
//! about is expressed as a question about the target's filesystem
//! semantics.

use once_cell::sync::Lazy;
use rustix::fs::Mode;

/// Whether `st_nlink` can be trusted to decide if an existing regular file
/// may be overwritten in place without affecting a hard-link peer.
pub fn reliable_nlink() -> bool {
    cfg!(any(
        target_os = "linux",
        target_os = "macos",
        target_os = "freebsd"
    ))
}

/// Whether path-level parallelism is unsafe on this host (8.3 short names,
/// case folding that cannot be pre-computed, non-atomic rename).  When
/// true the reservation scheduler degrades to a single global queue.
pub fn parallel_unsafe() -> bool {
    cfg!(windows)
}

pub(crate) fn process_uid() -> u32 {
    rustix::process::getuid().as_raw()
}

pub(crate) fn process_gid() -> u32 {
    rustix::process::getgid().as_raw()
}

pub(crate) fn is_superuser() -> bool {
    rustix::process::geteuid().is_root()
}

static PROCESS_UMASK: Lazy<u32> = Lazy::new(|| {
    // umask can only be read by setting it
    let old = rustix::process::umask(Mode::empty());
    rustix::process::umask(old);
    old.bits()
});

pub(crate) fn process_umask() -> u32 {
    *PROCESS_UMASK
}
