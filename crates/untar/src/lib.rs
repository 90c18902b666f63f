pub mod dircache;
pub mod entry;
pub mod error;
pub mod options;
pub mod paths;
pub mod platform;
pub mod reservations;
pub mod unpack;

mod materialize;
mod reconcile;
mod sanitize;
mod util;

pub use dircache::DirCache;
pub use entry::{EntryKind, UnpackEntry};
pub use error::{Result, UnpackError, WarnCode, Warning};
pub use options::{Transform, UnpackOptions};
pub use unpack::{list, unpack, unpack_async, UnpackSummary};

/// Entries whose member name has more than this many path segments are
/// rejected unless the caller raises (or removes) the cap.  Deep paths are
/// almost always a hostile archive rather than a real tree.
pub const DEFAULT_MAX_DEPTH: usize = 1024;
