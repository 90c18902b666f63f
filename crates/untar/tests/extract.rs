//! End-to-end extraction scenarios, run against real archives built with
//! the `tar` crate (plus hand-built headers for the hostile paths the
//! builder refuses to produce).

use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use similar_asserts::assert_eq;
use untar::{unpack, unpack_async, UnpackError, UnpackOptions, UnpackSummary, WarnCode};

const MTIME: u64 = 1_700_000_000;

fn opts_for(dir: &Path) -> UnpackOptions {
    let mut opts = UnpackOptions::new(dir);
    opts.preserve_owner = false;
    opts.win32 = false;
    opts
}

fn build<F: FnOnce(&mut tar::Builder<&mut Vec<u8>>)>(fill: F) -> Vec<u8> {
    let mut data = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut data);
        fill(&mut builder);
        builder.finish().unwrap();
    }
    data
}

fn append_file(builder: &mut tar::Builder<&mut Vec<u8>>, path: &str, mode: u32, content: &[u8]) {
    let mut header = tar::Header::new_gnu();
    header.set_mode(mode);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(MTIME);
    header.set_size(content.len() as u64);
    header.set_entry_type(tar::EntryType::Regular);
    builder.append_data(&mut header, path, content).unwrap();
}

fn append_dir(builder: &mut tar::Builder<&mut Vec<u8>>, path: &str, mode: u32) {
    let mut header = tar::Header::new_gnu();
    header.set_mode(mode);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(MTIME);
    header.set_size(0);
    header.set_entry_type(tar::EntryType::Directory);
    builder.append_data(&mut header, path, &[][..]).unwrap();
}

fn append_link(builder: &mut tar::Builder<&mut Vec<u8>>, path: &str, target: &str, hard: bool) {
    let mut header = tar::Header::new_gnu();
    header.set_mode(0o777);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(MTIME);
    header.set_size(0);
    header.set_entry_type(if hard {
        tar::EntryType::Link
    } else {
        tar::EntryType::Symlink
    });
    builder.append_link(&mut header, path, target).unwrap();
}

/// A single raw 512-byte header plus padded content, for member names the
/// builder would reject (absolute paths, `..` traversal).
fn raw_entry(path: &str, type_byte: u8, content: &[u8]) -> Vec<u8> {
    assert!(path.len() < 100);
    let mut header = tar::Header::new_gnu();
    header.as_mut_bytes()[..path.len()].copy_from_slice(path.as_bytes());
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(MTIME);
    header.set_size(content.len() as u64);
    header.set_entry_type(tar::EntryType::new(type_byte));
    header.set_cksum();

    let mut out = header.as_bytes().to_vec();
    out.extend_from_slice(content);
    out.resize(out.len() + (512 - content.len() % 512) % 512, 0);
    out
}

fn raw_archive(entries: Vec<Vec<u8>>) -> Vec<u8> {
    let mut data: Vec<u8> = entries.into_iter().flatten().collect();
    data.resize(data.len() + 1024, 0);
    data
}

fn extract_both(data: &[u8], opts: &UnpackOptions) -> (UnpackSummary, UnpackSummary) {
    let sync_dir = tempfile::tempdir().unwrap();
    let mut sync_opts = opts.clone();
    sync_opts.cwd = sync_dir.path().to_owned();
    let sync_summary = unpack(data, sync_opts).unwrap();
    drop(sync_dir);

    let async_dir = tempfile::tempdir().unwrap();
    let mut async_opts = opts.clone();
    async_opts.cwd = async_dir.path().to_owned();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    let async_summary = runtime.block_on(unpack_async(data, async_opts)).unwrap();
    drop(async_dir);

    (sync_summary, async_summary)
}

#[test]
fn s1_simple_tree() {
    let data = build(|b| {
        append_dir(b, "dir", 0o755);
        append_file(b, "dir/a", 0o644, b"hello");
        append_file(b, "dir/b", 0o600, b"world");
    });

    let td = tempfile::tempdir().unwrap();
    let summary = unpack(&data[..], opts_for(td.path())).unwrap();
    assert_eq!(summary.written, 3);
    assert!(summary.warnings.is_empty());

    assert!(td.path().join("dir").is_dir());
    assert_eq!(std::fs::read(td.path().join("dir/a")).unwrap(), b"hello");
    assert_eq!(std::fs::read(td.path().join("dir/b")).unwrap(), b"world");

    let mode_of = |name: &str| {
        std::fs::metadata(td.path().join(name))
            .unwrap()
            .permissions()
            .mode()
            & 0o7777
    };
    assert_eq!(mode_of("dir/a"), 0o644);
    assert_eq!(mode_of("dir/b"), 0o600);

    let mtime = std::fs::metadata(td.path().join("dir/a")).unwrap().mtime();
    assert_eq!(mtime as u64, MTIME);
}

#[tokio::test(flavor = "multi_thread")]
async fn s1_simple_tree_async() {
    let data = build(|b| {
        append_dir(b, "dir", 0o755);
        append_file(b, "dir/a", 0o644, b"hello");
        append_file(b, "dir/b", 0o600, b"world");
    });

    let td = tempfile::tempdir().unwrap();
    let summary = unpack_async(&data[..], opts_for(td.path())).await.unwrap();
    assert_eq!(summary.written, 3);
    assert_eq!(std::fs::read(td.path().join("dir/a")).unwrap(), b"hello");
    assert_eq!(std::fs::read(td.path().join("dir/b")).unwrap(), b"world");
}

#[test]
fn permissive_modes_are_restored_exactly() {
    // 0o777/0o666 carry the group/other write bits a 0o022 umask strips
    let data = build(|b| {
        append_dir(b, "shared", 0o777);
        append_file(b, "shared/scratch", 0o666, b"anyone");
    });

    let td = tempfile::tempdir().unwrap();
    let summary = unpack(&data[..], opts_for(td.path())).unwrap();
    assert_eq!(summary.written, 2);

    let mode_of = |name: &str| {
        std::fs::metadata(td.path().join(name))
            .unwrap()
            .permissions()
            .mode()
            & 0o7777
    };
    assert_eq!(mode_of("shared"), 0o777);
    assert_eq!(mode_of("shared/scratch"), 0o666);
}

#[test]
fn s2_absolute_path_stripped() {
    let data = raw_archive(vec![raw_entry("/etc/passwd", b'0', b"x")]);

    let td = tempfile::tempdir().unwrap();
    let summary = unpack(&data[..], opts_for(td.path())).unwrap();

    assert_eq!(std::fs::read(td.path().join("etc/passwd")).unwrap(), b"x");
    assert_eq!(summary.warnings.len(), 1);
    let warning = &summary.warnings[0];
    assert_eq!(warning.code, WarnCode::EntryInfo);
    assert_eq!(warning.message, "stripping / from absolute path");
}

#[test]
fn s3_traversal_rejected() {
    let data = raw_archive(vec![raw_entry("../../etc/passwd", b'0', b"x")]);

    let td = tempfile::tempdir().unwrap();
    let summary = unpack(&data[..], opts_for(td.path())).unwrap();

    assert_eq!(summary.written, 0);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.warnings.len(), 1);
    assert_eq!(summary.warnings[0].code, WarnCode::EntryError);
    assert_eq!(summary.warnings[0].message, "path contains '..'");
    assert_eq!(std::fs::read_dir(td.path()).unwrap().count(), 0);
}

#[test]
fn s4_hard_link_shares_inode() {
    let data = build(|b| {
        append_file(b, "a", 0o644, b"x");
        append_link(b, "b", "a", true);
    });

    let td = tempfile::tempdir().unwrap();
    let summary = unpack(&data[..], opts_for(td.path())).unwrap();
    assert_eq!(summary.written, 2);

    let ino_a = std::fs::metadata(td.path().join("a")).unwrap().ino();
    let ino_b = std::fs::metadata(td.path().join("b")).unwrap().ino();
    assert_eq!(ino_a, ino_b);
    assert_eq!(std::fs::read(td.path().join("b")).unwrap(), b"x");
}

#[tokio::test(flavor = "multi_thread")]
async fn s4_hard_link_shares_inode_async() {
    // the link's reservation covers both its own path and the target, so
    // it cannot start before the file's handler releases
    let data = build(|b| {
        append_file(b, "a", 0o644, b"x");
        append_link(b, "b", "a", true);
    });

    let td = tempfile::tempdir().unwrap();
    let summary = unpack_async(&data[..], opts_for(td.path())).await.unwrap();
    assert_eq!(summary.written, 2);

    let ino_a = std::fs::metadata(td.path().join("a")).unwrap().ino();
    let ino_b = std::fs::metadata(td.path().join("b")).unwrap().ino();
    assert_eq!(ino_a, ino_b);
}

#[test]
fn s5_depth_cap() {
    let data = build(|b| append_file(b, "a/b/c/d/e", 0o644, b"deep"));

    let td = tempfile::tempdir().unwrap();
    let mut opts = opts_for(td.path());
    opts.max_depth = Some(3);
    let summary = unpack(&data[..], opts).unwrap();

    assert_eq!(summary.written, 0);
    assert_eq!(summary.warnings.len(), 1);
    assert_eq!(summary.warnings[0].message, "path excessively deep");
}

#[test]
fn s6_directory_replaced_by_file() {
    let data = build(|b| append_file(b, "x", 0o644, b"now a file"));

    let td = tempfile::tempdir().unwrap();
    std::fs::create_dir(td.path().join("x")).unwrap();

    let summary = unpack(&data[..], opts_for(td.path())).unwrap();
    assert_eq!(summary.written, 1);
    assert!(td.path().join("x").is_file());
    assert_eq!(std::fs::read(td.path().join("x")).unwrap(), b"now a file");
}

#[test]
fn s6_nonempty_directory_fails_entry_and_continues() {
    let data = build(|b| {
        append_file(b, "x", 0o644, b"wants to replace");
        append_file(b, "after", 0o644, b"still extracted");
    });

    let td = tempfile::tempdir().unwrap();
    std::fs::create_dir(td.path().join("x")).unwrap();
    std::fs::write(td.path().join("x/occupant"), b"here").unwrap();

    let summary = unpack(&data[..], opts_for(td.path())).unwrap();
    assert_eq!(summary.written, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.warnings.len(), 1);
    assert_eq!(summary.warnings[0].code, WarnCode::EntryError);
    assert!(td.path().join("x").is_dir());
    assert_eq!(
        std::fs::read(td.path().join("after")).unwrap(),
        b"still extracted"
    );
}

#[test]
fn keep_never_overwrites() {
    let data = build(|b| append_file(b, "f", 0o644, b"from archive"));

    let td = tempfile::tempdir().unwrap();
    std::fs::write(td.path().join("f"), b"already here").unwrap();

    let mut opts = opts_for(td.path());
    opts.keep = true;
    let summary = unpack(&data[..], opts).unwrap();
    assert_eq!(summary.written, 0);
    assert_eq!(summary.skipped, 1);
    assert_eq!(std::fs::read(td.path().join("f")).unwrap(), b"already here");
}

#[test]
fn newer_keeps_fresher_disk_file() {
    // archive mtime is MTIME (2023); the file on disk was written just now
    let data = build(|b| append_file(b, "f", 0o644, b"from archive"));

    let td = tempfile::tempdir().unwrap();
    std::fs::write(td.path().join("f"), b"fresher").unwrap();

    let mut opts = opts_for(td.path());
    opts.newer = true;
    let summary = unpack(&data[..], opts).unwrap();
    assert_eq!(summary.written, 0);
    assert_eq!(std::fs::read(td.path().join("f")).unwrap(), b"fresher");
}

#[test]
fn strip_beyond_depth_skips_without_warning() {
    let data = build(|b| {
        append_file(b, "pkg/src/main.c", 0o644, b"int main;");
        append_file(b, "pkg", 0o644, b"too shallow");
    });

    let td = tempfile::tempdir().unwrap();
    let mut opts = opts_for(td.path());
    opts.strip = 1;
    let summary = unpack(&data[..], opts).unwrap();

    assert_eq!(summary.written, 1);
    assert_eq!(summary.skipped, 1);
    assert!(summary.warnings.is_empty());
    assert_eq!(
        std::fs::read(td.path().join("src/main.c")).unwrap(),
        b"int main;"
    );
}

#[test]
fn same_path_twice_last_wins() {
    let data = build(|b| {
        append_file(b, "f", 0o644, b"first");
        append_file(b, "f", 0o600, b"second");
    });

    let td = tempfile::tempdir().unwrap();
    let summary = unpack(&data[..], opts_for(td.path())).unwrap();
    assert_eq!(summary.written, 2);
    assert_eq!(std::fs::read(td.path().join("f")).unwrap(), b"second");
}

#[tokio::test(flavor = "multi_thread")]
async fn same_path_twice_last_wins_async() {
    let data = build(|b| {
        append_file(b, "f", 0o644, b"first");
        append_file(b, "f", 0o600, b"second");
    });

    let td = tempfile::tempdir().unwrap();
    let summary = unpack_async(&data[..], opts_for(td.path())).await.unwrap();
    assert_eq!(summary.written, 2);
    assert_eq!(std::fs::read(td.path().join("f")).unwrap(), b"second");
}

#[cfg(target_os = "linux")]
#[test]
fn reusable_file_is_overwritten_in_place() {
    let data = build(|b| append_file(b, "f", 0o644, b"replacement"));

    let td = tempfile::tempdir().unwrap();
    std::fs::write(td.path().join("f"), b"original").unwrap();
    let ino_before = std::fs::metadata(td.path().join("f")).unwrap().ino();

    let summary = unpack(&data[..], opts_for(td.path())).unwrap();
    assert_eq!(summary.written, 1);
    let meta = std::fs::metadata(td.path().join("f")).unwrap();
    assert_eq!(meta.ino(), ino_before);
    assert_eq!(std::fs::read(td.path().join("f")).unwrap(), b"replacement");
}

#[cfg(target_os = "linux")]
#[test]
fn unlink_mode_forbids_reuse() {
    let data = build(|b| append_file(b, "f", 0o644, b"replacement"));

    let td = tempfile::tempdir().unwrap();
    std::fs::write(td.path().join("f"), b"original").unwrap();
    let ino_before = std::fs::metadata(td.path().join("f")).unwrap().ino();

    let mut opts = opts_for(td.path());
    opts.unlink = true;
    unpack(&data[..], opts).unwrap();
    assert_ne!(std::fs::metadata(td.path().join("f")).unwrap().ino(), ino_before);
}

#[cfg(target_os = "linux")]
#[test]
fn hard_linked_peer_survives_replacement() {
    let data = build(|b| append_file(b, "f", 0o644, b"new content"));

    let td = tempfile::tempdir().unwrap();
    std::fs::write(td.path().join("f"), b"shared").unwrap();
    std::fs::hard_link(td.path().join("f"), td.path().join("peer")).unwrap();

    unpack(&data[..], opts_for(td.path())).unwrap();

    // nlink was 2, so the file was unlinked and recreated, leaving the
    // peer's inode untouched
    assert_eq!(std::fs::read(td.path().join("peer")).unwrap(), b"shared");
    assert_eq!(std::fs::read(td.path().join("f")).unwrap(), b"new content");
    assert_ne!(
        std::fs::metadata(td.path().join("f")).unwrap().ino(),
        std::fs::metadata(td.path().join("peer")).unwrap().ino()
    );
}

#[test]
fn symlink_in_parent_chain_is_not_followed() {
    let outside = tempfile::tempdir().unwrap();
    let data = build(|b| {
        append_link(b, "link", outside.path().to_str().unwrap(), false);
        append_file(b, "link/evil", 0o644, b"escaped");
    });

    let td = tempfile::tempdir().unwrap();
    let summary = unpack(&data[..], opts_for(td.path())).unwrap();

    assert_eq!(summary.written, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.warnings.len(), 1);
    assert_eq!(summary.warnings[0].code, WarnCode::EntryError);
    assert_eq!(std::fs::read_dir(outside.path()).unwrap().count(), 0);
}

#[test]
fn unsupported_kinds_are_skipped_with_warning() {
    let data = raw_archive(vec![
        raw_entry("pipe", b'6', b""),
        raw_entry("ok", b'0', b"fine"),
    ]);

    let td = tempfile::tempdir().unwrap();
    let summary = unpack(&data[..], opts_for(td.path())).unwrap();

    assert_eq!(summary.written, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.warnings.len(), 1);
    assert_eq!(summary.warnings[0].code, WarnCode::EntryUnsupported);
    assert!(!td.path().join("pipe").exists());
    assert_eq!(std::fs::read(td.path().join("ok")).unwrap(), b"fine");
}

#[test]
fn strict_mode_turns_warnings_fatal() {
    let data = raw_archive(vec![raw_entry("../escape", b'0', b"x")]);

    let td = tempfile::tempdir().unwrap();
    let mut opts = opts_for(td.path());
    opts.strict = true;
    let error = unpack(&data[..], opts).unwrap_err();
    assert!(matches!(error, UnpackError::Strict(_)));
}

#[test]
fn missing_extraction_root_is_fatal() {
    let td = tempfile::tempdir().unwrap();
    let data = build(|b| append_file(b, "f", 0o644, b"x"));

    let opts = opts_for(&td.path().join("does/not/exist"));
    let error = unpack(&data[..], opts).unwrap_err();
    assert!(matches!(error, UnpackError::Cwd { .. }));
}

#[test]
fn win32_semantics_encode_reserved_characters() {
    let data = build(|b| append_file(b, "dir/a:b", 0o644, b"weird name"));

    let td = tempfile::tempdir().unwrap();
    let mut opts = opts_for(td.path());
    opts.win32 = true;
    let summary = unpack(&data[..], opts).unwrap();
    assert_eq!(summary.written, 1);
    assert_eq!(
        std::fs::read(td.path().join("dir/a\u{f03a}b")).unwrap(),
        b"weird name"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn win32_semantics_still_extract_in_parallel_profile() {
    // win32 also degrades the scheduler to its serial mode; the archive
    // must still come out intact
    let data = build(|b| {
        append_dir(b, "d", 0o755);
        append_file(b, "d/a", 0o644, b"one");
        append_file(b, "d/b", 0o644, b"two");
    });

    let td = tempfile::tempdir().unwrap();
    let mut opts = opts_for(td.path());
    opts.win32 = true;
    let summary = unpack_async(&data[..], opts).await.unwrap();
    assert_eq!(summary.written, 3);
    assert_eq!(std::fs::read(td.path().join("d/a")).unwrap(), b"one");
}

#[tokio::test(flavor = "multi_thread")]
async fn large_payloads_stream_through_workers() {
    let big: Vec<u8> = (0u32..300_000).map(|i| (i % 251) as u8).collect();
    let data = build(|b| {
        append_file(b, "big.bin", 0o644, &big);
        append_file(b, "small.txt", 0o644, b"tail");
    });

    let td = tempfile::tempdir().unwrap();
    let summary = unpack_async(&data[..], opts_for(td.path())).await.unwrap();
    assert_eq!(summary.written, 2);
    assert_eq!(std::fs::read(td.path().join("big.bin")).unwrap(), big);
    assert_eq!(std::fs::read(td.path().join("small.txt")).unwrap(), b"tail");
}

#[tokio::test(flavor = "multi_thread")]
async fn many_entries_extract_concurrently() {
    let data = build(|b| {
        for dir in 0..5 {
            append_dir(b, &format!("d{dir}"), 0o755);
            for file in 0..10 {
                append_file(
                    b,
                    &format!("d{dir}/f{file}"),
                    0o644,
                    format!("{dir}-{file}").as_bytes(),
                );
            }
        }
    });

    let td = tempfile::tempdir().unwrap();
    let summary = unpack_async(&data[..], opts_for(td.path())).await.unwrap();
    assert_eq!(summary.written, 55);
    for dir in 0..5 {
        for file in 0..10 {
            assert_eq!(
                std::fs::read(td.path().join(format!("d{dir}/f{file}"))).unwrap(),
                format!("{dir}-{file}").as_bytes()
            );
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn gnu_long_names_resolve_in_async_parser() {
    let long = format!("{}/{}", "dir".repeat(40), "x".repeat(60));
    let data = build(|b| append_file(b, &long, 0o644, b"long"));

    let td = tempfile::tempdir().unwrap();
    let summary = unpack_async(&data[..], opts_for(td.path())).await.unwrap();
    assert_eq!(summary.written, 1);
    assert_eq!(std::fs::read(td.path().join(&long)).unwrap(), b"long");
}

#[tokio::test(flavor = "multi_thread")]
async fn list_reports_members_without_touching_disk() {
    let data = build(|b| {
        append_dir(b, "d", 0o755);
        append_file(b, "d/f", 0o644, b"content");
        append_link(b, "l", "d/f", false);
    });

    let entries = untar::list(&data[..]).await.unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
    assert_eq!(names, vec!["d", "d/f", "l"]);
    assert_eq!(entries[2].linkpath.as_deref(), Some("d/f"));
}

#[test]
fn idempotent_materialization() {
    let data = build(|b| {
        append_dir(b, "dir", 0o755);
        append_file(b, "dir/a", 0o644, b"hello");
        append_link(b, "dir/s", "a", false);
    });

    let run = || {
        let td = tempfile::tempdir().unwrap();
        unpack(&data[..], opts_for(td.path())).unwrap();
        let mut listing = Vec::new();
        let mut stack = vec![td.path().to_owned()];
        while let Some(dir) = stack.pop() {
            for item in std::fs::read_dir(&dir).unwrap() {
                let item = item.unwrap();
                let meta = std::fs::symlink_metadata(item.path()).unwrap();
                let rel = item
                    .path()
                    .strip_prefix(td.path())
                    .unwrap()
                    .to_string_lossy()
                    .into_owned();
                // directory mtimes get bumped by child creation, so only
                // file times are stable between runs
                let mtime = if meta.is_file() { meta.mtime() } else { 0 };
                listing.push((rel, meta.mode(), mtime));
                if meta.is_dir() {
                    stack.push(item.path());
                }
            }
        }
        listing.sort();
        listing
    };

    assert_eq!(run(), run());
}

#[test]
fn summary_shapes_match_between_profiles() {
    let data = build(|b| {
        append_dir(b, "d", 0o755);
        append_file(b, "d/f", 0o644, b"x");
        append_file(b, "skipme/../nope", 0o644, b"y");
    });

    let (sync_summary, async_summary) = extract_both(&data, &UnpackOptions::default());
    assert_eq!(sync_summary.written, async_summary.written);
    assert_eq!(sync_summary.skipped, async_summary.skipped);
    assert_eq!(sync_summary.warnings.len(), async_summary.warnings.len());
}
