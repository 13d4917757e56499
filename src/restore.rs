//! Reconstructs a snapshot's directory tree on the local filesystem (§2).
//!
//! The walk is the mirror image of the archiver's: a snapshot's root tree
//! is loaded, then for each entry either a subtree is recursed into or a
//! file's ordered chunk ids are resolved through the index, fetched,
//! decrypted, and concatenated. Producing correct bytes and directory
//! structure is the part every backend supports; restoring mode, owner,
//! and extended attributes is inherently platform-specific, so those are
//! applied best-effort on Unix and never turn a restore into a failure.

use std::io::Write;

use camino::Utf8Path;
use tracing::*;

use crate::blob::Kind as BlobKind;
use crate::error::{Error, Result};
use crate::hashing::ObjectId;
use crate::repository::{CancellationToken, Repository};
use crate::snapshot::Snapshot;
use crate::tree::{Node, Variant};

/// Restores an entire snapshot under `destination`.
pub fn restore_snapshot(
    repo: &Repository,
    snapshot: &Snapshot,
    destination: &Utf8Path,
    cancel: &CancellationToken,
) -> Result<()> {
    restore_tree(repo, snapshot.tree, destination, cancel)
}

/// Restores `tree_id` (and everything beneath it) under `destination`,
/// which is created if it doesn't already exist.
pub fn restore_tree(
    repo: &Repository,
    tree_id: ObjectId,
    destination: &Utf8Path,
    cancel: &CancellationToken,
) -> Result<()> {
    std::fs::create_dir_all(destination)?;
    let tree = repo.load_tree(tree_id)?;
    for node in tree.nodes() {
        cancel.check()?;
        restore_node(repo, node, destination, cancel)?;
    }
    Ok(())
}

fn restore_node(
    repo: &Repository,
    node: &Node,
    parent: &Utf8Path,
    cancel: &CancellationToken,
) -> Result<()> {
    let path = parent.join(&node.name);
    if let Some(err) = &node.error {
        warn!("{path} was only partially archived: {err}");
    }

    match node.variant {
        Variant::Dir => {
            let subtree = node.subtree.ok_or_else(|| {
                Error::Corrupted(
                    path.to_string(),
                    "directory node has no subtree id".to_string(),
                )
            })?;
            restore_tree(repo, subtree, &path, cancel)?;
        }
        Variant::File => restore_file(repo, node, &path)?,
        Variant::Symlink => restore_symlink(node, &path)?,
        Variant::Dev | Variant::Chardev | Variant::Fifo | Variant::Socket => {
            restore_special(node, &path)
        }
    }

    apply_metadata(node, &path);
    Ok(())
}

/// Concatenates a file node's chunks in order, per §3.4's "the ordered list
/// of data-chunk ids making up its content".
fn restore_file(repo: &Repository, node: &Node, path: &Utf8Path) -> Result<()> {
    let mut file = std::fs::File::create(path)?;
    for chunk_id in &node.content {
        let bytes = read_chunk(repo, *chunk_id)?;
        file.write_all(&bytes)?;
    }
    Ok(())
}

/// Fetches and decrypts one data chunk. A thin, single-purpose wrapper over
/// [`Repository::load_blob`] -- restore never needs the streaming,
/// sequential-scan machinery a from-scratch pack reader would.
fn read_chunk(repo: &Repository, id: ObjectId) -> Result<Vec<u8>> {
    repo.load_blob(BlobKind::Chunk, id)
}

#[cfg(unix)]
fn restore_symlink(node: &Node, path: &Utf8Path) -> Result<()> {
    let target = node.link_target.as_ref().ok_or_else(|| {
        Error::Corrupted(
            path.to_string(),
            "symlink node has no link target".to_string(),
        )
    })?;
    std::os::unix::fs::symlink(target, path)?;
    Ok(())
}

#[cfg(not(unix))]
fn restore_symlink(_node: &Node, path: &Utf8Path) -> Result<()> {
    Err(Error::invalid(
        "restore",
        format!("{path}: symlinks aren't supported on this platform"),
    ))
}

/// Recreates a device, fifo, or socket node. Requires privileges most
/// restore runs won't have, so failures are logged rather than propagated
/// -- losing one special file shouldn't sink the rest of the restore.
#[cfg(unix)]
fn restore_special(node: &Node, path: &Utf8Path) {
    use rustix::fs::{CWD, FileType, Mode, mknodat};

    let file_type = match node.variant {
        Variant::Dev => FileType::BlockDevice,
        Variant::Chardev => FileType::CharacterDevice,
        Variant::Fifo => FileType::Fifo,
        Variant::Socket => FileType::Socket,
        _ => return,
    };
    let dev = node
        .device_numbers
        .map(|(major, minor)| rustix::fs::makedev(major, minor))
        .unwrap_or(0);

    if let Err(e) = mknodat(CWD, path.as_std_path(), file_type, Mode::from_raw_mode(node.mode), dev)
    {
        warn!("{path}: couldn't recreate {:?} node: {e}", node.variant);
    }
}

#[cfg(not(unix))]
fn restore_special(node: &Node, path: &Utf8Path) {
    warn!(
        "{path}: {:?} nodes aren't restorable on this platform, skipping",
        node.variant
    );
}

/// Best-effort restoration of mode/owner/timestamps. Never fails the
/// restore outright -- a destination filesystem that doesn't support, say,
/// arbitrary `chown` (no root) just gets a warning.
#[cfg(unix)]
fn apply_metadata(node: &Node, path: &Utf8Path) {
    use rustix::fs::{AtFlags, Mode, Timespec, Timestamps, chmod, chownat, utimensat};
    use rustix::process::{Gid, Uid};

    if !matches!(node.variant, Variant::Symlink) {
        if let Err(e) = chmod(path.as_std_path(), Mode::from_raw_mode(node.mode)) {
            warn!("{path}: couldn't set mode: {e}");
        }
    }

    if let Err(e) = chownat(
        CWD_DIR,
        path.as_std_path(),
        Some(Uid::from_raw(node.uid)),
        Some(Gid::from_raw(node.gid)),
        AtFlags::SYMLINK_NOFOLLOW,
    ) {
        debug!("{path}: couldn't set owner (probably not running as root): {e}");
    }

    let to_timespec = |t: jiff::Timestamp| Timespec {
        tv_sec: t.as_second(),
        tv_nsec: t.subsec_nanosecond() as _,
    };
    let times = Timestamps {
        last_access: to_timespec(node.access_time),
        last_modification: to_timespec(node.modify_time),
    };
    if let Err(e) = utimensat(CWD_DIR, path.as_std_path(), &times, AtFlags::SYMLINK_NOFOLLOW) {
        warn!("{path}: couldn't set timestamps: {e}");
    }
}

#[cfg(unix)]
use rustix::fs::CWD as CWD_DIR;

#[cfg(not(unix))]
fn apply_metadata(_node: &Node, _path: &Utf8Path) {}
