//! Drives one backup run end to end: lock, diff against the parent
//! snapshot, walk the filesystem, flush packs, persist the index, and
//! finally make the new [`Snapshot`] visible (§4.7).
//!
//! The ordering here is the whole safety argument of §5: nothing a
//! snapshot depends on is allowed to become reachable *after* the
//! snapshot object itself. A crash mid-run leaves orphaned packs and
//! index entries, never a snapshot pointing at data that isn't there.

use camino::Utf8PathBuf;
use tracing::*;

use crate::error::Result;
use crate::fs_tree::{self, Skip};
use crate::lock;
use crate::repository::{CancellationToken, Repository};
use crate::snapshot::{Snapshot, local_identity};

/// What to base deduplication on, and what the resulting snapshot should
/// claim as its ancestor.
pub struct Parent {
    pub snapshot: crate::hashing::ObjectId,
    pub tree: crate::hashing::ObjectId,
}

/// One backup run's parameters.
pub struct Request {
    pub paths: Vec<Utf8PathBuf>,
    pub parent: Option<Parent>,
    pub tags: Vec<String>,
    pub skip: Skip,
}

/// Finds the most recent snapshot whose `paths` exactly match `paths`, to
/// use as the dedup/parent baseline for a new run -- the same selection
/// rule an incremental backup tool's "find my last snapshot of this path
/// set" step uses.
pub fn find_parent(repo: &Repository, paths: &[Utf8PathBuf]) -> Result<Option<Parent>> {
    let mut sorted_paths = paths.to_vec();
    sorted_paths.sort();

    let mut best: Option<(jiff::Timestamp, Parent)> = None;
    for id in repo.list_snapshots()? {
        let snapshot = repo.load_snapshot(id)?;
        let mut snapshot_paths = snapshot.paths.clone();
        snapshot_paths.sort();
        if snapshot_paths != sorted_paths {
            continue;
        }
        if best.as_ref().is_none_or(|(t, _)| snapshot.time > *t) {
            best = Some((
                snapshot.time,
                Parent {
                    snapshot: id,
                    tree: snapshot.tree,
                },
            ));
        }
    }
    Ok(best.map(|(_, p)| p))
}

/// Runs one backup: acquires a shared lock (concurrent backups are fine;
/// only maintenance needs exclusivity), archives `request.paths`, and
/// saves a new snapshot once every pack and index entry it depends on is
/// durable.
pub fn archive(
    repo: &Repository,
    request: &Request,
    cancel: &CancellationToken,
) -> Result<Snapshot> {
    let held = lock::acquire(repo.backend(), false)?;

    let result = (|| -> Result<Snapshot> {
        repo.load_index()?;

        let previous_tree = request.parent.as_ref().map(|p| p.tree);
        let tree = fs_tree::archive_paths(repo, &request.paths, previous_tree, &request.skip, cancel)?;

        cancel.check()?;
        repo.flush()?;
        repo.save_index()?;

        let (hostname, username, uid, gid) = local_identity();
        let snapshot = Snapshot {
            time: jiff::Timestamp::now(),
            parent: request.parent.as_ref().map(|p| p.snapshot),
            tree,
            paths: request.paths.clone(),
            hostname,
            username,
            uid,
            gid,
            tags: request.tags.clone(),
        };
        repo.save_snapshot(&snapshot)?;
        info!(
            "Saved snapshot {} of {} path(s), tree {}",
            snapshot.id()?,
            snapshot.paths.len(),
            snapshot.tree
        );
        Ok(snapshot)
    })();

    // Best-effort: a lock we can't release cleanly isn't worth failing an
    // otherwise-successful backup over, and if the backup itself failed
    // that error takes priority.
    if let Err(e) = held.release() {
        warn!("Couldn't release backup lock: {e}");
    }

    result
}
