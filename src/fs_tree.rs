//! Walks the local filesystem into the [`tree`] model, deduplicating
//! unchanged files against a previous snapshot's tree by metadata alone
//! (§3.4, §4.7's archiver pipeline).

use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt};

use camino::{Utf8Path, Utf8PathBuf};
use jiff::Timestamp;
use regex::RegexSet;
use tracing::*;

use crate::blob::{Blob, Contents, Kind as BlobKind};
use crate::chunk;
use crate::counters::{self, Op};
use crate::error::{Error, Result};
use crate::hashing::ObjectId;
use crate::repository::{CancellationToken, Repository};
use crate::tree::{Node, Tree, Variant};

/// A compiled set of path-skip patterns (§4.6.1's "skipping paths matched
/// by a caller-supplied list of regexes").
#[derive(Clone, Default)]
pub struct Skip(Option<RegexSet>);

impl Skip {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn compile(patterns: &[String]) -> Result<Self> {
        if patterns.is_empty() {
            return Ok(Self::none());
        }
        let set = RegexSet::new(patterns)
            .map_err(|e| Error::invalid("skip pattern", e))?;
        Ok(Self(Some(set)))
    }

    fn matches(&self, path: &Utf8Path) -> bool {
        self.0.as_ref().is_some_and(|set| set.is_match(path.as_str()))
    }
}

fn epoch_fallback(secs: i64, nanos: i32) -> Timestamp {
    Timestamp::new(secs, nanos).unwrap_or(Timestamp::UNIX_EPOCH)
}

fn times(metadata: &fs::Metadata) -> (Timestamp, Timestamp, Timestamp) {
    (
        epoch_fallback(metadata.atime(), metadata.atime_nsec() as i32),
        epoch_fallback(metadata.mtime(), metadata.mtime_nsec() as i32),
        epoch_fallback(metadata.ctime(), metadata.ctime_nsec() as i32),
    )
}

fn special_variant(file_type: &fs::FileType) -> Variant {
    if file_type.is_block_device() {
        Variant::Dev
    } else if file_type.is_char_device() {
        Variant::Chardev
    } else if file_type.is_fifo() {
        Variant::Fifo
    } else {
        Variant::Socket
    }
}

/// True if `metadata` doesn't match the size and modification time recorded
/// on `previous` -- the same cheap signal restic-style archivers use to
/// skip re-chunking a file that's almost certainly unchanged.
fn file_changed(previous: Option<&Node>, metadata: &fs::Metadata) -> bool {
    let Some(previous) = previous else {
        return true;
    };
    if previous.variant != Variant::File {
        return true;
    }
    if previous.size != Some(metadata.len()) {
        return true;
    }
    let mtime = epoch_fallback(metadata.mtime(), metadata.mtime_nsec() as i32);
    previous.modify_time != mtime
}

fn save_chunked_file(repo: &Repository, path: &Utf8Path) -> Result<Vec<ObjectId>> {
    let chunks = chunk::chunk_file(
        path,
        repo.config.chunk_min_size,
        repo.config.chunk_target_size,
        repo.config.chunk_max_size,
    )?;
    let mut ids = Vec::with_capacity(chunks.len());
    for blob in &chunks {
        repo.save_blob(blob)?;
        ids.push(blob.id);
    }
    Ok(ids)
}

fn save_tree(repo: &Repository, tree: &Tree) -> Result<ObjectId> {
    let bytes = tree.to_canonical_json()?;
    let id = ObjectId::hash(&bytes);
    repo.save_blob(&Blob {
        contents: Contents::Buffer(bytes),
        id,
        kind: BlobKind::Tree,
    })
}

/// Walks one filesystem entry -- file, directory, symlink, or special file
/// -- into a [`Node`]. `previous` is the matching entry (by name) in the
/// parent directory's previous tree, if any, used to skip rehashing
/// unchanged files and to find a previous subtree to diff directories
/// against.
///
/// Per §3.4, a partially unreadable entry is still emitted, with whatever
/// content was gathered and `error` set, rather than failing the whole
/// walk.
pub fn archive_entry(
    repo: &Repository,
    path: &Utf8Path,
    previous: Option<&Node>,
    skip: &Skip,
    cancel: &CancellationToken,
) -> Result<Node> {
    cancel.check()?;

    let name = path
        .file_name()
        .ok_or_else(|| Error::invalid("archive path", format!("{path} has no file name")))?
        .to_string();
    let metadata = fs::symlink_metadata(path)?;
    let (access_time, modify_time, change_time) = times(&metadata);

    let mut node = Node {
        name,
        variant: Variant::File,
        mode: metadata.mode(),
        uid: metadata.uid(),
        gid: metadata.gid(),
        access_time,
        modify_time,
        change_time,
        size: None,
        device_numbers: None,
        link_target: None,
        content: vec![],
        subtree: None,
        xattrs: Default::default(),
        error: None,
    };

    let file_type = metadata.file_type();
    if file_type.is_dir() {
        node.variant = Variant::Dir;
        let previous_subtree = previous.and_then(|n| n.subtree);
        match archive_directory(repo, path, previous_subtree, skip, cancel) {
            Ok(id) => node.subtree = Some(id),
            Err(e) => {
                warn!("{path}: {e}");
                node.error = Some(e.to_string());
            }
        }
    } else if file_type.is_symlink() {
        node.variant = Variant::Symlink;
        match fs::read_link(path) {
            Ok(target) => match Utf8PathBuf::from_path_buf(target) {
                Ok(target) => node.link_target = Some(target),
                Err(raw) => node.error = Some(format!("symlink target isn't UTF-8: {raw:?}")),
            },
            Err(e) => node.error = Some(e.to_string()),
        }
    } else if file_type.is_file() {
        node.variant = Variant::File;
        node.size = Some(metadata.len());
        if !file_changed(previous, &metadata) {
            let previous = previous.expect("file_changed is false only when there's a previous node");
            node.content = previous.content.clone();
            counters::bump(Op::DedupedUnchangedFile);
        } else {
            match save_chunked_file(repo, path) {
                Ok(ids) => node.content = ids,
                Err(e) => {
                    warn!("{path}: {e}");
                    node.error = Some(e.to_string());
                }
            }
        }
    } else {
        node.variant = special_variant(&file_type);
        let rdev = metadata.rdev();
        node.device_numbers = Some((rustix::fs::major(rdev), rustix::fs::minor(rdev)));
    }

    Ok(node)
}

/// Recursively archives a directory's contents, returning the id of the
/// [`Tree`] blob describing it.
pub fn archive_directory(
    repo: &Repository,
    dir: &Utf8Path,
    previous_tree: Option<ObjectId>,
    skip: &Skip,
    cancel: &CancellationToken,
) -> Result<ObjectId> {
    let previous = previous_tree.map(|id| repo.load_tree(id)).transpose()?;

    let mut entries: Vec<Utf8PathBuf> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let path = Utf8PathBuf::from_path_buf(path)
            .map_err(|p| Error::invalid("directory entry", format!("{p:?} isn't UTF-8")))?;
        if skip.matches(&path) {
            debug!("Skipping {path} (matches a skip pattern)");
            continue;
        }
        entries.push(path);
    }
    entries.sort();

    let mut nodes = Vec::with_capacity(entries.len());
    for path in &entries {
        cancel.check()?;
        let name = path.file_name().unwrap_or_default();
        let previous_node = previous.as_ref().and_then(|t| t.get(name));
        nodes.push(archive_entry(repo, path, previous_node, skip, cancel)?);
    }

    let tree = Tree::new(nodes)?;
    save_tree(repo, &tree)
}

/// Archives an arbitrary set of top-level paths into a single root
/// [`Tree`], as if they were all entries of one synthetic directory --
/// letting a snapshot cover several unrelated roots (§3.5's `paths`).
pub fn archive_paths(
    repo: &Repository,
    paths: &[Utf8PathBuf],
    previous_tree: Option<ObjectId>,
    skip: &Skip,
    cancel: &CancellationToken,
) -> Result<ObjectId> {
    let previous = previous_tree.map(|id| repo.load_tree(id)).transpose()?;

    let mut sorted = paths.to_vec();
    sorted.sort();

    let mut nodes = Vec::with_capacity(sorted.len());
    for path in &sorted {
        cancel.check()?;
        let name = path
            .file_name()
            .ok_or_else(|| Error::invalid("archive path", format!("{path} has no file name")))?;
        let previous_node = previous.as_ref().and_then(|t| t.get(name));
        nodes.push(archive_entry(repo, path, previous_node, skip, cancel)?);
    }

    let tree = Tree::new(nodes)?;
    save_tree(repo, &tree)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::repository::Repository;

    #[test]
    fn archives_a_single_file() {
        let repo = Repository::init("mem:", b"geheim", 1).unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();

        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let id = archive_directory(&repo, &root, None, &Skip::none(), &CancellationToken::new()).unwrap();
        repo.flush().unwrap();

        let tree = repo.load_tree(id).unwrap();
        assert_eq!(tree.len(), 1);
        let node = tree.get("a.txt").unwrap();
        assert_eq!(node.variant, Variant::File);
        assert_eq!(node.content.len(), 1);
    }

    #[test]
    fn archives_nested_directories() {
        let repo = Repository::init("mem:", b"geheim", 1).unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("b.txt"), b"nested").unwrap();

        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let id = archive_directory(&repo, &root, None, &Skip::none(), &CancellationToken::new()).unwrap();
        repo.flush().unwrap();

        let tree = repo.load_tree(id).unwrap();
        let sub_node = tree.get("sub").unwrap();
        assert_eq!(sub_node.variant, Variant::Dir);
        let subtree = repo.load_tree(sub_node.subtree.unwrap()).unwrap();
        assert!(subtree.get("b.txt").is_some());
    }

    #[test]
    fn unchanged_file_is_deduped_against_previous_tree() {
        let repo = Repository::init("mem:", b"geheim", 1).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"hello").unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();

        let first = archive_directory(&repo, &root, None, &Skip::none(), &CancellationToken::new()).unwrap();
        repo.flush().unwrap();

        let second =
            archive_directory(&repo, &root, Some(first), &Skip::none(), &CancellationToken::new()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn changed_file_is_rechunked() {
        let repo = Repository::init("mem:", b"geheim", 1).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"hello").unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();

        let first = archive_directory(&repo, &root, None, &Skip::none(), &CancellationToken::new()).unwrap();
        repo.flush().unwrap();

        // mtime must actually move forward for the change to be detected.
        let newer = std::time::SystemTime::now() + std::time::Duration::from_secs(5);
        std::fs::write(&file, b"a longer and different body").unwrap();
        filetime_touch(&file, newer);

        let second =
            archive_directory(&repo, &root, Some(first), &Skip::none(), &CancellationToken::new()).unwrap();
        repo.flush().unwrap();
        assert_ne!(first, second);

        let tree = repo.load_tree(second).unwrap();
        let node = tree.get("a.txt").unwrap();
        let content = repo.load_blob(BlobKind::Chunk, node.content[0]).unwrap();
        assert_eq!(content, b"a longer and different body");
    }

    fn filetime_touch(path: &std::path::Path, when: std::time::SystemTime) {
        let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(when).unwrap();
    }

    #[test]
    fn symlinks_record_their_target() {
        let repo = Repository::init("mem:", b"geheim", 1).unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink("/etc/hostname", dir.path().join("link")).unwrap();

        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let id = archive_directory(&repo, &root, None, &Skip::none(), &CancellationToken::new()).unwrap();
        let tree = repo.load_tree(id).unwrap();
        let node = tree.get("link").unwrap();
        assert_eq!(node.variant, Variant::Symlink);
        assert_eq!(node.link_target.as_deref(), Some(Utf8Path::new("/etc/hostname")));
    }

    #[test]
    fn matching_entries_are_excluded_from_the_tree() {
        let repo = Repository::init("mem:", b"geheim", 1).unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        std::fs::write(dir.path().join("a.log"), b"noisy").unwrap();

        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let skip = Skip::compile(&[r"\.log$".to_string()]).unwrap();
        let id = archive_directory(&repo, &root, None, &skip, &CancellationToken::new()).unwrap();

        let tree = repo.load_tree(id).unwrap();
        assert!(tree.get("a.txt").is_some());
        assert!(tree.get("a.log").is_none());
    }
}
