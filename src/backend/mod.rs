//! Places where we can make a backup repository: the local filesystem,
//! SFTP, S3-compatible object storage, a generic HTTP REST endpoint, GCS,
//! or (for tests) plain memory.

use std::io::Read;
use std::thread;
use std::time::Duration;

use rand::Rng;
use tracing::*;

use crate::error::{Error, Result};

pub mod fs;
pub mod gcs;
pub mod memory;
pub mod rest;
pub mod s3;
pub mod sftp;

/// The five namespaces a repository's objects live in (§3.2; `Data` covers
/// both data chunks and tree blobs, which never live outside a pack).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Kind {
    Config,
    Key,
    Pack,
    Index,
    Snapshot,
    Lock,
}

impl Kind {
    /// The on-backend namespace prefix (§6.2).
    pub fn namespace(self) -> &'static str {
        match self {
            Kind::Config => "",
            Kind::Key => "keys",
            Kind::Pack => "data",
            Kind::Index => "index",
            Kind::Snapshot => "snapshots",
            Kind::Lock => "locks",
        }
    }
}

/// An object-store abstraction: typed, named, opaque blobs with ranged
/// reads. Every adapter below conforms to this trait; none of them owns
/// retry policy, which lives in [`Retrying`] instead.
pub trait Backend: Send + Sync {
    /// Write-once: fails with [`Error::AlreadyExists`] if `name` already
    /// exists in `kind`'s namespace.
    fn create(&self, kind: Kind, name: &str, bytes: &[u8]) -> Result<()>;

    /// Ranged read. `length` of 0 means "read to end". Fails with
    /// [`Error::NotFound`] if the object doesn't exist.
    fn load(&self, kind: Kind, name: &str, offset: u64, length: u64) -> Result<Vec<u8>>;

    /// The object's total size in bytes.
    fn stat(&self, kind: Kind, name: &str) -> Result<u64>;

    fn test(&self, kind: Kind, name: &str) -> Result<bool>;

    fn remove(&self, kind: Kind, name: &str) -> Result<()>;

    /// Names in `kind`'s namespace, in sorted order, with no duplicates.
    fn list(&self, kind: Kind) -> Result<Vec<String>>;

    /// Erases the entire repository. Only ever invoked by explicit, opt-in
    /// administrative commands, never by the core.
    fn delete(&self) -> Result<()>;

    /// A human-readable handle for logging/error context (a URL or path).
    fn location(&self) -> String;

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Decorates any [`Backend`] with bounded, jittered exponential backoff on
/// transient errors, so individual adapters can stay focused on their
/// transport (§4.1, §7).
pub struct Retrying<B> {
    inner: B,
    max_attempts: u32,
    base_delay: Duration,
}

impl<B: Backend> Retrying<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
        }
    }

    fn call<T>(&self, op: &str, mut f: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempt = 0;
        loop {
            match f() {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt + 1 < self.max_attempts => {
                    let backoff = self.base_delay * 2u32.pow(attempt);
                    let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 2);
                    let delay = backoff + Duration::from_millis(jitter);
                    warn!(
                        "{} failed ({}), retrying in {:?} (attempt {}/{})",
                        op,
                        e,
                        delay,
                        attempt + 1,
                        self.max_attempts
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl<B: Backend> Backend for Retrying<B> {
    fn create(&self, kind: Kind, name: &str, bytes: &[u8]) -> Result<()> {
        self.call("create", || self.inner.create(kind, name, bytes))
    }

    fn load(&self, kind: Kind, name: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        self.call("load", || self.inner.load(kind, name, offset, length))
    }

    fn stat(&self, kind: Kind, name: &str) -> Result<u64> {
        self.call("stat", || self.inner.stat(kind, name))
    }

    fn test(&self, kind: Kind, name: &str) -> Result<bool> {
        self.call("test", || self.inner.test(kind, name))
    }

    fn remove(&self, kind: Kind, name: &str) -> Result<()> {
        self.call("remove", || self.inner.remove(kind, name))
    }

    fn list(&self, kind: Kind) -> Result<Vec<String>> {
        self.call("list", || self.inner.list(kind))
    }

    fn delete(&self) -> Result<()> {
        self.inner.delete()
    }

    fn location(&self) -> String {
        self.inner.location()
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}

/// Parses a repository location string into the backend it names (§6.1).
pub fn open(location: &str) -> Result<Box<dyn Backend>> {
    if let Some(path) = location.strip_prefix("local:") {
        return Ok(Box::new(Retrying::new(fs::FilesystemBackend::open(path)?)));
    }
    if location == "mem:" {
        return Ok(Box::new(Retrying::new(memory::MemoryBackend::new())));
    }
    if let Some(rest) = location.strip_prefix("sftp://").or(location.strip_prefix("sftp:")) {
        return Ok(Box::new(Retrying::new(sftp::SftpBackend::connect(rest)?)));
    }
    if let Some(rest) = location.strip_prefix("s3:") {
        return Ok(Box::new(Retrying::new(s3::S3Backend::new(rest)?)));
    }
    if let Some(rest) = location.strip_prefix("rest:") {
        return Ok(Box::new(Retrying::new(rest::RestBackend::new(rest)?)));
    }
    if let Some(rest) = location.strip_prefix("gs://").or(location.strip_prefix("gs:")) {
        return Ok(Box::new(Retrying::new(gcs::GcsBackend::new(rest)?)));
    }
    // A bare path is a local directory.
    Ok(Box::new(Retrying::new(fs::FilesystemBackend::open(
        location,
    )?)))
}

/// Like [`open`], but creates a fresh, empty repository rather than
/// attaching to an existing one. Only `fs` and `sftp` need a distinct
/// creation step (they build a directory tree up front); the
/// object-storage backends create objects lazily on first `create()`, so
/// `new` doubles as both for them.
pub fn open_for_init(location: &str) -> Result<Box<dyn Backend>> {
    if let Some(path) = location.strip_prefix("local:") {
        return Ok(Box::new(Retrying::new(fs::FilesystemBackend::initialize(path)?)));
    }
    if location == "mem:" {
        return Ok(Box::new(Retrying::new(memory::MemoryBackend::new())));
    }
    if let Some(rest) = location.strip_prefix("sftp://").or(location.strip_prefix("sftp:")) {
        return Ok(Box::new(Retrying::new(sftp::SftpBackend::initialize(rest)?)));
    }
    if let Some(rest) = location.strip_prefix("s3:") {
        return Ok(Box::new(Retrying::new(s3::S3Backend::new(rest)?)));
    }
    if let Some(rest) = location.strip_prefix("rest:") {
        return Ok(Box::new(Retrying::new(rest::RestBackend::new(rest)?)));
    }
    if let Some(rest) = location.strip_prefix("gs://").or(location.strip_prefix("gs:")) {
        return Ok(Box::new(Retrying::new(gcs::GcsBackend::new(rest)?)));
    }
    Ok(Box::new(Retrying::new(fs::FilesystemBackend::initialize(
        location,
    )?)))
}

/// Reads an entire object (no range) from a [`Read`]er-producing call site.
pub fn read_to_vec<R: Read>(mut r: R, size_hint: u64) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(size_hint as usize);
    r.read_to_end(&mut buf)?;
    Ok(buf)
}

/// Shards pack (`Kind::Pack`) object names by their first hex byte, as the
/// filesystem and SFTP backends do, to keep directory fanout bounded
/// (§4.1).
pub fn shard(kind: Kind, name: &str) -> String {
    match kind {
        Kind::Pack if name.len() >= 2 => format!("{}/{}/{}", kind.namespace(), &name[..2], name),
        _ if kind.namespace().is_empty() => name.to_string(),
        _ => format!("{}/{}", kind.namespace(), name),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn shard_places_packs_in_byte_buckets() {
        assert_eq!(
            shard(Kind::Pack, "abcd1234"),
            "data/ab/abcd1234"
        );
        assert_eq!(shard(Kind::Snapshot, "abcd1234"), "snapshots/abcd1234");
        assert_eq!(shard(Kind::Config, "config"), "config");
    }
}
