//! A backend that stores objects as files under a directory tree, sharded
//! the same way the on-backend layout describes (§6.2).

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::*;

use super::{Backend, Kind};
use crate::error::{Error, Result};
use crate::file_util;

pub struct FilesystemBackend {
    base_directory: PathBuf,
}

impl FilesystemBackend {
    /// Creates a fresh, empty repository directory tree.
    pub fn initialize(repository: &str) -> Result<Self> {
        let base = Path::new(repository);
        if base.exists() {
            return Err(Error::AlreadyExists(repository.to_string()));
        }

        fs::create_dir_all(base)?;
        for ns in ["keys", "index", "snapshots", "locks", "tmp"] {
            fs::create_dir(base.join(ns))?;
        }
        let data = base.join("data");
        fs::create_dir(&data)?;
        for b in 0..=255u8 {
            fs::create_dir(data.join(format!("{b:02x}")))?;
        }

        Ok(Self {
            base_directory: base.to_path_buf(),
        })
    }

    pub fn open(repository: &str) -> Result<Self> {
        let base_directory = PathBuf::from(repository);
        if !base_directory.exists() {
            return Err(Error::NotFound(repository.to_string()));
        }
        Ok(Self { base_directory })
    }

    fn path_for(&self, kind: Kind, name: &str) -> PathBuf {
        self.base_directory.join(super::shard(kind, name))
    }
}

impl Backend for FilesystemBackend {
    fn create(&self, kind: Kind, name: &str, bytes: &[u8]) -> Result<()> {
        let to = self.path_for(kind, name);
        if to.exists() {
            return Err(Error::AlreadyExists(to.display().to_string()));
        }

        let tmp_dir = self.base_directory.join("tmp");
        let tmp = tmp_dir.join(format!("{name}.tmp-{}", std::process::id()));
        fs::write(&tmp, bytes)?;

        match fs::rename(&tmp, &to) {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                Err(e.into())
            }
        }
    }

    fn load(&self, kind: Kind, name: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        let path = self.path_for(kind, name);
        let mut fh = File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(path.display().to_string())
            } else {
                e.into()
            }
        })?;

        if offset > 0 {
            fh.seek(SeekFrom::Start(offset))?;
        }

        let mut buf = if length == 0 {
            Vec::new()
        } else {
            Vec::with_capacity(length as usize)
        };
        if length == 0 {
            fh.read_to_end(&mut buf)?;
        } else {
            let mut limited = fh.take(length);
            limited.read_to_end(&mut buf)?;
        }
        Ok(buf)
    }

    fn stat(&self, kind: Kind, name: &str) -> Result<u64> {
        let path = self.path_for(kind, name);
        Ok(fs::metadata(&path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::NotFound(path.display().to_string())
                } else {
                    e.into()
                }
            })?
            .len())
    }

    fn test(&self, kind: Kind, name: &str) -> Result<bool> {
        Ok(self.path_for(kind, name).exists())
    }

    fn remove(&self, kind: Kind, name: &str) -> Result<()> {
        let path = self.path_for(kind, name);
        fs::remove_file(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(path.display().to_string())
            } else {
                e.into()
            }
        })
    }

    fn list(&self, kind: Kind) -> Result<Vec<String>> {
        let dir = self.base_directory.join(kind.namespace());
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        if kind == Kind::Pack {
            for b in 0..=255u8 {
                let bucket = dir.join(format!("{b:02x}"));
                if let Ok(entries) = fs::read_dir(&bucket) {
                    for entry in entries {
                        let entry = entry?;
                        if let Some(name) = entry.file_name().to_str() {
                            names.push(name.to_string());
                        }
                    }
                }
            }
        } else {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn delete(&self) -> Result<()> {
        warn!(
            "Deleting entire repository at {}",
            self.base_directory.display()
        );
        fs::remove_dir_all(&self.base_directory)?;
        Ok(())
    }

    fn location(&self) -> String {
        self.base_directory.display().to_string()
    }
}

/// Writes `bytes` to `to` via a temp-file-then-rename, matching the
/// crash-safe discipline [`file_util::safe_copy_to_file`] uses elsewhere.
#[allow(dead_code)]
fn write_atomically(to: &Path, bytes: &[u8]) -> Result<()> {
    file_util::safe_copy_to_file(
        std::io::Cursor::new(bytes.to_vec()),
        camino::Utf8Path::from_path(to).expect("repository paths are UTF-8"),
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn create_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        let backend = FilesystemBackend::initialize(repo.to_str().unwrap()).unwrap();

        backend.create(Kind::Snapshot, "deadbeef", b"hello").unwrap();
        assert_eq!(
            backend.load(Kind::Snapshot, "deadbeef", 0, 0).unwrap(),
            b"hello"
        );
        assert_eq!(backend.stat(Kind::Snapshot, "deadbeef").unwrap(), 5);
    }

    #[test]
    fn create_twice_is_already_exists() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        let backend = FilesystemBackend::initialize(repo.to_str().unwrap()).unwrap();

        backend.create(Kind::Snapshot, "deadbeef", b"hello").unwrap();
        let err = backend
            .create(Kind::Snapshot, "deadbeef", b"world")
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[test]
    fn missing_load_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        let backend = FilesystemBackend::initialize(repo.to_str().unwrap()).unwrap();

        let err = backend.load(Kind::Snapshot, "nope", 0, 0).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn packs_are_sharded_by_first_byte() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        let backend = FilesystemBackend::initialize(repo.to_str().unwrap()).unwrap();

        backend.create(Kind::Pack, "abcd0000", b"pack").unwrap();
        assert!(repo.join("data/ab/abcd0000").exists());
        assert_eq!(backend.list(Kind::Pack).unwrap(), vec!["abcd0000"]);
    }

    #[test]
    fn ranged_load_returns_the_slice() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        let backend = FilesystemBackend::initialize(repo.to_str().unwrap()).unwrap();

        backend
            .create(Kind::Pack, "abcd0000", b"0123456789")
            .unwrap();
        assert_eq!(backend.load(Kind::Pack, "abcd0000", 2, 3).unwrap(), b"234");
    }
}
