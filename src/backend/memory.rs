//! A backend that stores everything as name-addressed buffers. Great for
//! tests; not durable past the process exiting.

use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{Backend, Kind};
use crate::error::{Error, Result};

#[derive(Default)]
pub struct MemoryBackend {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for MemoryBackend {
    fn create(&self, kind: Kind, name: &str, bytes: &[u8]) -> Result<()> {
        let key = super::shard(kind, name);
        let mut files = self.files.lock().unwrap();
        if files.contains_key(&key) {
            return Err(Error::AlreadyExists(key));
        }
        files.insert(key, bytes.to_vec());
        Ok(())
    }

    fn load(&self, kind: Kind, name: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        let key = super::shard(kind, name);
        let files = self.files.lock().unwrap();
        let buf = files.get(&key).ok_or_else(|| Error::NotFound(key.clone()))?;

        let offset = offset as usize;
        if offset > buf.len() {
            return Err(Error::invalid(
                "range",
                format!("offset {offset} past end of {key} ({} bytes)", buf.len()),
            ));
        }
        let end = if length == 0 {
            buf.len()
        } else {
            (offset + length as usize).min(buf.len())
        };
        Ok(buf[offset..end].to_vec())
    }

    fn stat(&self, kind: Kind, name: &str) -> Result<u64> {
        let key = super::shard(kind, name);
        let files = self.files.lock().unwrap();
        files
            .get(&key)
            .map(|b| b.len() as u64)
            .ok_or(Error::NotFound(key))
    }

    fn test(&self, kind: Kind, name: &str) -> Result<bool> {
        let key = super::shard(kind, name);
        Ok(self.files.lock().unwrap().contains_key(&key))
    }

    fn remove(&self, kind: Kind, name: &str) -> Result<()> {
        let key = super::shard(kind, name);
        self.files
            .lock()
            .unwrap()
            .remove(&key)
            .map(|_| ())
            .ok_or(Error::NotFound(key))
    }

    fn list(&self, kind: Kind) -> Result<Vec<String>> {
        let prefix = if kind.namespace().is_empty() {
            String::new()
        } else {
            format!("{}/", kind.namespace())
        };
        let files = self.files.lock().unwrap();
        Ok(files
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .map(|k| k.rsplit('/').next().unwrap().to_string())
            .collect())
    }

    fn delete(&self) -> Result<()> {
        self.files.lock().unwrap().clear();
        Ok(())
    }

    fn location(&self) -> String {
        "mem:".to_string()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn create_then_load_round_trips() {
        let backend = MemoryBackend::new();
        backend.create(Kind::Snapshot, "abc", b"hello").unwrap();
        assert_eq!(backend.load(Kind::Snapshot, "abc", 0, 0).unwrap(), b"hello");
    }

    #[test]
    fn create_twice_fails() {
        let backend = MemoryBackend::new();
        backend.create(Kind::Snapshot, "abc", b"hello").unwrap();
        assert!(backend.create(Kind::Snapshot, "abc", b"world").is_err());
    }

    #[test]
    fn list_is_sorted_and_scoped_to_kind() {
        let backend = MemoryBackend::new();
        backend.create(Kind::Snapshot, "bbb", b"1").unwrap();
        backend.create(Kind::Snapshot, "aaa", b"2").unwrap();
        backend.create(Kind::Lock, "zzz", b"3").unwrap();

        let mut names = backend.list(Kind::Snapshot).unwrap();
        names.sort();
        assert_eq!(names, vec!["aaa", "bbb"]);
    }

    #[test]
    fn ranged_load() {
        let backend = MemoryBackend::new();
        backend.create(Kind::Pack, "abc", b"0123456789").unwrap();
        assert_eq!(backend.load(Kind::Pack, "abc", 2, 3).unwrap(), b"234");
    }

    #[test]
    fn remove_then_load_is_not_found() {
        let backend = MemoryBackend::new();
        backend.create(Kind::Lock, "abc", b"1").unwrap();
        backend.remove(Kind::Lock, "abc").unwrap();
        assert!(matches!(
            backend.load(Kind::Lock, "abc", 0, 0).unwrap_err(),
            Error::NotFound(_)
        ));
    }
}
