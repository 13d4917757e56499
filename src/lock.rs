//! Cooperative shared/exclusive locks with staleness detection (§4.7).

use std::thread;
use std::time::Duration;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tracing::*;

use crate::backend::{Backend, Kind};
use crate::error::{Error, Result};
use crate::hashing::ObjectId;
use crate::snapshot::local_identity;

/// How stale a lock has to be (by timestamp alone) before it's ignored.
pub const STALE_AFTER: Duration = Duration::from_secs(30 * 60);
/// How often a held lock's timestamp is refreshed.
pub const REFRESH_EVERY: Duration = Duration::from_secs(5 * 60);
/// The check/write race window: how long to wait after creating a lock
/// before rechecking for conflicts.
const RACE_WINDOW: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockFile {
    pub time: Timestamp,
    pub exclusive: bool,
    pub hostname: String,
    pub username: String,
    pub pid: u32,
}

impl LockFile {
    fn mine(exclusive: bool) -> Self {
        let (hostname, username, _uid, _gid) = local_identity();
        Self {
            time: Timestamp::now(),
            exclusive,
            hostname,
            username,
            pid: std::process::id(),
        }
    }

    pub fn to_canonical_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn id(&self) -> Result<ObjectId> {
        Ok(ObjectId::hash(&self.to_canonical_json()?))
    }

    /// Stale if it's old, or it claims to be ours but that pid is dead
    /// (§4.7).
    fn is_stale(&self, now: Timestamp, our_hostname: &str) -> bool {
        let age_secs = now.as_second() - self.time.as_second();
        if age_secs > STALE_AFTER.as_secs() as i64 {
            return true;
        }
        self.hostname == our_hostname && !process_is_alive(self.pid)
    }
}

#[cfg(target_os = "linux")]
fn process_is_alive(pid: u32) -> bool {
    std::path::Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_is_alive(_pid: u32) -> bool {
    // We can't cheaply check on this platform; erring towards "alive" means
    // we might wait out a dead process's lock rather than stomp a live one.
    true
}

fn list_locks(backend: &dyn Backend) -> Result<Vec<(String, LockFile)>> {
    let mut out = Vec::new();
    for name in backend.list(Kind::Lock)? {
        let bytes = backend.load(Kind::Lock, &name, 0, 0)?;
        match LockFile::from_slice(&bytes) {
            Ok(lock) => out.push((name, lock)),
            Err(e) => warn!("Skipping unreadable lock {}: {}", name, e),
        }
    }
    Ok(out)
}

/// Removes every lock this process can prove is stale. Best-effort: a
/// remove racing someone else's cleanup is not an error.
pub fn clean_stale(backend: &dyn Backend) -> Result<()> {
    let (hostname, _, _, _) = local_identity();
    let now = Timestamp::now();
    for (name, lock) in list_locks(backend)? {
        if lock.is_stale(now, &hostname) {
            debug!("Removing stale lock {}", name);
            match backend.remove(Kind::Lock, &name) {
                Ok(()) | Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
    }
    Ok(())
}

/// A held lock; releases on drop (best-effort -- see `release`).
pub struct Held<'b> {
    backend: &'b dyn Backend,
    name: String,
    pub exclusive: bool,
}

impl<'b> Held<'b> {
    pub fn release(self) -> Result<()> {
        self.backend.remove(Kind::Lock, &self.name)
    }

    /// Rewrites the lock under a new name with an updated timestamp, then
    /// drops the old one (§4.7 step 5).
    pub fn refresh(&mut self) -> Result<()> {
        let fresh = LockFile::mine(self.exclusive);
        let new_name = fresh.id()?.to_string();
        self.backend.create(Kind::Lock, &new_name, &fresh.to_canonical_json()?)?;
        let old_name = std::mem::replace(&mut self.name, new_name);
        self.backend.remove(Kind::Lock, &old_name)?;
        Ok(())
    }
}

/// Acquires a shared or exclusive lock, retrying once across the
/// check/write race window (§4.7 steps 1-4).
pub fn acquire(backend: &dyn Backend, exclusive: bool) -> Result<Held<'_>> {
    clean_stale(backend)?;

    for attempt in 0..2 {
        check_conflicts(backend, exclusive)?;

        let mine = LockFile::mine(exclusive);
        let name = mine.id()?.to_string();
        backend.create(Kind::Lock, &name, &mine.to_canonical_json()?)?;

        thread::sleep(RACE_WINDOW);

        match check_conflicts_ignoring(backend, exclusive, &name) {
            Ok(()) => {
                return Ok(Held {
                    backend,
                    name,
                    exclusive,
                });
            }
            Err(e) => {
                let _ = backend.remove(Kind::Lock, &name);
                if attempt == 1 {
                    return Err(e);
                }
                debug!("Lock race detected, retrying once");
            }
        }
    }
    unreachable!("loop either returns or propagates on its second iteration")
}

fn check_conflicts(backend: &dyn Backend, exclusive: bool) -> Result<()> {
    let (hostname, _, _, _) = local_identity();
    let now = Timestamp::now();
    for (name, lock) in list_locks(backend)? {
        if lock.is_stale(now, &hostname) {
            continue;
        }
        if exclusive || lock.exclusive {
            return Err(Error::Locked(format!(
                "{} holds a{} lock ({})",
                lock.username,
                if lock.exclusive { "n exclusive" } else { " shared" },
                name
            )));
        }
    }
    Ok(())
}

fn check_conflicts_ignoring(backend: &dyn Backend, exclusive: bool, ours: &str) -> Result<()> {
    let (hostname, _, _, _) = local_identity();
    let now = Timestamp::now();
    for (name, lock) in list_locks(backend)? {
        if name == ours || lock.is_stale(now, &hostname) {
            continue;
        }
        if exclusive || lock.exclusive {
            return Err(Error::Locked(format!(
                "{} holds a{} lock ({})",
                lock.username,
                if lock.exclusive { "n exclusive" } else { " shared" },
                name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::memory::MemoryBackend;

    #[test]
    fn shared_locks_coexist() {
        let backend = MemoryBackend::new();
        let l1 = acquire(&backend, false).unwrap();
        let l2 = acquire(&backend, false).unwrap();
        assert!(!l1.exclusive);
        assert!(!l2.exclusive);
    }

    #[test]
    fn exclusive_lock_excludes_shared() {
        let backend = MemoryBackend::new();
        let _ex = acquire(&backend, true).unwrap();
        assert!(matches!(
            acquire(&backend, false).unwrap_err(),
            Error::Locked(_)
        ));
    }

    #[test]
    fn exclusive_excludes_exclusive() {
        let backend = MemoryBackend::new();
        let _ex = acquire(&backend, true).unwrap();
        assert!(matches!(
            acquire(&backend, true).unwrap_err(),
            Error::Locked(_)
        ));
    }

    #[test]
    fn releasing_allows_a_new_exclusive_lock() {
        let backend = MemoryBackend::new();
        let shared = acquire(&backend, false).unwrap();
        shared.release().unwrap();
        let ex = acquire(&backend, true);
        assert!(ex.is_ok());
    }

    #[test]
    fn refresh_replaces_the_lock_object() {
        let backend = MemoryBackend::new();
        let mut held = acquire(&backend, true).unwrap();
        let before = held.name.clone();
        held.refresh().unwrap();
        assert_ne!(before, held.name);
        assert_eq!(backend.list(Kind::Lock).unwrap(), vec![held.name.clone()]);
    }
}
