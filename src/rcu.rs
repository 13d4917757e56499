//! A read-copy-update cell: wait-free reads of an immutable snapshot, with
//! writers serialized behind a small mutex that only ever guards the
//! read-modify-write of the pointer itself, never the data.
//!
//! This is what backs the in-memory [index](crate::index::Index): many
//! worker threads look blobs up concurrently while, at most, one packer at
//! a time inserts a freshly sealed pack's entries (§4.4, §5).

use std::sync::Arc;
use std::sync::Mutex;

use crossbeam_epoch::{self as epoch, Atomic, Owned};

pub struct Rcu<T> {
    current: Atomic<Arc<T>>,
    write_lock: Mutex<()>,
}

impl<T> Rcu<T> {
    pub fn new(value: T) -> Self {
        Self {
            current: Atomic::new(Arc::new(value)),
            write_lock: Mutex::new(()),
        }
    }

    /// A wait-free snapshot of the current value. Cloning an `Arc` is a
    /// refcount bump, so this never blocks on a writer.
    pub fn load(&self) -> Arc<T> {
        let guard = epoch::pin();
        let shared = self.current.load(epoch::Ordering::Acquire, &guard);
        // Safety: `current` is only ever installed by `store`/`update` below,
        // always pointing at a live `Arc<T>` until it's unlinked and retired
        // via `defer_destroy`, which only happens after this guard's epoch
        // has been observed to have passed.
        let arc: &Arc<T> = unsafe { shared.deref() };
        Arc::clone(arc)
    }

    /// Replaces the current value outright.
    pub fn store(&self, value: T) {
        let _write_guard = self.write_lock.lock().unwrap();
        let guard = epoch::pin();
        let new = Owned::new(Arc::new(value));
        let old = self.current.swap(new, epoch::Ordering::AcqRel, &guard);
        unsafe {
            guard.defer_destroy(old);
        }
    }

    /// Reads the current value, derives a new one from it via `f`, and
    /// installs the result. Serialized against other writers by
    /// `write_lock`; readers are never blocked.
    pub fn update(&self, f: impl FnOnce(&T) -> T) {
        let _write_guard = self.write_lock.lock().unwrap();
        let guard = epoch::pin();
        let shared = self.current.load(epoch::Ordering::Acquire, &guard);
        let current: &Arc<T> = unsafe { shared.deref() };
        let next = f(current);
        let new = Owned::new(Arc::new(next));
        let old = self.current.swap(new, epoch::Ordering::AcqRel, &guard);
        unsafe {
            guard.defer_destroy(old);
        }
    }
}

impl<T> Drop for Rcu<T> {
    fn drop(&mut self) {
        let guard = epoch::pin();
        let old = self.current.swap(Owned::null(), epoch::Ordering::AcqRel, &guard);
        if !old.is_null() {
            unsafe {
                guard.defer_destroy(old);
            }
        }
    }
}
