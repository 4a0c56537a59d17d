//! The per-dataset reentrant readers-writer lock (component C2, lock half).
//!
//! Built on [`parking_lot`]'s raw lock primitive, the same building block the
//! `stateful` proxies use (`proxy::BatchReadProxy`/`BatchWriteProxy`), but adds the
//! reentrancy and forbidden-upgrade bookkeeping spec §4.2 and §5 require: a thread
//! that already holds this lock (in either mode) may acquire it again without
//! touching the OS primitive, acquiring a write lock while holding only a read lock
//! is a programming error, and release only drops the real lock at nesting depth 0.
//!
//! Thread-local state is keyed by the lock's identity (a process-unique `u64`
//! assigned at construction), not by address, so it remains valid even if the lock
//! is moved behind an `Arc`.

use std::{
    cell::RefCell,
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::lock_api::RawRwLock as _;
use parking_lot::RawRwLock;

use crate::error::{Error, Result};

static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, PartialEq, Eq)]
enum HeldKind {
    Read,
    Write,
}

struct ThreadState {
    kind: HeldKind,
    depth: u32,
}

thread_local! {
    static HELD: RefCell<HashMap<u64, ThreadState>> = RefCell::new(HashMap::new());
}

/// A reentrant readers-writer lock guarding a single dataset.
pub struct DatasetLock {
    id: u64,
    raw: RawRwLock,
}

impl Default for DatasetLock {
    fn default() -> Self {
        Self::new()
    }
}

impl DatasetLock {
    #[must_use]
    pub fn new() -> Self {
        DatasetLock {
            id: NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed),
            raw: RawRwLock::INIT,
        }
    }

    /// Acquires a read lock, blocking if a writer currently holds it. Reentrant: a
    /// thread already holding this lock in any mode just bumps its depth.
    pub fn acquire_read(&self) {
        let reentrant = HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(state) = held.get_mut(&self.id) {
                state.depth += 1;
                true
            } else {
                false
            }
        });
        if reentrant {
            return;
        }
        self.raw.lock_shared();
        HELD.with(|held| {
            held.borrow_mut().insert(
                self.id,
                ThreadState {
                    kind: HeldKind::Read,
                    depth: 1,
                },
            );
        });
    }

    /// Acquires a write lock, blocking if another thread holds it in any mode.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockUpgradeForbidden`] if the current thread already holds
    /// only a read lock: upgrading is a programming error, not a blocking wait.
    pub fn acquire_write(&self) -> Result<()> {
        let outcome = HELD.with(|held| {
            let mut held = held.borrow_mut();
            match held.get_mut(&self.id) {
                Some(state) if state.kind == HeldKind::Write => {
                    state.depth += 1;
                    Ok(true)
                }
                Some(_) => {
                    tracing::trace!(
                        "lock {} upgrade from read to write forbidden for current thread",
                        self.id
                    );
                    Err(Error::LockUpgradeForbidden)
                }
                None => Ok(false),
            }
        });
        match outcome? {
            true => Ok(()),
            false => {
                self.raw.lock_exclusive();
                tracing::trace!("lock {} acquired exclusively", self.id);
                HELD.with(|held| {
                    held.borrow_mut().insert(
                        self.id,
                        ThreadState {
                            kind: HeldKind::Write,
                            depth: 1,
                        },
                    );
                });
                Ok(())
            }
        }
    }

    /// Releases one level of read-lock nesting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockUnmatchedUnlock`] if the current thread does not hold
    /// this lock.
    pub fn release_read(&self) -> Result<()> {
        self.release(HeldKind::Read)
    }

    /// Releases one level of write-lock nesting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockUnmatchedUnlock`] if the current thread does not hold
    /// the write lock.
    pub fn release_write(&self) -> Result<()> {
        self.release(HeldKind::Write)
    }

    fn release(&self, expected: HeldKind) -> Result<()> {
        let drop_real = HELD.with(|held| {
            let mut held = held.borrow_mut();
            let Some(state) = held.get_mut(&self.id) else {
                return Err(Error::LockUnmatchedUnlock);
            };
            if expected == HeldKind::Write && state.kind != HeldKind::Write {
                return Err(Error::LockUnmatchedUnlock);
            }
            state.depth -= 1;
            if state.depth == 0 {
                let kind = state.kind;
                held.remove(&self.id);
                Ok(Some(kind))
            } else {
                Ok(None)
            }
        })?;
        if let Some(kind) = drop_real {
            match kind {
                HeldKind::Read => {
                    // SAFETY: the thread-local bookkeeping above guarantees the real
                    // shared lock is held exactly once at this point.
                    unsafe { self.raw.unlock_shared() };
                }
                HeldKind::Write => {
                    // SAFETY: same as above, for the exclusive lock.
                    unsafe { self.raw.unlock_exclusive() };
                }
            }
        }
        Ok(())
    }

    /// Whether the current thread holds this lock in any mode, without blocking.
    #[must_use]
    pub fn has_read_lock(&self) -> bool {
        HELD.with(|held| held.borrow().contains_key(&self.id))
    }

    /// Whether the current thread holds the write lock, without blocking.
    #[must_use]
    pub fn has_write_lock(&self) -> bool {
        HELD.with(|held| {
            held.borrow()
                .get(&self.id)
                .is_some_and(|state| state.kind == HeldKind::Write)
        })
    }

    /// Runs `f` under a read lock, guaranteeing release on every exit path.
    ///
    /// # Errors
    ///
    /// Propagates any error `f` returns; the lock is still released.
    pub fn with_read_lock<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.acquire_read();
        let result = f();
        self.release_read()?;
        result
    }

    /// Runs `f` under a write lock, guaranteeing release on every exit path.
    ///
    /// # Errors
    ///
    /// Propagates [`Error::LockUpgradeForbidden`] if upgrading was attempted, or any
    /// error `f` returns; the lock is released in both cases.
    pub fn with_write_lock<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.acquire_write()?;
        let result = f();
        self.release_write()?;
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Barrier,
    };

    use super::*;

    #[test]
    fn reentrant_write_lock_balances() {
        let lock = DatasetLock::new();
        lock.acquire_write().unwrap();
        lock.acquire_write().unwrap();
        assert!(lock.has_write_lock());
        lock.release_write().unwrap();
        assert!(lock.has_write_lock());
        lock.release_write().unwrap();
        assert!(!lock.has_write_lock());
        assert!(!lock.has_read_lock());
    }

    #[test]
    fn write_holder_may_nest_read() {
        let lock = DatasetLock::new();
        lock.acquire_write().unwrap();
        lock.acquire_read();
        assert!(lock.has_write_lock());
        lock.release_read().unwrap();
        assert!(lock.has_write_lock());
        lock.release_write().unwrap();
    }

    #[test]
    fn upgrade_from_read_is_forbidden() {
        let lock = DatasetLock::new();
        lock.acquire_read();
        let err = lock.acquire_write().unwrap_err();
        assert!(matches!(err, Error::LockUpgradeForbidden));
        lock.release_read().unwrap();
    }

    #[test]
    fn unmatched_unlock_errors() {
        let lock = DatasetLock::new();
        assert!(matches!(
            lock.release_read().unwrap_err(),
            Error::LockUnmatchedUnlock
        ));
    }

    #[test]
    fn concurrent_readers_then_blocking_writer() {
        let lock = Arc::new(DatasetLock::new());
        let observed = Arc::new(AtomicBool::new(false));
        let barrier = Arc::new(Barrier::new(2));

        lock.acquire_read();

        let lock2 = Arc::clone(&lock);
        let observed2 = Arc::clone(&observed);
        let barrier2 = Arc::clone(&barrier);
        let writer = std::thread::spawn(move || {
            barrier2.wait();
            lock2.acquire_write().unwrap();
            observed2.store(true, Ordering::SeqCst);
            lock2.release_write().unwrap();
        });

        barrier.wait();
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!observed.load(Ordering::SeqCst));
        lock.release_read().unwrap();

        writer.join().unwrap();
        assert!(observed.load(Ordering::SeqCst));
    }

    #[test]
    fn random_single_thread_nesting_always_balances() {
        use rand::Rng;

        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let lock = DatasetLock::new();
            let mut depth: i32 = 0;
            let steps = rng.gen_range(1..20);
            for _ in 0..steps {
                if depth == 0 || rng.gen_bool(0.5) {
                    lock.acquire_read();
                    depth += 1;
                } else {
                    lock.release_read().unwrap();
                    depth -= 1;
                }
            }
            for _ in 0..depth {
                lock.release_read().unwrap();
            }
            assert!(!lock.has_read_lock());
            assert!(!lock.has_write_lock());
        }
    }
}
