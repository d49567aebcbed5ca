// SPDX-License-Identifier: MPL-2.0

use core::{
    cell::UnsafeCell,
    fmt,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU32, Ordering},
};

use crate::arch::irq::{self, DisabledLocalIrqGuard};

/// How many relax rounds a bounded (`try_*`) acquisition spins before
/// reporting a timeout.
const TRY_MAX_ROUNDS: usize = 100;

/// How many pause hints one relax round issues.
const RELAX_PAUSES: usize = 100;

#[inline]
fn relax() {
    for _ in 0..RELAX_PAUSES {
        core::hint::spin_loop();
    }
}

/// Iteration bound after which an unbounded wait is considered a destined
/// deadlock in debug builds.
#[cfg(debug_assertions)]
const DEADLOCK_DIAG_ROUNDS: usize = 10_000_000;

/// Spin-based reader/writer lock.
///
/// The state is two counters: active `readers` and claimed `writers`. A
/// reader registers itself and backs out if a writer is active; a writer
/// claims the (single) writer slot and then waits for the readers to drain.
/// Writers therefore block new readers as soon as they claim the slot.
///
/// On top of the plain read/write acquisitions the lock supports
/// *upgrading* a read guard to a write guard and *downgrading* a write
/// guard to a read guard, both without letting another writer slip in on
/// the uncontended path. The `try_*` variants bound the spin count and
/// report [`RwTimeout`] instead of waiting forever; a timeout is a
/// retryable condition, never an error to panic on.
///
/// Local IRQs are disabled while the lock is held, mirroring the spinlock.
pub struct RwLock<T: ?Sized> {
    readers: AtomicU32,
    writers: AtomicU32,
    val: UnsafeCell<T>,
}

/// A bounded acquisition gave up. Retry at the caller's discretion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RwTimeout;

impl<T> RwLock<T> {
    /// Creates a new reader/writer lock.
    pub const fn new(val: T) -> Self {
        Self {
            readers: AtomicU32::new(0),
            writers: AtomicU32::new(0),
            val: UnsafeCell::new(val),
        }
    }
}

impl<T: ?Sized> RwLock<T> {
    /// Acquires a read lock, spinning while a writer is active.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        let irq_guard = irq::disable_local();
        self.lock_read();
        RwLockReadGuard {
            lock: self,
            irq_guard,
        }
    }

    /// Attempts to acquire a read lock with a bounded spin.
    pub fn try_read(&self) -> Result<RwLockReadGuard<'_, T>, RwTimeout> {
        let irq_guard = irq::disable_local();
        let mut rounds = 0;
        loop {
            self.readers.fetch_add(1, Ordering::Acquire);
            if self.writers.load(Ordering::Acquire) == 0 {
                return Ok(RwLockReadGuard {
                    lock: self,
                    irq_guard,
                });
            }
            self.readers.fetch_sub(1, Ordering::Release);
            while self.writers.load(Ordering::Acquire) != 0 {
                relax();
                rounds += 1;
                if rounds > TRY_MAX_ROUNDS {
                    return Err(RwTimeout);
                }
            }
        }
    }

    /// Acquires the write lock, spinning until all readers drain.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        let irq_guard = irq::disable_local();
        self.lock_write();
        RwLockWriteGuard {
            lock: self,
            irq_guard,
        }
    }

    /// Attempts to acquire the write lock with a bounded spin.
    pub fn try_write(&self) -> Result<RwLockWriteGuard<'_, T>, RwTimeout> {
        let irq_guard = irq::disable_local();
        let mut rounds = 0;
        loop {
            if self.writers.fetch_add(1, Ordering::Acquire) == 0 {
                // Writer slot claimed; wait for the readers to drain.
                while self.readers.load(Ordering::Acquire) != 0 {
                    relax();
                    rounds += 1;
                    if rounds > TRY_MAX_ROUNDS {
                        self.writers.fetch_sub(1, Ordering::Release);
                        return Err(RwTimeout);
                    }
                }
                return Ok(RwLockWriteGuard {
                    lock: self,
                    irq_guard,
                });
            }
            self.writers.fetch_sub(1, Ordering::Release);
            while self.writers.load(Ordering::Acquire) != 0 {
                relax();
                rounds += 1;
                if rounds > TRY_MAX_ROUNDS {
                    return Err(RwTimeout);
                }
            }
        }
    }

    fn lock_read(&self) {
        let mut rounds: usize = 0;
        loop {
            self.readers.fetch_add(1, Ordering::Acquire);
            if self.writers.load(Ordering::Acquire) == 0 {
                return;
            }
            self.readers.fetch_sub(1, Ordering::Release);
            while self.writers.load(Ordering::Acquire) != 0 {
                relax();
                rounds += 1;
                self.diag_check(rounds);
            }
        }
    }

    fn lock_write(&self) {
        let mut rounds: usize = 0;
        loop {
            if self.writers.fetch_add(1, Ordering::Acquire) == 0 {
                while self.readers.load(Ordering::Acquire) != 0 {
                    relax();
                    rounds += 1;
                    self.diag_check(rounds);
                }
                return;
            }
            self.writers.fetch_sub(1, Ordering::Release);
            while self.writers.load(Ordering::Acquire) != 0 {
                relax();
                rounds += 1;
                self.diag_check(rounds);
            }
        }
    }

    #[inline]
    fn diag_check(&self, rounds: usize) {
        #[cfg(debug_assertions)]
        if rounds >= DEADLOCK_DIAG_ROUNDS {
            panic!(
                "rwlock: potential deadlock (readers {}, writers {})",
                self.readers.load(Ordering::Relaxed),
                self.writers.load(Ordering::Relaxed)
            );
        }
        #[cfg(not(debug_assertions))]
        let _ = rounds;
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for RwLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&self.val, f)
    }
}

// SAFETY: Readers only obtain shared references and the single writer an
// exclusive one, so the usual `Send`/`Sync` bounds apply.
unsafe impl<T: ?Sized + Send> Send for RwLock<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for RwLock<T> {}

/// A guard that provides shared read access to the data protected by a
/// [`RwLock`].
pub struct RwLockReadGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
    #[allow(dead_code)]
    irq_guard: DisabledLocalIrqGuard,
}

impl<'a, T: ?Sized> RwLockReadGuard<'a, T> {
    /// Upgrades this read guard to a write guard.
    ///
    /// On the uncontended path the upgrade is atomic: the writer slot is
    /// claimed first (blocking new readers), then this guard's read count
    /// is dropped and the remaining readers drain. If another writer
    /// already holds the slot, the read side is released while waiting and
    /// re-acquired as a write lock from scratch; callers must therefore
    /// revalidate any lookups made under the read lock after upgrading.
    pub fn upgrade(self) -> RwLockWriteGuard<'a, T> {
        let lock = self.lock;
        let irq_guard = self.into_irq_guard();
        if lock.writers.fetch_add(1, Ordering::Acquire) == 0 {
            // Slot claimed; drop our own read count, drain the rest.
            lock.readers.fetch_sub(1, Ordering::Release);
            let mut rounds = 0;
            while lock.readers.load(Ordering::Acquire) != 0 {
                relax();
                rounds += 1;
                lock.diag_check(rounds);
            }
        } else {
            // Contended: back out entirely, then queue as a plain writer.
            lock.writers.fetch_sub(1, Ordering::Release);
            lock.readers.fetch_sub(1, Ordering::Release);
            lock.lock_write();
        }
        RwLockWriteGuard { lock, irq_guard }
    }

    /// Consumes the guard without running its `Drop` (which would release
    /// the read count a second time), returning the held IRQ guard.
    fn into_irq_guard(self) -> DisabledLocalIrqGuard {
        // SAFETY: `self` is forgotten right after the read, so the guard is
        // moved out exactly once and no drop runs on the original.
        let irq_guard = unsafe { core::ptr::read(&self.irq_guard) };
        core::mem::forget(self);
        irq_guard
    }
}

impl<T: ?Sized> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.val.get() }
    }
}

impl<T: ?Sized> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.readers.fetch_sub(1, Ordering::Release);
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for RwLockReadGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

/// A guard that provides exclusive write access to the data protected by a
/// [`RwLock`].
pub struct RwLockWriteGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
    #[allow(dead_code)]
    irq_guard: DisabledLocalIrqGuard,
}

impl<'a, T: ?Sized> RwLockWriteGuard<'a, T> {
    /// Downgrades this write guard to a read guard.
    ///
    /// Always succeeds: the accounting swap is atomic with respect to other
    /// writers, so no writer can slip in between the release of the write
    /// side and the acquisition of the read side.
    pub fn downgrade(self) -> RwLockReadGuard<'a, T> {
        let lock = self.lock;
        let irq_guard = self.into_irq_guard();
        lock.readers.fetch_add(1, Ordering::Acquire);
        lock.writers.fetch_sub(1, Ordering::Release);
        RwLockReadGuard { lock, irq_guard }
    }

    fn into_irq_guard(self) -> DisabledLocalIrqGuard {
        // SAFETY: `self` is forgotten right after the read, so the guard is
        // moved out exactly once and no drop runs on the original.
        let irq_guard = unsafe { core::ptr::read(&self.irq_guard) };
        core::mem::forget(self);
        irq_guard
    }
}

impl<T: ?Sized> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.val.get() }
    }
}

impl<T: ?Sized> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.val.get() }
    }
}

impl<T: ?Sized> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        let prev = self.lock.writers.fetch_sub(1, Ordering::Release);
        if prev == 0 {
            panic!("rwlock: write-released while not held");
        }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for RwLockWriteGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
