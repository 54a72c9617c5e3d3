//! Blocking synchronization primitives: semaphore, donation-aware lock and
//! condition variable. Atomicity comes from disabling interrupts on the
//! single CPU, never from spinning; the short spin mutexes inside only
//! guard queue storage.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;
use x86_64::instructions::interrupts::without_interrupts;

use super::{ordered, Tid};

/// Identity of a lock in the scheduler's holder map and in `waiting_on`
/// edges. Allocated once per lock, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LockId(pub u64);

static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

struct SemaInner {
    value: usize,
    waiters: VecDeque<Tid>,
}

/// Counting semaphore with a FIFO waiter queue. The queue is re-sorted by
/// the waiters' current effective priorities at `up` time, so donations
/// that arrived while a thread slept still decide who wakes first.
///
/// Invariant: `waiters` nonempty implies `value == 0`.
pub struct Semaphore {
    inner: Mutex<SemaInner>,
}

impl Semaphore {
    pub fn new(value: usize) -> Semaphore {
        Semaphore {
            inner: Mutex::new(SemaInner {
                value,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// "P": wait until the value is positive, then decrement. May sleep;
    /// must not be called from an interrupt handler.
    pub fn down(&self) {
        assert!(!crate::interrupts::in_irq(), "sema down in interrupt context");
        without_interrupts(|| loop {
            let mut inner = self.inner.lock();
            if inner.value > 0 {
                inner.value -= 1;
                return;
            }
            inner.waiters.push_back(super::current_tid());
            drop(inner);
            super::block_current();
            // Mesa-style: somebody upped and woke us, but the value may
            // already be gone again. Re-check from the top.
        });
    }

    /// Non-blocking "P". Safe in interrupt handlers.
    pub fn try_down(&self) -> bool {
        without_interrupts(|| {
            let mut inner = self.inner.lock();
            if inner.value > 0 {
                inner.value -= 1;
                true
            } else {
                false
            }
        })
    }

    /// "V": increment and wake the highest-priority waiter. Safe in
    /// interrupt handlers; yields to the woken thread when it outranks the
    /// caller and the caller is not in one.
    pub fn up(&self) {
        let woke_higher = without_interrupts(|| {
            let mut inner = self.inner.lock();
            inner.value += 1;
            if inner.waiters.is_empty() {
                return false;
            }
            ordered::sort_desc_by_key(&mut inner.waiters, |&tid| super::effective_of(tid));
            let next = inner.waiters.pop_front().unwrap();
            drop(inner);
            super::unblock(next)
        });
        if woke_higher && !crate::interrupts::in_irq() {
            super::yield_now();
        }
    }

    pub fn value(&self) -> usize {
        self.inner.lock().value
    }
}

/// Sleeping mutual-exclusion lock owning its data, with priority donation.
///
/// A binary semaphore plus holder tracking: while a higher-priority thread
/// waits, the holder runs at the waiter's priority, transitively along the
/// holder's own `waiting_on` edge. Not recursive; re-acquiring is a bug.
pub struct Lock<T> {
    id: LockId,
    sema: Semaphore,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for Lock<T> {}
unsafe impl<T: Send> Send for Lock<T> {}

impl<T> Lock<T> {
    pub fn new(data: T) -> Lock<T> {
        Lock {
            id: LockId(NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed)),
            sema: Semaphore::new(1),
            data: UnsafeCell::new(data),
        }
    }

    pub fn held_by_current(&self) -> bool {
        super::lock_holder(self.id) == Some(super::current_tid())
    }

    /// Acquire, donating priority to a lower-priority holder first.
    pub fn lock(&self) -> LockGuard<'_, T> {
        assert!(!crate::interrupts::in_irq(), "lock acquire in interrupt context");
        assert!(!self.held_by_current(), "recursive lock acquire");
        without_interrupts(|| {
            let current = super::current_tid();
            if let Some(holder) = super::lock_holder(self.id) {
                if super::effective_of(holder) < super::effective_of(current) {
                    super::donate_for_lock(current, self.id);
                }
            }
            self.sema.down();
            super::note_lock_acquired(self.id);
        });
        LockGuard { lock: self }
    }

    /// Non-blocking acquire.
    pub fn try_lock(&self) -> Option<LockGuard<'_, T>> {
        assert!(!self.held_by_current(), "recursive lock acquire");
        without_interrupts(|| {
            if self.sema.try_down() {
                super::note_lock_acquired(self.id);
                Some(LockGuard { lock: self })
            } else {
                None
            }
        })
    }

    fn unlock(&self) {
        assert!(self.held_by_current(), "releasing a lock not held");
        without_interrupts(|| {
            // Withdraw the donations that arrived through this lock and
            // fall back to max(base, remaining donors) before the wakeup;
            // the woken thread may immediately outrank us.
            super::note_lock_released(self.id);
            self.sema.up();
        });
    }
}

pub struct LockGuard<'a, T> {
    lock: &'a Lock<T>,
}

impl<T> Deref for LockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for LockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for LockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

struct Ticket {
    tid: Tid,
    sema: Arc<Semaphore>,
}

/// Mesa-style condition variable. Each waiter parks on its own single-use
/// semaphore; `signal` wakes the ticket whose thread currently has the
/// highest effective priority. Holding the paired lock is enforced by
/// requiring its guard.
pub struct Condvar {
    waiters: Mutex<VecDeque<Ticket>>,
}

impl Condvar {
    pub fn new() -> Condvar {
        Condvar {
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    /// Release the lock, sleep until signaled, reacquire. Signalers do not
    /// hand the lock over, so callers must re-check their predicate.
    pub fn wait<'a, T>(&self, guard: LockGuard<'a, T>) -> LockGuard<'a, T> {
        assert!(!crate::interrupts::in_irq(), "cond wait in interrupt context");
        let lock = guard.lock;
        let ticket = Arc::new(Semaphore::new(0));
        without_interrupts(|| {
            self.waiters.lock().push_back(Ticket {
                tid: super::current_tid(),
                sema: ticket.clone(),
            });
            drop(guard);
            ticket.down();
        });
        lock.lock()
    }

    /// Wake the highest-priority waiter, if any.
    pub fn signal<T>(&self, _held: &LockGuard<'_, T>) {
        without_interrupts(|| {
            let mut waiters = self.waiters.lock();
            ordered::sort_desc_by_key(&mut waiters, |t| super::effective_of(t.tid));
            if let Some(ticket) = waiters.pop_front() {
                drop(waiters);
                ticket.sema.up();
            }
        });
    }

    /// Wake everyone.
    pub fn broadcast<T>(&self, held: &LockGuard<'_, T>) {
        while !self.waiters.lock().is_empty() {
            self.signal(held);
        }
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Condvar::new()
    }
}
