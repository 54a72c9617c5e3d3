pub mod context;
pub mod ordered;
pub mod sync;

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use context::Context;
use lazy_static::lazy_static;
use spin::{Mutex, MutexGuard};
use sync::{LockId, Semaphore};

pub const PRI_MIN: i32 = 0;
pub const PRI_DEFAULT: i32 = 31;
pub const PRI_MAX: i32 = 63;

/// Size of each thread's kernel stack (16 KiB).
const THREAD_STACK_SIZE: usize = 4096 * 4;

pub type Tid = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Running,
    Blocked,
    Dying,
}

/// One priority donation: `donor` has lent `priority` to the thread whose
/// donor list this record sits in. Donor lists are sorted descending, so
/// the effective priority is `max(base, head)`.
#[derive(Debug, Clone, Copy)]
pub struct Donation {
    pub donor: Tid,
    pub priority: i32,
}

pub struct Thread {
    pub tid: Tid,
    pub name: String,
    pub base_priority: i32,
    /// Effective priority: `max(base_priority, donors.first())`.
    pub priority: i32,
    pub state: ThreadState,
    pub context: Context,
    _kernel_stack: Box<[u8]>,
    pub kstack_top: u64,

    // Donation bookkeeping.
    pub donors: Vec<Donation>,
    pub held_locks: Vec<LockId>,
    pub waiting_on: Option<LockId>,

    // Process tree.
    pub is_root: bool,
    pub parent: Option<Tid>,
    pub children: Vec<Tid>,
    pub exit_status: i32,
    /// Exit status of the child most recently handed over through the
    /// wait rendezvous; written by the child, read by this (parent) thread.
    pub child_status: i32,

    // Rendezvous semaphores (see process lifecycle).
    pub fork_done: Arc<Semaphore>,
    pub wait_ready: Arc<Semaphore>,
    pub status_ready: Arc<Semaphore>,
    pub exit_gate: Arc<Semaphore>,

    // User-process state; `None`/empty for pure kernel threads.
    pub pml4: Option<u64>,
    pub spt: Option<Arc<Mutex<crate::vm::Spt>>>,
    pub fd_table: Vec<Option<Arc<Mutex<crate::fs::FileHandle>>>>,
    pub executable: Option<crate::fs::FileHandle>,
    /// User rsp saved at syscall entry, for stack-growth checks on faults
    /// taken while in the kernel.
    pub user_rsp: u64,
    /// Trapframe snapshot taken by `fork` for the child to resume from.
    pub fork_frame: Option<Box<crate::userprog::SyscallFrame>>,
}

impl Thread {
    fn new(tid: Tid, name: &str, priority: i32, context: Context, stack: Box<[u8]>) -> Box<Thread> {
        let kstack_top = if stack.is_empty() {
            0
        } else {
            (stack.as_ptr() as u64 + stack.len() as u64) & !0xF
        };
        Box::new(Thread {
            tid,
            name: String::from(name),
            base_priority: priority,
            priority,
            state: ThreadState::Ready,
            context,
            _kernel_stack: stack,
            kstack_top,
            donors: Vec::new(),
            held_locks: Vec::new(),
            waiting_on: None,
            is_root: false,
            parent: None,
            children: Vec::new(),
            exit_status: 0,
            child_status: 0,
            fork_done: Arc::new(Semaphore::new(0)),
            wait_ready: Arc::new(Semaphore::new(0)),
            status_ready: Arc::new(Semaphore::new(0)),
            exit_gate: Arc::new(Semaphore::new(0)),
            pml4: None,
            spt: None,
            fd_table: Vec::new(),
            executable: None,
            user_rsp: 0,
            fork_frame: None,
        })
    }
}

/// Global scheduler state: the thread table, the ready queue and the
/// lock-holder map consulted by the donation walk. Boxing the threads
/// keeps contexts and stacks at stable addresses while the table mutates.
pub struct Scheduler {
    threads: BTreeMap<Tid, Box<Thread>>,
    ready: VecDeque<Tid>,
    current: Tid,
    next_tid: Tid,
    lock_holders: BTreeMap<LockId, Tid>,
    dying: Vec<Tid>,
    active: bool,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            threads: BTreeMap::new(),
            ready: VecDeque::new(),
            current: 0,
            next_tid: 1,
            lock_holders: BTreeMap::new(),
            dying: Vec::new(),
            active: false,
        }
    }

    pub fn effective(&self, tid: Tid) -> i32 {
        self.threads.get(&tid).map(|t| t.priority).unwrap_or(PRI_MIN)
    }

    fn recompute_priority(&mut self, tid: Tid) {
        if let Some(t) = self.threads.get_mut(&tid) {
            let donated = t.donors.first().map(|d| d.priority).unwrap_or(PRI_MIN);
            t.priority = t.base_priority.max(donated);
        }
    }

    /// Remove and return the highest-priority ready thread; FIFO among
    /// equal priorities.
    fn pick_next(&mut self) -> Option<Tid> {
        let idx = ordered::index_of_max(&self.ready, |tid| self.effective(*tid))?;
        self.ready.remove(idx)
    }

    /// True if a ready thread outranks the given priority.
    fn preemption_needed(&self, priority: i32) -> bool {
        self.ready.iter().any(|&t| self.effective(t) > priority)
    }

    /// Walk the `waiting_on` chain from the holder of `lock`, lending the
    /// donor's effective priority to every holder below it. Terminates
    /// because priorities strictly increase along the chain.
    fn donate(&mut self, donor: Tid, lock: LockId) {
        let donor_priority = self.effective(donor);
        if let Some(t) = self.threads.get_mut(&donor) {
            t.waiting_on = Some(lock);
        }
        let mut lock = lock;
        loop {
            let Some(&holder) = self.lock_holders.get(&lock) else {
                break;
            };
            let Some(holder_t) = self.threads.get_mut(&holder) else {
                break;
            };
            if holder_t.priority >= donor_priority {
                break;
            }
            ordered::insert_sorted_desc(
                &mut holder_t.donors,
                Donation { donor, priority: donor_priority },
                |d| d.priority,
            );
            holder_t.priority = donor_priority;
            match holder_t.waiting_on {
                Some(next) => lock = next,
                None => break,
            }
        }
    }

    /// Does `donor`'s wait chain run through `lock`? Used on release to
    /// decide which donations to withdraw.
    fn chain_passes_through(&self, donor: Tid, lock: LockId) -> bool {
        let mut t = donor;
        let mut hops = 0;
        while let Some(l) = self.threads.get(&t).and_then(|th| th.waiting_on) {
            if l == lock {
                return true;
            }
            match self.lock_holders.get(&l) {
                Some(&holder) => t = holder,
                None => return false,
            }
            hops += 1;
            if hops > self.threads.len() {
                return false;
            }
        }
        false
    }

    fn lock_acquired(&mut self, tid: Tid, lock: LockId) {
        if let Some(t) = self.threads.get_mut(&tid) {
            t.waiting_on = None;
            t.held_locks.push(lock);
        }
        self.lock_holders.insert(lock, tid);
    }

    fn lock_released(&mut self, tid: Tid, lock: LockId) {
        let Some(t) = self.threads.get_mut(&tid) else {
            return;
        };
        t.held_locks.retain(|&l| l != lock);
        let donors = core::mem::take(&mut t.donors);
        let kept: Vec<Donation> = donors
            .into_iter()
            .filter(|d| !self.chain_passes_through(d.donor, lock))
            .collect();
        if let Some(t) = self.threads.get_mut(&tid) {
            t.donors = kept;
        }
        self.recompute_priority(tid);
        self.lock_holders.remove(&lock);
    }

    /// Drop the table entries (and stacks) of dying, unparented threads.
    /// `prev` and `next` are excluded: one stack is still in use, the
    /// other is about to be.
    fn reap(&mut self, prev: Tid, next: Tid) {
        let mut i = 0;
        while i < self.dying.len() {
            let tid = self.dying[i];
            let reapable = tid != prev
                && tid != next
                && self
                    .threads
                    .get(&tid)
                    .map(|t| t.parent.is_none())
                    .unwrap_or(true);
            if reapable {
                self.dying.swap_remove(i);
                self.threads.remove(&tid);
            } else {
                i += 1;
            }
        }
    }
}

lazy_static! {
    pub static ref SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());
}

/// Register the boot thread as the running root and start the idle thread.
pub fn init() {
    {
        let mut sched = SCHEDULER.lock();
        let tid = sched.next_tid;
        sched.next_tid += 1;
        let mut root = Thread::new(tid, "main", PRI_DEFAULT, Context::empty(), Box::new([]));
        root.state = ThreadState::Running;
        root.is_root = true;
        sched.threads.insert(tid, root);
        sched.current = tid;
        sched.active = true;
    }
    spawn("idle", PRI_MIN, idle, 0);
    crate::log_info!("threads: scheduler active");
}

/// The thread that runs when nothing else is ready. Never blocks.
fn idle(_aux: usize) {
    loop {
        x86_64::instructions::interrupts::enable_and_hlt();
    }
}

/// Create a thread running `entry(aux)` and make it ready. Yields if the
/// new thread outranks the caller.
pub fn spawn(name: &str, priority: i32, entry: fn(usize), aux: usize) -> Tid {
    assert!((PRI_MIN..=PRI_MAX).contains(&priority));
    let (tid, should_yield) = x86_64::instructions::interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let tid = sched.next_tid;
        sched.next_tid += 1;

        let stack = vec![0u8; THREAD_STACK_SIZE].into_boxed_slice();
        let stack_top = (stack.as_ptr() as u64 + THREAD_STACK_SIZE as u64) & !0xF;
        let ctx = Context::fresh(entry, aux, stack_top);
        let mut thread = Thread::new(tid, name, priority, ctx, stack);

        // Every spawned thread is a child of the spawner; wait and the
        // reaper rely on this edge.
        if sched.active {
            let spawner = sched.current;
            thread.parent = Some(spawner);
            if let Some(parent) = sched.threads.get_mut(&spawner) {
                parent.children.push(tid);
            }
        }

        sched.threads.insert(tid, thread);
        sched.ready.push_back(tid);
        let current_priority = sched.effective(sched.current);
        (tid, sched.active && priority > current_priority)
    });
    if should_yield {
        yield_now();
    }
    tid
}

pub fn current_tid() -> Tid {
    SCHEDULER.lock().current
}

/// Run `f` on the current thread's record with the scheduler locked.
/// `f` must not block or re-enter the scheduler.
pub fn with_current<R>(f: impl FnOnce(&mut Thread) -> R) -> R {
    x86_64::instructions::interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let current = sched.current;
        f(sched.threads.get_mut(&current).expect("current thread missing"))
    })
}

/// Like `with_current` for an arbitrary thread; `None` if it is gone.
pub fn with_thread<R>(tid: Tid, f: impl FnOnce(&mut Thread) -> R) -> Option<R> {
    x86_64::instructions::interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        sched.threads.get_mut(&tid).map(|t| f(t))
    })
}

pub fn effective_of(tid: Tid) -> i32 {
    SCHEDULER.lock().effective(tid)
}

pub fn lock_holder(lock: LockId) -> Option<Tid> {
    SCHEDULER.lock().lock_holders.get(&lock).copied()
}

pub(crate) fn donate_for_lock(donor: Tid, lock: LockId) {
    SCHEDULER.lock().donate(donor, lock);
}

pub(crate) fn note_lock_acquired(lock: LockId) {
    let mut sched = SCHEDULER.lock();
    let current = sched.current;
    sched.lock_acquired(current, lock);
}

pub(crate) fn note_lock_released(lock: LockId) {
    let mut sched = SCHEDULER.lock();
    let current = sched.current;
    sched.lock_released(current, lock);
}

/// Switch from the current thread to `next`. The caller has already set
/// the current thread's new state and queued it wherever it belongs.
/// Consumes the scheduler guard; interrupts must be disabled.
fn do_switch(mut sched: MutexGuard<'_, Scheduler>, next: Tid) {
    let prev = sched.current;
    sched.reap(prev, next);

    {
        let next_t = sched.threads.get_mut(&next).expect("next thread missing");
        next_t.state = ThreadState::Running;
    }
    sched.current = next;

    let next_t = sched.threads.get(&next).unwrap();
    if next_t.kstack_top != 0 {
        crate::interrupts::gdt::set_tss_rsp0(next_t.kstack_top);
        crate::userprog::set_syscall_kernel_stack(next_t.kstack_top);
    }
    let p4 = next_t.pml4.unwrap_or_else(crate::memory::paging::kernel_p4);
    if crate::memory::paging::current_p4() != p4 {
        crate::memory::paging::activate(p4);
    }

    let prev_ctx = &mut sched
        .threads
        .get_mut(&prev)
        .expect("previous thread missing")
        .context as *mut Context;
    let next_ctx = &sched.threads.get(&next).unwrap().context as *const Context;

    drop(sched);
    unsafe { context::switch_context(prev_ctx, next_ctx) };
}

/// Block the current thread. The caller has already queued its tid on
/// whatever waiter list will unblock it. Interrupts must be disabled.
pub fn block_current() {
    let mut sched = SCHEDULER.lock();
    assert!(sched.active, "block before scheduler start");
    let current = sched.current;
    sched.threads.get_mut(&current).unwrap().state = ThreadState::Blocked;
    let next = sched.pick_next().expect("no ready thread (idle missing?)");
    do_switch(sched, next);
}

/// Make a blocked thread ready. Returns true if it now outranks the
/// caller (the caller should yield when context permits).
pub fn unblock(tid: Tid) -> bool {
    x86_64::instructions::interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let Some(t) = sched.threads.get_mut(&tid) else {
            return false;
        };
        debug_assert_eq!(t.state, ThreadState::Blocked);
        t.state = ThreadState::Ready;
        let woken_priority = t.priority;
        sched.ready.push_back(tid);
        sched.active && woken_priority > sched.effective(sched.current)
    })
}

/// Cooperatively hand the CPU to the highest-priority ready thread.
pub fn yield_now() {
    x86_64::instructions::interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        if !sched.active || sched.ready.is_empty() {
            return;
        }
        let current = sched.current;
        sched.threads.get_mut(&current).unwrap().state = ThreadState::Ready;
        sched.ready.push_back(current);
        let next = sched.pick_next().unwrap();
        if next == current {
            sched.threads.get_mut(&current).unwrap().state = ThreadState::Running;
            return;
        }
        do_switch(sched, next);
    });
}

/// Yield unless the scheduler lock is already taken. Safe to call from
/// the timer interrupt: if the tick lands inside a scheduler operation,
/// skipping the switch is always correct.
pub fn try_yield_now() {
    x86_64::instructions::interrupts::without_interrupts(|| {
        let Some(mut sched) = SCHEDULER.try_lock() else {
            return;
        };
        if !sched.active || sched.ready.is_empty() {
            return;
        }
        let current = sched.current;
        let Some(t) = sched.threads.get_mut(&current) else {
            return;
        };
        if t.state != ThreadState::Running {
            return;
        }
        t.state = ThreadState::Ready;
        sched.ready.push_back(current);
        let next = sched.pick_next().unwrap();
        if next == current {
            sched.threads.get_mut(&current).unwrap().state = ThreadState::Running;
            return;
        }
        do_switch(sched, next);
    });
}

/// Terminal transition: mark the current thread dying and schedule away.
/// The record (and stack) is reclaimed on a later switch, once no parent
/// still needs to observe it.
pub extern "C" fn exit_thread() -> ! {
    x86_64::instructions::interrupts::disable();
    let mut sched = SCHEDULER.lock();
    let current = sched.current;
    sched.threads.get_mut(&current).unwrap().state = ThreadState::Dying;
    sched.dying.push(current);
    let next = sched.pick_next().expect("no ready thread (idle missing?)");
    do_switch(sched, next);
    unreachable!("dying thread rescheduled");
}

/// Update the base priority; the effective priority follows donations.
/// Yields if the change makes another ready thread the highest.
pub fn set_priority(priority: i32) {
    assert!((PRI_MIN..=PRI_MAX).contains(&priority));
    let should_yield = x86_64::instructions::interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let current = sched.current;
        sched.threads.get_mut(&current).unwrap().base_priority = priority;
        sched.recompute_priority(current);
        let effective = sched.effective(current);
        sched.preemption_needed(effective)
    });
    if should_yield {
        yield_now();
    }
}

pub fn get_priority() -> i32 {
    let sched = SCHEDULER.lock();
    sched.effective(sched.current)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_sched() -> Scheduler {
        let mut s = Scheduler::new();
        s.active = true;
        s
    }

    fn add_thread(s: &mut Scheduler, tid: Tid, priority: i32) {
        let t = Thread::new(tid, "t", priority, Context::empty(), Box::new([]));
        s.threads.insert(tid, t);
    }

    const L1: LockId = LockId(1);
    const L2: LockId = LockId(2);

    #[test]
    fn single_donation_raises_and_release_restores() {
        // A(31) holds L1; C(33) donates while waiting.
        let mut s = test_sched();
        add_thread(&mut s, 1, 31); // A
        add_thread(&mut s, 3, 33); // C
        s.lock_acquired(1, L1);

        s.donate(3, L1);
        assert_eq!(s.effective(1), 33);

        s.lock_released(1, L1);
        assert_eq!(s.effective(1), 31);
        assert!(s.threads[&1].donors.is_empty());
    }

    #[test]
    fn donation_ignored_when_holder_already_higher() {
        let mut s = test_sched();
        add_thread(&mut s, 1, 50);
        add_thread(&mut s, 2, 20);
        s.lock_acquired(1, L1);
        s.donate(2, L1);
        assert_eq!(s.effective(1), 50);
        assert!(s.threads[&1].donors.is_empty());
    }

    #[test]
    fn nested_donation_propagates_down_the_chain() {
        // T1(10) holds L1. T2(20) holds L2 and waits on L1. T3(30) waits
        // on L2. Both T1 and T2 must rise to 30.
        let mut s = test_sched();
        add_thread(&mut s, 1, 10);
        add_thread(&mut s, 2, 20);
        add_thread(&mut s, 3, 30);
        s.lock_acquired(1, L1);
        s.lock_acquired(2, L2);

        s.donate(2, L1); // T2 blocks on L1
        assert_eq!(s.effective(1), 20);

        s.donate(3, L2); // T3 blocks on L2; chain reaches T1
        assert_eq!(s.effective(2), 30);
        assert_eq!(s.effective(1), 30);

        // T1 releases L1: both the direct donation from T2 and the
        // chained one from T3 came through L1.
        s.lock_released(1, L1);
        assert_eq!(s.effective(1), 10);

        // T2 now owns L1; T3's donation to it stands until L2 is freed.
        s.lock_acquired(2, L1);
        s.threads.get_mut(&2).unwrap().waiting_on = None;
        assert_eq!(s.effective(2), 30);
        s.lock_released(2, L2);
        assert_eq!(s.effective(2), 20);
    }

    #[test]
    fn release_keeps_donations_from_other_locks() {
        // Holder of both L1 and L2; releasing L2 must not drop the L1
        // waiter's donation.
        let mut s = test_sched();
        add_thread(&mut s, 1, 10);
        add_thread(&mut s, 2, 40);
        add_thread(&mut s, 3, 50);
        s.lock_acquired(1, L1);
        s.lock_acquired(1, L2);
        s.donate(2, L1);
        s.donate(3, L2);
        assert_eq!(s.effective(1), 50);

        s.lock_released(1, L2);
        assert_eq!(s.effective(1), 40);
        s.lock_released(1, L1);
        assert_eq!(s.effective(1), 10);
    }

    #[test]
    fn pick_next_is_priority_then_fifo() {
        let mut s = test_sched();
        add_thread(&mut s, 1, 20);
        add_thread(&mut s, 2, 40);
        add_thread(&mut s, 3, 40);
        s.ready.extend([1, 2, 3]);
        assert_eq!(s.pick_next(), Some(2));
        assert_eq!(s.pick_next(), Some(3));
        assert_eq!(s.pick_next(), Some(1));
        assert_eq!(s.pick_next(), None);
    }

    #[test]
    fn donation_updates_ready_thread_selection() {
        let mut s = test_sched();
        add_thread(&mut s, 1, 10); // holder, ready
        add_thread(&mut s, 2, 35);
        add_thread(&mut s, 3, 40); // donor
        s.ready.extend([1, 2]);
        s.lock_acquired(1, L1);
        s.donate(3, L1);
        // Holder now outranks thread 2 in the ready queue.
        assert_eq!(s.pick_next(), Some(1));
    }

    #[test]
    fn base_priority_change_respects_donations() {
        let mut s = test_sched();
        add_thread(&mut s, 1, 31);
        add_thread(&mut s, 2, 45);
        s.lock_acquired(1, L1);
        s.donate(2, L1);
        assert_eq!(s.effective(1), 45);

        // Lowering the base keeps the donated priority.
        s.threads.get_mut(&1).unwrap().base_priority = 5;
        s.recompute_priority(1);
        assert_eq!(s.effective(1), 45);

        // Raising the base above the donation wins.
        s.threads.get_mut(&1).unwrap().base_priority = 60;
        s.recompute_priority(1);
        assert_eq!(s.effective(1), 60);
    }

    #[test]
    fn reap_skips_parented_threads() {
        let mut s = test_sched();
        add_thread(&mut s, 1, 31);
        add_thread(&mut s, 2, 31);
        s.threads.get_mut(&1).unwrap().parent = Some(7);
        s.threads.get_mut(&1).unwrap().state = ThreadState::Dying;
        s.threads.get_mut(&2).unwrap().state = ThreadState::Dying;
        s.dying.extend([1, 2]);

        s.reap(99, 98);
        assert!(s.threads.contains_key(&1), "parented thread kept for wait");
        assert!(!s.threads.contains_key(&2));

        s.threads.get_mut(&1).unwrap().parent = None;
        s.reap(99, 98);
        assert!(!s.threads.contains_key(&1));
    }
}
