//! Virtual memory: per-process supplemental page tables holding lazy page
//! descriptors, fault resolution, and the claim path that materializes a
//! descriptor into a physical frame.

pub mod anon;
pub mod file;
pub mod frame;

use alloc::sync::Arc;
use alloc::vec::Vec;
use hashbrown::HashMap;
use spin::Mutex;

use crate::fs::FileHandle;
use crate::memory::paging::{self, pg_round_down, PGSIZE, USER_STACK};

/// How far below USER_STACK the stack may grow (1 MiB).
pub const STACK_LIMIT: u64 = 1 << 20;

/// Deferred page contents: read `read_bytes` from `file` at `offset`,
/// zero-fill the rest of the page. Runs on first fault.
#[derive(Clone)]
pub struct LazyLoad {
    pub file: Arc<Mutex<FileHandle>>,
    pub offset: u64,
    pub read_bytes: u64,
}

/// Backing store of a resident or evicted file page.
pub struct FileBacking {
    pub file: Arc<Mutex<FileHandle>>,
    pub offset: u64,
    pub read_bytes: u64,
}

/// What an UNINIT descriptor becomes once claimed.
#[derive(Clone)]
pub enum PageTarget {
    Anon { stack: bool },
    File { run_len: Option<usize> },
}

pub enum PageState {
    /// Not yet materialized; `init` (if any) fills the frame on first
    /// claim, otherwise the page starts zeroed.
    Uninit {
        target: PageTarget,
        init: Option<LazyLoad>,
    },
    /// Anonymous: resident, or parked in swap slot `slot`.
    Anon { slot: Option<usize>, stack: bool },
    /// File-backed; the file itself is the backing store. The first page
    /// of an mmap run records the run length.
    File {
        backing: FileBacking,
        run_len: Option<usize>,
    },
}

pub struct Page {
    pub va: u64,
    pub writable: bool,
    pub state: PageState,
    /// Physical address of the occupied frame; `None` when not resident.
    pub frame: Option<u64>,
}

/// Per-process map from page-aligned user VA to page descriptor.
pub struct Spt {
    pages: HashMap<u64, Page>,
}

impl Spt {
    pub fn new() -> Spt {
        Spt {
            pages: HashMap::new(),
        }
    }

    /// Create a pending descriptor. Fails if the VA is already mapped.
    pub fn alloc_page_with_initializer(
        &mut self,
        target: PageTarget,
        va: u64,
        writable: bool,
        init: Option<LazyLoad>,
    ) -> bool {
        let va = pg_round_down(va);
        self.insert_page(Page {
            va,
            writable,
            state: PageState::Uninit { target, init },
            frame: None,
        })
    }

    pub fn insert_page(&mut self, page: Page) -> bool {
        let va = page.va;
        if self.pages.contains_key(&va) {
            return false;
        }
        self.pages.insert(va, page);
        true
    }

    pub fn find_page(&self, va: u64) -> Option<&Page> {
        self.pages.get(&pg_round_down(va))
    }

    pub fn find_page_mut(&mut self, va: u64) -> Option<&mut Page> {
        self.pages.get_mut(&pg_round_down(va))
    }

    fn take(&mut self, va: u64) -> Option<Page> {
        self.pages.remove(&pg_round_down(va))
    }

    pub fn mapped_vas(&self) -> Vec<u64> {
        self.pages.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

impl Default for Spt {
    fn default() -> Self {
        Spt::new()
    }
}

/// Work to do once a frame is linked, decided under the SPT lock and
/// executed outside it (the fill may be disk I/O).
enum Fill {
    Zero,
    Swap(usize),
    FileRead {
        file: Arc<Mutex<FileHandle>>,
        offset: u64,
        read_bytes: u64,
    },
}

/// Materialize the descriptor at `va`: obtain a frame (evicting if the
/// user pool is dry), run the state's fill, install the mapping.
pub fn claim_page(spt: &Arc<Mutex<Spt>>, pml4: u64, va: u64) -> bool {
    let va = pg_round_down(va);

    {
        let guard = spt.lock();
        match guard.find_page(va) {
            None => return false,
            Some(p) if p.frame.is_some() => return true,
            Some(_) => {}
        }
    }

    // The frame is pinned (invisible to the clock) until the fill is done
    // and the mapping installed.
    let Some(frame_phys) = frame::get_frame(spt.clone(), pml4, va) else {
        return false;
    };
    let kva = paging::phys_to_virt(x86_64::PhysAddr::new(frame_phys)).as_mut_ptr::<u8>();

    let (fill, writable) = {
        let mut guard = spt.lock();
        let page = match guard.find_page_mut(va) {
            Some(page) => page,
            None => {
                drop(guard);
                frame::free_frame(frame_phys);
                return false;
            }
        };
        page.frame = Some(frame_phys);
        let state = core::mem::replace(
            &mut page.state,
            PageState::Anon {
                slot: None,
                stack: false,
            },
        );
        let (state, fill) = match state {
            PageState::Uninit { target, init } => match (target, init) {
                (PageTarget::Anon { stack }, Some(lazy)) => (
                    PageState::Anon { slot: None, stack },
                    Fill::FileRead {
                        file: lazy.file,
                        offset: lazy.offset,
                        read_bytes: lazy.read_bytes,
                    },
                ),
                (PageTarget::Anon { stack }, None) => {
                    (PageState::Anon { slot: None, stack }, Fill::Zero)
                }
                (PageTarget::File { run_len }, Some(lazy)) => (
                    PageState::File {
                        backing: FileBacking {
                            file: lazy.file.clone(),
                            offset: lazy.offset,
                            read_bytes: lazy.read_bytes,
                        },
                        run_len,
                    },
                    Fill::FileRead {
                        file: lazy.file,
                        offset: lazy.offset,
                        read_bytes: lazy.read_bytes,
                    },
                ),
                // A file target always carries a loader.
                (PageTarget::File { .. }, None) => panic!("file page without initializer"),
            },
            PageState::Anon { slot: Some(idx), stack } => {
                (PageState::Anon { slot: None, stack }, Fill::Swap(idx))
            }
            PageState::Anon { slot: None, stack } => {
                (PageState::Anon { slot: None, stack }, Fill::Zero)
            }
            PageState::File { backing, run_len } => {
                let fill = Fill::FileRead {
                    file: backing.file.clone(),
                    offset: backing.offset,
                    read_bytes: backing.read_bytes,
                };
                (PageState::File { backing, run_len }, fill)
            }
        };
        page.state = state;
        (fill, page.writable)
    };

    let filled = match fill {
        Fill::Zero => {
            unsafe { core::ptr::write_bytes(kva, 0, PGSIZE as usize) };
            true
        }
        Fill::Swap(slot) => {
            anon::swap_in(slot, kva);
            true
        }
        Fill::FileRead {
            file,
            offset,
            read_bytes,
        } => {
            let buf = unsafe { core::slice::from_raw_parts_mut(kva, PGSIZE as usize) };
            let read = file.lock().read_at(&mut buf[..read_bytes as usize], offset);
            buf[read..].fill(0);
            read == read_bytes as usize
        }
    };

    if !filled {
        let mut guard = spt.lock();
        if let Some(page) = guard.find_page_mut(va) {
            page.frame = None;
        }
        drop(guard);
        frame::free_frame(frame_phys);
        return false;
    }

    let installed = paging::map_user_page(pml4, va, frame_phys, writable);
    frame::unpin(frame_phys);
    installed
}

/// Destroy one descriptor: write back a dirty file page, release the
/// frame or swap slot, drop the mapping.
pub fn remove_page(spt: &Arc<Mutex<Spt>>, pml4: u64, va: u64) {
    let va = pg_round_down(va);
    // Frame-table lock first, same order as eviction, so the clock cannot
    // pick this page while it is being dismantled.
    let mut table = frame::lock_table();
    let Some(page) = spt.lock().take(va) else {
        return;
    };
    match page.state {
        PageState::File { backing, .. } => {
            if let Some(phys) = page.frame {
                if paging::is_dirty(pml4, va) {
                    let kva = paging::phys_to_virt(x86_64::PhysAddr::new(phys)).as_ptr::<u8>();
                    let buf =
                        unsafe { core::slice::from_raw_parts(kva, backing.read_bytes as usize) };
                    backing.file.lock().write_at(buf, backing.offset);
                    paging::clear_dirty(pml4, va);
                }
                paging::unmap_user_page(pml4, va);
                table.release(phys);
            }
        }
        PageState::Anon { slot, .. } => {
            if let Some(phys) = page.frame {
                paging::unmap_user_page(pml4, va);
                table.release(phys);
            } else if let Some(idx) = slot {
                anon::free_slot(idx);
            }
        }
        PageState::Uninit { .. } => {}
    }
}

/// Tear down a whole address space's descriptors.
pub fn spt_destroy(spt: &Arc<Mutex<Spt>>, pml4: u64) {
    let vas = spt.lock().mapped_vas();
    for va in vas {
        remove_page(spt, pml4, va);
    }
}

/// Duplicate `parent` into `child` for fork: UNINIT descriptors are
/// recreated with the same initializer, materialized pages are claimed in
/// the child and copied byte for byte. No copy-on-write.
pub fn spt_copy(
    parent_spt: &Arc<Mutex<Spt>>,
    parent_pml4: u64,
    child_spt: &Arc<Mutex<Spt>>,
    child_pml4: u64,
) -> bool {
    let vas = parent_spt.lock().mapped_vas();
    for va in vas {
        enum Kind {
            Uninit(PageTarget, Option<LazyLoad>),
            Anon { stack: bool },
            File { backing: FileBacking, run_len: Option<usize> },
        }
        let (kind, writable, resident) = {
            let guard = parent_spt.lock();
            let Some(page) = guard.find_page(va) else {
                continue;
            };
            let kind = match &page.state {
                PageState::Uninit { target, init } => Kind::Uninit(target.clone(), init.clone()),
                PageState::Anon { stack, .. } => Kind::Anon { stack: *stack },
                PageState::File { backing, run_len } => Kind::File {
                    backing: FileBacking {
                        file: Arc::new(Mutex::new(backing.file.lock().reopen())),
                        offset: backing.offset,
                        read_bytes: backing.read_bytes,
                    },
                    run_len: *run_len,
                },
            };
            (kind, page.writable, page.frame.is_some())
        };

        match kind {
            Kind::Uninit(target, init) => {
                if !child_spt
                    .lock()
                    .alloc_page_with_initializer(target, va, writable, init)
                {
                    return false;
                }
            }
            materialized => {
                // The parent copy must be resident to read from it.
                if !resident && !claim_page(parent_spt, parent_pml4, va) {
                    return false;
                }
                let inserted = child_spt.lock().insert_page(Page {
                    va,
                    writable,
                    state: match materialized {
                        Kind::Anon { stack } => PageState::Anon { slot: None, stack },
                        Kind::File { backing, run_len } => PageState::File { backing, run_len },
                        Kind::Uninit(..) => unreachable!(),
                    },
                    frame: None,
                });
                if !inserted || !claim_page(child_spt, child_pml4, va) {
                    return false;
                }
                let src = parent_spt.lock().find_page(va).and_then(|p| p.frame);
                let dst = child_spt.lock().find_page(va).and_then(|p| p.frame);
                let (Some(src), Some(dst)) = (src, dst) else {
                    return false;
                };
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        paging::phys_to_virt(x86_64::PhysAddr::new(src)).as_ptr::<u8>(),
                        paging::phys_to_virt(x86_64::PhysAddr::new(dst)).as_mut_ptr::<u8>(),
                        PGSIZE as usize,
                    );
                }
            }
        }
    }
    true
}

/// Is `addr` a legitimate stack access: within 1 MiB below USER_STACK and
/// no lower than one push below the faulting stack pointer.
pub fn is_stack_access(addr: u64, rsp: u64) -> bool {
    match rsp.checked_sub(8) {
        Some(push_floor) => {
            USER_STACK - STACK_LIMIT <= push_floor && push_floor <= addr && addr < USER_STACK
        }
        None => false,
    }
}

/// Allocate and immediately claim an anonymous stack page covering `va`.
pub fn grow_stack(spt: &Arc<Mutex<Spt>>, pml4: u64, va: u64) -> bool {
    let va = pg_round_down(va);
    if !spt.lock().alloc_page_with_initializer(
        PageTarget::Anon { stack: true },
        va,
        true,
        None,
    ) {
        return false;
    }
    claim_page(spt, pml4, va)
}

/// Page-fault resolution. Returns false when the fault is genuine (the
/// caller kills the process or panics).
pub fn try_handle_fault(addr: u64, user: bool, write: bool, not_present: bool, fault_rsp: u64) -> bool {
    if !not_present {
        // Permission violation; never recoverable.
        return false;
    }
    if !paging::is_user_vaddr(addr) {
        return false;
    }

    let Some((spt, pml4, saved_rsp)) = crate::threads::with_current(|t| {
        t.spt.clone().zip(t.pml4).map(|(spt, pml4)| (spt, pml4, t.user_rsp))
    }) else {
        return false;
    };

    // Faults taken inside a syscall carry the kernel rsp; use the user
    // rsp saved at syscall entry instead.
    let rsp = if user { fault_rsp } else { saved_rsp };

    let page_exists = spt.lock().find_page(addr).is_some();
    if !page_exists {
        if is_stack_access(addr, rsp) {
            return grow_stack(&spt, pml4, addr);
        }
        return false;
    }

    if write {
        let writable = spt
            .lock()
            .find_page(addr)
            .map(|p| p.writable)
            .unwrap_or(false);
        if !writable {
            return false;
        }
    }

    claim_page(&spt, pml4, addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spt_rejects_duplicate_vas() {
        let mut spt = Spt::new();
        assert!(spt.alloc_page_with_initializer(
            PageTarget::Anon { stack: false },
            0x40_0000,
            true,
            None
        ));
        assert!(!spt.alloc_page_with_initializer(
            PageTarget::Anon { stack: false },
            0x40_0123, // same page after rounding
            false,
            None
        ));
        assert_eq!(spt.len(), 1);
    }

    #[test]
    fn find_rounds_to_page_boundary() {
        let mut spt = Spt::new();
        spt.alloc_page_with_initializer(PageTarget::Anon { stack: false }, 0x41_0000, true, None);
        assert!(spt.find_page(0x41_0ff8).is_some());
        assert!(spt.find_page(0x41_1000).is_none());
    }

    #[test]
    fn take_removes_descriptor() {
        let mut spt = Spt::new();
        spt.alloc_page_with_initializer(PageTarget::Anon { stack: true }, 0x42_0000, true, None);
        assert!(spt.take(0x42_0aaa).is_some());
        assert!(spt.find_page(0x42_0000).is_none());
    }

    #[test]
    fn stack_access_boundaries() {
        let rsp = USER_STACK - 0x1000;
        // One push below rsp grows the stack…
        assert!(is_stack_access(rsp - 8, rsp));
        // …one byte further does not.
        assert!(!is_stack_access(rsp - 9, rsp));
        // Below the 1 MiB window nothing grows.
        let deep_rsp = USER_STACK - STACK_LIMIT - 0x1000;
        assert!(!is_stack_access(deep_rsp - 8, deep_rsp));
        // Accesses above the window are plain faults.
        assert!(!is_stack_access(USER_STACK, rsp));
    }
}
