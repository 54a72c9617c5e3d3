//! Global frame table: bookkeeping for every physical frame lent to a
//! user page, and second-chance victim selection when the user pool runs
//! dry.

use alloc::sync::Arc;
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::PhysAddr;

use super::{PageState, Spt};
use crate::memory::paging;
use crate::threads::sync::{Lock, LockGuard};

/// Back-reference from a frame to the descriptor occupying it.
pub struct Occupant {
    pub spt: Arc<Mutex<Spt>>,
    pub pml4: u64,
    pub va: u64,
}

pub struct Frame {
    pub phys: u64,
    pub occupant: Occupant,
    /// Pinned frames are mid-fill and invisible to the clock.
    pub pinned: bool,
}

pub struct FrameTable {
    frames: Vec<Frame>,
}

impl FrameTable {
    /// Drop the record for `phys` and return the frame to the user pool.
    pub fn release(&mut self, phys: u64) {
        if let Some(idx) = self.frames.iter().position(|f| f.phys == phys) {
            self.frames.swap_remove(idx);
            crate::memory::USER_POOL
                .lock()
                .free(x86_64::structures::paging::PhysFrame::containing_address(
                    PhysAddr::new(phys),
                ));
        }
    }
}

lazy_static! {
    static ref FRAME_TABLE: Lock<FrameTable> = Lock::new(FrameTable { frames: Vec::new() });
}

pub fn lock_table() -> LockGuard<'static, FrameTable> {
    FRAME_TABLE.lock()
}

/// Second-chance scan from the head of the table. Frames whose accessed
/// bit is set get it cleared and survive one pass; if every candidate had
/// its bit set, the last one examined is the victim, so a full pass always
/// produces one.
pub(crate) fn clock_select(
    len: usize,
    mut skip: impl FnMut(usize) -> bool,
    mut accessed: impl FnMut(usize) -> bool,
    mut clear: impl FnMut(usize),
) -> Option<usize> {
    let mut last_examined = None;
    for idx in 0..len {
        if skip(idx) {
            continue;
        }
        if !accessed(idx) {
            return Some(idx);
        }
        clear(idx);
        last_examined = Some(idx);
    }
    last_examined
}

/// Hand out a user frame for `va`, evicting another page if the pool is
/// empty. The returned frame is pinned; the caller unpins after the fill
/// and mapping are in place.
pub fn get_frame(spt: Arc<Mutex<Spt>>, pml4: u64, va: u64) -> Option<u64> {
    let mut table = FRAME_TABLE.lock();

    if let Some(frame) = crate::memory::USER_POOL.lock().alloc() {
        let phys = frame.start_address().as_u64();
        table.frames.push(Frame {
            phys,
            occupant: Occupant { spt, pml4, va },
            pinned: true,
        });
        return Some(phys);
    }

    let victim_idx = {
        let frames = &table.frames;
        clock_select(
            frames.len(),
            |i| frames[i].pinned,
            |i| paging::is_accessed(frames[i].occupant.pml4, frames[i].occupant.va),
            |i| paging::clear_accessed(frames[i].occupant.pml4, frames[i].occupant.va),
        )?
    };

    let phys = table.frames[victim_idx].phys;
    {
        let victim = &table.frames[victim_idx];
        evict(&victim.occupant, phys);
    }
    table.frames[victim_idx].occupant = Occupant { spt, pml4, va };
    table.frames[victim_idx].pinned = true;
    Some(phys)
}

/// Push the victim's contents to its backing store and sever its mapping.
/// Anonymous pages go to a swap slot; file pages are written back only
/// when dirty.
fn evict(occupant: &Occupant, phys: u64) {
    let mut spt = occupant.spt.lock();
    let Some(page) = spt.find_page_mut(occupant.va) else {
        return;
    };
    let kva = paging::phys_to_virt(PhysAddr::new(phys));
    match &mut page.state {
        PageState::Anon { slot, .. } => {
            let idx = super::anon::swap_out(kva.as_ptr::<u8>(), occupant.pml4, occupant.va);
            *slot = Some(idx);
        }
        PageState::File { backing, .. } => {
            if paging::is_dirty(occupant.pml4, occupant.va) {
                let buf = unsafe {
                    core::slice::from_raw_parts(kva.as_ptr::<u8>(), backing.read_bytes as usize)
                };
                backing.file.lock().write_at(buf, backing.offset);
                paging::clear_dirty(occupant.pml4, occupant.va);
            }
        }
        PageState::Uninit { .. } => unreachable!("uninit page cannot be resident"),
    }
    page.frame = None;
    paging::unmap_user_page(occupant.pml4, occupant.va);
}

pub fn free_frame(phys: u64) {
    lock_table().release(phys);
}

pub fn unpin(phys: u64) {
    let mut table = FRAME_TABLE.lock();
    if let Some(frame) = table.frames.iter_mut().find(|f| f.phys == phys) {
        frame.pinned = false;
    }
}

#[cfg(test)]
mod tests {
    use super::clock_select;

    #[test]
    fn clear_bit_is_chosen_immediately() {
        let accessed = [true, true, false, true];
        let mut cleared = [false; 4];
        let victim = clock_select(
            4,
            |_| false,
            |i| accessed[i],
            |i| cleared[i] = true,
        );
        assert_eq!(victim, Some(2));
        // Frames before the victim lost their second chance.
        assert_eq!(cleared, [true, true, false, false]);
    }

    #[test]
    fn all_accessed_falls_back_to_last_examined() {
        use core::cell::Cell;
        let bits: [Cell<bool>; 3] = [Cell::new(true), Cell::new(true), Cell::new(true)];
        let victim = clock_select(3, |_| false, |i| bits[i].get(), |i| bits[i].set(false));
        assert_eq!(victim, Some(2));
        assert!(bits.iter().all(|b| !b.get()));
    }

    #[test]
    fn pinned_frames_are_never_victims() {
        let bits = [false, false];
        let victim = clock_select(2, |i| i == 0, |i| bits[i], |_| {});
        assert_eq!(victim, Some(1));
        let none = clock_select(2, |_| true, |i| bits[i], |_| {});
        assert_eq!(none, None);
    }
}
