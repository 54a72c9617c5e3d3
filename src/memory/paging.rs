use spin::Once;
use x86_64::{
    instructions::tlb,
    registers::control::Cr3,
    structures::paging::{
        Mapper, OffsetPageTable, Page, PageTable, PageTableFlags, PhysFrame, Size4KiB,
    },
    PhysAddr, VirtAddr,
};

use super::frame_allocator::KernelFrameAllocator;

pub const PGSIZE: u64 = 4096;

/// User virtual-address range. The kernel image and the low identity
/// mappings sit below `USER_BASE`; everything from `USER_TOP` up is
/// kernel-only (heap, physical-memory map).
pub const USER_BASE: u64 = 0x40_0000;
pub const USER_TOP: u64 = 0x8000_0000;

/// Fixed top of the initial user stack.
pub const USER_STACK: u64 = 0x4748_0000;

const ENTRIES_PER_TABLE: usize = 512;
/// 2 MiB span of one P2 entry.
const P2_SPAN: u64 = 0x20_0000;

static PHYS_OFFSET: Once<u64> = Once::new();
static KERNEL_P4: Once<u64> = Once::new();

pub fn pg_round_down(va: u64) -> u64 {
    va & !(PGSIZE - 1)
}

pub fn pg_ofs(va: u64) -> u64 {
    va & (PGSIZE - 1)
}

pub fn is_user_vaddr(va: u64) -> bool {
    (USER_BASE..USER_TOP).contains(&va)
}

pub fn is_kernel_vaddr(va: u64) -> bool {
    !is_user_vaddr(va)
}

/// Remember the physical-memory offset and the boot page map.
///
/// # Safety
/// `phys_offset` must be the offset at which the bootloader mapped all of
/// physical memory.
pub unsafe fn init(phys_offset: u64) {
    PHYS_OFFSET.call_once(|| phys_offset);
    let (frame, _) = Cr3::read();
    KERNEL_P4.call_once(|| frame.start_address().as_u64());
}

pub fn phys_to_virt(pa: PhysAddr) -> VirtAddr {
    VirtAddr::new(pa.as_u64() + PHYS_OFFSET.get().expect("paging not initialized"))
}

unsafe fn table_at(pa: PhysAddr) -> &'static mut PageTable {
    &mut *phys_to_virt(pa).as_mut_ptr()
}

unsafe fn mapper_for(p4_phys: u64) -> OffsetPageTable<'static> {
    let table = table_at(PhysAddr::new(p4_phys));
    OffsetPageTable::new(table, VirtAddr::new(*PHYS_OFFSET.get().unwrap()))
}

/// Page map of the boot kernel, used for the heap and shared kernel entries.
pub unsafe fn kernel_mapper() -> OffsetPageTable<'static> {
    mapper_for(*KERNEL_P4.get().expect("paging not initialized"))
}

pub fn kernel_p4() -> u64 {
    *KERNEL_P4.get().expect("paging not initialized")
}

pub fn current_p4() -> u64 {
    Cr3::read().0.start_address().as_u64()
}

/// Switch to the given page map.
pub fn activate(p4_phys: u64) {
    unsafe {
        Cr3::write(
            PhysFrame::containing_address(PhysAddr::new(p4_phys)),
            Cr3::read().1,
        );
    }
}

fn alloc_table() -> Option<PhysFrame> {
    let frame = super::KERNEL_POOL.lock().alloc()?;
    let table = unsafe { table_at(frame.start_address()) };
    table.zero();
    Some(frame)
}

/// Build a fresh page map for a user process.
///
/// Kernel P4 entries are shared; the tables covering the user range are
/// deep-copied down to the level where kernel low mappings (below
/// `USER_BASE`) end, so user mappings never touch a shared table.
pub fn create_user_page_map() -> Option<u64> {
    let p4_frame = alloc_table()?;
    let p4 = unsafe { table_at(p4_frame.start_address()) };
    let kernel_p4 = unsafe { table_at(PhysAddr::new(*KERNEL_P4.get().unwrap())) };

    for i in 1..ENTRIES_PER_TABLE {
        if !kernel_p4[i].is_unused() {
            p4[i].set_addr(kernel_p4[i].addr(), kernel_p4[i].flags());
        }
    }

    if kernel_p4[0].is_unused() {
        return Some(p4_frame.start_address().as_u64());
    }

    let p3_frame = alloc_table()?;
    let p3 = unsafe { table_at(p3_frame.start_address()) };
    let kernel_p3 = unsafe { table_at(kernel_p4[0].addr()) };

    // Only P3[0] (first GiB) can hold mappings below USER_BASE.
    if !kernel_p3[0].is_unused() {
        let p2_frame = alloc_table()?;
        let p2 = unsafe { table_at(p2_frame.start_address()) };
        let kernel_p2 = unsafe { table_at(kernel_p3[0].addr()) };
        for i in 0..(USER_BASE / P2_SPAN) as usize {
            if !kernel_p2[i].is_unused() {
                p2[i].set_addr(kernel_p2[i].addr(), kernel_p2[i].flags());
            }
        }
        p3[0].set_addr(
            p2_frame.start_address(),
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE,
        );
    }

    p4[0].set_addr(
        p3_frame.start_address(),
        PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE,
    );

    Some(p4_frame.start_address().as_u64())
}

/// Free the page-table frames owned by a user page map.
///
/// User data frames must already have been released (supplemental page
/// table teardown unmaps them); only table frames are freed here.
pub fn destroy_user_page_map(p4_phys: u64) {
    assert_ne!(p4_phys, kernel_p4());
    let mut pool = super::KERNEL_POOL.lock();
    let p4 = unsafe { table_at(PhysAddr::new(p4_phys)) };

    if !p4[0].is_unused() {
        let p3 = unsafe { table_at(p4[0].addr()) };
        for (p3_idx, p3_entry) in p3.iter().enumerate() {
            if p3_entry.is_unused() {
                continue;
            }
            let p2 = unsafe { table_at(p3_entry.addr()) };
            let first_user_p2 = if p3_idx == 0 {
                (USER_BASE / P2_SPAN) as usize
            } else {
                0
            };
            for p2_entry in p2.iter().skip(first_user_p2) {
                if !p2_entry.is_unused()
                    && !p2_entry.flags().contains(PageTableFlags::HUGE_PAGE)
                {
                    pool.free(PhysFrame::containing_address(p2_entry.addr()));
                }
            }
            pool.free(PhysFrame::containing_address(p3_entry.addr()));
        }
        pool.free(PhysFrame::containing_address(p4[0].addr()));
    }
    pool.free(PhysFrame::containing_address(PhysAddr::new(p4_phys)));
}

/// Map one user page. Fails if `va` is outside the user range or already
/// mapped.
pub fn map_user_page(p4_phys: u64, va: u64, frame_phys: u64, writable: bool) -> bool {
    if !is_user_vaddr(va) || pg_ofs(va) != 0 {
        return false;
    }
    let mut mapper = unsafe { mapper_for(p4_phys) };
    let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
    if writable {
        flags |= PageTableFlags::WRITABLE;
    }
    let parent_flags =
        PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;
    let page = Page::<Size4KiB>::containing_address(VirtAddr::new(va));
    let frame = PhysFrame::containing_address(PhysAddr::new(frame_phys));
    match unsafe {
        mapper.map_to_with_table_flags(page, frame, flags, parent_flags, &mut KernelFrameAllocator)
    } {
        Ok(flush) => {
            if current_p4() == p4_phys {
                flush.flush();
            } else {
                flush.ignore();
            }
            true
        }
        Err(_) => false,
    }
}

/// Remove the translation for `va`, returning the frame it pointed at.
pub fn unmap_user_page(p4_phys: u64, va: u64) -> Option<PhysFrame> {
    let mut mapper = unsafe { mapper_for(p4_phys) };
    let page = Page::<Size4KiB>::containing_address(VirtAddr::new(va));
    match mapper.unmap(page) {
        Ok((frame, flush)) => {
            if current_p4() == p4_phys {
                flush.flush();
            } else {
                flush.ignore();
            }
            Some(frame)
        }
        Err(_) => None,
    }
}

fn find_pte(p4_phys: u64, va: u64) -> Option<&'static mut x86_64::structures::paging::page_table::PageTableEntry> {
    let mut table = unsafe { table_at(PhysAddr::new(p4_phys)) };
    for shift in [39u64, 30, 21] {
        let idx = ((va >> shift) & 0x1ff) as usize;
        let entry = &table[idx];
        if !entry.flags().contains(PageTableFlags::PRESENT) {
            return None;
        }
        table = unsafe { table_at(entry.addr()) };
    }
    let entry = &mut table[((va >> 12) & 0x1ff) as usize];
    if entry.flags().contains(PageTableFlags::PRESENT) {
        Some(entry)
    } else {
        None
    }
}

pub fn is_mapped(p4_phys: u64, va: u64) -> bool {
    find_pte(p4_phys, pg_round_down(va)).is_some()
}

pub fn is_accessed(p4_phys: u64, va: u64) -> bool {
    find_pte(p4_phys, pg_round_down(va))
        .map(|e| e.flags().contains(PageTableFlags::ACCESSED))
        .unwrap_or(false)
}

pub fn clear_accessed(p4_phys: u64, va: u64) {
    let va = pg_round_down(va);
    if let Some(entry) = find_pte(p4_phys, va) {
        entry.set_flags(entry.flags() & !PageTableFlags::ACCESSED);
        if current_p4() == p4_phys {
            tlb::flush(VirtAddr::new(va));
        }
    }
}

pub fn is_dirty(p4_phys: u64, va: u64) -> bool {
    find_pte(p4_phys, pg_round_down(va))
        .map(|e| e.flags().contains(PageTableFlags::DIRTY))
        .unwrap_or(false)
}

pub fn clear_dirty(p4_phys: u64, va: u64) {
    let va = pg_round_down(va);
    if let Some(entry) = find_pte(p4_phys, va) {
        entry.set_flags(entry.flags() & !PageTableFlags::DIRTY);
        if current_p4() == p4_phys {
            tlb::flush(VirtAddr::new(va));
        }
    }
}
