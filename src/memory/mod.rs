pub mod frame_allocator;
pub mod paging;

use bootloader::bootinfo::{MemoryMap, MemoryRegionType};
use frame_allocator::BitmapPool;
use lazy_static::lazy_static;
use spin::Mutex;

lazy_static! {
    /// Frames for the heap, page tables and kernel stacks.
    pub static ref KERNEL_POOL: Mutex<BitmapPool> = Mutex::new(BitmapPool::new());
    /// Frames handed to user pages. Exhaustion of this pool is what makes
    /// the frame table evict.
    pub static ref USER_POOL: Mutex<BitmapPool> = Mutex::new(BitmapPool::new());
}

pub fn init(phys_offset: u64, memory_map: &MemoryMap) {
    unsafe { paging::init(phys_offset) };

    // Split the usable physical memory evenly: the first half backs the
    // kernel pool, the rest is the user pool.
    let total_frames: u64 = memory_map
        .iter()
        .filter(|r| r.region_type == MemoryRegionType::Usable)
        .map(|r| r.range.end_frame_number - r.range.start_frame_number)
        .sum();
    let mut kernel_share = total_frames / 2;

    {
        let mut kernel_pool = KERNEL_POOL.lock();
        let mut user_pool = USER_POOL.lock();
        for region in memory_map
            .iter()
            .filter(|r| r.region_type == MemoryRegionType::Usable)
        {
            let mut start = region.range.start_frame_number;
            let end = region.range.end_frame_number;
            if kernel_share > 0 {
                let take = kernel_share.min(end - start);
                kernel_pool.add_region(start * 4096, (start + take) * 4096);
                kernel_share -= take;
                start += take;
            }
            if start < end {
                user_pool.add_region(start * 4096, end * 4096);
            }
        }
        crate::log_info!(
            "memory: {} kernel frames, {} user frames",
            kernel_pool.free_frames(),
            user_pool.free_frames()
        );
    }

    let mut mapper = unsafe { paging::kernel_mapper() };
    crate::allocator::init_heap(&mut mapper, &mut frame_allocator::KernelFrameAllocator)
        .expect("heap initialization failed");
    crate::log_info!("memory: heap ready");
}
