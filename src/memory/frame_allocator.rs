use bit_field::BitField;
use x86_64::{
    structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB},
    PhysAddr,
};

/// Highest physical address the bitmap covers (1 GiB).
const MAX_PHYS: u64 = 1 << 30;
const FRAME_SIZE: u64 = 4096;
const BITS_PER_WORD: usize = 64;
const WORD_COUNT: usize = (MAX_PHYS / FRAME_SIZE) as usize / BITS_PER_WORD;

/// Bitmap over physical frames. Bit set = allocated or unusable.
///
/// Two instances exist at runtime: the kernel pool (heap, page tables,
/// kernel stacks) and the user pool (frames handed to user pages, the pool
/// whose exhaustion triggers eviction).
pub struct BitmapPool {
    bitmap: [u64; WORD_COUNT],
    free_frames: usize,
}

impl BitmapPool {
    pub const fn new() -> Self {
        // Everything starts unusable; regions are opened with add_region.
        BitmapPool {
            bitmap: [u64::MAX; WORD_COUNT],
            free_frames: 0,
        }
    }

    /// Mark the frames of `[start, end)` (physical byte addresses) free.
    pub fn add_region(&mut self, start: u64, end: u64) {
        let first = start.div_ceil(FRAME_SIZE);
        let last = end / FRAME_SIZE;
        for frame in first..last {
            if frame >= (MAX_PHYS / FRAME_SIZE) {
                break;
            }
            let word = frame as usize / BITS_PER_WORD;
            let bit = frame as usize % BITS_PER_WORD;
            if self.bitmap[word].get_bit(bit) {
                self.bitmap[word].set_bit(bit, false);
                self.free_frames += 1;
            }
        }
    }

    pub fn alloc(&mut self) -> Option<PhysFrame> {
        for (word_idx, word) in self.bitmap.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit = (!*word).trailing_zeros() as usize;
                word.set_bit(bit, true);
                self.free_frames -= 1;
                let frame_number = (word_idx * BITS_PER_WORD + bit) as u64;
                return Some(PhysFrame::containing_address(PhysAddr::new(
                    frame_number * FRAME_SIZE,
                )));
            }
        }
        None
    }

    pub fn free(&mut self, frame: PhysFrame) {
        let frame_number = frame.start_address().as_u64() / FRAME_SIZE;
        let word = frame_number as usize / BITS_PER_WORD;
        let bit = frame_number as usize % BITS_PER_WORD;
        assert!(self.bitmap[word].get_bit(bit), "double free of frame");
        self.bitmap[word].set_bit(bit, false);
        self.free_frames += 1;
    }

    pub fn free_frames(&self) -> usize {
        self.free_frames
    }
}

/// Allocator handle over the kernel pool, in the shape the `x86_64` mapper
/// wants for page-table frames.
pub struct KernelFrameAllocator;

unsafe impl FrameAllocator<Size4KiB> for KernelFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        super::KERNEL_POOL.lock().alloc()
    }
}

impl FrameDeallocator<Size4KiB> for KernelFrameAllocator {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame) {
        super::KERNEL_POOL.lock().free(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_returns_frames_from_added_region() {
        let mut pool = BitmapPool::new();
        assert!(pool.alloc().is_none());

        pool.add_region(0x10000, 0x14000); // 4 frames
        assert_eq!(pool.free_frames(), 4);

        let f = pool.alloc().unwrap();
        assert_eq!(f.start_address().as_u64(), 0x10000);
        assert_eq!(pool.free_frames(), 3);
    }

    #[test]
    fn partial_frames_at_region_edges_are_excluded() {
        let mut pool = BitmapPool::new();
        // Neither end is frame-aligned; only the middle frame is whole.
        pool.add_region(0x10800, 0x13800);
        assert_eq!(pool.free_frames(), 2);
    }

    #[test]
    fn free_makes_frame_reusable() {
        let mut pool = BitmapPool::new();
        pool.add_region(0x20000, 0x21000);
        let f = pool.alloc().unwrap();
        assert!(pool.alloc().is_none());
        pool.free(f);
        assert_eq!(pool.alloc().unwrap(), f);
    }

    #[test]
    #[should_panic]
    fn double_free_is_detected() {
        let mut pool = BitmapPool::new();
        pool.add_region(0x20000, 0x21000);
        let f = pool.alloc().unwrap();
        pool.free(f);
        pool.free(f);
    }
}
