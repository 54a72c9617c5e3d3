//! Memory-mapped files: runs of lazily loaded file-backed descriptors,
//! dirty writeback on unmap.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::{LazyLoad, PageState, PageTarget, Spt};
use crate::fs::FileHandle;
use crate::memory::paging::PGSIZE;

/// Per-page layout of a mapping: (va, file offset, bytes read from the
/// file). The final page's remainder is zero-filled.
pub fn run_layout(addr: u64, length: u64, offset: u64) -> Vec<(u64, u64, u64)> {
    let mut pages = Vec::new();
    let mut va = addr;
    let mut ofs = offset;
    let mut remaining = length;
    while remaining > 0 {
        let read_bytes = remaining.min(PGSIZE);
        pages.push((va, ofs, read_bytes));
        va += PGSIZE;
        ofs += read_bytes;
        remaining -= read_bytes;
    }
    pages
}

/// Install the descriptor run for `mmap`. The caller has validated the
/// arguments and reopened the file privately; `length` is already capped
/// to the file size. Returns the mapped address.
pub fn do_mmap(
    spt: &Arc<Mutex<Spt>>,
    addr: u64,
    length: u64,
    writable: bool,
    file: Arc<Mutex<FileHandle>>,
    offset: u64,
) -> Option<u64> {
    let pages = run_layout(addr, length, offset);
    if pages.is_empty() {
        return None;
    }

    {
        let guard = spt.lock();
        if pages.iter().any(|&(va, _, _)| guard.find_page(va).is_some()) {
            return None;
        }
    }

    let run_len = pages.len();
    let mut guard = spt.lock();
    for (i, &(va, ofs, read_bytes)) in pages.iter().enumerate() {
        let created = guard.alloc_page_with_initializer(
            PageTarget::File {
                run_len: (i == 0).then_some(run_len),
            },
            va,
            writable,
            Some(LazyLoad {
                file: file.clone(),
                offset: ofs,
                read_bytes,
            }),
        );
        // All pages were checked free above.
        assert!(created, "mmap descriptor collision");
    }
    Some(addr)
}

/// Run length recorded on the first page of a mapping, whether or not it
/// has been materialized yet.
fn run_len_at(spt: &Spt, addr: u64) -> Option<usize> {
    match &spt.find_page(addr)?.state {
        PageState::File { run_len, .. } => *run_len,
        PageState::Uninit {
            target: PageTarget::File { run_len },
            ..
        } => *run_len,
        _ => None,
    }
}

/// Unmap a mapping previously returned by `do_mmap`. Dirty pages are
/// written back as each descriptor is destroyed. Anything that is not the
/// start of a mapping is ignored.
pub fn do_munmap(spt: &Arc<Mutex<Spt>>, pml4: u64, addr: u64) {
    let Some(count) = run_len_at(&spt.lock(), addr) else {
        return;
    };
    for i in 0..count as u64 {
        super::remove_page(spt, pml4, addr + i * PGSIZE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_splits_six_kib_into_two_pages() {
        let pages = run_layout(0x50_0000, 6144, 0);
        assert_eq!(
            pages,
            [(0x50_0000, 0, 4096), (0x50_1000, 4096, 2048)]
        );
    }

    #[test]
    fn layout_respects_base_offset() {
        let pages = run_layout(0x60_0000, 4097, 0x3000);
        assert_eq!(
            pages,
            [(0x60_0000, 0x3000, 4096), (0x60_1000, 0x4000, 1)]
        );
    }

    #[test]
    fn mmap_records_run_length_on_first_page_only() {
        let fs = crate::fs::FileSys::new();
        fs.create("data", 6144);
        let handle = Arc::new(Mutex::new(fs.open("data").unwrap()));
        let spt = Arc::new(Mutex::new(Spt::new()));

        let mapped = do_mmap(&spt, 0x50_0000, 6144, true, handle, 0);
        assert_eq!(mapped, Some(0x50_0000));

        let guard = spt.lock();
        assert_eq!(run_len_at(&guard, 0x50_0000), Some(2));
        assert_eq!(run_len_at(&guard, 0x50_1000), None);
        assert!(guard.find_page(0x50_2000).is_none());
    }

    #[test]
    fn mmap_refuses_overlap_with_existing_pages() {
        let fs = crate::fs::FileSys::new();
        fs.create("data", 8192);
        let handle = Arc::new(Mutex::new(fs.open("data").unwrap()));
        let spt = Arc::new(Mutex::new(Spt::new()));
        spt.lock().alloc_page_with_initializer(
            PageTarget::Anon { stack: false },
            0x50_1000,
            true,
            None,
        );

        assert_eq!(do_mmap(&spt, 0x50_0000, 8192, true, handle, 0), None);
        // Nothing was half-installed.
        assert!(spt.lock().find_page(0x50_0000).is_none());
    }
}
