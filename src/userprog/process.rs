//! Process lifecycle: exec of an ELF image into a fresh address space,
//! fork by address-space duplication, and the wait/exit rendezvous.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use spin::Mutex;

use crate::fs::{FileHandle, FILESYS, FS_LOCK};
use crate::memory::paging::{
    self, create_user_page_map, destroy_user_page_map, is_user_vaddr, pg_round_down, PGSIZE,
    USER_STACK,
};
use crate::threads::{self, Tid, PRI_DEFAULT};
use crate::vm::{self, LazyLoad, PageTarget, Spt};

use super::syscall::{restore_user_frame, user_frame};
use super::SyscallFrame;

pub const MAX_FILE_DESCRIPTOR: usize = 64;
const MAX_ARGUMENTS: usize = 128;

// ══════════════════════════════════════════════════════════════
//  ELF64 constants & headers
// ══════════════════════════════════════════════════════════════

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_X86_64: u16 = 62;
const EV_CURRENT: u32 = 1;
const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;

const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;
const PT_INTERP: u32 = 3;
const PT_SHLIB: u32 = 5;

bitflags::bitflags! {
    /// Program-header p_flags bits.
    #[derive(Debug, Clone, Copy)]
    pub struct SegmentFlags: u32 {
        const EXECUTABLE = 1;
        const WRITABLE = 2;
        const READABLE = 4;
    }
}

pub struct Elf64Ehdr {
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_phentsize: u16,
    pub e_phnum: u16,
}

impl Elf64Ehdr {
    pub fn parse(data: &[u8]) -> Result<Self, ExecError> {
        if data.len() < EHDR_SIZE {
            return Err(ExecError::InvalidFormat);
        }
        if data[0..4] != ELF_MAGIC {
            return Err(ExecError::InvalidFormat);
        }
        if data[4] != ELFCLASS64 || data[5] != ELFDATA2LSB {
            return Err(ExecError::UnsupportedArch);
        }

        let e_type = u16::from_le_bytes([data[16], data[17]]);
        let e_machine = u16::from_le_bytes([data[18], data[19]]);
        let e_version = u32::from_le_bytes(data[20..24].try_into().unwrap());
        if e_type != ET_EXEC {
            return Err(ExecError::UnsupportedType);
        }
        if e_machine != EM_X86_64 || e_version != EV_CURRENT {
            return Err(ExecError::UnsupportedArch);
        }

        let ehdr = Elf64Ehdr {
            e_entry: u64::from_le_bytes(data[24..32].try_into().unwrap()),
            e_phoff: u64::from_le_bytes(data[32..40].try_into().unwrap()),
            e_phentsize: u16::from_le_bytes([data[54], data[55]]),
            e_phnum: u16::from_le_bytes([data[56], data[57]]),
        };
        if ehdr.e_phentsize as usize != PHDR_SIZE || ehdr.e_phnum > 1024 {
            return Err(ExecError::InvalidFormat);
        }
        Ok(ehdr)
    }
}

#[derive(Clone, Copy)]
pub struct Elf64Phdr {
    pub p_type: u32,
    pub p_flags: SegmentFlags,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
}

impl Elf64Phdr {
    pub fn parse(data: &[u8]) -> Result<Self, ExecError> {
        if data.len() < PHDR_SIZE {
            return Err(ExecError::InvalidFormat);
        }
        Ok(Elf64Phdr {
            p_type: u32::from_le_bytes(data[0..4].try_into().unwrap()),
            p_flags: SegmentFlags::from_bits_truncate(u32::from_le_bytes(
                data[4..8].try_into().unwrap(),
            )),
            p_offset: u64::from_le_bytes(data[8..16].try_into().unwrap()),
            p_vaddr: u64::from_le_bytes(data[16..24].try_into().unwrap()),
            p_filesz: u64::from_le_bytes(data[32..40].try_into().unwrap()),
            p_memsz: u64::from_le_bytes(data[40..48].try_into().unwrap()),
        })
    }
}

#[derive(Debug)]
pub enum ExecError {
    FileNotFound,
    InvalidFormat,
    UnsupportedArch,
    UnsupportedType,
    BadSegment,
    MemoryError,
    TooManyArguments,
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExecError::FileNotFound => write!(f, "File not found"),
            ExecError::InvalidFormat => write!(f, "Invalid ELF format"),
            ExecError::UnsupportedArch => write!(f, "Unsupported architecture"),
            ExecError::UnsupportedType => write!(f, "Unsupported ELF type (need ET_EXEC)"),
            ExecError::BadSegment => write!(f, "Bad loadable segment"),
            ExecError::MemoryError => write!(f, "Memory allocation error"),
            ExecError::TooManyArguments => write!(f, "Argument list too long"),
        }
    }
}

// ══════════════════════════════════════════════════════════════
//  First user process
// ══════════════════════════════════════════════════════════════

/// Spawn the first user thread, which execs `cmdline`. The thread is
/// named after the first word of the command line.
pub fn create_initd(cmdline: &str) -> Tid {
    let name = cmdline.split_whitespace().next().unwrap_or("initd");
    let boxed = Box::new(String::from(cmdline));
    threads::spawn(name, PRI_DEFAULT, initd, Box::into_raw(boxed) as usize)
}

fn initd(aux: usize) {
    let cmdline = *unsafe { Box::from_raw(aux as *mut String) };
    if exec(&cmdline) < 0 {
        panic!("failed to launch initd: {}", cmdline);
    }
    unreachable!();
}

// ══════════════════════════════════════════════════════════════
//  exec
// ══════════════════════════════════════════════════════════════

/// Replace the current process image. On success this jumps to user mode
/// and never returns; on failure the old image is already gone and the
/// caller sees −1.
pub fn exec(cmdline: &str) -> i64 {
    match do_exec(cmdline) {
        Ok(never) => never,
        Err(e) => {
            crate::log_warn!("exec: {}: {}", cmdline, e);
            -1
        }
    }
}

fn do_exec(cmdline: &str) -> Result<i64, ExecError> {
    // Kill the current address space first; the command line was copied
    // into kernel memory by the caller.
    let (old_spt, old_pml4) = threads::with_current(|t| (t.spt.take(), t.pml4.take()));
    if let (Some(spt), Some(pml4)) = (old_spt, old_pml4) {
        paging::activate(paging::kernel_p4());
        vm::spt_destroy(&spt, pml4);
        destroy_user_page_map(pml4);
    }

    let args: Vec<&str> = cmdline.split_whitespace().collect();
    if args.is_empty() {
        return Err(ExecError::FileNotFound);
    }
    if args.len() > MAX_ARGUMENTS {
        return Err(ExecError::TooManyArguments);
    }

    let pml4 = create_user_page_map().ok_or(ExecError::MemoryError)?;
    let spt = Arc::new(Mutex::new(Spt::new()));
    threads::with_current(|t| {
        t.pml4 = Some(pml4);
        t.spt = Some(spt.clone());
        if t.fd_table.is_empty() {
            t.fd_table = core::iter::repeat_with(|| None)
                .take(MAX_FILE_DESCRIPTOR)
                .collect();
        }
    });
    paging::activate(pml4);

    let entry = {
        let _fs = FS_LOCK.lock();
        load(args[0], &spt, pml4)?
    };

    // The stack page is resident; marshal argv through its kernel alias.
    let stack_phys = spt
        .lock()
        .find_page(USER_STACK - PGSIZE)
        .and_then(|p| p.frame)
        .ok_or(ExecError::MemoryError)?;
    let stack_kva = paging::phys_to_virt(x86_64::PhysAddr::new(stack_phys));
    let stack_buf =
        unsafe { core::slice::from_raw_parts_mut(stack_kva.as_mut_ptr::<u8>(), PGSIZE as usize) };
    let (rsp, argv) =
        push_arguments(&args, stack_buf, USER_STACK).ok_or(ExecError::TooManyArguments)?;

    let frame = user_frame(entry, rsp, args.len() as u64, argv);
    unsafe { restore_user_frame(&frame) }
}

/// Load the ELF executable `name` into `spt` as lazy descriptors, set up
/// the initial stack page, deny writes to the image, and return the entry
/// point. Caller holds the filesystem lock.
fn load(name: &str, spt: &Arc<Mutex<Spt>>, pml4: u64) -> Result<u64, ExecError> {
    let mut file = FILESYS.open(name).ok_or(ExecError::FileNotFound)?;
    let file_len = file.len();

    let mut ehdr_buf = [0u8; EHDR_SIZE];
    if file.read_at(&mut ehdr_buf, 0) != EHDR_SIZE {
        return Err(ExecError::InvalidFormat);
    }
    let ehdr = Elf64Ehdr::parse(&ehdr_buf)?;

    // Segments read lazily share one private handle.
    let seg_file = Arc::new(Mutex::new(file.reopen()));

    for i in 0..ehdr.e_phnum as usize {
        let off = ehdr.e_phoff + (i * PHDR_SIZE) as u64;
        if off + PHDR_SIZE as u64 > file_len {
            return Err(ExecError::InvalidFormat);
        }
        let mut phdr_buf = [0u8; PHDR_SIZE];
        if file.read_at(&mut phdr_buf, off) != PHDR_SIZE {
            return Err(ExecError::InvalidFormat);
        }
        let phdr = Elf64Phdr::parse(&phdr_buf)?;

        match phdr.p_type {
            PT_DYNAMIC | PT_INTERP | PT_SHLIB => return Err(ExecError::UnsupportedType),
            PT_LOAD => {
                if !validate_segment(&phdr, file_len) {
                    return Err(ExecError::BadSegment);
                }
                let writable = phdr.p_flags.contains(SegmentFlags::WRITABLE);
                let file_page = phdr.p_offset & !(PGSIZE - 1);
                let mem_page = phdr.p_vaddr & !(PGSIZE - 1);
                let page_offset = phdr.p_vaddr & (PGSIZE - 1);
                let (read_bytes, zero_bytes) = if phdr.p_filesz > 0 {
                    let read = page_offset + phdr.p_filesz;
                    let total = (page_offset + phdr.p_memsz).div_ceil(PGSIZE) * PGSIZE;
                    (read, total - read)
                } else {
                    (0, (page_offset + phdr.p_memsz).div_ceil(PGSIZE) * PGSIZE)
                };
                load_segment(
                    seg_file.clone(),
                    file_page,
                    mem_page,
                    read_bytes,
                    zero_bytes,
                    writable,
                    spt,
                )?;
            }
            _ => {}
        }
    }

    // Writes to a running executable must fail until the process exits.
    file.deny_write();
    threads::with_current(|t| {
        t.executable = Some(file);
    });

    if !setup_stack(spt, pml4) {
        return Err(ExecError::MemoryError);
    }

    Ok(ehdr.e_entry)
}

/// Segment sanity checks before any descriptor is created.
pub fn validate_segment(phdr: &Elf64Phdr, file_len: u64) -> bool {
    // File offset and VA must agree on their page offset.
    if (phdr.p_offset & (PGSIZE - 1)) != (phdr.p_vaddr & (PGSIZE - 1)) {
        return false;
    }
    if phdr.p_offset > file_len {
        return false;
    }
    if phdr.p_memsz < phdr.p_filesz || phdr.p_memsz == 0 {
        return false;
    }
    // Entirely inside the user range, without wrapping. USER_BASE also
    // rules out page 0.
    let end = match phdr.p_vaddr.checked_add(phdr.p_memsz) {
        Some(end) => end,
        None => return false,
    };
    if !is_user_vaddr(phdr.p_vaddr) || !is_user_vaddr(end) {
        return false;
    }
    true
}

/// Install one segment as a run of UNINIT anonymous descriptors whose
/// lazy loader reads from the executable. Evicted segment pages go to
/// swap, not back to the file.
fn load_segment(
    file: Arc<Mutex<FileHandle>>,
    mut offset: u64,
    mut upage: u64,
    mut read_bytes: u64,
    mut zero_bytes: u64,
    writable: bool,
    spt: &Arc<Mutex<Spt>>,
) -> Result<(), ExecError> {
    assert_eq!((read_bytes + zero_bytes) % PGSIZE, 0);
    assert_eq!(pg_round_down(upage), upage);
    assert_eq!(offset % PGSIZE, 0);

    while read_bytes > 0 || zero_bytes > 0 {
        let page_read_bytes = read_bytes.min(PGSIZE);
        let page_zero_bytes = PGSIZE - page_read_bytes;

        let created = spt.lock().alloc_page_with_initializer(
            PageTarget::Anon { stack: false },
            upage,
            writable,
            Some(LazyLoad {
                file: file.clone(),
                offset,
                read_bytes: page_read_bytes,
            }),
        );
        if !created {
            return Err(ExecError::BadSegment);
        }

        read_bytes -= page_read_bytes;
        zero_bytes -= page_zero_bytes;
        upage += PGSIZE;
        offset += page_read_bytes;
    }
    Ok(())
}

/// Claim one anonymous, stack-tagged page just below USER_STACK.
fn setup_stack(spt: &Arc<Mutex<Spt>>, pml4: u64) -> bool {
    vm::grow_stack(spt, pml4, USER_STACK - PGSIZE)
}

/// Marshal the argument vector onto the user stack, whose top page is
/// `stack` (mapped at `stack_top - stack.len()`..`stack_top`). Returns
/// the final rsp and the address of argv[0]. Layout, top down: argument
/// strings in reverse order, zero padding to 8 bytes, a null pointer
/// word, the argv pointers in reverse order, a fake return address.
pub fn push_arguments(args: &[&str], stack: &mut [u8], stack_top: u64) -> Option<(u64, u64)> {
    let base = stack_top - stack.len() as u64;
    let mut sp = stack_top;

    let mut store = |sp: u64, bytes: &[u8], stack: &mut [u8]| {
        let at = (sp - base) as usize;
        stack[at..at + bytes.len()].copy_from_slice(bytes);
    };

    // Strings, last argument pushed first.
    let mut ptrs: Vec<u64> = Vec::with_capacity(args.len());
    for arg in args.iter().rev() {
        let needed = arg.len() as u64 + 1;
        sp = sp.checked_sub(needed)?;
        if sp < base {
            return None;
        }
        store(sp, arg.as_bytes(), stack);
        store(sp + arg.len() as u64, &[0], stack);
        ptrs.push(sp);
    }

    // Padding down to an 8-byte boundary.
    while sp % 8 != 0 {
        if sp == base {
            return None;
        }
        sp -= 1;
        store(sp, &[0], stack);
    }

    // argv[argc] = NULL, then the pointers, argv[argc-1] downward so
    // argv[0] lands lowest.
    let words = 1 + ptrs.len() as u64 + 1;
    if sp - base < words * 8 {
        return None;
    }
    sp -= 8;
    store(sp, &0u64.to_le_bytes(), stack);
    for &ptr in ptrs.iter() {
        sp -= 8;
        store(sp, &ptr.to_le_bytes(), stack);
    }
    let argv = sp;

    // Fake return address.
    sp -= 8;
    store(sp, &0u64.to_le_bytes(), stack);

    Some((sp, argv))
}

// ══════════════════════════════════════════════════════════════
//  fork
// ══════════════════════════════════════════════════════════════

/// Clone the current process. The parent gets the child tid (or −1); the
/// child resumes from the snapshot with rax = 0.
pub fn fork(name: &str, frame: &SyscallFrame) -> i64 {
    let parent = threads::current_tid();
    threads::with_current(|t| t.fork_frame = Some(Box::new(*frame)));

    let child = threads::spawn(name, PRI_DEFAULT, fork_child, parent as usize);

    let fork_done = threads::with_current(|t| t.fork_done.clone());
    fork_done.down();

    let failed = threads::with_thread(child, |c| c.exit_status == -2).unwrap_or(true);
    if failed {
        // Disown the corpse so the reaper can take it.
        threads::with_thread(child, |c| c.parent = None);
        threads::with_current(|t| t.children.retain(|&c| c != child));
        return -1;
    }
    child as i64
}

/// Child side of fork: rebuild the parent's address space and files, then
/// drop into user mode at the snapshot with rax forced to 0.
fn fork_child(aux: usize) {
    let parent = aux as Tid;

    let setup = || -> Option<SyscallFrame> {
        let mut frame = threads::with_thread(parent, |p| p.fork_frame.as_deref().copied())??;
        frame.rax = 0;

        let pml4 = create_user_page_map()?;
        let spt = Arc::new(Mutex::new(Spt::new()));
        threads::with_current(|t| {
            t.pml4 = Some(pml4);
            t.spt = Some(spt.clone());
        });
        paging::activate(pml4);

        let (parent_spt, parent_pml4) =
            threads::with_thread(parent, |p| (p.spt.clone(), p.pml4))?;
        let (parent_spt, parent_pml4) = parent_spt.zip(parent_pml4)?;
        if !vm::spt_copy(&parent_spt, parent_pml4, &spt, pml4) {
            return None;
        }

        let fds = threads::with_thread(parent, |p| {
            p.fd_table
                .iter()
                .map(|slot| {
                    slot.as_ref()
                        .map(|f| Arc::new(Mutex::new(f.lock().duplicate())))
                })
                .collect::<Vec<_>>()
        })?;
        threads::with_current(|t| t.fd_table = fds);

        Some(frame)
    };

    match setup() {
        Some(frame) => {
            if let Some(done) = threads::with_thread(parent, |p| p.fork_done.clone()) {
                done.up();
            }
            unsafe { restore_user_frame(&frame) };
        }
        None => {
            // Undo whatever was built before the failure; the parent
            // rendezvous does not happen for a stillborn child.
            threads::with_current(|t| t.exit_status = -2);
            let fds = threads::with_current(|t| core::mem::take(&mut t.fd_table));
            drop(fds);
            let (spt, pml4) = threads::with_current(|t| (t.spt.take(), t.pml4.take()));
            if let (Some(spt), Some(pml4)) = (spt, pml4) {
                paging::activate(paging::kernel_p4());
                vm::spt_destroy(&spt, pml4);
                destroy_user_page_map(pml4);
            }
            if let Some(done) = threads::with_thread(parent, |p| p.fork_done.clone()) {
                done.up();
            }
            threads::exit_thread();
        }
    }
}

// ══════════════════════════════════════════════════════════════
//  wait / exit
// ══════════════════════════════════════════════════════════════

/// Wait for a direct child to exit and collect its status. −1 for a tid
/// that is not an unwaited direct child.
pub fn wait(child_tid: Tid) -> i32 {
    let is_child = threads::with_current(|t| t.children.contains(&child_tid));
    if !is_child {
        return -1;
    }

    let (wait_ready, status_ready) =
        threads::with_current(|t| (t.wait_ready.clone(), t.status_ready.clone()));
    let Some(exit_gate) = threads::with_thread(child_tid, |c| c.exit_gate.clone()) else {
        return -1;
    };

    // Child announces it has begun exiting; we open its gate so it can
    // publish the status, then pick the status up.
    wait_ready.down();
    exit_gate.up();
    status_ready.down();

    threads::with_current(|t| {
        t.children.retain(|&c| c != child_tid);
        t.child_status
    })
}

/// Record the exit status, give back every owned resource, hand the
/// status to a waiting parent, and stop existing.
pub fn exit_process(status: i32) -> ! {
    let me = threads::current_tid();
    let (name, is_user) = threads::with_current(|t| {
        t.exit_status = status;
        (t.name.clone(), t.pml4.is_some())
    });
    if is_user {
        crate::println!("{}: exit({})", name, status);
    }

    // fds 2.. close with the table; the retained executable regains its
    // write permission when dropped.
    let fds = threads::with_current(|t| core::mem::take(&mut t.fd_table));
    drop(fds);
    let exe = threads::with_current(|t| t.executable.take());
    drop(exe);

    let (spt, pml4) = threads::with_current(|t| (t.spt.take(), t.pml4.take()));
    if let (Some(spt), Some(pml4)) = (spt, pml4) {
        paging::activate(paging::kernel_p4());
        vm::spt_destroy(&spt, pml4);
        destroy_user_page_map(pml4);
    }

    // Orphan the children. Any child parked in its exit rendezvous gets
    // its gate opened so it can finish dying.
    let children = threads::with_current(|t| core::mem::take(&mut t.children));
    for child in children {
        if let Some(gate) = threads::with_thread(child, |c| {
            c.parent = None;
            c.exit_gate.clone()
        }) {
            gate.up();
        }
    }

    // Rendezvous with the parent: wake its wait, hold at our gate until
    // it is ready to observe, publish the status, release it.
    if let Some(parent) = threads::with_current(|t| t.parent) {
        if let Some(wait_ready) = threads::with_thread(parent, |p| p.wait_ready.clone()) {
            wait_ready.up();
            let gate = threads::with_current(|t| t.exit_gate.clone());
            gate.down();

            // The parent may have died while we waited at the gate.
            if threads::with_current(|t| t.parent).is_some() {
                if let Some(status_ready) = threads::with_thread(parent, |p| {
                    p.child_status = status;
                    p.children.retain(|&c| c != me);
                    p.status_ready.clone()
                }) {
                    threads::with_current(|t| t.parent = None);
                    status_ready.up();
                }
            }
        } else {
            threads::with_current(|t| t.parent = None);
        }
    }

    threads::exit_thread()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_u64(buf: &[u8], base: u64, addr: u64) -> u64 {
        let at = (addr - base) as usize;
        u64::from_le_bytes(buf[at..at + 8].try_into().unwrap())
    }

    fn read_cstr(buf: &[u8], base: u64, addr: u64) -> &str {
        let at = (addr - base) as usize;
        let end = buf[at..].iter().position(|&b| b == 0).unwrap();
        core::str::from_utf8(&buf[at..at + end]).unwrap()
    }

    #[test]
    fn argv_layout_for_echo_x_y() {
        const TOP: u64 = USER_STACK;
        let mut stack = [0u8; 4096];
        let base = TOP - stack.len() as u64;

        let (rsp, argv) = push_arguments(&["echo", "x", "y"], &mut stack, TOP).unwrap();

        // rsp is 8-byte aligned and holds the fake return address.
        assert_eq!(rsp % 8, 0);
        assert_eq!(read_u64(&stack, base, rsp), 0);
        assert_eq!(argv, rsp + 8);

        // argv[0..3] point at the strings, argv[3] is NULL.
        let argv0 = read_u64(&stack, base, argv);
        let argv1 = read_u64(&stack, base, argv + 8);
        let argv2 = read_u64(&stack, base, argv + 16);
        assert_eq!(read_cstr(&stack, base, argv0), "echo");
        assert_eq!(read_cstr(&stack, base, argv1), "x");
        assert_eq!(read_cstr(&stack, base, argv2), "y");
        assert_eq!(read_u64(&stack, base, argv + 24), 0);

        // Strings sit above the pointer array, below the old top.
        assert!(argv0 > argv + 24 && argv0 < TOP);
    }

    #[test]
    fn argv_single_argument() {
        let mut stack = [0u8; 4096];
        let (rsp, argv) = push_arguments(&["prog"], &mut stack, USER_STACK).unwrap();
        let base = USER_STACK - 4096;
        assert_eq!(rsp % 8, 0);
        let argv0 = read_u64(&stack, base, argv);
        assert_eq!(read_cstr(&stack, base, argv0), "prog");
        assert_eq!(read_u64(&stack, base, argv + 8), 0);
    }

    #[test]
    fn argv_overflow_is_detected() {
        let mut stack = [0u8; 128];
        let long = "a".repeat(200);
        assert!(push_arguments(&[&long], &mut stack, USER_STACK).is_none());
    }

    #[test]
    fn ehdr_rejects_bad_magic_and_arch() {
        let mut hdr = [0u8; 64];
        assert!(Elf64Ehdr::parse(&hdr).is_err());

        hdr[0..4].copy_from_slice(&ELF_MAGIC);
        hdr[4] = ELFCLASS64;
        hdr[5] = ELFDATA2LSB;
        hdr[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        hdr[18..20].copy_from_slice(&0x28u16.to_le_bytes()); // aarch64
        hdr[20..24].copy_from_slice(&1u32.to_le_bytes());
        assert!(matches!(
            Elf64Ehdr::parse(&hdr),
            Err(ExecError::UnsupportedArch)
        ));
    }

    #[test]
    fn ehdr_accepts_wellformed_and_bounds_phnum() {
        let mut hdr = [0u8; 64];
        hdr[0..4].copy_from_slice(&ELF_MAGIC);
        hdr[4] = ELFCLASS64;
        hdr[5] = ELFDATA2LSB;
        hdr[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        hdr[18..20].copy_from_slice(&EM_X86_64.to_le_bytes());
        hdr[20..24].copy_from_slice(&1u32.to_le_bytes());
        hdr[24..32].copy_from_slice(&0x40_1000u64.to_le_bytes()); // entry
        hdr[32..40].copy_from_slice(&64u64.to_le_bytes()); // phoff
        hdr[54..56].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        hdr[56..58].copy_from_slice(&2u16.to_le_bytes());

        let parsed = Elf64Ehdr::parse(&hdr).unwrap();
        assert_eq!(parsed.e_entry, 0x40_1000);
        assert_eq!(parsed.e_phnum, 2);

        hdr[56..58].copy_from_slice(&1025u16.to_le_bytes());
        assert!(Elf64Ehdr::parse(&hdr).is_err());
    }

    #[test]
    fn segment_validation_rules() {
        let good = Elf64Phdr {
            p_type: PT_LOAD,
            p_flags: SegmentFlags::READABLE,
            p_offset: 0x1000,
            p_vaddr: 0x40_1000,
            p_filesz: 0x800,
            p_memsz: 0x1000,
        };
        assert!(validate_segment(&good, 0x10000));

        // Mismatched page offsets.
        let mut bad = Elf64Phdr { p_offset: 0x1200, ..good };
        assert!(!validate_segment(&bad, 0x10000));

        // memsz below filesz, or empty.
        bad = Elf64Phdr { p_offset: 0x1000, p_memsz: 0x400, ..good };
        assert!(!validate_segment(&bad, 0x10000));
        bad = Elf64Phdr { p_memsz: 0, p_filesz: 0, ..good };
        assert!(!validate_segment(&bad, 0x10000));

        // Page 0 and kernel addresses are off limits.
        bad = Elf64Phdr { p_vaddr: 0, p_offset: 0, ..good };
        assert!(!validate_segment(&bad, 0x10000));
        bad = Elf64Phdr { p_vaddr: 0xFFFF_8000_0000_1000, ..good };
        assert!(!validate_segment(&bad, 0x10000));

        // Address arithmetic must not wrap.
        bad = Elf64Phdr { p_vaddr: u64::MAX - 0xfff, p_memsz: 0x2000, ..good };
        assert!(!validate_segment(&bad, 0x10000));
    }
}
