//! Syscall dispatch: `syscall`-instruction entry via MSR setup, a full
//! register frame, pointer validation, and the per-call handlers.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::arch::naked_asm;
use spin::Mutex;
use x86_64::instructions::port::Port;
use x86_64::registers::model_specific::{Efer, EferFlags, LStar, SFMask, Star};
use x86_64::registers::rflags::RFlags;
use x86_64::VirtAddr;

use super::process::{self, MAX_FILE_DESCRIPTOR};
use crate::fs::{FileHandle, FILESYS, FS_LOCK};
use crate::memory::paging::{self, pg_round_down, PGSIZE};
use crate::threads;
use crate::vm;

// Syscall numbers, as the user library places them in rax.
pub const SYS_HALT: u64 = 0;
pub const SYS_EXIT: u64 = 1;
pub const SYS_FORK: u64 = 2;
pub const SYS_EXEC: u64 = 3;
pub const SYS_WAIT: u64 = 4;
pub const SYS_CREATE: u64 = 5;
pub const SYS_REMOVE: u64 = 6;
pub const SYS_OPEN: u64 = 7;
pub const SYS_FILESIZE: u64 = 8;
pub const SYS_READ: u64 = 9;
pub const SYS_WRITE: u64 = 10;
pub const SYS_SEEK: u64 = 11;
pub const SYS_TELL: u64 = 12;
pub const SYS_CLOSE: u64 = 13;
pub const SYS_MMAP: u64 = 14;
pub const SYS_MUNMAP: u64 = 15;

const MAX_PATH: usize = 4096;

/// Everything the CPU and the entry stub know about the interrupted user
/// context. Field order matches the stub's store offsets; fork snapshots
/// this wholesale.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct SyscallFrame {
    pub rax: u64,    // 0x00 number in, result out
    pub rbx: u64,    // 0x08
    pub rcx: u64,    // 0x10 user rip (hardware)
    pub rdx: u64,    // 0x18
    pub rbp: u64,    // 0x20
    pub rdi: u64,    // 0x28
    pub rsi: u64,    // 0x30
    pub r8: u64,     // 0x38
    pub r9: u64,     // 0x40
    pub r10: u64,    // 0x48
    pub r11: u64,    // 0x50 user rflags (hardware)
    pub r12: u64,    // 0x58
    pub r13: u64,    // 0x60
    pub r14: u64,    // 0x68
    pub r15: u64,    // 0x70
    pub rsp: u64,    // 0x78
    pub rip: u64,    // 0x80
    pub rflags: u64, // 0x88
    pub cs: u64,     // 0x90
    pub ss: u64,     // 0x98
}

/// Kernel stack the entry stub switches to; the scheduler points this at
/// the running thread's stack on every context switch.
static mut KERNEL_SYSCALL_RSP: u64 = 0;
/// One-slot scratch for the user rsp between stack switch and frame
/// store. Safe on a single CPU with interrupts masked by SFMASK.
static mut USER_RSP_SCRATCH: u64 = 0;

pub fn set_kernel_stack(top: u64) {
    unsafe {
        KERNEL_SYSCALL_RSP = top;
    }
}

/// Wire up the `syscall` instruction: selectors in STAR, the entry stub
/// in LSTAR, and the flags to clear on entry in SFMASK.
pub fn init() {
    let selectors = &crate::interrupts::gdt::GDT.1;
    unsafe {
        Star::write(
            crate::interrupts::gdt::user_code_selector(),
            crate::interrupts::gdt::user_data_selector(),
            selectors.kernel_code,
            selectors.kernel_data,
        )
        .expect("STAR selector layout");
        LStar::write(VirtAddr::new(syscall_entry as *const () as u64));
        SFMask::write(
            RFlags::INTERRUPT_FLAG
                | RFlags::TRAP_FLAG
                | RFlags::DIRECTION_FLAG
                | RFlags::IOPL_LOW
                | RFlags::IOPL_HIGH
                | RFlags::ALIGNMENT_CHECK
                | RFlags::NESTED_TASK,
        );
        Efer::update(|flags| flags.insert(EferFlags::SYSTEM_CALL_EXTENSIONS));
    }
    crate::log_info!("syscall: MSR entry path ready");
}

/// Entry stub: move onto the thread's kernel stack, lay down a
/// `SyscallFrame`, dispatch, restore and `sysretq`. Interrupts are masked
/// on entry (SFMASK) and re-masked before the register restore.
#[unsafe(naked)]
extern "C" fn syscall_entry() {
    naked_asm!(
        "mov [rip + {scratch}], rsp",
        "mov rsp, [rip + {kstack}]",
        "sub rsp, 0xA0",
        "mov [rsp + 0x00], rax",
        "mov [rsp + 0x08], rbx",
        "mov [rsp + 0x10], rcx",
        "mov [rsp + 0x18], rdx",
        "mov [rsp + 0x20], rbp",
        "mov [rsp + 0x28], rdi",
        "mov [rsp + 0x30], rsi",
        "mov [rsp + 0x38], r8",
        "mov [rsp + 0x40], r9",
        "mov [rsp + 0x48], r10",
        "mov [rsp + 0x50], r11",
        "mov [rsp + 0x58], r12",
        "mov [rsp + 0x60], r13",
        "mov [rsp + 0x68], r14",
        "mov [rsp + 0x70], r15",
        "mov rax, [rip + {scratch}]",
        "mov [rsp + 0x78], rax", // user rsp
        "mov [rsp + 0x80], rcx", // user rip
        "mov [rsp + 0x88], r11", // user rflags
        "mov rdi, rsp",
        "call {dispatch}",
        "cli",
        "mov rbx, [rsp + 0x08]",
        "mov rdx, [rsp + 0x18]",
        "mov rbp, [rsp + 0x20]",
        "mov rdi, [rsp + 0x28]",
        "mov rsi, [rsp + 0x30]",
        "mov r8,  [rsp + 0x38]",
        "mov r9,  [rsp + 0x40]",
        "mov r10, [rsp + 0x48]",
        "mov r12, [rsp + 0x58]",
        "mov r13, [rsp + 0x60]",
        "mov r14, [rsp + 0x68]",
        "mov r15, [rsp + 0x70]",
        "mov rcx, [rsp + 0x80]", // sysretq rip
        "mov r11, [rsp + 0x88]", // sysretq rflags
        "mov rax, [rsp + 0x00]", // result
        "mov rsp, [rsp + 0x78]", // back to the user stack
        "sysretq",
        scratch = sym USER_RSP_SCRATCH,
        kstack = sym KERNEL_SYSCALL_RSP,
        dispatch = sym syscall_dispatch,
    );
}

/// Build the frame `exec` and the fork child restore through `iretq`.
pub fn user_frame(entry: u64, rsp: u64, rdi: u64, rsi: u64) -> SyscallFrame {
    SyscallFrame {
        rax: 0,
        rbx: 0,
        rcx: 0,
        rdx: 0,
        rbp: 0,
        rdi,
        rsi,
        r8: 0,
        r9: 0,
        r10: 0,
        r11: 0,
        r12: 0,
        r13: 0,
        r14: 0,
        r15: 0,
        rsp,
        rip: entry,
        rflags: RFlags::INTERRUPT_FLAG.bits() | 0x2,
        cs: crate::interrupts::gdt::user_code_selector().0 as u64,
        ss: crate::interrupts::gdt::user_data_selector().0 as u64,
    }
}

/// Drop into user mode from a full frame.
///
/// # Safety
/// The frame must describe a valid Ring 3 context in the current address
/// space.
pub unsafe fn restore_user_frame(frame: &SyscallFrame) -> ! {
    core::arch::asm!(
        "cli",
        "push qword ptr [rdi + 0x98]", // ss
        "push qword ptr [rdi + 0x78]", // rsp
        "push qword ptr [rdi + 0x88]", // rflags
        "push qword ptr [rdi + 0x90]", // cs
        "push qword ptr [rdi + 0x80]", // rip
        "mov rax, [rdi + 0x00]",
        "mov rbx, [rdi + 0x08]",
        "mov rcx, [rdi + 0x10]",
        "mov rdx, [rdi + 0x18]",
        "mov rbp, [rdi + 0x20]",
        "mov rsi, [rdi + 0x30]",
        "mov r8,  [rdi + 0x38]",
        "mov r9,  [rdi + 0x40]",
        "mov r10, [rdi + 0x48]",
        "mov r11, [rdi + 0x50]",
        "mov r12, [rdi + 0x58]",
        "mov r13, [rdi + 0x60]",
        "mov r14, [rdi + 0x68]",
        "mov r15, [rdi + 0x70]",
        "mov rdi, [rdi + 0x28]",
        "iretq",
        in("rdi") frame,
        options(noreturn),
    );
}

/// Terminate the current process as killed by the kernel.
pub fn kill_current() -> ! {
    process::exit_process(-1)
}

// ══════════════════════════════════════════════════════════════
//  Validation
// ══════════════════════════════════════════════════════════════

/// A user pointer is valid when it is non-null, below the kernel range,
/// and either translated, known to the supplemental page table, or
/// eligible for stack growth. Anything else kills the process.
fn check_address(addr: u64) {
    if addr == 0 || !paging::is_user_vaddr(addr) {
        kill_current();
    }
    let ok = threads::with_current(|t| {
        let Some(pml4) = t.pml4 else { return false };
        if paging::is_mapped(pml4, addr) {
            return true;
        }
        if let Some(spt) = &t.spt {
            if spt.lock().find_page(addr).is_some() {
                return true;
            }
        }
        vm::is_stack_access(addr, t.user_rsp)
    });
    if !ok {
        kill_current();
    }
}

/// Validate every page a buffer touches, and materialize lazy ones up
/// front so no fault fires later while file locks are held.
fn check_buffer(addr: u64, len: u64) {
    if len == 0 {
        return;
    }
    let mut page = pg_round_down(addr);
    check_address(addr);
    let last = pg_round_down(addr + (len - 1));
    loop {
        check_address(page);
        let (spt, pml4) = threads::with_current(|t| (t.spt.clone(), t.pml4));
        if let (Some(spt), Some(pml4)) = (spt, pml4) {
            if !paging::is_mapped(pml4, page) && spt.lock().find_page(page).is_some() {
                vm::claim_page(&spt, pml4, page);
            }
        }
        if page == last {
            break;
        }
        page += PGSIZE;
    }
}

/// Copy a NUL-terminated user string into kernel memory.
fn read_user_cstr(addr: u64) -> String {
    check_address(addr);
    let mut bytes: Vec<u8> = Vec::new();
    let mut at = addr;
    loop {
        if bytes.len() >= MAX_PATH {
            kill_current();
        }
        if at % PGSIZE == 0 {
            check_address(at);
        }
        let byte = unsafe { (at as *const u8).read() };
        if byte == 0 {
            break;
        }
        bytes.push(byte);
        at += 1;
    }
    match String::from_utf8(bytes) {
        Ok(s) => s,
        Err(_) => kill_current(),
    }
}

fn get_file(fd: u64) -> Option<Arc<Mutex<FileHandle>>> {
    let fd = fd as usize;
    if fd >= MAX_FILE_DESCRIPTOR {
        return None;
    }
    threads::with_current(|t| t.fd_table.get(fd).and_then(|slot| slot.clone()))
}

// ══════════════════════════════════════════════════════════════
//  Dispatch
// ══════════════════════════════════════════════════════════════

/// Called from the entry stub with the frame on the kernel stack.
/// Arguments arrive in rdi, rsi, rdx, r10, r8, r9; the result goes back
/// through rax.
extern "C" fn syscall_dispatch(frame: &mut SyscallFrame) {
    frame.cs = crate::interrupts::gdt::user_code_selector().0 as u64;
    frame.ss = crate::interrupts::gdt::user_data_selector().0 as u64;

    // Remember the user rsp for stack-growth checks on faults taken in
    // kernel mode.
    threads::with_current(|t| t.user_rsp = frame.rsp);

    // The stub entered with interrupts masked; the handlers may block and
    // take their time.
    x86_64::instructions::interrupts::enable();

    let (a0, a1, a2, a3, a4) = (frame.rdi, frame.rsi, frame.rdx, frame.r10, frame.r8);

    frame.rax = match frame.rax {
        SYS_HALT => sys_halt(),
        SYS_EXIT => process::exit_process(a0 as i32),
        SYS_FORK => sys_fork(a0, frame),
        SYS_EXEC => sys_exec(a0),
        SYS_WAIT => process::wait(a0) as u64,
        SYS_CREATE => sys_create(a0, a1),
        SYS_REMOVE => sys_remove(a0),
        SYS_OPEN => sys_open(a0),
        SYS_FILESIZE => sys_filesize(a0),
        SYS_READ => sys_read(a0, a1, a2),
        SYS_WRITE => sys_write(a0, a1, a2),
        SYS_SEEK => sys_seek(a0, a1),
        SYS_TELL => sys_tell(a0),
        SYS_CLOSE => sys_close(a0),
        SYS_MMAP => sys_mmap(a0, a1, a2, a3, a4),
        SYS_MUNMAP => sys_munmap(a0),
        _ => {
            crate::log_warn!("syscall: unknown number {}", frame.rax);
            kill_current();
        }
    };
}

// ══════════════════════════════════════════════════════════════
//  Handlers
// ══════════════════════════════════════════════════════════════

fn sys_halt() -> ! {
    crate::log_info!("halt: powering off");
    // QEMU ACPI PM1a control: sleep state S5.
    let mut port: Port<u16> = Port::new(0x604);
    unsafe {
        port.write(0x2000);
    }
    loop {
        x86_64::instructions::hlt();
    }
}

fn sys_fork(name_ptr: u64, frame: &SyscallFrame) -> u64 {
    let name = read_user_cstr(name_ptr);
    process::fork(&name, frame) as u64
}

fn sys_exec(cmdline_ptr: u64) -> u64 {
    // Copy out of user memory before exec tears the address space down.
    let cmdline = read_user_cstr(cmdline_ptr);
    process::exec(&cmdline) as u64
}

fn sys_create(name_ptr: u64, size: u64) -> u64 {
    let name = read_user_cstr(name_ptr);
    if name.is_empty() {
        kill_current();
    }
    let _fs = FS_LOCK.lock();
    FILESYS.create(&name, size) as u64
}

fn sys_remove(name_ptr: u64) -> u64 {
    let name = read_user_cstr(name_ptr);
    let _fs = FS_LOCK.lock();
    FILESYS.remove(&name) as u64
}

/// Lowest free descriptor ≥ 2, bounded by MAX_FILE_DESCRIPTOR.
fn sys_open(name_ptr: u64) -> u64 {
    let name = read_user_cstr(name_ptr);
    let _fs = FS_LOCK.lock();
    let Some(handle) = FILESYS.open(&name) else {
        return u64::MAX;
    };
    let mut handle = Some(handle);
    let fd = threads::with_current(|t| {
        for fd in 2..MAX_FILE_DESCRIPTOR {
            if t.fd_table[fd].is_none() {
                t.fd_table[fd] = Some(Arc::new(Mutex::new(handle.take().unwrap())));
                return Some(fd);
            }
        }
        None
    });
    match fd {
        Some(fd) => fd as u64,
        None => u64::MAX, // table full; the handle closes on drop
    }
}

fn sys_filesize(fd: u64) -> u64 {
    match get_file(fd) {
        Some(file) => file.lock().len(),
        None => u64::MAX,
    }
}

fn sys_read(fd: u64, buf: u64, len: u64) -> u64 {
    check_buffer(buf, len);
    // Reading into a read-only page is a protection error.
    let writable_dest = threads::with_current(|t| match &t.spt {
        Some(spt) => spt.lock().find_page(buf).map(|p| p.writable).unwrap_or(true),
        None => true,
    });
    if !writable_dest {
        kill_current();
    }

    if fd == 0 {
        let dest = unsafe { core::slice::from_raw_parts_mut(buf as *mut u8, len as usize) };
        for slot in dest.iter_mut() {
            *slot = crate::drivers::keyboard::getc();
        }
        return len;
    }

    let Some(file) = get_file(fd) else {
        return u64::MAX;
    };
    let dest = unsafe { core::slice::from_raw_parts_mut(buf as *mut u8, len as usize) };
    let _fs = FS_LOCK.lock();
    let n = file.lock().read(dest) as u64;
    n
}

fn sys_write(fd: u64, buf: u64, len: u64) -> u64 {
    check_buffer(buf, len);
    let src = unsafe { core::slice::from_raw_parts(buf as *const u8, len as usize) };

    if fd == 1 {
        crate::vga::putbuf(src);
        return len;
    }

    let Some(file) = get_file(fd) else {
        return u64::MAX;
    };
    let _fs = FS_LOCK.lock();
    let n = file.lock().write(src) as u64;
    n
}

fn sys_seek(fd: u64, pos: u64) -> u64 {
    if let Some(file) = get_file(fd) {
        let _fs = FS_LOCK.lock();
        file.lock().seek(pos);
    }
    0
}

fn sys_tell(fd: u64) -> u64 {
    match get_file(fd) {
        Some(file) => {
            let _fs = FS_LOCK.lock();
            file.lock().tell()
        }
        None => u64::MAX,
    }
}

fn sys_close(fd: u64) -> u64 {
    let fd = fd as usize;
    if (2..MAX_FILE_DESCRIPTOR).contains(&fd) {
        threads::with_current(|t| t.fd_table[fd] = None);
    }
    0
}

/// Map `length` bytes of `fd` at `addr`. NULL on any validation failure.
fn sys_mmap(addr: u64, length: u64, writable: u64, fd: u64, offset: u64) -> u64 {
    if addr == 0
        || (length as i64) <= 0
        || pg_round_down(addr) != addr
        || pg_round_down(offset) != offset
        || !paging::is_user_vaddr(addr)
        || fd < 2
    {
        return 0;
    }
    let Some(file) = get_file(fd) else {
        return 0;
    };

    let (spt, file_len) = {
        let spt = threads::with_current(|t| t.spt.clone());
        let Some(spt) = spt else { return 0 };
        let _fs = FS_LOCK.lock();
        (spt, file.lock().len())
    };
    if file_len == 0 {
        return 0;
    }
    let length = length.min(file_len);

    // The mapping must survive a close of the original fd.
    let private = {
        let _fs = FS_LOCK.lock();
        Arc::new(Mutex::new(file.lock().reopen()))
    };
    match vm::file::do_mmap(&spt, addr, length, writable != 0, private, offset) {
        Some(mapped) => mapped,
        None => 0,
    }
}

fn sys_munmap(addr: u64) -> u64 {
    let (spt, pml4) = threads::with_current(|t| (t.spt.clone(), t.pml4));
    if let (Some(spt), Some(pml4)) = (spt, pml4) {
        vm::file::do_munmap(&spt, pml4, addr);
    }
    0
}
