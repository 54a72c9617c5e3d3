use core::arch::naked_asm;

/// Callee-saved register context of a suspended thread, per the System V
/// x86_64 ABI. Everything else lives on the thread's kernel stack.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Context {
    pub rsp: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
}

impl Context {
    /// Context of the boot thread; filled in on its first switch away.
    pub fn empty() -> Self {
        Context {
            rsp: 0, rbp: 0, rbx: 0,
            r12: 0, r13: 0, r14: 0, r15: 0,
            rip: 0,
        }
    }

    /// Context for a fresh thread. The first switch into it lands on
    /// `thread_start`, which reads the entry function from r12 and its
    /// argument from r13.
    pub fn fresh(entry: fn(usize), aux: usize, stack_top: u64) -> Self {
        // 16-byte alignment minus the return-address slot `call` would
        // have pushed, so the entry function sees a conformant stack.
        let aligned_sp = (stack_top - 8) & !0xF;

        Context {
            rsp: aligned_sp,
            rbp: 0,
            rbx: 0,
            r12: entry as u64,
            r13: aux as u64,
            r14: 0,
            r15: 0,
            rip: thread_start as *const () as u64,
        }
    }
}

/// First instructions of every spawned thread. Runs with the registers the
/// scheduler placed in the fresh context; interrupts were disabled across
/// the switch and are turned back on here.
#[unsafe(naked)]
extern "C" fn thread_start() {
    naked_asm!(
        "sti",
        "mov rdi, r13",
        "call r12",
        // entry returned; terminate the thread
        "call {exit}",
        exit = sym crate::threads::exit_thread,
    );
}

/// Switch from `old` to `new`: save callee-saved registers into `old`,
/// restore from `new`, and continue at the new context's rip.
///
/// # Safety
/// Both pointers must refer to valid contexts whose stacks stay alive for
/// the lifetime of the suspended thread. Must be called with interrupts
/// disabled.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(old: *mut Context, new: *const Context) {
    naked_asm!(
        // rdi = old
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x38], rax",

        // rsi = new
        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        "jmp qword ptr [rsi + 0x38]",

        // resumption point when this context is switched back in
        "2:",
        "ret",
    );
}
