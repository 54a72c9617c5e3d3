pub mod process;
pub mod syscall;

pub use syscall::{kill_current, set_kernel_stack as set_syscall_kernel_stack, SyscallFrame};

pub fn init() {
    syscall::init();
}
