use super::gdt;
use lazy_static::lazy_static;
use pic8259::ChainedPics;
use spin::Mutex;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

pub static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum InterruptIndex {
    Timer = PIC_1_OFFSET,
    Keyboard = PIC_1_OFFSET + 1,
}

impl InterruptIndex {
    fn as_u8(self) -> u8 {
        self as u8
    }

    fn as_usize(self) -> usize {
        usize::from(self.as_u8())
    }
}

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_fault_handler);
        idt[InterruptIndex::Timer.as_usize()].set_handler_fn(timer_interrupt_handler);
        idt[InterruptIndex::Keyboard.as_usize()].set_handler_fn(keyboard_interrupt_handler);
        idt
    };
}

pub fn init() {
    IDT.load();
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    crate::println!("EXCEPTION: BREAKPOINT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    panic!("EXCEPTION: DOUBLE FAULT\n{:#?}", stack_frame);
}

/// Faults route into the virtual-memory layer: lazy loads, swap-ins and
/// stack growth resolve here. Anything genuine kills the process (user
/// fault) or the kernel (kernel fault outside a user access).
extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    use x86_64::registers::control::Cr2;

    let addr = Cr2::read().as_u64();
    let user = error_code.contains(PageFaultErrorCode::USER_MODE);
    let write = error_code.contains(PageFaultErrorCode::CAUSED_BY_WRITE);
    let not_present = !error_code.contains(PageFaultErrorCode::PROTECTION_VIOLATION);
    let rsp = stack_frame.stack_pointer.as_u64();

    if crate::vm::try_handle_fault(addr, user, write, not_present, rsp) {
        return;
    }

    let in_user_process = crate::threads::with_current(|t| t.pml4.is_some());
    if user || (in_user_process && crate::memory::paging::is_user_vaddr(addr)) {
        // A user access that cannot be satisfied: the process dies, the
        // kernel continues.
        crate::userprog::kill_current();
    }

    panic!(
        "kernel page fault at {:#x} (error {:?})\n{:#?}",
        addr, error_code, stack_frame
    );
}

extern "x86-interrupt" fn timer_interrupt_handler(_stack_frame: InterruptStackFrame) {
    let ticks = super::note_tick();
    unsafe {
        PICS.lock()
            .notify_end_of_interrupt(InterruptIndex::Timer.as_u8());
    }
    // Preempt once the slice is used up. try_yield skips the switch when
    // the tick landed inside a scheduler operation.
    if ticks % super::TIME_SLICE == 0 {
        crate::threads::try_yield_now();
    }
}

extern "x86-interrupt" fn keyboard_interrupt_handler(_stack_frame: InterruptStackFrame) {
    use x86_64::instructions::port::Port;

    super::enter_irq();
    let mut port: Port<u8> = Port::new(0x60);
    let scancode = unsafe { port.read() };
    crate::drivers::keyboard::push_scancode(scancode);
    super::leave_irq();

    unsafe {
        PICS.lock()
            .notify_end_of_interrupt(InterruptIndex::Keyboard.as_u8());
    }
}

extern "x86-interrupt" fn general_protection_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    panic!(
        "EXCEPTION: GENERAL PROTECTION FAULT\nError Code: {error_code}\n{:#?}",
        stack_frame
    );
}
