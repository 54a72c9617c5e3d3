pub mod gdt;
pub mod idt;

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use x86_64::instructions::port::Port;

/// Timer ticks between forced preemptions.
pub const TIME_SLICE: u64 = 4;

/// Timer frequency programmed into the PIT.
const TIMER_HZ: u32 = 100;
const PIT_BASE_HZ: u32 = 1_193_182;

static TICKS: AtomicU64 = AtomicU64::new(0);
static IRQ_DEPTH: AtomicUsize = AtomicUsize::new(0);

pub fn init() {
    gdt::init();
    idt::init();

    unsafe {
        idt::PICS.lock().initialize();
    }
    init_pit();

    crate::log_info!("interrupts: GDT/IDT/PIC ready, timer at {} Hz", TIMER_HZ);
}

/// Program PIT channel 0 as a rate generator.
fn init_pit() {
    let divisor = (PIT_BASE_HZ / TIMER_HZ) as u16;
    let mut cmd: Port<u8> = Port::new(0x43);
    let mut data: Port<u8> = Port::new(0x40);
    unsafe {
        cmd.write(0x36u8);
        data.write((divisor & 0xFF) as u8);
        data.write((divisor >> 8) as u8);
    }
}

pub(crate) fn note_tick() -> u64 {
    TICKS.fetch_add(1, Ordering::Relaxed) + 1
}

pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Interrupt-context tracking: blocking primitives assert they are not
/// called while this is nonzero, and wake-ups skip the direct yield.
pub(crate) fn enter_irq() {
    IRQ_DEPTH.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn leave_irq() {
    IRQ_DEPTH.fetch_sub(1, Ordering::Relaxed);
}

pub fn in_irq() -> bool {
    IRQ_DEPTH.load(Ordering::Relaxed) != 0
}
