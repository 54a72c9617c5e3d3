pub mod scancodes;

use alloc::collections::VecDeque;
use lazy_static::lazy_static;
use scancodes::KeyboardState;
use spin::Mutex;
use x86_64::instructions::port::Port;

use crate::threads::sync::Semaphore;

const BUFFER_SIZE: usize = 256;

lazy_static! {
    static ref DECODER: Mutex<KeyboardState> = Mutex::new(KeyboardState::new());
    static ref INPUT: Mutex<VecDeque<u8>> = Mutex::new(VecDeque::new());
    /// Counts buffered bytes; upped from the IRQ handler, downed by
    /// blocked readers.
    static ref INPUT_SEMA: Semaphore = Semaphore::new(0);
}

pub fn init() {
    // Drain a stale scancode left in the 8042 controller.
    let mut port: Port<u8> = Port::new(0x60);
    let _ = unsafe { port.read() };
    crate::log_info!("keyboard: PS/2 driver ready");
}

/// Called from the keyboard IRQ handler with the raw scancode.
pub fn push_scancode(scancode: u8) {
    let Some(byte) = DECODER.lock().process_scancode(scancode) else {
        return;
    };
    let mut input = INPUT.lock();
    if input.len() >= BUFFER_SIZE {
        return; // drop when the reader is too far behind
    }
    input.push_back(byte);
    drop(input);
    INPUT_SEMA.up();
}

/// Blocking console input; backs `read` on fd 0.
pub fn getc() -> u8 {
    INPUT_SEMA.down();
    // The queue lock is shared with the IRQ handler.
    x86_64::instructions::interrupts::without_interrupts(|| {
        INPUT
            .lock()
            .pop_front()
            .expect("input semaphore out of sync with buffer")
    })
}

pub fn try_getc() -> Option<u8> {
    if INPUT_SEMA.try_down() {
        x86_64::instructions::interrupts::without_interrupts(|| {
            Some(
                INPUT
                    .lock()
                    .pop_front()
                    .expect("input semaphore out of sync with buffer"),
            )
        })
    } else {
        None
    }
}
