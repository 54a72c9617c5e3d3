use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::instructions::port::Port;

/// 16550-style UART on COM1, used for kernel logging.
pub struct SerialPort {
    data: Port<u8>,
    int_en: Port<u8>,
    fifo_ctrl: Port<u8>,
    line_ctrl: Port<u8>,
    modem_ctrl: Port<u8>,
    line_sts: Port<u8>,
}

impl SerialPort {
    pub const unsafe fn new(base: u16) -> SerialPort {
        SerialPort {
            data: Port::new(base),
            int_en: Port::new(base + 1),
            fifo_ctrl: Port::new(base + 2),
            line_ctrl: Port::new(base + 3),
            modem_ctrl: Port::new(base + 4),
            line_sts: Port::new(base + 5),
        }
    }

    pub fn init(&mut self) {
        unsafe {
            self.int_en.write(0x00);       // mask UART interrupts
            self.line_ctrl.write(0x80);    // DLAB on
            self.data.write(0x03);         // divisor 3 = 38400 baud
            self.int_en.write(0x00);
            self.line_ctrl.write(0x03);    // 8N1
            self.fifo_ctrl.write(0xC7);
            self.modem_ctrl.write(0x0B);
        }
    }

    fn wait_for_tx_empty(&mut self) {
        unsafe {
            while (self.line_sts.read() & 0x20) == 0 {}
        }
    }

    pub fn send(&mut self, data: u8) {
        self.wait_for_tx_empty();
        unsafe {
            self.data.write(data);
        }
    }
}

impl core::fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for byte in s.bytes() {
            self.send(byte);
        }
        Ok(())
    }
}

lazy_static! {
    pub static ref SERIAL1: Mutex<SerialPort> = {
        let mut serial_port = unsafe { SerialPort::new(0x3F8) };
        serial_port.init();
        Mutex::new(serial_port)
    };
}

#[doc(hidden)]
pub fn _print(args: ::core::fmt::Arguments) {
    use core::fmt::Write;
    // Must not deadlock against an interrupt handler that also logs.
    x86_64::instructions::interrupts::without_interrupts(|| {
        let _ = SERIAL1.lock().write_fmt(args);
    });
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        {
            $crate::serial::_print(format_args!("[INFO] "));
            $crate::serial::_print(format_args!($($arg)*));
            $crate::serial::_print(format_args!("\n"));
        }
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        {
            $crate::serial::_print(format_args!("[WARN] "));
            $crate::serial::_print(format_args!($($arg)*));
            $crate::serial::_print(format_args!("\n"));
        }
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        {
            $crate::serial::_print(format_args!("[ERROR] "));
            $crate::serial::_print(format_args!($($arg)*));
            $crate::serial::_print(format_args!("\n"));
        }
    };
}

pub fn init() {
    let _ = SERIAL1.lock();
}
