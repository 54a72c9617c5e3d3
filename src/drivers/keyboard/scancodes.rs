/// Decoder state for PS/2 scancode set 1: tracks modifiers and maps make
/// codes to bytes for the console input queue.
pub struct KeyboardState {
    shift_pressed: bool,
    caps_lock: bool,
    extended_scancode: bool,
}

impl KeyboardState {
    pub const fn new() -> Self {
        Self {
            shift_pressed: false,
            caps_lock: false,
            extended_scancode: false,
        }
    }

    fn letter(&self, lower: u8) -> Option<u8> {
        let upper = self.shift_pressed != self.caps_lock;
        Some(if upper { lower - b'a' + b'A' } else { lower })
    }

    fn shifted(&self, plain: u8, with_shift: u8) -> Option<u8> {
        Some(if self.shift_pressed { with_shift } else { plain })
    }

    /// Feed one raw scancode; returns the decoded byte for make codes
    /// that produce input, `None` for modifiers and break codes.
    pub fn process_scancode(&mut self, scancode: u8) -> Option<u8> {
        if scancode == 0xE0 {
            self.extended_scancode = true;
            return None;
        }
        if self.extended_scancode {
            // Extended keys (arrows, right modifiers) produce no console
            // bytes.
            self.extended_scancode = false;
            return None;
        }

        match scancode {
            0x2A | 0x36 => {
                self.shift_pressed = true;
                None
            }
            0xAA | 0xB6 => {
                self.shift_pressed = false;
                None
            }
            0x3A => {
                self.caps_lock = !self.caps_lock;
                None
            }

            0x02 => self.shifted(b'1', b'!'),
            0x03 => self.shifted(b'2', b'@'),
            0x04 => self.shifted(b'3', b'#'),
            0x05 => self.shifted(b'4', b'$'),
            0x06 => self.shifted(b'5', b'%'),
            0x07 => self.shifted(b'6', b'^'),
            0x08 => self.shifted(b'7', b'&'),
            0x09 => self.shifted(b'8', b'*'),
            0x0A => self.shifted(b'9', b'('),
            0x0B => self.shifted(b'0', b')'),
            0x0C => self.shifted(b'-', b'_'),
            0x0D => self.shifted(b'=', b'+'),

            0x10 => self.letter(b'q'),
            0x11 => self.letter(b'w'),
            0x12 => self.letter(b'e'),
            0x13 => self.letter(b'r'),
            0x14 => self.letter(b't'),
            0x15 => self.letter(b'y'),
            0x16 => self.letter(b'u'),
            0x17 => self.letter(b'i'),
            0x18 => self.letter(b'o'),
            0x19 => self.letter(b'p'),
            0x1A => self.shifted(b'[', b'{'),
            0x1B => self.shifted(b']', b'}'),

            0x1E => self.letter(b'a'),
            0x1F => self.letter(b's'),
            0x20 => self.letter(b'd'),
            0x21 => self.letter(b'f'),
            0x22 => self.letter(b'g'),
            0x23 => self.letter(b'h'),
            0x24 => self.letter(b'j'),
            0x25 => self.letter(b'k'),
            0x26 => self.letter(b'l'),
            0x27 => self.shifted(b';', b':'),
            0x28 => self.shifted(b'\'', b'"'),
            0x29 => self.shifted(b'`', b'~'),
            0x2B => self.shifted(b'\\', b'|'),

            0x2C => self.letter(b'z'),
            0x2D => self.letter(b'x'),
            0x2E => self.letter(b'c'),
            0x2F => self.letter(b'v'),
            0x30 => self.letter(b'b'),
            0x31 => self.letter(b'n'),
            0x32 => self.letter(b'm'),
            0x33 => self.shifted(b',', b'<'),
            0x34 => self.shifted(b'.', b'>'),
            0x35 => self.shifted(b'/', b'?'),

            0x1C => Some(b'\n'),
            0x39 => Some(b' '),
            0x0E => Some(0x08), // backspace
            0x0F => Some(b'\t'),

            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_and_shifted_letters() {
        let mut state = KeyboardState::new();
        assert_eq!(state.process_scancode(0x1E), Some(b'a'));
        state.process_scancode(0x2A); // shift down
        assert_eq!(state.process_scancode(0x1E), Some(b'A'));
        assert_eq!(state.process_scancode(0x03), Some(b'@'));
        state.process_scancode(0xAA); // shift up
        assert_eq!(state.process_scancode(0x03), Some(b'2'));
    }

    #[test]
    fn caps_lock_affects_letters_not_digits() {
        let mut state = KeyboardState::new();
        state.process_scancode(0x3A);
        assert_eq!(state.process_scancode(0x10), Some(b'Q'));
        assert_eq!(state.process_scancode(0x0B), Some(b'0'));
        // Shift inverts caps for letters.
        state.process_scancode(0x2A);
        assert_eq!(state.process_scancode(0x10), Some(b'q'));
    }

    #[test]
    fn break_codes_and_extended_produce_nothing() {
        let mut state = KeyboardState::new();
        assert_eq!(state.process_scancode(0x9E), None); // 'a' release
        assert_eq!(state.process_scancode(0xE0), None);
        assert_eq!(state.process_scancode(0x48), None); // extended arrow
        // Decoder state recovered: next make code decodes normally.
        assert_eq!(state.process_scancode(0x1C), Some(b'\n'));
    }
}
