//! PS/2 keyboard: the data port and a scancode set 1 decoder.
use alloc::collections::VecDeque;

/// I/O port the controller latches scancodes into.
pub const KEYBOARD_PORT: u16 = 0x60;

bitflags::bitflags! {
    /// State bits of a [`KeyEvent`].
    pub struct KeyFlags: u32 {
        /// The event carries a character.
        const HAS_DATA = 1 << 8;
        /// Key press (as opposed to release).
        const MAKE = 1 << 9;
        /// A shift key is held.
        const SHIFT = 1 << 10;
        /// A control key is held.
        const CTRL = 1 << 11;
        /// Caps lock is on.
        const CAPS = 1 << 12;
    }
}

/// A decoded scancode: a character in the low byte, augmented with
/// [`KeyFlags`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct KeyEvent(pub u32);

impl KeyEvent {
    /// Event without data, e.g. a modifier change or a prefix byte.
    pub const NONE: Self = Self(0);

    /// Whether the event carries a character.
    pub fn has_data(&self) -> bool {
        KeyFlags::from_bits_truncate(self.0).contains(KeyFlags::HAS_DATA)
    }

    /// Whether the event is a key press.
    pub fn is_make(&self) -> bool {
        KeyFlags::from_bits_truncate(self.0).contains(KeyFlags::MAKE)
    }

    /// The character.
    pub fn char(&self) -> u8 {
        self.0 as u8
    }
}

/// Turns raw scancodes into key events.
pub trait ScancodeDecoder: Send {
    /// Decode one raw scancode. Decoders are stateful: modifier keys change
    /// how later scancodes decode.
    fn process_scancode(&mut self, scancode: u8) -> KeyEvent;
}

// Scancode set 1, indexed by make code.
const NORMAL: &[u8] = b"\0\x1b1234567890-=\x08\tqwertyuiop[]\n\0asdfghjkl;'`\0\\zxcvbnm,./\0*\0 ";
const SHIFTED: &[u8] = b"\0\x1b!@#$%^&*()_+\x08\tQWERTYUIOP{}\n\0ASDFGHJKL:\"~\0|ZXCVBNM<>?\0*\0 ";

const SC_EXTENDED: u8 = 0xe0;
const SC_LCTRL: u8 = 0x1d;
const SC_LSHIFT: u8 = 0x2a;
const SC_RSHIFT: u8 = 0x36;
const SC_CAPS: u8 = 0x3a;
const SC_BREAK: u8 = 0x80;

/// US layout decoder.
#[derive(Default)]
pub struct UsKeyboard {
    shift: bool,
    ctrl: bool,
    caps: bool,
    extended: bool,
}

impl UsKeyboard {
    /// Decoder with no modifier held.
    pub fn new() -> Self {
        Self::default()
    }

    fn modifiers(&self) -> KeyFlags {
        let mut flags = KeyFlags::empty();
        flags.set(KeyFlags::SHIFT, self.shift);
        flags.set(KeyFlags::CTRL, self.ctrl);
        flags.set(KeyFlags::CAPS, self.caps);
        flags
    }
}

impl ScancodeDecoder for UsKeyboard {
    fn process_scancode(&mut self, scancode: u8) -> KeyEvent {
        if scancode == SC_EXTENDED {
            self.extended = true;
            return KeyEvent::NONE;
        }
        let extended = core::mem::replace(&mut self.extended, false);
        let make = scancode & SC_BREAK == 0;
        let code = scancode & !SC_BREAK;

        match code {
            SC_LSHIFT | SC_RSHIFT if !extended => self.shift = make,
            SC_LCTRL => self.ctrl = make,
            SC_CAPS => {
                if make {
                    self.caps = !self.caps;
                }
            }
            _ => {}
        }

        let table = if self.shift { SHIFTED } else { NORMAL };
        let mut ch = match table.get(code as usize) {
            Some(&ch) if !extended => ch,
            _ => 0,
        };
        if self.caps && ch.is_ascii_alphabetic() {
            ch ^= 0x20;
        }

        let mut flags = self.modifiers();
        flags.set(KeyFlags::MAKE, make);
        flags.set(KeyFlags::HAS_DATA, ch != 0);
        KeyEvent(flags.bits() | ch as u32)
    }
}

/// The controller's data port.
#[derive(Default)]
pub struct Ps2Port {
    latched: VecDeque<u8>,
}

impl Ps2Port {
    /// An idle port.
    pub fn new() -> Self {
        Self::default()
    }

    /// A key was struck: latch its scancode.
    pub fn feed(&mut self, scancode: u8) {
        self.latched.push_back(scancode);
    }

    /// `inb(KEYBOARD_PORT)`
    pub fn read(&mut self) -> Option<u8> {
        self.latched.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letters_follow_shift() {
        let mut kb = UsKeyboard::new();
        let a = kb.process_scancode(0x1e);
        assert!(a.has_data() && a.is_make());
        assert_eq!(a.char(), b'a');
        let release = kb.process_scancode(0x1e | SC_BREAK);
        assert!(!release.is_make());

        assert!(!kb.process_scancode(SC_LSHIFT).has_data());
        assert_eq!(kb.process_scancode(0x1e).char(), b'A');
        assert_eq!(kb.process_scancode(0x02).char(), b'!');
        kb.process_scancode(SC_LSHIFT | SC_BREAK);
        assert_eq!(kb.process_scancode(0x02).char(), b'1');
    }

    #[test]
    fn enter_and_space() {
        let mut kb = UsKeyboard::new();
        assert_eq!(kb.process_scancode(0x1c).char(), b'\n');
        assert_eq!(kb.process_scancode(0x39).char(), b' ');
    }

    #[test]
    fn caps_lock_toggles_on_press() {
        let mut kb = UsKeyboard::new();
        kb.process_scancode(SC_CAPS);
        kb.process_scancode(SC_CAPS | SC_BREAK);
        assert_eq!(kb.process_scancode(0x10).char(), b'Q');
        kb.process_scancode(SC_CAPS);
        assert_eq!(kb.process_scancode(0x10).char(), b'q');
    }

    #[test]
    fn extended_prefix_yields_no_data() {
        let mut kb = UsKeyboard::new();
        assert!(!kb.process_scancode(SC_EXTENDED).has_data());
        // Right arrow shares its make code with keypad 6.
        assert!(!kb.process_scancode(0x4d).has_data());
        assert_eq!(kb.process_scancode(0x1f).char(), b's');
    }
}
