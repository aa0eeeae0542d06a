//! Kernel print utilities.
//!
//! Kernel messages go to the serial line. On this machine the serial line is
//! a bounded ring of the most recent bytes, which the embedder may drain.

use alloc::{string::String, vec::Vec};
use core::fmt::Write;
use spin_lock::SpinLock;

/// Number of bytes the serial line retains.
pub const SERIAL_LOG_LEN: usize = 0x4000;

/// The serial line.
pub struct Serial {
    buf: [u8; SERIAL_LOG_LEN],
    head: usize,
    len: usize,
}

impl Serial {
    /// Create an empty serial line.
    pub const fn new() -> Self {
        Self {
            buf: [0; SERIAL_LOG_LEN],
            head: 0,
            len: 0,
        }
    }

    fn putb(&mut self, b: u8) {
        let tail = (self.head + self.len) % SERIAL_LOG_LEN;
        self.buf[tail] = b;
        if self.len == SERIAL_LOG_LEN {
            // Overwrite the oldest byte.
            self.head = (self.head + 1) % SERIAL_LOG_LEN;
        } else {
            self.len += 1;
        }
    }

    /// Take every retained byte, oldest first.
    pub fn drain(&mut self) -> Vec<u8> {
        let out = (0..self.len)
            .map(|i| self.buf[(self.head + i) % SERIAL_LOG_LEN])
            .collect();
        self.head = 0;
        self.len = 0;
        out
    }
}

impl Default for Serial {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for Serial {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        s.bytes().for_each(|b| self.putb(b));
        Ok(())
    }
}

static SERIAL: SpinLock<Serial> = SpinLock::new(Serial::new());

#[doc(hidden)]
pub fn _print(fmt: core::fmt::Arguments<'_>) {
    let _ = write!(&mut *SERIAL.lock(), "{}", fmt);
}

/// Take everything logged since the previous drain.
pub fn drain() -> String {
    String::from_utf8_lossy(&SERIAL.lock().drain()).into_owned()
}

/// Prints out the message.
///
/// Use the format! syntax to write data to the serial line.
/// This first holds the lock for the serial device.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::kprint::_print(format_args!($($arg)*)));
}

/// Prints out the message with a newline.
///
/// Use the format! syntax to write data to the serial line.
/// This first holds the lock for the serial device.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// Display an information message.
///
/// Use the format! syntax to write data to the serial line.
/// This first holds the lock for the serial device.
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => ($crate::kprint::_print(
            format_args!(
                "[INFO] {}\n",
                format_args!($($arg)*)
            )
        )
    );
}

/// Display a warning message.
///
/// Use the format! syntax to write data to the serial line.
/// This first holds the lock for the serial device.
#[macro_export]
macro_rules! warning {
    ($($arg:tt)*) => ($crate::kprint::_print(
            format_args!(
                "[WARNING] {}\n",
                format_args!($($arg)*)
            )
        )
    );
}

/// Print msg if debug build
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        if cfg!(debug_assertions) {
            $crate::kprint::_print(
                format_args!(
                    "[DEBUG] {}\n",
                    format_args!($($arg)*)
                )
            )
        }
    }
}
