//! Devices.
//!
//! Only the narrow interfaces the kernel consumes live here: a character-cell
//! console, the PS/2 data port with a scancode decoder, and the programmable
//! interval timer.

pub mod console;
pub mod keyboard;
pub mod timer;
