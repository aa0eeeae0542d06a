//! Programmable interval timer, channel 0.

/// Input clock of the PIT in Hz.
pub const TIMER_RATE: u32 = 1_193_182;
/// Channel 0 data port.
pub const TIMER_PERIOD_IO_PORT: u16 = 0x40;
/// Mode/command port.
pub const TIMER_MODE_IO_PORT: u16 = 0x43;
/// Channel 0, lobyte/hibyte, square wave.
pub const TIMER_SQUARE_WAVE: u8 = 0x36;

/// The timer as programmed at boot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pit {
    divisor: u16,
}

impl Pit {
    /// Program the timer to interrupt `hz` times per second.
    ///
    /// The divisor is clamped to what the 16-bit counter can hold.
    pub fn program(hz: u32) -> Self {
        let divisor = (TIMER_RATE / hz.max(1)).clamp(1, u16::MAX as u32);
        Self {
            divisor: divisor as u16,
        }
    }

    /// Counter reload value.
    pub fn divisor(&self) -> u16 {
        self.divisor
    }

    /// Resulting interrupt frequency in Hz.
    pub fn frequency(&self) -> u32 {
        TIMER_RATE / self.divisor as u32
    }
}
