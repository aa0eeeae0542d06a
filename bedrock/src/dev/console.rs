//! Character-cell console.
use alloc::{string::String, vec::Vec};

/// Columns of the console.
pub const CONSOLE_WIDTH: i32 = 80;
/// Rows of the console.
pub const CONSOLE_HEIGHT: i32 = 25;
/// Light gray on black.
pub const DEFAULT_COLOR: u8 = 0x07;

/// A list specifying categories of console error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleError {
    /// Color is not a valid attribute byte.
    InvalidColor,
    /// Position is outside the screen.
    InvalidPosition,
}

/// Operations the kernel needs from a console.
pub trait Console: Send {
    /// Write one byte at the cursor and advance it.
    fn putbyte(&mut self, ch: u8);
    /// Write `s` at the cursor.
    fn putbytes(&mut self, s: &[u8]) {
        s.iter().for_each(|&ch| self.putbyte(ch));
    }
    /// Set the color of subsequent output.
    fn set_term_color(&mut self, color: i32) -> Result<(), ConsoleError>;
    /// The color of subsequent output.
    fn term_color(&self) -> i32;
    /// Move the cursor.
    fn set_cursor(&mut self, row: i32, col: i32) -> Result<(), ConsoleError>;
    /// The cursor position as `(row, col)`.
    fn cursor(&self) -> (i32, i32);
    /// Blank the screen and home the cursor.
    fn clear(&mut self);
}

/// An 80x25 text-mode console kept in memory.
pub struct TextConsole {
    cells: Vec<(u8, u8)>,
    row: i32,
    col: i32,
    color: u8,
}

impl Default for TextConsole {
    fn default() -> Self {
        Self::new()
    }
}

impl TextConsole {
    /// A blank console.
    pub fn new() -> Self {
        Self {
            cells: alloc::vec![(b' ', DEFAULT_COLOR); (CONSOLE_WIDTH * CONSOLE_HEIGHT) as usize],
            row: 0,
            col: 0,
            color: DEFAULT_COLOR,
        }
    }

    fn valid(row: i32, col: i32) -> bool {
        (0..CONSOLE_HEIGHT).contains(&row) && (0..CONSOLE_WIDTH).contains(&col)
    }

    fn index(row: i32, col: i32) -> usize {
        (row * CONSOLE_WIDTH + col) as usize
    }

    /// The `(character, color)` pair at a position.
    pub fn cell(&self, row: i32, col: i32) -> Option<(u8, u8)> {
        Self::valid(row, col).then(|| self.cells[Self::index(row, col)])
    }

    /// Text of `row`, without trailing blanks.
    pub fn row_text(&self, row: i32) -> String {
        if !(0..CONSOLE_HEIGHT).contains(&row) {
            return String::new();
        }
        let start = Self::index(row, 0);
        let line: String = self.cells[start..start + CONSOLE_WIDTH as usize]
            .iter()
            .map(|&(ch, _)| ch as char)
            .collect();
        String::from(line.trim_end())
    }

    fn newline(&mut self) {
        self.col = 0;
        if self.row + 1 < CONSOLE_HEIGHT {
            self.row += 1;
        } else {
            // Scroll one row.
            let w = CONSOLE_WIDTH as usize;
            self.cells.copy_within(w.., 0);
            let len = self.cells.len();
            let color = self.color;
            self.cells[len - w..].fill((b' ', color));
        }
    }
}

impl Console for TextConsole {
    fn putbyte(&mut self, ch: u8) {
        match ch {
            b'\n' => self.newline(),
            b'\r' => self.col = 0,
            b'\x08' => {
                if self.col > 0 {
                    self.col -= 1;
                    let i = Self::index(self.row, self.col);
                    self.cells[i] = (b' ', self.color);
                }
            }
            _ => {
                let i = Self::index(self.row, self.col);
                self.cells[i] = (ch, self.color);
                self.col += 1;
                if self.col == CONSOLE_WIDTH {
                    self.newline();
                }
            }
        }
    }

    fn set_term_color(&mut self, color: i32) -> Result<(), ConsoleError> {
        u8::try_from(color)
            .map(|c| self.color = c)
            .map_err(|_| ConsoleError::InvalidColor)
    }

    fn term_color(&self) -> i32 {
        self.color as i32
    }

    fn set_cursor(&mut self, row: i32, col: i32) -> Result<(), ConsoleError> {
        if Self::valid(row, col) {
            self.row = row;
            self.col = col;
            Ok(())
        } else {
            Err(ConsoleError::InvalidPosition)
        }
    }

    fn cursor(&self) -> (i32, i32) {
        (self.row, self.col)
    }

    fn clear(&mut self) {
        let color = self.color;
        self.cells.fill((b' ', color));
        self.row = 0;
        self.col = 0;
    }
}
