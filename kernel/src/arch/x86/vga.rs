//! VGA text-mode console: 80x25 cells at physical 0xB8000, each a
//! character byte plus an attribute byte `(bg << 4) | fg`.

use crate::sync::spinlock::SpinLock;

use super::port::Port;

pub const WIDTH: usize = 80;
pub const HEIGHT: usize = 25;

/// The text framebuffer through its higher-half mapping.
const BUFFER: usize = 0xB8000 + 0xC000_0000;

const CRTC_INDEX: Port = Port::new(0x3D4);
const CRTC_DATA: Port = Port::new(0x3D5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Color {
    Black = 0,
    Blue = 1,
    Green = 2,
    Cyan = 3,
    Red = 4,
    Magenta = 5,
    Brown = 6,
    LightGrey = 7,
    DarkGrey = 8,
    LightBlue = 9,
    LightGreen = 10,
    LightCyan = 11,
    LightRed = 12,
    LightMagenta = 13,
    Yellow = 14,
    White = 15,
}

/// Packs a foreground/background pair into an attribute byte.
pub const fn attribute(fore: Color, back: Color) -> u8 {
    ((back as u8) << 4) | fore as u8
}

pub struct Writer {
    row: usize,
    col: usize,
    attr: u8,
    cursor_hidden: bool,
}

static WRITER: SpinLock<Writer> = SpinLock::new(Writer {
    row: 0,
    col: 0,
    attr: attribute(Color::LightGrey, Color::Black),
    cursor_hidden: false,
});

impl Writer {
    fn cell(&self, row: usize, col: usize) -> *mut u16 {
        (BUFFER + (row * WIDTH + col) * 2) as *mut u16
    }

    fn put_at(&self, row: usize, col: usize, byte: u8) {
        // SAFETY: row/col are bounded by the 80x25 geometry; the
        // framebuffer is mapped by the boot page tables.
        unsafe {
            core::ptr::write_volatile(self.cell(row, col), ((self.attr as u16) << 8) | byte as u16);
        }
    }

    fn scroll(&mut self) {
        for row in 1..HEIGHT {
            for col in 0..WIDTH {
                // SAFETY: bounded cells within the mapped framebuffer.
                unsafe {
                    let v = core::ptr::read_volatile(self.cell(row, col));
                    core::ptr::write_volatile(self.cell(row - 1, col), v);
                }
            }
        }
        for col in 0..WIDTH {
            self.put_at(HEIGHT - 1, col, b' ');
        }
        self.row = HEIGHT - 1;
    }

    fn put_byte(&mut self, byte: u8) {
        match byte {
            b'\n' => {
                self.col = 0;
                self.row += 1;
            }
            b'\r' => self.col = 0,
            byte => {
                self.put_at(self.row, self.col, byte);
                self.col += 1;
                if self.col == WIDTH {
                    self.col = 0;
                    self.row += 1;
                }
            }
        }
        if self.row == HEIGHT {
            self.scroll();
        }
    }

    fn write(&mut self, s: &str) {
        for byte in s.bytes() {
            // Anything outside printable ASCII becomes a filled block.
            self.put_byte(if (0x20..0x7f).contains(&byte) { byte } else { 0xfe });
        }
        self.update_cursor();
    }

    pub fn set_colors(&mut self, fore: Color, back: Color) {
        self.attr = attribute(fore, back);
    }

    pub fn clear(&mut self) {
        for row in 0..HEIGHT {
            for col in 0..WIDTH {
                self.put_at(row, col, b' ');
            }
        }
        self.row = 0;
        self.col = 0;
        self.update_cursor();
    }

    pub fn hide_cursor(&mut self) {
        self.cursor_hidden = true;
        // SAFETY: CRTC register 0x0A bit 5 disables the hardware cursor.
        unsafe {
            CRTC_INDEX.write(0x0A);
            CRTC_DATA.write(0x20);
        }
    }

    fn update_cursor(&self) {
        if self.cursor_hidden {
            return;
        }
        let pos = (self.row * WIDTH + self.col) as u16;
        // SAFETY: CRTC registers 0x0E/0x0F hold the cursor position.
        unsafe {
            CRTC_INDEX.write(0x0F);
            CRTC_DATA.write((pos & 0xFF) as u8);
            CRTC_INDEX.write(0x0E);
            CRTC_DATA.write((pos >> 8) as u8);
        }
    }
}

impl core::fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        self.write(s);
        Ok(())
    }
}

/// Console output for the klog console sink.
pub fn console_write(s: &str) {
    WRITER.lock().write(s);
}

#[doc(hidden)]
pub fn _print(args: core::fmt::Arguments<'_>) {
    use core::fmt::Write;
    let _ = WRITER.lock().write_fmt(args);
}

/// Switches the display to the crash screen: white on red, cleared, no
/// cursor. The crash path runs with interrupts off and never returns, so
/// the writer lock is bypassed rather than risked.
pub fn crash_screen() {
    // SAFETY: single crash path with interrupts disabled; nothing else
    // will touch the writer again.
    let writer = unsafe { WRITER.force_get() };
    writer.set_colors(Color::White, Color::Red);
    writer.clear();
    writer.hide_cursor();
}

/// Crash-path text output; same lock bypass as [`crash_screen`].
pub fn crash_write(s: &str) {
    // SAFETY: as in crash_screen.
    unsafe { WRITER.force_get() }.write(s);
}
