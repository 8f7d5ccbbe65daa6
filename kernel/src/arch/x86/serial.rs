//! 16550 serial ports, polled.
//!
//! The 64-bit `uart_16550` crate cannot target a 32-bit kernel, so the
//! handful of registers used here are driven directly. Output is polled:
//! these ports carry boot traces, the serial klog sink and crash reports,
//! all of which want to work with interrupts off.

use core::sync::atomic::{AtomicU8, Ordering};

use super::port::Port;

/// Base addresses of COM1..COM4.
const COM_BASES: [u16; 4] = [0x3F8, 0x2F8, 0x3E8, 0x2E8];

// Register offsets from the base.
const REG_DATA: u16 = 0;
const REG_INT_ENABLE: u16 = 1;
const REG_DIVISOR_LOW: u16 = 0;
const REG_DIVISOR_HIGH: u16 = 1;
const REG_FIFO_CTRL: u16 = 2;
const REG_LINE_CTRL: u16 = 3;
const REG_MODEM_CTRL: u16 = 4;
const REG_LINE_STATUS: u16 = 5;

const LCR_8N1: u8 = 0x03;
const LCR_DLAB: u8 = 0x80;
const LSR_THR_EMPTY: u8 = 0x20;

/// 115200 / 9600.
const DIVISOR_9600: u16 = 12;

/// Bitmask of ports already initialised.
static INITIALIZED: AtomicU8 = AtomicU8::new(0);

fn reg(index: usize, offset: u16) -> Port {
    Port::new(COM_BASES[index] + offset)
}

/// Initialises a COM port at 9600 baud, 8 data bits, no parity, one stop
/// bit, with interrupts off and FIFOs enabled.
pub fn port_init(index: usize) {
    // SAFETY: the defined 16550 setup sequence on a standard COM base.
    unsafe {
        reg(index, REG_INT_ENABLE).write(0x00);
        reg(index, REG_LINE_CTRL).write(LCR_DLAB);
        reg(index, REG_DIVISOR_LOW).write((DIVISOR_9600 & 0xFF) as u8);
        reg(index, REG_DIVISOR_HIGH).write((DIVISOR_9600 >> 8) as u8);
        reg(index, REG_LINE_CTRL).write(LCR_8N1);
        reg(index, REG_FIFO_CTRL).write(0xC7);
        reg(index, REG_MODEM_CTRL).write(0x0B);
    }
    INITIALIZED.fetch_or(1 << index, Ordering::Relaxed);
}

fn wait_transmit(index: usize) {
    // SAFETY: polling the line status register.
    unsafe {
        while reg(index, REG_LINE_STATUS).read() & LSR_THR_EMPTY == 0 {
            core::hint::spin_loop();
        }
    }
}

/// Writes one byte, blocking until the transmit holding register drains.
pub fn port_write_byte(index: usize, byte: u8) {
    wait_transmit(index);
    // SAFETY: writing the transmit holding register.
    unsafe {
        reg(index, REG_DATA).write(byte);
    }
}

/// Writes a string, translating `\n` to `\r\n`.
pub fn port_write(index: usize, s: &str) {
    for byte in s.bytes() {
        if byte == b'\n' {
            port_write_byte(index, b'\r');
        }
        port_write_byte(index, byte);
    }
}

/// Crash-path output on COM1, initialising it on first use.
pub fn debug_write(s: &str) {
    if INITIALIZED.load(Ordering::Relaxed) & 1 == 0 {
        port_init(0);
    }
    port_write(0, s);
}
