//! Programmable interval timer (channel 0), the preemption clock.

use super::port::Port;

const CHANNEL_0_DATA: Port = Port::new(0x40);
const COMMAND: Port = Port::new(0x43);

/// Select channel 0, lobyte/hibyte access, operating mode 3 (square wave).
const MODE_COMMAND: u8 = 0x36;

/// Programs channel 0 with the given divisor of the 1193182 Hz input
/// clock.
pub fn pit_init(divisor: u32) {
    // SAFETY: the defined mode-then-divisor programming sequence for PIT
    // channel 0.
    unsafe {
        COMMAND.write(MODE_COMMAND);
        CHANNEL_0_DATA.write((divisor & 0xFF) as u8);
        CHANNEL_0_DATA.write(((divisor >> 8) & 0xFF) as u8);
    }
}
