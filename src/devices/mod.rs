//! Complex modules with business logic related to the problem
//! domain, that lay on top of abstract serial ports. Devices are
//! generic over the port, while the concrete ttys live in the
//! `drivers` module.

pub mod boot_menu;
pub mod channel;
pub mod flasher;
pub mod reset;

use std::time::Duration;

pub const ESC: &str = "\x1b";
pub const KEY_UP: &str = "\x1b[A";
pub const KEY_DOWN: &str = "\x1b[B";
pub const KEY_ENTER: &str = "\r\n";
pub const KEY_CTRL_M: &str = "\r";

/// Delays tuned against real OCTEON firmware. The firmware drops or
/// garbles keystrokes that arrive while it is still redrawing, so most
/// sends are followed by a pause.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Timing {
    /// Pause after a keystroke that moves the menu cursor.
    pub key_delay: Duration,
    /// Pause between dialog steps of the boot prompts and U-Boot commands.
    pub settle: Duration,
    /// Grace period after a target row matched, to rule out cursor overshoot.
    pub overshoot_window: Duration,
    /// Time given to the firmware after ENTER on a boot entry.
    pub boot_delay: Duration,
    /// Wait between whole reset attempts.
    pub retry_backoff: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            key_delay: Duration::from_secs(1),
            settle: Duration::from_secs(1),
            overshoot_window: Duration::from_millis(500),
            boot_delay: Duration::from_secs(10),
            retry_backoff: Duration::from_secs(5),
        }
    }
}

impl Timing {
    /// No pauses at all, for simulated consoles.
    pub fn immediate() -> Self {
        Self {
            key_delay: Duration::from_millis(0),
            settle: Duration::from_millis(0),
            overshoot_window: Duration::from_millis(300),
            boot_delay: Duration::from_millis(0),
            retry_backoff: Duration::from_millis(0),
        }
    }

    /// `settle` scaled for slower steps; zero stays zero.
    pub(crate) fn settle_times(&self, factor: u32) -> Duration { self.settle * factor }
}
