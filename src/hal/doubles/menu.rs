//! Simulated OCTEON firmware console: the early boot prompts leading
//! into the UEFI setup pages, and the cyclic Boot Manager list.
use super::serial::read_due;
use crate::{
    devices::{
        boot_menu::{HIGHLIGHT_END, HIGHLIGHT_START, SENTINEL_ROW},
        ESC, KEY_DOWN, KEY_ENTER, KEY_UP,
    },
    hal::serial::Port,
};
use std::{
    cell::RefCell,
    collections::VecDeque,
    io,
    rc::Rc,
    time::{Duration, Instant},
};

const OVERSHOOT_DELAY: Duration = Duration::from_millis(150);
const BOOT_PROMPT_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Stage {
    Booting,
    DeviceChoice,
    AwaitEscape,
    Setup(u8),
    BootManager,
}

/// What the test can observe about the menu once the scanner is done.
#[derive(Debug, Default, Clone)]
pub struct MenuProbe {
    pub cursor: usize,
    pub booted: Option<usize>,
    pub keys_down: usize,
}

pub struct FakeBootMenu {
    rows: Vec<String>,
    stage: Stage,
    overshoot_on: Option<usize>,
    /// The boot prompt is scheduled on the first read, like a card that
    /// resets while the console is being watched.
    prompt_on_read: bool,
    pending: VecDeque<(Instant, Vec<u8>)>,
    probe: Rc<RefCell<MenuProbe>>,
}

pub fn pxe_row(mac_hex: &str) -> String { format!("UEFI PXEv4 (MAC:{})", mac_hex) }

pub fn sentinel_row() -> String { SENTINEL_ROW.to_owned() }

pub fn highlighted(row: &str) -> String { format!("{}{}{}", HIGHLIGHT_START, row, HIGHLIGHT_END) }

impl FakeBootMenu {
    /// A card already sitting in the Boot Manager, cursor on `start`.
    pub fn in_boot_manager(rows: Vec<String>, start: usize) -> Self {
        let menu = Self {
            rows,
            stage: Stage::BootManager,
            overshoot_on: None,
            prompt_on_read: false,
            pending: VecDeque::new(),
            probe: Rc::new(RefCell::new(MenuProbe::default())),
        };
        menu.probe.borrow_mut().cursor = start;
        menu
    }

    /// A card that just came out of reset and prints its boot prompts.
    pub fn after_reset(rows: Vec<String>, start: usize) -> Self {
        let mut menu = Self::in_boot_manager(rows, start);
        menu.stage = Stage::Booting;
        menu.prompt_on_read = true;
        menu
    }

    /// Landing on row `index` makes the cursor slip one extra row down.
    pub fn overshooting_on(mut self, index: usize) -> Self {
        self.overshoot_on = Some(index);
        self
    }

    pub fn probe(&self) -> Rc<RefCell<MenuProbe>> { self.probe.clone() }

    fn emit(&mut self, text: &str) { self.emit_after(text, Duration::from_millis(0)) }

    fn emit_after(&mut self, text: &str, delay: Duration) {
        self.pending.push_back((Instant::now() + delay, text.as_bytes().to_vec()));
    }

    fn move_cursor(&mut self, down: bool) {
        let len = self.rows.len();
        let cursor = {
            let mut probe = self.probe.borrow_mut();
            probe.cursor = if down { (probe.cursor + 1) % len } else { (probe.cursor + len - 1) % len };
            probe.cursor
        };
        let row = highlighted(&self.rows[cursor]);
        self.emit(&row);

        if down && self.overshoot_on == Some(cursor) {
            let next = (cursor + 1) % len;
            self.probe.borrow_mut().cursor = next;
            let row = highlighted(&self.rows[next]);
            self.emit_after(&row, OVERSHOOT_DELAY);
        }
    }

    fn key(&mut self, key: &str) {
        match (self.stage, key) {
            (Stage::Booting, "b") => {
                self.stage = Stage::DeviceChoice;
                self.emit("1) Boot from Primary Boot Device\r\n2) Boot from Secondary Boot Device\r\n");
            }
            (Stage::DeviceChoice, "2") => {
                self.stage = Stage::AwaitEscape;
                self.emit("Press ESCAPE for boot options\r\n");
            }
            (Stage::AwaitEscape, ESC) => {
                self.stage = Stage::Setup(0);
                self.emit("This is the option\r\none adjusts to change\r\nthe language for the\r\ncurrent system\r\n");
            }
            (Stage::Setup(n), KEY_DOWN) if n < 2 => {
                self.stage = Stage::Setup(n + 1);
                if n + 1 == 2 {
                    self.emit("This selection will\r\ntake you to the Boot\r\nManager\r\n");
                }
            }
            (Stage::Setup(2), KEY_ENTER) => {
                self.stage = Stage::BootManager;
                self.emit("Device Path\r\n");
            }
            (Stage::BootManager, KEY_DOWN) => {
                self.probe.borrow_mut().keys_down += 1;
                self.move_cursor(true);
            }
            (Stage::BootManager, KEY_UP) => self.move_cursor(false),
            (Stage::BootManager, KEY_ENTER) => {
                let mut probe = self.probe.borrow_mut();
                probe.booted = Some(probe.cursor);
            }
            _ => (),
        }
    }
}

/// Splits written bytes into the keys the firmware would see.
fn keys(text: &str) -> Vec<&str> {
    let mut keys = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let len = [KEY_DOWN, KEY_UP, KEY_ENTER]
            .iter()
            .find(|k| rest.starts_with(*k))
            .map(|k| k.len())
            .unwrap_or_else(|| rest.chars().next().map(char::len_utf8).unwrap_or(1));
        keys.push(&rest[..len]);
        rest = &rest[len..];
    }
    keys
}

impl io::Write for FakeBootMenu {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let text = String::from_utf8_lossy(buf).into_owned();
        for key in keys(&text) {
            self.key(key);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> { Ok(()) }
}

impl Port for FakeBootMenu {
    fn name(&self) -> &str { "fake-firmware" }

    fn read_available(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        if self.prompt_on_read {
            self.prompt_on_read = false;
            self.emit_after("\r\nPress 'B' within 10 seconds for boot menu\r\n", BOOT_PROMPT_DELAY);
        }
        read_due(&mut self.pending, buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_sequences_are_split_into_keys() {
        assert_eq!(keys("\x1b[B\x1b[A\r\n"), vec![KEY_DOWN, KEY_UP, KEY_ENTER]);
        assert_eq!(keys("\x1b\x1b"), vec![ESC, ESC]);
        assert_eq!(keys("b"), vec!["b"]);
    }
}
