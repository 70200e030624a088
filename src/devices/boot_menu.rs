//! UEFI Boot Manager automation.
//!
//! The Boot Manager is a circular list without a terminator. The only
//! thing the console shows about it is the row under the cursor, which
//! the firmware redraws between a fixed pair of colour escape
//! sequences every time the cursor moves. The scanner walks the list
//! one row at a time and uses a fixed row as the wraparound marker, so
//! every PXE entry is seen exactly once.
use super::{
    channel::{Pattern, SerialChannel},
    Timing, ESC, KEY_DOWN, KEY_ENTER, KEY_UP,
};
use crate::{config::format_mac, error::Error, hal::serial::Port};
use itertools::Itertools;
use lazy_static::lazy_static;
use log::{debug, info, warn};
use mac_address::MacAddress;
use regex::Regex;
use std::{collections::BTreeMap, fmt, thread::sleep, time::Duration};

pub const HIGHLIGHT_START: &str = "\x1b[0m\x1b[37m\x1b[40m";
pub const HIGHLIGHT_END: &str = "\x1b[0m\x1b[30m\x1b[47m";
pub const SENTINEL_ROW: &str = "UEFI Misc Device";

/// Upper bound on cursor moves for one scan.
pub const MAX_SEARCH_COUNT: usize = 50;

const HIGHLIGHTED_ROW: &str = r"\x1b\[0m\x1b\[37m\x1b\[40m([^\x1b]*)\x1b\[0m\x1b\[30m\x1b\[47m";
const FIRST_ROW_TIMEOUT: Duration = Duration::from_millis(800);
const RESTORE_DELAY: Duration = Duration::from_millis(200);

lazy_static! {
    static ref ROW: Regex = Regex::new(HIGHLIGHTED_ROW).expect("highlight regex is valid");
    static ref ROW_PATTERN: Pattern = Pattern::regex(HIGHLIGHTED_ROW).expect("highlight regex is valid");
    static ref SENTINEL: Regex = Regex::new(r"^UEFI Misc Device$").expect("sentinel regex is valid");
    static ref PXE_ENTRY: Regex =
        Regex::new(r"^UEFI PXEv4 \(MAC:([0-9a-fA-F]{12})\)$").expect("PXE entry regex is valid");
    static ref LANGUAGE_HELP: Pattern = Pattern::regex(
        "This is the option.*one adjusts to change.*the language for the.*current system"
    )
    .expect("language help regex is valid");
    static ref BOOT_MANAGER_HELP: Pattern =
        Pattern::regex("This selection will.*take you to the Boot.*Manager")
            .expect("boot manager help regex is valid");
}

/// PXE entries in discovery order. Index 0 is the first entry found
/// after the wraparound marker.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BootEntries(BTreeMap<usize, MacAddress>);

impl BootEntries {
    /// Appends `mac` under the next free index and returns that index.
    pub fn insert(&mut self, mac: MacAddress) -> usize {
        let index = self.0.len();
        self.0.insert(index, mac);
        index
    }

    pub fn get(&self, index: usize) -> Option<MacAddress> { self.0.get(&index).copied() }

    /// The last discovered entry.
    pub fn primary(&self) -> Option<MacAddress> { self.0.values().next_back().copied() }

    /// The first discovered entry.
    pub fn secondary(&self) -> Option<MacAddress> { self.0.values().next().copied() }

    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn contains(&self, mac: MacAddress) -> bool { self.0.values().any(|m| *m == mac) }
    pub fn iter(&self) -> impl Iterator<Item = (usize, MacAddress)> + '_ {
        self.0.iter().map(|(i, m)| (*i, *m))
    }
}

impl fmt::Display for BootEntries {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self.0.iter().map(|(i, mac)| format!("{}: {}", i, format_mac(*mac))).join(", "))
    }
}

/// Progress through one revolution of the menu.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ParsingState {
    Start,
    SawStartMarker,
    Parsing,
    Done,
}

impl ParsingState {
    fn on_sentinel(self) -> Self {
        match self {
            ParsingState::Start => ParsingState::SawStartMarker,
            ParsingState::Parsing => ParsingState::Done,
            other => other,
        }
    }
}

/// Row texts of all highlighted rows in `text`, in order of appearance.
pub fn extract_highlights(text: &str) -> Vec<&str> {
    ROW.captures_iter(text).filter_map(|c| c.get(1)).map(|m| m.as_str()).collect()
}

/// MAC address of a PXE boot entry row, if `row` is one.
pub fn parse_pxe_row(row: &str) -> Option<MacAddress> {
    let hex = PXE_ENTRY.captures(row)?.get(1)?.as_str().to_lowercase();
    // Twelve ASCII hex digits, as matched above.
    (0..hex.len()).step_by(2).map(|i| &hex[i..i + 2]).join(":").parse().ok()
}

pub fn is_sentinel_row(row: &str) -> bool { SENTINEL.is_match(row) }

/// Drives the firmware console through the UEFI Boot Manager.
pub struct BootMenuScanner<'a, P: Port> {
    channel: &'a mut SerialChannel<P>,
    timing: Timing,
}

impl<'a, P: Port> BootMenuScanner<'a, P> {
    pub fn new(channel: &'a mut SerialChannel<P>, timing: Timing) -> Self { Self { channel, timing } }

    /// Walks the early boot prompts of a freshly reset card into the Boot
    /// Manager.
    pub fn enter(&mut self) -> Result<(), Error> {
        let channel = &mut *self.channel;
        let timing = self.timing;
        channel.drain_all()?;

        info!("waiting for instructions to access boot menu");
        channel.expect("Press 'B' within 10 seconds for boot menu", Duration::from_secs(30))?;
        sleep(timing.settle);
        info!("Pressing B to access boot menu");
        channel.send("b", timing.key_delay)?;

        info!("waiting for instructions to Boot from Secondary Boot Device");
        channel.expect("2) Boot from Secondary Boot Device", Duration::from_secs(10))?;
        sleep(timing.settle);
        channel.send("2", timing.key_delay)?;

        info!("waiting to escape to UEFI boot menu");
        channel.expect("Press ESCAPE for boot options", Duration::from_secs(60))?;
        info!("Sending escape 5 times");
        channel.send(ESC.repeat(5), timing.key_delay)?;

        info!("waiting on language option");
        channel.expect(&*LANGUAGE_HELP, Duration::from_secs(3))?;
        channel.send(KEY_DOWN, timing.key_delay)?;
        sleep(timing.settle);
        channel.send(KEY_DOWN, timing.key_delay)?;

        info!("waiting for Boot manager entry");
        channel.expect(&*BOOT_MANAGER_HELP, Duration::from_secs(3))?;
        channel.send(KEY_ENTER, timing.key_delay)?;
        channel.expect("Device Path", Duration::from_secs(30))?;
        Ok(())
    }

    /// Lists all PXE entries, then moves the cursor back above the
    /// wraparound marker so a following `boot` starts from a known row.
    pub fn scan(&mut self) -> Result<BootEntries, Error> {
        info!("Parse boot menu to find all MAC addresses");
        let (entries, _) = self.walk(None)?;
        self.channel.send(KEY_UP.repeat(2), RESTORE_DELAY.min(self.timing.key_delay))?;
        info!("Detected interfaces are {}", entries);
        Ok(entries)
    }

    /// Moves the cursor onto the entry for `mac` and boots it. The
    /// entries seen on the way are returned, possibly a partial list.
    pub fn boot(&mut self, mac: MacAddress) -> Result<BootEntries, Error> {
        info!("Parse boot menu to start booting {}", format_mac(mac));
        match self.walk(Some(mac))? {
            (entries, true) => {
                info!("Detected interfaces are (partial) {}. Booting now {}.", entries, format_mac(mac));
                self.channel.send(KEY_ENTER, self.timing.boot_delay)?;
                Ok(entries)
            }
            (entries, false) => {
                warn!("Detected interfaces are {}. Cannot boot requested interface {}", entries, format_mac(mac));
                Err(Error::BootEntryNotFound { requested: mac, detected: entries })
            }
        }
    }

    /// Steps through the menu until one revolution completed, or until
    /// the cursor rests on `target`. Returns the entries seen and whether
    /// the target is selected.
    fn walk(&mut self, target: Option<MacAddress>) -> Result<(BootEntries, bool), Error> {
        let mut entries = BootEntries::default();
        let mut state = ParsingState::Start;
        let mut searches = 0;

        while state < ParsingState::Done {
            if searches >= MAX_SEARCH_COUNT {
                return Err(Error::ScanDidNotEnd);
            }
            searches += 1;
            self.channel.send(KEY_DOWN, self.timing.key_delay)?;

            let current = self.read_rows(&mut state, &mut entries)?;
            if let Some(mac) = target.filter(|mac| current == Some(*mac)) {
                self.check_overshoot(mac)?;
                return Ok((entries, true));
            }
        }

        if entries.is_empty() {
            return Err(Error::NoBootEntries);
        }
        Ok((entries, false))
    }

    /// Parses every highlighted row the last keystroke produced. Returns
    /// the MAC of the row the cursor ended on, if that is a PXE entry
    /// seen while parsing.
    fn read_rows(
        &mut self,
        state: &mut ParsingState,
        entries: &mut BootEntries,
    ) -> Result<Option<MacAddress>, Error> {
        let mut current = None;
        let mut timeout = FIRST_ROW_TIMEOUT;

        while *state < ParsingState::Done {
            let burst = match self.channel.expect(&*ROW_PATTERN, timeout) {
                Ok(burst) => burst,
                Err(Error::Timeout { .. }) => break,
                Err(e) => return Err(e),
            };
            timeout = Duration::from_millis(0);

            for row in extract_highlights(&burst) {
                current = None;
                if is_sentinel_row(row) {
                    *state = state.on_sentinel();
                    debug!("boot menu: wraparound marker, now {:?}", state);
                    if *state == ParsingState::Done {
                        break;
                    }
                    continue;
                }

                let mac = match parse_pxe_row(row) {
                    Some(mac) => mac,
                    None => continue,
                };
                match *state {
                    ParsingState::SawStartMarker => *state = ParsingState::Parsing,
                    ParsingState::Parsing => (),
                    _ => continue,
                }
                let index = entries.insert(mac);
                info!("Found PXE boot entry {} with MAC {}", index, format_mac(mac));
                current = Some(mac);
            }
        }
        Ok(current)
    }

    /// Any further highlighted row means the cursor slipped past the
    /// target, so booting now would start the wrong entry.
    fn check_overshoot(&mut self, target: MacAddress) -> Result<(), Error> {
        match self.channel.expect(&*ROW_PATTERN, self.timing.overshoot_window) {
            Ok(row) => {
                debug!("boot menu: cursor moved on to {:?}", extract_highlights(&row));
                Err(Error::UnexpectedMenuItem(target))
            }
            Err(Error::Timeout { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
