//! SPI flash update through the U-Boot shell.
//!
//! The card is stopped in U-Boot right after a reset, fetches the image
//! over TFTP from the host and writes it to one of its two SPI flash
//! banks. Every step waits for the marker U-Boot prints on success; a
//! missing marker aborts the whole sequence, as a half written flash
//! is only recoverable from a clean start.
use super::{channel::SerialChannel, Timing, ESC, KEY_ENTER};
use crate::{error::Error, hal::serial::Port};
use log::info;
use std::{fmt, net::Ipv4Addr, thread::sleep, time::Duration};

const UBOOT_PROMPT: &str = "crb106-pcie>";

/// SPI flash bank receiving the image.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FlashSlot {
    Primary,
    Secondary,
}

impl FlashSlot {
    pub fn bank(self) -> u8 {
        match self {
            FlashSlot::Primary => 0,
            FlashSlot::Secondary => 1,
        }
    }
}

impl fmt::Display for FlashSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashSlot::Primary => write!(f, "primary"),
            FlashSlot::Secondary => write!(f, "secondary"),
        }
    }
}

/// What to flash, and from where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashJob {
    /// Address of the host's TFTP server.
    pub server: Ipv4Addr,
    /// Image file name relative to the TFTP root.
    pub image: String,
    pub slot: FlashSlot,
}

/// One U-Boot shell command and the marker confirming it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub description: &'static str,
    pub line: String,
    pub marker: Option<(&'static str, Duration)>,
    /// Multiples of the settle delay to wait once the command is done.
    pub settle: u32,
}

impl Command {
    fn new(description: &'static str, line: String) -> Self {
        Self { description, line, marker: None, settle: 1 }
    }

    fn expecting(mut self, marker: &'static str, timeout_s: u64) -> Self {
        self.marker = Some((marker, Duration::from_secs(timeout_s)));
        self
    }

    fn settling(mut self, factor: u32) -> Self {
        self.settle = factor;
        self
    }
}

impl FlashJob {
    /// Shell commands run at the U-Boot prompt, in order.
    pub fn commands(&self) -> Vec<Command> {
        vec![
            Command::new("enabling 100G management port", String::from("setenv ethact rvu_pf#1"))
                .settling(3),
            Command::new("saving environment", String::from("saveenv"))
                .expecting("OK", 10)
                .settling(3),
            Command::new("enabling dhcp", String::from("dhcp"))
                .expecting("DHCP client bound to address", 30),
            Command::new("set serverip", format!("setenv serverip {}", self.server)),
            Command::new("tftp the image", format!("tftpboot $loadaddr {}", self.image))
                .expecting("Bytes transferred", 100),
            Command::new("selecting SPI flash", format!("sf probe {}:0", self.slot.bank()))
                .expecting("SF: Detected", 10),
            Command::new("updating flash!", String::from("sf update $fileaddr 0 $filesize"))
                .expecting("bytes written", 500),
            Command::new("resetting", String::from("reset")).settling(0),
        ]
    }
}

pub struct FirmwareFlasher<'a, P: Port> {
    channel: &'a mut SerialChannel<P>,
    timing: Timing,
    timeout_cap: Option<Duration>,
}

impl<'a, P: Port> FirmwareFlasher<'a, P> {
    pub fn new(channel: &'a mut SerialChannel<P>, timing: Timing) -> Self {
        Self { channel, timing, timeout_cap: None }
    }

    /// Bounds every marker timeout, for simulated consoles.
    #[cfg(test)]
    fn with_timeout_cap(mut self, cap: Duration) -> Self {
        self.timeout_cap = Some(cap);
        self
    }

    /// Runs the whole update on a card that was just reset.
    pub fn flash(&mut self, job: &FlashJob) -> Result<(), Error> {
        info!("flashing {} to {} SPI flash (bank {})", job.image, job.slot, job.slot.bank());
        self.stop_in_uboot()?;
        for command in job.commands() {
            self.run(&command)?;
        }
        info!("firmware update of {} SPI flash issued, card is resetting", job.slot);
        Ok(())
    }

    fn stop_in_uboot(&mut self) -> Result<(), Error> {
        info!("waiting for instructions to access boot menu");
        self.expect("Press 'B' within 10 seconds for boot menu", Duration::from_secs(30))?;
        sleep(self.timing.settle);
        info!("Pressing B to access boot menu");
        self.channel.send("b", self.timing.key_delay)?;

        info!("waiting for instructions to Boot from Primary Boot Device");
        self.expect("1) Boot from Primary Boot Device", Duration::from_secs(10))?;
        sleep(self.timing.settle);
        self.channel.send("1", self.timing.key_delay)?;

        info!("waiting to escape to uboot menu");
        self.expect("Hit any key to stop autoboot", Duration::from_secs(60))?;
        info!("Sending escape 5 times");
        self.channel.send(ESC.repeat(5), self.timing.key_delay)?;

        info!("waiting on uboot prompt");
        self.expect(UBOOT_PROMPT, Duration::from_secs(5))?;
        Ok(())
    }

    fn run(&mut self, command: &Command) -> Result<(), Error> {
        info!("{}", command.description);
        self.channel.send(format!("{}{}", command.line, KEY_ENTER), Duration::from_millis(0))?;
        if let Some((marker, timeout)) = command.marker {
            self.expect(marker, timeout)?;
        }
        sleep(self.timing.settle_times(command.settle));
        Ok(())
    }

    fn expect(&mut self, marker: &str, timeout: Duration) -> Result<String, Error> {
        let timeout = self.timeout_cap.map_or(timeout, |cap| timeout.min(cap));
        self.channel.expect(marker, timeout)
    }
}
