//! Card reset through the board management (SCP) console.
//!
//! Which command resets the card depends on the stage it is in. Early
//! on the SCP menu answers a wake-up, later only the kernel shell on the
//! same line does, and the window between them is narrow.
use super::{
    channel::{Console, Pattern, SerialChannel},
    Timing, KEY_CTRL_M,
};
use crate::{error::Error, hal::serial::Port};
use lazy_static::lazy_static;
use log::{debug, info};
use std::{thread::sleep, time::Duration};

const DEFAULT_ATTEMPTS: usize = 5;
const WAKE_ATTEMPTS: usize = 10;
const WAKE_TIMEOUT: Duration = Duration::from_secs(1);
const MENU_TIMEOUT: Duration = Duration::from_secs(10);
const RESET_SETTLE: Duration = Duration::from_millis(500);

const MAIN_MENU: &str = "SCP Main Menu";
const KERNEL_PROMPT: &str = "uart:";

lazy_static! {
    static ref WAKE_RESPONSE: Pattern =
        Pattern::regex("SCP Main Menu|uart:").expect("wake response pattern is valid");
}

/// How the card was reset.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResetPath {
    /// Power cycle through the SCP management menu.
    ManagementMenu,
    /// Warm reboot from the kernel shell, the menu was already gone.
    KernelWarmReboot,
}

pub struct ResetProtocol<C: Console> {
    console: C,
    attempts: usize,
    wake_timeout: Duration,
    timing: Timing,
}

impl<C: Console> ResetProtocol<C> {
    pub fn new(console: C, timing: Timing) -> Self {
        Self { console, attempts: DEFAULT_ATTEMPTS, wake_timeout: WAKE_TIMEOUT, timing }
    }

    pub fn with_attempts(mut self, attempts: usize) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn with_wake_timeout(mut self, timeout: Duration) -> Self {
        self.wake_timeout = timeout;
        self
    }

    /// Resets the card, retrying the whole procedure with a fresh
    /// console handle on any failure.
    pub fn reset(&mut self) -> Result<ResetPath, Error> {
        let mut attempt = 1;
        loop {
            debug!("serial: reset (try {} of {})", attempt, self.attempts);
            match self.try_reset() {
                Ok(path) => {
                    info!("serial: card reset ({:?})", path);
                    return Ok(path);
                }
                Err(e) if attempt >= self.attempts => {
                    return Err(Error::Exhausted {
                        operation: "reset",
                        attempts: self.attempts,
                        last: Box::new(e),
                    });
                }
                Err(e) => {
                    debug!("serial: reset failed: {}", e);
                    debug!("serial: retry in {:?}", self.timing.retry_backoff);
                    sleep(self.timing.retry_backoff);
                    attempt += 1;
                }
            }
        }
    }

    fn try_reset(&mut self) -> Result<ResetPath, Error> {
        let mut channel = self.console.open()?;
        sleep(self.timing.settle);

        let mut wake = 1;
        loop {
            channel.send(KEY_CTRL_M.repeat(2), Duration::from_millis(0))?;
            match channel.expect(&*WAKE_RESPONSE, self.wake_timeout) {
                Ok(seen) if seen.ends_with(MAIN_MENU) => return self.reset_from_menu(&mut channel),
                Ok(_) => return self.reboot_kernel(&mut channel),
                Err(Error::Timeout { .. }) if wake < WAKE_ATTEMPTS => wake += 1,
                Err(e) => return Err(e),
            }
        }
    }

    fn reset_from_menu<P: Port>(
        &self,
        channel: &mut SerialChannel<P>,
    ) -> Result<ResetPath, Error> {
        channel.send(format!("m{}", KEY_CTRL_M), Duration::from_millis(0))?;
        channel.expect("SCP Management Menu", MENU_TIMEOUT)?;
        channel.send(format!("r{}", KEY_CTRL_M), RESET_SETTLE.min(self.timing.settle))?;
        let rest = channel.drain_all()?;
        debug!("serial[{}]: reset complete (buffer content {:?})", channel.name(), rest);
        Ok(ResetPath::ManagementMenu)
    }

    fn reboot_kernel<P: Port>(
        &self,
        channel: &mut SerialChannel<P>,
    ) -> Result<ResetPath, Error> {
        debug!("serial[{}]: {:?} instead of the SCP menu, rebooting warm", channel.name(), KERNEL_PROMPT);
        channel.send(format!("kernel reboot warm{}", KEY_CTRL_M), RESET_SETTLE.min(self.timing.settle))?;
        let rest = channel.drain_all()?;
        debug!("serial[{}]: warm reboot issued (buffer content {:?})", channel.name(), rest);
        Ok(ResetPath::KernelWarmReboot)
    }
}
