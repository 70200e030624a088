//! The provisioning workflow: find the card's boot entry, PXE boot it
//! and wait until the installed OS answers.
//!
//! The controller owns both consoles and is the only place that
//! retries whole operations. Lower layers report failures and leave
//! the decision to it.

pub mod context;
pub mod dhcp;
pub mod http;
pub mod media;
pub mod network;
pub mod services;
pub mod signal;
pub mod workflow;

use self::{
    context::RunContext,
    network::{find_booted, Liveness, LivenessSchedule},
};
use crate::{
    config::{format_mac, DeviceSelector, DhcpRestriction, ProvisioningConfig},
    devices::{
        boot_menu::{BootEntries, BootMenuScanner},
        channel::{Console, SerialChannel},
        flasher::{FirmwareFlasher, FlashJob},
        reset::{ResetPath, ResetProtocol},
        Timing,
    },
    error::{Error, ErrorKind},
};
use itertools::Itertools;
use log::{info, warn};
use mac_address::MacAddress;
use std::{
    fmt,
    net::Ipv4Addr,
    sync::{atomic::AtomicBool, atomic::Ordering, Arc},
    thread::sleep,
    time::Instant,
};

/// Outcome of a successful PXE boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Success {
    pub ip: Ipv4Addr,
    pub user: &'static str,
    /// Further addresses the installed OS reports.
    pub others: Vec<Ipv4Addr>,
}

impl fmt::Display for Success {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SUCCESS. Try `ssh {}@{}`", self.user, self.ip)?;
        if !self.others.is_empty() {
            write!(f, " (or on [{}])", self.others.iter().join(", "))?;
        }
        Ok(())
    }
}

/// Picks the entry a selector stands for.
pub fn resolve_selector(selector: DeviceSelector, entries: &BootEntries) -> Result<MacAddress, Error> {
    let found = match selector {
        DeviceSelector::Mac(mac) => Some(mac),
        DeviceSelector::Primary => entries.primary(),
        DeviceSelector::Secondary => entries.secondary(),
        DeviceSelector::Index(index) => entries.get(index),
    };
    found.ok_or_else(|| Error::SelectorNotFound { selector: selector.to_string(), detected: entries.clone() })
}

pub struct ProvisioningController<F: Console, M: Console> {
    config: ProvisioningConfig,
    firmware: F,
    management: M,
    timing: Timing,
    schedule: LivenessSchedule,
    release: Arc<AtomicBool>,
}

impl<F: Console, M: Console> ProvisioningController<F, M> {
    pub fn new(config: ProvisioningConfig, firmware: F, management: M) -> Self {
        let timing = config.timing();
        Self {
            config,
            firmware,
            management,
            timing,
            schedule: LivenessSchedule::default(),
            release: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_schedule(mut self, schedule: LivenessSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Flag that cuts the console watch short once raised.
    pub fn with_release(mut self, release: Arc<AtomicBool>) -> Self {
        self.release = release;
        self
    }

    pub fn config(&self) -> &ProvisioningConfig { &self.config }

    pub fn reset(&mut self) -> Result<ResetPath, Error> {
        ResetProtocol::new(&mut self.management, self.timing)
            .with_attempts(self.config.reset_attempts)
            .reset()
    }

    /// MAC address of the entry to boot. Unless the selector is a MAC
    /// address this resets the card and scans its boot menu, on
    /// `channel` if given. The flag tells whether the card was left in
    /// the boot menu by this call.
    pub fn device_mac(
        &mut self,
        ctx: &RunContext,
        channel: Option<&mut SerialChannel<F::Port>>,
    ) -> Result<(MacAddress, bool), Error> {
        if let Some(mac) = ctx.device_mac.get() {
            return Ok((*mac, false));
        }

        let mut in_menu = false;
        let mac = match self.config.device {
            DeviceSelector::Mac(mac) => {
                info!("device: skip detection, the device is given as MAC address {}", format_mac(mac));
                mac
            }
            selector => {
                info!("device: parse all MAC addresses from the boot menu to resolve {:?}", selector.to_string());
                let entries = match channel {
                    Some(channel) => {
                        let (entries, scanned) = self.boot_entries(ctx, channel)?;
                        in_menu = scanned;
                        entries
                    }
                    None => {
                        let mut channel = self.firmware.open()?;
                        self.boot_entries(ctx, &mut channel)?.0
                    }
                };
                let mac = resolve_selector(selector, &entries)?;
                info!("device: resolved {} to {} (entries are {})", selector, format_mac(mac), entries);

                if self.config.prompt && ctx.before_prompt() {
                    // Do not leave the card idling in the menu while the
                    // operator is busy.
                    in_menu = false;
                    self.reset()?;
                }
                mac
            }
        };

        if dhcp::is_factory_default_mac(mac) {
            warn!("The MAC address of the card seems not stable. This might cause problems later.");
        }
        RunContext::set_once(&ctx.device_mac, "device_mac", mac)?;
        Ok((mac, in_menu))
    }

    /// Cached boot entries, or fresh ones from a reset and scan. The flag
    /// is set when a scan happened, leaving the card in the boot menu.
    fn boot_entries(
        &mut self,
        ctx: &RunContext,
        channel: &mut SerialChannel<F::Port>,
    ) -> Result<(BootEntries, bool), Error> {
        if let Some(entries) = ctx.boot_entries.get() {
            return Ok((entries.clone(), false));
        }
        info!("Reset and enter boot menu to find all MAC addresses");
        self.reset()?;
        let mut scanner = BootMenuScanner::new(channel, self.timing);
        scanner.enter()?;
        let entries = scanner.scan()?;
        RunContext::set_once(&ctx.boot_entries, "boot_entries", entries.clone())?;
        Ok((entries, true))
    }

    /// Whether dhcpd should only answer the card. `auto` needs the MAC
    /// address, and may scan the boot menu for it.
    pub fn dhcp_restricted(&mut self, ctx: &RunContext) -> Result<bool, Error> {
        if let Some(restricted) = ctx.dhcp_restricted.get() {
            return Ok(*restricted);
        }
        let restricted = match self.config.dhcp_restricted {
            DhcpRestriction::Auto => {
                let (mac, _) = self.device_mac(ctx, None)?;
                dhcp::restricted(DhcpRestriction::Auto, mac)
            }
            DhcpRestriction::Yes => true,
            DhcpRestriction::No => false,
        };
        RunContext::set_once(&ctx.dhcp_restricted, "dhcp_restricted", restricted)?;
        Ok(restricted)
    }

    /// One attempt: reset into the boot menu (unless a scan just left the
    /// card there), boot the entry and wait until the card answers.
    pub fn boot_and_confirm<L: Liveness>(&mut self, ctx: &RunContext, liveness: &mut L) -> Result<Ipv4Addr, Error> {
        info!("Reset and enter boot menu to boot device {}", self.config.device);
        let mut channel = self.firmware.open()?;
        let (mac, in_menu) = self.device_mac(ctx, Some(&mut channel))?;

        if !in_menu {
            self.reset()?;
            BootMenuScanner::new(&mut channel, self.timing).enter()?;
        }
        BootMenuScanner::new(&mut channel, self.timing).boot(mac)?;
        self.wait_for_boot(channel, liveness)
    }

    /// Watches the console while polling for the card. The console is
    /// closed once the watch time passed or the release flag was raised.
    pub fn wait_for_boot<L: Liveness>(
        &mut self,
        channel: SerialChannel<F::Port>,
        liveness: &mut L,
    ) -> Result<Ipv4Addr, Error> {
        let started = Instant::now();
        let console_wait = self.config.console_wait();
        let budget = self.schedule.budget(console_wait);
        let candidates = self.config.network.candidates();
        let mut interval = self.schedule.initial_interval;
        let mut console = Some(channel);
        info!("Wait for boot and IP address {}", self.config.network.card);

        loop {
            let watch_over = self.release.load(Ordering::SeqCst)
                || (!console_wait.is_zero() && started.elapsed() > console_wait);
            if watch_over {
                if let Some(channel) = console.take() {
                    info!("Closing serial console {}", channel.name());
                    channel.close();
                }
            }

            if let Some(ip) = find_booted(liveness, &candidates) {
                info!("got response from {}", ip);
                return Ok(ip);
            }
            if started.elapsed() > budget {
                return Err(Error::NotBooted(self.config.network.card));
            }

            match console.as_mut() {
                Some(channel) => channel.pump(interval, &self.release)?,
                None => sleep(interval),
            }
            interval = self.schedule.next_interval(interval);
        }
    }

    /// PXE boots with up to `attempts` tries, each from a fresh reset.
    /// `before_attempt` runs first every time; its failure is final.
    pub fn boot_with_retries<L, B>(
        &mut self,
        ctx: &RunContext,
        liveness: &mut L,
        mut before_attempt: B,
    ) -> Result<Ipv4Addr, Error>
    where
        L: Liveness,
        B: FnMut() -> Result<(), Error>,
    {
        let attempts = self.config.attempts;
        let mut attempt = 1;
        loop {
            before_attempt()?;
            info!("Starting UEFI PXE Boot (try {})", attempt);
            match self.boot_and_confirm(ctx, liveness) {
                Ok(ip) => return Ok(ip),
                Err(e) if e.kind() == ErrorKind::Configuration => return Err(e),
                Err(e) if attempt >= attempts => {
                    return Err(Error::Exhausted { operation: "pxeboot", attempts, last: Box::new(e) })
                }
                Err(e) => {
                    warn!("Failure to pxeboot (try {}): {}", attempt, e);
                    attempt += 1;
                }
            }
        }
    }

    /// Resets the card and flashes it from U-Boot.
    pub fn flash(&mut self, job: &FlashJob) -> Result<(), Error> {
        let attempts = self.config.flash.attempts;
        let mut attempt = 1;
        loop {
            match self.try_flash(job) {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= attempts => {
                    return Err(Error::Exhausted { operation: "fwupdate", attempts, last: Box::new(e) })
                }
                Err(e) => {
                    warn!("Failure to update firmware (try {}): {}", attempt, e);
                    attempt += 1;
                }
            }
        }
    }

    fn try_flash(&mut self, job: &FlashJob) -> Result<(), Error> {
        let mut channel = self.firmware.open()?;
        self.reset()?;
        FirmwareFlasher::new(&mut channel, self.timing).flash(job)
    }
}

#[cfg(test)]
mod tests {
    use super::{network::doubles::FakeNetwork, *};
    use crate::{
        devices::flasher::FlashSlot,
        hal::doubles::{
            menu::{pxe_row, sentinel_row, FakeBootMenu},
            serial::{QueuedConsole, ScriptedPort},
        },
    };
    use std::time::Duration;

    type Controller = ProvisioningController<QueuedConsole<FakeBootMenu>, QueuedConsole<ScriptedPort>>;

    fn mac(text: &str) -> MacAddress { text.parse().unwrap() }

    fn card_ip() -> Ipv4Addr { Ipv4Addr::new(172, 131, 100, 100) }

    fn rows() -> Vec<String> {
        vec![
            sentinel_row(),
            pxe_row("000000000001"),
            pxe_row("000000000002"),
            pxe_row("000000000003"),
            String::from("EFI Internal Shell"),
        ]
    }

    /// Management console answering from the kernel shell.
    fn kernel_shells(count: usize) -> QueuedConsole<ScriptedPort> {
        QueuedConsole::new((0..count).map(|_| ScriptedPort::new("/dev/ttyUSB1").on(b"\r\r", b"uart:")))
    }

    fn controller(
        config: ProvisioningConfig,
        menus: Vec<FakeBootMenu>,
        resets: usize,
    ) -> Controller {
        ProvisioningController::new(config, QueuedConsole::new(menus), kernel_shells(resets))
            .with_timing(Timing::immediate())
    }

    fn config(device: DeviceSelector) -> ProvisioningConfig {
        ProvisioningConfig { device, ..ProvisioningConfig::default() }
    }

    fn booted_card() -> FakeNetwork { FakeNetwork::default().with_host(card_ip(), true) }

    #[test]
    fn primary_device_is_scanned_then_booted_without_a_second_reset() {
        // Given
        let menu = FakeBootMenu::after_reset(rows(), 0);
        let probe = menu.probe();
        let mut controller = controller(config(DeviceSelector::Primary), vec![menu], 1);
        let ctx = RunContext::new();

        // When
        let ip = controller.boot_with_retries(&ctx, &mut booted_card(), || Ok(())).unwrap();

        // Then
        assert_eq!(ip, card_ip());
        assert_eq!(ctx.device_mac.get(), Some(&mac("00:00:00:00:00:03")));
        assert_eq!(ctx.boot_entries.get().map(BootEntries::len), Some(3));
        assert_eq!(probe.borrow().booted, Some(3));
    }

    #[test]
    fn secondary_device_is_the_first_entry() {
        // Given
        let menu = FakeBootMenu::after_reset(rows(), 0);
        let probe = menu.probe();
        let mut controller = controller(config(DeviceSelector::Secondary), vec![menu], 1);
        let ctx = RunContext::new();

        // When
        controller.boot_with_retries(&ctx, &mut booted_card(), || Ok(())).unwrap();

        // Then
        assert_eq!(ctx.device_mac.get(), Some(&mac("00:00:00:00:00:01")));
        assert_eq!(probe.borrow().booted, Some(1));
    }

    #[test]
    fn selectors_resolve_against_detected_entries() {
        // Given
        let mut entries = BootEntries::default();
        entries.insert(mac("00:00:00:00:00:01"));
        entries.insert(mac("00:00:00:00:00:02"));

        // Then
        assert_eq!(resolve_selector(DeviceSelector::Primary, &entries).unwrap(), mac("00:00:00:00:00:02"));
        assert_eq!(resolve_selector(DeviceSelector::Secondary, &entries).unwrap(), mac("00:00:00:00:00:01"));
        assert_eq!(resolve_selector(DeviceSelector::Index(1), &entries).unwrap(), mac("00:00:00:00:00:02"));
        let error = resolve_selector(DeviceSelector::Index(3), &entries).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Configuration);
        assert!(error.to_string().contains("00:00:00:00:00:02"));
    }

    #[test]
    fn missing_index_fails_without_retrying() {
        // Given
        let menus = vec![FakeBootMenu::after_reset(rows(), 0), FakeBootMenu::after_reset(rows(), 0)];
        let mut controller = controller(config(DeviceSelector::Index(4)), menus, 2);
        let ctx = RunContext::new();

        // When
        let error = controller.boot_with_retries(&ctx, &mut booted_card(), || Ok(())).unwrap_err();

        // Then
        assert!(matches!(error, Error::SelectorNotFound { .. }));
    }

    #[test]
    fn scanning_before_the_prompt_resets_the_card() {
        // Given
        let first = FakeBootMenu::after_reset(rows(), 0);
        let second = FakeBootMenu::after_reset(rows(), 0);
        let probe = second.probe();
        let management = kernel_shells(3);
        let resets = management.opened();
        let config = ProvisioningConfig { prompt: true, ..config(DeviceSelector::Secondary) };
        let mut controller = ProvisioningController::new(config, QueuedConsole::new(vec![first, second]), management)
            .with_timing(Timing::immediate());
        let ctx = RunContext::new();

        // When
        let (mac_before, in_menu) = controller.device_mac(&ctx, None).unwrap();
        ctx.mark_prompted();
        controller.boot_with_retries(&ctx, &mut booted_card(), || Ok(())).unwrap();

        // Then
        assert_eq!(mac_before, mac("00:00:00:00:00:01"));
        assert!(!in_menu);
        assert_eq!(resets.get(), 3);
        assert_eq!(probe.borrow().booted, Some(1));
    }

    #[test]
    fn overshoot_is_retried_from_a_fresh_reset() {
        // Given
        let rows = vec![sentinel_row(), pxe_row("000000000001"), pxe_row("000000000002"), pxe_row("000000000003")];
        let slipping = FakeBootMenu::after_reset(rows.clone(), 3).overshooting_on(2);
        let slipping_probe = slipping.probe();
        let steady = FakeBootMenu::after_reset(rows, 3);
        let steady_probe = steady.probe();
        let mut controller =
            controller(config(DeviceSelector::Mac(mac("00:00:00:00:00:02"))), vec![slipping, steady], 2);
        let ctx = RunContext::new();
        let mut checks = 0;

        // When
        let ip = controller
            .boot_with_retries(&ctx, &mut booted_card(), || {
                checks += 1;
                Ok(())
            })
            .unwrap();

        // Then
        assert_eq!(ip, card_ip());
        assert_eq!(checks, 2);
        assert_eq!(slipping_probe.borrow().booted, None);
        assert_eq!(steady_probe.borrow().booted, Some(2));
    }

    #[test]
    fn unreachable_management_console_exhausts_all_attempts() {
        // Given
        let menus = vec![FakeBootMenu::after_reset(rows(), 0), FakeBootMenu::after_reset(rows(), 0)];
        let config = ProvisioningConfig {
            attempts: 2,
            reset_attempts: 2,
            ..config(DeviceSelector::Mac(mac("00:00:00:00:00:02")))
        };
        let mut controller = controller(config, menus, 0);
        let ctx = RunContext::new();

        // When
        let error = controller.boot_with_retries(&ctx, &mut booted_card(), || Ok(())).unwrap_err();

        // Then
        match error {
            Error::Exhausted { operation: "pxeboot", attempts: 2, last } => match *last {
                Error::Exhausted { operation: "reset", attempts: 2, last } => {
                    assert!(matches!(*last, Error::DeviceUnavailable { .. }))
                }
                other => panic!("unexpected cause {:?}", other),
            },
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn dead_service_stops_the_boot_loop() {
        // Given
        let mut controller = controller(config(DeviceSelector::Primary), vec![], 0);
        let ctx = RunContext::new();

        // When
        let error = controller
            .boot_with_retries(&ctx, &mut booted_card(), || {
                Err(Error::CommandFailed { command: String::from("dhcpd"), status: Some(1) })
            })
            .unwrap_err();

        // Then
        assert!(matches!(error, Error::CommandFailed { .. }));
    }

    #[test]
    fn factory_mac_lifts_the_dhcp_restriction() {
        // Given
        let rows = vec![sentinel_row(), pxe_row("80AA99887766"), String::from("EFI Internal Shell")];
        let mut controller = controller(config(DeviceSelector::Primary), vec![FakeBootMenu::after_reset(rows, 0)], 1);
        let ctx = RunContext::new();

        // When
        let restricted = controller.dhcp_restricted(&ctx).unwrap();

        // Then
        assert!(!restricted);
        assert_eq!(ctx.device_mac.get(), Some(&mac("80:aa:99:88:77:66")));
        assert_eq!(controller.dhcp_restricted(&ctx).unwrap(), false);
    }

    #[test]
    fn forced_dhcp_policy_never_touches_the_card() {
        // Given
        let config = ProvisioningConfig { dhcp_restricted: DhcpRestriction::Yes, ..config(DeviceSelector::Primary) };
        let firmware: QueuedConsole<FakeBootMenu> = QueuedConsole::new(vec![]);
        let opened = firmware.opened();
        let mut controller = ProvisioningController::new(config, firmware, kernel_shells(0));
        let ctx = RunContext::new();

        // Then
        assert!(controller.dhcp_restricted(&ctx).unwrap());
        assert_eq!(opened.get(), 0);
        assert!(ctx.device_mac.get().is_none());
    }

    #[test]
    fn silent_card_times_out_after_the_budget() {
        // Given
        let mut controller = controller(config(DeviceSelector::Primary), vec![], 0).with_schedule(LivenessSchedule {
            initial_interval: Duration::from_millis(20),
            min_interval: Duration::from_millis(10),
            min_budget: Duration::from_millis(100),
            console_grace: Duration::from_millis(0),
        });
        let channel = SerialChannel::new(FakeBootMenu::in_boot_manager(rows(), 0), None);
        let started = Instant::now();

        // When
        let error = controller.wait_for_boot(channel, &mut FakeNetwork::default()).unwrap_err();

        // Then
        assert!(matches!(error, Error::NotBooted(ip) if ip == card_ip()));
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn firmware_update_resets_then_flashes() {
        // Given
        let uboot = ScriptedPort::new("/dev/ttyUSB0")
            .with_output(b"Press 'B' within 10 seconds for boot menu\r\n")
            .on(b"b", b"1) Boot from Primary Boot Device\r\n")
            .on(b"1", b"Hit any key to stop autoboot:  3 ")
            .on(b"\x1b", b"\r\ncrb106-pcie> ")
            .on(b"saveenv\r\n", b"OK\r\n")
            .on(b"dhcp\r\n", b"DHCP client bound to address 172.131.100.12\r\n")
            .on(b"tftpboot $loadaddr flash-cn10k.img\r\n", b"Bytes transferred = 4096\r\n")
            .on(b"sf probe 1:0\r\n", b"SF: Detected mt25qu512a\r\n")
            .on(b"sf update $fileaddr 0 $filesize\r\n", b"4096 bytes written\r\n");
        let written = uboot.written();
        let management = kernel_shells(1);
        let resets = management.opened();
        let mut controller =
            ProvisioningController::new(ProvisioningConfig::default(), QueuedConsole::new(vec![uboot]), management)
                .with_timing(Timing::immediate());
        let job = FlashJob {
            server: Ipv4Addr::new(172, 131, 100, 1),
            image: String::from("flash-cn10k.img"),
            slot: FlashSlot::Secondary,
        };

        // When
        controller.flash(&job).unwrap();

        // Then
        assert_eq!(resets.get(), 1);
        assert!(String::from_utf8_lossy(&written.borrow()).ends_with("reset\r\n"));
    }

    #[test]
    fn success_line_mentions_other_addresses() {
        // Given
        let mut success = Success { ip: card_ip(), user: "core", others: vec![] };

        // Then
        assert_eq!(success.to_string(), "SUCCESS. Try `ssh core@172.131.100.100`");
        success.others = vec![Ipv4Addr::new(10, 8, 1, 4), Ipv4Addr::new(10, 8, 2, 4)];
        assert_eq!(success.to_string(), "SUCCESS. Try `ssh core@172.131.100.100` (or on [10.8.1.4, 10.8.2.4])");
    }
}
