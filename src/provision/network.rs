//! Finding the installed card on the provisioning network.
//!
//! The installed OS configures the card's static address, which is the
//! reliable sign that installation finished. Until then the installer
//! may answer on a DHCP lease, which counts too, but only once it also
//! accepts an SSH command.
use crate::{
    config::NetworkPlan,
    error::Error,
    utilities::{guard::Guard, process},
};
use log::{debug, info, warn};
use std::{net::Ipv4Addr, path::PathBuf, time::Duration};

pub trait Liveness {
    fn answers_ping(&mut self, ip: Ipv4Addr) -> bool;

    /// Whether a trivial remote command succeeds.
    fn accepts_command(&mut self, ip: Ipv4Addr) -> bool;

    /// Further addresses the host at `ip` reports for itself.
    fn other_addresses(&mut self, _ip: Ipv4Addr) -> Vec<Ipv4Addr> { Vec::new() }
}

impl<L: Liveness + ?Sized> Liveness for &mut L {
    fn answers_ping(&mut self, ip: Ipv4Addr) -> bool { (**self).answers_ping(ip) }
    fn accepts_command(&mut self, ip: Ipv4Addr) -> bool { (**self).accepts_command(ip) }
    fn other_addresses(&mut self, ip: Ipv4Addr) -> Vec<Ipv4Addr> { (**self).other_addresses(ip) }
}

/// Address of a booted card among `candidates`, whose first entry is the
/// preferred static address. Hosts that ping but refuse commands are
/// dropped from the search.
pub fn find_booted<L: Liveness>(liveness: &mut L, candidates: &[Ipv4Addr]) -> Option<Ipv4Addr> {
    let preferred = candidates.first().copied()?;
    let mut remaining = candidates.to_vec();

    loop {
        let ip = remaining.iter().copied().find(|ip| liveness.answers_ping(*ip))?;
        if liveness.accepts_command(ip) {
            if ip != preferred && liveness.answers_ping(preferred) && liveness.accepts_command(preferred) {
                return Some(preferred);
            }
            return Some(ip);
        }
        debug!("network: {} answers ping but is not ready", ip);
        remaining.retain(|candidate| *candidate != ip);
    }
}

/// Poll pacing while waiting for the card to come up.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct LivenessSchedule {
    pub initial_interval: Duration,
    pub min_interval: Duration,
    pub min_budget: Duration,
    /// Added to the console watch time to get the budget.
    pub console_grace: Duration,
}

impl Default for LivenessSchedule {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(60),
            min_interval: Duration::from_secs(9),
            min_budget: Duration::from_secs(1800),
            console_grace: Duration::from_secs(100),
        }
    }
}

impl LivenessSchedule {
    pub fn budget(&self, console_wait: Duration) -> Duration { (console_wait + self.console_grace).max(self.min_budget) }

    /// Polls start slow, when the installer has barely started, and get
    /// more frequent as completion gets closer.
    pub fn next_interval(&self, interval: Duration) -> Duration {
        Duration::from_secs(interval.div_f64(1.3).as_secs()).max(self.min_interval)
    }
}

/// Liveness over the real network: `ping`, then `ssh` with the run's key.
pub struct SshLiveness {
    key: PathBuf,
    user: String,
}

impl SshLiveness {
    pub fn new(key: PathBuf, user: &str) -> Self { Self { key, user: user.to_owned() } }

    /// `ssh` arguments for running `command` on `ip`, never prompting
    /// and never touching the operator's known hosts.
    pub fn ssh_args(&self, ip: Ipv4Addr, command: &[&str]) -> Vec<String> {
        let mut args = vec![
            String::from("-i"),
            self.key.to_string_lossy().into_owned(),
            String::from("-o"),
            String::from("StrictHostKeyChecking=no"),
            String::from("-o"),
            String::from("UserKnownHostsFile=/dev/null"),
            String::from("-o"),
            String::from("LogLevel=QUIET"),
            String::from("-o"),
            String::from("BatchMode=yes"),
            String::from("-o"),
            String::from("ConnectTimeout=10"),
            format!("{}@{}", self.user, ip),
        ];
        args.extend(command.iter().map(|part| (*part).to_owned()));
        args
    }
}

impl Liveness for SshLiveness {
    fn answers_ping(&mut self, ip: Ipv4Addr) -> bool {
        let ip = ip.to_string();
        process::succeeds("ping", &["-4", "-c", "1", "-W", "1", ip.as_str()])
    }

    fn accepts_command(&mut self, ip: Ipv4Addr) -> bool { process::succeeds("ssh", &self.ssh_args(ip, &["uptime"])) }

    fn other_addresses(&mut self, ip: Ipv4Addr) -> Vec<Ipv4Addr> {
        match process::run("ssh", &self.ssh_args(ip, &["hostname", "-I"])) {
            Ok(output) if output.status.success() => parse_addresses(&String::from_utf8_lossy(&output.stdout), ip),
            _ => Vec::new(),
        }
    }
}

/// IPv4 addresses in `hostname -I` output, sorted, without `own`.
pub fn parse_addresses(text: &str, own: Ipv4Addr) -> Vec<Ipv4Addr> {
    let mut addresses: Vec<Ipv4Addr> =
        text.split_whitespace().filter_map(|word| word.parse().ok()).filter(|ip| *ip != own).collect();
    addresses.sort();
    addresses.dedup();
    addresses
}

/// Adds the host address to `interface` for as long as the returned
/// guard lives. An address that was already configured is left alone.
pub fn assign_host_address(
    plan: &NetworkPlan,
    interface: &str,
) -> Result<Guard<(String, String), impl FnOnce(&mut (String, String))>, Error> {
    let cidr = plan.host_cidr();
    let output = process::run("ip", &["addr", "add", cidr.as_str(), "dev", interface])?;
    let added = if output.status.success() {
        info!("network: added {} to {}", cidr, interface);
        true
    } else if String::from_utf8_lossy(&output.stderr).contains("File exists") {
        info!("network: {} already on {}", cidr, interface);
        false
    } else {
        return Err(Error::CommandFailed {
            command: process::command_line("ip", &["addr", "add", cidr.as_str(), "dev", interface]),
            status: output.status.code(),
        });
    };

    Ok(Guard::new((cidr, interface.to_owned()), move |(cidr, interface): &mut (String, String)| {
        if !added {
            return;
        }
        match process::run_checked("ip", &["addr", "del", cidr.as_str(), "dev", interface.as_str()]) {
            Ok(_) => info!("network: removed {} from {}", cidr, interface),
            Err(e) => warn!("network: cannot remove {} from {}: {}", cidr, interface, e),
        }
    }))
}
