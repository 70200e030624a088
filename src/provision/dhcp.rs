//! dhcpd configuration for the provisioning network.
//!
//! The DHCP server either answers only the card (a single `host` entry
//! and `deny unknown-clients`), or any PXE client on the link. The
//! latter is needed when the firmware reports a placeholder MAC
//! address that differs from the one the card actually uses on the
//! wire.
use super::{media::MediaKind, services::Service};
use crate::{
    config::{format_mac, DhcpRestriction, NetworkPlan},
    error::Error,
};
use log::info;
use mac_address::MacAddress;
use std::{
    fs,
    path::Path,
};

/// Placeholder addresses some firmware builds show in the boot menu.
pub const FACTORY_DEFAULT_MACS: [[u8; 6]; 2] =
    [[0x80, 0xaa, 0x99, 0x88, 0x77, 0x66], [0x80, 0xaa, 0x99, 0x88, 0x77, 0x67]];

const DHCPD: &str = "/usr/sbin/dhcpd";

pub fn is_factory_default_mac(mac: MacAddress) -> bool {
    FACTORY_DEFAULT_MACS.iter().any(|known| mac.bytes() == *known)
}

/// Whether the DHCP server should only answer `mac`.
pub fn restricted(policy: DhcpRestriction, mac: MacAddress) -> bool {
    match policy {
        DhcpRestriction::Yes => true,
        DhcpRestriction::No => false,
        DhcpRestriction::Auto => !is_factory_default_mac(mac),
    }
}

#[derive(Debug, Clone)]
pub struct DhcpdConfig<'a> {
    pub plan: &'a NetworkPlan,
    /// Boot file handed to PXE clients; `None` for plain address leases.
    pub boot_filename: Option<&'a str>,
    /// Only answer this address.
    pub restrict: Option<MacAddress>,
}

impl<'a> DhcpdConfig<'a> {
    pub fn for_media(plan: &'a NetworkPlan, kind: MediaKind, restrict: Option<MacAddress>) -> Self {
        Self { plan, boot_filename: Some(kind.boot_filename()), restrict }
    }

    pub fn render(&self) -> String {
        let plan = self.plan;
        let mut lines = vec![
            String::from("default-lease-time 600;"),
            String::from("max-lease-time 7200;"),
            String::from("authoritative;"),
            String::new(),
            format!("subnet {} netmask {} {{", plan.subnet(), plan.netmask()),
            format!("  option routers {};", plan.host),
            format!("  option domain-name-servers {};", plan.host),
            format!("  next-server {};", plan.host),
        ];
        if let Some(filename) = self.boot_filename {
            lines.push(format!("  filename \"{}\";", filename));
        }
        let range = format!("    range {} {};", plan.range_start, plan.range_end);

        match self.restrict {
            Some(mac) => lines.extend(vec![
                String::from("  pool {"),
                String::from("    deny unknown-clients;"),
                range,
                String::from("  }"),
                String::from("}"),
                String::new(),
                String::from("host dpu {"),
                format!("  hardware ethernet {};", format_mac(mac)),
                String::from("}"),
            ]),
            None => lines.extend(vec![
                String::from("  class \"pxeclients\" {"),
                String::from(
                    "    match if substring (option vendor-class-identifier, 0, 9) = \"PXEClient\";",
                ),
                String::from("  }"),
                String::from("  pool {"),
                String::from("    allow members of \"pxeclients\";"),
                range,
                String::from("  }"),
                String::from("}"),
            ]),
        }
        let mut text = lines.join("\n");
        text.push('\n');
        text
    }

    /// Writes the configuration and an empty lease file into `dir` and
    /// describes the daemon serving them on `interface`.
    pub fn prepare(&self, dir: &Path, interface: &str) -> Result<Service, Error> {
        fs::create_dir_all(dir)?;
        let conf = dir.join("dhcpd.conf");
        let leases = dir.join("dhcpd.leases");
        fs::write(&conf, self.render())?;
        fs::write(&leases, "")?;
        info!(
            "dhcp: serving {}-{} on {} ({})",
            self.plan.range_start,
            self.plan.range_end,
            interface,
            self.restrict.map_or_else(|| String::from("any PXE client"), |mac| format!("only {}", format_mac(mac)))
        );
        Ok(Service::new("dhcp", DHCPD).args(dhcpd_args(&conf, &leases, interface)))
    }
}

fn dhcpd_args(conf: &Path, leases: &Path, interface: &str) -> Vec<String> {
    let path = |p: &Path| p.to_string_lossy().into_owned();
    vec![
        String::from("-f"),
        String::from("-cf"),
        path(conf),
        String::from("-lf"),
        path(leases),
        interface.to_owned(),
    ]
}
