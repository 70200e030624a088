//! Run configuration.
//!
//! Everything is optional: defaults describe the usual bench setup (card
//! consoles on the first two USB-UART adapters, card wired to `eno4`,
//! provisioning subnet `172.131.100.0/24`). A RON file may override any
//! field, and command line options override the file.
use crate::{devices::{flasher::FlashSlot, Timing}, error::Error};
use mac_address::MacAddress;
use serde::{Deserialize, Serialize};
use std::{
    convert::TryFrom,
    fmt, fs,
    net::Ipv4Addr,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

/// Which of the card's PXE capable interfaces to boot from.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DeviceSelector {
    /// The last entry of the boot menu.
    Primary,
    /// The first entry of the boot menu.
    Secondary,
    /// Boot menu entry by discovery index.
    Index(usize),
    Mac(MacAddress),
}

pub const MAX_SELECTOR_INDEX: usize = 4;

impl FromStr for DeviceSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        match normalized.as_str() {
            "primary" => return Ok(DeviceSelector::Primary),
            "secondary" => return Ok(DeviceSelector::Secondary),
            _ => (),
        }
        if let Ok(index) = normalized.parse::<usize>() {
            if index <= MAX_SELECTOR_INDEX {
                return Ok(DeviceSelector::Index(index));
            }
        }
        if normalized.len() == 17 {
            if let Ok(mac) = normalized.parse::<MacAddress>() {
                return Ok(DeviceSelector::Mac(mac));
            }
        }
        Err(Error::ConfigurationError(format!(
            "The device {:?} is invalid. Must be \"primary\", \"secondary\", a MAC address or a number up to {}",
            s, MAX_SELECTOR_INDEX
        )))
    }
}

impl TryFrom<String> for DeviceSelector {
    type Error = Error;
    fn try_from(s: String) -> Result<Self, Self::Error> { s.parse() }
}

impl From<DeviceSelector> for String {
    fn from(selector: DeviceSelector) -> Self { selector.to_string() }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSelector::Primary => write!(f, "primary"),
            DeviceSelector::Secondary => write!(f, "secondary"),
            DeviceSelector::Index(index) => write!(f, "{}", index),
            DeviceSelector::Mac(mac) => write!(f, "{}", format_mac(*mac)),
        }
    }
}

/// Lower case, colon separated, as the firmware and dhcpd spell it.
pub fn format_mac(mac: MacAddress) -> String {
    mac.bytes().iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(":")
}

macro_rules! keyword_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(rename_all = "lowercase")]
        pub enum $name { $($variant),+ }

        impl FromStr for $name {
            type Err = Error;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    _ => Err(Error::ConfigurationError(format!(
                        "Invalid {} {:?}", stringify!($name), s
                    ))),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self { $($name::$variant => write!(f, $text),)+ }
            }
        }
    };
}

keyword_enum! {
    /// Whether the DHCP server only answers the card's MAC address.
    DhcpRestriction { Auto => "auto", Yes => "yes", No => "no" }
}

keyword_enum! {
    /// Install media flavour, or `auto` to detect it from the contents.
    MediaKindRequest { Auto => "auto", Rhel => "rhel", Rhcos => "rhcos" }
}

/// Addresses of the point to point provisioning network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkPlan {
    /// Host side address, added to the provisioning interface for the run.
    pub host: Ipv4Addr,
    pub prefix_len: u8,
    /// Static address the installed OS configures on the card.
    pub card: Ipv4Addr,
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,
    pub http_port: u16,
}

impl Default for NetworkPlan {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::new(172, 131, 100, 1),
            prefix_len: 24,
            card: Ipv4Addr::new(172, 131, 100, 100),
            range_start: Ipv4Addr::new(172, 131, 100, 10),
            range_end: Ipv4Addr::new(172, 131, 100, 20),
            http_port: 24380,
        }
    }
}

impl NetworkPlan {
    pub fn netmask(&self) -> Ipv4Addr {
        let bits = u32::MAX.checked_shl(32 - u32::from(self.prefix_len)).unwrap_or(0);
        Ipv4Addr::from(bits)
    }

    pub fn subnet(&self) -> Ipv4Addr { Ipv4Addr::from(u32::from(self.host) & u32::from(self.netmask())) }

    /// Host address in `a.b.c.d/len` notation.
    pub fn host_cidr(&self) -> String { format!("{}/{}", self.host, self.prefix_len) }

    pub fn lease_range(&self) -> impl Iterator<Item = Ipv4Addr> {
        (u32::from(self.range_start)..=u32::from(self.range_end)).map(Ipv4Addr::from)
    }

    /// Addresses the booted card may show up on: its static address
    /// first, then the lease range in order.
    pub fn candidates(&self) -> Vec<Ipv4Addr> {
        let card = self.card;
        std::iter::once(card).chain(self.lease_range().filter(move |ip| *ip != card)).collect()
    }

    fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & u32::from(self.netmask()) == u32::from(self.subnet())
    }

    fn validate(&self) -> Result<(), Error> {
        let invalid = |text: String| Err(Error::ConfigurationError(text));
        if self.prefix_len == 0 || self.prefix_len > 30 {
            return invalid(format!("Prefix length {} is not usable", self.prefix_len));
        }
        if u32::from(self.range_start) > u32::from(self.range_end) {
            return invalid(format!("Lease range {}-{} is empty", self.range_start, self.range_end));
        }
        for (name, ip) in
            [("card", self.card), ("range start", self.range_start), ("range end", self.range_end)]
        {
            if !self.contains(ip) {
                return invalid(format!("The {} address {} is outside {}", name, ip, self.host_cidr()));
            }
        }
        if self.lease_range().any(|ip| ip == self.host) {
            return invalid(format!("The lease range contains the host address {}", self.host));
        }
        Ok(())
    }
}

/// Serial devices of the card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Consoles {
    /// UEFI, U-Boot and OS console.
    pub firmware: PathBuf,
    /// Board management (SCP) console.
    pub management: PathBuf,
}

impl Default for Consoles {
    fn default() -> Self {
        Self { firmware: PathBuf::from("/dev/ttyUSB0"), management: PathBuf::from("/dev/ttyUSB1") }
    }
}

/// Host side locations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostPaths {
    pub tftp_root: PathBuf,
    pub www_root: PathBuf,
    /// Mount point of the install media.
    pub media_mount: PathBuf,
    /// Mount point of the EFI image nested in CoreOS media.
    pub efiboot_mount: PathBuf,
    /// Downloaded media.
    pub cache_dir: PathBuf,
    /// Console transcripts.
    pub transcript_dir: PathBuf,
    /// Lock file and ephemeral SSH key.
    pub state_dir: PathBuf,
    /// dhcpd configuration and lease files.
    pub dhcp_dir: PathBuf,
}

impl Default for HostPaths {
    fn default() -> Self {
        Self {
            tftp_root: PathBuf::from("/var/lib/tftpboot"),
            www_root: PathBuf::from("/www"),
            media_mount: PathBuf::from("/mnt/marvell_dpu_iso"),
            efiboot_mount: PathBuf::from("/mnt/efiboot"),
            cache_dir: PathBuf::from("/var/cache/dpu-provision"),
            transcript_dir: PathBuf::from("/tmp"),
            state_dir: PathBuf::from("/run/dpu-provision"),
            dhcp_dir: PathBuf::from("/run/dpu-provision/dhcp"),
        }
    }
}

/// Firmware update parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashConfig {
    pub image: Option<PathBuf>,
    #[serde(with = "flash_slot")]
    pub slot: FlashSlot,
    pub attempts: usize,
    /// Seconds the host services get before the card is reset.
    pub service_settle_s: u64,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self { image: None, slot: FlashSlot::Secondary, attempts: 1, service_settle_s: 10 }
    }
}

mod flash_slot {
    use crate::devices::flasher::FlashSlot;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(slot: &FlashSlot, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&slot.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<FlashSlot, D::Error> {
        super::parse_slot(&String::deserialize(deserializer)?).map_err(de::Error::custom)
    }
}

pub fn parse_slot(text: &str) -> Result<FlashSlot, Error> {
    match text.trim().to_lowercase().as_str() {
        "primary" | "0" => Ok(FlashSlot::Primary),
        "secondary" | "1" => Ok(FlashSlot::Secondary),
        _ => Err(Error::ConfigurationError(format!("Invalid flash slot {:?}", text))),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Install media: a local path or an HTTP(S) URL.
    pub media: Option<String>,
    pub media_kind: MediaKindRequest,
    /// Host interface wired to the card.
    pub interface: String,
    pub device: DeviceSelector,
    pub dhcp_restricted: DhcpRestriction,
    /// Additional public keys authorized on the installed OS.
    pub ssh_keys: Vec<String>,
    /// Seconds to keep watching the console after boot. Zero watches
    /// until the card answers.
    pub console_wait_s: f64,
    /// Wait for the operator once services are up.
    pub prompt: bool,
    pub attempts: usize,
    pub reset_attempts: usize,
    pub overshoot_window_ms: u64,
    /// Optional grub configuration copied to the TFTP root.
    pub grub_config: Option<PathBuf>,
    /// Pre-rendered files (kickstart, ignition) copied to the HTTP root.
    pub payloads: Vec<PathBuf>,
    pub network: NetworkPlan,
    pub consoles: Consoles,
    pub paths: HostPaths,
    pub flash: FlashConfig,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            media: None,
            media_kind: MediaKindRequest::Auto,
            interface: String::from("eno4"),
            device: DeviceSelector::Primary,
            dhcp_restricted: DhcpRestriction::Auto,
            ssh_keys: Vec::new(),
            console_wait_s: 0.0,
            prompt: false,
            attempts: 3,
            reset_attempts: 5,
            overshoot_window_ms: 500,
            grub_config: None,
            payloads: Vec::new(),
            network: NetworkPlan::default(),
            consoles: Consoles::default(),
            paths: HostPaths::default(),
            flash: FlashConfig::default(),
        }
    }
}

impl ProvisioningConfig {
    /// Reads a RON configuration file, or the defaults without one.
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        let config = match path {
            Some(path) => {
                let text = fs::read_to_string(path).map_err(|e| {
                    Error::ConfigurationError(format!("Cannot read {}: {}", path.display(), e))
                })?;
                Self::from_ron(&text)?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_ron(text: &str) -> Result<Self, Error> {
        ron::de::from_str(text).map_err(|e| Error::ConfigurationError(format!("Invalid configuration: {}", e)))
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.network.validate()?;
        if self.attempts == 0 || self.reset_attempts == 0 || self.flash.attempts == 0 {
            return Err(Error::ConfigurationError(String::from("Attempt counts must be at least 1")));
        }
        if !(self.console_wait_s >= 0.0 && self.console_wait_s.is_finite()) {
            return Err(Error::ConfigurationError(format!(
                "Invalid console wait {}",
                self.console_wait_s
            )));
        }
        if self.interface.trim().is_empty() {
            return Err(Error::ConfigurationError(String::from("No provisioning interface given")));
        }
        Ok(())
    }

    pub fn console_wait(&self) -> Duration { Duration::from_secs_f64(self.console_wait_s) }

    pub fn timing(&self) -> Timing {
        Timing { overshoot_window: Duration::from_millis(self.overshoot_window_ms), ..Timing::default() }
    }
}
