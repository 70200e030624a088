//! Error type for the provisioning toolkit as a whole.
use crate::{config::format_mac, devices::boot_menu::BootEntries};
use mac_address::MacAddress;
use std::{fmt, io, net::Ipv4Addr, process::ExitStatus};

/// Broad classes of failure. Only the provisioning controller decides
/// whether a failure of a given class is worth retrying.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// An expected console message did not arrive in time.
    Timeout,
    /// The firmware is in an unexpected or ambiguous state.
    ProtocolMismatch,
    /// A device or a helper service is missing, busy or died.
    ResourceUnavailable,
    /// Install media failed validation.
    Integrity,
    /// Invalid configuration or selector.
    Configuration,
    /// Any other operating system error.
    Io,
}

/// Top level error type. Unlike the kinds above, variants carry enough
/// context to be reported directly to the operator.
#[derive(Debug)]
pub enum Error {
    Timeout { port: String, pattern: String, buffer: String },
    UnexpectedMenuItem(MacAddress),
    ScanDidNotEnd,
    NoBootEntries,
    BootEntryNotFound { requested: MacAddress, detected: BootEntries },
    SelectorNotFound { selector: String, detected: BootEntries },
    DeviceUnavailable { path: String, reason: String },
    ServiceExited { tag: &'static str, status: ExitStatus },
    CommandFailed { command: String, status: Option<i32> },
    InstanceLocked(String),
    NotBooted(Ipv4Addr),
    MediaInvalid(String),
    ConfigurationError(String),
    Exhausted { operation: &'static str, attempts: usize, last: Box<Error> },
    Io(io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Timeout { .. } | Error::ScanDidNotEnd | Error::NotBooted(_) => ErrorKind::Timeout,
            Error::UnexpectedMenuItem(_)
            | Error::NoBootEntries
            | Error::BootEntryNotFound { .. } => ErrorKind::ProtocolMismatch,
            Error::DeviceUnavailable { .. }
            | Error::ServiceExited { .. }
            | Error::CommandFailed { .. }
            | Error::InstanceLocked(_) => ErrorKind::ResourceUnavailable,
            Error::MediaInvalid(_) => ErrorKind::Integrity,
            Error::SelectorNotFound { .. } | Error::ConfigurationError(_) => {
                ErrorKind::Configuration
            }
            Error::Exhausted { last, .. } => last.kind(),
            Error::Io(_) => ErrorKind::Io,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Timeout { port, pattern, buffer } => write!(
                f,
                "serial[{}]: did not receive expected message {:?} within timeout (buffer content is {:?})",
                port, pattern, buffer
            ),
            Error::UnexpectedMenuItem(mac) => {
                write!(f, "Failure to select boot entry for {} (unexpected menu item)", format_mac(*mac))
            }
            Error::ScanDidNotEnd => write!(f, "Failure to parse boot entries (parsing did not end)"),
            Error::NoBootEntries => {
                write!(f, "Failure to parse boot entries (no PXE entries were found)")
            }
            Error::BootEntryNotFound { requested, detected } => write!(
                f,
                "Didn't find boot menu entry for PXE boot {} in BIOS. Detected interfaces are {}",
                format_mac(*requested),
                detected
            ),
            Error::SelectorNotFound { selector, detected } => write!(
                f,
                "Cannot find boot entry for {:?}. Detected interfaces are {}",
                selector, detected
            ),
            Error::DeviceUnavailable { path, reason } => {
                write!(f, "Device {} is unavailable: {}", path, reason)
            }
            Error::ServiceExited { tag, status } => {
                write!(f, "Service {} exited unexpectedly ({})", tag, status)
            }
            Error::CommandFailed { command, status: Some(code) } => {
                write!(f, "Command `{}` failed with exit code {}", command, code)
            }
            Error::CommandFailed { command, status: None } => {
                write!(f, "Command `{}` was terminated by a signal", command)
            }
            Error::InstanceLocked(path) => {
                write!(f, "Another provisioning run holds the lock {}", path)
            }
            Error::NotBooted(ip) => {
                write!(f, "Failed to detect booted card on {} or the DHCP range", ip)
            }
            Error::MediaInvalid(text) => write!(f, "[Integrity] -> {}", text),
            Error::ConfigurationError(text) => write!(f, "[Configuration] -> {}", text),
            Error::Exhausted { operation, attempts, last } => {
                write!(f, "Failure to {} after {} attempts: {}", operation, attempts, last)
            }
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Exhausted { last, .. } => Some(last.as_ref()),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self { Error::Io(e) }
}
