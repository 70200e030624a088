//! State discovered during one provisioning run.
//!
//! Every field is filled at most once. The first reader of an empty
//! field computes it (usually by talking to the card) and every later
//! reader gets the cached value.
use super::media::MediaKind;
use crate::{devices::boot_menu::BootEntries, error::Error, utilities::process};
use log::{info, warn};
use mac_address::MacAddress;
use once_cell::sync::OnceCell;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

const KEY_COMMENT: &str = "dpu-provision-internal@localhost";

#[derive(Debug)]
pub struct RunContext {
    pub boot_entries: OnceCell<BootEntries>,
    pub device_mac: OnceCell<MacAddress>,
    pub media_kind: OnceCell<MediaKind>,
    pub ssh_key: OnceCell<SshKey>,
    pub dhcp_restricted: OnceCell<bool>,
    before_prompt: AtomicBool,
}

impl Default for RunContext {
    fn default() -> Self { Self::new() }
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            boot_entries: OnceCell::new(),
            device_mac: OnceCell::new(),
            media_kind: OnceCell::new(),
            ssh_key: OnceCell::new(),
            dhcp_restricted: OnceCell::new(),
            before_prompt: AtomicBool::new(true),
        }
    }

    /// Whether the operator prompt (if any) is still ahead.
    pub fn before_prompt(&self) -> bool { self.before_prompt.load(Ordering::SeqCst) }

    pub fn mark_prompted(&self) { self.before_prompt.store(false, Ordering::SeqCst) }

    /// Fills `cell` with `value`, failing if it already holds one.
    pub fn set_once<T: std::fmt::Debug>(
        cell: &OnceCell<T>,
        name: &str,
        value: T,
    ) -> Result<(), Error> {
        info!("context[{:?}]: initialize to {:?}", name, value);
        cell.set(value)
            .map_err(|_| Error::ConfigurationError(format!("context field {} is already set", name)))
    }
}

/// An ed25519 key pair used to log into the installed OS. The private
/// half is deleted when the key is dropped.
#[derive(Debug)]
pub struct SshKey {
    private: PathBuf,
    public: String,
}

impl SshKey {
    /// Generates a fresh key pair in `dir`, replacing any left over one.
    pub fn generate(dir: &Path) -> Result<Self, Error> {
        fs::create_dir_all(dir)?;
        let private = dir.join("id_ed25519");
        remove_key_files(&private);

        let path = private.to_string_lossy().into_owned();
        process::run_checked(
            "ssh-keygen",
            &["-q", "-t", "ed25519", "-N", "", "-C", KEY_COMMENT, "-f", path.as_str()],
        )?;
        let key = Self::from_files(private)?;
        info!("ssh: generated key {}", key.private.display());
        Ok(key)
    }

    /// Adopts an existing key pair, which is deleted on drop like a
    /// generated one.
    pub fn from_files(private: PathBuf) -> Result<Self, Error> {
        let public = fs::read_to_string(public_path(&private))?.trim().to_owned();
        Ok(Self { private, public })
    }

    pub fn private_key(&self) -> &Path { &self.private }

    pub fn public_key(&self) -> &str { &self.public }
}

impl Drop for SshKey {
    fn drop(&mut self) {
        info!("ssh: removing key {}", self.private.display());
        remove_key_files(&self.private);
    }
}

fn public_path(private: &Path) -> PathBuf {
    let mut name = private.as_os_str().to_owned();
    name.push(".pub");
    PathBuf::from(name)
}

fn remove_key_files(private: &Path) {
    for path in [private.to_path_buf(), public_path(private)] {
        match fs::remove_file(&path) {
            Ok(()) => (),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
            Err(e) => warn!("ssh: cannot remove {}: {}", path.display(), e),
        }
    }
}

/// Public keys to authorize on the card: ours first, then the
/// configured ones, without blanks or duplicates.
pub fn authorized_keys<'a>(own: Option<&'a SshKey>, configured: &'a [String]) -> Vec<&'a str> {
    let mut keys: Vec<&str> = Vec::new();
    let candidates = own.map(SshKey::public_key).into_iter().chain(configured.iter().map(|k| k.trim()));
    for key in candidates {
        if !key.is_empty() && !keys.contains(&key) {
            keys.push(key);
        }
    }
    keys
}
