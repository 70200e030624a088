//! Single instance lock. A second provisioning run against the same
//! card would fight the first one over the consoles and the network
//! services, so only one run per state directory may be active.
use crate::error::Error;
use log::info;
use nix::{
    errno::Errno,
    fcntl::{flock, FlockArg},
};
use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
};

pub const LOCK_FILE_NAME: &str = "dpu-provision.lock";

/// Held for as long as the value lives; the kernel drops the lock
/// together with the file descriptor, even if the process is killed.
#[derive(Debug)]
pub struct InstanceLock {
    _file: File,
    path: PathBuf,
}

impl InstanceLock {
    pub fn acquire(state_dir: &Path) -> Result<Self, Error> {
        fs::create_dir_all(state_dir)?;
        let path = state_dir.join(LOCK_FILE_NAME);
        let mut file = OpenOptions::new().create(true).write(true).open(&path)?;
        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => (),
            Err(Errno::EWOULDBLOCK) => return Err(Error::InstanceLocked(path.display().to_string())),
            Err(e) => return Err(Error::Io(e.into())),
        }
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        info!("lock: holding {}", path.display());
        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path { &self.path }
}
