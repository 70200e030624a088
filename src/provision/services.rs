//! Host daemons (dhcp, tftp, http) living exactly as long as a run.
use crate::{error::Error, utilities::process::command_line};
use log::{info, warn};
use std::{
    path::Path,
    process::{Child, Command, Stdio},
};

const TFTPD: &str = "/usr/sbin/in.tftpd";

/// How to start one daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    tag: &'static str,
    program: String,
    args: Vec<String>,
}

impl Service {
    pub fn new(tag: &'static str, program: &str) -> Self {
        Self { tag, program: program.to_owned(), args: Vec::new() }
    }

    pub fn args<I: IntoIterator<Item = S>, S: Into<String>>(mut self, args: I) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Foreground TFTP server with the block size the UEFI client expects.
    pub fn tftp(root: &Path) -> Self {
        Service::new("tftp", TFTPD).args(vec![
            String::from("-v"),
            String::from("-v"),
            String::from("-s"),
            String::from("-B"),
            String::from("1468"),
            String::from("-L"),
            root.to_string_lossy().into_owned(),
        ])
    }

    pub fn tag(&self) -> &'static str { self.tag }

    pub fn arguments(&self) -> &[String] { &self.args }
}

/// Running daemons, stopped (in reverse start order) on `stop_all` or
/// when the registry is dropped.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    running: Vec<(&'static str, Child)>,
}

impl ServiceRegistry {
    pub fn new() -> Self { Self::default() }

    pub fn start(&mut self, service: &Service) -> Result<(), Error> {
        let line = command_line(&service.program, &service.args);
        info!("services[{}]: starting {}", service.tag, line);
        let child = Command::new(&service.program)
            .args(&service.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|e| Error::CommandFailed { command: format!("{} ({})", line, e), status: None })?;
        self.running.push((service.tag, child));
        Ok(())
    }

    /// Fails if any daemon has exited on its own.
    pub fn check(&mut self) -> Result<(), Error> {
        for (tag, child) in self.running.iter_mut() {
            if let Some(status) = child.try_wait()? {
                warn!("services[{}]: exited with {}", tag, status);
                return Err(Error::ServiceExited { tag: *tag, status });
            }
        }
        Ok(())
    }

    pub fn tags(&self) -> Vec<&'static str> { self.running.iter().map(|(tag, _)| *tag).collect() }

    pub fn stop_all(&mut self) {
        while let Some((tag, mut child)) = self.running.pop() {
            info!("services[{}]: terminating", tag);
            if let Err(e) = child.kill() {
                // Already gone; reaping below still applies.
                info!("services[{}]: kill failed: {}", tag, e);
            }
            if let Err(e) = child.wait() {
                warn!("services[{}]: wait failed: {}", tag, e);
            }
        }
    }
}

impl Drop for ServiceRegistry {
    fn drop(&mut self) { self.stop_all() }
}
