//! Serial driver for the card's USB-UART consoles.
use crate::{error::Error, hal::serial::Port};
use nix::fcntl::{flock, FlockArg};
use serial::SystemPort;
use std::{
    io::{self, Read, Write},
    os::unix::io::AsRawFd,
    path::Path,
    time::Duration,
};

/// Short enough that reads behave as non-blocking polls.
const READ_TIMEOUT: Duration = Duration::from_millis(20);

/// An exclusively held tty configured for the OCTEON consoles
/// (115200 baud, 8N1, no flow control).
pub struct TtyPort {
    name: String,
    device: SystemPort,
}

impl TtyPort {
    pub fn open(path: &Path) -> Result<Self, Error> {
        use serial::prelude::*;

        let name = path.display().to_string();
        let unavailable =
            |reason: String| Error::DeviceUnavailable { path: name.clone(), reason };

        if !path.exists() {
            return Err(unavailable(String::from("no such device")));
        }

        let mut device = serial::open(path).map_err(|e| unavailable(e.to_string()))?;
        flock(device.as_raw_fd(), FlockArg::LockExclusiveNonblock)
            .map_err(|_| unavailable(String::from("already held by another process")))?;

        device
            .reconfigure(&|s| {
                s.set_baud_rate(serial::Baud115200)?;
                s.set_char_size(serial::Bits8);
                s.set_parity(serial::ParityNone);
                s.set_stop_bits(serial::Stop1);
                s.set_flow_control(serial::FlowNone);
                Ok(())
            })
            .map_err(|e| unavailable(e.to_string()))?;
        device.set_timeout(READ_TIMEOUT).map_err(|e| unavailable(e.to_string()))?;

        Ok(Self { name, device })
    }
}

impl Write for TtyPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> { self.device.write(buf) }
    fn flush(&mut self) -> io::Result<()> { self.device.flush() }
}

impl Port for TtyPort {
    fn name(&self) -> &str { &self.name }

    fn read_available(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.device.read(buffer) {
                Ok(n) => return Ok(n),
                Err(e) if (e.kind() == io::ErrorKind::Interrupted) => {}
                Err(e)
                    if (e.kind() == io::ErrorKind::TimedOut
                        || e.kind() == io::ErrorKind::WouldBlock) =>
                {
                    return Ok(0)
                }
                Err(e) => return Err(e),
            }
        }
    }
}
