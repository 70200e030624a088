//! Byte-level serial port interface.
//!
//! Firmware consoles speak no structured protocol, so the only thing
//! required from a port is the ability to write raw bytes and to
//! read whatever is currently available without blocking for long.
use std::io;

/// A raw serial port.
pub trait Port: io::Write {
    /// Human readable name (usually the device path).
    fn name(&self) -> &str;

    /// Reads whatever bytes are currently available. Returns `Ok(0)`
    /// when nothing arrived within the port's short read timeout.
    fn read_available(&mut self, buffer: &mut [u8]) -> io::Result<usize>;
}

/// Writes the whole buffer, retrying on interruption.
pub fn write_all<P: Port + ?Sized>(port: &mut P, buffer: &[u8]) -> io::Result<()> {
    let mut remaining = buffer.len();
    while remaining > 0 {
        let to_write = &buffer[(buffer.len() - remaining)..];
        match port.write(to_write) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => remaining -= n,
            Err(e) if (e.kind() == io::ErrorKind::Interrupted) => {}
            Err(e) => return Err(e),
        }
    }
    port.flush()
}
