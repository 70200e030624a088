//! Expect-style automation over a raw serial console.
//!
//! The firmware consoles offer nothing but a byte stream, so every
//! interaction is "send some keys, then wait until a pattern shows up
//! in the output", exactly as an operator reading the screen would.
//! Output is accumulated in a buffer and consumed only up to the end of
//! each successful match, so later expectations never see stale text.
use crate::{
    drivers::serial::TtyPort,
    error::Error,
    hal::serial::{self, Port},
};
use log::{debug, info, warn};
use regex::bytes::Regex;
use std::{
    fmt,
    fs::{File, OpenOptions},
    io::Write,
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
    thread::sleep,
    time::{Duration, Instant},
};

const READ_CHUNK: usize = 4096;
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Something that hands out freshly opened channels to one console.
pub trait Console {
    type Port: Port;
    fn open(&mut self) -> Result<SerialChannel<Self::Port>, Error>;
}

impl<C: Console + ?Sized> Console for &mut C {
    type Port = C::Port;
    fn open(&mut self) -> Result<SerialChannel<Self::Port>, Error> { (**self).open() }
}

/// What to wait for. Literal text is escaped; regular expressions match
/// with `.` spanning newlines, since console output wraps arbitrarily.
#[derive(Clone)]
pub struct Pattern {
    source: String,
    regex: Regex,
}

impl Pattern {
    pub fn literal(text: &str) -> Self {
        Self::build(text, &regex::escape(text)).expect("escaped literal is a valid regex")
    }

    pub fn regex(source: &str) -> Result<Self, regex::Error> { Self::build(source, source) }

    fn build(source: &str, expression: &str) -> Result<Self, regex::Error> {
        Ok(Self { source: source.to_owned(), regex: Regex::new(&format!("(?s){}", expression))? })
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{:?}", self.source) }
}

impl From<&str> for Pattern {
    fn from(text: &str) -> Self { Pattern::literal(text) }
}

impl From<&Pattern> for Pattern {
    fn from(pattern: &Pattern) -> Self { pattern.clone() }
}

pub struct SerialChannel<P: Port> {
    port: P,
    buffer: Vec<u8>,
    transcript: Option<File>,
}

impl SerialChannel<TtyPort> {
    /// Opens a tty exclusively. Fails if the device is missing or held
    /// by someone else.
    pub fn open(path: &Path, transcript: Option<&Path>) -> Result<Self, Error> {
        let port = TtyPort::open(path)?;
        let transcript = match transcript {
            Some(log_path) => {
                info!("serial[{}]: logging console output to {}", path.display(), log_path.display());
                Some(OpenOptions::new().create(true).append(true).open(log_path)?)
            }
            None => None,
        };
        Ok(Self::new(port, transcript))
    }
}

impl<P: Port> SerialChannel<P> {
    pub fn new(port: P, transcript: Option<File>) -> Self {
        info!("serial[{}]: creating serial connection", port.name());
        Self { port, buffer: Vec::new(), transcript }
    }

    pub fn name(&self) -> &str { self.port.name() }

    /// Unconsumed console output.
    pub fn buffer(&self) -> String { String::from_utf8_lossy(&self.buffer).into_owned() }

    /// Writes `bytes`, then gives the firmware `sleep_after` to react.
    pub fn send<B: AsRef<[u8]>>(&mut self, bytes: B, sleep_after: Duration) -> Result<(), Error> {
        let bytes = bytes.as_ref();
        debug!("serial[{}]: send {:?}", self.name(), String::from_utf8_lossy(bytes));
        serial::write_all(&mut self.port, bytes)?;
        if !sleep_after.is_zero() {
            sleep(sleep_after);
        }
        Ok(())
    }

    /// Waits until `pattern` shows up in the console output. Returns the
    /// consumed text: everything before the match plus the match itself.
    /// On timeout nothing is consumed.
    pub fn expect<T: Into<Pattern>>(&mut self, pattern: T, timeout: Duration) -> Result<String, Error> {
        let pattern = pattern.into();
        let deadline = Instant::now() + timeout;
        debug!("serial[{}]: expect message {:?}", self.name(), pattern);

        loop {
            self.read_pending()?;

            if let Some(found) = pattern.regex.find(&self.buffer) {
                let end = found.end();
                let consumed: Vec<u8> = self.buffer.drain(..end).collect();
                debug!(
                    "serial[{}]: found expected message ({} bytes, {} remaining)",
                    self.name(),
                    end,
                    self.buffer.len()
                );
                return Ok(String::from_utf8_lossy(&consumed).into_owned());
            }

            if Instant::now() >= deadline {
                debug!(
                    "serial[{}]: did not find expected message {:?} (buffer content is {:?})",
                    self.name(),
                    pattern,
                    self.buffer()
                );
                return Err(Error::Timeout {
                    port: self.name().to_owned(),
                    pattern: format!("{:?}", pattern),
                    buffer: self.buffer(),
                });
            }

            sleep(POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now())));
        }
    }

    /// Returns (and forgets) all output received so far, without waiting.
    pub fn drain_all(&mut self) -> Result<String, Error> {
        self.read_pending()?;
        let drained: Vec<u8> = self.buffer.drain(..).collect();
        Ok(String::from_utf8_lossy(&drained).into_owned())
    }

    /// Keeps reading (and transcribing) console output for `duration`,
    /// or until `stop` is raised.
    pub fn pump(&mut self, duration: Duration, stop: &AtomicBool) -> Result<(), Error> {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline && !stop.load(Ordering::Relaxed) {
            self.read_pending()?;
            sleep(POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now())));
        }
        Ok(())
    }

    /// Flushes the transcript and releases the device. Dropping the
    /// channel has the same effect.
    pub fn close(self) {}

    fn read_pending(&mut self) -> Result<(), Error> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let n = self.port.read_available(&mut chunk)?;
            if n == 0 {
                return Ok(());
            }
            debug!(
                "serial[{}]: read buffer ({} + {} bytes): {:?}",
                self.port.name(),
                self.buffer.len(),
                n,
                String::from_utf8_lossy(&chunk[..n])
            );
            if let Some(transcript) = self.transcript.as_mut() {
                transcript.write_all(&chunk[..n])?;
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }
}

impl<P: Port> Drop for SerialChannel<P> {
    fn drop(&mut self) {
        info!("serial[{}]: closing serial connection", self.port.name());
        if let Some(transcript) = self.transcript.as_mut() {
            if let Err(e) = transcript.flush() {
                warn!("serial[{}]: failed to flush transcript: {}", self.port.name(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::doubles::serial::ScriptedPort;

    const SHORT: Duration = Duration::from_millis(50);

    #[test]
    fn expect_consumes_output_up_to_the_match_only() {
        // Given
        let port = ScriptedPort::new("fake").with_output(b"noise SCP Main Menu trailing");
        let mut channel = SerialChannel::new(port, None);

        // When
        let consumed = channel.expect("SCP Main Menu", SHORT).unwrap();

        // Then
        assert_eq!(consumed, "noise SCP Main Menu");
        assert_eq!(channel.buffer(), " trailing");
    }

    #[test]
    fn stale_output_is_never_matched_twice() {
        // Given
        let port = ScriptedPort::new("fake").with_output(b"OK OK");
        let mut channel = SerialChannel::new(port, None);

        // When
        channel.expect("OK", SHORT).unwrap();
        channel.expect("OK", SHORT).unwrap();
        let third = channel.expect("OK", SHORT);

        // Then
        assert!(matches!(third, Err(Error::Timeout { .. })));
    }

    #[test]
    fn timeout_leaves_buffer_untouched() {
        // Given
        let port = ScriptedPort::new("fake").with_output(b"Hit any key");
        let mut channel = SerialChannel::new(port, None);

        // When
        let result = channel.expect("crb106-pcie>", SHORT);

        // Then
        match result {
            Err(Error::Timeout { buffer, .. }) => assert_eq!(buffer, "Hit any key"),
            _ => panic!("expected a timeout"),
        }
        assert_eq!(channel.buffer(), "Hit any key");
    }

    #[test]
    fn zero_timeout_still_checks_already_available_output() {
        let port = ScriptedPort::new("fake").with_output(b"Device Path");
        let mut channel = SerialChannel::new(port, None);
        assert!(channel.expect("Device Path", Duration::from_millis(0)).is_ok());
    }

    #[test]
    fn regex_patterns_span_line_breaks() {
        // Given
        let port = ScriptedPort::new("fake").with_output(b"This selection will\r\ntake you to the Boot\r\nManager");
        let mut channel = SerialChannel::new(port, None);
        let pattern = Pattern::regex("This selection will.*take you to the Boot.*Manager").unwrap();

        // Then
        assert!(channel.expect(&pattern, SHORT).is_ok());
    }

    #[test]
    fn literal_patterns_are_not_interpreted() {
        let port = ScriptedPort::new("fake").with_output(b"1) Boot from Primary Boot Device");
        let mut channel = SerialChannel::new(port, None);
        assert!(channel.expect("1) Boot from Primary Boot Device", SHORT).is_ok());
    }

    #[test]
    fn output_arriving_later_is_picked_up_before_the_deadline() {
        // Given
        let port = ScriptedPort::new("fake").on_delayed(b"dhcp\r\n", b"DHCP client bound to address 172.131.100.12", Duration::from_millis(60));
        let mut channel = SerialChannel::new(port, None);

        // When
        channel.send("dhcp\r\n", Duration::from_millis(0)).unwrap();

        // Then
        assert!(channel.expect("DHCP client bound to address", Duration::from_secs(2)).is_ok());
    }

    #[test]
    fn drain_returns_everything_and_empties_the_buffer() {
        let port = ScriptedPort::new("fake").with_output(b"Resetting...");
        let mut channel = SerialChannel::new(port, None);
        assert_eq!(channel.drain_all().unwrap(), "Resetting...");
        assert_eq!(channel.buffer(), "");
    }

    #[test]
    fn transcript_receives_raw_console_output() {
        // Given
        let file = tempfile::NamedTempFile::new().unwrap();
        let transcript = file.reopen().unwrap();
        let port = ScriptedPort::new("fake").with_output(b"Booting Linux");
        let mut channel = SerialChannel::new(port, Some(transcript));

        // When
        channel.drain_all().unwrap();
        channel.close();

        // Then
        assert_eq!(std::fs::read_to_string(file.path()).unwrap(), "Booting Linux");
    }

    #[test]
    fn pump_stops_early_when_released() {
        let port = ScriptedPort::new("fake");
        let mut channel = SerialChannel::new(port, None);
        let stop = AtomicBool::new(true);
        let started = Instant::now();
        channel.pump(Duration::from_secs(30), &stop).unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
