use crate::{
    devices::channel::{Console, SerialChannel},
    error::Error,
    hal::serial::Port,
};
use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    io,
    rc::Rc,
    time::{Duration, Instant},
};

/// Console output that becomes readable in response to something
/// being written to the port.
struct Reaction {
    trigger: Vec<u8>,
    response: Vec<u8>,
    delay: Duration,
}

/// Serial port that replays canned output. Reactions fire in order,
/// each one once, when its trigger shows up in the written bytes.
pub struct ScriptedPort {
    name: String,
    pending: VecDeque<(Instant, Vec<u8>)>,
    reactions: VecDeque<Reaction>,
    unmatched: Vec<u8>,
    written: Rc<RefCell<Vec<u8>>>,
}

impl ScriptedPort {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            pending: VecDeque::new(),
            reactions: VecDeque::new(),
            unmatched: Vec::new(),
            written: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// Output available as soon as the port is read.
    pub fn with_output(mut self, output: &[u8]) -> Self {
        self.pending.push_back((Instant::now(), output.to_vec()));
        self
    }

    pub fn on(self, trigger: &[u8], response: &[u8]) -> Self {
        self.on_delayed(trigger, response, Duration::from_millis(0))
    }

    pub fn on_delayed(mut self, trigger: &[u8], response: &[u8], delay: Duration) -> Self {
        self.reactions.push_back(Reaction {
            trigger: trigger.to_vec(),
            response: response.to_vec(),
            delay,
        });
        self
    }

    /// Shared record of everything written to the port, still readable
    /// after the port itself was consumed.
    pub fn written(&self) -> Rc<RefCell<Vec<u8>>> { self.written.clone() }

    fn fire_reactions(&mut self) {
        while let Some(reaction) = self.reactions.front() {
            let position = self
                .unmatched
                .windows(reaction.trigger.len())
                .position(|w| w == &reaction.trigger[..]);
            match position {
                Some(index) => {
                    self.unmatched.drain(..index + reaction.trigger.len());
                    let reaction = self.reactions.pop_front().unwrap();
                    self.pending.push_back((Instant::now() + reaction.delay, reaction.response));
                }
                None => break,
            }
        }
    }
}

impl io::Write for ScriptedPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written.borrow_mut().extend_from_slice(buf);
        self.unmatched.extend_from_slice(buf);
        self.fire_reactions();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> { Ok(()) }
}

impl Port for ScriptedPort {
    fn name(&self) -> &str { &self.name }

    fn read_available(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        read_due(&mut self.pending, buffer)
    }
}

/// Moves bytes whose release time has passed into `buffer`.
pub fn read_due(pending: &mut VecDeque<(Instant, Vec<u8>)>, buffer: &mut [u8]) -> io::Result<usize> {
    let now = Instant::now();
    let mut count = 0;
    while count < buffer.len() {
        match pending.front_mut() {
            Some((due, bytes)) if *due <= now => {
                let n = bytes.len().min(buffer.len() - count);
                buffer[count..count + n].copy_from_slice(&bytes[..n]);
                bytes.drain(..n);
                count += n;
                if bytes.is_empty() {
                    pending.pop_front();
                }
            }
            _ => break,
        }
    }
    Ok(count)
}

/// Console whose successive `open` calls hand out the queued ports.
/// Once the queue is empty the device reports itself as unavailable.
pub struct QueuedConsole<P: Port> {
    ports: VecDeque<P>,
    opened: Rc<Cell<usize>>,
}

impl<P: Port> QueuedConsole<P> {
    pub fn new<I: IntoIterator<Item = P>>(ports: I) -> Self {
        Self { ports: ports.into_iter().collect(), opened: Rc::new(Cell::new(0)) }
    }

    /// Shared counter of successful `open` calls.
    pub fn opened(&self) -> Rc<Cell<usize>> { self.opened.clone() }
}

impl<P: Port> Console for QueuedConsole<P> {
    type Port = P;

    fn open(&mut self) -> Result<SerialChannel<P>, Error> {
        let port = self.ports.pop_front().ok_or_else(|| Error::DeviceUnavailable {
            path: String::from("/dev/fake"),
            reason: String::from("no such device"),
        })?;
        self.opened.set(self.opened.get() + 1);
        Ok(SerialChannel::new(port, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reactions_fire_once_and_in_order() {
        // Given
        let mut port = ScriptedPort::new("fake").on(b"\r\r", b"SCP Main Menu").on(b"m\r", b"SCP Management Menu");
        let mut buffer = [0u8; 64];

        // When
        port.write_all(b"m\r").unwrap();
        let nothing = port.read_available(&mut buffer).unwrap();
        port.write_all(b"\r\r").unwrap();
        let menu = port.read_available(&mut buffer).unwrap();

        // Then
        assert_eq!(nothing, 0);
        assert_eq!(&buffer[..menu], b"SCP Main Menu");
        assert_eq!(&port.written().borrow()[..], b"m\r\r\r");
    }
}
