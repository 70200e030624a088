//! Driver implementations for the host side hardware: the USB-UART
//! adapters wired to the card's consoles.

pub mod serial;

use crate::{devices::channel::{Console, SerialChannel}, error::Error};
use std::path::PathBuf;

/// A console reachable through a tty device, optionally mirrored
/// into a transcript file.
#[derive(Debug, Clone)]
pub struct TtyConsole {
    pub path: PathBuf,
    pub transcript: Option<PathBuf>,
}

impl TtyConsole {
    pub fn new(path: PathBuf) -> Self { Self { path, transcript: None } }

    pub fn with_transcript(mut self, transcript: PathBuf) -> Self {
        self.transcript = Some(transcript);
        self
    }
}

impl Console for TtyConsole {
    type Port = serial::TtyPort;

    fn open(&mut self) -> Result<SerialChannel<Self::Port>, Error> {
        SerialChannel::open(&self.path, self.transcript.as_deref())
    }
}
