use crossbeam_channel::{Receiver, TryRecvError};

use super::{EventSink, SessionEvent};
use crate::cdc::Notification;
use crate::error::{Error, HostError};
use crate::host::UsbEndpoint;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum PollCmd {
    Start,
    Pause,
    Stop,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum Stream {
    /// Bulk IN of the data interface. Subject to pausing and backpressure.
    Data,
    /// Interrupt IN of the control interface.
    Status,
}

/// Repeatedly reads one IN endpoint while running.
pub(super) struct Poller<E> {
    name: String,
    stream: Stream,
    endpoint: E,
    buf_len: usize,
    commands: Receiver<PollCmd>,
    sink: EventSink,
    running: bool,
    /// A chunk that completed after a pause, delivered on the next start.
    stash: Option<Vec<u8>>,
}

impl<E: UsbEndpoint> Poller<E> {
    pub fn new(
        name: String,
        stream: Stream,
        endpoint: E,
        buf_len: usize,
        commands: Receiver<PollCmd>,
        sink: EventSink,
    ) -> Self {
        Self {
            name,
            stream,
            endpoint,
            buf_len,
            commands,
            sink,
            running: false,
            stash: None,
        }
    }

    fn set_running(&mut self, running: bool) {
        self.running = running;
        if self.stream == Stream::Data {
            self.sink.set_polling(running);
        }
    }

    /// Applies one command. Returns false once the poller must exit.
    fn apply(&mut self, cmd: PollCmd) -> bool {
        match cmd {
            PollCmd::Start => {
                self.set_running(true);
                if let Some(chunk) = self.stash.take() {
                    self.deliver(chunk);
                }
                true
            }
            PollCmd::Pause => {
                self.set_running(false);
                true
            }
            PollCmd::Stop => false,
        }
    }

    /// Applies every queued command without blocking.
    fn drain(&mut self) -> bool {
        loop {
            match self.commands.try_recv() {
                Ok(cmd) => {
                    if !self.apply(cmd) {
                        return false;
                    }
                }
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn deliver(&mut self, chunk: Vec<u8>) {
        match self.stream {
            Stream::Data => {
                if !self.sink.push_data(chunk) {
                    log::trace!("{}: read queue full, pausing", self.name);
                    self.set_running(false);
                }
            }
            Stream::Status => {
                match Notification::parse(&chunk) {
                    Some(notification) => log::debug!("{}: {:?}", self.name, notification),
                    None => log::debug!("{}: short notification {:02x?}", self.name, chunk),
                }
                self.sink.emit(SessionEvent::Status(chunk));
            }
        }
    }

    pub fn run(mut self) {
        let mut buf = vec![0u8; self.buf_len];
        loop {
            if !self.running {
                match self.commands.recv() {
                    Ok(cmd) => {
                        if !self.apply(cmd) {
                            break;
                        }
                    }
                    Err(_) => break,
                }
                continue;
            }
            if !self.drain() {
                break;
            }
            if !self.running {
                continue;
            }

            match self.endpoint.transfer_read(&mut buf) {
                Ok(0) => (),
                Ok(len) => {
                    log::trace!("{}: {:?} read {} bytes", self.name, self.stream, len);
                    let chunk = buf[..len].to_vec();
                    // Commands sent while the read was in flight take effect first.
                    if !self.drain() {
                        break;
                    }
                    if self.running {
                        self.deliver(chunk);
                    } else {
                        self.stash = Some(chunk);
                    }
                }
                Err(HostError::Timeout) => (),
                Err(err) => {
                    log::warn!("{}: {:?} read failed: {}", self.name, self.stream, err);
                    self.set_running(false);
                    self.sink.emit(SessionEvent::Error(Error::TransferError(err)));
                }
            }
        }
        log::debug!("{}: {:?} poller stopped", self.name, self.stream);
    }
}
