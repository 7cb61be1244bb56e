use crossbeam_channel::Receiver;

use super::{EventSink, SessionEvent, WriteId};
use crate::error::{Error, HostError};
use crate::host::UsbEndpoint;

pub(crate) enum WriterCmd {
    Write { id: WriteId, data: Vec<u8> },
    Stop,
}

/// Sends queued writes to the bulk OUT endpoint one at a time, in submission order.
pub(super) struct Writer<E> {
    pub name: String,
    pub endpoint: E,
    pub jobs: Receiver<WriterCmd>,
    pub sink: EventSink,
}

impl<E: UsbEndpoint> Writer<E> {
    fn send(&mut self, data: &[u8]) -> Result<(), HostError> {
        let written = self.endpoint.transfer_write(data)?;
        if written < data.len() {
            return Err(HostError::ShortTransfer {
                expected: data.len(),
                actual: written,
            });
        }
        Ok(())
    }

    pub fn run(mut self) {
        while let Ok(cmd) = self.jobs.recv() {
            let (id, data) = match cmd {
                WriterCmd::Write { id, data } => (id, data),
                WriterCmd::Stop => break,
            };
            if self.sink.closing() {
                log::debug!("{}: dropping write {:?}, session closing", self.name, id);
                continue;
            }
            let result = self.send(&data).map_err(|err| {
                log::warn!("{}: write {:?} failed: {}", self.name, id, err);
                Error::TransferError(err)
            });
            log::trace!("{}: write {:?} of {} bytes done", self.name, id, data.len());
            self.sink.emit(SessionEvent::WriteComplete { id, result });
        }
        log::debug!("{}: writer stopped", self.name);
    }
}
