use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use super::poller::{PollCmd, Poller, Stream};
use super::writer::{Writer, WriterCmd};
use super::{spawn_named, Claims, Endpoints, EventSink, SessionEvent, SessionState, Shared};
use crate::cdc::{CdcRequest, ControlLineState, LineCoding, LINE_CODING_LEN};
use crate::error::{Error, HostError, Result};
use crate::host::UsbDevice;
use crate::usb::{request_type, DeviceReqData, PortReqRecipient, PortReqTy};

pub(crate) enum ControlCmd {
    SetLineCoding(LineCoding, Sender<Result<Option<LineCoding>>>),
    SetControlLineState(ControlLineState, Sender<Result<()>>),
    SendBreak(u16, Sender<Result<()>>),
    Close,
}

enum Negotiation {
    Complete(Option<LineCoding>),
    Cancelled,
}

/// Pollers and writer of a session. Each thread holds a clone of `alive` until it returns, so
/// `exited` disconnects once all of them are gone.
struct Threads {
    handles: Vec<(String, JoinHandle<()>)>,
    alive: Sender<()>,
    exited: Receiver<()>,
}

impl Threads {
    fn new() -> Self {
        let (alive, exited) = crossbeam_channel::bounded(0);
        Self {
            handles: Vec::new(),
            alive,
            exited,
        }
    }

    fn spawn<F>(&mut self, name: String, f: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let alive = self.alive.clone();
        let handle = spawn_named(name.clone(), move || {
            f();
            drop(alive);
        })?;
        self.handles.push((name, handle));
        Ok(())
    }

    /// Waits up to `wait` for every thread to return and joins them. Threads still inside a
    /// transfer after that are left behind; returns how many.
    fn join(self, wait: Duration) -> usize {
        let Threads {
            handles,
            alive,
            exited,
        } = self;
        drop(alive);
        match exited.recv_timeout(wait) {
            Err(RecvTimeoutError::Disconnected) | Ok(()) => {
                for (name, handle) in handles {
                    if handle.join().is_err() {
                        log::error!("{}: thread panicked", name);
                    }
                }
                0
            }
            Err(RecvTimeoutError::Timeout) => handles.len(),
        }
    }
}

/// Owns the control pipe of a session for its whole life.
pub(super) struct ControlWorker<D: UsbDevice> {
    pub name: String,
    pub device: Arc<D>,
    pub claims: Claims,
    pub shared: Arc<Shared>,
    pub sink: EventSink,
    pub commands: Receiver<ControlCmd>,
    pub read_tx: Sender<PollCmd>,
    pub read_rx: Receiver<PollCmd>,
    pub write_tx: Sender<WriterCmd>,
    pub write_rx: Receiver<WriterCmd>,
    /// How long teardown waits for in-flight transfers.
    pub stop_wait: Duration,
}

impl<D: UsbDevice> ControlWorker<D> {
    pub fn run(self, endpoints: Endpoints<D::Endpoint>) {
        let Endpoints {
            status,
            status_len,
            bulk_in,
            bulk_in_len,
            bulk_out,
        } = endpoints;

        let mut threads = Threads::new();
        let (status_tx, status_rx) = crossbeam_channel::unbounded();
        let status_poller = Poller::new(
            self.name.clone(),
            Stream::Status,
            status,
            status_len,
            status_rx,
            self.sink.clone(),
        );
        match threads.spawn(format!("{}-status", self.name), move || status_poller.run()) {
            Ok(()) => {
                let _ = status_tx.send(PollCmd::Start);
            }
            Err(err) => {
                log::warn!("{}: no status poller: {}", self.name, err);
            }
        }

        match self.negotiate() {
            Ok(Negotiation::Complete(confirmed)) => {
                self.shared.set_state(SessionState::Active);
                log::info!("{}: active", self.name);
                // Ready goes out before any data or write completion can.
                self.sink.emit(SessionEvent::Ready { confirmed });
                match self.spawn_data_threads(&mut threads, bulk_in, bulk_in_len, bulk_out) {
                    Ok(()) => self.serve(),
                    Err(err) => {
                        log::error!("{}: failed to start transfers: {}", self.name, err);
                        self.sink.emit(SessionEvent::Error(Error::Host(HostError::Io(err))));
                    }
                }
            }
            Ok(Negotiation::Cancelled) => {
                log::info!("{}: destroyed while negotiating", self.name);
            }
            Err(err) => {
                log::error!("{}: negotiation failed: {}", self.name, err);
                self.sink.emit(SessionEvent::Error(err));
            }
        }

        self.teardown(&status_tx, threads);
    }

    fn spawn_data_threads(
        &self,
        threads: &mut Threads,
        bulk_in: D::Endpoint,
        bulk_in_len: usize,
        bulk_out: D::Endpoint,
    ) -> io::Result<()> {
        let reader = Poller::new(
            self.name.clone(),
            Stream::Data,
            bulk_in,
            bulk_in_len,
            self.read_rx.clone(),
            self.sink.clone(),
        );
        threads.spawn(format!("{}-read", self.name), move || reader.run())?;

        let writer = Writer {
            name: self.name.clone(),
            endpoint: bulk_out,
            jobs: self.write_rx.clone(),
            sink: self.sink.clone(),
        };
        threads.spawn(format!("{}-write", self.name), move || writer.run())?;
        Ok(())
    }

    fn cancelled(&self) -> bool {
        self.shared.destroy_requested()
    }

    /// SET_LINE_CODING, SET_CONTROL_LINE_STATE(DTR | RTS), GET_LINE_CODING. A destroy request
    /// stops the sequence between requests.
    fn negotiate(&self) -> Result<Negotiation> {
        if self.cancelled() {
            return Ok(Negotiation::Cancelled);
        }
        let requested = self.shared.requested_line_coding();
        self.set_line_coding(&requested)?;

        if self.cancelled() {
            return Ok(Negotiation::Cancelled);
        }
        self.set_control_line_state(
            ControlLineState::DTE_PRESENT | ControlLineState::ACTIVATE_CARRIER,
        )?;

        if self.cancelled() {
            return Ok(Negotiation::Cancelled);
        }
        let confirmed = self.confirm_line_coding(&requested);

        if self.cancelled() {
            return Ok(Negotiation::Cancelled);
        }
        Ok(Negotiation::Complete(confirmed))
    }

    /// Reads the line coding back. A failure here only gets reported.
    fn confirm_line_coding(&self, requested: &LineCoding) -> Option<LineCoding> {
        match self.get_line_coding() {
            Ok(confirmed) => {
                if confirmed != *requested {
                    log::warn!(
                        "{}: device reports {:?}, requested {:?}",
                        self.name,
                        confirmed,
                        requested
                    );
                }
                self.shared.set_confirmed_line_coding(Some(confirmed));
                Some(confirmed)
            }
            Err(err) => {
                log::warn!("{}: {}", self.name, err);
                self.shared.set_confirmed_line_coding(None);
                self.sink.emit(SessionEvent::Error(err));
                None
            }
        }
    }

    fn serve(&self) {
        while let Ok(cmd) = self.commands.recv() {
            match cmd {
                ControlCmd::SetLineCoding(coding, reply) => {
                    let result = self.set_line_coding(&coding).map(|()| {
                        self.shared.set_requested_line_coding(coding);
                        self.confirm_line_coding(&coding)
                    });
                    let _ = reply.send(result);
                }
                ControlCmd::SetControlLineState(state, reply) => {
                    let _ = reply.send(self.set_control_line_state(state));
                }
                ControlCmd::SendBreak(millis, reply) => {
                    let _ = reply.send(self.send_break(millis));
                }
                ControlCmd::Close => break,
            }
        }
    }

    fn teardown(&self, status_tx: &Sender<PollCmd>, threads: Threads) {
        self.shared.set_state(SessionState::Closing);
        log::info!("{}: closing", self.name);

        let mut first_error = None;
        if let Err(err) = self.set_control_line_state(ControlLineState::empty()) {
            log::warn!("{}: {}", self.name, err);
            first_error = Some(err);
        }

        let _ = self.read_tx.send(PollCmd::Stop);
        self.sink.set_polling(false);
        let _ = status_tx.send(PollCmd::Stop);
        let _ = self.write_tx.send(WriterCmd::Stop);
        self.sink.remove_listeners();

        // Interfaces are released only once no transfer is running on them.
        let busy = threads.join(self.stop_wait);
        if busy > 0 {
            log::warn!(
                "{}: {} transfer thread(s) still busy after {:?}, releasing anyway",
                self.name,
                busy,
                self.stop_wait
            );
        }

        if let Some(err) = self.claims.release(&*self.device, &self.name) {
            first_error.get_or_insert(err);
        }

        self.shared.set_state(SessionState::Closed);
        log::info!("{}: closed", self.name);
        self.sink.finish(first_error.map_or(Ok(()), Err));
    }

    fn class_request(
        &self,
        request: CdcRequest,
        value: u16,
        data: DeviceReqData<'_>,
    ) -> Result<usize> {
        log::debug!(
            "{}: {:?} bmRequestType {:#04x} value {:#06x} len {}",
            self.name,
            request,
            request_type(data.direction(), PortReqTy::Class, PortReqRecipient::Interface),
            value,
            data.len()
        );
        self.device
            .device_request(
                PortReqTy::Class,
                PortReqRecipient::Interface,
                request as u8,
                value,
                u16::from(self.claims.control),
                data,
            )
            .map_err(|source| Error::ControlRequestFailed { request, source })
    }

    fn set_line_coding(&self, coding: &LineCoding) -> Result<()> {
        let bytes = coding.to_bytes();
        self.class_request(CdcRequest::SetLineCoding, 0, DeviceReqData::Out(&bytes))?;
        Ok(())
    }

    fn get_line_coding(&self) -> Result<LineCoding> {
        let mut bytes = [0u8; LINE_CODING_LEN];
        let len = self.class_request(CdcRequest::GetLineCoding, 0, DeviceReqData::In(&mut bytes))?;
        let bytes = bytes
            .get(..len)
            .ok_or(Error::InvalidLineCoding("long read-back"))?;
        LineCoding::from_bytes(bytes)
    }

    fn set_control_line_state(&self, state: ControlLineState) -> Result<()> {
        self.class_request(
            CdcRequest::SetControlLineState,
            state.bits(),
            DeviceReqData::NoData,
        )?;
        Ok(())
    }

    fn send_break(&self, millis: u16) -> Result<()> {
        self.class_request(CdcRequest::SendBreak, millis, DeviceReqData::NoData)?;
        Ok(())
    }
}
