//! A claimed CDC-ACM function exposed as a byte stream.
//!
//! Each session runs one control worker thread (negotiation, runtime control requests and
//! teardown), one poller per IN endpoint and one writer for the bulk OUT endpoint. The caller
//! talks to them through [`CdcAcm`] and receives everything they produce as [`SessionEvent`]s.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use std::{fmt, io};

use crossbeam_channel::{Receiver, Select, Sender};

use crate::cdc::{ControlLineState, LineCoding};
use crate::config::SessionConfig;
use crate::error::{Error, HostError, Result};
use crate::host::UsbDevice;
use crate::interface::{find_pair, pair_for};
use crate::usb::{EndpDesc, EndpDirection, IfDesc};

mod control;
mod poller;
mod writer;

use control::{ControlCmd, ControlWorker};
use poller::PollCmd;
use writer::WriterCmd;

/// Life cycle of a session. `Discovering` and `Claiming` run inside [`CdcAcm::open`]; a failure
/// there is returned as an error and no handle exists, so a live handle starts at
/// `Negotiating`.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum SessionState {
    Discovering,
    Claiming,
    Negotiating,
    Active,
    Closing,
    Closed,
}

/// Identifies one `write` call in its completion event.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct WriteId(pub u64);

#[derive(Debug)]
pub enum SessionEvent {
    /// Negotiation finished and the session is active. `confirmed` is the line coding the
    /// device reported back, if it did.
    Ready { confirmed: Option<LineCoding> },
    /// Bytes received on the bulk IN endpoint.
    Data(Vec<u8>),
    /// Bytes received on the control interface's notification endpoint.
    Status(Vec<u8>),
    /// A write left the OUT endpoint, or failed to.
    WriteComplete { id: WriteId, result: Result<()> },
    /// A transfer or control request failed. The session keeps running.
    Error(Error),
    /// Teardown finished. Always the last event of a session, and sent exactly once.
    Closed(Result<()>),
}

#[derive(Clone, Copy, Debug)]
struct LineCodingState {
    requested: LineCoding,
    confirmed: Option<LineCoding>,
}

pub(crate) struct Shared {
    state: Mutex<SessionState>,
    line_coding: Mutex<LineCodingState>,
    /// Cleared once teardown removes the listeners; gates every event except `Closed`.
    listening: RwLock<bool>,
    polling: AtomicBool,
    user_paused: AtomicBool,
    queued_chunks: AtomicUsize,
    destroy_requested: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn new(line_coding: LineCoding) -> Self {
        Self {
            state: Mutex::new(SessionState::Negotiating),
            line_coding: Mutex::new(LineCodingState {
                requested: line_coding,
                confirmed: None,
            }),
            listening: RwLock::new(true),
            polling: AtomicBool::new(false),
            user_paused: AtomicBool::new(false),
            queued_chunks: AtomicUsize::new(0),
            destroy_requested: AtomicBool::new(false),
        }
    }
    fn state(&self) -> SessionState {
        *lock(&self.state)
    }
    fn set_state(&self, state: SessionState) {
        *lock(&self.state) = state;
    }
    fn requested_line_coding(&self) -> LineCoding {
        lock(&self.line_coding).requested
    }
    fn set_requested_line_coding(&self, coding: LineCoding) {
        lock(&self.line_coding).requested = coding;
    }
    fn confirmed_line_coding(&self) -> Option<LineCoding> {
        lock(&self.line_coding).confirmed
    }
    fn set_confirmed_line_coding(&self, coding: Option<LineCoding>) {
        lock(&self.line_coding).confirmed = coding;
    }
    fn destroy_requested(&self) -> bool {
        self.destroy_requested.load(Ordering::Acquire)
    }
}

/// The sending half of a session's event channel, shared by its worker threads.
#[derive(Clone)]
pub(crate) struct EventSink {
    tx: Sender<SessionEvent>,
    shared: Arc<Shared>,
    high_water: usize,
}

impl EventSink {
    fn emit(&self, event: SessionEvent) {
        let listening = self
            .shared
            .listening
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if *listening {
            let _ = self.tx.send(event);
        }
    }

    /// Queues a received chunk. Returns whether the reader may keep polling.
    fn push_data(&self, chunk: Vec<u8>) -> bool {
        let listening = self
            .shared
            .listening
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if !*listening {
            return false;
        }
        let queued = self.shared.queued_chunks.fetch_add(1, Ordering::AcqRel) + 1;
        let _ = self.tx.send(SessionEvent::Data(chunk));
        queued < self.high_water
    }

    fn remove_listeners(&self) {
        *self
            .shared
            .listening
            .write()
            .unwrap_or_else(PoisonError::into_inner) = false;
    }

    fn closing(&self) -> bool {
        self.shared.state() >= SessionState::Closing
    }

    fn set_polling(&self, polling: bool) {
        self.shared.polling.store(polling, Ordering::Release);
    }

    fn finish(&self, result: Result<()>) {
        let _ = self.tx.send(SessionEvent::Closed(result));
    }
}

/// Interfaces held by a session, and whether a kernel driver had to be detached from them.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Claims {
    control: u8,
    data: u8,
    control_detached: bool,
    data_detached: bool,
}

impl Claims {
    /// Claims the control interface, then the data interface. Nothing stays claimed or
    /// detached if this fails.
    fn acquire<D: UsbDevice>(
        device: &D,
        control: u8,
        data: u8,
        detach: bool,
        name: &str,
    ) -> Result<Self> {
        let control_detached = claim(device, control, detach, name)?;
        let data_detached = match claim(device, data, detach, name) {
            Ok(detached) => detached,
            Err(err) => {
                log::warn!("{}: {}, giving back interface {}", name, err, control);
                if let Err(err) = device.release_interface(control) {
                    log::warn!("{}: failed to release interface {}: {}", name, control, err);
                }
                if control_detached {
                    if let Err(err) = device.attach_kernel_driver(control) {
                        log::warn!("{}: failed to reattach interface {}: {}", name, control, err);
                    }
                }
                return Err(err);
            }
        };
        Ok(Self {
            control,
            data,
            control_detached,
            data_detached,
        })
    }

    /// Releases the data interface, then the control interface, then reattaches kernel
    /// drivers that were detached. Every step runs; the first failure is returned.
    fn release<D: UsbDevice>(&self, device: &D, name: &str) -> Option<Error> {
        let mut first_error = None;
        for interface in [self.data, self.control] {
            log::debug!("{}: releasing interface {}", name, interface);
            if let Err(source) = device.release_interface(interface) {
                let err = Error::ReleaseFailed { interface, source };
                log::warn!("{}: {}", name, err);
                first_error.get_or_insert(err);
            }
        }
        for (interface, detached) in [
            (self.data, self.data_detached),
            (self.control, self.control_detached),
        ] {
            if !detached {
                continue;
            }
            log::debug!("{}: reattaching kernel driver to interface {}", name, interface);
            if let Err(source) = device.attach_kernel_driver(interface) {
                let err = Error::ReattachFailed { interface, source };
                log::warn!("{}: {}", name, err);
                first_error.get_or_insert(err);
            }
        }
        first_error
    }
}

/// Claims one interface, detaching the kernel driver first if one is bound. Returns whether a
/// detach happened.
fn claim<D: UsbDevice>(device: &D, interface: u8, detach: bool, name: &str) -> Result<bool> {
    let claim_failed = |source| Error::ClaimFailed { interface, source };

    let mut detached = false;
    if detach && device.is_kernel_driver_active(interface).map_err(claim_failed)? {
        log::debug!("{}: detaching kernel driver from interface {}", name, interface);
        device.detach_kernel_driver(interface).map_err(claim_failed)?;
        detached = true;
    }

    log::debug!("{}: claiming interface {}", name, interface);
    if let Err(source) = device.claim_interface(interface) {
        if detached {
            if let Err(err) = device.attach_kernel_driver(interface) {
                log::warn!("{}: failed to reattach interface {}: {}", name, interface, err);
            }
        }
        return Err(claim_failed(source));
    }
    Ok(detached)
}

pub(crate) struct Endpoints<E> {
    status: E,
    status_len: usize,
    bulk_in: E,
    bulk_in_len: usize,
    bulk_out: E,
}

fn open_endpoints<D: UsbDevice>(
    device: &D,
    control: &IfDesc,
    data: &IfDesc,
    config: &SessionConfig,
) -> Result<Endpoints<D::Endpoint>> {
    let status_desc = control
        .endpoints
        .first()
        .ok_or(Error::CdcInterfaceInvalid(control.number))?;
    let (in_desc, out_desc) = match data.endpoints.as_slice() {
        [a, b] if a.direction() == EndpDirection::In => (a, b),
        [a, b] => (b, a),
        _ => return Err(Error::DataInterfaceInvalid(data.number)),
    };

    let timeout = config.transfer_timeout();
    let open = |desc: &EndpDesc, interface: u8| {
        device
            .open_endpoint(desc, timeout)
            .map_err(|source| Error::ClaimFailed { interface, source })
    };

    Ok(Endpoints {
        status: open(status_desc, control.number)?,
        status_len: usize::from(status_desc.max_packet_size).max(1),
        bulk_in: open(in_desc, data.number)?,
        bulk_in_len: config
            .read_buffer_len
            .unwrap_or(usize::from(in_desc.max_packet_size))
            .max(1),
        bulk_out: open(out_desc, data.number)?,
    })
}

pub(crate) fn spawn_named<F>(name: String, f: F) -> io::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new().name(name).spawn(f)
}

#[derive(Clone, Copy)]
enum Wait {
    Forever,
    Until(Instant),
    Never,
}

/// An open CDC-ACM session.
///
/// Dropping the handle starts teardown without waiting for it; use [`CdcAcm::close`] to wait.
pub struct CdcAcm {
    name: String,
    control_interface: u8,
    data_interface: u8,
    high_water: usize,
    shared: Arc<Shared>,
    events: Receiver<SessionEvent>,
    /// Data chunks received while paused, handed out in order after `resume`.
    held: Mutex<VecDeque<Vec<u8>>>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    control_tx: Sender<ControlCmd>,
    write_tx: Sender<WriterCmd>,
    read_tx: Sender<PollCmd>,
    next_write_id: AtomicU64,
    closed: AtomicBool,
    worker: Option<JoinHandle<()>>,
}

impl fmt::Debug for CdcAcm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CdcAcm")
            .field("name", &self.name)
            .field("control_interface", &self.control_interface)
            .field("data_interface", &self.data_interface)
            .field("state", &self.state())
            .finish()
    }
}

impl CdcAcm {
    /// Finds the first CDC-ACM function of an opened device and starts a session on it.
    pub fn open<D: UsbDevice>(device: Arc<D>, config: SessionConfig) -> Result<Self> {
        let interfaces = device.interfaces().map_err(Error::Host)?;
        let (control, data) = find_pair(&interfaces)?;
        Self::start(device, control, data, config)
    }

    /// Starts a session on the function managed by control interface `control`.
    pub fn open_interface<D: UsbDevice>(
        device: Arc<D>,
        control: u8,
        config: SessionConfig,
    ) -> Result<Self> {
        let interfaces = device.interfaces().map_err(Error::Host)?;
        let (control, data) = pair_for(&interfaces, control)?;
        Self::start(device, control, data, config)
    }

    fn start<D: UsbDevice>(
        device: Arc<D>,
        control: &IfDesc,
        data: &IfDesc,
        config: SessionConfig,
    ) -> Result<Self> {
        let name = config
            .name
            .clone()
            .unwrap_or_else(|| format!("acm{}", control.number));
        log::info!(
            "{}: control interface {}, data interface {}",
            name,
            control.number,
            data.number
        );

        let detach = config.detach_kernel_driver && device.kernel_driver_capability();
        let claims = Claims::acquire(&*device, control.number, data.number, detach, &name)?;

        let endpoints = match open_endpoints(&*device, control, data, &config) {
            Ok(endpoints) => endpoints,
            Err(err) => {
                claims.release(&*device, &name);
                return Err(err);
            }
        };

        let high_water = config.read_high_water.max(1);
        let shared = Arc::new(Shared::new(config.line_coding));
        let (event_tx, events) = crossbeam_channel::unbounded();
        let (control_tx, control_rx) = crossbeam_channel::unbounded();
        let (write_tx, write_rx) = crossbeam_channel::unbounded();
        let (read_tx, read_rx) = crossbeam_channel::unbounded();
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);

        let sink = EventSink {
            tx: event_tx,
            shared: Arc::clone(&shared),
            high_water,
        };
        let worker = ControlWorker {
            name: name.clone(),
            device: Arc::clone(&device),
            claims,
            shared: Arc::clone(&shared),
            sink,
            commands: control_rx,
            read_tx: read_tx.clone(),
            read_rx,
            write_tx: write_tx.clone(),
            write_rx,
            stop_wait: config.stop_wait(),
        };
        let worker = match spawn_named(format!("{name}-control"), move || worker.run(endpoints))
        {
            Ok(handle) => handle,
            Err(err) => {
                claims.release(&*device, &name);
                return Err(Error::Host(HostError::Io(err)));
            }
        };

        Ok(Self {
            name,
            control_interface: control.number,
            data_interface: data.number,
            high_water,
            shared,
            events,
            held: Mutex::new(VecDeque::new()),
            wake_tx,
            wake_rx,
            control_tx,
            write_tx,
            read_tx,
            next_write_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            worker: Some(worker),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn control_interface(&self) -> u8 {
        self.control_interface
    }
    pub fn data_interface(&self) -> u8 {
        self.data_interface
    }
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }
    /// The line coding last sent to the device.
    pub fn requested_line_coding(&self) -> LineCoding {
        self.shared.requested_line_coding()
    }
    /// The line coding the device last reported back, if any.
    pub fn confirmed_line_coding(&self) -> Option<LineCoding> {
        self.shared.confirmed_line_coding()
    }
    pub fn is_polling(&self) -> bool {
        self.shared.polling.load(Ordering::Acquire)
    }

    fn accepting(&self) -> bool {
        !self.shared.destroy_requested() && self.shared.state() < SessionState::Closing
    }

    /// Queues `data` for the bulk OUT endpoint. Completion is reported as a
    /// [`SessionEvent::WriteComplete`]; completions arrive in the order of the writes. Writes
    /// made before negotiation finishes are sent once the session is active.
    pub fn write(&self, data: &[u8]) -> Result<WriteId> {
        if !self.accepting() {
            return Err(Error::SessionClosed);
        }
        let id = WriteId(self.next_write_id.fetch_add(1, Ordering::Relaxed));
        log::trace!("{}: queueing write {:?} of {} bytes", self.name, id, data.len());
        self.write_tx
            .send(WriterCmd::Write {
                id,
                data: data.to_vec(),
            })
            .map_err(|_| Error::SessionClosed)?;
        Ok(id)
    }

    /// Stops polling the bulk IN endpoint until [`CdcAcm::resume`] is called. Data that was
    /// already received is held back until then; other events keep coming.
    pub fn pause(&self) {
        self.shared.user_paused.store(true, Ordering::Release);
        if self.shared.polling.swap(false, Ordering::AcqRel) {
            log::debug!("{}: pausing reads", self.name);
            let _ = self.read_tx.send(PollCmd::Pause);
        }
    }

    pub fn resume(&self) {
        self.shared.user_paused.store(false, Ordering::Release);
        // Wakes a caller blocked in `next_event` so it picks up held data.
        let _ = self.wake_tx.try_send(());
        self.want_data();
    }

    fn paused(&self) -> bool {
        self.shared.user_paused.load(Ordering::Acquire)
    }

    fn want_data(&self) {
        if !self.accepting()
            || self.paused()
            || self.shared.queued_chunks.load(Ordering::Acquire) >= self.high_water
        {
            return;
        }
        if !self.shared.polling.swap(true, Ordering::AcqRel) {
            log::debug!("{}: polling for reads", self.name);
            let _ = self.read_tx.send(PollCmd::Start);
        }
    }

    fn observe(&self, event: SessionEvent) -> SessionEvent {
        match &event {
            SessionEvent::Data(_) => {
                self.shared.queued_chunks.fetch_sub(1, Ordering::AcqRel);
            }
            SessionEvent::Closed(_) => self.closed.store(true, Ordering::Release),
            _ => (),
        }
        event
    }

    fn receive(&self, wait: Wait) -> Option<SessionEvent> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            if !self.paused() {
                if let Some(chunk) = lock(&self.held).pop_front() {
                    return Some(self.observe(SessionEvent::Data(chunk)));
                }
            }
            self.want_data();

            let mut select = Select::new();
            let events = select.recv(&self.events);
            select.recv(&self.wake_rx);
            let oper = match wait {
                Wait::Forever => select.select(),
                Wait::Until(deadline) => select
                    .select_timeout(deadline.saturating_duration_since(Instant::now()))
                    .ok()?,
                Wait::Never => select.try_select().ok()?,
            };
            if oper.index() != events {
                let _ = oper.recv(&self.wake_rx);
                continue;
            }

            match oper.recv(&self.events).ok()? {
                SessionEvent::Data(chunk) if self.paused() => {
                    log::trace!("{}: holding {} bytes while paused", self.name, chunk.len());
                    lock(&self.held).push_back(chunk);
                }
                SessionEvent::Closed(result) => {
                    let mut held = lock(&self.held);
                    if !held.is_empty() {
                        log::debug!("{}: dropping {} held chunk(s)", self.name, held.len());
                        held.clear();
                    }
                    drop(held);
                    return Some(self.observe(SessionEvent::Closed(result)));
                }
                event => return Some(self.observe(event)),
            }
        }
    }

    /// Waits for the next event. Asking for events is what keeps the bulk IN endpoint polled,
    /// unless the session is paused; while paused, `Data` is held back. Returns `None` once
    /// `Closed` has been handed out.
    pub fn next_event(&self) -> Option<SessionEvent> {
        self.receive(Wait::Forever)
    }

    pub fn next_event_timeout(&self, timeout: Duration) -> Option<SessionEvent> {
        self.receive(Wait::Until(Instant::now() + timeout))
    }

    pub fn try_next_event(&self) -> Option<SessionEvent> {
        self.receive(Wait::Never)
    }

    fn control<T>(&self, make: impl FnOnce(Sender<Result<T>>) -> ControlCmd) -> Result<T> {
        if !self.accepting() {
            return Err(Error::SessionClosed);
        }
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.control_tx
            .send(make(reply_tx))
            .map_err(|_| Error::SessionClosed)?;
        reply_rx.recv().map_err(|_| Error::SessionClosed)?
    }

    /// Sends a new line coding and reads it back. Blocks until the session is active and the
    /// requests are done; returns the coding the device reported, if it did.
    pub fn set_line_coding(&self, coding: LineCoding) -> Result<Option<LineCoding>> {
        self.control(|reply| ControlCmd::SetLineCoding(coding, reply))
    }

    pub fn set_control_line_state(&self, state: ControlLineState) -> Result<()> {
        self.control(|reply| ControlCmd::SetControlLineState(state, reply))
    }

    /// Sends a break of `millis` milliseconds. 0xFFFF keeps the break on until another
    /// SEND_BREAK with a zero duration.
    pub fn send_break(&self, millis: u16) -> Result<()> {
        self.control(|reply| ControlCmd::SendBreak(millis, reply))
    }

    /// Starts teardown. The session ends with exactly one [`SessionEvent::Closed`]. Calling this
    /// more than once has no further effect.
    pub fn destroy(&self) {
        if self.shared.destroy_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!("{}: destroy requested", self.name);
        let _ = self.control_tx.send(ControlCmd::Close);
    }

    /// Tears the session down and waits for it to finish, discarding pending events.
    pub fn close(mut self) -> Result<()> {
        self.destroy();
        let mut result = Ok(());
        if !self.closed.load(Ordering::Acquire) {
            while let Ok(event) = self.events.recv() {
                if let SessionEvent::Closed(closed) = self.observe(event) {
                    result = closed;
                    break;
                }
            }
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("{}: control worker panicked", self.name);
            }
        }
        result
    }
}

impl Drop for CdcAcm {
    fn drop(&mut self) {
        self.destroy();
    }
}
