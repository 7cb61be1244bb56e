#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use smallvec::smallvec;

use usbacm::cdc::{CDC_SUBCLASS_ACM, USB_CLASS_CDC, USB_CLASS_CDC_DATA};
use usbacm::usb::{DeviceReqData, EndpDesc, IfDesc, PortReqRecipient, PortReqTy};
use usbacm::{CdcAcm, HostError, LineCoding, SessionConfig, SessionEvent, UsbDevice, UsbEndpoint};

pub const STATUS_EP: u8 = 0x83;
pub const BULK_IN_EP: u8 = 0x81;
pub const BULK_OUT_EP: u8 = 0x02;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Op {
    Detach(u8),
    Attach(u8),
    Claim(u8),
    Release(u8),
    Request {
        request: u8,
        value: u16,
        index: u16,
        data: Vec<u8>,
    },
    Write(Vec<u8>),
}

pub fn endpoint(address: u8, attributes: u8) -> EndpDesc {
    EndpDesc {
        address,
        attributes,
        max_packet_size: 64,
        interval: 0,
    }
}

pub fn control(number: u8, data: u8) -> IfDesc {
    IfDesc {
        number,
        alternate_setting: 0,
        class: USB_CLASS_CDC,
        sub_class: CDC_SUBCLASS_ACM,
        protocol: 1,
        endpoints: smallvec![endpoint(STATUS_EP, 3)],
        extra: vec![5, 36, 0, 0x10, 1, 4, 36, 2, 2, 5, 36, 6, number, data],
    }
}

pub fn data(number: u8) -> IfDesc {
    IfDesc {
        number,
        alternate_setting: 0,
        class: USB_CLASS_CDC_DATA,
        sub_class: 0,
        protocol: 0,
        endpoints: smallvec![endpoint(BULK_OUT_EP, 2), endpoint(BULK_IN_EP, 2)],
        extra: Vec::new(),
    }
}

/// A vendor interface, followed by ACM control interface 2 and data interface 3.
pub fn acm_interfaces() -> Vec<IfDesc> {
    let mut vendor = data(0);
    vendor.class = 0xFF;
    vec![vendor, control(2, 3), data(3)]
}

pub fn test_config() -> SessionConfig {
    SessionConfig {
        name: Some("test".into()),
        transfer_timeout_ms: Some(10),
        ..SessionConfig::default()
    }
}

type Inbound = Result<Vec<u8>, HostError>;

pub struct MockDevice {
    interfaces: Vec<IfDesc>,
    ops: Arc<Mutex<Vec<Op>>>,
    line_coding: Mutex<[u8; 7]>,

    pub kernel_drivers: bool,
    active_drivers: Mutex<Vec<u8>>,
    pub fail_claim: Option<u8>,
    pub fail_release: Option<u8>,
    pub fail_request: Option<u8>,
    /// Reports one byte more than the buffer holds on IN control transfers.
    pub overreport_in: bool,
    /// Makes IN endpoints block this long on every read, whatever timeout they were opened with.
    pub read_stall: Option<Duration>,
    gate: Option<Receiver<()>>,
    reads_in_flight: Arc<AtomicUsize>,
    released_mid_read: AtomicBool,

    data_tx: Sender<Inbound>,
    data_rx: Receiver<Inbound>,
    status_tx: Sender<Inbound>,
    status_rx: Receiver<Inbound>,
    bulk_reads: Arc<AtomicUsize>,
}

impl MockDevice {
    pub fn new(interfaces: Vec<IfDesc>) -> Self {
        let (data_tx, data_rx) = crossbeam_channel::unbounded();
        let (status_tx, status_rx) = crossbeam_channel::unbounded();
        let active_drivers = interfaces.iter().map(|iface| iface.number).collect();
        Self {
            interfaces,
            ops: Arc::new(Mutex::new(Vec::new())),
            line_coding: Mutex::new([0; 7]),
            kernel_drivers: false,
            active_drivers: Mutex::new(active_drivers),
            fail_claim: None,
            fail_release: None,
            fail_request: None,
            overreport_in: false,
            read_stall: None,
            gate: None,
            reads_in_flight: Arc::new(AtomicUsize::new(0)),
            released_mid_read: AtomicBool::new(false),
            data_tx,
            data_rx,
            status_tx,
            status_rx,
            bulk_reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Makes every control request wait for a token on the returned sender. Dropping the
    /// sender lets all requests through.
    pub fn gate(&mut self) -> Sender<()> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.gate = Some(rx);
        tx
    }

    pub fn ops(&self) -> Vec<Op> {
        self.ops.lock().unwrap().clone()
    }

    pub fn requests(&self) -> Vec<(u8, u16, u16)> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::Request {
                    request,
                    value,
                    index,
                    ..
                } => Some((request, value, index)),
                _ => None,
            })
            .collect()
    }

    pub fn push_data(&self, chunk: &[u8]) {
        self.data_tx.send(Ok(chunk.to_vec())).unwrap();
    }
    pub fn push_data_error(&self, err: HostError) {
        self.data_tx.send(Err(err)).unwrap();
    }
    pub fn pending_data(&self) -> usize {
        self.data_rx.len()
    }
    pub fn push_status(&self, bytes: &[u8]) {
        self.status_tx.send(Ok(bytes.to_vec())).unwrap();
    }
    pub fn bulk_reads(&self) -> usize {
        self.bulk_reads.load(Ordering::SeqCst)
    }
    /// Whether an interface was released while an endpoint read was still running.
    pub fn released_mid_read(&self) -> bool {
        self.released_mid_read.load(Ordering::SeqCst)
    }

    fn record(&self, op: Op) {
        self.ops.lock().unwrap().push(op);
    }
}

impl UsbDevice for MockDevice {
    type Endpoint = MockEndpoint;

    fn interfaces(&self) -> Result<Vec<IfDesc>, HostError> {
        Ok(self.interfaces.clone())
    }

    fn kernel_driver_capability(&self) -> bool {
        self.kernel_drivers
    }
    fn is_kernel_driver_active(&self, interface: u8) -> Result<bool, HostError> {
        Ok(self.active_drivers.lock().unwrap().contains(&interface))
    }
    fn detach_kernel_driver(&self, interface: u8) -> Result<(), HostError> {
        self.record(Op::Detach(interface));
        self.active_drivers.lock().unwrap().retain(|&i| i != interface);
        Ok(())
    }
    fn attach_kernel_driver(&self, interface: u8) -> Result<(), HostError> {
        self.record(Op::Attach(interface));
        self.active_drivers.lock().unwrap().push(interface);
        Ok(())
    }

    fn claim_interface(&self, interface: u8) -> Result<(), HostError> {
        self.record(Op::Claim(interface));
        if self.fail_claim == Some(interface) {
            return Err(HostError::NoDevice);
        }
        Ok(())
    }
    fn release_interface(&self, interface: u8) -> Result<(), HostError> {
        self.record(Op::Release(interface));
        if self.reads_in_flight.load(Ordering::SeqCst) > 0 {
            self.released_mid_read.store(true, Ordering::SeqCst);
        }
        if self.fail_release == Some(interface) {
            return Err(HostError::NoDevice);
        }
        Ok(())
    }

    fn device_request(
        &self,
        req_type: PortReqTy,
        req_recipient: PortReqRecipient,
        request: u8,
        value: u16,
        index: u16,
        data: DeviceReqData<'_>,
    ) -> Result<usize, HostError> {
        assert_eq!(req_type, PortReqTy::Class);
        assert_eq!(req_recipient, PortReqRecipient::Interface);
        if let Some(gate) = &self.gate {
            let _ = gate.recv();
        }

        let payload = match &data {
            DeviceReqData::Out(buf) => buf.to_vec(),
            _ => Vec::new(),
        };
        self.record(Op::Request {
            request,
            value,
            index,
            data: payload,
        });
        if self.fail_request == Some(request) {
            return Err(HostError::Stall);
        }

        match data {
            DeviceReqData::Out(buf) => {
                if request == 0x20 {
                    self.line_coding.lock().unwrap().copy_from_slice(&buf[..7]);
                }
                Ok(buf.len())
            }
            DeviceReqData::In(buf) => {
                let coding = self.line_coding.lock().unwrap();
                let len = buf.len().min(coding.len());
                buf[..len].copy_from_slice(&coding[..len]);
                if self.overreport_in {
                    return Ok(buf.len() + 1);
                }
                Ok(len)
            }
            DeviceReqData::NoData => Ok(0),
        }
    }

    fn open_endpoint(
        &self,
        desc: &EndpDesc,
        timeout: Option<Duration>,
    ) -> Result<Self::Endpoint, HostError> {
        let timeout = self
            .read_stall
            .or(timeout)
            .unwrap_or(Duration::from_millis(10));
        Ok(match desc.address {
            STATUS_EP => MockEndpoint::In {
                inbound: self.status_rx.clone(),
                timeout,
                reads: None,
                in_flight: Arc::clone(&self.reads_in_flight),
            },
            BULK_IN_EP => MockEndpoint::In {
                inbound: self.data_rx.clone(),
                timeout,
                reads: Some(Arc::clone(&self.bulk_reads)),
                in_flight: Arc::clone(&self.reads_in_flight),
            },
            BULK_OUT_EP => MockEndpoint::Out {
                ops: Arc::clone(&self.ops),
            },
            _ => return Err(HostError::NoDevice),
        })
    }
}

pub enum MockEndpoint {
    In {
        inbound: Receiver<Inbound>,
        timeout: Duration,
        reads: Option<Arc<AtomicUsize>>,
        in_flight: Arc<AtomicUsize>,
    },
    Out {
        ops: Arc<Mutex<Vec<Op>>>,
    },
}

impl UsbEndpoint for MockEndpoint {
    fn transfer_read(&mut self, buf: &mut [u8]) -> Result<usize, HostError> {
        let MockEndpoint::In {
            inbound,
            timeout,
            reads,
            in_flight,
        } = self
        else {
            return Err(HostError::Unsupported);
        };
        if let Some(reads) = reads {
            reads.fetch_add(1, Ordering::SeqCst);
        }
        in_flight.fetch_add(1, Ordering::SeqCst);
        let received = inbound.recv_timeout(*timeout);
        in_flight.fetch_sub(1, Ordering::SeqCst);
        match received {
            Ok(Ok(chunk)) => {
                let len = chunk.len().min(buf.len());
                buf[..len].copy_from_slice(&chunk[..len]);
                Ok(len)
            }
            Ok(Err(err)) => Err(err),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                Err(HostError::Timeout)
            }
        }
    }

    fn transfer_write(&mut self, buf: &[u8]) -> Result<usize, HostError> {
        let MockEndpoint::Out { ops } = self else {
            return Err(HostError::Unsupported);
        };
        ops.lock().unwrap().push(Op::Write(buf.to_vec()));
        if buf == b"fail" {
            return Err(HostError::Stall);
        }
        Ok(buf.len())
    }
}

pub fn open(device: MockDevice) -> (Arc<MockDevice>, CdcAcm) {
    open_with(device, test_config())
}

pub fn open_with(device: MockDevice, config: SessionConfig) -> (Arc<MockDevice>, CdcAcm) {
    let device = Arc::new(device);
    let session = CdcAcm::open(Arc::clone(&device), config).unwrap();
    (device, session)
}

/// Waits for the next event, failing the test if nothing arrives.
pub fn next(session: &CdcAcm) -> SessionEvent {
    session
        .next_event_timeout(Duration::from_secs(2))
        .expect("no event")
}

pub fn expect_ready(session: &CdcAcm) -> Option<LineCoding> {
    match next(session) {
        SessionEvent::Ready { confirmed } => confirmed,
        other => panic!("expected Ready, got {:?}", other),
    }
}

/// Collects events until `Closed`, then makes sure nothing follows it.
pub fn drain_until_closed(session: &CdcAcm) -> (Vec<SessionEvent>, usbacm::Result<()>) {
    let mut events = Vec::new();
    let result = loop {
        match next(session) {
            SessionEvent::Closed(result) => break result,
            other => events.push(other),
        }
    };
    if let Some(event) = session.next_event_timeout(Duration::from_millis(100)) {
        panic!("event after Closed: {:?}", event);
    }
    (events, result)
}
