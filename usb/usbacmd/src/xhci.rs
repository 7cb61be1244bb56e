//! Host backend talking to xhcid through its per-port scheme files.
//!
//! Requests are JSON documents written to `/scheme/<scheme>/port<port>/...`; endpoint transfers
//! go through a `ctl` file (JSON requests and results) and a `data` file (the payload).

use std::fs::{File, OpenOptions};
use std::io::prelude::*;
use std::time::Duration;
use std::{io, result};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::descriptor::{parse_configuration, Configuration, DescriptorKind};
use crate::error::HostError;
use crate::host::{UsbDevice, UsbEndpoint};
use crate::usb::{DeviceReqData, EndpDesc, IfDesc, PortReqDirection, PortReqRecipient, PortReqTy};

const GET_DESCRIPTOR: u8 = 0x06;
const CONFIG_DESC_HEADER_LEN: usize = 9;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConfigureEndpointsReq {
    /// bConfigurationValue of the configuration to select.
    pub config_desc: u8,
    pub interface_desc: Option<u8>,
    pub alternate_setting: Option<u8>,
    pub hub_ports: Option<u8>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
struct PortReq {
    direction: PortReqDirection,
    req_type: PortReqTy,
    req_recipient: PortReqRecipient,
    request: u8,
    value: u16,
    index: u16,
    length: u16,
    transfers_data: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum PortTransferStatusKind {
    Success,
    ShortPacket,
    Stalled,
    Unknown,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PortTransferStatus {
    pub kind: PortTransferStatusKind,
    pub bytes_transferred: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
enum XhciEndpCtlDirection {
    Out,
    In,
    NoData,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
enum XhciEndpCtlReq {
    Transfer {
        direction: XhciEndpCtlDirection,
        count: u32,
    },
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
enum XhciEndpCtlRes {
    TransferResult(PortTransferStatus),
    Pending,
    Idle,
}

#[derive(Debug, Error)]
pub enum XhciClientHandleError {
    #[error("i/o error: {0}")]
    IoError(#[from] io::Error),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("invalid response: {0}")]
    InvalidResponse(&'static str),

    #[error("transfer buffer too large ({0} > 65535)")]
    TransferBufTooLarge(usize),
}

impl From<XhciClientHandleError> for HostError {
    fn from(err: XhciClientHandleError) -> Self {
        match err {
            XhciClientHandleError::IoError(err) => HostError::Io(err),
            other => HostError::Backend(Box::new(other)),
        }
    }
}

type XhciResult<T> = result::Result<T, XhciClientHandleError>;

/// One device port of an xhcid instance.
#[derive(Debug)]
pub struct XhciDevice {
    scheme: String,
    port: String,
    configuration: Configuration,
}

impl XhciDevice {
    /// Opens the device at `port` of `scheme` and reads its active configuration.
    pub fn open(scheme: String, port: String) -> Result<Self, HostError> {
        let mut device = Self {
            scheme,
            port,
            configuration: Configuration {
                configuration_value: 0,
                interfaces: Vec::new(),
            },
        };

        let mut header = [0u8; CONFIG_DESC_HEADER_LEN];
        device.get_config_descriptor(&mut header)?;
        let total_len = usize::from(u16::from_le_bytes([header[2], header[3]]));
        if total_len < CONFIG_DESC_HEADER_LEN {
            return Err(XhciClientHandleError::InvalidResponse("configuration too short").into());
        }

        let mut raw = vec![0u8; total_len];
        let len = device.get_config_descriptor(&mut raw)?;
        raw.truncate(len);
        device.configuration = parse_configuration(&raw)
            .map_err(|err| HostError::Backend(Box::new(err)))?;
        log::debug!(
            "{}/port{}: configuration {} with {} interfaces",
            device.scheme,
            device.port,
            device.configuration.configuration_value,
            device.configuration.interfaces.len()
        );
        Ok(device)
    }

    fn path(&self, file: &str) -> String {
        format!("/scheme/{}/port{}/{}", self.scheme, self.port, file)
    }

    fn get_config_descriptor(&self, buf: &mut [u8]) -> Result<usize, HostError> {
        self.request(
            PortReqTy::Standard,
            PortReqRecipient::Device,
            GET_DESCRIPTOR,
            u16::from(DescriptorKind::Configuration as u8) << 8,
            0,
            DeviceReqData::In(buf),
        )
        .map_err(HostError::from)
    }

    fn configure_endpoints(&self, req: &ConfigureEndpointsReq) -> XhciResult<()> {
        let json = serde_json::to_vec(req)?;
        let mut file = OpenOptions::new()
            .read(false)
            .write(true)
            .open(self.path("configure"))?;
        if file.write(&json)? != json.len() {
            return Err(XhciClientHandleError::InvalidResponse(
                "configure_endpoints didn't read as many bytes as were requested",
            ));
        }
        Ok(())
    }

    fn request(
        &self,
        req_type: PortReqTy,
        req_recipient: PortReqRecipient,
        request: u8,
        value: u16,
        index: u16,
        data: DeviceReqData<'_>,
    ) -> XhciResult<usize> {
        let length = u16::try_from(data.len())
            .or(Err(XhciClientHandleError::TransferBufTooLarge(data.len())))?;

        let req = PortReq {
            direction: data.direction(),
            req_type,
            req_recipient,
            request,
            value,
            index,
            length,
            transfers_data: !matches!(data, DeviceReqData::NoData),
        };
        let json = serde_json::to_vec(&req)?;

        let mut file = File::open(self.path("request"))?;
        if file.write(&json)? != json.len() {
            return Err(XhciClientHandleError::InvalidResponse(
                "device_request didn't take the whole request",
            ));
        }

        match data {
            DeviceReqData::In(buf) => Ok(file.read(buf)?),
            DeviceReqData::Out(buf) => {
                let written = file.write(buf)?;
                if written != buf.len() {
                    return Err(XhciClientHandleError::InvalidResponse(
                        "device_request didn't transfer all bytes",
                    ));
                }
                Ok(written)
            }
            DeviceReqData::NoData => Ok(0),
        }
    }

    /// xhcid numbers endpoints from 1 across the whole configuration, in descriptor order.
    fn endpoint_num(&self, desc: &EndpDesc) -> Option<u8> {
        self.configuration
            .interfaces
            .iter()
            .flat_map(|iface| iface.endpoints.iter())
            .position(|endp| endp.address == desc.address)
            .and_then(|index| u8::try_from(index + 1).ok())
    }
}

impl UsbDevice for XhciDevice {
    type Endpoint = XhciEndpHandle;

    fn interfaces(&self) -> Result<Vec<IfDesc>, HostError> {
        Ok(self.configuration.interfaces.clone())
    }

    fn kernel_driver_capability(&self) -> bool {
        false
    }
    fn is_kernel_driver_active(&self, _interface: u8) -> Result<bool, HostError> {
        Err(HostError::Unsupported)
    }
    fn detach_kernel_driver(&self, _interface: u8) -> Result<(), HostError> {
        Err(HostError::Unsupported)
    }
    fn attach_kernel_driver(&self, _interface: u8) -> Result<(), HostError> {
        Err(HostError::Unsupported)
    }

    fn claim_interface(&self, interface: u8) -> Result<(), HostError> {
        let iface = self
            .configuration
            .interfaces
            .iter()
            .find(|iface| iface.number == interface)
            .ok_or(HostError::NoDevice)?;
        self.configure_endpoints(&ConfigureEndpointsReq {
            config_desc: self.configuration.configuration_value,
            interface_desc: Some(interface),
            alternate_setting: Some(iface.alternate_setting),
            hub_ports: None,
        })?;
        Ok(())
    }

    fn release_interface(&self, _interface: u8) -> Result<(), HostError> {
        // xhcid drops the endpoints along with the port handle.
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
        Ok(self.request(req_type, req_recipient, request, value, index, data)?)
    }

    fn open_endpoint(
        &self,
        desc: &EndpDesc,
        timeout: Option<Duration>,
    ) -> Result<Self::Endpoint, HostError> {
        let num = self.endpoint_num(desc).ok_or(HostError::NoDevice)?;
        // xhcid transfers block until the controller completes them, so an idle IN endpoint
        // outlives teardown's wait and its thread is left behind.
        if let Some(timeout) = timeout {
            log::debug!("endpoint {}: xhcid transfers don't time out ({:?} ignored)", num, timeout);
        }
        Ok(XhciEndpHandle {
            ctl: File::open(self.path(&format!("endpoints/{}/ctl", num)))?,
            data: File::open(self.path(&format!("endpoints/{}/data", num)))?,
        })
    }
}

#[derive(Debug)]
pub struct XhciEndpHandle {
    data: File,
    ctl: File,
}

impl XhciEndpHandle {
    fn ctl_req(&mut self, ctl_req: &XhciEndpCtlReq) -> XhciResult<()> {
        let ctl_buffer = serde_json::to_vec(ctl_req)?;
        if self.ctl.write(&ctl_buffer)? != ctl_buffer.len() {
            return Err(XhciClientHandleError::InvalidResponse(
                "xhcid didn't process all of the ctl bytes",
            ));
        }
        Ok(())
    }

    fn ctl_res(&mut self) -> XhciResult<XhciEndpCtlRes> {
        // a response must never exceed 256 bytes
        let mut ctl_buffer = [0u8; 256];
        let ctl_bytes_read = self.ctl.read(&mut ctl_buffer)?;
        Ok(serde_json::from_slice(&ctl_buffer[..ctl_bytes_read])?)
    }

    fn transfer<F: FnOnce(&mut File) -> io::Result<usize>>(
        &mut self,
        direction: XhciEndpCtlDirection,
        count: usize,
        f: F,
    ) -> Result<usize, HostError> {
        let count = u32::try_from(count).or(Err(XhciClientHandleError::TransferBufTooLarge(count)))?;
        self.ctl_req(&XhciEndpCtlReq::Transfer { direction, count })?;
        let moved = f(&mut self.data)?;

        match self.ctl_res()? {
            XhciEndpCtlRes::TransferResult(PortTransferStatus {
                kind: PortTransferStatusKind::Stalled,
                ..
            }) => Err(HostError::Stall),
            XhciEndpCtlRes::TransferResult(PortTransferStatus {
                kind: PortTransferStatusKind::Success | PortTransferStatusKind::ShortPacket,
                ..
            }) => Ok(moved),
            XhciEndpCtlRes::TransferResult(status) => Err(HostError::Backend(
                format!("transfer ended with {:?}", status.kind).into(),
            )),
            XhciEndpCtlRes::Pending | XhciEndpCtlRes::Idle => {
                Err(XhciClientHandleError::InvalidResponse("expected transfer result").into())
            }
        }
    }
}

impl UsbEndpoint for XhciEndpHandle {
    fn transfer_read(&mut self, buf: &mut [u8]) -> Result<usize, HostError> {
        let len = buf.len();
        self.transfer(XhciEndpCtlDirection::In, len, |data| data.read(buf))
    }

    fn transfer_write(&mut self, buf: &[u8]) -> Result<usize, HostError> {
        self.transfer(XhciEndpCtlDirection::Out, buf.len(), |data| data.write(buf))
    }
}
