//! Device-side data model shared by the host collaborator and the CDC-ACM core.
//!
//! These mirror what a USB host driver reports about one configuration: interfaces with their
//! endpoints, plus the raw class-specific bytes that follow each interface descriptor.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub const ENDP_ATTR_TY_MASK: u8 = 0x03;
pub const ENDP_ADDR_DIR_IN: u8 = 0x80;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EndpointTy {
    Ctrl,
    Isoch,
    Bulk,
    Interrupt,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EndpDirection {
    Out,
    In,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EndpDesc {
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpDesc {
    pub fn ty(&self) -> EndpointTy {
        match self.attributes & ENDP_ATTR_TY_MASK {
            0 => EndpointTy::Ctrl,
            1 => EndpointTy::Isoch,
            2 => EndpointTy::Bulk,
            _ => EndpointTy::Interrupt,
        }
    }
    pub fn is_interrupt(&self) -> bool {
        self.ty() == EndpointTy::Interrupt
    }
    pub fn is_bulk(&self) -> bool {
        self.ty() == EndpointTy::Bulk
    }
    pub fn direction(&self) -> EndpDirection {
        if self.address & ENDP_ADDR_DIR_IN != 0 {
            EndpDirection::In
        } else {
            EndpDirection::Out
        }
    }
}

/// One interface (alternate setting) as reported by the host.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IfDesc {
    pub number: u8,
    pub alternate_setting: u8,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub endpoints: SmallVec<[EndpDesc; 4]>,
    /// Every descriptor found between this interface descriptor and the next one, endpoint
    /// descriptors excluded, concatenated as they appeared on the wire.
    pub extra: Vec<u8>,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum PortReqDirection {
    HostToDevice,
    DeviceToHost,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum PortReqTy {
    Standard,
    Class,
    Vendor,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum PortReqRecipient {
    Device,
    Interface,
    Endpoint,
    Other,
}

pub const USB_SETUP_DIR_BIT: u8 = 1 << 7;
pub const USB_SETUP_REQ_TY_SHIFT: u8 = 5;

/// Builds the bmRequestType byte of a setup packet.
pub fn request_type(direction: PortReqDirection, ty: PortReqTy, recipient: PortReqRecipient) -> u8 {
    let dir = match direction {
        PortReqDirection::HostToDevice => 0,
        PortReqDirection::DeviceToHost => USB_SETUP_DIR_BIT,
    };
    let ty = match ty {
        PortReqTy::Standard => 0,
        PortReqTy::Class => 1,
        PortReqTy::Vendor => 2,
    } << USB_SETUP_REQ_TY_SHIFT;
    let recipient = match recipient {
        PortReqRecipient::Device => 0,
        PortReqRecipient::Interface => 1,
        PortReqRecipient::Endpoint => 2,
        PortReqRecipient::Other => 3,
    };
    dir | ty | recipient
}

/// Data stage of a control transfer.
pub enum DeviceReqData<'a> {
    In(&'a mut [u8]),
    Out(&'a [u8]),
    NoData,
}

impl DeviceReqData<'_> {
    pub fn len(&self) -> usize {
        match self {
            Self::In(buf) => buf.len(),
            Self::Out(buf) => buf.len(),
            Self::NoData => 0,
        }
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn direction(&self) -> PortReqDirection {
        match self {
            DeviceReqData::In(_) => PortReqDirection::DeviceToHost,
            DeviceReqData::Out(_) | DeviceReqData::NoData => PortReqDirection::HostToDevice,
        }
    }
}
