//! Raw USB descriptor handling.
//!
//! Descriptors are concatenated on the wire, each starting with its own length byte:
//!
//! ```text
//! 5 X X X X 4 X X X 9 X X X X X X X X
//! ```
//!
//! splits into `[5 X X X X]`, `[4 X X X]` and `[9 X X X X X X X X]`.

use std::mem;

use plain::Plain;
use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::usb::{EndpDesc, IfDesc};

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DescriptorKind {
    Device = 1,
    Configuration = 2,
    String = 3,
    Interface = 4,
    Endpoint = 5,
    InterfaceAssociation = 11,
    ClassSpecificInterface = 0x24,
    ClassSpecificEndpoint = 0x25,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct ConfigDescriptor {
    pub length: u8,
    pub kind: u8,
    pub total_length: u16,
    pub interfaces: u8,
    pub configuration_value: u8,
    pub configuration_str: u8,
    pub attributes: u8,
    pub max_power: u8,
}

unsafe impl Plain for ConfigDescriptor {}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct InterfaceDescriptor {
    pub length: u8,
    pub kind: u8,
    pub number: u8,
    pub alternate_setting: u8,
    pub endpoints: u8,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub interface_str: u8,
}

unsafe impl Plain for InterfaceDescriptor {}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct EndpointDescriptor {
    pub length: u8,
    pub kind: u8,
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

unsafe impl Plain for EndpointDescriptor {}

/// Iterator over the descriptors of a concatenated blob.
///
/// A block whose declared length runs past the end of the blob is yielded as-is, truncated to
/// what is left. A zero length byte cannot be stepped over and ends the iteration with an error.
pub struct Descriptors<'a> {
    bytes: &'a [u8],
    pointer: usize,
}

impl<'a> Descriptors<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pointer: 0 }
    }
}

impl<'a> Iterator for Descriptors<'a> {
    type Item = Result<&'a [u8]>;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.pointer;
        let len = usize::from(*self.bytes.get(offset)?);
        if len == 0 {
            self.pointer = self.bytes.len();
            return Some(Err(Error::InvalidDescriptor { offset }));
        }
        let end = usize::min(offset + len, self.bytes.len());
        self.pointer = end;
        Some(Ok(&self.bytes[offset..end]))
    }
}

/// Splits a blob of concatenated descriptors into the individual descriptors, in order.
///
/// A missing blob yields no descriptors.
pub fn split_descriptors(bytes: Option<&[u8]>) -> Result<Vec<&[u8]>> {
    match bytes {
        Some(bytes) => Descriptors::new(bytes).collect(),
        None => Ok(Vec::new()),
    }
}

pub const CDC_UNION_SUBTYPE: u8 = 0x06;

/// CDC Union functional descriptor, linking a control interface to its data interface.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct UnionDescriptor {
    pub master_interface: u8,
    pub slave_interface: u8,
}

impl UnionDescriptor {
    pub fn parse(desc: &[u8]) -> Option<Self> {
        match desc {
            [_, kind, subtype, master, slave, ..]
                if *kind == DescriptorKind::ClassSpecificInterface as u8
                    && *subtype == CDC_UNION_SUBTYPE =>
            {
                Some(Self {
                    master_interface: *master,
                    slave_interface: *slave,
                })
            }
            _ => None,
        }
    }
}

/// A parsed configuration descriptor set.
#[derive(Clone, Debug)]
pub struct Configuration {
    pub configuration_value: u8,
    pub interfaces: Vec<IfDesc>,
}

/// Parses a full configuration descriptor set (as returned by GET_DESCRIPTOR(Configuration)).
///
/// Only alternate setting 0 of each interface is kept. Descriptors that are neither interface
/// nor endpoint descriptors are appended to the `extra` bytes of the interface they follow.
pub fn parse_configuration(raw: &[u8]) -> Result<Configuration> {
    let mut configuration_value = 0;
    let mut interfaces: Vec<IfDesc> = Vec::new();
    // Whether descriptors currently belong to an interface we keep.
    let mut in_kept_interface = false;

    for desc in Descriptors::new(raw) {
        let desc = desc?;
        let kind = desc.get(1).copied().unwrap_or(0);

        if kind == DescriptorKind::Configuration as u8 {
            if let Some(config) = read_plain::<ConfigDescriptor>(desc) {
                configuration_value = config.configuration_value;
            }
        } else if kind == DescriptorKind::Interface as u8 {
            in_kept_interface = false;
            let Some(iface) = read_plain::<InterfaceDescriptor>(desc) else {
                log::warn!("truncated interface descriptor ({} bytes)", desc.len());
                continue;
            };
            if iface.alternate_setting != 0 {
                continue;
            }
            in_kept_interface = true;
            interfaces.push(IfDesc {
                number: iface.number,
                alternate_setting: iface.alternate_setting,
                class: iface.class,
                sub_class: iface.sub_class,
                protocol: iface.protocol,
                endpoints: SmallVec::new(),
                extra: Vec::new(),
            });
        } else if !in_kept_interface {
            continue;
        } else if kind == DescriptorKind::Endpoint as u8 {
            let Some(endp) = read_plain::<EndpointDescriptor>(desc) else {
                log::warn!("truncated endpoint descriptor ({} bytes)", desc.len());
                continue;
            };
            if let Some(iface) = interfaces.last_mut() {
                iface.endpoints.push(EndpDesc {
                    address: endp.address,
                    attributes: endp.attributes,
                    max_packet_size: u16::from_le(endp.max_packet_size),
                    interval: endp.interval,
                });
            }
        } else if let Some(iface) = interfaces.last_mut() {
            iface.extra.extend_from_slice(desc);
        }
    }

    Ok(Configuration {
        configuration_value,
        interfaces,
    })
}

fn read_plain<T: Plain + Copy>(desc: &[u8]) -> Option<T> {
    let bytes = desc.get(..mem::size_of::<T>())?;
    plain::from_bytes::<T>(bytes).ok().copied()
}
