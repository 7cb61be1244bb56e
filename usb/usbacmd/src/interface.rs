//! Recognising the control and data interfaces of a CDC-ACM function.

use crate::cdc::{CDC_SUBCLASS_ACM, USB_CLASS_CDC, USB_CLASS_CDC_DATA};
use crate::descriptor::{split_descriptors, UnionDescriptor};
use crate::error::{Error, Result};
use crate::usb::{EndpDirection, IfDesc};

/// Checks whether `iface` is an ACM management interface and returns the number of the data
/// interface its Union descriptor points to.
///
/// The interface must be CDC/ACM, expose a single interrupt IN endpoint, and carry exactly one
/// Union descriptor whose master is the interface itself. Anything else is `Ok(None)`; only a
/// malformed descriptor blob is an error.
pub fn is_control_interface(iface: &IfDesc) -> Result<Option<u8>> {
    if iface.class != USB_CLASS_CDC || iface.sub_class != CDC_SUBCLASS_ACM {
        return Ok(None);
    }

    match iface.endpoints.as_slice() {
        [endp] if endp.is_interrupt() && endp.direction() == EndpDirection::In => (),
        _ => return Ok(None),
    }

    let mut unions = split_descriptors(Some(iface.extra.as_slice()))?
        .into_iter()
        .filter_map(UnionDescriptor::parse);

    match (unions.next(), unions.next()) {
        (Some(union), None) if union.master_interface == iface.number => {
            Ok(Some(union.slave_interface))
        }
        _ => Ok(None),
    }
}

/// Checks whether `iface` is a CDC data interface with one bulk IN and one bulk OUT endpoint.
pub fn is_data_interface(iface: &IfDesc) -> bool {
    if iface.class != USB_CLASS_CDC_DATA {
        return false;
    }
    match iface.endpoints.as_slice() {
        [a, b] => a.is_bulk() && b.is_bulk() && a.direction() != b.direction(),
        _ => false,
    }
}

/// Returns the first control interface, in the given order, whose partner is a valid data
/// interface, together with that partner.
pub fn find_pair(interfaces: &[IfDesc]) -> Result<(&IfDesc, &IfDesc)> {
    for iface in interfaces {
        let Some(data_num) = is_control_interface(iface)? else {
            continue;
        };
        match interfaces.iter().find(|i| i.number == data_num) {
            Some(data) if is_data_interface(data) => return Ok((iface, data)),
            _ => log::debug!(
                "interface {} is an ACM control interface but data interface {} is not usable",
                iface.number,
                data_num
            ),
        }
    }
    Err(Error::NoCdcAcmInterfaceFound)
}

/// Validates a caller-chosen control interface and looks up its data interface.
pub fn pair_for<'a>(interfaces: &'a [IfDesc], control: u8) -> Result<(&'a IfDesc, &'a IfDesc)> {
    let iface = interfaces
        .iter()
        .find(|i| i.number == control)
        .ok_or(Error::CdcInterfaceInvalid(control))?;
    let data_num = is_control_interface(iface)?.ok_or(Error::CdcInterfaceInvalid(control))?;
    let data = interfaces
        .iter()
        .find(|i| i.number == data_num)
        .filter(|i| is_data_interface(i))
        .ok_or(Error::DataInterfaceInvalid(data_num))?;
    Ok((iface, data))
}
