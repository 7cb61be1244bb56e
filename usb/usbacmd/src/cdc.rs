//! CDC-ACM class codes, control requests and notifications (CDC 1.2, PSTN 1.2).

use bitflags::bitflags;
use serde::Deserialize;

use crate::error::{Error, Result};

pub const USB_CLASS_CDC: u8 = 0x02;
pub const CDC_SUBCLASS_ACM: u8 = 0x02;
pub const USB_CLASS_CDC_DATA: u8 = 0x0A;

/// Class requests issued on the control interface.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CdcRequest {
    SetLineCoding = 0x20,
    GetLineCoding = 0x21,
    SetControlLineState = 0x22,
    SendBreak = 0x23,
}

pub const LINE_CODING_LEN: usize = 7;

#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopBits {
    #[default]
    One = 0,
    OnePointFive = 1,
    Two = 2,
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    #[default]
    None = 0,
    Odd = 1,
    Even = 2,
    Mark = 3,
    Space = 4,
}

/// Serial line parameters, as carried by SET_LINE_CODING and GET_LINE_CODING.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(default)]
pub struct LineCoding {
    pub baud_rate: u32,
    pub stop_bits: StopBits,
    pub parity: Parity,
    pub data_bits: u8,
}

impl Default for LineCoding {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            stop_bits: StopBits::One,
            parity: Parity::None,
            data_bits: 8,
        }
    }
}

impl LineCoding {
    pub fn with_baud_rate(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            ..Self::default()
        }
    }

    /// `[dwDTERate:u32-LE][bCharFormat][bParityType][bDataBits]`
    pub fn to_bytes(&self) -> [u8; LINE_CODING_LEN] {
        let mut bytes = [0u8; LINE_CODING_LEN];
        bytes[..4].copy_from_slice(&self.baud_rate.to_le_bytes());
        bytes[4] = self.stop_bits as u8;
        bytes[5] = self.parity as u8;
        bytes[6] = self.data_bits;
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: &[u8; LINE_CODING_LEN] = bytes
            .get(..LINE_CODING_LEN)
            .and_then(|b| b.try_into().ok())
            .ok_or(Error::InvalidLineCoding("short buffer"))?;
        let stop_bits = match bytes[4] {
            0 => StopBits::One,
            1 => StopBits::OnePointFive,
            2 => StopBits::Two,
            _ => return Err(Error::InvalidLineCoding("reserved stop bits")),
        };
        let parity = match bytes[5] {
            0 => Parity::None,
            1 => Parity::Odd,
            2 => Parity::Even,
            3 => Parity::Mark,
            4 => Parity::Space,
            _ => return Err(Error::InvalidLineCoding("reserved parity")),
        };
        Ok(Self {
            baud_rate: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            stop_bits,
            parity,
            data_bits: bytes[6],
        })
    }
}

bitflags! {
    /// wValue of SET_CONTROL_LINE_STATE.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct ControlLineState: u16 {
        /// DTR, "DTE is present".
        const DTE_PRESENT = 1 << 0;
        /// RTS, "activate carrier".
        const ACTIVATE_CARRIER = 1 << 1;
    }
}

bitflags! {
    /// UART state bitmap of the SERIAL_STATE notification.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct SerialState: u16 {
        const RX_CARRIER = 1 << 0;
        const TX_CARRIER = 1 << 1;
        const BREAK = 1 << 2;
        const RING_SIGNAL = 1 << 3;
        const FRAMING = 1 << 4;
        const PARITY = 1 << 5;
        const OVERRUN = 1 << 6;
    }
}

pub const NOTIFICATION_HEADER_LEN: usize = 8;

const NETWORK_CONNECTION: u8 = 0x00;
const RESPONSE_AVAILABLE: u8 = 0x01;
const SERIAL_STATE: u8 = 0x20;

/// A notification received on the control interface's interrupt endpoint.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Notification {
    NetworkConnection { interface: u16, connected: bool },
    ResponseAvailable { interface: u16 },
    SerialState { interface: u16, state: SerialState },
    Other { code: u8, value: u16, interface: u16, data: Vec<u8> },
}

impl Notification {
    /// Decodes one notification. Returns `None` if the buffer is too short for what its header
    /// announces.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < NOTIFICATION_HEADER_LEN {
            return None;
        }
        let code = bytes[1];
        let value = u16::from_le_bytes([bytes[2], bytes[3]]);
        let interface = u16::from_le_bytes([bytes[4], bytes[5]]);
        let length = usize::from(u16::from_le_bytes([bytes[6], bytes[7]]));
        let data = bytes.get(NOTIFICATION_HEADER_LEN..NOTIFICATION_HEADER_LEN + length)?;

        Some(match code {
            NETWORK_CONNECTION => Self::NetworkConnection {
                interface,
                connected: value != 0,
            },
            RESPONSE_AVAILABLE => Self::ResponseAvailable { interface },
            SERIAL_STATE if data.len() >= 2 => Self::SerialState {
                interface,
                state: SerialState::from_bits_truncate(u16::from_le_bytes([data[0], data[1]])),
            },
            _ => Self::Other {
                code,
                value,
                interface,
                data: data.to_vec(),
            },
        })
    }
}
