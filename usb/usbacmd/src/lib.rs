//! Host side of the USB CDC-ACM class: find the control/data interface pair of a serial
//! function, claim it, negotiate the line and move bytes.

pub mod cdc;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod host;
pub mod interface;
pub mod session;
pub mod usb;
pub mod xhci;

pub use cdc::{ControlLineState, LineCoding, Notification, Parity, StopBits};
pub use config::SessionConfig;
pub use descriptor::{parse_configuration, split_descriptors};
pub use error::{Error, HostError, Result};
pub use host::{UsbDevice, UsbEndpoint};
pub use interface::{find_pair, is_control_interface, is_data_interface};
pub use session::{CdcAcm, SessionEvent, SessionState, WriteId};
