//! The USB host primitives a CDC-ACM session is driven through.
//!
//! Implementations own the actual host controller access. All calls block until the
//! operation completes; the session supplies its own worker threads on top.

use std::time::Duration;

use crate::error::HostError;
use crate::usb::{DeviceReqData, EndpDesc, IfDesc, PortReqRecipient, PortReqTy};

pub trait UsbDevice: Send + Sync + 'static {
    type Endpoint: UsbEndpoint;

    /// Interfaces of the active configuration, in descriptor order.
    fn interfaces(&self) -> Result<Vec<IfDesc>, HostError>;

    /// Whether the host OS can bind its own driver to an interface. When false, the kernel
    /// driver calls below are never made.
    fn kernel_driver_capability(&self) -> bool;

    fn is_kernel_driver_active(&self, interface: u8) -> Result<bool, HostError>;
    fn detach_kernel_driver(&self, interface: u8) -> Result<(), HostError>;
    fn attach_kernel_driver(&self, interface: u8) -> Result<(), HostError>;

    fn claim_interface(&self, interface: u8) -> Result<(), HostError>;
    fn release_interface(&self, interface: u8) -> Result<(), HostError>;

    /// Performs a control transfer on the default pipe and returns the number of bytes moved
    /// in the data stage.
    fn device_request(
        &self,
        req_type: PortReqTy,
        req_recipient: PortReqRecipient,
        request: u8,
        value: u16,
        index: u16,
        data: DeviceReqData<'_>,
    ) -> Result<usize, HostError>;

    /// Opens an endpoint of a claimed interface. `timeout` bounds every transfer made through
    /// the returned handle: a read with nothing to return must give up with
    /// [`HostError::Timeout`] once it expires. Teardown waits only about that long for running
    /// transfers before it releases the interfaces and leaves their threads behind.
    fn open_endpoint(
        &self,
        desc: &EndpDesc,
        timeout: Option<Duration>,
    ) -> Result<Self::Endpoint, HostError>;
}

pub trait UsbEndpoint: Send + 'static {
    fn transfer_read(&mut self, buf: &mut [u8]) -> Result<usize, HostError>;
    fn transfer_write(&mut self, buf: &[u8]) -> Result<usize, HostError>;
}
