use std::io;

use thiserror::Error;

use crate::cdc::CdcRequest;

/// Failure reported by the USB host collaborator for a single primitive.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("transfer timed out")]
    Timeout,

    #[error("endpoint stalled")]
    Stall,

    #[error("device is gone")]
    NoDevice,

    #[error("operation not supported by this host")]
    Unsupported,

    #[error("short transfer ({actual} of {expected} bytes)")]
    ShortTransfer { expected: usize, actual: usize },

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("host driver error: {0}")]
    Backend(Box<dyn std::error::Error + Send + Sync>),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("zero-length descriptor at offset {offset}")]
    InvalidDescriptor { offset: usize },

    #[error("interface {0} is not a CDC-ACM control interface")]
    CdcInterfaceInvalid(u8),

    #[error("interface {0} is not a CDC data interface")]
    DataInterfaceInvalid(u8),

    #[error("no CDC-ACM interface pair found on device")]
    NoCdcAcmInterfaceFound,

    #[error("failed to enumerate interfaces: {0}")]
    Host(#[source] HostError),

    #[error("failed to claim interface {interface}: {source}")]
    ClaimFailed {
        interface: u8,
        #[source]
        source: HostError,
    },

    #[error("{request:?} request failed: {source}")]
    ControlRequestFailed {
        request: CdcRequest,
        #[source]
        source: HostError,
    },

    #[error("bulk transfer failed: {0}")]
    TransferError(#[source] HostError),

    #[error("failed to release interface {interface}: {source}")]
    ReleaseFailed {
        interface: u8,
        #[source]
        source: HostError,
    },

    #[error("failed to reattach kernel driver to interface {interface}: {source}")]
    ReattachFailed {
        interface: u8,
        #[source]
        source: HostError,
    },

    #[error("invalid line coding: {0}")]
    InvalidLineCoding(&'static str),

    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error("session is closed")]
    SessionClosed,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
