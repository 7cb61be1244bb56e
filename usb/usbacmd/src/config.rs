use std::time::Duration;

use serde::Deserialize;

use crate::cdc::LineCoding;
use crate::error::Result;

/// Per-session settings, usually read from a TOML file:
///
/// ```toml
/// name = "modem"
/// transfer_timeout_ms = 500
///
/// [line_coding]
/// baud_rate = 115200
/// parity = "even"
/// ```
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Prefix of every log record of the session.
    pub name: Option<String>,
    /// Coding sent with SET_LINE_CODING while negotiating.
    pub line_coding: LineCoding,
    /// Detach a kernel driver bound to either interface, if the host supports that at all.
    pub detach_kernel_driver: bool,
    /// Per-transfer timeout handed to the host when opening endpoints. `None` waits forever.
    pub transfer_timeout_ms: Option<u64>,
    /// Size of each bulk IN read; defaults to the endpoint's max packet size.
    pub read_buffer_len: Option<usize>,
    /// Undelivered data chunks after which bulk IN polling pauses.
    pub read_high_water: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: None,
            line_coding: LineCoding::default(),
            detach_kernel_driver: true,
            transfer_timeout_ms: Some(1000),
            read_buffer_len: None,
            read_high_water: 16,
        }
    }
}

impl SessionConfig {
    pub fn with_baud_rate(baud_rate: u32) -> Self {
        Self {
            line_coding: LineCoding::with_baud_rate(baud_rate),
            ..Self::default()
        }
    }

    pub fn from_toml(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn transfer_timeout(&self) -> Option<Duration> {
        self.transfer_timeout_ms.map(Duration::from_millis)
    }

    /// How long teardown waits for in-flight transfers to return before releasing the
    /// interfaces anyway. Two transfer timeouts, or one second without a timeout.
    pub fn stop_wait(&self) -> Duration {
        self.transfer_timeout()
            .map_or(Duration::from_secs(1), |timeout| timeout * 2)
            .max(Duration::from_millis(100))
    }
}
