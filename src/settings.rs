use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Result, VarsError};

const DEFAULT_IP_ADDRESS: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 13005;
const DEFAULT_BUFFER_SIZE: usize = 35536;
const DEFAULT_TIMEOUT_MS: u64 = 1000;
const DEFAULT_CHECK_TIME_MS: u64 = 100;
const DEFAULT_RECONNECT_COUNT: u32 = 3;

/// Connection settings shared by [`VarsClient`] and [`VarsServer`].
///
/// The same struct describes the address a client connects to and the address a server
/// listens on. All durations are kept in milliseconds.
///
/// [`VarsClient`]: ./struct.VarsClient.html
/// [`VarsServer`]: ./struct.VarsServer.html
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// IP address (or host name, client side only) of the server
    pub ip_address: String,
    /// TCP port of the server
    pub port: u16,
    /// number of bytes sent or received per chunk
    pub buffer_size: usize,
    /// how long a single connect attempt may take, and the back-off used by reader loops
    /// when no data arrived
    pub timeout_ms: u64,
    /// interval of the liveness checks
    pub check_time_ms: u64,
    /// number of additional connect attempts after the first one fails
    pub reconnect_count: u32,
}

impl Settings {
    /// creates settings for the given address, with the default buffer size, timeouts and
    /// reconnect count
    pub fn new(ip_address: impl Into<String>, port: u16) -> Self {
        Settings {
            ip_address: ip_address.into(),
            port,
            ..Settings::default()
        }
    }

    /// the connect timeout as a [`Duration`]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// the liveness check interval as a [`Duration`]
    pub fn check_time(&self) -> Duration {
        Duration::from_millis(self.check_time_ms)
    }

    /// resolves `ip_address:port` into the first matching [`SocketAddr`]
    ///
    /// # Errors
    /// returns [`VarsError::Parsing`] if the address does not resolve
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        (self.ip_address.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| {
                VarsError::Parsing(format!(
                    "could not resolve {}:{} ({})",
                    &self.ip_address, self.port, e
                ))
            })?
            .next()
            .ok_or_else(|| {
                VarsError::Parsing(format!(
                    "{}:{} did not resolve to any address",
                    &self.ip_address, self.port
                ))
            })
    }

    /// checks the values that would make the reader and sender loops misbehave
    pub(crate) fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(VarsError::InvalidArgument(
                "buffer_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            ip_address: DEFAULT_IP_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            check_time_ms: DEFAULT_CHECK_TIME_MS,
            reconnect_count: DEFAULT_RECONNECT_COUNT,
        }
    }
}
