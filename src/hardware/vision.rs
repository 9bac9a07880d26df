//! TCP connection to the vision system.

use crate::error::AppResult;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, instrument};

/// Where the vision system listens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisionEndpoint {
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Upper bound on connection establishment.
    pub connect_timeout: Duration,
}

impl VisionEndpoint {
    /// Endpoint with the default 5 s connect timeout.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// `host:port`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Connect to the vision system.
///
/// Fails with an I/O error of kind `TimedOut` if the connection is not
/// established within the endpoint's connect timeout.
#[instrument(skip_all, fields(address = %endpoint.address()))]
pub async fn connect_vision(endpoint: &VisionEndpoint) -> AppResult<TcpStream> {
    let address = endpoint.address();
    let stream = tokio::time::timeout(endpoint.connect_timeout, TcpStream::connect(&address))
        .await
        .map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("Timed out connecting to vision system at {address}"),
            )
        })??;
    stream.set_nodelay(true)?;
    debug!("Vision socket connected");
    Ok(stream)
}
