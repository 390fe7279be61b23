//! Endpoint addressing
//!
//! Endpoints are written `tcp://<host>:<port>`.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

const TCP_PREFIX: &str = "tcp://";

/// Network endpoint of a registry or data-plane socket
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Host name or address
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl Endpoint {
    /// Create an endpoint
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `tcp://host:port` (the `tcp://` prefix is optional)
    pub fn parse(value: &str) -> Result<Self> {
        let rest = value.strip_prefix(TCP_PREFIX).unwrap_or(value);

        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidEndpoint(value.to_string()))?;

        if host.is_empty() {
            return Err(Error::InvalidEndpoint(value.to_string()));
        }

        let port = port
            .parse::<u16>()
            .map_err(|_| Error::InvalidEndpoint(value.to_string()))?;

        Ok(Self::new(host, port))
    }

    /// Same host, another port
    pub fn with_port(&self, port: u16) -> Self {
        Self::new(self.host.clone(), port)
    }

    /// `host:port` form accepted by `TcpStream::connect`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}:{}", TCP_PREFIX, self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Endpoint::parse(s)
    }
}
