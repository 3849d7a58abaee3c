//! Transport endpoints — `transport://address:port`.
//!
//! An endpoint names a reachable socket. Two endpoints are equal iff
//! transport, address and port all match; no DNS resolution happens here.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

/// Lowest port of the IANA dynamic range, probed when binding port 0.
pub const MIN_EPHEMERAL_PORT: u16 = 49152;

/// Highest port of the IANA dynamic range.
pub const MAX_EPHEMERAL_PORT: u16 = 65535;

/// Address meaning "every local interface".
pub const WILDCARD_ADDRESS: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Ipc,
    Inproc,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Ipc => "ipc",
            Transport::Inproc => "inproc",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transport {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Transport::Tcp),
            "ipc" => Ok(Transport::Ipc),
            "inproc" => Ok(Transport::Inproc),
            other => Err(EndpointError::UnknownTransport(other.to_string())),
        }
    }
}

/// A transport + address + port triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub transport: Transport,
    /// IP literal or `*`. Stored without IPv6 brackets.
    pub address: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(transport: Transport, address: impl Into<String>, port: u16) -> Self {
        Self {
            transport,
            address: address.into(),
            port,
        }
    }

    pub fn tcp(address: impl Into<String>, port: u16) -> Self {
        Self::new(Transport::Tcp, address, port)
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self::tcp(addr.ip().to_string(), addr.port())
    }

    /// True for `*` and for unspecified IP addresses (`0.0.0.0`, `::`).
    pub fn is_wildcard(&self) -> bool {
        if self.address == WILDCARD_ADDRESS {
            return true;
        }
        self.address
            .parse::<IpAddr>()
            .map(|ip| ip.is_unspecified())
            .unwrap_or(false)
    }

    pub fn with_address(&self, address: impl Into<String>) -> Self {
        Self::new(self.transport, address, self.port)
    }

    pub fn with_port(&self, port: u16) -> Self {
        Self::new(self.transport, self.address.clone(), port)
    }

    /// The socket address to bind or connect to. `*` maps to `0.0.0.0`.
    pub fn socket_addr(&self) -> Result<SocketAddr, EndpointError> {
        if self.address == WILDCARD_ADDRESS {
            return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.port));
        }
        let ip: IpAddr = self
            .address
            .parse()
            .map_err(|_| EndpointError::InvalidAddress(self.address.clone()))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.address.contains(':') {
            write!(f, "{}://[{}]:{}", self.transport, self.address, self.port)
        } else {
            write!(f, "{}://{}:{}", self.transport, self.address, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| EndpointError::MissingScheme(s.to_string()))?;
        let transport: Transport = scheme.parse()?;

        let (address, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| EndpointError::MissingPort(s.to_string()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| EndpointError::InvalidPort(s.to_string()))?;

        let address = address.trim_start_matches('[').trim_end_matches(']');
        if address.is_empty() {
            return Err(EndpointError::InvalidAddress(s.to_string()));
        }

        Ok(Endpoint::new(transport, address, port))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    #[error("endpoint has no transport scheme: {0}")]
    MissingScheme(String),

    #[error("unknown transport: {0}")]
    UnknownTransport(String),

    #[error("endpoint has no port: {0}")]
    MissingPort(String),

    #[error("invalid port in endpoint: {0}")]
    InvalidPort(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),
}
