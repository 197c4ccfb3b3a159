//! Stream endpoint type

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use super::error::BindError;

/// The single remote endpoint a stream bind targets.
///
/// Endpoints compare by value (address and port); a `send` whose endpoint
/// differs from the bound one is rejected with
/// [`BindError::EndpointMismatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamEndpoint(SocketAddr);

impl StreamEndpoint {
    /// Socket address of the endpoint.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for StreamEndpoint {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl FromStr for StreamEndpoint {
    type Err = BindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<SocketAddr>()
            .map(Self)
            .map_err(|_| BindError::InvalidEndpoint(s.to_string()))
    }
}

impl fmt::Display for StreamEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
