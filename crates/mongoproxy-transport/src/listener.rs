use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use crate::error::Result;
use crate::stream::ProxyStream;
use crate::tcp::TcpTransport;

const WAKE_TIMEOUT: Duration = Duration::from_millis(500);

/// A bound listener on any supported transport.
pub enum Listener {
    Tcp(TcpTransport),
    #[cfg(unix)]
    Unix(crate::uds::UnixDomainSocket),
}

impl Listener {
    /// Accept the next connection (blocking).
    pub fn accept(&self) -> Result<ProxyStream> {
        match self {
            Listener::Tcp(tcp) => tcp.accept(),
            #[cfg(unix)]
            Listener::Unix(uds) => uds.accept(),
        }
    }

    /// Unblock a pending [`accept`](Self::accept) by dialing this listener.
    ///
    /// Used at shutdown: the acceptor re-checks its stop flag after every
    /// accepted connection.
    pub fn wake(&self) -> Result<()> {
        let stream = match self {
            Listener::Tcp(tcp) => {
                let addr = dialable(tcp.local_addr());
                TcpTransport::connect(&addr.to_string(), Some(WAKE_TIMEOUT))?
            }
            #[cfg(unix)]
            Listener::Unix(uds) => crate::uds::UnixDomainSocket::connect(uds.path())?,
        };
        stream.shutdown()
    }

    /// Bound address for diagnostics.
    pub fn describe(&self) -> String {
        match self {
            Listener::Tcp(tcp) => tcp.local_addr().to_string(),
            #[cfg(unix)]
            Listener::Unix(uds) => uds.path().display().to_string(),
        }
    }
}

impl From<TcpTransport> for Listener {
    fn from(value: TcpTransport) -> Self {
        Listener::Tcp(value)
    }
}

#[cfg(unix)]
impl From<crate::uds::UnixDomainSocket> for Listener {
    fn from(value: crate::uds::UnixDomainSocket) -> Self {
        Listener::Unix(value)
    }
}

/// A wildcard bind address is not dialable everywhere; use loopback instead.
fn dialable(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        }
        _ => addr,
    }
}
