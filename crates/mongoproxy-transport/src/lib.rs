//! Stream transport for mongoproxy.
//!
//! Provides a unified interface over the byte-stream transports a document
//! database client can reach the proxy through:
//! - TCP (all platforms)
//! - Unix domain sockets (Linux/macOS)
//!
//! This is the lowest layer of mongoproxy. Everything else builds on top of
//! the [`ProxyStream`] type provided here.

pub mod error;
pub mod listener;
pub mod stream;
pub mod tcp;

#[cfg(unix)]
pub mod uds;

pub use error::{Result, TransportError};
pub use listener::Listener;
pub use stream::ProxyStream;
pub use tcp::TcpTransport;

#[cfg(unix)]
pub use uds::UnixDomainSocket;
