//! Byte-stream transports for objwire.
//!
//! Provides a unified connected stream over the socket families objwire
//! speaks:
//! - Unix domain sockets (Linux/macOS)
//! - TCP
//!
//! This is the lowest layer of objwire. Framing and transactions live in
//! `objwire-frame`; everything protocol-related builds on top of the
//! [`IpcStream`] type provided here.

pub mod endpoint;
pub mod error;
pub mod stream;
pub mod tcp;

#[cfg(unix)]
pub mod uds;

pub use endpoint::{Endpoint, Listener};
pub use error::{Result, TransportError};
pub use stream::IpcStream;
pub use tcp::TcpSocket;

#[cfg(unix)]
pub use uds::UnixDomainSocket;
