//! Remote objects over a single framed connection.
//!
//! A client calls methods on objects living in a serving peer and only ever
//! holds numeric handles for them. The peer keeps each exposed object alive
//! through an explicit reference count that client proxies release when they
//! are dropped. Many calls may be in flight on one connection at once; each
//! reply is routed back to its caller by sequence number.
//!
//! # Crate Structure
//!
//! - [`transport`]: byte streams over TCP and Unix domain sockets
//! - [`frame`]: sequence-tagged frames and read/write transactions
//! - [`protocol`]: handle table, dispatcher, call correlation, proxy cache
//!   and servers
//! - [`demo`]: a counter service used by the CLI (behind the `demo` feature)

/// Re-export transport types.
pub mod transport {
    pub use objwire_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use objwire_frame::*;
}

/// Re-export protocol types.
pub mod protocol {
    pub use objwire_protocol::*;
}

#[cfg(feature = "demo")]
pub mod demo;
