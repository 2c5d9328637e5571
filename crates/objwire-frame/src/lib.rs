//! Sequence-tagged framing and transactions for objwire.
//!
//! Every message travels as one frame:
//! - A 2-byte magic number ("OW") for stream synchronization
//! - A 4-byte little-endian payload length
//! - A 4-byte little-endian sequence number pairing a request with its reply
//!
//! [`FramedTransport`] layers transactions on top: a read transaction hands
//! out exactly one inbound frame, a write transaction buffers one outbound
//! frame and puts it on the wire atomically when it ends.

pub mod codec;
pub mod error;
pub mod reader;
pub mod transport;
pub mod writer;

pub use codec::{decode_frame, encode_frame, Frame, FrameConfig, DEFAULT_MAX_PAYLOAD, HEADER_SIZE};
pub use error::{FrameError, Result};
pub use reader::FrameReader;
pub use transport::{FramedTransport, ReadTransaction, WriteTransaction};
pub use writer::FrameWriter;
