//! Remote object protocol runtime.
//!
//! Clients invoke methods on objects that live in a remote peer and only
//! ever hold numeric handles for them; the peer keeps the objects alive
//! through explicit reference counting.
//!
//! - [`handles`]: reference-counted id to object table (serving side)
//! - [`dispatch`]: turns one request frame into exactly one reply frame
//! - [`client`]: sequence allocation and reply correlation for concurrent calls
//! - [`proxy`]: non-owning cache of client-side proxies by remote id
//! - [`server`] and [`connector`]: listening and connecting over objwire transports

pub mod client;
pub mod codes;
pub mod connector;
pub mod dispatch;
pub mod error;
pub mod exceptions;
pub mod handles;
pub mod packers;
pub mod proxy;
pub mod server;

pub use client::{Client, ClientConfig, OutgoingCall, ReplySlot, SlotState, DEFAULT_CONNECT_TIMEOUT};
pub use codes::*;
pub use connector::{connect, connect_with_config};
pub use dispatch::{Dispatcher, Flow, InvokeHandler, Invocation, ObjectTable};
pub use error::{CodecError, InvokeError, ProtocolError, Result, RpcError};
pub use exceptions::{ExceptionRegistry, GenericException, PackedDecoder, PackedException, RemoteFault};
pub use handles::{HandleTable, ObjectId, NULL_OBJECT_ID};
pub use packers::{result_decoder, AnyValue, Packer, ResultDecoder};
pub use proxy::{ProxyCache, RemoteRef};
pub use server::{
    serve_stream, ParseServeModeError, ServeMode, Server, ServerConfig, ShutdownHandle,
    LIBRARY_BANNER,
};
