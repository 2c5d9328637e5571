use std::time::Duration;

use crate::exceptions::{GenericException, PackedException, RemoteFault};
use crate::handles::ObjectId;

/// A violation of the wire contract: malformed payload, unknown code,
/// unexpected sequence number.
///
/// On the serving side it is answered with a `PROTOCOL_ERROR` reply and the
/// session carries on; on the calling side it surfaces to the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ProtocolError {
    message: String,
}

impl ProtocolError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Failures while decoding values out of a payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Fewer bytes remain than the value needs.
    #[error("truncated payload: need {needed} bytes, {remaining} left")]
    Truncated { needed: usize, remaining: usize },

    /// A length or count prefix is negative.
    #[error("invalid length prefix {0}")]
    InvalidLength(i32),

    /// A string value is not valid UTF-8.
    #[error("string value is not valid UTF-8")]
    InvalidUtf8,
}

impl From<CodecError> for ProtocolError {
    fn from(err: CodecError) -> Self {
        ProtocolError::new(format!("malformed payload: {err}"))
    }
}

/// Outcome of a failed service invocation, as seen by the dispatcher.
///
/// The first three variants are answered on the wire. `Fatal` abandons the
/// reply and ends the serving loop.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Generic(#[from] GenericException),

    #[error("{0}")]
    Packed(Box<dyn PackedException>),

    #[error("fatal handler failure: {0}")]
    Fatal(Box<dyn std::error::Error + Send + Sync>),
}

impl InvokeError {
    /// Wrap a declared exception type.
    pub fn packed(exception: impl PackedException) -> Self {
        InvokeError::Packed(Box::new(exception))
    }

    /// Wrap any error as a session-ending failure.
    pub fn fatal(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        InvokeError::Fatal(err.into())
    }
}

impl From<CodecError> for InvokeError {
    fn from(err: CodecError) -> Self {
        InvokeError::Protocol(err.into())
    }
}

impl From<RpcError> for InvokeError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Protocol(err) => InvokeError::Protocol(err),
            other => InvokeError::Fatal(Box::new(other)),
        }
    }
}

/// Errors surfaced by the protocol runtime.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] objwire_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] objwire_frame::FrameError),

    /// The peer broke the wire contract, or told us we did.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The remote call raised.
    #[error(transparent)]
    Remote(#[from] RemoteFault),

    /// A handle id that was never issued or has been released.
    #[error("object {0} not found")]
    ObjectNotFound(ObjectId),

    /// A service handler failed in a way that ends the session.
    #[error("handler failed: {0}")]
    Handler(Box<dyn std::error::Error + Send + Sync>),

    /// No reply arrived for `seq` before the deadline.
    #[error("no reply for call {seq} within {timeout:?}")]
    Timeout { seq: u32, timeout: Duration },

    /// The reply value is not of the type the caller asked for.
    #[error("reply for call {seq} is not a {expected}")]
    ReplyType { seq: u32, expected: &'static str },

    /// The cached proxy for an object is of another type.
    #[error("proxy for object {id} is not a {expected}")]
    ProxyType { id: ObjectId, expected: &'static str },

    /// The reply slot for `seq` is missing or cannot yield a result.
    #[error("no usable reply for call {seq} (slot {state})")]
    InvalidSlot { seq: u32, state: &'static str },
}

impl From<CodecError> for RpcError {
    fn from(err: CodecError) -> Self {
        RpcError::Protocol(err.into())
    }
}

impl RpcError {
    /// True when the connection went away rather than failed.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, RpcError::Frame(err) if err.is_disconnect())
    }

    /// True for call deadlines and read deadlines alike.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            RpcError::Timeout { .. } | RpcError::Frame(objwire_frame::FrameError::Timeout(_))
        )
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_displays_bare_message() {
        let err = ProtocolError::new("unknown command code: 99");
        assert_eq!(err.to_string(), "unknown command code: 99");
        assert_eq!(
            RpcError::from(err).to_string(),
            "protocol error: unknown command code: 99"
        );
    }

    #[test]
    fn codec_errors_become_protocol_errors() {
        let err = InvokeError::from(CodecError::Truncated {
            needed: 4,
            remaining: 1,
        });
        match err {
            InvokeError::Protocol(err) => {
                assert!(err.message().starts_with("malformed payload"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            RpcError::from(CodecError::InvalidUtf8),
            RpcError::Protocol(_)
        ));
    }

    #[test]
    fn missing_object_inside_handler_is_fatal() {
        let err = InvokeError::from(RpcError::ObjectNotFound(12));
        assert!(matches!(err, InvokeError::Fatal(_)));
        assert!(err.to_string().contains("object 12 not found"));
    }

    #[test]
    fn timeout_and_disconnect_classification() {
        let read_timeout = RpcError::Frame(objwire_frame::FrameError::Timeout(
            Duration::from_millis(5),
        ));
        assert!(read_timeout.is_timeout());
        assert!(RpcError::Timeout {
            seq: 1,
            timeout: Duration::from_secs(1)
        }
        .is_timeout());

        let closed = RpcError::Frame(objwire_frame::FrameError::ConnectionClosed);
        assert!(closed.is_disconnect());
        assert!(!closed.is_timeout());
    }
}
