use std::time::Duration;

/// Errors that can occur while moving frames over a stream.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame header contains an invalid magic number.
    #[error("invalid frame magic (expected 0x4F57 \"OW\")")]
    InvalidMagic,

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,

    /// No frame arrived before the read deadline.
    #[error("no frame received within {0:?}")]
    Timeout(Duration),

    /// A thread panicked while holding one side of the transport; the stream
    /// position is unknown.
    #[error("transport poisoned by a panicked transaction")]
    Poisoned,

    /// An earlier write failed partway through a frame, so the peer can no
    /// longer find frame boundaries.
    #[error("frame stream desynchronized by an incomplete write")]
    Desynchronized,
}

impl FrameError {
    /// True when the peer went away cleanly between frames.
    pub fn is_disconnect(&self) -> bool {
        match self {
            FrameError::ConnectionClosed => true,
            FrameError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

impl From<objwire_transport::TransportError> for FrameError {
    fn from(err: objwire_transport::TransportError) -> Self {
        use objwire_transport::TransportError;

        match err {
            TransportError::Io(io) | TransportError::Accept(io) => FrameError::Io(io),
            TransportError::Bind { source, .. } | TransportError::Connect { source, .. } => {
                FrameError::Io(source)
            }
            other => FrameError::Io(std::io::Error::other(other.to_string())),
        }
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
