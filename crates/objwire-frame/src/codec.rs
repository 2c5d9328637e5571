use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Frame header: magic (2) + length (4) + sequence (4) = 10 bytes.
pub const HEADER_SIZE: usize = 10;

/// Magic bytes: "OW" (0x4F 0x57).
pub const MAGIC: [u8; 2] = [0x4F, 0x57];

/// Default maximum payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Default interval at which a blocked read wakes up to check its deadline.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One request or reply on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Sequence number shared by a request and its reply.
    pub seq: u32,
    /// The message body.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(seq: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            seq,
            payload: payload.into(),
        }
    }

    /// The total wire size of this frame (header + payload).
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Encode a frame into the wire format.
///
/// ```text
/// ┌────────────┬────────────┬────────────┬──────────────────┐
/// │ Magic (2B) │ Length     │ Sequence   │ Payload          │
/// │ 0x4F 0x57  │ (4B LE)    │ (4B LE)    │ (Length bytes)   │
/// └────────────┴────────────┴────────────┴──────────────────┘
/// ```
pub fn encode_frame(seq: u32, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge {
        size: payload.len(),
        max: u32::MAX as usize,
    })?;
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_slice(&MAGIC);
    dst.put_u32_le(len);
    dst.put_u32_le(seq);
    dst.put_slice(payload);
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't hold a complete frame yet; the
/// buffer is left untouched in that case. On success the frame bytes are
/// consumed.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    if src[0..2] != MAGIC {
        return Err(FrameError::InvalidMagic);
    }

    let mut header = &src[2..HEADER_SIZE];
    let payload_len = header.get_u32_le() as usize;
    let seq = header.get_u32_le();

    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    if src.len() < HEADER_SIZE + payload_len {
        src.reserve(HEADER_SIZE + payload_len - src.len());
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    let payload = src.split_to(payload_len).freeze();

    Ok(Some(Frame { seq, payload }))
}

/// Configuration shared by frame readers, writers and transports.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 16 MiB.
    pub max_payload_size: usize,
    /// How often a blocked read wakes up to re-check its deadline.
    /// Applied as the stream read timeout for socket-backed transports.
    pub poll_interval: Duration,
    /// Write timeout for blocking writes. `None` blocks indefinitely.
    pub write_timeout: Option<Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            poll_interval: DEFAULT_POLL_INTERVAL,
            write_timeout: None,
        }
    }
}

impl FrameConfig {
    /// Override the maximum payload size.
    pub fn with_max_payload_size(mut self, max_payload_size: usize) -> Self {
        self.max_payload_size = max_payload_size;
        self
    }

    /// Override the read poll interval.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Override the write timeout.
    pub fn with_write_timeout(mut self, write_timeout: Option<Duration>) -> Self {
        self.write_timeout = write_timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_magic_length_sequence() {
        let mut buf = BytesMut::new();
        encode_frame(0x0102_0304, b"abc", &mut buf).unwrap();

        assert_eq!(&buf[0..2], b"OW");
        assert_eq!(&buf[2..6], &[3, 0, 0, 0]);
        assert_eq!(&buf[6..10], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&buf[10..], b"abc");
    }

    #[test]
    fn decode_returns_sequence_and_payload() {
        let mut buf = BytesMut::new();
        encode_frame(7, b"hello, objwire!", &mut buf).unwrap();

        let frame = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .unwrap();

        assert_eq!(frame.seq, 7);
        assert_eq!(frame.payload.as_ref(), b"hello, objwire!");
        assert!(buf.is_empty());
    }

    #[test]
    fn incomplete_header_waits_for_more() {
        let mut buf = BytesMut::from(&[0x4F, 0x57, 0x00][..]);
        assert!(decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().is_none());
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn incomplete_payload_waits_for_more() {
        let mut buf = BytesMut::new();
        encode_frame(1, b"hello", &mut buf).unwrap();
        buf.truncate(HEADER_SIZE + 2);

        assert!(decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().is_none());
        assert_eq!(buf.len(), HEADER_SIZE + 2);
    }

    #[test]
    fn invalid_magic_is_rejected() {
        let mut buf = BytesMut::from(&[0xFF; HEADER_SIZE][..]);
        let result = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD);
        assert!(matches!(result, Err(FrameError::InvalidMagic)));
    }

    #[test]
    fn oversized_length_is_rejected_before_buffering() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u32_le(32 * 1024 * 1024);
        buf.put_u32_le(1);

        let result = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD);
        assert!(matches!(result, Err(FrameError::PayloadTooLarge { .. })));
    }

    #[test]
    fn back_to_back_frames_keep_their_sequences() {
        let mut buf = BytesMut::new();
        encode_frame(2, b"second-call", &mut buf).unwrap();
        encode_frame(1, b"first-call", &mut buf).unwrap();

        let a = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
        let b = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
        assert_eq!((a.seq, a.payload.as_ref()), (2, b"second-call".as_ref()));
        assert_eq!((b.seq, b.payload.as_ref()), (1, b"first-call".as_ref()));
        assert!(buf.is_empty());
    }

    #[test]
    fn empty_payload_is_a_valid_frame() {
        let mut buf = BytesMut::new();
        encode_frame(9, b"", &mut buf).unwrap();

        let frame = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
        assert_eq!(frame.seq, 9);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn wire_size_includes_header() {
        let frame = Frame::new(1, Bytes::from_static(b"test"));
        assert_eq!(frame.wire_size(), HEADER_SIZE + 4);
    }
}
