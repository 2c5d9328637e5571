use std::io::{ErrorKind, Write};

use bytes::BytesMut;

use crate::codec::{encode_frame, Frame, FrameConfig};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Writes complete frames to any `Write` stream.
pub struct FrameWriter<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
    broken: bool,
}

impl<T: Write> FrameWriter<T> {
    /// Create a new frame writer with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame writer with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
            broken: false,
        }
    }

    /// Write a complete frame (blocking).
    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.send(frame.seq, frame.payload.as_ref())
    }

    /// Encode `payload` under `seq` and write it out in one piece.
    ///
    /// If a write fails after part of the frame reached the stream, this
    /// and every later send fail with [`FrameError::Desynchronized`].
    pub fn send(&mut self, seq: u32, payload: &[u8]) -> Result<()> {
        if self.broken {
            return Err(FrameError::Desynchronized);
        }
        if payload.len() > self.config.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: self.config.max_payload_size,
            });
        }

        self.buf.clear();
        encode_frame(seq, payload, &mut self.buf)?;

        let mut offset = 0usize;
        while offset < self.buf.len() {
            let err = match self.inner.write(&self.buf[offset..]) {
                Ok(0) => FrameError::ConnectionClosed,
                Ok(n) => {
                    offset += n;
                    continue;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => FrameError::Io(err),
            };
            if offset > 0 {
                self.broken = true;
            }
            return Err(err);
        }

        let flushed = self.flush();
        if flushed.is_err() {
            self.broken = true;
        }
        flushed
    }

    /// True once a failed write has left part of a frame on the stream.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Current frame writer configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}
