use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use objwire_transport::IpcStream;
use tracing::{debug, trace, warn};

use crate::codec::FrameConfig;
use crate::error::{FrameError, Result};
use crate::reader::FrameReader;
use crate::writer::FrameWriter;

type BoxedRead = Box<dyn Read + Send>;
type BoxedWrite = Box<dyn Write + Send>;

/// Transacted, sequence-tagged frame I/O over one connection.
///
/// At most one read transaction and one write transaction are open at any
/// instant; opening a second one of the same kind blocks until the first
/// ends. Both kinds are RAII guards: dropping a [`ReadTransaction`] ends it,
/// dropping an unfinished [`WriteTransaction`] discards its body.
pub struct FramedTransport {
    reader: Mutex<FrameReader<BoxedRead>>,
    writer: Mutex<FrameWriter<BoxedWrite>>,
    control: Option<IpcStream>,
    closed: AtomicBool,
    config: FrameConfig,
}

impl FramedTransport {
    /// Build a transport from independent read and write halves.
    ///
    /// Read deadlines are only honored if `reader` itself returns
    /// `WouldBlock`/`TimedOut` periodically.
    pub fn new(
        reader: impl Read + Send + 'static,
        writer: impl Write + Send + 'static,
        config: FrameConfig,
    ) -> Self {
        Self {
            reader: Mutex::new(FrameReader::with_config(Box::new(reader), config.clone())),
            writer: Mutex::new(FrameWriter::with_config(Box::new(writer), config.clone())),
            control: None,
            closed: AtomicBool::new(false),
            config,
        }
    }

    /// Build a transport over a connected socket.
    ///
    /// The stream's read timeout is set to the configured poll interval so
    /// that reads can observe deadlines and [`close`](Self::close).
    pub fn from_stream(stream: IpcStream, config: FrameConfig) -> Result<Self> {
        stream.set_read_timeout(Some(config.poll_interval))?;
        stream.set_write_timeout(config.write_timeout)?;
        let read_half = stream.try_clone()?;
        let control = stream.try_clone()?;

        let mut transport = Self::new(read_half, stream, config);
        transport.control = Some(control);
        Ok(transport)
    }

    /// Open a read transaction holding the next inbound frame.
    ///
    /// With `timeout == None` this waits until a frame arrives, the peer
    /// disconnects, or the transport is closed.
    pub fn begin_read(&self, timeout: Option<Duration>) -> Result<ReadTransaction<'_>> {
        let mut reader = self.reader.lock().map_err(|_| FrameError::Poisoned)?;

        let frame = match timeout {
            Some(timeout) => reader.read_frame_within(timeout)?,
            None => loop {
                if self.is_closed() {
                    return Err(FrameError::ConnectionClosed);
                }
                match reader.read_frame() {
                    Ok(frame) => break frame,
                    Err(FrameError::Io(err))
                        if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
                    {
                        continue
                    }
                    Err(err) => return Err(err),
                }
            },
        };

        trace!(seq = frame.seq, size = frame.payload.len(), "frame received");
        Ok(ReadTransaction {
            seq: frame.seq,
            payload: frame.payload,
            _reader: reader,
        })
    }

    /// Open a write transaction whose frame will carry `seq`.
    pub fn begin_write(&self, seq: u32) -> Result<WriteTransaction<'_>> {
        if self.is_closed() {
            return Err(FrameError::ConnectionClosed);
        }
        let writer = self.writer.lock().map_err(|_| FrameError::Poisoned)?;
        if writer.is_broken() {
            return Err(FrameError::Desynchronized);
        }
        Ok(WriteTransaction {
            seq,
            body: BytesMut::new(),
            writer,
            finished: false,
        })
    }

    /// Close the transport. Pending and future reads fail with
    /// [`FrameError::ConnectionClosed`].
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("closing framed transport");
        if let Some(control) = &self.control {
            control.shutdown()?;
        }
        Ok(())
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Transport configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl std::fmt::Debug for FramedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedTransport")
            .field("control", &self.control)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// One inbound frame, held exclusively until the transaction ends.
pub struct ReadTransaction<'a> {
    seq: u32,
    payload: Bytes,
    _reader: MutexGuard<'a, FrameReader<BoxedRead>>,
}

impl ReadTransaction<'_> {
    /// Sequence number chosen by the sender of this frame.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Unconsumed part of the frame body. Decoders advance it.
    pub fn payload_mut(&mut self) -> &mut Bytes {
        &mut self.payload
    }

    /// Bytes of the body not consumed yet.
    pub fn remaining(&self) -> usize {
        self.payload.len()
    }

    /// End the transaction, releasing the read side.
    pub fn end(self) {
        if !self.payload.is_empty() {
            trace!(
                seq = self.seq,
                unread = self.payload.len(),
                "read transaction ended with unread bytes"
            );
        }
    }
}

/// One outbound frame being assembled.
///
/// Nothing reaches the wire until [`end`](Self::end).
pub struct WriteTransaction<'a> {
    seq: u32,
    body: BytesMut,
    writer: MutexGuard<'a, FrameWriter<BoxedWrite>>,
    finished: bool,
}

impl WriteTransaction<'_> {
    /// Sequence number this frame will carry.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Body written so far. Encoders append to it.
    pub fn body_mut(&mut self) -> &mut BytesMut {
        &mut self.body
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.body.len()
    }

    /// True if nothing has been written yet.
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Discard everything written so far; the transaction stays open.
    pub fn reset(&mut self) {
        self.body.clear();
    }

    /// Send the frame and release the write side.
    pub fn end(mut self) -> Result<()> {
        self.finished = true;
        let result = self.writer.send(self.seq, &self.body);
        match &result {
            Ok(()) => trace!(seq = self.seq, size = self.body.len(), "frame sent"),
            Err(err) if self.writer.is_broken() => {
                warn!(seq = self.seq, error = %err, "frame send failed, write side unusable")
            }
            Err(err) => debug!(seq = self.seq, error = %err, "frame send failed"),
        }
        result
    }

    /// Abandon the transaction without sending anything.
    pub fn cancel(mut self) {
        self.finished = true;
        debug!(seq = self.seq, "write transaction cancelled");
    }
}

impl Drop for WriteTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            debug!(
                seq = self.seq,
                discarded = self.body.len(),
                "write transaction dropped without end"
            );
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    use bytes::{Buf, BufMut};

    use super::*;

    fn pair() -> (FramedTransport, FramedTransport) {
        let (left, right) = IpcStream::pair().unwrap();
        let config = FrameConfig::default().with_poll_interval(Duration::from_millis(10));
        (
            FramedTransport::from_stream(left, config.clone()).unwrap(),
            FramedTransport::from_stream(right, config).unwrap(),
        )
    }

    /// Takes the first three bytes it is given, then times out.
    struct Stalls(usize);

    impl std::io::Write for Stalls {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if self.0 >= 3 {
                return Err(std::io::Error::from(ErrorKind::TimedOut));
            }
            let n = (3 - self.0).min(buf.len());
            self.0 += n;
            Ok(n)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn torn_frame_fails_every_later_write() {
        let transport = FramedTransport::new(std::io::empty(), Stalls(0), FrameConfig::default());

        let mut first = transport.begin_write(1).unwrap();
        first.body_mut().put_slice(b"request");
        assert!(matches!(first.end(), Err(FrameError::Io(_))));

        assert!(matches!(
            transport.begin_write(2),
            Err(FrameError::Desynchronized)
        ));
    }

    #[test]
    fn write_then_read_carries_sequence_and_body() {
        let (client, server) = pair();

        let mut txn = client.begin_write(42).unwrap();
        txn.body_mut().put_u8(1);
        txn.body_mut().put_slice(b"body");
        txn.end().unwrap();

        let mut read = server.begin_read(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(read.seq(), 42);
        assert_eq!(read.payload_mut().get_u8(), 1);
        assert_eq!(read.payload_mut().as_ref(), b"body");
        read.end();
    }

    #[test]
    fn reset_discards_partial_body_but_keeps_transaction() {
        let (client, server) = pair();

        let mut txn = client.begin_write(3).unwrap();
        txn.body_mut().put_slice(b"half-written");
        txn.reset();
        assert!(txn.is_empty());
        txn.body_mut().put_slice(b"replacement");
        txn.end().unwrap();

        let mut read = server.begin_read(None).unwrap();
        assert_eq!(read.seq(), 3);
        assert_eq!(read.payload_mut().as_ref(), b"replacement");
    }

    #[test]
    fn cancelled_and_dropped_writes_send_nothing() {
        let (client, server) = pair();

        let mut cancelled = client.begin_write(1).unwrap();
        cancelled.body_mut().put_slice(b"never");
        cancelled.cancel();

        let mut dropped = client.begin_write(2).unwrap();
        dropped.body_mut().put_slice(b"never either");
        drop(dropped);

        client.begin_write(3).unwrap().end().unwrap();

        let read = server.begin_read(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(read.seq(), 3);
        assert_eq!(read.remaining(), 0);
    }

    #[test]
    fn read_times_out_when_idle() {
        let (_client, server) = pair();
        let started = Instant::now();
        let err = server
            .begin_read(Some(Duration::from_millis(50)))
            .err()
            .unwrap();
        assert!(matches!(err, FrameError::Timeout(_)));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn read_side_is_exclusive_until_transaction_ends() {
        let (client, server) = pair();
        let server = Arc::new(server);

        client.begin_write(1).unwrap().end().unwrap();
        client.begin_write(2).unwrap().end().unwrap();

        let first = server.begin_read(None).unwrap();
        assert_eq!(first.seq(), 1);

        let contender = {
            let server = Arc::clone(&server);
            thread::spawn(move || server.begin_read(None).unwrap().seq())
        };
        thread::sleep(Duration::from_millis(30));
        assert!(!contender.is_finished());

        first.end();
        assert_eq!(contender.join().unwrap(), 2);
    }

    #[test]
    fn close_unblocks_waiting_reader() {
        let (_client, server) = pair();
        let server = Arc::new(server);

        let waiter = {
            let server = Arc::clone(&server);
            thread::spawn(move || server.begin_read(None).err())
        };
        thread::sleep(Duration::from_millis(30));
        server.close().unwrap();

        let err = waiter.join().unwrap().unwrap();
        assert!(err.is_disconnect());
        assert!(matches!(
            server.begin_write(1).err().unwrap(),
            FrameError::ConnectionClosed
        ));
    }

    #[test]
    fn peer_hangup_is_a_disconnect() {
        let (client, server) = pair();
        drop(client);
        let err = server.begin_read(None).err().unwrap();
        assert!(err.is_disconnect());
    }

    #[test]
    fn plain_read_write_halves_work_without_sockets() {
        let mut wire = BytesMut::new();
        crate::codec::encode_frame(11, b"cursor", &mut wire).unwrap();
        let transport = FramedTransport::new(
            std::io::Cursor::new(wire.to_vec()),
            std::io::sink(),
            FrameConfig::default(),
        );

        let mut read = transport.begin_read(None).unwrap();
        assert_eq!(read.seq(), 11);
        assert_eq!(read.payload_mut().as_ref(), b"cursor");
        read.end();

        let err = transport.begin_read(None).err().unwrap();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }
}
