//! Calling side of a session.
//!
//! Any number of threads may have calls in flight on one [`Client`]. Each
//! call gets its own sequence number and reply slot; whichever thread is
//! waiting drains inbound frames and files every reply into its slot, so
//! replies may arrive in any order.

use std::any::{type_name, Any};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use objwire_frame::{FrameConfig, FramedTransport, WriteTransaction};
use objwire_transport::IpcStream;
use tracing::{debug, trace, warn};

use crate::codes::*;
use crate::error::{ProtocolError, Result, RpcError};
use crate::exceptions::{ExceptionRegistry, GenericException, RemoteFault};
use crate::handles::ObjectId;
use crate::packers::{result_decoder, AnyValue, Int32, Int64, Int8, Packer, ResultDecoder, Str};
use crate::proxy::{ProxyCache, RemoteRef};

/// Default bound on establishing a connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Client behavior configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Deadline for [`Client::call`] and [`Client::ping`]. `None` waits
    /// indefinitely.
    pub call_timeout: Option<Duration>,
    /// Deadline for establishing TCP connections.
    pub connect_timeout: Option<Duration>,
    /// Framing limits and read polling.
    pub frame: FrameConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            call_timeout: None,
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            frame: FrameConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_frame_config(mut self, frame: FrameConfig) -> Self {
        self.frame = frame;
        self
    }
}

/// Where an outstanding call stands.
pub enum SlotState {
    /// Request sent, reply not yet arrived.
    Empty,
    /// Reply will be consumed and thrown away on arrival.
    Discarded,
    /// Successful reply; `None` when the call declared no result decoder.
    Value(Option<AnyValue>),
    /// The call raised remotely.
    Exception(RemoteFault),
}

impl SlotState {
    pub fn name(&self) -> &'static str {
        match self {
            SlotState::Empty => "empty",
            SlotState::Discarded => "discarded",
            SlotState::Value(_) => "value",
            SlotState::Exception(_) => "exception",
        }
    }

    /// True once a reply has been filed.
    pub fn is_resolved(&self) -> bool {
        matches!(self, SlotState::Value(_) | SlotState::Exception(_))
    }
}

impl fmt::Debug for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotState::Exception(fault) => f.debug_tuple("Exception").field(fault).finish(),
            other => f.write_str(other.name()),
        }
    }
}

/// Per-call record, keyed by sequence number.
pub struct ReplySlot {
    state: SlotState,
    decoder: Option<ResultDecoder>,
}

impl ReplySlot {
    pub fn state(&self) -> &SlotState {
        &self.state
    }

    pub fn into_state(self) -> SlotState {
        self.state
    }
}

impl fmt::Debug for ReplySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplySlot")
            .field("state", &self.state)
            .field("decodes", &self.decoder.is_some())
            .finish()
    }
}

/// Unanswered fire-and-forget commands tolerated before a sender stops to
/// read their replies.
const DISCARD_BACKLOG: usize = 64;

struct ReplyTable {
    slots: HashMap<u32, ReplySlot>,
    draining: bool,
}

impl ReplyTable {
    fn discarded_backlog(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| matches!(slot.state, SlotState::Discarded))
            .count()
    }
}

/// Multiplexing RPC client over one framed connection.
pub struct Client {
    transport: FramedTransport,
    next_seq: AtomicU32,
    replies: Mutex<ReplyTable>,
    arrived: Condvar,
    exceptions: ExceptionRegistry,
    proxies: ProxyCache<dyn Any + Send + Sync>,
    config: ClientConfig,
}

impl Client {
    pub fn new(
        transport: FramedTransport,
        exceptions: ExceptionRegistry,
        config: ClientConfig,
    ) -> Self {
        Self {
            transport,
            next_seq: AtomicU32::new(1),
            replies: Mutex::new(ReplyTable {
                slots: HashMap::new(),
                draining: false,
            }),
            arrived: Condvar::new(),
            exceptions,
            proxies: ProxyCache::new(),
            config,
        }
    }

    /// Client over an already connected socket.
    pub fn from_stream(
        stream: IpcStream,
        exceptions: ExceptionRegistry,
        config: ClientConfig,
    ) -> Result<Self> {
        let transport = FramedTransport::from_stream(stream, config.frame.clone())?;
        Ok(Self::new(transport, exceptions, config))
    }

    pub fn transport(&self) -> &FramedTransport {
        &self.transport
    }

    pub fn exceptions(&self) -> &ExceptionRegistry {
        &self.exceptions
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn lock_replies(&self) -> MutexGuard<'_, ReplyTable> {
        self.replies.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a sequence number not used by any outstanding call and
    /// register its slot.
    fn register(&self, state: SlotState, decoder: Option<ResultDecoder>) -> u32 {
        let mut table = self.lock_replies();
        loop {
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            if let Entry::Vacant(vacant) = table.slots.entry(seq) {
                vacant.insert(ReplySlot { state, decoder });
                return seq;
            }
        }
    }

    fn forget(&self, seq: u32) {
        self.lock_replies().slots.remove(&seq);
    }

    fn send(&self, seq: u32, encode: impl FnOnce(&mut BytesMut)) -> Result<()> {
        let sent = self.transport.begin_write(seq).and_then(|mut txn| {
            encode(txn.body_mut());
            txn.end()
        });
        sent.map_err(|err| {
            self.forget(seq);
            err.into()
        })
    }

    /// Start an `INVOKE` request for `function_id`.
    ///
    /// The returned call holds the write side of the connection until it is
    /// ended; append arguments through [`OutgoingCall::args`]. `decoder`
    /// decodes the success value, `None` for calls without a result.
    pub fn begin_call(
        &self,
        function_id: i32,
        decoder: Option<ResultDecoder>,
    ) -> Result<OutgoingCall<'_>> {
        let seq = self.register(SlotState::Empty, decoder);
        let mut txn = match self.transport.begin_write(seq) {
            Ok(txn) => txn,
            Err(err) => {
                self.forget(seq);
                return Err(err.into());
            }
        };
        Int8::pack(&CMD_INVOKE, txn.body_mut());
        Int32::pack(&function_id, txn.body_mut());
        trace!(seq, function_id, "call started");

        Ok(OutgoingCall {
            client: self,
            seq,
            txn: Some(txn),
        })
    }

    /// Read one inbound frame and file it into its reply slot.
    ///
    /// Returns the sequence number handled. Waiters are woken whatever the
    /// outcome. A `PROTOCOL_ERROR` reply is returned as an error and its
    /// slot is retired without being filed.
    pub fn process_incoming(&self, timeout: Option<Duration>) -> Result<u32> {
        let mut frame = self.transport.begin_read(timeout)?;
        let seq = frame.seq();
        let outcome = self.file_reply(seq, frame.payload_mut());
        frame.end();
        self.arrived.notify_all();
        outcome.map(|()| seq)
    }

    fn file_reply(&self, seq: u32, payload: &mut Bytes) -> Result<()> {
        let mut table = self.lock_replies();
        let discarded = match table.slots.get(&seq).map(ReplySlot::state) {
            Some(SlotState::Empty) => false,
            Some(SlotState::Discarded) => true,
            _ => return Err(ProtocolError::new(format!("invalid reply sequence: {seq}")).into()),
        };
        if discarded {
            table.slots.remove(&seq);
            trace!(seq, "discarded reply retired");
            return Ok(());
        }

        let code = Int8::unpack(payload)?;
        let state = match code {
            REPLY_SUCCESS => {
                let decoder = table.slots.get(&seq).and_then(|slot| slot.decoder);
                SlotState::Value(decoder.map(|decode| decode(payload)).transpose()?)
            }
            REPLY_PACKED_EXCEPTION => {
                let class_id = Int32::unpack(payload)?;
                let decode = self.exceptions.get(class_id).ok_or_else(|| {
                    ProtocolError::new(format!("unknown exception class id: {class_id}"))
                })?;
                SlotState::Exception(RemoteFault::Packed(decode(payload)?))
            }
            REPLY_GENERIC_EXCEPTION => {
                let message = Str::unpack(payload)?;
                let traceback = Str::unpack(payload)?;
                SlotState::Exception(RemoteFault::Generic(GenericException::new(
                    message, traceback,
                )))
            }
            REPLY_PROTOCOL_ERROR => {
                let message = Str::unpack(payload)?;
                warn!(seq, %message, "peer reported protocol error");
                table.slots.remove(&seq);
                return Err(ProtocolError::new(message).into());
            }
            other => {
                return Err(ProtocolError::new(format!("unknown reply code: {other}")).into())
            }
        };

        trace!(seq, reply = reply_name(code), "reply filed");
        if let Some(slot) = table.slots.get_mut(&seq) {
            slot.state = state;
        }
        Ok(())
    }

    /// Block until the reply for `seq` is filed, then take its slot.
    ///
    /// One waiter at a time drains the connection; the others sleep until
    /// something is filed. On timeout, or when draining fails, the call is
    /// abandoned: its slot is marked discarded so a late reply is dropped
    /// on arrival.
    pub fn wait_reply(&self, seq: u32, timeout: Option<Duration>) -> Result<ReplySlot> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut table = self.lock_replies();

        loop {
            let (resolved, discarded) = match table.slots.get(&seq) {
                Some(slot) => (
                    slot.state.is_resolved(),
                    matches!(slot.state, SlotState::Discarded),
                ),
                None => return Err(RpcError::InvalidSlot { seq, state: "missing" }),
            };
            if resolved {
                if let Some(slot) = table.slots.remove(&seq) {
                    return Ok(slot);
                }
            } else if discarded {
                return Err(RpcError::InvalidSlot {
                    seq,
                    state: "discarded",
                });
            }

            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        if let Some(slot) = table.slots.get_mut(&seq) {
                            slot.state = SlotState::Discarded;
                        }
                        debug!(seq, "call abandoned after timeout");
                        return Err(RpcError::Timeout {
                            seq,
                            timeout: timeout.unwrap_or_default(),
                        });
                    }
                    Some(deadline - now)
                }
                None => None,
            };

            if table.draining {
                table = match remaining {
                    Some(remaining) => {
                        self.arrived
                            .wait_timeout(table, remaining)
                            .unwrap_or_else(PoisonError::into_inner)
                            .0
                    }
                    None => self
                        .arrived
                        .wait(table)
                        .unwrap_or_else(PoisonError::into_inner),
                };
                continue;
            }

            table.draining = true;
            drop(table);
            let outcome = {
                let _draining = Draining(self);
                self.process_incoming(remaining)
            };
            table = self.lock_replies();

            match outcome {
                Ok(_) => {}
                Err(err) if err.is_timeout() => {}
                Err(err) => {
                    if let Some(slot) = table.slots.get_mut(&seq) {
                        slot.state = SlotState::Discarded;
                    }
                    debug!(seq, error = %err, "call abandoned after drain failure");
                    return Err(err);
                }
            }
        }
    }

    /// Wait for `seq` and extract its result as a `T`.
    ///
    /// Calls without a result decoder yield `()`. A remote exception is
    /// returned as [`RpcError::Remote`].
    pub fn get_reply<T: Any>(&self, seq: u32, timeout: Option<Duration>) -> Result<T> {
        let slot = self.wait_reply(seq, timeout)?;
        match slot.into_state() {
            SlotState::Value(value) => {
                let value = value.unwrap_or_else(|| Box::new(()) as AnyValue);
                value
                    .downcast::<T>()
                    .map(|value| *value)
                    .map_err(|_| RpcError::ReplyType {
                        seq,
                        expected: type_name::<T>(),
                    })
            }
            SlotState::Exception(fault) => Err(fault.into()),
            other => Err(RpcError::InvalidSlot {
                seq,
                state: other.name(),
            }),
        }
    }

    /// Invoke `function_id` and wait for its result.
    pub fn call<T: Any>(
        &self,
        function_id: i32,
        decoder: Option<ResultDecoder>,
        encode_args: impl FnOnce(&mut BytesMut),
    ) -> Result<T> {
        let mut call = self.begin_call(function_id, decoder)?;
        encode_args(call.args());
        let seq = call.end()?;
        self.get_reply(seq, self.config.call_timeout)
    }

    /// [`call`](Self::call) with the result decoded by packer `P`.
    pub fn call_with<P>(
        &self,
        function_id: i32,
        encode_args: impl FnOnce(&mut BytesMut),
    ) -> Result<P::Item>
    where
        P: Packer,
        P::Item: Send + 'static,
    {
        self.call(function_id, Some(result_decoder::<P>()), encode_args)
    }

    /// Round-trip `message` through the peer.
    pub fn ping(&self, message: &str) -> Result<String> {
        let seq = self.register(SlotState::Empty, Some(result_decoder::<Str>()));
        self.send(seq, |body| {
            Int8::pack(&CMD_PING, body);
            Str::pack(&message.to_owned(), body);
        })?;
        self.get_reply(seq, self.config.call_timeout)
    }

    /// Tell the peer to drop one reference to `id`.
    ///
    /// Fire-and-forget: the reply is discarded on arrival and delivery
    /// failures are only logged.
    pub fn decref(&self, id: ObjectId) {
        let seq = self.register(SlotState::Discarded, None);
        let sent = self.send(seq, |body| {
            Int8::pack(&CMD_DECREF, body);
            Int64::pack(&id, body);
        });
        if let Err(err) = sent {
            debug!(id, error = %err, "decref not delivered");
            return;
        }
        self.retire_discarded();
    }

    /// Read queued replies to fire-and-forget commands once too many of
    /// them are outstanding and no other thread is draining.
    ///
    /// Keeps a run of releases from filling the inbound buffer while the
    /// peer blocks writing their replies.
    fn retire_discarded(&self) {
        let mut table = self.lock_replies();
        if table.draining || table.discarded_backlog() <= DISCARD_BACKLOG {
            return;
        }
        table.draining = true;
        drop(table);

        let _draining = Draining(self);
        while self.lock_replies().discarded_backlog() > DISCARD_BACKLOG / 2 {
            match self.process_incoming(Some(Duration::ZERO)) {
                Ok(_) => {}
                Err(err) if err.is_timeout() => break,
                Err(err) => {
                    debug!(error = %err, "draining discarded replies failed");
                    break;
                }
            }
        }
    }

    /// Ask the peer to end the session, then close the connection.
    pub fn quit(&self) -> Result<()> {
        let seq = self.register(SlotState::Discarded, None);
        self.send(seq, |body| Int8::pack(&CMD_QUIT, body))?;
        debug!("quit sent");
        self.close()
    }

    /// Close the connection. Blocked waiters fail with a disconnect.
    pub fn close(&self) -> Result<()> {
        Ok(self.transport.close()?)
    }

    /// Calls still waiting for their reply.
    pub fn pending_calls(&self) -> usize {
        self.lock_replies()
            .slots
            .values()
            .filter(|slot| matches!(slot.state, SlotState::Empty))
            .count()
    }

    /// The live proxy cached for `id`, if it is a `P`.
    pub fn get_proxy<P: Any + Send + Sync>(&self, id: ObjectId) -> Option<Arc<P>> {
        self.proxies.get(id)?.downcast::<P>().ok()
    }

    /// The proxy for remote object `id`, building it with `make` on a miss.
    ///
    /// A hit means the reference the peer just handed out is already owned
    /// by the cached proxy. `make` must not touch this client's proxies.
    pub fn proxy_or_insert_with<P, F>(self: &Arc<Self>, id: ObjectId, make: F) -> Result<Arc<P>>
    where
        P: Any + Send + Sync,
        F: FnOnce(RemoteRef) -> P,
    {
        let proxy = self.proxies.get_or_insert_with(id, |generation| {
            let remote = RemoteRef::new(Arc::clone(self), id, generation);
            let proxy: Arc<dyn Any + Send + Sync> = Arc::new(make(remote));
            proxy
        });
        proxy.downcast::<P>().map_err(|_| RpcError::ProxyType {
            id,
            expected: type_name::<P>(),
        })
    }

    pub(crate) fn release_proxy(&self, id: ObjectId, generation: u64) {
        self.proxies.invalidate(id, generation);
        trace!(id, "proxy released");
        self.decref(id);
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("transport", &self.transport)
            .field("pending_calls", &self.pending_calls())
            .field("proxies", &self.proxies)
            .finish_non_exhaustive()
    }
}

struct Draining<'a>(&'a Client);

impl Drop for Draining<'_> {
    fn drop(&mut self) {
        self.0.lock_replies().draining = false;
        self.0.arrived.notify_all();
    }
}

/// An `INVOKE` request being assembled.
///
/// Dropping it without [`end`](Self::end) sends nothing and forgets the
/// call.
pub struct OutgoingCall<'a> {
    client: &'a Client,
    seq: u32,
    txn: Option<WriteTransaction<'a>>,
}

impl OutgoingCall<'_> {
    /// Sequence number to wait on.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Argument buffer; encode arguments in declaration order.
    pub fn args(&mut self) -> &mut BytesMut {
        match &mut self.txn {
            Some(txn) => txn.body_mut(),
            None => unreachable!("outgoing call used after it was sent"),
        }
    }

    /// Send the request. Returns the sequence number to wait on.
    pub fn end(mut self) -> Result<u32> {
        self.finish()?;
        Ok(self.seq)
    }

    /// Close the request as is. Identical to [`end`](Self::end): a request
    /// cannot be withdrawn once the call has begun.
    pub fn cancel(mut self) -> Result<u32> {
        self.finish()?;
        Ok(self.seq)
    }

    fn finish(&mut self) -> Result<()> {
        let Some(txn) = self.txn.take() else {
            return Ok(());
        };
        txn.end().map_err(|err| {
            self.client.forget(self.seq);
            err.into()
        })
    }
}

impl Drop for OutgoingCall<'_> {
    fn drop(&mut self) {
        if self.txn.take().is_some() {
            warn!(seq = self.seq, "outgoing call dropped before end, not sent");
            self.client.forget(self.seq);
        }
    }
}
