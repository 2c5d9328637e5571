//! Serving side of a session: one request frame in, one reply frame out.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use objwire_frame::FramedTransport;
use tracing::{debug, error, trace, warn};

use crate::codes::*;
use crate::error::{InvokeError, ProtocolError, Result, RpcError};
use crate::exceptions::{GenericException, PackedException};
use crate::handles::HandleTable;
use crate::packers::{Int32, Int64, Int8, Packer, Str};

/// Handle table holding the objects a session exposes.
pub type ObjectTable = HandleTable<dyn Any + Send + Sync>;

/// One `INVOKE` request as seen by the service.
pub struct Invocation<'a> {
    /// Function id chosen by the caller.
    pub function_id: i32,
    /// Encoded arguments, positioned after the function id.
    pub args: &'a mut Bytes,
    /// Reply body. The `SUCCESS` code is already in place; append the
    /// result, if any.
    pub reply: &'a mut BytesMut,
    /// Objects exposed in this session.
    pub objects: &'a ObjectTable,
}

/// Service-specific dispatch of `INVOKE` requests.
///
/// Returning `Protocol`, `Generic` or `Packed` errors discards whatever was
/// appended to the reply and sends the matching error reply instead.
/// `Fatal` sends nothing and ends the session.
pub trait InvokeHandler: Send + Sync {
    fn invoke(&self, call: Invocation<'_>) -> std::result::Result<(), InvokeError>;
}

impl<F> InvokeHandler for F
where
    F: Fn(Invocation<'_>) -> std::result::Result<(), InvokeError> + Send + Sync,
{
    fn invoke(&self, call: Invocation<'_>) -> std::result::Result<(), InvokeError> {
        self(call)
    }
}

/// What the serving loop should do after one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Processes requests for one session.
pub struct Dispatcher {
    handler: Arc<dyn InvokeHandler>,
    objects: Arc<ObjectTable>,
}

impl Dispatcher {
    /// Dispatcher with a fresh, empty object table.
    pub fn new(handler: Arc<dyn InvokeHandler>) -> Self {
        Self::with_objects(handler, Arc::new(ObjectTable::new()))
    }

    /// Dispatcher sharing an existing object table.
    pub fn with_objects(handler: Arc<dyn InvokeHandler>, objects: Arc<ObjectTable>) -> Self {
        Self { handler, objects }
    }

    pub fn objects(&self) -> &Arc<ObjectTable> {
        &self.objects
    }

    /// Read one request and write exactly one reply under the same sequence
    /// number.
    ///
    /// Recoverable failures become error replies and yield
    /// `Ok(Flow::Continue)`. Transport failures and fatal handler failures
    /// are returned; in the latter case no reply is sent.
    pub fn process(&self, transport: &FramedTransport) -> Result<Flow> {
        let mut request = transport.begin_read(None)?;
        let seq = request.seq();
        let command = Int8::unpack(request.payload_mut());
        let mut reply = transport.begin_write(seq)?;

        let outcome = match command {
            Ok(command) => {
                trace!(seq, command = command_name(command), "dispatching");
                self.dispatch(command, request.payload_mut(), reply.body_mut())
            }
            Err(err) => Err(InvokeError::from(err)),
        };
        request.end();

        match outcome {
            Ok(flow) => {
                reply.end()?;
                Ok(flow)
            }
            Err(InvokeError::Protocol(err)) => {
                warn!(seq, error = %err, "rejecting request");
                reply.reset();
                write_protocol_error(reply.body_mut(), &err);
                reply.end()?;
                Ok(Flow::Continue)
            }
            Err(InvokeError::Generic(exc)) => {
                debug!(seq, message = %exc.message, "invocation raised");
                reply.reset();
                write_generic_exception(reply.body_mut(), &exc);
                reply.end()?;
                Ok(Flow::Continue)
            }
            Err(InvokeError::Packed(exc)) => {
                debug!(seq, class_id = exc.class_id(), "invocation raised declared exception");
                reply.reset();
                write_packed_exception(reply.body_mut(), &*exc);
                reply.end()?;
                Ok(Flow::Continue)
            }
            Err(InvokeError::Fatal(err)) => {
                error!(seq, error = %err, "handler failed, abandoning session");
                reply.cancel();
                Err(RpcError::Handler(err))
            }
        }
    }

    fn dispatch(
        &self,
        command: i8,
        args: &mut Bytes,
        reply: &mut BytesMut,
    ) -> std::result::Result<Flow, InvokeError> {
        match command {
            CMD_INVOKE => {
                let function_id = Int32::unpack(args)?;
                Int8::pack(&REPLY_SUCCESS, reply);
                self.handler.invoke(Invocation {
                    function_id,
                    args,
                    reply,
                    objects: &self.objects,
                })?;
                Ok(Flow::Continue)
            }
            CMD_DECREF => {
                let id = Int64::unpack(args)?;
                self.objects.decref(id);
                Ok(Flow::Continue)
            }
            CMD_INCREF => {
                let id = Int64::unpack(args)?;
                self.objects.incref(id);
                Ok(Flow::Continue)
            }
            CMD_QUIT => Ok(Flow::Quit),
            CMD_PING => {
                let message = Str::unpack(args)?;
                Int8::pack(&REPLY_SUCCESS, reply);
                Str::pack(&message, reply);
                Ok(Flow::Continue)
            }
            other => Err(ProtocolError::new(format!("unknown command code: {other}")).into()),
        }
    }

    /// Process requests until the peer quits or disconnects.
    pub fn serve(&self, transport: &FramedTransport) -> Result<()> {
        loop {
            match self.process(transport) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Quit) => {
                    debug!("peer requested quit");
                    return Ok(());
                }
                Err(err) if err.is_disconnect() => {
                    debug!("peer disconnected");
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("objects", &self.objects)
            .finish_non_exhaustive()
    }
}

fn write_protocol_error(dst: &mut BytesMut, err: &ProtocolError) {
    Int8::pack(&REPLY_PROTOCOL_ERROR, dst);
    Str::pack(&err.message().to_string(), dst);
}

fn write_generic_exception(dst: &mut BytesMut, exc: &GenericException) {
    Int8::pack(&REPLY_GENERIC_EXCEPTION, dst);
    Str::pack(&exc.message, dst);
    Str::pack(&exc.traceback, dst);
}

fn write_packed_exception(dst: &mut BytesMut, exc: &dyn PackedException) {
    Int8::pack(&REPLY_PACKED_EXCEPTION, dst);
    Int32::pack(&exc.class_id(), dst);
    exc.pack_fields(dst);
}
