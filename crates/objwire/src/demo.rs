//! A small counter service used by the `objwire` CLI and the integration
//! tests.
//!
//! The server side exposes counters as remote objects; the client side wraps
//! them in [`CounterProxy`], which releases the remote counter when the last
//! clone is dropped.

use std::any::Any;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use objwire_protocol::packers::{Int64, ObjRef, Str};
use objwire_protocol::{
    Client, CodecError, ExceptionRegistry, GenericException, InvokeError, InvokeHandler,
    Invocation, ObjectId, PackedException, Packer, RemoteRef, Result,
};
use tracing::debug;

/// `new_counter(start: i64) -> counter`
pub const FN_NEW_COUNTER: i32 = 1;
/// `add(counter, delta: i64) -> i64`
pub const FN_ADD: i32 = 2;
/// `get(counter) -> i64`
pub const FN_GET: i32 = 3;
/// `divide(dividend: i64, divisor: i64) -> i64`, raises [`DivideByZero`].
pub const FN_DIVIDE: i32 = 4;
/// `fail(reason: str)`, always raises a generic exception.
pub const FN_FAIL: i32 = 5;
/// `live_objects() -> i64`, objects exposed on this session.
pub const FN_LIVE_OBJECTS: i32 = 6;

/// Class id of [`DivideByZero`] on the wire.
pub const DIVIDE_BY_ZERO: i32 = 1;

struct Counter {
    value: AtomicI64,
}

/// Declared failure of `divide`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot divide {dividend} by zero")]
pub struct DivideByZero {
    pub dividend: i64,
}

impl PackedException for DivideByZero {
    fn class_id(&self) -> i32 {
        DIVIDE_BY_ZERO
    }

    fn pack_fields(&self, dst: &mut BytesMut) {
        Int64::pack(&self.dividend, dst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Wire codec for [`DivideByZero`].
pub struct DivideByZeroPacker;

impl Packer for DivideByZeroPacker {
    type Item = DivideByZero;

    fn pack(item: &DivideByZero, dst: &mut BytesMut) {
        item.pack_fields(dst);
    }

    fn unpack(src: &mut Bytes) -> std::result::Result<DivideByZero, CodecError> {
        Ok(DivideByZero {
            dividend: Int64::unpack(src)?,
        })
    }
}

/// Exceptions a counter client must be able to decode.
pub fn exceptions() -> ExceptionRegistry {
    ExceptionRegistry::new().with_packer::<DivideByZeroPacker>(DIVIDE_BY_ZERO)
}

/// Server half of the counter service.
#[derive(Debug, Default, Clone, Copy)]
pub struct CounterService;

impl CounterService {
    pub fn handler() -> Arc<dyn InvokeHandler> {
        Arc::new(CounterService)
    }

    fn counter(call: &mut Invocation<'_>) -> std::result::Result<Arc<Counter>, InvokeError> {
        let id = ObjRef::unpack(call.args)?;
        call.objects
            .get(id)?
            .downcast::<Counter>()
            .map_err(|_| GenericException::new(format!("object {id} is not a counter"), "").into())
    }
}

impl InvokeHandler for CounterService {
    fn invoke(&self, mut call: Invocation<'_>) -> std::result::Result<(), InvokeError> {
        match call.function_id {
            FN_NEW_COUNTER => {
                let start = Int64::unpack(call.args)?;
                let counter: Arc<dyn Any + Send + Sync> = Arc::new(Counter {
                    value: AtomicI64::new(start),
                });
                let id = call.objects.store(&counter);
                debug!(id, start, "counter created");
                ObjRef::pack(&id, call.reply);
            }
            FN_ADD => {
                let counter = Self::counter(&mut call)?;
                let delta = Int64::unpack(call.args)?;
                let total = counter.value.fetch_add(delta, Ordering::SeqCst) + delta;
                Int64::pack(&total, call.reply);
            }
            FN_GET => {
                let counter = Self::counter(&mut call)?;
                Int64::pack(&counter.value.load(Ordering::SeqCst), call.reply);
            }
            FN_DIVIDE => {
                let dividend = Int64::unpack(call.args)?;
                let divisor = Int64::unpack(call.args)?;
                if divisor == 0 {
                    return Err(InvokeError::packed(DivideByZero { dividend }));
                }
                Int64::pack(&dividend.wrapping_div(divisor), call.reply);
            }
            FN_FAIL => {
                let reason = Str::unpack(call.args)?;
                return Err(GenericException::new(reason, "\tat counter service\n").into());
            }
            FN_LIVE_OBJECTS => Int64::pack(&(call.objects.len() as i64), call.reply),
            other => {
                return Err(GenericException::new(format!("unknown function {other}"), "").into())
            }
        }
        Ok(())
    }
}

/// Client-side stand-in for a remote counter.
#[derive(Debug)]
pub struct CounterProxy {
    remote: RemoteRef,
}

impl CounterProxy {
    /// Ask the peer for a fresh counter starting at `start`.
    pub fn create(client: &Arc<Client>, start: i64) -> Result<Arc<CounterProxy>> {
        let id: ObjectId =
            client.call_with::<ObjRef>(FN_NEW_COUNTER, |args| Int64::pack(&start, args))?;
        client.proxy_or_insert_with(id, |remote| CounterProxy { remote })
    }

    pub fn id(&self) -> ObjectId {
        self.remote.id()
    }

    /// Add `delta`; returns the new total.
    pub fn add(&self, delta: i64) -> Result<i64> {
        let id = self.id();
        self.remote.client().call_with::<Int64>(FN_ADD, |args| {
            ObjRef::pack(&id, args);
            Int64::pack(&delta, args);
        })
    }

    pub fn get(&self) -> Result<i64> {
        let id = self.id();
        self.remote
            .client()
            .call_with::<Int64>(FN_GET, |args| ObjRef::pack(&id, args))
    }
}

/// `divide` on the peer.
pub fn divide(client: &Client, dividend: i64, divisor: i64) -> Result<i64> {
    client.call_with::<Int64>(FN_DIVIDE, |args| {
        Int64::pack(&dividend, args);
        Int64::pack(&divisor, args);
    })
}

/// `fail` on the peer; only ever returns an error.
pub fn fail(client: &Client, reason: &str) -> Result<()> {
    client.call(FN_FAIL, None, |args| Str::pack(&reason.to_owned(), args))
}

/// Number of objects the peer currently exposes on this session.
pub fn live_objects(client: &Client) -> Result<i64> {
    client.call_with::<Int64>(FN_LIVE_OBJECTS, |_| {})
}

#[cfg(all(test, unix))]
mod tests {
    use std::thread;
    use std::time::Duration;

    use objwire_frame::FrameConfig;
    use objwire_protocol::{serve_stream, ClientConfig, RemoteFault, RpcError};
    use objwire_transport::IpcStream;

    use super::*;

    fn session() -> (Arc<Client>, thread::JoinHandle<Result<()>>) {
        let (left, right) = IpcStream::pair().unwrap();
        let frame = FrameConfig::default().with_poll_interval(Duration::from_millis(10));
        let serving = {
            let frame = frame.clone();
            thread::spawn(move || serve_stream(right, CounterService::handler(), frame, 0))
        };
        let config = ClientConfig::default()
            .with_call_timeout(Some(Duration::from_secs(5)))
            .with_frame_config(frame);
        let client = Client::from_stream(left, exceptions(), config).unwrap();
        (Arc::new(client), serving)
    }

    #[test]
    fn counter_round_trip() {
        let (client, _serving) = session();
        let counter = CounterProxy::create(&client, 40).unwrap();
        assert_eq!(counter.add(2).unwrap(), 42);
        assert_eq!(counter.get().unwrap(), 42);
    }

    #[test]
    fn divide_by_zero_is_typed() {
        let (client, _serving) = session();
        assert_eq!(divide(&client, 12, 4).unwrap(), 3);

        match divide(&client, 12, 0).unwrap_err() {
            RpcError::Remote(fault) => {
                assert_eq!(
                    fault.packed::<DivideByZero>(),
                    Some(&DivideByZero { dividend: 12 })
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn fail_is_generic() {
        let (client, _serving) = session();
        match fail(&client, "on purpose").unwrap_err() {
            RpcError::Remote(RemoteFault::Generic(exc)) => assert_eq!(exc.message, "on purpose"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn dropped_proxy_releases_counter() {
        let (client, _serving) = session();
        let counter = CounterProxy::create(&client, 0).unwrap();
        assert_eq!(live_objects(&client).unwrap(), 1);

        drop(counter);
        assert_eq!(live_objects(&client).unwrap(), 0);
    }

    #[test]
    fn quit_ends_session_cleanly() {
        let (client, serving) = session();
        client.ping("bye").unwrap();
        client.quit().unwrap();
        assert!(serving.join().unwrap().is_ok());
    }
}
