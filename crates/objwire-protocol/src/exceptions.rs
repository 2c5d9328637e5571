//! Remote exceptions: the two shapes a failed call can come back in.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use bytes::{Bytes, BytesMut};

use crate::error::CodecError;
use crate::packers::Packer;

/// A failure without a declared type: message plus the remote traceback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericException {
    pub message: String,
    pub traceback: String,
}

impl GenericException {
    pub fn new(message: impl Into<String>, traceback: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            traceback: traceback.into(),
        }
    }

    /// Describe `err`, using its chain of sources as the traceback.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut traceback = String::new();
        let mut source = err.source();
        while let Some(cause) = source {
            traceback.push_str("\tcaused by: ");
            traceback.push_str(&cause.to_string());
            traceback.push('\n');
            source = cause.source();
        }
        Self::new(err.to_string(), traceback)
    }
}

impl fmt::Display for GenericException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} with remote backtrace:\n{}\t------------------- end of remote traceback -------------------",
            self.message, self.traceback
        )
    }
}

impl std::error::Error for GenericException {}

/// A declared exception type that crosses the wire field by field.
///
/// Both sides agree on the class id and the field layout; the calling side
/// registers a decoder for each id in an [`ExceptionRegistry`].
pub trait PackedException: std::error::Error + Send + Sync + 'static {
    /// Wire id of this exception class.
    fn class_id(&self) -> i32;

    /// Append the exception's fields (without the class id).
    fn pack_fields(&self, dst: &mut BytesMut);

    /// Upcast used for downcasting on the calling side.
    fn as_any(&self) -> &dyn Any;
}

impl dyn PackedException {
    /// Borrow the concrete exception if it is a `T`.
    pub fn downcast_ref<T: PackedException>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn is<T: PackedException>(&self) -> bool {
        self.as_any().is::<T>()
    }
}

/// A remote call that raised, as delivered to the caller.
#[derive(Debug, thiserror::Error)]
pub enum RemoteFault {
    #[error("remote exception (class {class}): {0}", class = .0.class_id())]
    Packed(Box<dyn PackedException>),

    #[error("remote failure: {0}")]
    Generic(GenericException),
}

impl RemoteFault {
    /// Borrow the declared exception if it is a `T`.
    pub fn packed<T: PackedException>(&self) -> Option<&T> {
        match self {
            RemoteFault::Packed(exc) => exc.downcast_ref::<T>(),
            RemoteFault::Generic(_) => None,
        }
    }

    pub fn generic(&self) -> Option<&GenericException> {
        match self {
            RemoteFault::Generic(exc) => Some(exc),
            RemoteFault::Packed(_) => None,
        }
    }
}

/// Decodes one packed exception's fields; the class id is already consumed.
pub type PackedDecoder = fn(&mut Bytes) -> Result<Box<dyn PackedException>, CodecError>;

/// Maps class ids to the decoders of the exceptions a client understands.
#[derive(Clone, Default)]
pub struct ExceptionRegistry {
    decoders: HashMap<i32, PackedDecoder>,
}

impl ExceptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `decoder` for `class_id`, replacing any previous one.
    pub fn register(&mut self, class_id: i32, decoder: PackedDecoder) -> &mut Self {
        self.decoders.insert(class_id, decoder);
        self
    }

    /// Register an exception whose fields are decoded by packer `P`.
    pub fn register_packer<P>(&mut self, class_id: i32) -> &mut Self
    where
        P: Packer,
        P::Item: PackedException,
    {
        self.register(class_id, decode_packed::<P>)
    }

    /// Builder form of [`register_packer`](Self::register_packer).
    pub fn with_packer<P>(mut self, class_id: i32) -> Self
    where
        P: Packer,
        P::Item: PackedException,
    {
        self.register_packer::<P>(class_id);
        self
    }

    pub fn get(&self, class_id: i32) -> Option<PackedDecoder> {
        self.decoders.get(&class_id).copied()
    }

    pub fn contains(&self, class_id: i32) -> bool {
        self.decoders.contains_key(&class_id)
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}

impl fmt::Debug for ExceptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.decoders.keys().copied().collect();
        ids.sort_unstable();
        f.debug_struct("ExceptionRegistry")
            .field("class_ids", &ids)
            .finish()
    }
}

fn decode_packed<P>(src: &mut Bytes) -> Result<Box<dyn PackedException>, CodecError>
where
    P: Packer,
    P::Item: PackedException,
{
    let exception = P::unpack(src)?;
    Ok(Box::new(exception))
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;

    use super::*;
    use crate::packers::{Int32, Str};

    #[derive(Debug, thiserror::Error, PartialEq)]
    #[error("quota exceeded: {limit}")]
    struct QuotaExceeded {
        limit: i32,
    }

    impl PackedException for QuotaExceeded {
        fn class_id(&self) -> i32 {
            17
        }

        fn pack_fields(&self, dst: &mut BytesMut) {
            Int32::pack(&self.limit, dst);
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct QuotaExceededPacker;

    impl Packer for QuotaExceededPacker {
        type Item = QuotaExceeded;

        fn pack(item: &QuotaExceeded, dst: &mut BytesMut) {
            item.pack_fields(dst);
        }

        fn unpack(src: &mut Bytes) -> Result<QuotaExceeded, CodecError> {
            Ok(QuotaExceeded {
                limit: Int32::unpack(src)?,
            })
        }
    }

    #[test]
    fn generic_exception_renders_remote_backtrace() {
        let exc = GenericException::new("boom", "\tat handler\n");
        assert_eq!(
            exc.to_string(),
            "boom with remote backtrace:\n\tat handler\n\t------------------- end of remote traceback -------------------"
        );
    }

    #[test]
    fn from_error_walks_the_source_chain() {
        #[derive(Debug, thiserror::Error)]
        #[error("outer failure")]
        struct Outer(#[source] std::io::Error);

        let err = Outer(std::io::Error::other("disk gone"));
        let exc = GenericException::from_error(&err);
        assert_eq!(exc.message, "outer failure");
        assert_eq!(exc.traceback, "\tcaused by: disk gone\n");
    }

    #[test]
    fn registry_decodes_registered_classes() {
        let registry = ExceptionRegistry::new().with_packer::<QuotaExceededPacker>(17);
        assert!(registry.contains(17));
        assert!(registry.get(18).is_none());

        let mut fields = BytesMut::new();
        fields.put_i32(250);
        let decode = registry.get(17).unwrap();
        let exc = decode(&mut fields.freeze()).unwrap();

        assert_eq!(exc.class_id(), 17);
        assert!(exc.is::<QuotaExceeded>());
        assert_eq!(
            exc.downcast_ref::<QuotaExceeded>(),
            Some(&QuotaExceeded { limit: 250 })
        );
    }

    #[test]
    fn remote_fault_accessors() {
        let packed = RemoteFault::Packed(Box::new(QuotaExceeded { limit: 1 }));
        assert_eq!(packed.packed::<QuotaExceeded>().map(|e| e.limit), Some(1));
        assert!(packed.generic().is_none());
        assert_eq!(
            packed.to_string(),
            "remote exception (class 17): quota exceeded: 1"
        );

        let generic = RemoteFault::Generic(GenericException::new("nope", ""));
        assert!(generic.packed::<QuotaExceeded>().is_none());
        assert_eq!(generic.generic().map(|e| e.message.as_str()), Some("nope"));
    }

    #[test]
    fn strings_decode_through_registered_packers() {
        let mut registry = ExceptionRegistry::new();
        registry.register(3, |src| {
            let reason = Str::unpack(src)?;
            Ok(Box::new(GenericWrapper(reason)))
        });

        let mut fields = BytesMut::new();
        Str::pack(&"why".to_string(), &mut fields);
        let exc = (registry.get(3).unwrap())(&mut fields.freeze()).unwrap();
        assert_eq!(exc.to_string(), "wrapped: why");
    }

    #[derive(Debug, thiserror::Error)]
    #[error("wrapped: {0}")]
    struct GenericWrapper(String);

    impl PackedException for GenericWrapper {
        fn class_id(&self) -> i32 {
            3
        }

        fn pack_fields(&self, dst: &mut BytesMut) {
            Str::pack(&self.0, dst);
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }
}
