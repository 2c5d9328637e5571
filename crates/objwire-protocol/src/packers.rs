//! Value codecs for request arguments and reply payloads.
//!
//! All multi-byte values are big-endian. Strings and buffers carry an i32
//! length prefix, lists an i32 element count.

use std::any::Any;
use std::marker::PhantomData;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::CodecError;
use crate::handles::ObjectId;

/// Encodes and decodes one kind of value.
///
/// Packers are zero-sized markers; the item type is what travels.
pub trait Packer {
    type Item;

    fn pack(item: &Self::Item, dst: &mut BytesMut);

    fn unpack(src: &mut Bytes) -> Result<Self::Item, CodecError>;
}

fn need(src: &Bytes, needed: usize) -> Result<(), CodecError> {
    if src.remaining() < needed {
        return Err(CodecError::Truncated {
            needed,
            remaining: src.remaining(),
        });
    }
    Ok(())
}

fn length_prefix(src: &mut Bytes) -> Result<usize, CodecError> {
    need(src, 4)?;
    let len = src.get_i32();
    usize::try_from(len).map_err(|_| CodecError::InvalidLength(len))
}

fn put_length(len: usize, dst: &mut BytesMut) {
    // Frames are capped well below i32::MAX.
    dst.put_i32(len as i32);
}

macro_rules! fixed_width_packer {
    ($(#[$doc:meta])* $name:ident, $item:ty, $size:expr, $put:ident, $get:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $name;

        impl Packer for $name {
            type Item = $item;

            fn pack(item: &$item, dst: &mut BytesMut) {
                dst.$put(*item);
            }

            fn unpack(src: &mut Bytes) -> Result<$item, CodecError> {
                need(src, $size)?;
                Ok(src.$get())
            }
        }
    };
}

fixed_width_packer!(
    /// Signed byte; also carries command and reply codes.
    Int8, i8, 1, put_i8, get_i8
);
fixed_width_packer!(Int16, i16, 2, put_i16, get_i16);
fixed_width_packer!(Int32, i32, 4, put_i32, get_i32);
fixed_width_packer!(Int64, i64, 8, put_i64, get_i64);
fixed_width_packer!(
    /// IEEE-754 double.
    Float64, f64, 8, put_f64, get_f64
);
fixed_width_packer!(
    /// Remote object handle, an Int64 on the wire.
    ObjRef, ObjectId, 8, put_i64, get_i64
);

/// One byte; any non-zero value decodes as `true`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Bool;

impl Packer for Bool {
    type Item = bool;

    fn pack(item: &bool, dst: &mut BytesMut) {
        dst.put_u8(u8::from(*item));
    }

    fn unpack(src: &mut Bytes) -> Result<bool, CodecError> {
        need(src, 1)?;
        Ok(src.get_u8() != 0)
    }
}

/// UTF-8 text with an i32 byte-length prefix.
#[derive(Debug, Clone, Copy, Default)]
pub struct Str;

impl Packer for Str {
    type Item = String;

    fn pack(item: &String, dst: &mut BytesMut) {
        put_length(item.len(), dst);
        dst.put_slice(item.as_bytes());
    }

    fn unpack(src: &mut Bytes) -> Result<String, CodecError> {
        let raw = Buffer::unpack(src)?;
        String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }
}

/// Raw bytes with an i32 length prefix.
#[derive(Debug, Clone, Copy, Default)]
pub struct Buffer;

impl Packer for Buffer {
    type Item = Bytes;

    fn pack(item: &Bytes, dst: &mut BytesMut) {
        put_length(item.len(), dst);
        dst.put_slice(item);
    }

    fn unpack(src: &mut Bytes) -> Result<Bytes, CodecError> {
        let len = length_prefix(src)?;
        need(src, len)?;
        Ok(src.split_to(len))
    }
}

/// Homogeneous list with an i32 element count.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListOf<P>(PhantomData<P>);

impl<P: Packer> Packer for ListOf<P> {
    type Item = Vec<P::Item>;

    fn pack(items: &Vec<P::Item>, dst: &mut BytesMut) {
        put_length(items.len(), dst);
        for item in items {
            P::pack(item, dst);
        }
    }

    fn unpack(src: &mut Bytes) -> Result<Vec<P::Item>, CodecError> {
        let count = length_prefix(src)?;
        // Every element takes at least one byte.
        need(src, count)?;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(P::unpack(src)?);
        }
        Ok(items)
    }
}

/// A decoded reply value whose concrete type the caller recovers by downcast.
pub type AnyValue = Box<dyn Any + Send>;

/// Decodes a success reply's value into an [`AnyValue`].
pub type ResultDecoder = fn(&mut Bytes) -> Result<AnyValue, CodecError>;

/// Type-erased decoder for packer `P`, to register with an outgoing call.
pub fn result_decoder<P>() -> ResultDecoder
where
    P: Packer,
    P::Item: Send + 'static,
{
    decode_any::<P>
}

fn decode_any<P>(src: &mut Bytes) -> Result<AnyValue, CodecError>
where
    P: Packer,
    P::Item: Send + 'static,
{
    let value = P::unpack(src)?;
    Ok(Box::new(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded<P: Packer>(item: &P::Item) -> Bytes {
        let mut dst = BytesMut::new();
        P::pack(item, &mut dst);
        dst.freeze()
    }

    #[test]
    fn integers_are_big_endian() {
        assert_eq!(encoded::<Int16>(&0x0102).as_ref(), &[0x01, 0x02]);
        assert_eq!(encoded::<Int32>(&-2).as_ref(), &[0xFF, 0xFF, 0xFF, 0xFE]);
        assert_eq!(
            encoded::<Int64>(&1).as_ref(),
            &[0, 0, 0, 0, 0, 0, 0, 1]
        );
        assert_eq!(encoded::<Int8>(&-1).as_ref(), &[0xFF]);
    }

    #[test]
    fn string_layout_is_length_then_utf8() {
        let wire = encoded::<Str>(&"héllo".to_string());
        assert_eq!(&wire[..4], &[0, 0, 0, 6]);
        assert_eq!(&wire[4..], "héllo".as_bytes());

        let mut src = wire;
        assert_eq!(Str::unpack(&mut src).unwrap(), "héllo");
        assert!(src.is_empty());
    }

    #[test]
    fn values_decode_in_sequence() {
        let mut dst = BytesMut::new();
        Int8::pack(&1, &mut dst);
        Int32::pack(&77, &mut dst);
        ObjRef::pack(&-1, &mut dst);
        Bool::pack(&true, &mut dst);
        Float64::pack(&2.5, &mut dst);
        let mut src = dst.freeze();

        assert_eq!(Int8::unpack(&mut src).unwrap(), 1);
        assert_eq!(Int32::unpack(&mut src).unwrap(), 77);
        assert_eq!(ObjRef::unpack(&mut src).unwrap(), -1);
        assert!(Bool::unpack(&mut src).unwrap());
        assert_eq!(Float64::unpack(&mut src).unwrap(), 2.5);
        assert!(src.is_empty());
    }

    #[test]
    fn truncated_values_are_rejected() {
        let mut src = Bytes::from_static(&[0, 0, 1]);
        assert_eq!(
            Int32::unpack(&mut src),
            Err(CodecError::Truncated {
                needed: 4,
                remaining: 3
            })
        );

        let mut src = Bytes::from_static(&[0, 0, 0, 9, b'a']);
        assert!(matches!(
            Str::unpack(&mut src),
            Err(CodecError::Truncated { needed: 9, .. })
        ));
    }

    #[test]
    fn negative_length_is_rejected() {
        let mut src = encoded::<Int32>(&-5);
        assert_eq!(Buffer::unpack(&mut src), Err(CodecError::InvalidLength(-5)));
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let mut src = encoded::<Buffer>(&Bytes::from_static(&[0xC3, 0x28]));
        assert_eq!(Str::unpack(&mut src), Err(CodecError::InvalidUtf8));
    }

    #[test]
    fn lists_carry_a_count() {
        let items = vec!["a".to_string(), "bc".to_string()];
        let mut src = encoded::<ListOf<Str>>(&items);
        assert_eq!(&src[..4], &[0, 0, 0, 2]);
        assert_eq!(ListOf::<Str>::unpack(&mut src).unwrap(), items);
    }

    #[test]
    fn list_count_larger_than_payload_is_rejected_early() {
        let mut src = encoded::<Int32>(&1_000_000);
        assert!(matches!(
            ListOf::<Int64>::unpack(&mut src),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn result_decoder_erases_the_item_type() {
        let decode = result_decoder::<Int64>();
        let value = decode(&mut encoded::<Int64>(&42)).unwrap();
        assert_eq!(value.downcast::<i64>().map(|v| *v).ok(), Some(42));
    }
}
