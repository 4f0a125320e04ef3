//! Value decoders - wire form back to typed values.
//!
//! Decoding is a direct tag-to-decoder map with no fallback chain: a tag
//! either has a decoder or the value is undecodable. Reference tags split
//! by ownership. Tags for peer-owned objects (OBJECT and the collection
//! tags) bind a fresh [`RemoteObject`] handle through the session's
//! [`RefBinder`]; the PROXY tag hands one of our own ids back, so it
//! resolves against the local registry instead.
//!
//! Control tags never reach the decoder table. A frame consisting of
//! markers is interpreted structurally by the dispatcher, and a control
//! tag in a value position is a protocol violation.

use std::collections::HashMap;

use crate::error::{ObjwireError, Result};
use crate::object::{LocalProxy, RemoteObject};
use crate::protocol::{tag, ObjectId, RefKind, TaggedValue};
use crate::registry::ObjectRegistry;

use super::value::Value;
use super::Codec;

/// Binds an inbound peer-owned reference to a live handle.
///
/// Implemented by the session, which supplies the connection owner and
/// finalizer wiring the handle needs for release-on-drop.
pub trait RefBinder: Send + Sync {
    /// Wrap a peer-owned id into a handle.
    fn bind(&self, id: ObjectId, kind: RefKind) -> Result<RemoteObject>;
}

/// State a decoder may need while decoding.
pub struct DecodeContext<'a> {
    /// Registry holding the local objects PROXY ids resolve to.
    pub registry: &'a ObjectRegistry,
    /// Binder for peer-owned reference ids.
    pub binder: &'a dyn RefBinder,
    codec: &'a Codec,
}

impl<'a> DecodeContext<'a> {
    pub(crate) fn new(
        registry: &'a ObjectRegistry,
        binder: &'a dyn RefBinder,
        codec: &'a Codec,
    ) -> Self {
        Self {
            registry,
            binder,
            codec,
        }
    }

    /// Decode a complete tagged value nested inside another payload.
    ///
    /// The payload must hold exactly one value; trailing bytes are a
    /// protocol violation.
    pub fn decode_nested(&self, payload: &[u8]) -> Result<Value> {
        self.codec.decode_nested(payload, self.registry, self.binder)
    }
}

/// Converts wire values of one tag back to typed values.
pub trait Decoder: Send + Sync + 'static {
    /// Decode `value`. The payload must be consumed exactly.
    fn decode(&self, value: &TaggedValue, ctx: &DecodeContext<'_>) -> Result<Value>;
}

/// Decoder table: one decoder per tag.
pub struct DecoderRegistry {
    by_tag: HashMap<i16, Box<dyn Decoder>>,
}

impl DecoderRegistry {
    /// Table with all builtin decoders installed.
    pub fn standard() -> Self {
        let mut registry = Self {
            by_tag: HashMap::new(),
        };
        registry.install(tag::NULL, Box::new(NullDecoder));
        registry.install(tag::BOOLEAN, Box::new(BoolDecoder));
        registry.install(tag::INTEGER, Box::new(IntDecoder));
        registry.install(tag::LONG, Box::new(LongDecoder));
        registry.install(tag::DOUBLE, Box::new(DoubleDecoder));
        registry.install(tag::DECIMAL, Box::new(DecimalDecoder));
        registry.install(tag::STRING, Box::new(StringDecoder));
        registry.install(tag::BYTES, Box::new(BinaryDecoder));
        for ref_tag in [
            tag::OBJECT,
            tag::LIST,
            tag::MAP,
            tag::SET,
            tag::ARRAY,
            tag::ITERATOR,
        ] {
            registry.install(ref_tag, Box::new(ReferenceDecoder));
        }
        registry.install(tag::PROXY, Box::new(HandBackDecoder));
        registry.install(tag::EXCEPTION, Box::new(ExceptionDecoder));
        registry
    }

    /// Install the decoder for a tag, replacing any existing one.
    pub(crate) fn install(&mut self, tag: i16, decoder: Box<dyn Decoder>) {
        self.by_tag.insert(tag, decoder);
    }

    /// Decode one value.
    pub fn decode(&self, value: &TaggedValue, ctx: &DecodeContext<'_>) -> Result<Value> {
        self.by_tag
            .get(&value.tag())
            .ok_or(ObjwireError::UnknownTag(value.tag()))?
            .decode(value, ctx)
    }
}

struct NullDecoder;

impl Decoder for NullDecoder {
    fn decode(&self, _value: &TaggedValue, _ctx: &DecodeContext<'_>) -> Result<Value> {
        Ok(Value::Null)
    }
}

struct BoolDecoder;

impl Decoder for BoolDecoder {
    fn decode(&self, value: &TaggedValue, _ctx: &DecodeContext<'_>) -> Result<Value> {
        Ok(Value::Bool(value.as_bool()?))
    }
}

struct IntDecoder;

impl Decoder for IntDecoder {
    fn decode(&self, value: &TaggedValue, _ctx: &DecodeContext<'_>) -> Result<Value> {
        Ok(Value::Int(i64::from(value.as_i32()?)))
    }
}

struct LongDecoder;

impl Decoder for LongDecoder {
    fn decode(&self, value: &TaggedValue, _ctx: &DecodeContext<'_>) -> Result<Value> {
        Ok(Value::Int(value.as_i64()?))
    }
}

struct DoubleDecoder;

impl Decoder for DoubleDecoder {
    fn decode(&self, value: &TaggedValue, _ctx: &DecodeContext<'_>) -> Result<Value> {
        Ok(Value::Double(value.as_f64()?))
    }
}

struct DecimalDecoder;

impl Decoder for DecimalDecoder {
    fn decode(&self, value: &TaggedValue, _ctx: &DecodeContext<'_>) -> Result<Value> {
        Ok(Value::Decimal(value.as_str()?.to_string()))
    }
}

struct StringDecoder;

impl Decoder for StringDecoder {
    fn decode(&self, value: &TaggedValue, _ctx: &DecodeContext<'_>) -> Result<Value> {
        Ok(Value::Str(value.as_str()?.to_string()))
    }
}

struct BinaryDecoder;

impl Decoder for BinaryDecoder {
    fn decode(&self, value: &TaggedValue, _ctx: &DecodeContext<'_>) -> Result<Value> {
        // Zero-copy: the payload already is a refcounted slice.
        Ok(Value::Binary(value.payload_bytes()))
    }
}

/// Peer-owned reference: bind a handle that releases on drop.
struct ReferenceDecoder;

impl Decoder for ReferenceDecoder {
    fn decode(&self, value: &TaggedValue, ctx: &DecodeContext<'_>) -> Result<Value> {
        let kind = RefKind::from_tag(value.tag()).ok_or_else(|| {
            ObjwireError::Protocol(format!("Tag {} is not a reference tag", value.tag()))
        })?;
        let handle = ctx.binder.bind(value.as_object_id()?, kind)?;
        Ok(Value::Ref(handle))
    }
}

/// One of our own ids handed back: resolve the live local object.
struct HandBackDecoder;

impl Decoder for HandBackDecoder {
    fn decode(&self, value: &TaggedValue, ctx: &DecodeContext<'_>) -> Result<Value> {
        let id = value.as_object_id()?;
        let obj = ctx.registry.get(id)?;
        Ok(Value::Proxy(LocalProxy::registered(obj, id)))
    }
}

/// Wrapped error detail: decode the nested value transparently.
struct ExceptionDecoder;

impl Decoder for ExceptionDecoder {
    fn decode(&self, value: &TaggedValue, ctx: &DecodeContext<'_>) -> Result<Value> {
        ctx.decode_nested(value.payload())
    }
}
