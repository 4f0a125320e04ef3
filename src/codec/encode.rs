//! Value encoders - typed values to wire form.
//!
//! Encoding is table-driven: each [`ValueKind`] has a primary encoder,
//! selected in one lookup. An encoder may decline its value by returning
//! `Ok(None)`, which falls through to the chain of demoted encoders (a
//! registered extension pushes the builtin it replaces onto the chain).
//! A value no encoder accepts is an [`ObjwireError::Unencodable`].

use std::collections::HashMap;

use crate::error::{ObjwireError, Result};
use crate::protocol::{RefKind, TaggedValue};
use crate::registry::ObjectRegistry;

use super::value::{Value, ValueKind};

/// State an encoder may need while encoding.
pub struct EncodeContext<'a> {
    /// Registry that local proxies register into on first crossing.
    pub registry: &'a ObjectRegistry,
}

/// Converts values of one kind to their wire form.
pub trait Encoder: Send + Sync + 'static {
    /// Encode `value`, or return `Ok(None)` to pass it along the chain.
    fn encode(&self, value: &Value, ctx: &EncodeContext<'_>) -> Result<Option<TaggedValue>>;
}

/// Encoder table with a fast path per kind and a fallback chain.
pub struct EncoderRegistry {
    by_kind: HashMap<ValueKind, Box<dyn Encoder>>,
    chain: Vec<Box<dyn Encoder>>,
}

impl EncoderRegistry {
    /// Table with all builtin encoders installed.
    pub fn standard() -> Self {
        let mut registry = Self {
            by_kind: HashMap::new(),
            chain: Vec::new(),
        };
        registry.install(ValueKind::Null, Box::new(NullEncoder));
        registry.install(ValueKind::Bool, Box::new(BoolEncoder));
        registry.install(ValueKind::Int, Box::new(IntEncoder));
        registry.install(ValueKind::Double, Box::new(DoubleEncoder));
        registry.install(ValueKind::Decimal, Box::new(DecimalEncoder));
        registry.install(ValueKind::Str, Box::new(StringEncoder));
        registry.install(ValueKind::Binary, Box::new(BinaryEncoder));
        registry.install(ValueKind::Proxy, Box::new(LocalProxyEncoder));
        registry.install(ValueKind::Ref, Box::new(RemoteRefEncoder));
        registry
    }

    /// Install an encoder as the primary for `kind`. The encoder it
    /// displaces joins the fallback chain, so an extension that declines
    /// still falls back to the builtin behavior.
    pub(crate) fn install(&mut self, kind: ValueKind, encoder: Box<dyn Encoder>) {
        if let Some(displaced) = self.by_kind.insert(kind, encoder) {
            self.chain.push(displaced);
        }
    }

    /// Encode one value.
    pub fn encode(&self, value: &Value, ctx: &EncodeContext<'_>) -> Result<TaggedValue> {
        if let Some(encoder) = self.by_kind.get(&value.kind()) {
            if let Some(encoded) = encoder.encode(value, ctx)? {
                return Ok(encoded);
            }
        }
        for encoder in &self.chain {
            if let Some(encoded) = encoder.encode(value, ctx)? {
                return Ok(encoded);
            }
        }
        Err(ObjwireError::Unencodable(value.kind().name()))
    }
}

struct NullEncoder;

impl Encoder for NullEncoder {
    fn encode(&self, value: &Value, _ctx: &EncodeContext<'_>) -> Result<Option<TaggedValue>> {
        match value {
            Value::Null => Ok(Some(TaggedValue::null())),
            _ => Ok(None),
        }
    }
}

struct BoolEncoder;

impl Encoder for BoolEncoder {
    fn encode(&self, value: &Value, _ctx: &EncodeContext<'_>) -> Result<Option<TaggedValue>> {
        match value {
            Value::Bool(b) => Ok(Some(TaggedValue::bool_value(*b))),
            _ => Ok(None),
        }
    }
}

struct IntEncoder;

impl Encoder for IntEncoder {
    fn encode(&self, value: &Value, _ctx: &EncodeContext<'_>) -> Result<Option<TaggedValue>> {
        match value {
            Value::Int(n) => Ok(Some(TaggedValue::int(*n))),
            _ => Ok(None),
        }
    }
}

struct DoubleEncoder;

impl Encoder for DoubleEncoder {
    fn encode(&self, value: &Value, _ctx: &EncodeContext<'_>) -> Result<Option<TaggedValue>> {
        match value {
            Value::Double(d) => Ok(Some(TaggedValue::double(*d))),
            _ => Ok(None),
        }
    }
}

struct DecimalEncoder;

impl Encoder for DecimalEncoder {
    fn encode(&self, value: &Value, _ctx: &EncodeContext<'_>) -> Result<Option<TaggedValue>> {
        match value {
            Value::Decimal(text) => Ok(Some(TaggedValue::decimal(text))),
            _ => Ok(None),
        }
    }
}

struct StringEncoder;

impl Encoder for StringEncoder {
    fn encode(&self, value: &Value, _ctx: &EncodeContext<'_>) -> Result<Option<TaggedValue>> {
        match value {
            Value::Str(s) => Ok(Some(TaggedValue::string(s))),
            _ => Ok(None),
        }
    }
}

struct BinaryEncoder;

impl Encoder for BinaryEncoder {
    fn encode(&self, value: &Value, _ctx: &EncodeContext<'_>) -> Result<Option<TaggedValue>> {
        match value {
            Value::Binary(data) => Ok(Some(TaggedValue::binary(data.clone()))),
            _ => Ok(None),
        }
    }
}

/// Local object going out by reference: register it (first crossing only)
/// and send the id under the sender-owned OBJECT tag.
struct LocalProxyEncoder;

impl Encoder for LocalProxyEncoder {
    fn encode(&self, value: &Value, ctx: &EncodeContext<'_>) -> Result<Option<TaggedValue>> {
        match value {
            Value::Proxy(proxy) => {
                let id = proxy.ensure_id(ctx.registry);
                Ok(Some(TaggedValue::reference(RefKind::Object, id)))
            }
            _ => Ok(None),
        }
    }
}

/// Peer-owned handle going back to its owner: hand the id back under the
/// PROXY tag so the receiver resolves it in its own registry.
struct RemoteRefEncoder;

impl Encoder for RemoteRefEncoder {
    fn encode(&self, value: &Value, _ctx: &EncodeContext<'_>) -> Result<Option<TaggedValue>> {
        match value {
            Value::Ref(handle) => Ok(Some(TaggedValue::hand_back(handle.id()))),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::CallContext;
    use crate::object::{BoxFuture, LocalProxy, ProxyObject, RemoteObject};
    use crate::protocol::{tag, ObjectId};
    use std::sync::Arc;

    struct Nop;

    impl ProxyObject for Nop {
        fn invoke<'a>(
            &'a self,
            _member: &'a str,
            _args: Vec<Value>,
            _ctx: CallContext<'a>,
        ) -> BoxFuture<'a, Result<Value>> {
            Box::pin(async { Ok(Value::Null) })
        }
    }

    fn encode_one(value: &Value) -> Result<TaggedValue> {
        let registry = ObjectRegistry::new();
        let ctx = EncodeContext {
            registry: &registry,
        };
        EncoderRegistry::standard().encode(value, &ctx)
    }

    #[test]
    fn test_scalars_take_their_builtin_tags() {
        assert_eq!(encode_one(&Value::Null).unwrap().tag(), tag::NULL);
        assert_eq!(encode_one(&Value::from(true)).unwrap().tag(), tag::BOOLEAN);
        assert_eq!(encode_one(&Value::from(1i64)).unwrap().tag(), tag::INTEGER);
        assert_eq!(encode_one(&Value::from(1.5)).unwrap().tag(), tag::DOUBLE);
        assert_eq!(
            encode_one(&Value::Decimal("10.25".into())).unwrap().tag(),
            tag::DECIMAL
        );
        assert_eq!(encode_one(&Value::from("hi")).unwrap().tag(), tag::STRING);
        assert_eq!(
            encode_one(&Value::from(vec![1u8, 2])).unwrap().tag(),
            tag::BYTES
        );
    }

    #[test]
    fn test_proxy_registers_and_reuses_id() {
        let registry = ObjectRegistry::new();
        let ctx = EncodeContext {
            registry: &registry,
        };
        let encoders = EncoderRegistry::standard();
        let proxy = Value::Proxy(LocalProxy::new(Arc::new(Nop)));

        let first = encoders.encode(&proxy, &ctx).unwrap();
        let second = encoders.encode(&proxy, &ctx).unwrap();

        assert_eq!(first.tag(), tag::OBJECT);
        assert_eq!(first.as_object_id().unwrap(), second.as_object_id().unwrap());
        assert_eq!(registry.size(), 1);
    }

    #[test]
    fn test_remote_handle_is_handed_back() {
        let handle = RemoteObject::sentinel(ObjectId::new(-1));
        let encoded = encode_one(&Value::Ref(handle)).unwrap();
        assert_eq!(encoded.tag(), tag::PROXY);
        assert_eq!(encoded.as_object_id().unwrap(), ObjectId::new(-1));
    }

    #[test]
    fn test_displaced_encoder_still_reachable() {
        struct DeclineStrings;

        impl Encoder for DeclineStrings {
            fn encode(
                &self,
                _value: &Value,
                _ctx: &EncodeContext<'_>,
            ) -> Result<Option<TaggedValue>> {
                Ok(None)
            }
        }

        let mut encoders = EncoderRegistry::standard();
        encoders.install(ValueKind::Str, Box::new(DeclineStrings));

        let registry = ObjectRegistry::new();
        let ctx = EncodeContext {
            registry: &registry,
        };
        let encoded = encoders.encode(&Value::from("still works"), &ctx).unwrap();
        assert_eq!(encoded.tag(), tag::STRING);
    }
}
