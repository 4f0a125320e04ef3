//! Codec module - typed values to and from the wire.
//!
//! This module converts between [`Value`] and the tagged wire form:
//!
//! - [`EncoderRegistry`] - per-kind encoders with a fallback chain
//! - [`DecoderRegistry`] - direct tag-to-decoder map
//! - [`Codec`] - both registries plus the tag shape table and the
//!   error-tag set used to interpret response outcomes
//!
//! # Design
//!
//! Both registries are assembled once, before the codec is shared with
//! any connection, and are immutable afterwards. Extensions claim
//! negative tags at build time; builtin tags keep their meaning
//! everywhere, so two gateways only need to agree on the extensions they
//! both registered.
//!
//! # Example
//!
//! ```
//! use objwire::codec::Codec;
//! use objwire::protocol::tag;
//! use objwire::registry::ObjectRegistry;
//! use objwire::Value;
//!
//! let codec = Codec::standard();
//! let registry = ObjectRegistry::new();
//!
//! let encoded = codec.encode_value(&Value::from(7i64), &registry).unwrap();
//! assert_eq!(encoded.tag(), tag::INTEGER);
//! ```

mod decode;
mod encode;
mod value;

pub use decode::{DecodeContext, Decoder, DecoderRegistry, RefBinder};
pub use encode::{EncodeContext, Encoder, EncoderRegistry};
pub use value::{Value, ValueKind};

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{ObjwireError, Result};
use crate::protocol::{tag, ByteCursor, Frame, ObjectId, Shape, TagShapes, TaggedValue};
use crate::registry::ObjectRegistry;

/// A protocol extension claiming one negative tag.
pub struct Extension {
    /// The extension's tag. Must be negative.
    pub tag: i16,
    /// Payload shape, used by the frame scanner.
    pub shape: Shape,
    /// Decoder for inbound values with this tag.
    pub decoder: Box<dyn Decoder>,
    /// Optional encoder taking over a value kind. The builtin it
    /// displaces stays reachable through the fallback chain.
    pub encoder: Option<(ValueKind, Box<dyn Encoder>)>,
}

/// Everything needed to move values across one gateway's connections.
pub struct Codec {
    encoders: EncoderRegistry,
    decoders: DecoderRegistry,
    shapes: Arc<TagShapes>,
    error_tags: HashSet<i16>,
}

impl Codec {
    /// Codec with builtin tags only.
    pub fn standard() -> Self {
        Self {
            encoders: EncoderRegistry::standard(),
            decoders: DecoderRegistry::standard(),
            shapes: Arc::new(TagShapes::new()),
            error_tags: default_error_tags(),
        }
    }

    /// Codec with extensions installed and extra error tags recognized
    /// when interpreting response outcomes.
    ///
    /// Fails if an extension claims a non-negative or already-claimed
    /// tag.
    pub fn with_extensions(extensions: Vec<Extension>, error_tags: &[i16]) -> Result<Self> {
        let mut encoders = EncoderRegistry::standard();
        let mut decoders = DecoderRegistry::standard();
        let mut shapes = TagShapes::new();
        let mut errors = default_error_tags();

        for extension in extensions {
            shapes.register(extension.tag, extension.shape)?;
            decoders.install(extension.tag, extension.decoder);
            if let Some((kind, encoder)) = extension.encoder {
                encoders.install(kind, encoder);
            }
        }
        errors.extend(error_tags.iter().copied());

        Ok(Self {
            encoders,
            decoders,
            shapes: Arc::new(shapes),
            error_tags: errors,
        })
    }

    /// Shape table for scanners reading this codec's traffic.
    pub fn shapes(&self) -> Arc<TagShapes> {
        self.shapes.clone()
    }

    /// Encode one value to its wire form.
    pub fn encode_value(&self, value: &Value, registry: &ObjectRegistry) -> Result<TaggedValue> {
        let ctx = EncodeContext { registry };
        self.encoders.encode(value, &ctx)
    }

    /// Decode one wire value.
    pub fn decode_value(
        &self,
        value: &TaggedValue,
        registry: &ObjectRegistry,
        binder: &dyn RefBinder,
    ) -> Result<Value> {
        let ctx = DecodeContext::new(registry, binder, self);
        self.decoders.decode(value, &ctx)
    }

    /// Decode exactly one value nested inside a raw payload.
    pub(crate) fn decode_nested(
        &self,
        payload: &[u8],
        registry: &ObjectRegistry,
        binder: &dyn RefBinder,
    ) -> Result<Value> {
        let mut cur = ByteCursor::new(payload);
        let nested = TaggedValue::read_from(&mut cur, &self.shapes)?;
        cur.finish()?;
        self.decode_value(&nested, registry, binder)
    }

    /// Interpret a response frame for a call on `target.member`.
    ///
    /// The outcome tag is classified through the error-tag set: SUCCESS
    /// yields the decoded return value, ERROR maps to
    /// [`ObjwireError::CallFailed`], and any other recognized error tag
    /// has its payload decoded and surfaced as
    /// [`ObjwireError::RemoteException`].
    pub fn interpret_response(
        &self,
        frame: &Frame,
        registry: &ObjectRegistry,
        binder: &dyn RefBinder,
        target: ObjectId,
        member: &str,
    ) -> Result<Value> {
        match frame.values.first() {
            Some(v) if v.tag() == tag::RETURN => {}
            _ => {
                return Err(ObjwireError::Protocol(
                    "Response frame must begin with a return marker".to_string(),
                ))
            }
        }
        let outcome = frame.values.get(1).ok_or_else(|| {
            ObjwireError::Protocol("Response frame missing its outcome".to_string())
        })?;

        if outcome.tag() == tag::SUCCESS {
            let value = frame.values.get(2).ok_or_else(|| {
                ObjwireError::Protocol("Success outcome missing its value".to_string())
            })?;
            return self.decode_value(value, registry, binder);
        }

        if self.error_tags.contains(&outcome.tag()) {
            if outcome.tag() == tag::ERROR {
                return Err(ObjwireError::CallFailed {
                    target: target.to_string(),
                    member: member.to_string(),
                });
            }
            let detail = self.decode_value(outcome, registry, binder)?;
            return Err(ObjwireError::RemoteException {
                target: target.to_string(),
                member: member.to_string(),
                detail: detail_text(&detail),
            });
        }

        Err(ObjwireError::Protocol(format!(
            "Unexpected outcome tag {} in response",
            outcome.tag()
        )))
    }
}

fn default_error_tags() -> HashSet<i16> {
    [tag::ERROR, tag::EXCEPTION].into_iter().collect()
}

/// Render a decoded error payload for the error message.
fn detail_text(detail: &Value) -> String {
    match detail {
        Value::Str(s) => s.clone(),
        Value::Null => "unknown remote error".to_string(),
        other => format!("{:?}", other),
    }
}
