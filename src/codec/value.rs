//! Bridge value model.
//!
//! [`Value`] is the typed form that call arguments and return values take
//! on either side of the wire. Scalars travel by copy; objects travel by
//! reference, either as a handle to something the peer owns
//! ([`Value::Ref`]) or as a local object offered to the peer
//! ([`Value::Proxy`]).
//!
//! # Example
//!
//! ```
//! use objwire::Value;
//!
//! let v = Value::from(42i64);
//! assert_eq!(v.as_i64(), Some(42));
//! assert!(Value::Null.is_null());
//! assert_eq!(v.kind().name(), "integer");
//! ```

use bytes::Bytes;

use crate::object::{LocalProxy, RemoteObject};

/// A value crossing the bridge in either direction.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absent value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Integer, up to 64 bits. Narrow values travel in 4 bytes.
    Int(i64),
    /// IEEE 754 double, NaN and infinities included.
    Double(f64),
    /// Arbitrary-precision decimal in its string rendering.
    Decimal(String),
    /// UTF-8 string.
    Str(String),
    /// Opaque byte payload.
    Binary(Bytes),
    /// Handle to an object the peer owns.
    Ref(RemoteObject),
    /// Local object offered to the peer by reference.
    Proxy(LocalProxy),
}

/// Discriminant of a [`Value`], used to select encoders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Null,
    Bool,
    Int,
    Double,
    Decimal,
    Str,
    Binary,
    Ref,
    Proxy,
}

impl ValueKind {
    /// Human-readable kind name for error messages.
    pub fn name(&self) -> &'static str {
        match self {
            ValueKind::Null => "null",
            ValueKind::Bool => "boolean",
            ValueKind::Int => "integer",
            ValueKind::Double => "double",
            ValueKind::Decimal => "decimal",
            ValueKind::Str => "string",
            ValueKind::Binary => "binary",
            ValueKind::Ref => "remote reference",
            ValueKind::Proxy => "proxy",
        }
    }
}

impl Value {
    /// The discriminant of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Double(_) => ValueKind::Double,
            Value::Decimal(_) => ValueKind::Decimal,
            Value::Str(_) => ValueKind::Str,
            Value::Binary(_) => ValueKind::Binary,
            Value::Ref(_) => ValueKind::Ref,
            Value::Proxy(_) => ValueKind::Proxy,
        }
    }

    /// True for [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Boolean payload, if this is a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer payload, if this is an integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Double payload, if this is a double.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(d) => Some(*d),
            _ => None,
        }
    }

    /// String payload, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Byte payload, if this is binary.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Binary(b) => Some(b.as_ref()),
            _ => None,
        }
    }

    /// Remote handle, if this is a reference to a peer-owned object.
    pub fn as_remote(&self) -> Option<&RemoteObject> {
        match self {
            Value::Ref(r) => Some(r),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Double(d)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Binary(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Binary(Bytes::from(b))
    }
}

impl From<RemoteObject> for Value {
    fn from(r: RemoteObject) -> Self {
        Value::Ref(r)
    }
}

impl From<LocalProxy> for Value {
    fn from(p: LocalProxy) -> Self {
        Value::Proxy(p)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        match opt {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}
