//! Type tags, payload shapes, command codes and wire identifiers.
//!
//! The tag space is partitioned by numeric range; the partition is part of
//! the protocol and must never change:
//!
//! - `0..=9` primitives
//! - `10..=19` strings and byte arrays
//! - `20..=29` collection references
//! - `30..=39` object references
//! - `40..=49` framework control markers
//! - `< 0` registered extensions
//!
//! Reference tags are viewpoint-relative: `OBJECT` and the collection tags
//! carry an id allocated by the *sending* side, while `PROXY` hands an id
//! back to the side that allocated it. Each hop therefore flips the tag.

use std::collections::HashMap;
use std::fmt;

use crate::error::{ObjwireError, Result};

/// Type tag constants. All tags are `i16`, big-endian on the wire.
pub mod tag {
    /// Absent value. No payload.
    pub const NULL: i16 = 0;
    /// Boolean, 1 byte (0 or 1).
    pub const BOOLEAN: i16 = 1;
    /// 32-bit signed integer, 4 bytes BE.
    pub const INTEGER: i16 = 2;
    /// 64-bit signed integer, 8 bytes BE.
    pub const LONG: i16 = 3;
    /// 64-bit IEEE float, 8 bytes BE (bit pattern).
    pub const DOUBLE: i16 = 4;
    /// Arbitrary-precision decimal, length-prefixed UTF-8 text.
    pub const DECIMAL: i16 = 5;

    /// Length-prefixed UTF-8 string.
    pub const STRING: i16 = 10;
    /// Length-prefixed raw bytes.
    pub const BYTES: i16 = 11;

    /// Sender-owned list reference, 8-byte id.
    pub const LIST: i16 = 20;
    /// Sender-owned map reference, 8-byte id.
    pub const MAP: i16 = 21;
    /// Sender-owned set reference, 8-byte id.
    pub const SET: i16 = 22;
    /// Sender-owned array reference, 8-byte id.
    pub const ARRAY: i16 = 23;
    /// Sender-owned iterator reference, 8-byte id.
    pub const ITERATOR: i16 = 24;

    /// Sender-owned object reference, 8-byte id.
    pub const OBJECT: i16 = 30;
    /// Receiver-owned reference handed back to its allocator, 8-byte id.
    pub const PROXY: i16 = 31;

    /// Frame delimiter. No payload.
    pub const END: i16 = 40;
    /// Generic failure outcome. No payload.
    pub const ERROR: i16 = 41;
    /// Success outcome marker. No payload.
    pub const SUCCESS: i16 = 42;
    /// Response frame marker. No payload.
    pub const RETURN: i16 = 43;
    /// Command frame marker, 4-byte command code.
    pub const COMMAND: i16 = 44;
    /// Remote application error; payload is one complete nested tagged
    /// value, length-prefixed.
    pub const EXCEPTION: i16 = 45;

    /// Check whether a tag belongs to the primitive range.
    #[inline]
    pub fn is_primitive(tag: i16) -> bool {
        (0..=9).contains(&tag)
    }

    /// Check whether a tag is any reference kind (collection, object or
    /// hand-back).
    #[inline]
    pub fn is_reference(tag: i16) -> bool {
        (20..=39).contains(&tag)
    }

    /// Check whether a tag is a framework control marker.
    #[inline]
    pub fn is_control(tag: i16) -> bool {
        (40..=49).contains(&tag)
    }

    /// Check whether a tag is in the extension range.
    #[inline]
    pub fn is_extension(tag: i16) -> bool {
        tag < 0
    }
}

/// Wire shape of a tagged value's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// No payload bytes follow the tag.
    Empty,
    /// Exactly this many payload bytes follow the tag.
    Fixed(usize),
    /// A 4-byte BE length followed by that many payload bytes.
    LengthPrefixed,
}

/// Payload shape for a built-in tag, `None` for unknown tags.
pub fn builtin_shape(t: i16) -> Option<Shape> {
    match t {
        tag::NULL | tag::END | tag::ERROR | tag::SUCCESS | tag::RETURN => Some(Shape::Empty),
        tag::BOOLEAN => Some(Shape::Fixed(1)),
        tag::INTEGER | tag::COMMAND => Some(Shape::Fixed(4)),
        tag::LONG | tag::DOUBLE => Some(Shape::Fixed(8)),
        tag::DECIMAL | tag::STRING | tag::BYTES | tag::EXCEPTION => Some(Shape::LengthPrefixed),
        tag::LIST | tag::MAP | tag::SET | tag::ARRAY | tag::ITERATOR | tag::OBJECT | tag::PROXY => {
            Some(Shape::Fixed(8))
        }
        _ => None,
    }
}

/// Shape table: built-in tags plus registered extensions.
///
/// Assembled once before the first connection is opened and shared
/// immutably after; the scanner consults it to frame incoming values.
#[derive(Debug, Clone, Default)]
pub struct TagShapes {
    extensions: HashMap<i16, Shape>,
}

impl TagShapes {
    /// Shape table with only the built-in tags.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the payload shape of an extension tag.
    ///
    /// Extension tags must be negative and may only be registered once.
    pub fn register(&mut self, t: i16, shape: Shape) -> Result<()> {
        if !tag::is_extension(t) {
            return Err(ObjwireError::Protocol(format!(
                "Extension tags must be negative, got {}",
                t
            )));
        }
        if self.extensions.insert(t, shape).is_some() {
            return Err(ObjwireError::Protocol(format!(
                "Extension tag {} registered twice",
                t
            )));
        }
        Ok(())
    }

    /// Look up the shape for any tag, built-in or extension.
    pub fn lookup(&self, t: i16) -> Option<Shape> {
        builtin_shape(t).or_else(|| self.extensions.get(&t).copied())
    }
}

/// Command codes carried in a `COMMAND` value's 4-byte payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandCode {
    /// Invoke a member on a referenced object.
    Call,
    /// Drop a reference from the receiver's registry.
    Release,
    /// Present an authentication token.
    Auth,
    /// Orderly session teardown, targeted at the peer-server sentinel.
    Shutdown,
}

impl CommandCode {
    /// Wire value of this command code.
    pub fn as_i32(self) -> i32 {
        match self {
            CommandCode::Call => 1,
            CommandCode::Release => 2,
            CommandCode::Auth => 3,
            CommandCode::Shutdown => 4,
        }
    }

    /// Parse a wire value; `None` for unknown codes (the dispatcher answers
    /// those with an error outcome and keeps the connection alive).
    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            1 => Some(CommandCode::Call),
            2 => Some(CommandCode::Release),
            3 => Some(CommandCode::Auth),
            4 => Some(CommandCode::Shutdown),
            _ => None,
        }
    }
}

/// Kind of a remote reference, mapped 1:1 to the sender-owned tag range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefKind {
    Object,
    List,
    Map,
    Set,
    Array,
    Iterator,
}

impl RefKind {
    /// Sender-owned wire tag for this kind.
    pub fn tag(self) -> i16 {
        match self {
            RefKind::Object => tag::OBJECT,
            RefKind::List => tag::LIST,
            RefKind::Map => tag::MAP,
            RefKind::Set => tag::SET,
            RefKind::Array => tag::ARRAY,
            RefKind::Iterator => tag::ITERATOR,
        }
    }

    /// Kind for a sender-owned wire tag, `None` for anything else.
    pub fn from_tag(t: i16) -> Option<Self> {
        match t {
            tag::OBJECT => Some(RefKind::Object),
            tag::LIST => Some(RefKind::List),
            tag::MAP => Some(RefKind::Map),
            tag::SET => Some(RefKind::Set),
            tag::ARRAY => Some(RefKind::Array),
            tag::ITERATOR => Some(RefKind::Iterator),
            _ => None,
        }
    }
}

/// Identifier of an object in a reference registry.
///
/// Ids are allocated by the side that owns the object and are only
/// meaningful within the session that created them. Negative ids are
/// reserved sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(i64);

impl ObjectId {
    /// Construct an id from its raw wire value.
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    /// Raw wire value.
    pub const fn raw(self) -> i64 {
        self.0
    }

    /// Whether this is one of the reserved sentinel ids.
    pub const fn is_sentinel(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The first object either side exposes; resolved by the receiver to its
/// configured entry point.
pub const ENTRY_POINT_OBJECT_ID: ObjectId = ObjectId::new(-1);

/// The peer process itself; target of lifecycle commands.
pub const SERVER_OBJECT_ID: ObjectId = ObjectId::new(-2);

/// Process-unique connection identifier, used for diagnostics and for
/// asserting connection affinity of reentrant callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next process-unique id.
    pub fn next() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value.
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_ranges_are_disjoint() {
        assert!(tag::is_primitive(tag::NULL));
        assert!(tag::is_primitive(tag::DECIMAL));
        assert!(!tag::is_primitive(tag::STRING));

        assert!(tag::is_reference(tag::LIST));
        assert!(tag::is_reference(tag::OBJECT));
        assert!(tag::is_reference(tag::PROXY));
        assert!(!tag::is_reference(tag::END));

        assert!(tag::is_control(tag::END));
        assert!(tag::is_control(tag::EXCEPTION));
        assert!(!tag::is_control(tag::OBJECT));

        assert!(tag::is_extension(-1));
        assert!(!tag::is_extension(0));
    }

    #[test]
    fn test_builtin_shapes() {
        assert_eq!(builtin_shape(tag::NULL), Some(Shape::Empty));
        assert_eq!(builtin_shape(tag::BOOLEAN), Some(Shape::Fixed(1)));
        assert_eq!(builtin_shape(tag::INTEGER), Some(Shape::Fixed(4)));
        assert_eq!(builtin_shape(tag::LONG), Some(Shape::Fixed(8)));
        assert_eq!(builtin_shape(tag::STRING), Some(Shape::LengthPrefixed));
        assert_eq!(builtin_shape(tag::OBJECT), Some(Shape::Fixed(8)));
        assert_eq!(builtin_shape(tag::COMMAND), Some(Shape::Fixed(4)));
        assert_eq!(builtin_shape(tag::EXCEPTION), Some(Shape::LengthPrefixed));
        assert_eq!(builtin_shape(99), None);
        assert_eq!(builtin_shape(-1), None);
    }

    #[test]
    fn test_extension_shape_registration() {
        let mut shapes = TagShapes::new();
        shapes.register(-100, Shape::LengthPrefixed).unwrap();

        assert_eq!(shapes.lookup(-100), Some(Shape::LengthPrefixed));
        assert_eq!(shapes.lookup(tag::STRING), Some(Shape::LengthPrefixed));
        assert_eq!(shapes.lookup(-101), None);
    }

    #[test]
    fn test_extension_tag_must_be_negative() {
        let mut shapes = TagShapes::new();
        assert!(shapes.register(7, Shape::Empty).is_err());
        assert!(shapes.register(0, Shape::Empty).is_err());
        assert!(shapes.register(-7, Shape::Empty).is_ok());
    }

    #[test]
    fn test_extension_tag_registered_twice_rejected() {
        let mut shapes = TagShapes::new();
        shapes.register(-5, Shape::Fixed(2)).unwrap();
        assert!(shapes.register(-5, Shape::Fixed(2)).is_err());
    }

    #[test]
    fn test_command_code_roundtrip() {
        for code in [
            CommandCode::Call,
            CommandCode::Release,
            CommandCode::Auth,
            CommandCode::Shutdown,
        ] {
            assert_eq!(CommandCode::from_i32(code.as_i32()), Some(code));
        }
        assert_eq!(CommandCode::from_i32(0), None);
        assert_eq!(CommandCode::from_i32(99), None);
    }

    #[test]
    fn test_ref_kind_tag_roundtrip() {
        for kind in [
            RefKind::Object,
            RefKind::List,
            RefKind::Map,
            RefKind::Set,
            RefKind::Array,
            RefKind::Iterator,
        ] {
            assert_eq!(RefKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(RefKind::from_tag(tag::PROXY), None);
        assert_eq!(RefKind::from_tag(tag::STRING), None);
    }

    #[test]
    fn test_sentinel_ids() {
        assert!(ENTRY_POINT_OBJECT_ID.is_sentinel());
        assert!(SERVER_OBJECT_ID.is_sentinel());
        assert_ne!(ENTRY_POINT_OBJECT_ID, SERVER_OBJECT_ID);
        assert!(!ObjectId::new(1).is_sentinel());
        assert_eq!(ObjectId::new(42).raw(), 42);
    }

    #[test]
    fn test_connection_ids_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
    }
}
