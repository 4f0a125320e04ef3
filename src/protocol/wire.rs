//! Tagged value encoding and decoding.
//!
//! Every value on the wire is a tag followed by a shape-dependent payload:
//! ```text
//! ┌──────────┬─────────────────┬──────────────┐
//! │ Tag      │ Length (opt.)   │ Payload      │
//! │ 2 bytes  │ 4 bytes         │ N bytes      │
//! │ int16 BE │ int32 BE, >= 0  │              │
//! └──────────┴─────────────────┴──────────────┘
//! ```
//! The length field is present only for `Shape::LengthPrefixed` tags;
//! `Shape::Fixed` payloads carry exactly their declared width and
//! `Shape::Empty` tags stand alone. All multi-byte integers are Big Endian.

use bytes::{BufMut, Bytes, BytesMut};

use super::tags::{builtin_shape, tag, CommandCode, ObjectId, RefKind, Shape, TagShapes};
use crate::error::{ObjwireError, Result};

/// Default maximum payload size for a single value (1 GB).
pub const DEFAULT_MAX_VALUE_SIZE: usize = 1_073_741_824;

/// Bounds-checked reader over a byte slice.
///
/// Decoders must consume their whole payload through a cursor and call
/// [`finish`](ByteCursor::finish); both under- and over-consumption are
/// protocol errors, never panics.
#[derive(Debug)]
pub struct ByteCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    /// Wrap a slice for reading.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(ObjwireError::Protocol(format!(
                "Truncated value: need {} bytes, have {}",
                n,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Read one byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Read a Big Endian i16.
    pub fn read_i16(&mut self) -> Result<i16> {
        let b = self.take(2)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    /// Read a Big Endian i32.
    pub fn read_i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a Big Endian i64.
    pub fn read_i64(&mut self) -> Result<i64> {
        let b = self.take(8)?;
        Ok(i64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Read a Big Endian f64 bit pattern.
    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_i64()? as u64))
    }

    /// Read exactly `n` raw bytes.
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    /// Assert the cursor consumed everything.
    pub fn finish(&self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(ObjwireError::Protocol(format!(
                "Value has {} trailing bytes",
                self.remaining()
            )));
        }
        Ok(())
    }
}

/// A single tag + payload unit, the atom of the wire protocol.
///
/// The payload excludes the tag and any length prefix; those are
/// reconstructed from the tag's [`Shape`] when writing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedValue {
    tag: i16,
    payload: Bytes,
}

impl TaggedValue {
    /// Build a value from a tag and raw payload bytes.
    pub fn new(tag: i16, payload: Bytes) -> Self {
        Self { tag, payload }
    }

    /// Build a payload-less value.
    pub fn empty(tag: i16) -> Self {
        Self {
            tag,
            payload: Bytes::new(),
        }
    }

    /// The NULL value.
    pub fn null() -> Self {
        Self::empty(tag::NULL)
    }

    /// A BOOLEAN value.
    pub fn bool_value(b: bool) -> Self {
        Self::new(tag::BOOLEAN, Bytes::copy_from_slice(&[u8::from(b)]))
    }

    /// An integer value, promoted by width: values inside the signed
    /// 32-bit range go out as 4-byte `INTEGER`, everything else as 8-byte
    /// `LONG`.
    ///
    /// # Example
    ///
    /// ```
    /// use objwire::protocol::{tag, TaggedValue};
    ///
    /// assert_eq!(TaggedValue::int(2147483647).tag(), tag::INTEGER);
    /// assert_eq!(TaggedValue::int(2147483648).tag(), tag::LONG);
    /// ```
    pub fn int(v: i64) -> Self {
        if let Ok(narrow) = i32::try_from(v) {
            Self::new(tag::INTEGER, Bytes::copy_from_slice(&narrow.to_be_bytes()))
        } else {
            Self::new(tag::LONG, Bytes::copy_from_slice(&v.to_be_bytes()))
        }
    }

    /// A DOUBLE value (IEEE 754 bit pattern).
    pub fn double(v: f64) -> Self {
        Self::new(tag::DOUBLE, Bytes::copy_from_slice(&v.to_bits().to_be_bytes()))
    }

    /// A DECIMAL value (UTF-8 decimal text).
    pub fn decimal(text: &str) -> Self {
        Self::new(tag::DECIMAL, Bytes::copy_from_slice(text.as_bytes()))
    }

    /// A STRING value.
    pub fn string(s: &str) -> Self {
        Self::new(tag::STRING, Bytes::copy_from_slice(s.as_bytes()))
    }

    /// A BYTES value (zero-copy).
    pub fn binary(data: Bytes) -> Self {
        Self::new(tag::BYTES, data)
    }

    /// A sender-owned object or collection reference.
    pub fn reference(kind: RefKind, id: ObjectId) -> Self {
        Self::new(kind.tag(), Bytes::copy_from_slice(&id.raw().to_be_bytes()))
    }

    /// A receiver-owned reference handed back to its allocator.
    pub fn hand_back(id: ObjectId) -> Self {
        Self::new(tag::PROXY, Bytes::copy_from_slice(&id.raw().to_be_bytes()))
    }

    /// A COMMAND marker carrying the command code.
    pub fn command(code: CommandCode) -> Self {
        Self::new(
            tag::COMMAND,
            Bytes::copy_from_slice(&code.as_i32().to_be_bytes()),
        )
    }

    /// The END frame delimiter.
    pub fn end() -> Self {
        Self::empty(tag::END)
    }

    /// The SUCCESS outcome marker.
    pub fn success() -> Self {
        Self::empty(tag::SUCCESS)
    }

    /// The ERROR outcome marker.
    pub fn error_marker() -> Self {
        Self::empty(tag::ERROR)
    }

    /// The RETURN frame marker.
    pub fn return_marker() -> Self {
        Self::empty(tag::RETURN)
    }

    /// An EXCEPTION outcome wrapping a complete nested value.
    ///
    /// The nested value must carry a builtin tag; it is framed with
    /// builtin shapes on both sides.
    pub fn exception(detail: &TaggedValue) -> Self {
        let mut buf = BytesMut::with_capacity(detail.encoded_len());
        detail.write_to(&mut buf);
        Self::new(tag::EXCEPTION, buf.freeze())
    }

    /// The type tag.
    #[inline]
    pub fn tag(&self) -> i16 {
        self.tag
    }

    /// The payload bytes (without tag or length prefix).
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// A cheap zero-copy clone of the payload.
    #[inline]
    pub fn payload_bytes(&self) -> Bytes {
        self.payload.clone()
    }

    /// Interpret a 1-byte payload as a boolean.
    pub fn as_bool(&self) -> Result<bool> {
        let mut cur = ByteCursor::new(&self.payload);
        let b = cur.read_u8()?;
        cur.finish()?;
        match b {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ObjwireError::Protocol(format!(
                "Invalid boolean byte: {}",
                other
            ))),
        }
    }

    /// Interpret a 4-byte payload as an i32.
    pub fn as_i32(&self) -> Result<i32> {
        let mut cur = ByteCursor::new(&self.payload);
        let v = cur.read_i32()?;
        cur.finish()?;
        Ok(v)
    }

    /// Interpret an 8-byte payload as an i64.
    pub fn as_i64(&self) -> Result<i64> {
        let mut cur = ByteCursor::new(&self.payload);
        let v = cur.read_i64()?;
        cur.finish()?;
        Ok(v)
    }

    /// Interpret an 8-byte payload as an f64 bit pattern.
    pub fn as_f64(&self) -> Result<f64> {
        let mut cur = ByteCursor::new(&self.payload);
        let v = cur.read_f64()?;
        cur.finish()?;
        Ok(v)
    }

    /// Interpret the payload as UTF-8 text.
    pub fn as_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.payload)
            .map_err(|e| ObjwireError::Protocol(format!("Invalid UTF-8 payload: {}", e)))
    }

    /// Interpret an 8-byte reference payload as an object id.
    pub fn as_object_id(&self) -> Result<ObjectId> {
        Ok(ObjectId::new(self.as_i64()?))
    }

    /// Encoded size on the wire, including tag and any length prefix.
    ///
    /// Extension tags are sized as length-prefixed; this is an upper
    /// bound used for buffer capacity.
    pub fn encoded_len(&self) -> usize {
        let prefix = match builtin_shape(self.tag).unwrap_or(Shape::LengthPrefixed) {
            Shape::LengthPrefixed => 4,
            _ => 0,
        };
        2 + prefix + self.payload.len()
    }

    /// Append the wire form to a buffer, framing by a full shape table.
    ///
    /// Socket writes go through here so registered extension values keep
    /// their declared shape, matching what the peer's scanner expects.
    /// Fails with [`BadLength`] when a payload exceeds what the 4-byte
    /// prefix can carry; a wrapped negative length would desync the peer
    /// mid-stream.
    ///
    /// [`BadLength`]: ObjwireError::BadLength
    pub fn write_with(&self, buf: &mut BytesMut, shapes: &TagShapes) -> Result<()> {
        let shape = shapes.lookup(self.tag).unwrap_or(Shape::LengthPrefixed);
        if shape == Shape::LengthPrefixed {
            check_prefixed_len(self.payload.len())?;
        }
        self.write_shaped(buf, shape);
        Ok(())
    }

    /// Append the wire form to a buffer using builtin shapes only.
    ///
    /// Extension tags are framed length-prefixed here; values headed for
    /// a socket take [`write_with`](Self::write_with) instead.
    pub fn write_to(&self, buf: &mut BytesMut) {
        self.write_shaped(buf, builtin_shape(self.tag).unwrap_or(Shape::LengthPrefixed));
    }

    fn write_shaped(&self, buf: &mut BytesMut, shape: Shape) {
        buf.put_i16(self.tag);
        match shape {
            Shape::Empty => {}
            Shape::Fixed(n) => {
                debug_assert_eq!(self.payload.len(), n);
                buf.put_slice(&self.payload);
            }
            Shape::LengthPrefixed => {
                debug_assert!(self.payload.len() <= i32::MAX as usize);
                buf.put_i32(self.payload.len() as i32);
                buf.put_slice(&self.payload);
            }
        }
    }

    /// Parse one complete value out of a cursor.
    ///
    /// This is the non-incremental path, used for nested values inside an
    /// `EXCEPTION` payload; the incremental socket path lives in the frame
    /// scanner.
    pub fn read_from(cur: &mut ByteCursor<'_>, shapes: &TagShapes) -> Result<Self> {
        let t = cur.read_i16()?;
        let shape = shapes.lookup(t).ok_or(ObjwireError::UnknownTag(t))?;
        let payload = match shape {
            Shape::Empty => Bytes::new(),
            Shape::Fixed(n) => Bytes::copy_from_slice(cur.read_bytes(n)?),
            Shape::LengthPrefixed => {
                let len = cur.read_i32()?;
                if len < 0 {
                    return Err(ObjwireError::BadLength(i64::from(len)));
                }
                Bytes::copy_from_slice(cur.read_bytes(len as usize)?)
            }
        };
        Ok(Self::new(t, payload))
    }
}

/// Reject payload lengths the signed 4-byte prefix cannot carry.
fn check_prefixed_len(len: usize) -> Result<()> {
    if len > i32::MAX as usize {
        return Err(ObjwireError::BadLength(len as i64));
    }
    Ok(())
}

/// Encode a slice of values into one contiguous buffer.
pub fn encode_values(values: &[TaggedValue]) -> Bytes {
    let total: usize = values.iter().map(TaggedValue::encoded_len).sum();
    let mut buf = BytesMut::with_capacity(total);
    for v in values {
        v.write_to(&mut buf);
    }
    buf.freeze()
}
