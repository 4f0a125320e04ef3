//! Incremental frame scanner for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management and a state
//! machine for fragmented input:
//! - `WaitingForTag`: need 2 bytes
//! - `WaitingForLength`: length-prefixed tag parsed, need 4 bytes
//! - `WaitingForPayload`: need N more payload bytes
//!
//! Completed values accumulate until an `END` tag closes the frame; the
//! `END` marker itself is stripped, so an emitted [`Frame`] holds exactly
//! the leading marker plus the frame body.

use bytes::{Buf, BytesMut};
use std::sync::Arc;

use super::command::Frame;
use super::tags::{tag, Shape, TagShapes};
use super::wire::{TaggedValue, DEFAULT_MAX_VALUE_SIZE};
use crate::error::{ObjwireError, Result};

/// State machine for value parsing.
#[derive(Debug, Clone)]
enum State {
    /// Waiting for a complete 2-byte tag.
    WaitingForTag,
    /// Length-prefixed tag parsed, waiting for the 4-byte length.
    WaitingForLength { tag: i16 },
    /// Waiting for the value's payload bytes.
    WaitingForPayload { tag: i16, length: usize },
}

/// Accumulates incoming bytes and extracts complete END-delimited frames.
pub struct FrameScanner {
    /// Unconsumed bytes from socket reads.
    buffer: BytesMut,
    /// Current value-parsing state.
    state: State,
    /// Values of the frame being assembled.
    values: Vec<TaggedValue>,
    /// Shape table for framing, including extension tags.
    shapes: Arc<TagShapes>,
    /// Maximum allowed payload size for a single value.
    max_value_size: usize,
}

impl FrameScanner {
    /// Create a scanner over the given shape table.
    pub fn new(shapes: Arc<TagShapes>) -> Self {
        Self::with_max_value_size(shapes, DEFAULT_MAX_VALUE_SIZE)
    }

    /// Create a scanner with a custom per-value size limit.
    pub fn with_max_value_size(shapes: Arc<TagShapes>, max_value_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            state: State::WaitingForTag,
            values: Vec::new(),
            shapes,
            max_value_size,
        }
    }

    /// Push data into the scanner and extract all complete frames.
    ///
    /// Partial data is buffered internally for the next push; the returned
    /// vector may be empty. A protocol error (unknown tag, negative or
    /// oversized length) poisons the stream position and the connection
    /// must be dropped.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Whether the scanner sits at a frame boundary with nothing buffered.
    ///
    /// EOF is an orderly close only in this state; EOF anywhere else means
    /// the peer died mid-frame.
    pub fn is_clean(&self) -> bool {
        self.buffer.is_empty()
            && self.values.is_empty()
            && matches!(self.state, State::WaitingForTag)
    }

    /// Try to complete a single frame from buffered bytes.
    fn try_extract_one(&mut self) -> Result<Option<Frame>> {
        loop {
            match self.state {
                State::WaitingForTag => {
                    if self.buffer.len() < 2 {
                        return Ok(None);
                    }
                    let t = self.buffer.get_i16();
                    let shape = self
                        .shapes
                        .lookup(t)
                        .ok_or(ObjwireError::UnknownTag(t))?;
                    match shape {
                        Shape::Empty => {
                            if let Some(frame) = self.complete_value(TaggedValue::empty(t)) {
                                return Ok(Some(frame));
                            }
                        }
                        Shape::Fixed(n) => {
                            self.state = State::WaitingForPayload { tag: t, length: n };
                        }
                        Shape::LengthPrefixed => {
                            self.state = State::WaitingForLength { tag: t };
                        }
                    }
                }

                State::WaitingForLength { tag: t } => {
                    if self.buffer.len() < 4 {
                        return Ok(None);
                    }
                    let len = self.buffer.get_i32();
                    if len < 0 {
                        return Err(ObjwireError::BadLength(i64::from(len)));
                    }
                    let len = len as usize;
                    if len > self.max_value_size {
                        return Err(ObjwireError::Protocol(format!(
                            "Payload size {} exceeds maximum {}",
                            len, self.max_value_size
                        )));
                    }
                    self.state = State::WaitingForPayload { tag: t, length: len };
                }

                State::WaitingForPayload { tag: t, length } => {
                    if self.buffer.len() < length {
                        return Ok(None);
                    }
                    // Zero-copy split of exactly the payload bytes.
                    let payload = self.buffer.split_to(length).freeze();
                    self.state = State::WaitingForTag;
                    if let Some(frame) = self.complete_value(TaggedValue::new(t, payload)) {
                        return Ok(Some(frame));
                    }
                }
            }
        }
    }

    /// Fold a completed value into the current frame. END closes the frame
    /// and is stripped from it.
    fn complete_value(&mut self, value: TaggedValue) -> Option<Frame> {
        if value.tag() == tag::END {
            return Some(Frame::new(std::mem::take(&mut self.values)));
        }
        self.values.push(value);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::tags::{CommandCode, ObjectId, RefKind};
    use crate::protocol::wire::encode_values;

    fn scanner() -> FrameScanner {
        FrameScanner::new(Arc::new(TagShapes::new()))
    }

    fn call_frame_bytes() -> Vec<u8> {
        encode_values(&[
            TaggedValue::command(CommandCode::Call),
            TaggedValue::reference(RefKind::Object, ObjectId::new(3)),
            TaggedValue::string("length"),
            TaggedValue::int(5),
            TaggedValue::end(),
        ])
        .to_vec()
    }

    #[test]
    fn test_single_complete_frame() {
        let mut s = scanner();
        let frames = s.push(&call_frame_bytes()).unwrap();

        assert_eq!(frames.len(), 1);
        // END is stripped: marker + target + member + one argument.
        assert_eq!(frames[0].values.len(), 4);
        assert_eq!(frames[0].values[0].tag(), tag::COMMAND);
        assert!(s.is_clean());
    }

    #[test]
    fn test_end_marker_excluded_from_arguments() {
        let mut s = scanner();
        let bytes = encode_values(&[
            TaggedValue::command(CommandCode::Release),
            TaggedValue::int(1),
            TaggedValue::int(2),
            TaggedValue::end(),
        ]);
        let frames = s.push(&bytes).unwrap();

        let args = frames[0].arguments();
        assert_eq!(args.len(), 2);
        assert_eq!(args[0].as_i32().unwrap(), 1);
        assert_eq!(args[1].as_i32().unwrap(), 2);
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut s = scanner();
        let mut combined = call_frame_bytes();
        combined.extend_from_slice(&call_frame_bytes());
        combined.extend_from_slice(&call_frame_bytes());

        let frames = s.push(&combined).unwrap();
        assert_eq!(frames.len(), 3);
        assert!(s.is_clean());
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut s = scanner();
        let bytes = call_frame_bytes();

        let mut all_frames = Vec::new();
        for byte in &bytes {
            let frames = s.push(&[*byte]).unwrap();
            all_frames.extend(frames);
        }

        assert_eq!(all_frames.len(), 1);
        assert_eq!(all_frames[0].values.len(), 4);
        assert!(s.is_clean());
    }

    #[test]
    fn test_fragmented_length_prefix() {
        let mut s = scanner();
        let bytes = encode_values(&[TaggedValue::string("fragmented"), TaggedValue::end()]);

        // Tag plus half the length field.
        let frames = s.push(&bytes[..4]).unwrap();
        assert!(frames.is_empty());
        assert!(!s.is_clean());

        let frames = s.push(&bytes[4..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].values[0].as_str().unwrap(), "fragmented");
    }

    #[test]
    fn test_empty_frame_is_emitted() {
        // A bare END delimits an empty frame; classification rejects it
        // later, the scanner just frames.
        let mut s = scanner();
        let frames = s.push(&encode_values(&[TaggedValue::end()])).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].values.is_empty());
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut s = scanner();
        let err = s.push(&[0x00, 99]).unwrap_err();
        assert!(matches!(err, ObjwireError::UnknownTag(99)));
    }

    #[test]
    fn test_negative_length_rejected() {
        let mut s = scanner();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&tag::STRING.to_be_bytes());
        bytes.extend_from_slice(&(-1i32).to_be_bytes());
        let err = s.push(&bytes).unwrap_err();
        assert!(matches!(err, ObjwireError::BadLength(-1)));
    }

    #[test]
    fn test_max_value_size_enforced() {
        let mut s = FrameScanner::with_max_value_size(Arc::new(TagShapes::new()), 16);
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&tag::BYTES.to_be_bytes());
        bytes.extend_from_slice(&1024i32.to_be_bytes());
        let err = s.push(&bytes).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_extension_tag_framed_by_registered_shape() {
        let mut shapes = TagShapes::new();
        shapes.register(-60, Shape::Fixed(3)).unwrap();
        let mut s = FrameScanner::new(Arc::new(shapes));

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(-60i16).to_be_bytes());
        bytes.extend_from_slice(&[1, 2, 3]);
        bytes.extend_from_slice(&tag::END.to_be_bytes());

        let frames = s.push(&bytes).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].values[0].tag(), -60);
        assert_eq!(frames[0].values[0].payload(), &[1, 2, 3]);
    }

    #[test]
    fn test_mid_frame_state_not_clean() {
        let mut s = scanner();
        let bytes = call_frame_bytes();

        s.push(&bytes[..bytes.len() - 2]).unwrap();
        assert!(!s.is_clean());

        s.push(&bytes[bytes.len() - 2..]).unwrap();
        assert!(s.is_clean());
    }

    #[test]
    fn test_large_binary_value() {
        let mut s = scanner();
        let payload = bytes::Bytes::from(vec![0xAB; 256 * 1024]);
        let bytes = encode_values(&[TaggedValue::binary(payload.clone()), TaggedValue::end()]);

        let frames = s.push(&bytes).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].values[0].payload().len(), 256 * 1024);
        assert!(frames[0].values[0].payload().iter().all(|&b| b == 0xAB));
    }
}
