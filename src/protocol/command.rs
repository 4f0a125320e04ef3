//! Frames, command assembly and response assembly.
//!
//! A frame is the END-delimited unit of traffic. Its first value
//! classifies it: `COMMAND` opens an inbound call to dispatch, `RETURN`
//! opens the response the awaiting caller is blocked on. Everything
//! between the marker and the (stripped) END delimiter is the body.
//!
//! ```text
//! command frame:   COMMAND(code) value* END
//! response frame:  RETURN outcome END
//! outcome:         SUCCESS value | ERROR | EXCEPTION(value)
//! ```

use super::tags::{tag, CommandCode, ObjectId};
use super::wire::TaggedValue;
use crate::error::{ObjwireError, Result};

/// A complete protocol frame with the trailing END marker stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame values: leading marker plus body.
    pub values: Vec<TaggedValue>,
}

/// Classification of a frame by its leading value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Inbound command carrying this raw code (possibly unknown).
    Command(i32),
    /// Response to the call currently awaiting.
    Return,
}

impl Frame {
    /// Create a frame from its values.
    pub fn new(values: Vec<TaggedValue>) -> Self {
        Self { values }
    }

    /// Classify the frame by its first value.
    ///
    /// Unknown command codes still classify as [`FrameKind::Command`]; the
    /// dispatcher answers them with an error outcome. An empty frame or a
    /// non-marker leading tag is a protocol violation.
    pub fn kind(&self) -> Result<FrameKind> {
        match self.values.first() {
            None => Err(ObjwireError::Protocol("Empty frame".to_string())),
            Some(v) if v.tag() == tag::COMMAND => Ok(FrameKind::Command(v.as_i32()?)),
            Some(v) if v.tag() == tag::RETURN => Ok(FrameKind::Return),
            Some(v) => Err(ObjwireError::Protocol(format!(
                "Frame must begin with a command or return marker, got tag {}",
                v.tag()
            ))),
        }
    }

    /// The frame body: everything after the leading marker, END excluded.
    pub fn arguments(&self) -> &[TaggedValue] {
        self.values.get(1..).unwrap_or(&[])
    }
}

/// Assemble a complete command: code marker first, END appended.
pub fn encode_command(code: CommandCode, args: Vec<TaggedValue>) -> Vec<TaggedValue> {
    let mut values = Vec::with_capacity(args.len() + 2);
    values.push(TaggedValue::command(code));
    values.extend(args);
    values.push(TaggedValue::end());
    values
}

/// Streaming command assembly: yields the marker, each argument, then END,
/// one value at a time, so large arguments can be written straight to the
/// socket without buffering the whole command.
pub struct LazyCommand<I> {
    head: Option<TaggedValue>,
    args: I,
    tail: Option<TaggedValue>,
}

impl<I> Iterator for LazyCommand<I>
where
    I: Iterator<Item = TaggedValue>,
{
    type Item = TaggedValue;

    fn next(&mut self) -> Option<TaggedValue> {
        if let Some(head) = self.head.take() {
            return Some(head);
        }
        if let Some(arg) = self.args.next() {
            return Some(arg);
        }
        self.tail.take()
    }
}

/// Build a lazy command over an argument iterator.
pub fn lazy_command<I>(code: CommandCode, args: I) -> LazyCommand<I::IntoIter>
where
    I: IntoIterator<Item = TaggedValue>,
{
    LazyCommand {
        head: Some(TaggedValue::command(code)),
        args: args.into_iter(),
        tail: Some(TaggedValue::end()),
    }
}

/// RELEASE command for a reference owned by the receiver.
pub fn release_command(id: ObjectId) -> Vec<TaggedValue> {
    encode_command(CommandCode::Release, vec![TaggedValue::hand_back(id)])
}

/// SHUTDOWN command targeting the peer-server sentinel.
pub fn shutdown_command() -> Vec<TaggedValue> {
    encode_command(
        CommandCode::Shutdown,
        vec![TaggedValue::hand_back(super::tags::SERVER_OBJECT_ID)],
    )
}

/// Successful response carrying a return value (NULL for void results).
pub fn success_response(value: TaggedValue) -> Vec<TaggedValue> {
    vec![
        TaggedValue::return_marker(),
        TaggedValue::success(),
        value,
        TaggedValue::end(),
    ]
}

/// Generic protocol-level failure response.
pub fn error_response() -> Vec<TaggedValue> {
    vec![
        TaggedValue::return_marker(),
        TaggedValue::error_marker(),
        TaggedValue::end(),
    ]
}

/// Application error response wrapping the error description.
pub fn exception_response(detail: &TaggedValue) -> Vec<TaggedValue> {
    vec![
        TaggedValue::return_marker(),
        TaggedValue::exception(detail),
        TaggedValue::end(),
    ]
}

/// Whether a response frame carries a plain SUCCESS outcome.
///
/// Control-plane acknowledgements (auth, release) only need this check,
/// not the full value codec.
pub fn response_is_success(frame: &Frame) -> bool {
    matches!(frame.values.first(), Some(v) if v.tag() == tag::RETURN)
        && matches!(frame.values.get(1), Some(v) if v.tag() == tag::SUCCESS)
}
