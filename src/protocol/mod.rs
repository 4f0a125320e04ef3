//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the tagged binary protocol for the data plane:
//! - Tag constants, shapes and command codes
//! - Tagged value encoding/decoding
//! - Frame scanner for accumulating partial reads
//! - Frame struct plus command and response assembly

mod command;
mod scanner;
mod tags;
mod wire;

pub use command::{
    encode_command, error_response, exception_response, lazy_command, release_command,
    response_is_success, shutdown_command, success_response, Frame, FrameKind, LazyCommand,
};
pub use scanner::FrameScanner;
pub use tags::{
    builtin_shape, tag, CommandCode, ConnectionId, ObjectId, RefKind, Shape, TagShapes,
    ENTRY_POINT_OBJECT_ID, SERVER_OBJECT_ID,
};
pub use wire::{encode_values, ByteCursor, TaggedValue, DEFAULT_MAX_VALUE_SIZE};
