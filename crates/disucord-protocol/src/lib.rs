//! DiSUcord Protocol - Wire framing for the relay
//!
//! This crate provides the frame format spoken between relay clients and
//! the `disucordd` server:
//! - `frame` - escaping, field splitting and the `\e` terminator
//! - `command` - the closed set of client commands
//! - `codec` - a `tokio_util` codec for framing a TCP stream

pub mod codec;
pub mod command;
pub mod frame;

pub use codec::{CodecError, FrameCodec, MAX_FRAME_SIZE};
pub use command::Command;
pub use frame::{decode, encode, encode_frame, escape_field, Frame, FrameError};
