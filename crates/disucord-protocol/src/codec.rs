//! Stream codec for relay connections.
//!
//! Inbound, the byte stream is split at every unescaped `\e` and each
//! complete frame is yielded as raw bytes; parsing into a [`Command`] is
//! left to the caller so a malformed frame never poisons the stream.
//! Outbound, server text is written as UTF-8 lines terminated by `\n`.
//!
//! Oversized frames (> [`MAX_FRAME_SIZE`]) are skipped rather than killing
//! the connection.
//!
//! [`Command`]: crate::Command

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

use crate::frame::{find_terminator, ESCAPE};

/// Maximum frame length in bytes, terminator excluded.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Codec error. Only I/O failures are fatal to the stream.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Frames relay traffic: `\e`-terminated frames in, `\n`-terminated lines out.
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// True while discarding an oversized frame until its terminator.
    skipping: bool,
}

impl FrameCodec {
    /// Creates a new codec.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match find_terminator(src) {
                Some(pos) if self.skipping || pos > MAX_FRAME_SIZE => {
                    warn!(bytes = pos, "codec: skipped oversized frame");
                    src.advance(pos + 2);
                    self.skipping = false;
                }
                Some(pos) => {
                    let frame = src.split_to(pos).freeze();
                    src.advance(2);
                    return Ok(Some(frame));
                }
                None => {
                    // An unpaired trailing backslash may pair with the next read.
                    let keep = usize::from(ends_with_unpaired_escape(src));
                    if src.len() - keep > MAX_FRAME_SIZE {
                        let discard = src.len() - keep;
                        warn!(
                            bytes = discard,
                            "codec: discarding oversized partial frame, waiting for terminator"
                        );
                        src.advance(discard);
                        self.skipping = true;
                    }
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                if !src.is_empty() {
                    debug!(bytes = src.len(), "codec: dropping unterminated frame at end of stream");
                    src.clear();
                }
                Ok(None)
            }
        }
    }
}

/// True if `buf` ends in a backslash that does not close an escape pair.
///
/// Pairs are consumed left to right, as in [`find_terminator`].
fn ends_with_unpaired_escape(buf: &[u8]) -> bool {
    let mut i = 0;
    while i < buf.len() {
        if buf[i] == ESCAPE {
            if i + 1 == buf.len() {
                return true;
            }
            i += 2;
        } else {
            i += 1;
        }
    }
    false
}

impl Encoder<String> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len() + 1);
        dst.put_slice(item.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}
