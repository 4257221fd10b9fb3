//! Frame encoding and decoding.
//!
//! A frame on the wire is a list of fields separated by `\x` and
//! terminated by `\e`:
//!
//! ```text
//! MESSAGE\xIF 100\xhello\e
//! ```
//!
//! A literal backslash inside a field is doubled (`\\`). Escape pairs are
//! consumed left-to-right, so `\\x` is a backslash followed by the letter
//! `x`, never a separator.

use thiserror::Error;

/// Escape character that introduces every two-byte token.
pub const ESCAPE: u8 = b'\\';

/// Second byte of the field separator token `\x`.
pub const SEPARATOR: u8 = b'x';

/// Second byte of the frame terminator token `\e`.
pub const TERMINATOR: u8 = b'e';

/// A decoded frame: a command token plus its ordered parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// First field of the frame
    pub command: String,

    /// Remaining fields, in wire order
    pub params: Vec<String>,
}

impl Frame {
    /// Creates a frame from a command token and parameters.
    pub fn new(command: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            command: command.into(),
            params,
        }
    }

    /// Decodes one frame from raw bytes.
    ///
    /// Everything after the first `\e` is discarded. A missing terminator
    /// is tolerated, the whole input is then treated as one frame.
    pub fn decode(raw: &[u8]) -> Result<Self, FrameError> {
        let mut fields = split_fields(raw)?.into_iter();
        let command = fields.next().ok_or(FrameError::EmptyFrame)?;
        Ok(Self {
            command,
            params: fields.collect(),
        })
    }

    /// Encodes this frame, escaping every field and appending `\e`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        push_field(&mut out, &self.command);
        for param in &self.params {
            out.extend_from_slice(&[ESCAPE, SEPARATOR]);
            push_field(&mut out, param);
        }
        out.extend_from_slice(&[ESCAPE, TERMINATOR]);
        out
    }

    /// Returns the parameter at `index`, if present.
    pub fn param(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(String::as_str)
    }
}

/// Errors produced while decoding a frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The frame contained no fields at all.
    #[error("empty frame")]
    EmptyFrame,

    /// A field was not valid UTF-8.
    #[error("field {index} is not valid UTF-8")]
    InvalidUtf8 {
        /// Zero-based position of the offending field
        index: usize,
    },

    /// A known command arrived without a required parameter.
    #[error("{command} is missing parameter `{parameter}`")]
    MissingParameter {
        /// Command token
        command: &'static str,
        /// Name of the missing parameter
        parameter: &'static str,
    },
}

/// Escapes a single field for the wire (`\` becomes `\\`).
pub fn escape_field(field: &str) -> String {
    field.replace('\\', "\\\\")
}

/// Encodes server-to-client text.
///
/// Outbound text is plain UTF-8, no escaping is applied.
pub fn encode(text: &str) -> Vec<u8> {
    text.as_bytes().to_vec()
}

/// Encodes a command token and its parameters as one terminated frame.
pub fn encode_frame(command: &str, params: &[&str]) -> Vec<u8> {
    Frame::new(command, params.iter().map(|p| p.to_string()).collect()).encode()
}

/// Decodes raw bytes into a command token and its parameters.
pub fn decode(raw: &[u8]) -> Result<(String, Vec<String>), FrameError> {
    Frame::decode(raw).map(|frame| (frame.command, frame.params))
}

/// Returns the byte offset of the first unescaped `\e` in `buf`.
///
/// A trailing lone backslash is not a terminator; the caller should wait
/// for more input.
pub fn find_terminator(buf: &[u8]) -> Option<usize> {
    let mut i = 0;
    while i + 1 < buf.len() {
        if buf[i] == ESCAPE {
            if buf[i + 1] == TERMINATOR {
                return Some(i);
            }
            i += 2;
        } else {
            i += 1;
        }
    }
    None
}

fn push_field(out: &mut Vec<u8>, field: &str) {
    out.extend_from_slice(escape_field(field).as_bytes());
}

/// Splits raw frame bytes into unescaped, non-empty fields.
fn split_fields(raw: &[u8]) -> Result<Vec<String>, FrameError> {
    let mut fields: Vec<Vec<u8>> = Vec::new();
    let mut current = Vec::new();
    let mut i = 0;

    while i < raw.len() {
        let byte = raw[i];
        if byte == ESCAPE && i + 1 < raw.len() {
            match raw[i + 1] {
                ESCAPE => current.push(ESCAPE),
                SEPARATOR => {
                    if !current.is_empty() {
                        fields.push(std::mem::take(&mut current));
                    }
                }
                TERMINATOR => break,
                other => {
                    current.push(ESCAPE);
                    current.push(other);
                }
            }
            i += 2;
        } else {
            current.push(byte);
            i += 1;
        }
    }

    if !current.is_empty() {
        fields.push(current);
    }

    fields
        .into_iter()
        .enumerate()
        .map(|(index, bytes)| String::from_utf8(bytes).map_err(|_| FrameError::InvalidUtf8 { index }))
        .collect()
}
