//! Typed client commands.

use crate::frame::{Frame, FrameError};

/// Command token for registering a display name.
pub const SETNAME: &str = "SETNAME";

/// Command token for joining a channel.
pub const SUBSCRIBE: &str = "SUBSCRIBE";

/// Command token for leaving a channel.
pub const UNSUBSCRIBE: &str = "UNSUBSCRIBE";

/// Command token for publishing to a channel.
pub const MESSAGE: &str = "MESSAGE";

/// A client command, decoded once from a [`Frame`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Register a display name for this connection
    SetName { name: String },

    /// Join a channel
    Subscribe { channel: String },

    /// Leave a channel
    Unsubscribe { channel: String },

    /// Publish text to a channel
    Message { channel: String, content: String },

    /// Any command token the relay does not know
    Unrecognized { command: String, params: Vec<String> },
}

impl Command {
    /// Decodes raw frame bytes straight into a command.
    pub fn decode(raw: &[u8]) -> Result<Self, FrameError> {
        Frame::decode(raw).and_then(Self::try_from)
    }

    /// Returns the command token as it appears on the wire.
    pub fn token(&self) -> &str {
        match self {
            Self::SetName { .. } => SETNAME,
            Self::Subscribe { .. } => SUBSCRIBE,
            Self::Unsubscribe { .. } => UNSUBSCRIBE,
            Self::Message { .. } => MESSAGE,
            Self::Unrecognized { command, .. } => command,
        }
    }

    /// Builds the wire frame for this command.
    pub fn to_frame(&self) -> Frame {
        match self {
            Self::SetName { name } => Frame::new(SETNAME, vec![name.clone()]),
            Self::Subscribe { channel } => Frame::new(SUBSCRIBE, vec![channel.clone()]),
            Self::Unsubscribe { channel } => Frame::new(UNSUBSCRIBE, vec![channel.clone()]),
            Self::Message { channel, content } => {
                Frame::new(MESSAGE, vec![channel.clone(), content.clone()])
            }
            Self::Unrecognized { command, params } => Frame::new(command.clone(), params.clone()),
        }
    }

    /// Encodes this command for the wire.
    pub fn encode(&self) -> Vec<u8> {
        self.to_frame().encode()
    }
}

impl TryFrom<Frame> for Command {
    type Error = FrameError;

    fn try_from(frame: Frame) -> Result<Self, Self::Error> {
        let mut params = frame.params.into_iter();

        match frame.command.as_str() {
            SETNAME => Ok(Self::SetName {
                name: params.next().ok_or(FrameError::MissingParameter {
                    command: SETNAME,
                    parameter: "name",
                })?,
            }),
            SUBSCRIBE => Ok(Self::Subscribe {
                channel: params.next().ok_or(FrameError::MissingParameter {
                    command: SUBSCRIBE,
                    parameter: "channel",
                })?,
            }),
            UNSUBSCRIBE => Ok(Self::Unsubscribe {
                channel: params.next().ok_or(FrameError::MissingParameter {
                    command: UNSUBSCRIBE,
                    parameter: "channel",
                })?,
            }),
            MESSAGE => {
                let channel = params.next().ok_or(FrameError::MissingParameter {
                    command: MESSAGE,
                    parameter: "channel",
                })?;
                let rest: Vec<String> = params.collect();
                if rest.is_empty() {
                    return Err(FrameError::MissingParameter {
                        command: MESSAGE,
                        parameter: "content",
                    });
                }
                Ok(Self::Message {
                    channel,
                    content: rest.join(" "),
                })
            }
            _ => Ok(Self::Unrecognized {
                command: frame.command,
                params: params.collect(),
            }),
        }
    }
}
