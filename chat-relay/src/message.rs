use bytes::Bytes;

use crate::codec::FrameError;

/// Wire tag carried in the first four bytes of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Text,
    Image,
}

impl MessageKind {
    pub const fn tag(self) -> i32 {
        match self {
            MessageKind::Text => 1,
            MessageKind::Image => 2,
        }
    }
}

impl TryFrom<i32> for MessageKind {
    type Error = FrameError;

    fn try_from(tag: i32) -> Result<Self, Self::Error> {
        match tag {
            1 => Ok(MessageKind::Text),
            2 => Ok(MessageKind::Image),
            other => Err(FrameError::UnknownType(other)),
        }
    }
}

/// The unit of relay. Carries no sender identity; the relay only knows which
/// connection it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Image(Bytes),
}

impl Message {
    pub fn text(content: impl Into<String>) -> Self {
        Message::Text(content.into())
    }

    pub fn image(bytes: impl Into<Bytes>) -> Self {
        Message::Image(bytes.into())
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Text(_) => MessageKind::Text,
            Message::Image(_) => MessageKind::Image,
        }
    }

    /// Payload bytes as they appear on the wire. Text is measured in UTF-8
    /// bytes, not characters.
    pub fn payload(&self) -> &[u8] {
        match self {
            Message::Text(content) => content.as_bytes(),
            Message::Image(bytes) => bytes,
        }
    }

    pub fn payload_len(&self) -> usize {
        self.payload().len()
    }

    /// Rebuilds a message from a fully received payload.
    pub(crate) fn from_payload(kind: MessageKind, payload: Bytes) -> Result<Self, FrameError> {
        match kind {
            MessageKind::Text => {
                let content = String::from_utf8(payload.to_vec())
                    .map_err(|err| FrameError::InvalidText(err.utf8_error()))?;
                Ok(Message::Text(content))
            }
            MessageKind::Image => Ok(Message::Image(payload)),
        }
    }
}
