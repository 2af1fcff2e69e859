//! Message definitions
//!
//! A `Message` is one discrete unit exchanged after the handshake: UTF-8 text
//! or raw binary, mirroring the frame type declared on the wire.

use tokio_tungstenite::tungstenite::Message as Frame;

/// One application message (text or binary)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

impl Message {
    /// Frame a raw payload according to a session's default mode
    ///
    /// Binary mode always produces a binary frame. Text mode produces a text
    /// frame when the payload is valid UTF-8 and falls back to binary otherwise.
    pub fn from_payload(payload: Vec<u8>, binary: bool) -> Self {
        if binary {
            return Self::Binary(payload);
        }
        match String::from_utf8(payload) {
            Ok(text) => Self::Text(text),
            Err(e) => Self::Binary(e.into_bytes()),
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }

    /// Payload bytes regardless of frame type
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(data) => data,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Vec<u8>> for Message {
    fn from(data: Vec<u8>) -> Self {
        Self::Binary(data)
    }
}

impl From<&[u8]> for Message {
    fn from(data: &[u8]) -> Self {
        Self::Binary(data.to_vec())
    }
}

impl From<Message> for Frame {
    fn from(message: Message) -> Self {
        match message {
            Message::Text(text) => Frame::Text(text.into()),
            Message::Binary(data) => Frame::Binary(data.into()),
        }
    }
}
