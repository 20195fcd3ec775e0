//! Line protocol shared by the relay and its clients.
//!
//! A message travels as one UTF-8 line made of six fields joined by
//! [`SEPARATOR`]:
//!
//! ```text
//! KIND|||[time]|||nickname|||hobby|||avatar|||payload
//! ```
//!
//! The payload is last and absorbs any remaining text, so only the five
//! header fields must stay free of the separator. [`encode`] refuses header
//! fields that would break that rule, and binary payloads and avatars are
//! only ever produced through base64, whose alphabet cannot contain `|`.

use std::fmt;

use base64::{Engine, engine::general_purpose::STANDARD};
use thiserror::Error;

/// Literal field separator on the wire.
pub const SEPARATOR: &str = "|||";

/// Replacement used when free text contains [`SEPARATOR`].
pub const ESCAPED_SEPARATOR: &str = "｜｜｜";

/// Number of fields in a well-formed line.
pub const FIELD_COUNT: usize = 6;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Text,
    File,
    Image,
    /// Any tag the relay does not know about. Kept so such lines still decode.
    Unknown(String),
}

impl MessageKind {
    pub fn as_str(&self) -> &str {
        match self {
            MessageKind::Text => "TEXT",
            MessageKind::File => "FILE",
            MessageKind::Image => "IMAGE",
            MessageKind::Unknown(tag) => tag,
        }
    }

    /// FILE and IMAGE carry a base64 payload.
    pub fn is_binary(&self) -> bool {
        matches!(self, MessageKind::File | MessageKind::Image)
    }
}

impl From<&str> for MessageKind {
    fn from(tag: &str) -> Self {
        match tag {
            "TEXT" => MessageKind::Text,
            "FILE" => MessageKind::File,
            "IMAGE" => MessageKind::Image,
            other => MessageKind::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One relayed unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    /// Display timestamp, formatted by the sender. Sent wrapped in brackets.
    pub time: String,
    pub nickname: String,
    pub hobby: String,
    /// Base64 avatar image, re-sent with every message.
    pub avatar: String,
    /// Escaped text for TEXT, base64 for FILE and IMAGE.
    pub payload: String,
}

impl Message {
    /// Decodes a FILE or IMAGE payload back into raw bytes.
    pub fn payload_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(self.payload.as_bytes())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("field `{field}` contains the separator `|||`")]
    SeparatorInField { field: &'static str },
    #[error("field `{field}` contains a line break")]
    LineBreak { field: &'static str },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed line: expected 6 fields, found {found}")]
    Malformed { found: usize },
}

/// Joins the message fields into one line, without the trailing newline.
///
/// Free text must already be escaped with [`escape_text`]; this only checks
/// that the result will split back into the same six fields.
pub fn encode(message: &Message) -> Result<String, EncodeError> {
    let time = format!("[{}]", message.time);
    let header: [(&'static str, &str); 5] = [
        ("kind", message.kind.as_str()),
        ("time", time.as_str()),
        ("nickname", message.nickname.as_str()),
        ("hobby", message.hobby.as_str()),
        ("avatar", message.avatar.as_str()),
    ];

    for (field, value) in header {
        check_line_breaks(field, value)?;
        if value.contains(SEPARATOR) {
            return Err(EncodeError::SeparatorInField { field });
        }
    }
    check_line_breaks("payload", &message.payload)?;

    let mut fields: Vec<&str> = header.iter().map(|(_, value)| *value).collect();
    fields.push(message.payload.as_str());
    Ok(fields.join(SEPARATOR))
}

fn check_line_breaks(field: &'static str, value: &str) -> Result<(), EncodeError> {
    if value.contains(LINE_ENDINGS) {
        return Err(EncodeError::LineBreak { field });
    }
    Ok(())
}

/// Splits a line into a [`Message`].
///
/// Splitting stops after the fifth separator so the payload keeps any
/// separators of its own. Unknown kinds are accepted.
pub fn decode(line: &str) -> Result<Message, DecodeError> {
    let line = line.trim_end_matches(LINE_ENDINGS);
    let fields: Vec<&str> = line.splitn(FIELD_COUNT, SEPARATOR).collect();
    let [kind, time, nickname, hobby, avatar, payload] = fields[..] else {
        return Err(DecodeError::Malformed {
            found: fields.len(),
        });
    };

    Ok(Message {
        kind: MessageKind::from(kind),
        time: strip_brackets(time).to_string(),
        nickname: nickname.to_string(),
        hobby: hobby.to_string(),
        avatar: avatar.to_string(),
        payload: payload.to_string(),
    })
}

fn strip_brackets(time: &str) -> &str {
    time.strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(time)
}

/// Makes free text safe to use as a TEXT payload or header field.
pub fn escape_text(text: &str) -> String {
    text.replace(SEPARATOR, ESCAPED_SEPARATOR)
}

/// Base64 form used for FILE and IMAGE payloads and for avatars.
pub fn encode_binary(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}
