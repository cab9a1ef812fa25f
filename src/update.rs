//! Inbound webhook payloads from the chat transport.

use serde::{Deserialize, Serialize};

/// One webhook delivery: either a message or a callback press.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Update {
    pub message: Option<Message>,
    pub callback: Option<Callback>,
}

/// A user-authored message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Author and chat id; private bot chats use the same id for both.
    pub from: i64,
    pub text: Option<String>,
    pub location: Option<Location>,
    pub photo: Option<String>,
    pub video: Option<String>,
    /// Set for attachment kinds the workflow rejects (audio, voice, ...).
    pub other_attachment: Option<String>,
}

impl Message {
    pub fn text_only(from: i64, text: impl Into<String>) -> Self {
        Message {
            from,
            text: Some(text.into()),
            location: None,
            photo: None,
            video: None,
            other_attachment: None,
        }
    }
}

/// An inline keyboard button press.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Callback {
    pub from: i64,
    pub data: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
}
