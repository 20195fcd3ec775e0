use std::path::Path;

use anyhow::{Context, Result, bail};

use crate::codec::{self, Message, MessageKind};

/// Sender identity attached to every outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    nickname: String,
    hobby: String,
    /// Base64 avatar, encoded once and re-sent with every message.
    avatar: String,
}

impl Profile {
    pub fn new(nickname: &str, hobby: &str, avatar_bytes: &[u8]) -> Self {
        Self {
            nickname: codec::escape_text(nickname.trim()),
            hobby: codec::escape_text(hobby.trim()),
            avatar: codec::encode_binary(avatar_bytes),
        }
    }

    /// Reads the avatar image from disk and rejects an invalid profile.
    pub async fn load(nickname: &str, hobby: &str, avatar: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(avatar)
            .await
            .with_context(|| format!("failed to read avatar {}", avatar.display()))?;
        let profile = Self::new(nickname, hobby, &bytes);
        if !profile.is_valid() {
            bail!("profile needs a nickname and a non-empty avatar image");
        }
        Ok(profile)
    }

    pub fn is_valid(&self) -> bool {
        !self.nickname.is_empty() && !self.avatar.is_empty()
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn avatar(&self) -> &str {
        &self.avatar
    }

    /// Builds a TEXT message, escaping the separator inside `text`.
    pub fn text_message(&self, time: &str, text: &str) -> Message {
        self.message(MessageKind::Text, time, codec::escape_text(text))
    }

    /// Builds a FILE or IMAGE message carrying `bytes` as base64.
    pub fn binary_message(&self, kind: MessageKind, time: &str, bytes: &[u8]) -> Message {
        self.message(kind, time, codec::encode_binary(bytes))
    }

    fn message(&self, kind: MessageKind, time: &str, payload: String) -> Message {
        Message {
            kind,
            time: time.to_string(),
            nickname: self.nickname.clone(),
            hobby: self.hobby.clone(),
            avatar: self.avatar.clone(),
            payload,
        }
    }
}
