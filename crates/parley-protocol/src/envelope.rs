//! Envelope types for the Parley wire format.
//!
//! Field names are PascalCase on the wire (`Content`, `Channel`, `From`,
//! `Type`, `TimeStamp`) for compatibility with existing chat clients.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Notice sent to a peer when the presence store cannot admit it.
pub const RETRY_NOTICE: &str = "failed to connect. please try again";

/// Current Unix time in seconds.
#[must_use]
pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Notice sent to a peer whose username is already in use.
#[must_use]
pub fn username_taken_notice(user: &str) -> String {
    format!("username {user} is already taken. please retry with a different name")
}

/// Envelope type identifiers.
///
/// `Unknown` is what an absent or unrecognised `Type` field decodes to, and
/// serializes back to the empty string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Welcome,
    Joined,
    Text,
    Left,
    #[default]
    Unknown,
}

impl MessageKind {
    /// Wire name of this kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Welcome => "welcome",
            MessageKind::Joined => "joined",
            MessageKind::Text => "text",
            MessageKind::Left => "left",
            MessageKind::Unknown => "",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "welcome" => Ok(MessageKind::Welcome),
            "joined" => Ok(MessageKind::Joined),
            "text" => Ok(MessageKind::Text),
            "left" => Ok(MessageKind::Left),
            _ => Err("Invalid message type"),
        }
    }
}

impl Serialize for MessageKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(raw.parse().unwrap_or_default())
    }
}

/// A chat envelope.
///
/// Envelopes published to a channel always carry that channel's name in
/// `channel`. Missing fields decode to their zero value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Envelope {
    /// Message body, or system prose for non-text kinds.
    #[serde(rename = "Content")]
    pub content: String,
    /// Channel the envelope belongs to.
    #[serde(rename = "Channel")]
    pub channel: String,
    /// Username of the author.
    #[serde(rename = "From")]
    pub from: String,
    /// Envelope type.
    #[serde(rename = "Type")]
    pub kind: MessageKind,
    /// Unix seconds; only present on `text` envelopes.
    #[serde(rename = "TimeStamp", skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Envelope {
    /// Create the greeting sent directly to a peer after it joins.
    #[must_use]
    pub fn welcome(channel: impl Into<String>, user: impl Into<String>) -> Self {
        let user = user.into();
        Self {
            content: format!("Welcome {user}!"),
            channel: channel.into(),
            from: user,
            kind: MessageKind::Welcome,
            timestamp: None,
        }
    }

    /// Create the announcement published when a user joins a channel.
    #[must_use]
    pub fn joined(channel: impl Into<String>, user: impl Into<String>) -> Self {
        let user = user.into();
        Self {
            content: format!("{user}: has joined the chat!"),
            channel: channel.into(),
            from: user,
            kind: MessageKind::Joined,
            timestamp: None,
        }
    }

    /// Create the announcement published when a user leaves a channel.
    #[must_use]
    pub fn left(channel: impl Into<String>, user: impl Into<String>) -> Self {
        let user = user.into();
        Self {
            content: format!("{user}: has left the chat!"),
            channel: channel.into(),
            from: user,
            kind: MessageKind::Left,
            timestamp: None,
        }
    }

    /// Create a chat line.
    #[must_use]
    pub fn text(
        channel: impl Into<String>,
        user: impl Into<String>,
        content: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            content: content.into(),
            channel: channel.into(),
            from: user.into(),
            kind: MessageKind::Text,
            timestamp: Some(timestamp),
        }
    }

    /// Re-stamp an inbound envelope as a text line from `user` in `channel`.
    ///
    /// Whatever the client put in `From`, `Channel`, `Type` or `TimeStamp` is
    /// overwritten; only `Content` is kept.
    #[must_use]
    pub fn into_text(self, channel: &str, user: &str, timestamp: i64) -> Self {
        Self::text(channel, user, self.content, timestamp)
    }

    /// Check whether every field holds its zero value.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
