//! Unified message model shared by every part of the bridge.
//!
//! A [`UnifiedMessage`] is the platform-independent form of a chat message:
//! who it came from (or goes to), an ordered list of [`MessageElement`]s and
//! opaque metadata copied from the originating event.

use crate::error::BridgeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Whether a chat address points at a one-to-one chat or a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChatKind {
    Private,
    Group,
}

impl ChatKind {
    /// The prefix used in the rendered address string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Group => "group",
        }
    }
}

/// A send target: private/group plus a numeric id.
///
/// The canonical string form is `private_{id}` or `group_{id}` and must
/// round-trip exactly through [`FromStr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChatAddress {
    pub kind: ChatKind,
    pub id: i64,
}

impl ChatAddress {
    pub fn private(user_id: i64) -> Self {
        Self {
            kind: ChatKind::Private,
            id: user_id,
        }
    }

    pub fn group(group_id: i64) -> Self {
        Self {
            kind: ChatKind::Group,
            id: group_id,
        }
    }

    pub fn is_group(&self) -> bool {
        self.kind == ChatKind::Group
    }
}

impl fmt::Display for ChatAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.kind.as_str(), self.id)
    }
}

impl FromStr for ChatAddress {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once('_')
            .ok_or_else(|| BridgeError::InvalidAddress(format!("missing '_' in '{s}'")))?;
        let kind = match kind {
            "private" => ChatKind::Private,
            "group" => ChatKind::Group,
            other => {
                return Err(BridgeError::InvalidAddress(format!(
                    "unknown chat kind '{other}' in '{s}'"
                )))
            }
        };
        let id = id
            .parse::<i64>()
            .map_err(|e| BridgeError::InvalidAddress(format!("bad id in '{s}': {e}")))?;
        Ok(Self { kind, id })
    }
}

impl Serialize for ChatAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ChatAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One element of a unified message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageElement {
    /// A run of plain text.
    Text { body: String },
    /// A mention of a user (numeric id) or of everyone (`"all"`).
    Mention { target_id: String },
    /// An image by URL or file reference.
    Image { url: String },
    /// A reference to the message being replied to.
    ReplyRef { target_message_id: String },
    /// A platform sticker/face.
    Face { id: i64 },
    /// A voice clip by URL or file reference.
    Audio { url: String },
    /// A video by file reference.
    Video { file_ref: String },
    /// A raw structured (JSON card) payload.
    StructuredPayload { raw: String },
}

impl MessageElement {
    pub fn text(body: impl Into<String>) -> Self {
        Self::Text { body: body.into() }
    }

    pub fn mention(target_id: impl ToString) -> Self {
        Self::Mention {
            target_id: target_id.to_string(),
        }
    }

    /// Element type tag, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Mention { .. } => "mention",
            Self::Image { .. } => "image",
            Self::ReplyRef { .. } => "reply_ref",
            Self::Face { .. } => "face",
            Self::Audio { .. } => "audio",
            Self::Video { .. } => "video",
            Self::StructuredPayload { .. } => "structured_payload",
        }
    }

    /// Render the element as plain text for consumers that only handle text.
    pub fn degrade_to_text(&self) -> String {
        match self {
            Self::Text { body } => body.clone(),
            Self::Mention { target_id } => format!("@{target_id}"),
            Self::Image { .. } => "[image]".to_string(),
            Self::ReplyRef { target_message_id } => format!("[reply:{target_message_id}]"),
            Self::Face { id } => format!("[face:{id}]"),
            Self::Audio { .. } => "[audio]".to_string(),
            Self::Video { .. } => "[video]".to_string(),
            Self::StructuredPayload { raw } => format!("[json:{raw}]"),
        }
    }
}

/// The platform-independent message envelope. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedMessage {
    sender: ChatAddress,
    elements: Vec<MessageElement>,
    #[serde(default)]
    raw_metadata: HashMap<String, serde_json::Value>,
}

impl UnifiedMessage {
    pub fn new(sender: ChatAddress, elements: Vec<MessageElement>) -> Self {
        Self {
            sender,
            elements,
            raw_metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(
        sender: ChatAddress,
        elements: Vec<MessageElement>,
        raw_metadata: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            sender,
            elements,
            raw_metadata,
        }
    }

    /// A message with a single text element.
    pub fn from_text(sender: ChatAddress, text: impl Into<String>) -> Self {
        Self::new(sender, vec![MessageElement::text(text)])
    }

    pub fn sender(&self) -> ChatAddress {
        self.sender
    }

    pub fn elements(&self) -> &[MessageElement] {
        &self.elements
    }

    pub fn raw_metadata(&self) -> &HashMap<String, serde_json::Value> {
        &self.raw_metadata
    }

    /// Look up a numeric metadata field (e.g. `message_id`, `self_id`).
    pub fn metadata_i64(&self, key: &str) -> Option<i64> {
        self.raw_metadata.get(key).and_then(|v| v.as_i64())
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Concatenate every element's text rendering.
    pub fn plain_text(&self) -> String {
        self.elements
            .iter()
            .map(MessageElement::degrade_to_text)
            .collect()
    }
}
