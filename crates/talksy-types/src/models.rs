use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Longest text body accepted by the message store.
pub const MAX_TEXT_LEN: usize = 4000;

/// Directory previews are cut to this many characters.
pub const PREVIEW_LEN: usize = 120;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub name: Option<String>,
    pub avatar: Option<String>,
    pub bio: Option<String>,
    /// Written only by the presence tracker.
    pub last_active: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// A profile is usable for chatting once it has both a display name and an avatar.
    pub fn profile_complete(&self) -> bool {
        let filled = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        filled(&self.name) && filled(&self.avatar)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "content", rename_all = "snake_case")]
pub enum MessageBody {
    Text(String),
    /// URL handed out by the blob store.
    Image(String),
}

impl MessageBody {
    /// Trims text and rejects empty or oversized bodies.
    pub fn normalize(self) -> Result<Self, &'static str> {
        match self {
            Self::Text(text) => {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    return Err("message text is empty");
                }
                if trimmed.chars().count() > MAX_TEXT_LEN {
                    return Err("message text is too long");
                }
                Ok(Self::Text(trimmed.to_string()))
            }
            Self::Image(url) => {
                let trimmed = url.trim();
                if trimmed.is_empty() {
                    return Err("image reference is empty");
                }
                Ok(Self::Image(trimmed.to_string()))
            }
        }
    }

    /// Summary shown in the directory row.
    pub fn preview(&self) -> String {
        match self {
            Self::Text(text) => {
                if text.chars().count() <= PREVIEW_LEN {
                    text.clone()
                } else {
                    let mut cut: String = text.chars().take(PREVIEW_LEN).collect();
                    cut.push('…');
                    cut
                }
            }
            Self::Image(_) => "Image".to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Image(_) => "image",
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Self::Text(s) | Self::Image(s) => s,
        }
    }

    pub fn from_parts(kind: &str, content: String) -> Option<Self> {
        match kind {
            "text" => Some(Self::Text(content)),
            "image" => Some(Self::Image(content)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub body: MessageBody,
    pub created_at: DateTime<Utc>,
    /// Insertion sequence, monotonic within a conversation.
    pub seq: i64,
}

/// Per-user summary of one conversation. Always exists in mirrored pairs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryRow {
    pub owner_user_id: Uuid,
    pub conversation_id: Uuid,
    pub peer_user_id: Uuid,
    pub last_message_preview: String,
    pub last_message_at: DateTime<Utc>,
    pub unread: bool,
}

/// Sorts rows for display: most recent activity first.
pub fn sort_directory(rows: &mut [DirectoryRow]) {
    rows.sort_by(|a, b| {
        b.last_message_at
            .cmp(&a.last_message_at)
            .then_with(|| a.conversation_id.cmp(&b.conversation_id))
    });
}

/// Order-independent key for a pair of users.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairKey(String);

impl PairKey {
    pub fn new(a: Uuid, b: Uuid) -> Self {
        let (a, b) = (a.to_string(), b.to_string());
        if a <= b {
            Self(format!("{}:{}", a, b))
        } else {
            Self(format!("{}:{}", b, a))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PairKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_key_ignores_order() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(PairKey::new(a, b), PairKey::new(b, a));
        assert_ne!(PairKey::new(a, b), PairKey::new(a, Uuid::new_v4()));
    }

    #[test]
    fn image_preview_is_fixed_label() {
        let body = MessageBody::Image("http://localhost/files/abc".into());
        assert_eq!(body.preview(), "Image");
    }

    #[test]
    fn long_text_preview_is_truncated() {
        let body = MessageBody::Text("x".repeat(PREVIEW_LEN + 10));
        let preview = body.preview();
        assert_eq!(preview.chars().count(), PREVIEW_LEN + 1);
        assert!(preview.ends_with('…'));
    }

    #[test]
    fn normalize_rejects_blank_text() {
        assert!(MessageBody::Text("   ".into()).normalize().is_err());
        assert_eq!(
            MessageBody::Text("  hi ".into()).normalize().unwrap(),
            MessageBody::Text("hi".into())
        );
    }

    #[test]
    fn body_serializes_tagged() {
        let json = serde_json::to_value(MessageBody::Text("hello".into())).unwrap();
        assert_eq!(json["kind"], "text");
        assert_eq!(json["content"], "hello");
    }
}
