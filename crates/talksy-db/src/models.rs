//! Database row types. These map directly to SQLite rows and stay separate
//! from the talksy-types models so the storage layout can change on its own.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use talksy_types::models::{DirectoryRow, Message, MessageBody, User};

use crate::{Result, StoreError};

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password: String,
    pub name: Option<String>,
    pub avatar: Option<String>,
    pub bio: Option<String>,
    pub last_active: Option<i64>,
    pub created_at: i64,
}

impl UserRow {
    pub fn into_user(self) -> Result<User> {
        Ok(User {
            id: parse_id(&self.id)?,
            username: self.username,
            name: self.name,
            avatar: self.avatar,
            bio: self.bio,
            last_active: self.last_active.map(from_millis).transpose()?,
            created_at: from_millis(self.created_at)?,
        })
    }
}

pub struct MessageRow {
    pub seq: i64,
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub kind: String,
    pub content: String,
    pub created_at: i64,
}

impl MessageRow {
    pub fn into_message(self) -> Result<Message> {
        let body = MessageBody::from_parts(&self.kind, self.content)
            .ok_or_else(|| StoreError::Corrupt(format!("message {} has kind '{}'", self.id, self.kind)))?;
        Ok(Message {
            id: parse_id(&self.id)?,
            conversation_id: parse_id(&self.conversation_id)?,
            sender_id: parse_id(&self.sender_id)?,
            body,
            created_at: from_millis(self.created_at)?,
            seq: self.seq,
        })
    }
}

pub struct DirectoryRecord {
    pub owner_user_id: String,
    pub conversation_id: String,
    pub peer_user_id: String,
    pub last_message_preview: String,
    pub last_message_at: i64,
    pub unread: bool,
}

impl DirectoryRecord {
    pub fn into_row(self) -> Result<DirectoryRow> {
        Ok(DirectoryRow {
            owner_user_id: parse_id(&self.owner_user_id)?,
            conversation_id: parse_id(&self.conversation_id)?,
            peer_user_id: parse_id(&self.peer_user_id)?,
            last_message_preview: self.last_message_preview,
            last_message_at: from_millis(self.last_message_at)?,
            unread: self.unread,
        })
    }
}

pub struct BlobRow {
    pub id: String,
    pub uploader_id: String,
    pub content_type: String,
    pub size: i64,
    pub created_at: i64,
}

pub fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {}", ms)))
}

pub(crate) fn parse_id(raw: &str) -> Result<Uuid> {
    raw.parse()
        .map_err(|e| StoreError::Corrupt(format!("bad id '{}': {}", raw, e)))
}
