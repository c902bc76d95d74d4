use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{DirectoryRow, Message, MessageBody};

/// Events sent over the WebSocket gateway. Every view update is a full snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms successful authentication
    Ready { user_id: Uuid, username: String },

    /// The caller's whole directory, most recent first
    DirectorySnapshot { rows: Vec<DirectoryRow> },

    /// Full history of the open conversation
    MessagesSnapshot {
        conversation_id: Uuid,
        messages: Vec<Message>,
    },

    /// Online state of the open conversation's peer
    PresenceSnapshot {
        user_id: Uuid,
        online: bool,
        last_seen: Option<DateTime<Utc>>,
    },

    /// The session switched its open conversation
    ConversationOpened {
        conversation_id: Uuid,
        peer_user_id: Uuid,
    },

    /// Terse, non-blocking failure notice
    Error { message: String },
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    OpenConversation { conversation_id: Uuid },

    StartConversation { peer_user_id: Uuid },

    /// Sent to the currently open conversation
    SendMessage { body: MessageBody },
}
