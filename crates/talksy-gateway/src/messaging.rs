use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use talksy_types::models::{DirectoryRow, Message, MessageBody};

use crate::dispatcher::ChangeEvent;
use crate::store::blocking;
use crate::{Hub, SyncError};

/// The caller's own directory row for `conversation_id`.
/// `NotFound` if the conversation does not exist, `Unauthorized` if it does
/// but belongs to someone else.
pub async fn participant_row(
    hub: &Hub,
    user_id: Uuid,
    conversation_id: Uuid,
) -> Result<DirectoryRow, SyncError> {
    let row = blocking(&hub.db, move |db| db.directory_row(user_id, conversation_id)).await?;
    if let Some(row) = row {
        return Ok(row);
    }
    if blocking(&hub.db, move |db| db.conversation_exists(conversation_id)).await? {
        Err(SyncError::Unauthorized)
    } else {
        Err(SyncError::NotFound("conversation"))
    }
}

/// Append, notify, then refresh both directory rows.
///
/// The append is the only step that can fail the send. A directory update
/// that fails afterwards is logged and left to the next reconciliation pull.
pub async fn deliver(
    hub: &Hub,
    sender_id: Uuid,
    conversation_id: Uuid,
    body: MessageBody,
) -> Result<Message, SyncError> {
    let body = body
        .normalize()
        .map_err(|reason| SyncError::InvalidInput(reason.to_string()))?;

    participant_row(hub, sender_id, conversation_id).await?;

    let message_id = Uuid::new_v4();
    let message = blocking(&hub.db, move |db| {
        db.append_message(message_id, conversation_id, sender_id, &body, Utc::now())
    })
    .await?;

    hub.dispatcher.publish(ChangeEvent {
        conversation_id,
        seq: Some(message.seq),
    });

    let preview = message.body.preview();
    let at = message.created_at;
    match blocking(&hub.db, move |db| {
        db.apply_new_message(conversation_id, sender_id, &preview, at)
    })
    .await
    {
        Ok(()) => debug!("message {} applied to directory", message.id),
        Err(e) => warn!(
            "message {} delivered but directory update failed: {}",
            message.id, e
        ),
    }

    Ok(message)
}
