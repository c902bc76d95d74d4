use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use uuid::Uuid;

use talksy_types::models::{DirectoryRow, Message, MessageBody, PairKey, User};

use crate::error::is_constraint_violation;
use crate::models::{BlobRow, DirectoryRecord, MessageRow, UserRow, from_millis, millis, parse_id};
use crate::{Database, Result, StoreError};

const USER_COLUMNS: &str = "id, username, password, name, avatar, bio, last_active, created_at";
const MESSAGE_COLUMNS: &str = "seq, id, conversation_id, sender_id, kind, content, created_at";
const DIRECTORY_COLUMNS: &str =
    "owner_user_id, conversation_id, peer_user_id, last_message_preview, last_message_at, unread";

impl Database {
    // -- Users --

    pub fn create_user(
        &self,
        id: Uuid,
        username: &str,
        password_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, password, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![id.to_string(), username, password_hash, millis(now)],
            )
            .map_err(|e| {
                if is_constraint_violation(&e) {
                    StoreError::Conflict(format!("username '{}' is taken", username))
                } else {
                    e.into()
                }
            })?;
            Ok(())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            query_user_where(conn, "username = ?1", username)
        })
    }

    pub fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        self.with_conn(|conn| {
            query_user_where(conn, "id = ?1", &id.to_string())?
                .map(UserRow::into_user)
                .transpose()
        })
    }

    /// Everyone except `exclude`, by display name. `search` matches name or
    /// username, case-insensitively.
    pub fn list_users(&self, exclude: Uuid, search: Option<&str>) -> Result<Vec<User>> {
        let pattern = search
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| format!("%{}%", s.to_lowercase()));

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {USER_COLUMNS} FROM users
                 WHERE id != ?1
                   AND (?2 IS NULL OR lower(coalesce(name, '')) LIKE ?2 OR lower(username) LIKE ?2)
                 ORDER BY coalesce(name, username) COLLATE NOCASE, username"
            ))?;

            let rows = stmt
                .query_map(params![exclude.to_string(), pattern], user_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            rows.into_iter().map(UserRow::into_user).collect()
        })
    }

    /// Overwrites only the fields that are `Some`.
    pub fn update_profile(
        &self,
        id: Uuid,
        name: Option<&str>,
        avatar: Option<&str>,
        bio: Option<&str>,
    ) -> Result<User> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE users SET
                    name   = coalesce(?2, name),
                    avatar = coalesce(?3, avatar),
                    bio    = coalesce(?4, bio)
                 WHERE id = ?1",
                params![id.to_string(), name, avatar, bio],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound("user"));
            }
            query_user_where(conn, "id = ?1", &id.to_string())?
                .ok_or(StoreError::NotFound("user"))?
                .into_user()
        })
    }

    // -- Presence --

    pub fn touch_last_active(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE users SET last_active = ?2 WHERE id = ?1",
                params![id.to_string(), millis(at)],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound("user"));
            }
            Ok(())
        })
    }

    /// `Ok(None)` means the user exists but never sent a heartbeat.
    pub fn last_active(&self, id: Uuid) -> Result<Option<DateTime<Utc>>> {
        self.with_conn(|conn| {
            let raw: Option<i64> = conn
                .query_row(
                    "SELECT last_active FROM users WHERE id = ?1",
                    [id.to_string()],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or(StoreError::NotFound("user"))?;
            raw.map(from_millis).transpose()
        })
    }

    // -- Conversations --

    pub fn find_conversation(&self, key: &PairKey) -> Result<Option<Uuid>> {
        self.with_conn(|conn| conversation_for_key(conn, key))
    }

    /// Returns the pair's conversation, creating it if the key has none yet.
    /// The key lookup and the inserts share one transaction, so the outcome
    /// does not depend on the caller staying around after the call was issued.
    /// The `bool` is true when this call created the conversation.
    pub fn find_or_create_conversation(
        &self,
        id: Uuid,
        key: &PairKey,
        a: Uuid,
        b: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(Uuid, bool)> {
        self.with_conn_mut(|conn| {
            for user in [a, b] {
                if query_user_where(conn, "id = ?1", &user.to_string())?.is_none() {
                    return Err(StoreError::NotFound("user"));
                }
            }

            let tx = conn.transaction()?;
            if let Some(existing) = conversation_for_key(&tx, key)? {
                return Ok((existing, false));
            }

            insert_conversation(&tx, id, key, a, b, now)?;
            tx.commit()?;
            Ok((id, true))
        })
    }

    pub fn conversation_exists(&self, id: Uuid) -> Result<bool> {
        self.with_conn(|conn| conversation_exists(conn, &id.to_string()))
    }

    // -- Messages --

    /// Appends and commits. `created_at` never precedes the conversation's
    /// previous message, so time order and insertion order agree.
    pub fn append_message(
        &self,
        id: Uuid,
        conversation_id: Uuid,
        sender_id: Uuid,
        body: &MessageBody,
        now: DateTime<Utc>,
    ) -> Result<Message> {
        self.with_conn_mut(|conn| {
            let cid = conversation_id.to_string();
            let tx = conn.transaction()?;

            if !conversation_exists(&tx, &cid)? {
                return Err(StoreError::NotFound("conversation"));
            }

            let previous: Option<i64> = tx.query_row(
                "SELECT max(created_at) FROM messages WHERE conversation_id = ?1",
                [&cid],
                |row| row.get(0),
            )?;
            let created_at = previous.map_or(millis(now), |p| p.max(millis(now)));

            tx.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, kind, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.to_string(),
                    cid,
                    sender_id.to_string(),
                    body.kind(),
                    body.content(),
                    created_at
                ],
            )?;
            let seq = tx.last_insert_rowid();
            tx.commit()?;

            Ok(Message {
                id,
                conversation_id,
                sender_id,
                body: body.clone(),
                created_at: from_millis(created_at)?,
                seq,
            })
        })
    }

    /// Full history, oldest first.
    pub fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>> {
        self.list_messages_after(conversation_id, 0)
    }

    /// Messages with `seq > after_seq`, oldest first.
    pub fn list_messages_after(&self, conversation_id: Uuid, after_seq: i64) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let cid = conversation_id.to_string();
            if !conversation_exists(conn, &cid)? {
                return Err(StoreError::NotFound("conversation"));
            }

            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE conversation_id = ?1 AND seq > ?2
                 ORDER BY created_at ASC, seq ASC"
            ))?;

            let rows = stmt
                .query_map(params![cid, after_seq], |row| {
                    Ok(MessageRow {
                        seq: row.get(0)?,
                        id: row.get(1)?,
                        conversation_id: row.get(2)?,
                        sender_id: row.get(3)?,
                        kind: row.get(4)?,
                        content: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            rows.into_iter().map(MessageRow::into_message).collect()
        })
    }

    // -- Directory rows --

    pub fn list_directory(&self, owner_user_id: Uuid) -> Result<Vec<DirectoryRow>> {
        self.with_conn(|conn| {
            query_directory_where(conn, "owner_user_id = ?1", &owner_user_id.to_string())
        })
    }

    /// Both mirror rows of a conversation.
    pub fn conversation_rows(&self, conversation_id: Uuid) -> Result<Vec<DirectoryRow>> {
        self.with_conn(|conn| {
            query_directory_where(conn, "conversation_id = ?1", &conversation_id.to_string())
        })
    }

    pub fn directory_row(&self, owner_user_id: Uuid, conversation_id: Uuid) -> Result<Option<DirectoryRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {DIRECTORY_COLUMNS} FROM directory_rows
                 WHERE owner_user_id = ?1 AND conversation_id = ?2"
            ))?;
            stmt.query_row(
                params![owner_user_id.to_string(), conversation_id.to_string()],
                directory_from_row,
            )
            .optional()?
            .map(DirectoryRecord::into_row)
            .transpose()
        })
    }

    /// Clears the unread flag. Idempotent.
    pub fn mark_seen(&self, owner_user_id: Uuid, conversation_id: Uuid) -> Result<()> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE directory_rows SET unread = 0
                 WHERE owner_user_id = ?1 AND conversation_id = ?2",
                params![owner_user_id.to_string(), conversation_id.to_string()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound("directory row"));
            }
            Ok(())
        })
    }

    /// Updates both mirror rows in one transaction. The recipient's row turns
    /// unread; the sender's flag is left alone. A late, older message never
    /// replaces a newer preview.
    pub fn apply_new_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        preview: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            let cid = conversation_id.to_string();
            let sid = sender_id.to_string();
            let tx = conn.transaction()?;

            let owners: Vec<String> = {
                let mut stmt =
                    tx.prepare("SELECT owner_user_id FROM directory_rows WHERE conversation_id = ?1")?;
                stmt.query_map([&cid], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            };
            if owners.is_empty() {
                return Err(StoreError::NotFound("conversation"));
            }
            if !owners.contains(&sid) {
                return Err(StoreError::Unauthorized {
                    user_id: sender_id,
                    conversation_id,
                });
            }
            if owners.len() != 2 {
                return Err(StoreError::Corrupt(format!(
                    "conversation {} has {} directory rows",
                    conversation_id,
                    owners.len()
                )));
            }

            tx.execute(
                "UPDATE directory_rows SET
                    last_message_preview = CASE WHEN ?3 >= last_message_at THEN ?4 ELSE last_message_preview END,
                    last_message_at = max(last_message_at, ?3),
                    unread = CASE WHEN owner_user_id = ?2 THEN unread ELSE 1 END
                 WHERE conversation_id = ?1",
                params![cid, sid, millis(at), preview],
            )?;

            tx.commit()?;
            Ok(())
        })
    }

    // -- Blobs --

    /// Content-addressed, so re-uploading the same bytes is a no-op.
    pub fn insert_blob(
        &self,
        id: &str,
        uploader_id: Uuid,
        content_type: &str,
        size: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO blobs (id, uploader_id, content_type, size, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, uploader_id.to_string(), content_type, size, millis(now)],
            )?;
            Ok(())
        })
    }

    pub fn get_blob(&self, id: &str) -> Result<Option<BlobRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, uploader_id, content_type, size, created_at FROM blobs WHERE id = ?1",
                [id],
                |row| {
                    Ok(BlobRow {
                        id: row.get(0)?,
                        uploader_id: row.get(1)?,
                        content_type: row.get(2)?,
                        size: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()
        })
    }
}

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        username: row.get(1)?,
        password: row.get(2)?,
        name: row.get(3)?,
        avatar: row.get(4)?,
        bio: row.get(5)?,
        last_active: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn directory_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DirectoryRecord> {
    Ok(DirectoryRecord {
        owner_user_id: row.get(0)?,
        conversation_id: row.get(1)?,
        peer_user_id: row.get(2)?,
        last_message_preview: row.get(3)?,
        last_message_at: row.get(4)?,
        unread: row.get(5)?,
    })
}

fn query_user_where(conn: &Connection, clause: &str, value: &str) -> Result<Option<UserRow>> {
    let mut stmt = conn.prepare(&format!("SELECT {USER_COLUMNS} FROM users WHERE {clause}"))?;
    stmt.query_row([value], user_from_row).optional()
}

fn query_directory_where(conn: &Connection, clause: &str, value: &str) -> Result<Vec<DirectoryRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {DIRECTORY_COLUMNS} FROM directory_rows WHERE {clause}"
    ))?;
    let rows = stmt
        .query_map([value], directory_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    rows.into_iter().map(DirectoryRecord::into_row).collect()
}

fn conversation_for_key(conn: &Connection, key: &PairKey) -> Result<Option<Uuid>> {
    conn.query_row(
        "SELECT conversation_id FROM conversation_keys WHERE pair_key = ?1",
        [key.as_str()],
        |row| row.get::<_, String>(0),
    )
    .optional()?
    .map(|raw| parse_id(&raw))
    .transpose()
}

/// Conversation, key mapping and both mirrored rows. The primary key on
/// `conversation_keys.pair_key` turns a second insert for a pair into a
/// `Conflict`.
fn insert_conversation(
    conn: &Connection,
    id: Uuid,
    key: &PairKey,
    a: Uuid,
    b: Uuid,
    now: DateTime<Utc>,
) -> Result<()> {
    let at = millis(now);

    conn.execute(
        "INSERT INTO conversations (id, created_at) VALUES (?1, ?2)",
        params![id.to_string(), at],
    )?;

    conn.execute(
        "INSERT INTO conversation_keys (pair_key, conversation_id) VALUES (?1, ?2)",
        params![key.as_str(), id.to_string()],
    )
    .map_err(|e| {
        if is_constraint_violation(&e) {
            StoreError::Conflict(format!("pair {} already has a conversation", key))
        } else {
            e.into()
        }
    })?;

    for (owner, peer) in [(a, b), (b, a)] {
        conn.execute(
            "INSERT INTO directory_rows
                (owner_user_id, conversation_id, peer_user_id, last_message_preview, last_message_at, unread)
             VALUES (?1, ?2, ?3, '', ?4, 0)",
            params![owner.to_string(), id.to_string(), peer.to_string(), at],
        )?;
    }
    Ok(())
}

fn conversation_exists(conn: &Connection, id: &str) -> Result<bool> {
    let found = conn
        .query_row("SELECT 1 FROM conversations WHERE id = ?1", [id], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
