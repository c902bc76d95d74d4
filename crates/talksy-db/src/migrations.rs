use rusqlite::Connection;
use tracing::info;

use crate::Result;

// Timestamps are unix epoch milliseconds.
pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            username    TEXT NOT NULL UNIQUE,
            password    TEXT NOT NULL,
            name        TEXT,
            avatar      TEXT,
            bio         TEXT,
            last_active INTEGER,
            created_at  INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS conversations (
            id          TEXT PRIMARY KEY,
            created_at  INTEGER NOT NULL
        );

        -- Canonical pair key -> conversation. Only the creation protocol writes here.
        CREATE TABLE IF NOT EXISTS conversation_keys (
            pair_key        TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL UNIQUE REFERENCES conversations(id)
        );

        CREATE TABLE IF NOT EXISTS messages (
            seq             INTEGER PRIMARY KEY AUTOINCREMENT,
            id              TEXT NOT NULL UNIQUE,
            conversation_id TEXT NOT NULL REFERENCES conversations(id),
            sender_id       TEXT NOT NULL REFERENCES users(id),
            kind            TEXT NOT NULL,
            content         TEXT NOT NULL,
            created_at      INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, created_at, seq);

        CREATE TABLE IF NOT EXISTS directory_rows (
            owner_user_id        TEXT NOT NULL REFERENCES users(id),
            conversation_id      TEXT NOT NULL REFERENCES conversations(id),
            peer_user_id         TEXT NOT NULL REFERENCES users(id),
            last_message_preview TEXT NOT NULL DEFAULT '',
            last_message_at      INTEGER NOT NULL,
            unread               INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (owner_user_id, conversation_id)
        );

        CREATE INDEX IF NOT EXISTS idx_directory_owner
            ON directory_rows(owner_user_id);

        CREATE INDEX IF NOT EXISTS idx_directory_conversation
            ON directory_rows(conversation_id);

        CREATE TABLE IF NOT EXISTS blobs (
            id           TEXT PRIMARY KEY,
            uploader_id  TEXT NOT NULL REFERENCES users(id),
            content_type TEXT NOT NULL,
            size         INTEGER NOT NULL,
            created_at   INTEGER NOT NULL
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
