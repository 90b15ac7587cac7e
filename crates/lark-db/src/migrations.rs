use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            email       TEXT NOT NULL UNIQUE,
            avatar      TEXT,
            status      TEXT NOT NULL DEFAULT 'offline',
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            sender_id       TEXT NOT NULL REFERENCES users(id),
            recipient_id    TEXT NOT NULL REFERENCES users(id),
            content         TEXT NOT NULL,
            attachments     TEXT NOT NULL DEFAULT '[]',
            sent_at         TEXT NOT NULL,
            is_read         INTEGER NOT NULL DEFAULT 0,
            read_at         TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_messages_recipient
            ON messages(recipient_id, is_read);

        -- related_id is a loose reference (message id or friend-request id
        -- depending on kind), so no foreign key. The UNIQUE key makes
        -- notification creation idempotent per (owner, kind, related).
        CREATE TABLE IF NOT EXISTS notifications (
            id          TEXT PRIMARY KEY,
            user_id     TEXT NOT NULL REFERENCES users(id),
            kind        TEXT NOT NULL CHECK (kind IN ('message', 'friend_request', 'friend_accepted')),
            related_id  TEXT NOT NULL,
            is_read     INTEGER NOT NULL DEFAULT 0,
            created_at  TEXT NOT NULL,
            read_at     TEXT,
            sender_id   TEXT,
            sender_name TEXT,
            preview     TEXT,
            UNIQUE(user_id, kind, related_id)
        );

        CREATE INDEX IF NOT EXISTS idx_notifications_unread
            ON notifications(user_id, is_read, created_at);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
