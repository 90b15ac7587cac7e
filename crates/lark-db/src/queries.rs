use crate::Database;
use crate::models::{MessageRow, NotificationRow, UserRow};
use anyhow::Result;
use rusqlite::{Connection, OptionalExtension};
use rusqlite::types::ToSql;

impl Database {
    // -- Users (Directory collaborator) --

    pub fn create_user(
        &self,
        id: &str,
        name: &str,
        email: &str,
        avatar: Option<&str>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, name, email, avatar) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![id, name, email, avatar],
            )?;
            Ok(())
        })
    }

    /// Update a user's durable status and return the row, `None` if the
    /// user does not exist. Callers on the connect/disconnect path treat
    /// failures here as non-critical.
    pub fn find_and_set_status(&self, id: &str, status: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE users SET status = ?1 WHERE id = ?2",
                rusqlite::params![status, id],
            )?;
            if updated == 0 {
                return Ok(None);
            }
            query_user_by_id(conn, id)
        })
    }

    pub fn get_user(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user_by_id(conn, id))
    }

    // -- Messages --

    pub fn insert_message(
        &self,
        id: &str,
        sender_id: &str,
        recipient_id: &str,
        content: &str,
        attachments_json: &str,
        sent_at: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, sender_id, recipient_id, content, attachments, sent_at, is_read)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
                rusqlite::params![id, sender_id, recipient_id, content, attachments_json, sent_at],
            )?;
            Ok(())
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| query_message_by_id(conn, id))
    }

    /// Bulk-mark messages read, constrained to rows where the caller is the
    /// recipient and the flag is still unset. Returns the ids actually
    /// flipped, so the session layer emits receipts only for those.
    pub fn mark_messages_read(
        &self,
        ids: &[String],
        recipient_id: &str,
        read_at: &str,
    ) -> Result<Vec<String>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{i}")).collect();
            let select_sql = format!(
                "SELECT id FROM messages WHERE id IN ({}) AND recipient_id = ?{} AND is_read = 0",
                placeholders.join(", "),
                ids.len() + 1
            );

            let mut params: Vec<&dyn ToSql> = ids.iter().map(|id| id as &dyn ToSql).collect();
            params.push(&recipient_id);

            let mut stmt = conn.prepare(&select_sql)?;
            let affected = stmt
                .query_map(params.as_slice(), |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            drop(stmt);

            if affected.is_empty() {
                return Ok(affected);
            }

            let placeholders: Vec<String> =
                (2..=affected.len() + 1).map(|i| format!("?{i}")).collect();
            let update_sql = format!(
                "UPDATE messages SET is_read = 1, read_at = ?1 WHERE id IN ({})",
                placeholders.join(", ")
            );

            let mut params: Vec<&dyn ToSql> = vec![&read_at];
            params.extend(affected.iter().map(|id| id as &dyn ToSql));
            conn.execute(&update_sql, params.as_slice())?;

            Ok(affected)
        })
    }

    /// Delete a message, returning the deleted row if it existed.
    pub fn delete_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let row = query_message_by_id(conn, id)?;
            if row.is_some() {
                conn.execute("DELETE FROM messages WHERE id = ?1", [id])?;
            }
            Ok(row)
        })
    }

    // -- Notifications --

    /// Idempotent create of a message-kind notification. The UNIQUE key on
    /// (user_id, kind, related_id) absorbs retries and interleavings: a
    /// second attempt for the same message returns the existing row.
    #[allow(clippy::too_many_arguments)]
    pub fn create_message_notification(
        &self,
        id: &str,
        user_id: &str,
        related_id: &str,
        created_at: &str,
        sender_id: &str,
        sender_name: &str,
        preview: &str,
    ) -> Result<NotificationRow> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO notifications (id, user_id, kind, related_id, is_read, created_at, sender_id, sender_name, preview)
                 VALUES (?1, ?2, 'message', ?3, 0, ?4, ?5, ?6, ?7)
                 ON CONFLICT(user_id, kind, related_id) DO NOTHING",
                rusqlite::params![id, user_id, related_id, created_at, sender_id, sender_name, preview],
            )?;

            query_notification_by_key(conn, user_id, "message", related_id)?
                .ok_or_else(|| anyhow::anyhow!("notification vanished after insert: {}", related_id))
        })
    }

    pub fn find_notification(
        &self,
        user_id: &str,
        kind: &str,
        related_id: &str,
    ) -> Result<Option<NotificationRow>> {
        self.with_conn(|conn| query_notification_by_key(conn, user_id, kind, related_id))
    }

    /// Unread notifications for a user, newest first, with the referenced
    /// message populated for message-kind rows. The cap is a bounded-read
    /// policy, not pagination.
    pub fn unread_notifications(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<(NotificationRow, Option<MessageRow>)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT n.id, n.user_id, n.kind, n.related_id, n.is_read, n.created_at,
                        n.read_at, n.sender_id, n.sender_name, n.preview,
                        m.id, m.sender_id, m.recipient_id, m.content, m.attachments,
                        m.sent_at, m.is_read, m.read_at
                 FROM notifications n
                 LEFT JOIN messages m ON n.kind = 'message' AND m.id = n.related_id
                 WHERE n.user_id = ?1 AND n.is_read = 0
                 ORDER BY n.created_at DESC
                 LIMIT ?2",
            )?;

            let rows = stmt
                .query_map(rusqlite::params![user_id, limit], |row| {
                    let notification = NotificationRow {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        kind: row.get(2)?,
                        related_id: row.get(3)?,
                        is_read: row.get(4)?,
                        created_at: row.get(5)?,
                        read_at: row.get(6)?,
                        sender_id: row.get(7)?,
                        sender_name: row.get(8)?,
                        preview: row.get(9)?,
                    };

                    let message = match row.get::<_, Option<String>>(10)? {
                        Some(id) => Some(MessageRow {
                            id,
                            sender_id: row.get(11)?,
                            recipient_id: row.get(12)?,
                            content: row.get(13)?,
                            attachments: row.get(14)?,
                            sent_at: row.get(15)?,
                            is_read: row.get(16)?,
                            read_at: row.get(17)?,
                        }),
                        None => None,
                    };

                    Ok((notification, message))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    pub fn unread_notification_count(&self, user_id: &str) -> Result<u64> {
        self.with_conn(|conn| {
            let count: u64 = conn.query_row(
                "SELECT COUNT(*) FROM notifications WHERE user_id = ?1 AND is_read = 0",
                [user_id],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    /// Bulk-mark notifications read, scoped to the owner. Returns the
    /// number of rows flipped.
    pub fn mark_notifications_read(
        &self,
        ids: &[String],
        user_id: &str,
        read_at: &str,
    ) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> = (3..=ids.len() + 2).map(|i| format!("?{i}")).collect();
            let sql = format!(
                "UPDATE notifications SET is_read = 1, read_at = ?1
                 WHERE user_id = ?2 AND is_read = 0 AND id IN ({})",
                placeholders.join(", ")
            );

            let mut params: Vec<&dyn ToSql> = vec![&read_at, &user_id];
            params.extend(ids.iter().map(|id| id as &dyn ToSql));
            let updated = conn.execute(&sql, params.as_slice())?;
            Ok(updated)
        })
    }

    /// Mark message-kind notifications read by the ids of the messages they
    /// reference, scoped to the owner.
    pub fn mark_message_notifications_read(
        &self,
        message_ids: &[String],
        user_id: &str,
        read_at: &str,
    ) -> Result<usize> {
        if message_ids.is_empty() {
            return Ok(0);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> =
                (3..=message_ids.len() + 2).map(|i| format!("?{i}")).collect();
            let sql = format!(
                "UPDATE notifications SET is_read = 1, read_at = ?1
                 WHERE user_id = ?2 AND kind = 'message' AND is_read = 0 AND related_id IN ({})",
                placeholders.join(", ")
            );

            let mut params: Vec<&dyn ToSql> = vec![&read_at, &user_id];
            params.extend(message_ids.iter().map(|id| id as &dyn ToSql));
            let updated = conn.execute(&sql, params.as_slice())?;
            Ok(updated)
        })
    }

    /// Remove every notification referencing a record. Called explicitly
    /// from the delete-message path; there is no automatic cascade.
    pub fn delete_notifications_for_related(&self, related_id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM notifications WHERE related_id = ?1",
                [related_id],
            )?;
            Ok(deleted)
        })
    }
}

fn query_user_by_id(conn: &Connection, id: &str) -> Result<Option<UserRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, email, avatar, status, created_at FROM users WHERE id = ?1",
    )?;

    let row = stmt
        .query_row([id], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                name: row.get(1)?,
                email: row.get(2)?,
                avatar: row.get(3)?,
                status: row.get(4)?,
                created_at: row.get(5)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn query_message_by_id(conn: &Connection, id: &str) -> Result<Option<MessageRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, sender_id, recipient_id, content, attachments, sent_at, is_read, read_at
         FROM messages WHERE id = ?1",
    )?;

    let row = stmt
        .query_row([id], |row| {
            Ok(MessageRow {
                id: row.get(0)?,
                sender_id: row.get(1)?,
                recipient_id: row.get(2)?,
                content: row.get(3)?,
                attachments: row.get(4)?,
                sent_at: row.get(5)?,
                is_read: row.get(6)?,
                read_at: row.get(7)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn query_notification_by_key(
    conn: &Connection,
    user_id: &str,
    kind: &str,
    related_id: &str,
) -> Result<Option<NotificationRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, kind, related_id, is_read, created_at, read_at, sender_id, sender_name, preview
         FROM notifications WHERE user_id = ?1 AND kind = ?2 AND related_id = ?3",
    )?;

    let row = stmt
        .query_row(rusqlite::params![user_id, kind, related_id], |row| {
            Ok(NotificationRow {
                id: row.get(0)?,
                user_id: row.get(1)?,
                kind: row.get(2)?,
                related_id: row.get(3)?,
                is_read: row.get(4)?,
                created_at: row.get(5)?,
                read_at: row.get(6)?,
                sender_id: row.get(7)?,
                sender_name: row.get(8)?,
                preview: row.get(9)?,
            })
        })
        .optional()?;

    Ok(row)
}
