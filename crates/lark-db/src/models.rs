/// Database row types — these map directly to SQLite rows.
/// Distinct from lark-types presentation models to keep the DB layer
/// independent.

pub struct UserRow {
    pub id: String,
    pub name: String,
    pub email: String,
    pub avatar: Option<String>,
    pub status: String,
    pub created_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub content: String,
    /// JSON array of attachment references.
    pub attachments: String,
    pub sent_at: String,
    pub is_read: bool,
    pub read_at: Option<String>,
}

pub struct NotificationRow {
    pub id: String,
    pub user_id: String,
    pub kind: String,
    pub related_id: String,
    pub is_read: bool,
    pub created_at: String,
    pub read_at: Option<String>,
    pub sender_id: Option<String>,
    pub sender_name: Option<String>,
    pub preview: Option<String>,
}
