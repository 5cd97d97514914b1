use rusqlite::Connection;

const UP_SQL: &str = r#"
-- Community rules, JSON array of strings
ALTER TABLE conversations ADD COLUMN rules TEXT NOT NULL DEFAULT '[]';

-- Pending invitations, consumed on join
CREATE TABLE IF NOT EXISTS invites (
    conversation_id TEXT NOT NULL,
    user_id         TEXT NOT NULL,
    invited_by      TEXT NOT NULL,
    created_at      TEXT NOT NULL,

    PRIMARY KEY (conversation_id, user_id),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id)
);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
