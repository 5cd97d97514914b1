//! v001 -- Initial schema creation.
//!
//! Conversations with their membership and moderator sets, the append-only
//! message log, and the mutable overlay (edits, soft-deletes, reactions).

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Conversations (communities and direct threads)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    id            TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    kind          TEXT NOT NULL,               -- 'community' | 'direct'
    name          TEXT NOT NULL,
    description   TEXT NOT NULL DEFAULT '',
    visibility    TEXT NOT NULL,               -- 'public' | 'private' | 'restricted'
    creator_id    TEXT NOT NULL,
    direct_key    TEXT UNIQUE,                 -- sorted participant pair, direct only
    message_count INTEGER NOT NULL DEFAULT 0,  -- equals the last assigned seq
    active        INTEGER NOT NULL DEFAULT 1,  -- boolean 0/1
    created_at    TEXT NOT NULL                -- RFC-3339
);

CREATE TABLE IF NOT EXISTS members (
    conversation_id TEXT NOT NULL,
    user_id         TEXT NOT NULL,
    joined_at       TEXT NOT NULL,

    PRIMARY KEY (conversation_id, user_id),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id)
);

CREATE INDEX IF NOT EXISTS idx_members_user ON members(user_id);

-- Ordered by rowid: promotion order.
CREATE TABLE IF NOT EXISTS moderators (
    conversation_id TEXT NOT NULL,
    user_id         TEXT NOT NULL,
    promoted_at     TEXT NOT NULL,

    UNIQUE (conversation_id, user_id),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id)
);

-- ----------------------------------------------------------------
-- Messages (append-only)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id              TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    conversation_id TEXT NOT NULL,
    seq             INTEGER NOT NULL,           -- per-conversation, starts at 1
    sender_id       TEXT NOT NULL,
    sender_name     TEXT NOT NULL,              -- snapshot at send time
    content         TEXT NOT NULL,
    content_type    TEXT NOT NULL,
    attachment_url  TEXT,
    attachment_name TEXT,
    reply_to        TEXT,                       -- message id, same conversation
    created_at      TEXT NOT NULL,

    UNIQUE (conversation_id, seq),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id)
);

-- ----------------------------------------------------------------
-- Overlay (the only mutable message state)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS message_overlays (
    message_id     TEXT PRIMARY KEY NOT NULL,
    edited_content TEXT,
    edited_at      TEXT,
    deleted        INTEGER NOT NULL DEFAULT 0,
    deleted_at     TEXT,
    revision       INTEGER NOT NULL DEFAULT 0,  -- bumped on every mutation

    FOREIGN KEY (message_id) REFERENCES messages(id)
);

CREATE TABLE IF NOT EXISTS reactions (
    message_id TEXT NOT NULL,
    emoji      TEXT NOT NULL,
    user_id    TEXT NOT NULL,
    created_at TEXT NOT NULL,

    PRIMARY KEY (message_id, emoji, user_id),
    FOREIGN KEY (message_id) REFERENCES messages(id)
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
