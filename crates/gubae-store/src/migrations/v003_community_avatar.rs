//! v003 -- Optional community avatar image.

use rusqlite::Connection;

const UP_SQL: &str = r#"
-- URL of the community's avatar image; NULL when unset
ALTER TABLE conversations ADD COLUMN avatar_url TEXT;
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
