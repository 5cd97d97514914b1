//! Overlay mutations: edits, soft-deletes and reactions.
//!
//! The message record itself is never updated. Every successful overlay
//! mutation bumps `revision`; edit and delete take the revision the caller
//! last saw and only apply if it still matches (compare-and-set).

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use rusqlite::params;

use gubae_shared::{MessageId, UserId};

use crate::database::{col_opt_ts, col_u64, Database};
use crate::error::{not_found, Result};
use crate::models::MessageOverlay;

impl Database {
    pub fn get_overlay(&self, message: MessageId) -> Result<MessageOverlay> {
        let id = message.to_string();
        let mut overlay = self
            .conn()
            .query_row(
                "SELECT edited_content, edited_at, deleted, deleted_at, revision
                 FROM message_overlays WHERE message_id = ?1",
                params![id],
                |row| {
                    Ok(MessageOverlay {
                        edited_content: row.get(0)?,
                        edited_at: col_opt_ts(row, 1)?,
                        deleted: row.get(2)?,
                        deleted_at: col_opt_ts(row, 3)?,
                        reactions: BTreeMap::new(),
                        revision: col_u64(row, 4)?,
                    })
                },
            )
            .map_err(not_found)?;

        let mut stmt = self.conn().prepare(
            "SELECT emoji, user_id FROM reactions WHERE message_id = ?1
             ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (emoji, user) = row?;
            overlay
                .reactions
                .entry(emoji)
                .or_insert_with(BTreeSet::new)
                .insert(UserId(user));
        }
        Ok(overlay)
    }

    /// Replace the visible content. Returns `false` when `expected_revision`
    /// no longer matches.
    pub fn edit_message_content(
        &self,
        message: MessageId,
        content: &str,
        edited_at: DateTime<Utc>,
        expected_revision: u64,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE message_overlays
             SET edited_content = ?1, edited_at = ?2, revision = revision + 1
             WHERE message_id = ?3 AND revision = ?4",
            params![
                content,
                edited_at.to_rfc3339(),
                message.to_string(),
                expected_revision as i64
            ],
        )?;
        Ok(affected > 0)
    }

    /// Mark the message deleted. Returns `false` when `expected_revision`
    /// no longer matches.
    pub fn soft_delete_message(
        &self,
        message: MessageId,
        deleted_at: DateTime<Utc>,
        expected_revision: u64,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE message_overlays
             SET deleted = 1, deleted_at = ?1, revision = revision + 1
             WHERE message_id = ?2 AND revision = ?3",
            params![deleted_at.to_rfc3339(), message.to_string(), expected_revision as i64],
        )?;
        Ok(affected > 0)
    }

    /// Add a reaction. Returns `false` if the user already reacted with
    /// `emoji`, in which case nothing changes.
    pub fn add_reaction(&mut self, message: MessageId, emoji: &str, user: &UserId) -> Result<bool> {
        let id = message.to_string();
        let tx = self.conn_mut().transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO reactions (message_id, emoji, user_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![id, emoji, user.as_str(), Utc::now().to_rfc3339()],
        )?;
        if inserted > 0 {
            tx.execute(
                "UPDATE message_overlays SET revision = revision + 1 WHERE message_id = ?1",
                params![id],
            )?;
        }
        tx.commit()?;
        Ok(inserted > 0)
    }

    /// Remove a reaction. Returns `false` if there was nothing to remove.
    pub fn remove_reaction(
        &mut self,
        message: MessageId,
        emoji: &str,
        user: &UserId,
    ) -> Result<bool> {
        let id = message.to_string();
        let tx = self.conn_mut().transaction()?;
        let removed = tx.execute(
            "DELETE FROM reactions WHERE message_id = ?1 AND emoji = ?2 AND user_id = ?3",
            params![id, emoji, user.as_str()],
        )?;
        if removed > 0 {
            tx.execute(
                "UPDATE message_overlays SET revision = revision + 1 WHERE message_id = ?1",
                params![id],
            )?;
        }
        tx.commit()?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversations::new_community;
    use crate::models::NewMessage;
    use gubae_shared::{ContentType, Visibility};

    fn setup() -> (Database, MessageId) {
        let mut db = Database::open_in_memory().unwrap();
        let alice = UserId::new("alice");
        let c = new_community(&alice, "Youth", "", Visibility::Public, vec![]);
        db.insert_conversation(&c, None).unwrap();
        let m = db
            .append_message(&NewMessage {
                id: MessageId::new(),
                conversation_id: c.id,
                sender_id: alice,
                sender_name: "Alice".into(),
                content: "Welcome!".into(),
                content_type: ContentType::Text,
                attachment: None,
                reply_to: None,
                created_at: Utc::now(),
            })
            .unwrap();
        (db, m.id)
    }

    #[test]
    fn reactions_are_idempotent() {
        let (mut db, id) = setup();
        let bob = UserId::new("bob");

        assert!(db.add_reaction(id, "❤", &bob).unwrap());
        assert!(!db.add_reaction(id, "❤", &bob).unwrap());

        let overlay = db.get_overlay(id).unwrap();
        assert_eq!(overlay.reactions["❤"].len(), 1);
        assert_eq!(overlay.revision, 1);

        assert!(db.remove_reaction(id, "❤", &bob).unwrap());
        assert!(!db.remove_reaction(id, "❤", &bob).unwrap());
        let overlay = db.get_overlay(id).unwrap();
        assert!(overlay.reactions.is_empty());
        assert_eq!(overlay.revision, 2);
    }

    #[test]
    fn edit_requires_current_revision() {
        let (db, id) = setup();

        assert!(db.edit_message_content(id, "Welcome all!", Utc::now(), 0).unwrap());
        assert!(!db.edit_message_content(id, "stale", Utc::now(), 0).unwrap());

        let overlay = db.get_overlay(id).unwrap();
        assert_eq!(overlay.edited_content.as_deref(), Some("Welcome all!"));
        assert!(overlay.edited_at.is_some());
        assert_eq!(overlay.revision, 1);

        // The record is untouched.
        assert_eq!(db.get_message(id).unwrap().content, "Welcome!");
    }

    #[test]
    fn soft_delete_keeps_record() {
        let (db, id) = setup();
        assert!(db.soft_delete_message(id, Utc::now(), 0).unwrap());

        let overlay = db.get_overlay(id).unwrap();
        assert!(overlay.deleted);
        assert!(db.get_message(id).is_ok());
    }

    #[test]
    fn overlay_of_unknown_message_is_not_found() {
        let (db, _) = setup();
        assert!(matches!(
            db.get_overlay(MessageId::new()),
            Err(crate::StoreError::NotFound)
        ));
    }
}
