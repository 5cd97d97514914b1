//! Membership, moderator and invitation sets.
//!
//! The mutators return whether a row actually changed so callers can treat
//! repeated calls as idempotent no-ops.

use chrono::Utc;
use rusqlite::params;

use gubae_shared::{ConversationId, UserId};

use crate::database::Database;
use crate::error::Result;

impl Database {
    // ------------------------------------------------------------------
    // Members
    // ------------------------------------------------------------------

    pub fn add_member(&self, conversation: ConversationId, user: &UserId) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO members (conversation_id, user_id, joined_at)
             VALUES (?1, ?2, ?3)",
            params![conversation.to_string(), user.as_str(), Utc::now().to_rfc3339()],
        )?;
        Ok(affected > 0)
    }

    /// Remove a member, and their moderator seat with it.
    pub fn remove_member(&mut self, conversation: ConversationId, user: &UserId) -> Result<bool> {
        let id = conversation.to_string();
        let tx = self.conn_mut().transaction()?;
        tx.execute(
            "DELETE FROM moderators WHERE conversation_id = ?1 AND user_id = ?2",
            params![id, user.as_str()],
        )?;
        let affected = tx.execute(
            "DELETE FROM members WHERE conversation_id = ?1 AND user_id = ?2",
            params![id, user.as_str()],
        )?;
        tx.commit()?;
        Ok(affected > 0)
    }

    pub fn is_member(&self, conversation: ConversationId, user: &UserId) -> Result<bool> {
        let found: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM members WHERE conversation_id = ?1 AND user_id = ?2",
            params![conversation.to_string(), user.as_str()],
            |row| row.get(0),
        )?;
        Ok(found > 0)
    }

    /// Members sorted by user id.
    pub fn list_members(&self, conversation: ConversationId) -> Result<Vec<UserId>> {
        self.user_column(
            "SELECT user_id FROM members WHERE conversation_id = ?1 ORDER BY user_id ASC",
            conversation,
        )
    }

    /// True when both users are members of at least one active conversation.
    pub fn shares_conversation(&self, a: &UserId, b: &UserId) -> Result<bool> {
        let found: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM members ma
             JOIN members mb ON mb.conversation_id = ma.conversation_id
             JOIN conversations c ON c.id = ma.conversation_id
             WHERE ma.user_id = ?1 AND mb.user_id = ?2 AND c.active = 1",
            params![a.as_str(), b.as_str()],
            |row| row.get(0),
        )?;
        Ok(found > 0)
    }

    // ------------------------------------------------------------------
    // Moderators
    // ------------------------------------------------------------------

    pub fn add_moderator(&self, conversation: ConversationId, user: &UserId) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO moderators (conversation_id, user_id, promoted_at)
             VALUES (?1, ?2, ?3)",
            params![conversation.to_string(), user.as_str(), Utc::now().to_rfc3339()],
        )?;
        Ok(affected > 0)
    }

    pub fn remove_moderator(&self, conversation: ConversationId, user: &UserId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM moderators WHERE conversation_id = ?1 AND user_id = ?2",
            params![conversation.to_string(), user.as_str()],
        )?;
        Ok(affected > 0)
    }

    pub fn is_moderator(&self, conversation: ConversationId, user: &UserId) -> Result<bool> {
        let found: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM moderators WHERE conversation_id = ?1 AND user_id = ?2",
            params![conversation.to_string(), user.as_str()],
            |row| row.get(0),
        )?;
        Ok(found > 0)
    }

    /// Moderators in promotion order.
    pub fn list_moderators(&self, conversation: ConversationId) -> Result<Vec<UserId>> {
        self.user_column(
            "SELECT user_id FROM moderators WHERE conversation_id = ?1 ORDER BY rowid ASC",
            conversation,
        )
    }

    // ------------------------------------------------------------------
    // Invites
    // ------------------------------------------------------------------

    pub fn add_invite(
        &self,
        conversation: ConversationId,
        user: &UserId,
        invited_by: &UserId,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO invites (conversation_id, user_id, invited_by, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                conversation.to_string(),
                user.as_str(),
                invited_by.as_str(),
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(affected > 0)
    }

    pub fn has_invite(&self, conversation: ConversationId, user: &UserId) -> Result<bool> {
        let found: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM invites WHERE conversation_id = ?1 AND user_id = ?2",
            params![conversation.to_string(), user.as_str()],
            |row| row.get(0),
        )?;
        Ok(found > 0)
    }

    pub fn remove_invite(&self, conversation: ConversationId, user: &UserId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM invites WHERE conversation_id = ?1 AND user_id = ?2",
            params![conversation.to_string(), user.as_str()],
        )?;
        Ok(affected > 0)
    }

    fn user_column(&self, sql: &str, conversation: ConversationId) -> Result<Vec<UserId>> {
        let mut stmt = self.conn().prepare(sql)?;
        let rows = stmt.query_map(params![conversation.to_string()], |row| {
            row.get::<_, String>(0).map(UserId)
        })?;

        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }
}
