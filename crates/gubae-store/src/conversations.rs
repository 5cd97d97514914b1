//! CRUD operations for [`Conversation`] records.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use gubae_shared::{ConversationId, ConversationKind, UserId, Visibility};

use crate::database::{col_enum, col_ts, col_u64, col_uuid, Database};
use crate::error::{not_found, Result};
use crate::models::Conversation;

const CONVERSATION_COLUMNS: &str = "id, kind, name, description, visibility, creator_id, \
     rules, message_count, active, created_at, avatar_url";

/// Conversation row without its member and moderator sets.
struct ConversationRow {
    conversation: Conversation,
    rules_json: String,
}

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a conversation together with its initial members and
    /// moderators, atomically.
    ///
    /// `direct_key` must be set for direct threads; the unique index on it
    /// makes a concurrent duplicate insert fail instead of forking the thread.
    pub fn insert_conversation(
        &mut self,
        conversation: &Conversation,
        direct_key: Option<&str>,
    ) -> Result<()> {
        let rules = serde_json::to_string(&conversation.rules)?;
        let created = conversation.created_at.to_rfc3339();
        let id = conversation.id.to_string();

        let tx = self.conn_mut().transaction()?;
        tx.execute(
            "INSERT INTO conversations
                 (id, kind, name, description, visibility, creator_id, direct_key,
                  rules, message_count, active, created_at, avatar_url)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                id,
                conversation.kind.as_str(),
                conversation.name,
                conversation.description,
                conversation.visibility.as_str(),
                conversation.creator_id.as_str(),
                direct_key,
                rules,
                conversation.message_count as i64,
                conversation.active,
                created,
                conversation.avatar_url,
            ],
        )?;
        for member in &conversation.members {
            tx.execute(
                "INSERT OR IGNORE INTO members (conversation_id, user_id, joined_at)
                 VALUES (?1, ?2, ?3)",
                params![id, member.as_str(), created],
            )?;
        }
        for moderator in &conversation.moderators {
            tx.execute(
                "INSERT OR IGNORE INTO moderators (conversation_id, user_id, promoted_at)
                 VALUES (?1, ?2, ?3)",
                params![id, moderator.as_str(), created],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a conversation with its members and moderators.
    pub fn get_conversation(&self, id: ConversationId) -> Result<Conversation> {
        let row = self
            .conn()
            .query_row(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
                params![id.to_string()],
                row_to_conversation,
            )
            .map_err(not_found)?;
        self.hydrate(row)
    }

    /// Look up the direct thread registered under `key`
    /// (see [`direct_key`](crate::models::direct_key)).
    pub fn find_direct_conversation(&self, key: &str) -> Result<Option<Conversation>> {
        let row = self
            .conn()
            .query_row(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE direct_key = ?1"),
                params![key],
                row_to_conversation,
            )
            .optional()?;
        row.map(|r| self.hydrate(r)).transpose()
    }

    /// Conversations `user` belongs to, most recently created first.
    pub fn list_conversations_for_user(&self, user: &UserId) -> Result<Vec<Conversation>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations
             WHERE id IN (SELECT conversation_id FROM members WHERE user_id = ?1)
             ORDER BY created_at DESC"
        ))?;
        let rows = stmt.query_map(params![user.as_str()], row_to_conversation)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(self.hydrate(row?)?);
        }
        Ok(out)
    }

    /// Active communities visible to `viewer` whose name or description
    /// contains `query`, case-insensitively. An empty query matches all.
    ///
    /// Private communities are only visible to their members.
    pub fn search_communities(&self, viewer: &UserId, query: &str) -> Result<Vec<Conversation>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations
             WHERE kind = ?1 AND active = 1
               AND (visibility != ?2
                    OR id IN (SELECT conversation_id FROM members WHERE user_id = ?3))
             ORDER BY created_at DESC"
        ))?;
        let rows = stmt.query_map(
            params![
                ConversationKind::Community.as_str(),
                Visibility::Private.as_str(),
                viewer.as_str()
            ],
            row_to_conversation,
        )?;

        let needle = query.trim().to_lowercase();
        let mut out = Vec::new();
        for row in rows {
            let row = row?;
            let c = &row.conversation;
            if needle.is_empty()
                || c.name.to_lowercase().contains(&needle)
                || c.description.to_lowercase().contains(&needle)
            {
                out.push(self.hydrate(row)?);
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Set the active flag. Returns `true` if the flag changed.
    pub fn set_conversation_active(&self, id: ConversationId, active: bool) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE conversations SET active = ?1 WHERE id = ?2 AND active != ?1",
            params![active, id.to_string()],
        )?;
        Ok(affected > 0)
    }

    /// Update the descriptive fields of a community. `None` leaves a field
    /// unchanged; an empty `avatar_url` clears the avatar. Returns `true` if
    /// a row was updated.
    pub fn update_community_details(
        &self,
        id: ConversationId,
        name: Option<&str>,
        description: Option<&str>,
        rules: Option<&[String]>,
        avatar_url: Option<&str>,
    ) -> Result<bool> {
        let rules = rules.map(serde_json::to_string).transpose()?;
        let affected = self.conn().execute(
            "UPDATE conversations
             SET name = COALESCE(?1, name),
                 description = COALESCE(?2, description),
                 rules = COALESCE(?3, rules),
                 avatar_url = CASE WHEN ?4 IS NULL THEN avatar_url ELSE NULLIF(?4, '') END
             WHERE id = ?5 AND kind = ?6",
            params![
                name,
                description,
                rules,
                avatar_url,
                id.to_string(),
                ConversationKind::Community.as_str()
            ],
        )?;
        Ok(affected > 0)
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn hydrate(&self, row: ConversationRow) -> Result<Conversation> {
        let mut conversation = row.conversation;
        conversation.rules = serde_json::from_str(&row.rules_json)?;
        conversation.members = self.list_members(conversation.id)?;
        conversation.moderators = self.list_moderators(conversation.id)?;
        Ok(conversation)
    }
}

/// Map a `rusqlite::Row` (see `CONVERSATION_COLUMNS`) to a bare conversation.
fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationRow> {
    let creator: String = row.get(5)?;
    Ok(ConversationRow {
        conversation: Conversation {
            id: ConversationId(col_uuid(row, 0)?),
            kind: col_enum(row, 1)?,
            name: row.get(2)?,
            description: row.get(3)?,
            visibility: col_enum(row, 4)?,
            creator_id: UserId(creator),
            moderators: Vec::new(),
            members: Vec::new(),
            rules: Vec::new(),
            avatar_url: row.get(10)?,
            message_count: col_u64(row, 7)?,
            active: row.get(8)?,
            created_at: col_ts(row, 9)?,
        },
        rules_json: row.get(6)?,
    })
}

/// A fresh community value, not yet persisted.
pub fn new_community(
    creator: &UserId,
    name: &str,
    description: &str,
    visibility: Visibility,
    rules: Vec<String>,
) -> Conversation {
    Conversation {
        id: ConversationId::new(),
        kind: ConversationKind::Community,
        name: name.to_string(),
        description: description.to_string(),
        visibility,
        creator_id: creator.clone(),
        moderators: vec![creator.clone()],
        members: vec![creator.clone()],
        rules,
        avatar_url: None,
        message_count: 0,
        created_at: Utc::now(),
        active: true,
    }
}

/// A fresh direct thread between `a` (the initiator) and `b`.
pub fn new_direct(a: &UserId, b: &UserId) -> Conversation {
    let mut members = vec![a.clone(), b.clone()];
    members.sort();
    Conversation {
        id: ConversationId::new(),
        kind: ConversationKind::Direct,
        name: format!("{} & {}", members[0], members[1]),
        description: String::new(),
        visibility: Visibility::Private,
        creator_id: a.clone(),
        moderators: Vec::new(),
        members,
        rules: Vec::new(),
        avatar_url: None,
        message_count: 0,
        created_at: Utc::now(),
        active: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::models::direct_key;

    fn alice() -> UserId {
        UserId::new("alice")
    }

    #[test]
    fn insert_and_get_community() {
        let mut db = Database::open_in_memory().unwrap();
        let c = new_community(
            &alice(),
            "Youth",
            "For ages 18-35",
            Visibility::Public,
            vec!["Be kind".into()],
        );
        db.insert_conversation(&c, None).unwrap();

        let loaded = db.get_conversation(c.id).unwrap();
        assert_eq!(loaded.name, "Youth");
        assert_eq!(loaded.members, vec![alice()]);
        assert_eq!(loaded.moderators, vec![alice()]);
        assert_eq!(loaded.rules, vec!["Be kind".to_string()]);
        assert!(loaded.active);
    }

    #[test]
    fn get_missing_conversation_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        let err = db.get_conversation(ConversationId::new()).unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[test]
    fn direct_key_is_unique() {
        let mut db = Database::open_in_memory().unwrap();
        let bob = UserId::new("bob");
        let key = direct_key(&alice(), &bob);

        db.insert_conversation(&new_direct(&alice(), &bob), Some(&key))
            .unwrap();
        let dup = db.insert_conversation(&new_direct(&bob, &alice()), Some(&key));
        assert!(dup.is_err());

        let found = db.find_direct_conversation(&key).unwrap().unwrap();
        assert_eq!(found.members.len(), 2);
        assert!(found.moderators.is_empty());
    }

    #[test]
    fn search_hides_private_from_non_members() {
        let mut db = Database::open_in_memory().unwrap();
        let public = new_community(&alice(), "Prayer Warriors", "", Visibility::Public, vec![]);
        let private = new_community(&alice(), "Prayer Elders", "", Visibility::Private, vec![]);
        db.insert_conversation(&public, None).unwrap();
        db.insert_conversation(&private, None).unwrap();

        let outsider = db.search_communities(&UserId::new("carol"), "prayer").unwrap();
        assert_eq!(outsider.len(), 1);
        assert_eq!(outsider[0].id, public.id);

        let insider = db.search_communities(&alice(), "PRAYER").unwrap();
        assert_eq!(insider.len(), 2);
    }

    #[test]
    fn deactivated_communities_drop_out_of_search() {
        let mut db = Database::open_in_memory().unwrap();
        let c = new_community(&alice(), "Family", "", Visibility::Public, vec![]);
        db.insert_conversation(&c, None).unwrap();

        assert!(db.set_conversation_active(c.id, false).unwrap());
        assert!(!db.set_conversation_active(c.id, false).unwrap());
        assert!(db.search_communities(&alice(), "").unwrap().is_empty());
        assert!(!db.get_conversation(c.id).unwrap().active);
    }

    #[test]
    fn update_details_keeps_unset_fields() {
        let mut db = Database::open_in_memory().unwrap();
        let c = new_community(&alice(), "Choir", "Sunday choir", Visibility::Public, vec![]);
        db.insert_conversation(&c, None).unwrap();

        let rules = vec!["Arrive early".to_string()];
        assert!(db
            .update_community_details(c.id, None, Some("Sabbath choir"), Some(&rules), None)
            .unwrap());

        let loaded = db.get_conversation(c.id).unwrap();
        assert_eq!(loaded.name, "Choir");
        assert_eq!(loaded.description, "Sabbath choir");
        assert_eq!(loaded.rules, rules);
        assert_eq!(loaded.avatar_url, None);
    }

    #[test]
    fn avatar_is_stored_replaced_and_cleared() {
        let mut db = Database::open_in_memory().unwrap();
        let mut c = new_community(&alice(), "Choir", "", Visibility::Public, vec![]);
        c.avatar_url = Some("https://cdn.example/choir.png".into());
        db.insert_conversation(&c, None).unwrap();
        assert_eq!(db.get_conversation(c.id).unwrap(), c);

        db.update_community_details(c.id, None, None, None, Some("https://cdn.example/new.png"))
            .unwrap();
        assert_eq!(
            db.get_conversation(c.id).unwrap().avatar_url.as_deref(),
            Some("https://cdn.example/new.png")
        );

        db.update_community_details(c.id, Some("Choir"), None, None, None).unwrap();
        assert!(db.get_conversation(c.id).unwrap().avatar_url.is_some());

        db.update_community_details(c.id, None, None, None, Some("")).unwrap();
        assert_eq!(db.get_conversation(c.id).unwrap().avatar_url, None);
    }
}
