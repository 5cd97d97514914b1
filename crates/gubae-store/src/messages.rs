//! The append-only message log.

use rusqlite::params;

use gubae_shared::{ConversationId, MessageId, UserId};

use crate::database::{col_enum, col_opt_uuid, col_ts, col_u64, col_uuid, Database};
use crate::error::{not_found, Result, StoreError};
use crate::models::{Attachment, Message, MessageView, NewMessage};

const MESSAGE_COLUMNS: &str = "id, conversation_id, seq, sender_id, sender_name, content, \
     content_type, attachment_url, attachment_name, reply_to, created_at";

impl Database {
    /// Append a message and assign it the next sequence number.
    ///
    /// Runs in one transaction: the conversation must exist and be active,
    /// the record and an empty overlay are inserted, and the conversation's
    /// message count is bumped. Fails with [`StoreError::NotFound`] when the
    /// conversation is unknown or inactive.
    pub fn append_message(&mut self, new: &NewMessage) -> Result<Message> {
        let conversation_id = new.conversation_id.to_string();
        let tx = self.conn_mut().transaction()?;

        let updated = tx.execute(
            "UPDATE conversations SET message_count = message_count + 1
             WHERE id = ?1 AND active = 1",
            params![conversation_id],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound);
        }
        let seq: i64 = tx.query_row(
            "SELECT message_count FROM conversations WHERE id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )?;

        tx.execute(
            &format!(
                "INSERT INTO messages ({MESSAGE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ),
            params![
                new.id.to_string(),
                conversation_id,
                seq,
                new.sender_id.as_str(),
                new.sender_name,
                new.content,
                new.content_type.as_str(),
                new.attachment.as_ref().map(|a| a.url.as_str()),
                new.attachment.as_ref().and_then(|a| a.file_name.as_deref()),
                new.reply_to.map(|r| r.to_string()),
                new.created_at.to_rfc3339(),
            ],
        )?;
        tx.execute(
            "INSERT INTO message_overlays (message_id) VALUES (?1)",
            params![new.id.to_string()],
        )?;
        tx.commit()?;

        Ok(Message {
            id: new.id,
            conversation_id: new.conversation_id,
            seq: seq as u64,
            sender_id: new.sender_id.clone(),
            sender_name: new.sender_name.clone(),
            content: new.content.clone(),
            content_type: new.content_type,
            attachment: new.attachment.clone(),
            reply_to: new.reply_to,
            created_at: new.created_at,
        })
    }

    pub fn get_message(&self, id: MessageId) -> Result<Message> {
        self.conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id.to_string()],
                row_to_message,
            )
            .map_err(not_found)
    }

    /// Messages with `seq > after_seq`, ascending, at most `limit` of them.
    pub fn get_messages_after(
        &self,
        conversation: ConversationId,
        after_seq: u64,
        limit: u32,
    ) -> Result<Vec<Message>> {
        // Sequence numbers are stored as INTEGER; nothing lies beyond i64::MAX.
        let Ok(after_seq) = i64::try_from(after_seq) else {
            return Ok(Vec::new());
        };
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_id = ?1 AND seq > ?2
             ORDER BY seq ASC
             LIMIT ?3"
        ))?;
        let rows = stmt.query_map(
            params![conversation.to_string(), after_seq, limit],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Like [`get_messages_after`](Self::get_messages_after) with each
    /// message's current overlay attached.
    pub fn get_message_views_after(
        &self,
        conversation: ConversationId,
        after_seq: u64,
        limit: u32,
    ) -> Result<Vec<MessageView>> {
        self.get_messages_after(conversation, after_seq, limit)?
            .into_iter()
            .map(|message| {
                let overlay = self.get_overlay(message.id)?;
                Ok(MessageView { message, overlay })
            })
            .collect()
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let sender: String = row.get(3)?;
    let attachment_url: Option<String> = row.get(7)?;
    let attachment_name: Option<String> = row.get(8)?;

    Ok(Message {
        id: MessageId(col_uuid(row, 0)?),
        conversation_id: ConversationId(col_uuid(row, 1)?),
        seq: col_u64(row, 2)?,
        sender_id: UserId(sender),
        sender_name: row.get(4)?,
        content: row.get(5)?,
        content_type: col_enum(row, 6)?,
        attachment: attachment_url.map(|url| Attachment {
            url,
            file_name: attachment_name,
        }),
        reply_to: col_opt_uuid(row, 9)?.map(MessageId),
        created_at: col_ts(row, 10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversations::new_community;
    use chrono::Utc;
    use gubae_shared::{ContentType, Visibility};

    fn draft(conversation: ConversationId, text: &str) -> NewMessage {
        NewMessage {
            id: MessageId::new(),
            conversation_id: conversation,
            sender_id: UserId::new("alice"),
            sender_name: "Alice".into(),
            content: text.into(),
            content_type: ContentType::Text,
            attachment: None,
            reply_to: None,
            created_at: Utc::now(),
        }
    }

    fn setup() -> (Database, ConversationId) {
        let mut db = Database::open_in_memory().unwrap();
        let c = new_community(&UserId::new("alice"), "Youth", "", Visibility::Public, vec![]);
        db.insert_conversation(&c, None).unwrap();
        (db, c.id)
    }

    #[test]
    fn append_assigns_contiguous_sequence() {
        let (mut db, id) = setup();
        for (i, text) in ["one", "two", "three"].iter().enumerate() {
            let m = db.append_message(&draft(id, text)).unwrap();
            assert_eq!(m.seq, i as u64 + 1);
        }
        assert_eq!(db.get_conversation(id).unwrap().message_count, 3);

        let page = db.get_messages_after(id, 1, 10).unwrap();
        let seqs: Vec<u64> = page.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![2, 3]);
    }

    #[test]
    fn append_to_inactive_conversation_fails() {
        let (mut db, id) = setup();
        db.set_conversation_active(id, false).unwrap();

        let err = db.append_message(&draft(id, "hello")).unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
        assert_eq!(db.get_conversation(id).unwrap().message_count, 0);
    }

    #[test]
    fn append_to_unknown_conversation_fails() {
        let (mut db, _) = setup();
        let err = db
            .append_message(&draft(ConversationId::new(), "hello"))
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[test]
    fn attachment_and_reply_survive_storage() {
        let (mut db, id) = setup();
        let first = db.append_message(&draft(id, "photo below")).unwrap();

        let mut photo = draft(id, "https://cdn.example/choir.jpg");
        photo.content_type = ContentType::Image;
        photo.reply_to = Some(first.id);
        photo.attachment = Some(Attachment {
            url: "https://cdn.example/choir.jpg".into(),
            file_name: Some("choir.jpg".into()),
        });
        let stored = db.append_message(&photo).unwrap();

        let loaded = db.get_message(stored.id).unwrap();
        assert_eq!(loaded, stored);
    }

    #[test]
    fn views_start_with_empty_overlay() {
        let (mut db, id) = setup();
        db.append_message(&draft(id, "hello")).unwrap();

        let views = db.get_message_views_after(id, 0, 10).unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].overlay.revision, 0);
        assert_eq!(views[0].visible_content(), Some("hello"));
    }

    #[test]
    fn cursor_beyond_i64_range_is_past_the_end() {
        let (mut db, id) = setup();
        for text in ["one", "two", "three"] {
            db.append_message(&draft(id, text)).unwrap();
        }

        assert!(db.get_messages_after(id, u64::MAX, 10).unwrap().is_empty());
        assert!(db.get_messages_after(id, i64::MAX as u64 + 1, 10).unwrap().is_empty());
        assert!(db.get_message_views_after(id, u64::MAX, 10).unwrap().is_empty());
        assert!(db.get_messages_after(id, i64::MAX as u64, 10).unwrap().is_empty());
    }

    #[test]
    fn limit_zero_returns_nothing() {
        let (mut db, id) = setup();
        db.append_message(&draft(id, "hello")).unwrap();
        assert!(db.get_messages_after(id, 0, 0).unwrap().is_empty());
    }
}
