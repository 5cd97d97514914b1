//! The Message Store: ordered appends, history reads and overlay mutations.
//!
//! Appends to one conversation go through that conversation's lane, a
//! `tokio` mutex held from sequence assignment until the message has been
//! handed to the [`DeliveryBroker`]. Different conversations never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;

use gubae_shared::{Caller, ContentType, ConversationId, MessageId};
use gubae_store::{Attachment, Message, MessageView, NewMessage, StoreError};

use crate::broker::DeliveryBroker;
use crate::config::ChatConfig;
use crate::db::SharedDatabase;
use crate::error::{ChatError, ChatResult};
use crate::events::{ChatEvent, EventBus};

/// A message as submitted by a sender.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub content: String,
    #[serde(default)]
    pub content_type: ContentType,
    #[serde(default)]
    pub attachment: Option<Attachment>,
    #[serde(default)]
    pub reply_to: Option<MessageId>,
}

impl OutgoingMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }
}

/// A mutation of a message's overlay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OverlayOp {
    React { emoji: String },
    Unreact { emoji: String },
    /// `expected_revision` is the overlay revision the editor last saw;
    /// `None` edits whatever is current.
    Edit {
        content: String,
        expected_revision: Option<u64>,
    },
    SoftDelete,
}

/// Outcome of an overlay mutation evaluated under the database lock.
enum Applied {
    Changed,
    Unchanged,
    Refused(ChatError),
}

type Lane = Arc<tokio::sync::Mutex<()>>;

/// A claim on a conversation's append lane. The last claim to go removes
/// the lane from the map.
struct LaneTicket<'a> {
    lanes: &'a Mutex<HashMap<ConversationId, Lane>>,
    conversation: ConversationId,
    lane: Lane,
}

impl Drop for LaneTicket<'_> {
    fn drop(&mut self) {
        let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        // Claims are only handed out under this lock: map + self means idle.
        if Arc::strong_count(&self.lane) == 2 {
            lanes.remove(&self.conversation);
        }
    }
}

pub struct MessageStore {
    db: SharedDatabase,
    broker: Arc<DeliveryBroker>,
    events: EventBus,
    config: ChatConfig,
    lanes: Mutex<HashMap<ConversationId, Lane>>,
}

impl MessageStore {
    pub fn new(
        db: SharedDatabase,
        broker: Arc<DeliveryBroker>,
        events: EventBus,
        config: ChatConfig,
    ) -> Self {
        Self {
            db,
            broker,
            events,
            config,
            lanes: Mutex::new(HashMap::new()),
        }
    }

    /// Reject empty (after trimming) or oversized content.
    pub fn validate_content(&self, content: &str) -> ChatResult<()> {
        if content.trim().is_empty() {
            return Err(ChatError::ContentInvalid("content is empty".into()));
        }
        let chars = content.chars().count();
        if chars > self.config.max_content_chars {
            return Err(ChatError::ContentInvalid(format!(
                "content has {chars} characters, limit is {}",
                self.config.max_content_chars
            )));
        }
        Ok(())
    }

    fn validate_emoji(&self, emoji: &str) -> ChatResult<()> {
        let chars = emoji.chars().count();
        if emoji.trim().is_empty() || chars > self.config.max_reaction_chars {
            return Err(ChatError::ContentInvalid("invalid reaction symbol".into()));
        }
        Ok(())
    }

    fn lane(&self, conversation: ConversationId) -> LaneTicket<'_> {
        let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        LaneTicket {
            lanes: &self.lanes,
            conversation,
            lane: lanes.entry(conversation).or_default().clone(),
        }
    }

    // ------------------------------------------------------------------
    // Append
    // ------------------------------------------------------------------

    /// Append a message from `sender` and fan it out.
    ///
    /// Write authorization is the caller's job. Content is validated before
    /// anything is written; a reply target must exist in the same
    /// conversation.
    pub async fn append(
        &self,
        conversation: ConversationId,
        sender: &Caller,
        outgoing: OutgoingMessage,
    ) -> ChatResult<Message> {
        self.validate_content(&outgoing.content)?;

        let sender_name = if sender.display_name.trim().is_empty() {
            sender.user_id.to_string()
        } else {
            sender.display_name.clone()
        };
        let new = NewMessage {
            id: MessageId::new(),
            conversation_id: conversation,
            sender_id: sender.user_id.clone(),
            sender_name,
            content: outgoing.content,
            content_type: outgoing.content_type,
            attachment: outgoing.attachment,
            reply_to: outgoing.reply_to,
            created_at: Utc::now(),
        };

        let ticket = self.lane(conversation);
        let _turn = ticket.lane.lock().await;

        let appended = self.db.with(|db| {
            if let Some(reply_to) = new.reply_to {
                match db.get_message(reply_to) {
                    Ok(target) if target.conversation_id == conversation => {}
                    Ok(_) | Err(StoreError::NotFound) => return Ok(Err(reply_to)),
                    Err(e) => return Err(e),
                }
            }
            db.append_message(&new).map(Ok)
        });
        let message = match appended {
            Ok(Ok(message)) => message,
            Ok(Err(reply_to)) => return Err(ChatError::MessageNotFound(reply_to)),
            Err(e) => return Err(e.not_found_as(ChatError::ConversationNotFound(conversation))),
        };

        let delivered = self.broker.publish(&message);
        debug!(
            conversation = %conversation,
            seq = message.seq,
            sender = %message.sender_id,
            delivered,
            "message appended"
        );
        self.events.publish(ChatEvent::MessageAppended(message.clone()));
        Ok(message)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Messages with a sequence number above `after_seq`, ascending. `limit`
    /// is clamped to the configured page size; nothing new is an empty page.
    pub fn fetch_range(
        &self,
        conversation: ConversationId,
        after_seq: u64,
        limit: u32,
    ) -> ChatResult<Vec<MessageView>> {
        let limit = limit.min(self.config.max_history_page);
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.db
            .read(|db| db.get_message_views_after(conversation, after_seq, limit))
    }

    /// Lazily page through history after `after_seq`.
    ///
    /// Each page is read only when the previous one is drained. The stream
    /// ends at the first short page or error; to resume, call again with the
    /// last sequence number seen.
    pub fn history(
        &self,
        conversation: ConversationId,
        after_seq: u64,
        page_size: u32,
    ) -> impl Stream<Item = ChatResult<MessageView>> + Send + 'static {
        let db = self.db.clone();
        let page = page_size.clamp(1, self.config.max_history_page.max(1));

        stream::unfold(Some(after_seq), move |cursor| {
            let db = db.clone();
            async move {
                let after = cursor?;
                match db.read(|d| d.get_message_views_after(conversation, after, page)) {
                    Ok(views) if views.is_empty() => None,
                    Ok(views) => {
                        let next = if views.len() < page as usize {
                            None
                        } else {
                            views.last().map(|v| v.message.seq)
                        };
                        Some((views.into_iter().map(Ok).collect::<Vec<_>>(), next))
                    }
                    Err(e) => Some((vec![Err(e)], None)),
                }
            }
        })
        .flat_map(stream::iter)
    }

    pub fn get_message(&self, id: MessageId) -> ChatResult<Message> {
        self.db
            .read(|db| db.get_message(id))
            .map_err(|e| e.not_found_as(ChatError::MessageNotFound(id)))
    }

    pub fn get_view(&self, id: MessageId) -> ChatResult<MessageView> {
        self.db
            .read(|db| {
                let message = db.get_message(id)?;
                let overlay = db.get_overlay(id)?;
                Ok(MessageView { message, overlay })
            })
            .map_err(|e| e.not_found_as(ChatError::MessageNotFound(id)))
    }

    // ------------------------------------------------------------------
    // Overlay
    // ------------------------------------------------------------------

    /// Apply `op` on behalf of `caller` and return the resulting view.
    ///
    /// The check and the write happen under one database lock, so the
    /// compare-and-set only fails for an explicitly stale
    /// `expected_revision`. Only the sender may edit or delete; a deleted
    /// message can no longer be edited or reacted to, and deleting it again
    /// changes nothing.
    pub fn apply_overlay(
        &self,
        message_id: MessageId,
        caller: &Caller,
        op: OverlayOp,
    ) -> ChatResult<MessageView> {
        match &op {
            OverlayOp::React { emoji } | OverlayOp::Unreact { emoji } => self.validate_emoji(emoji)?,
            OverlayOp::Edit { content, .. } => self.validate_content(content)?,
            OverlayOp::SoftDelete => {}
        }
        let user = &caller.user_id;

        let outcome = self
            .db
            .with(|db| {
                let message = db.get_message(message_id)?;
                let overlay = db.get_overlay(message_id)?;

                let sender_only = matches!(op, OverlayOp::Edit { .. } | OverlayOp::SoftDelete);
                if sender_only && message.sender_id != *user {
                    return Ok(Applied::Refused(ChatError::Forbidden));
                }
                if overlay.deleted {
                    return Ok(match &op {
                        OverlayOp::SoftDelete => Applied::Unchanged,
                        _ => Applied::Refused(ChatError::MessageNotFound(message_id)),
                    });
                }

                let changed = match &op {
                    OverlayOp::React { emoji } => db.add_reaction(message_id, emoji, user)?,
                    OverlayOp::Unreact { emoji } => db.remove_reaction(message_id, emoji, user)?,
                    OverlayOp::Edit {
                        content,
                        expected_revision,
                    } => {
                        let expected = expected_revision.unwrap_or(overlay.revision);
                        if expected != overlay.revision
                            || !db.edit_message_content(message_id, content, Utc::now(), expected)?
                        {
                            return Ok(Applied::Refused(ChatError::ConflictingEdit(message_id)));
                        }
                        true
                    }
                    OverlayOp::SoftDelete => {
                        db.soft_delete_message(message_id, Utc::now(), overlay.revision)?
                    }
                };
                Ok(if changed {
                    Applied::Changed
                } else {
                    Applied::Unchanged
                })
            })
            .map_err(|e| e.not_found_as(ChatError::MessageNotFound(message_id)))?;

        let changed = match outcome {
            Applied::Refused(e) => return Err(e),
            Applied::Changed => true,
            Applied::Unchanged => false,
        };

        let view = self.get_view(message_id)?;
        if changed {
            debug!(message = %message_id, user = %user, revision = view.overlay.revision, "overlay updated");
            self.events.publish(ChatEvent::MessageUpdated(view.clone()));
        }
        Ok(view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gubae_shared::{UserId, Visibility};
    use gubae_store::conversations::new_community;

    fn setup() -> (MessageStore, ConversationId, Arc<DeliveryBroker>) {
        let db = SharedDatabase::open_in_memory().unwrap();
        let c = new_community(&UserId::new("alice"), "Youth", "", Visibility::Public, vec![]);
        db.with(|d| d.insert_conversation(&c, None)).unwrap();
        let broker = DeliveryBroker::new();
        let store = MessageStore::new(db, broker.clone(), EventBus::new(16), ChatConfig::default());
        (store, c.id, broker)
    }

    fn alice() -> Caller {
        Caller::member("alice", "Alice")
    }

    #[tokio::test]
    async fn test_sequence_starts_at_one_without_gaps() {
        let (store, conv, _) = setup();
        for i in 1..=3u64 {
            let m = store.append(conv, &alice(), OutgoingMessage::text(format!("m{i}"))).await.unwrap();
            assert_eq!(m.seq, i);
            assert_eq!(m.sender_name, "Alice");
        }
        let seqs: Vec<u64> = store
            .fetch_range(conv, 0, 10)
            .unwrap()
            .iter()
            .map(|v| v.message.seq)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert!(store.fetch_range(conv, 3, 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_appends_are_gap_free() {
        let (store, conv, broker) = setup();
        let store = Arc::new(store);
        let mut sub = broker.subscribe(conv, gubae_shared::ClientId::new(), UserId::new("bob"));

        let tasks: Vec<_> = (0..20)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .append(conv, &alice(), OutgoingMessage::text(format!("m{i}")))
                        .await
                })
            })
            .collect();
        for t in tasks {
            t.await.unwrap().unwrap();
        }

        let pushed: Vec<u64> = (0..20).map(|_| sub.try_recv().unwrap().seq).collect();
        assert_eq!(pushed, (1..=20).collect::<Vec<_>>());
        assert!(store.lanes.lock().unwrap().is_empty(), "idle lanes are released");
    }

    #[tokio::test]
    async fn test_lane_released_after_failed_append() {
        let (store, _, _) = setup();
        let missing = ConversationId::new();
        store
            .append(missing, &alice(), OutgoingMessage::text("hi"))
            .await
            .unwrap_err();
        assert!(store.lanes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cursor_past_any_sequence_is_empty() {
        let (store, conv, _) = setup();
        for i in 1..=3u64 {
            store.append(conv, &alice(), OutgoingMessage::text(format!("m{i}"))).await.unwrap();
        }
        assert!(store.fetch_range(conv, u64::MAX, 10).unwrap().is_empty());

        let tail: Vec<_> = store.history(conv, u64::MAX, 10).collect().await;
        assert!(tail.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_content_writes_nothing() {
        let (store, conv, _) = setup();
        let err = store.append(conv, &alice(), OutgoingMessage::text("   ")).await.unwrap_err();
        assert!(matches!(err, ChatError::ContentInvalid(_)));

        let long = "x".repeat(ChatConfig::default().max_content_chars + 1);
        let err = store.append(conv, &alice(), OutgoingMessage::text(long)).await.unwrap_err();
        assert!(matches!(err, ChatError::ContentInvalid(_)));

        assert!(store.fetch_range(conv, 0, 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_conversation() {
        let (store, _, _) = setup();
        let err = store
            .append(ConversationId::new(), &alice(), OutgoingMessage::text("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::ConversationNotFound(_)));
    }

    #[tokio::test]
    async fn test_reply_must_be_in_same_conversation() {
        let (store, conv, _) = setup();
        let first = store.append(conv, &alice(), OutgoingMessage::text("first")).await.unwrap();

        let reply = OutgoingMessage {
            reply_to: Some(first.id),
            ..OutgoingMessage::text("second")
        };
        assert_eq!(store.append(conv, &alice(), reply).await.unwrap().reply_to, Some(first.id));

        let dangling = OutgoingMessage {
            reply_to: Some(MessageId::new()),
            ..OutgoingMessage::text("third")
        };
        let err = store.append(conv, &alice(), dangling).await.unwrap_err();
        assert!(matches!(err, ChatError::MessageNotFound(_)));
        assert_eq!(store.fetch_range(conv, 0, 10).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_history_pages_lazily() {
        let (store, conv, _) = setup();
        for i in 0..5 {
            store.append(conv, &alice(), OutgoingMessage::text(format!("m{i}"))).await.unwrap();
        }
        let seqs: Vec<u64> = store
            .history(conv, 1, 2)
            .map(|v| v.unwrap().message.seq)
            .collect()
            .await;
        assert_eq!(seqs, vec![2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_overlay_rules() {
        let (store, conv, _) = setup();
        let m = store.append(conv, &alice(), OutgoingMessage::text("Welcome!")).await.unwrap();
        let bob = Caller::member("bob", "Bob");

        let react = OverlayOp::React { emoji: "❤".into() };
        store.apply_overlay(m.id, &bob, react.clone()).unwrap();
        let view = store.apply_overlay(m.id, &bob, react).unwrap();
        assert_eq!(view.overlay.reactions["❤"].len(), 1);
        assert_eq!(view.overlay.revision, 1);

        let edit = OverlayOp::Edit {
            content: "hijacked".into(),
            expected_revision: None,
        };
        assert!(matches!(store.apply_overlay(m.id, &bob, edit), Err(ChatError::Forbidden)));
        assert!(matches!(
            store.apply_overlay(m.id, &bob, OverlayOp::SoftDelete),
            Err(ChatError::Forbidden)
        ));

        let stale = OverlayOp::Edit {
            content: "Welcome all!".into(),
            expected_revision: Some(0),
        };
        assert!(matches!(
            store.apply_overlay(m.id, &alice(), stale),
            Err(ChatError::ConflictingEdit(_))
        ));

        let fresh = OverlayOp::Edit {
            content: "Welcome all!".into(),
            expected_revision: Some(1),
        };
        let view = store.apply_overlay(m.id, &alice(), fresh).unwrap();
        assert_eq!(view.visible_content(), Some("Welcome all!"));
        assert_eq!(view.message.content, "Welcome!");

        let view = store.apply_overlay(m.id, &alice(), OverlayOp::SoftDelete).unwrap();
        assert_eq!(view.visible_content(), None);
        // Deleting twice is a no-op; reacting to a deleted message is not.
        assert!(store.apply_overlay(m.id, &alice(), OverlayOp::SoftDelete).is_ok());
        assert!(matches!(
            store.apply_overlay(m.id, &bob, OverlayOp::React { emoji: "🙏".into() }),
            Err(ChatError::MessageNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_bad_reaction_symbol() {
        let (store, conv, _) = setup();
        let m = store.append(conv, &alice(), OutgoingMessage::text("hi")).await.unwrap();
        let err = store
            .apply_overlay(m.id, &alice(), OverlayOp::React { emoji: " ".into() })
            .unwrap_err();
        assert!(matches!(err, ChatError::ContentInvalid(_)));
        assert!(matches!(
            store.apply_overlay(MessageId::new(), &alice(), OverlayOp::SoftDelete),
            Err(ChatError::MessageNotFound(_))
        ));
    }
}
