//! Domain model structs persisted in the SQLite database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to the HTTP and WebSocket layers.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use gubae_shared::{ContentType, ConversationId, ConversationKind, MessageId, UserId, Visibility};

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// A community (many members) or a direct thread (exactly two members).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub kind: ConversationKind,
    pub name: String,
    pub description: String,
    pub visibility: Visibility,
    pub creator_id: UserId,
    /// In promotion order. Always empty for direct threads.
    pub moderators: Vec<UserId>,
    /// Sorted by user id.
    pub members: Vec<UserId>,
    pub rules: Vec<String>,
    /// Image shown for a community. Direct threads have none.
    #[serde(default)]
    pub avatar_url: Option<String>,
    /// Number of appended messages, which is also the last assigned sequence.
    pub message_count: u64,
    pub created_at: DateTime<Utc>,
    /// Conversations are never deleted, only deactivated.
    pub active: bool,
}

impl Conversation {
    pub fn is_member(&self, user: &UserId) -> bool {
        self.members.binary_search(user).is_ok()
    }

    pub fn is_moderator(&self, user: &UserId) -> bool {
        self.moderators.contains(user)
    }

    pub fn is_direct(&self) -> bool {
        self.kind == ConversationKind::Direct
    }
}

/// Canonical key identifying the direct thread between two users,
/// independent of argument order.
pub fn direct_key(a: &UserId, b: &UserId) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{}\u{1f}{}", lo.as_str(), hi.as_str())
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// File metadata carried by non-text messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub url: String,
    pub file_name: Option<String>,
}

/// An appended message. Immutable once stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    /// Strictly increasing within the conversation, starting at 1.
    pub seq: u64,
    pub sender_id: UserId,
    /// Display name of the sender at send time.
    pub sender_name: String,
    pub content: String,
    pub content_type: ContentType,
    pub attachment: Option<Attachment>,
    pub reply_to: Option<MessageId>,
    pub created_at: DateTime<Utc>,
}

/// Input to [`Database::append_message`](crate::Database::append_message).
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub content: String,
    pub content_type: ContentType,
    pub attachment: Option<Attachment>,
    pub reply_to: Option<MessageId>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Overlay
// ---------------------------------------------------------------------------

/// Mutable annotations layered over an immutable [`Message`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageOverlay {
    pub edited_content: Option<String>,
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    /// Emoji symbol -> users who reacted with it.
    pub reactions: BTreeMap<String, BTreeSet<UserId>>,
    /// Incremented on every overlay mutation; used for compare-and-set.
    pub revision: u64,
}

impl MessageOverlay {
    pub fn is_edited(&self) -> bool {
        self.edited_content.is_some()
    }
}

/// A message together with its current overlay, as shown to readers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageView {
    pub message: Message,
    pub overlay: MessageOverlay,
}

impl MessageView {
    /// The text a reader should see: `None` once soft-deleted, the latest edit
    /// otherwise.
    pub fn visible_content(&self) -> Option<&str> {
        if self.overlay.deleted {
            None
        } else {
            Some(
                self.overlay
                    .edited_content
                    .as_deref()
                    .unwrap_or(&self.message.content),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_key_is_order_independent() {
        let a = UserId::new("alice");
        let b = UserId::new("bob");
        assert_eq!(direct_key(&a, &b), direct_key(&b, &a));
        assert_ne!(direct_key(&a, &b), direct_key(&a, &a));
    }
}
