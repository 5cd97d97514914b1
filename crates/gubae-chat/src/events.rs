//! Outbound events for the surrounding application.
//!
//! Unlike [`DeliveryBroker`](crate::DeliveryBroker) subscriptions, the event
//! bus is best-effort: a receiver that falls more than the configured buffer
//! behind loses the oldest events and is told how many it skipped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use gubae_shared::{ConversationId, MembershipAction, UserId};
use gubae_store::{Conversation, Message, MessageView};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ChatEvent {
    MessageAppended(Message),
    /// Overlay change: edit, soft-delete or reaction.
    MessageUpdated(MessageView),
    ConversationUpdated(Conversation),
    MembershipChanged {
        conversation_id: ConversationId,
        user_id: UserId,
        action: MembershipAction,
    },
    PresenceChanged {
        user_id: UserId,
        online: bool,
        at: DateTime<Utc>,
    },
}

impl ChatEvent {
    /// The conversation this event concerns, if any.
    pub fn conversation_id(&self) -> Option<ConversationId> {
        match self {
            ChatEvent::MessageAppended(m) => Some(m.conversation_id),
            ChatEvent::MessageUpdated(v) => Some(v.message.conversation_id),
            ChatEvent::ConversationUpdated(c) => Some(c.id),
            ChatEvent::MembershipChanged {
                conversation_id, ..
            } => Some(*conversation_id),
            ChatEvent::PresenceChanged { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ChatEvent::MessageAppended(_) => "message_appended",
            ChatEvent::MessageUpdated(_) => "message_updated",
            ChatEvent::ConversationUpdated(_) => "conversation_updated",
            ChatEvent::MembershipChanged { .. } => "membership_changed",
            ChatEvent::PresenceChanged { .. } => "presence_changed",
        }
    }
}

/// Fan-out of [`ChatEvent`]s to any number of listeners.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ChatEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Returns the number of listeners it reached; having
    /// none is not an error.
    pub fn publish(&self, event: ChatEvent) -> usize {
        tracing::trace!(event = event.name(), "publishing chat event");
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.sender.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
