//! `ChatService`: the single entry point for inbound commands.
//!
//! Every command takes the caller identity supplied by the external auth
//! system and authorizes against the membership data owned here.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::Stream;
use tokio::sync::broadcast;
use tracing::{debug, info};

use gubae_shared::{Caller, ClientId, ConversationId, MessageId, UserId};
use gubae_store::{Conversation, Database, Message, MessageView};

use crate::broker::{BrokerStats, DeliveryBroker, Subscription};
use crate::config::ChatConfig;
use crate::db::SharedDatabase;
use crate::error::{ChatError, ChatResult};
use crate::events::{ChatEvent, EventBus};
use crate::gate::{Presence, PresenceGate};
use crate::message_store::{MessageStore, OutgoingMessage, OverlayOp};
use crate::registry::{CommunityUpdate, ConversationRegistry, NewCommunity};

pub struct ChatService {
    config: ChatConfig,
    events: EventBus,
    broker: Arc<DeliveryBroker>,
    registry: ConversationRegistry,
    gate: PresenceGate,
    store: MessageStore,
}

impl ChatService {
    pub fn new(db: Database, config: ChatConfig) -> Self {
        let db = SharedDatabase::new(db);
        let events = EventBus::new(config.event_buffer);
        let broker = DeliveryBroker::new();

        Self {
            registry: ConversationRegistry::new(db.clone(), events.clone(), config.clone()),
            gate: PresenceGate::new(db.clone(), events.clone()),
            store: MessageStore::new(db, broker.clone(), events.clone(), config.clone()),
            config,
            events,
            broker,
        }
    }

    pub fn open_in_memory(config: ChatConfig) -> ChatResult<Self> {
        Ok(Self::new(Database::open_in_memory()?, config))
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    pub fn registry(&self) -> &ConversationRegistry {
        &self.registry
    }

    pub fn gate(&self) -> &PresenceGate {
        &self.gate
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn broker(&self) -> &Arc<DeliveryBroker> {
        &self.broker
    }

    pub fn broker_stats(&self) -> BrokerStats {
        self.broker.stats()
    }

    // ------------------------------------------------------------------
    // Conversations
    // ------------------------------------------------------------------

    pub fn create_community(&self, caller: &Caller, new: NewCommunity) -> ChatResult<Conversation> {
        self.registry.create_community(caller, new)
    }

    /// The direct thread between the caller and `other`.
    pub fn create_or_get_direct(&self, caller: &Caller, other: &UserId) -> ChatResult<Conversation> {
        self.registry.create_or_get_direct(&caller.user_id, other)
    }

    pub fn join(&self, conversation: ConversationId, caller: &Caller) -> ChatResult<Conversation> {
        self.registry.join(conversation, caller)
    }

    /// Leave a community and stop every live push of it to the caller.
    pub fn leave(&self, conversation: ConversationId, caller: &Caller) -> ChatResult<Conversation> {
        let updated = self.registry.leave(conversation, caller)?;
        let evicted = self.broker.evict_user(conversation, &caller.user_id);
        if evicted > 0 {
            debug!(conversation = %conversation, user = %caller.user_id, evicted, "subscriptions evicted");
        }
        Ok(updated)
    }

    pub fn invite(
        &self,
        conversation: ConversationId,
        caller: &Caller,
        target: &UserId,
    ) -> ChatResult<()> {
        self.registry.invite(conversation, caller, target)
    }

    pub fn promote(
        &self,
        conversation: ConversationId,
        caller: &Caller,
        target: &UserId,
    ) -> ChatResult<Conversation> {
        self.registry.promote(conversation, caller, target)
    }

    pub fn demote(
        &self,
        conversation: ConversationId,
        caller: &Caller,
        target: &UserId,
    ) -> ChatResult<Conversation> {
        self.registry.demote(conversation, caller, target)
    }

    pub fn deactivate(&self, conversation: ConversationId, caller: &Caller) -> ChatResult<Conversation> {
        self.registry.deactivate(conversation, caller)
    }

    pub fn update_community(
        &self,
        conversation: ConversationId,
        caller: &Caller,
        update: CommunityUpdate,
    ) -> ChatResult<Conversation> {
        self.registry.update_details(conversation, caller, update)
    }

    pub fn get_conversation(
        &self,
        conversation: ConversationId,
        caller: &Caller,
    ) -> ChatResult<Conversation> {
        self.registry.get(conversation, &caller.user_id)
    }

    pub fn search_communities(&self, caller: &Caller, query: &str) -> ChatResult<Vec<Conversation>> {
        self.registry.search(&caller.user_id, query)
    }

    pub fn my_conversations(&self, caller: &Caller) -> ChatResult<Vec<Conversation>> {
        self.registry.list_for_user(&caller.user_id)
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    /// Validate, authorize, then append. Nothing is written on failure.
    pub async fn send_message(
        &self,
        conversation: ConversationId,
        caller: &Caller,
        outgoing: OutgoingMessage,
    ) -> ChatResult<Message> {
        self.store.validate_content(&outgoing.content)?;
        self.gate.authorize_write(conversation, &caller.user_id)?;
        self.store.append(conversation, caller, outgoing).await
    }

    /// Send to `recipient`'s direct thread, creating it on first use.
    pub async fn send_direct(
        &self,
        caller: &Caller,
        recipient: &UserId,
        outgoing: OutgoingMessage,
    ) -> ChatResult<Message> {
        self.store.validate_content(&outgoing.content)?;
        let thread = self.registry.create_or_get_direct(&caller.user_id, recipient)?;
        self.send_message(thread.id, caller, outgoing).await
    }

    pub fn react(&self, message: MessageId, caller: &Caller, emoji: &str) -> ChatResult<MessageView> {
        self.overlay(message, caller, OverlayOp::React {
            emoji: emoji.to_string(),
        })
    }

    pub fn unreact(&self, message: MessageId, caller: &Caller, emoji: &str) -> ChatResult<MessageView> {
        self.overlay(message, caller, OverlayOp::Unreact {
            emoji: emoji.to_string(),
        })
    }

    pub fn edit_message(
        &self,
        message: MessageId,
        caller: &Caller,
        content: &str,
        expected_revision: Option<u64>,
    ) -> ChatResult<MessageView> {
        self.overlay(message, caller, OverlayOp::Edit {
            content: content.to_string(),
            expected_revision,
        })
    }

    pub fn delete_message(&self, message: MessageId, caller: &Caller) -> ChatResult<MessageView> {
        self.overlay(message, caller, OverlayOp::SoftDelete)
    }

    /// Overlay changes need read access to the message's conversation.
    fn overlay(&self, message: MessageId, caller: &Caller, op: OverlayOp) -> ChatResult<MessageView> {
        let record = self.store.get_message(message)?;
        self.gate
            .authorize_read(record.conversation_id, &caller.user_id)?;
        self.store.apply_overlay(message, caller, op)
    }

    pub fn fetch_history(
        &self,
        conversation: ConversationId,
        caller: &Caller,
        after_seq: u64,
        limit: u32,
    ) -> ChatResult<Vec<MessageView>> {
        self.gate.authorize_read(conversation, &caller.user_id)?;
        self.store.fetch_range(conversation, after_seq, limit)
    }

    /// Lazy, paged history. Authorization happens once, up front.
    pub fn history(
        &self,
        conversation: ConversationId,
        caller: &Caller,
        after_seq: u64,
    ) -> ChatResult<impl Stream<Item = ChatResult<MessageView>> + Send + 'static> {
        self.gate.authorize_read(conversation, &caller.user_id)?;
        Ok(self
            .store
            .history(conversation, after_seq, self.config.max_history_page))
    }

    // ------------------------------------------------------------------
    // Live delivery & presence
    // ------------------------------------------------------------------

    /// Subscribe `client` to new messages of `conversation`. Catch up with
    /// [`fetch_history`](Self::fetch_history) first.
    pub fn subscribe(
        &self,
        conversation: ConversationId,
        caller: &Caller,
        client: ClientId,
    ) -> ChatResult<Subscription> {
        self.gate.authorize_read(conversation, &caller.user_id)?;
        Ok(self
            .broker
            .subscribe(conversation, client, caller.user_id.clone()))
    }

    pub fn unsubscribe(&self, conversation: ConversationId, client: ClientId) -> bool {
        self.broker.unsubscribe(conversation, client)
    }

    /// A connection opened: its user is online.
    pub fn connect(&self, caller: &Caller) -> ChatResult<bool> {
        self.gate.connection_opened(&caller.user_id, Utc::now())
    }

    /// A connection closed: drop its subscriptions. Its user goes offline
    /// once no other connection of theirs remains.
    pub fn disconnect(&self, caller: &Caller, client: ClientId) -> ChatResult<()> {
        let removed = self.broker.disconnect(client);
        self.gate.connection_closed(&caller.user_id, Utc::now())?;
        info!(user = %caller.user_id, client = %client, removed, "client disconnected");
        Ok(())
    }

    pub fn mark_online(&self, user: &UserId, at: DateTime<Utc>) -> ChatResult<bool> {
        self.gate.mark_online(user, at)
    }

    pub fn mark_offline(&self, user: &UserId, at: DateTime<Utc>) -> ChatResult<bool> {
        self.gate.mark_offline(user, at)
    }

    pub fn presence(&self, caller: &Caller, target: &UserId) -> ChatResult<Presence> {
        self.gate.presence_of(&caller.user_id, target)
    }

    pub fn online_members(
        &self,
        conversation: ConversationId,
        caller: &Caller,
    ) -> ChatResult<Vec<UserId>> {
        self.gate.online_members(conversation, &caller.user_id)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    /// Whether `caller` currently has read access to `conversation`.
    pub fn can_read(&self, conversation: ConversationId, caller: &Caller) -> bool {
        match self.gate.authorize_read(conversation, &caller.user_id) {
            Ok(_) => true,
            Err(ChatError::Forbidden) | Err(ChatError::ConversationNotFound(_)) => false,
            Err(e) => {
                debug!(error = %e, "read check failed");
                false
            }
        }
    }
}
