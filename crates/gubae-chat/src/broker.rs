//! Live fan-out of appended messages to connected subscribers.
//!
//! Each subscription owns an unbounded queue, so a connected subscriber never
//! misses a message however slowly it drains. Messages are published while
//! the conversation's append lane is held, which makes every subscriber of a
//! conversation observe the same order: the sequence order.
//!
//! Nothing here is persisted. A client that disconnects catches up with
//! `fetch_range` from its last seen sequence number.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use gubae_shared::{ClientId, ConversationId, UserId};
use gubae_store::Message;

struct Route {
    user_id: UserId,
    token: u64,
    sender: mpsc::UnboundedSender<Message>,
}

#[derive(Debug, Clone, Default)]
pub struct BrokerStats {
    pub messages_published: u64,
    pub deliveries: u64,
    pub active_subscriptions: usize,
}

/// Conversation id -> client id -> route.
type RouteTable = HashMap<ConversationId, HashMap<ClientId, Route>>;

pub struct DeliveryBroker {
    routes: Mutex<RouteTable>,
    next_token: AtomicU64,
    published: AtomicU64,
    deliveries: AtomicU64,
}

impl DeliveryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            routes: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            published: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
        })
    }

    /// Start pushing messages of `conversation` to `client`.
    ///
    /// The stream starts empty: only messages published after this call are
    /// yielded. Subscribing the same client to the same conversation again
    /// replaces (and ends) the previous subscription.
    pub fn subscribe(
        self: &Arc<Self>,
        conversation: ConversationId,
        client: ClientId,
        user: UserId,
    ) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);

        let replaced = self.lock_routes().entry(conversation).or_default().insert(
            client,
            Route {
                user_id: user.clone(),
                token,
                sender,
            },
        );
        if replaced.is_some() {
            debug!(conversation = %conversation, client = %client, "replaced existing subscription");
        }
        debug!(conversation = %conversation, client = %client, user = %user, "subscribed");

        Subscription {
            conversation_id: conversation,
            client_id: client,
            token,
            receiver,
            broker: Arc::downgrade(self),
        }
    }

    /// Push `message` to every current subscriber of its conversation.
    /// Returns the number of subscribers it was queued for.
    pub fn publish(&self, message: &Message) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);

        let mut routes = self.lock_routes();
        let Some(subscribers) = routes.get_mut(&message.conversation_id) else {
            return 0;
        };

        let mut delivered = 0;
        subscribers.retain(|client, route| match route.sender.send(message.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(_) => {
                debug!(client = %client, "pruning closed subscription");
                false
            }
        });
        if subscribers.is_empty() {
            routes.remove(&message.conversation_id);
        }

        self.deliveries.fetch_add(delivered as u64, Ordering::Relaxed);
        debug!(
            conversation = %message.conversation_id,
            seq = message.seq,
            delivered,
            "message fanned out"
        );
        delivered
    }

    /// Stop pushing `conversation` to `client`. Returns `true` if a
    /// subscription existed.
    pub fn unsubscribe(&self, conversation: ConversationId, client: ClientId) -> bool {
        let mut routes = self.lock_routes();
        let removed = routes
            .get_mut(&conversation)
            .map(|subs| subs.remove(&client).is_some())
            .unwrap_or(false);
        if routes.get(&conversation).is_some_and(|s| s.is_empty()) {
            routes.remove(&conversation);
        }
        removed
    }

    /// Tear down every subscription held by `client`. Returns how many.
    pub fn disconnect(&self, client: ClientId) -> usize {
        let mut routes = self.lock_routes();
        let mut removed = 0;
        routes.retain(|_, subs| {
            if subs.remove(&client).is_some() {
                removed += 1;
            }
            !subs.is_empty()
        });
        debug!(client = %client, removed, "client disconnected");
        removed
    }

    /// Drop every subscription `user` holds on `conversation`, e.g. after
    /// they left it.
    pub fn evict_user(&self, conversation: ConversationId, user: &UserId) -> usize {
        let mut routes = self.lock_routes();
        let Some(subs) = routes.get_mut(&conversation) else {
            return 0;
        };
        let before = subs.len();
        subs.retain(|_, route| &route.user_id != user);
        let evicted = before - subs.len();
        if subs.is_empty() {
            routes.remove(&conversation);
        }
        evicted
    }

    pub fn subscriber_count(&self, conversation: ConversationId) -> usize {
        self.lock_routes()
            .get(&conversation)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            messages_published: self.published.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            active_subscriptions: self.lock_routes().values().map(|s| s.len()).sum(),
        }
    }

    /// Called from `Subscription::drop`; only removes the route if it is
    /// still the one that subscription created.
    fn release(&self, conversation: ConversationId, client: ClientId, token: u64) {
        let mut routes = self.lock_routes();
        if let Some(subs) = routes.get_mut(&conversation) {
            if subs.get(&client).is_some_and(|r| r.token == token) {
                subs.remove(&client);
            }
            if subs.is_empty() {
                routes.remove(&conversation);
            }
        }
    }

    fn lock_routes(&self) -> std::sync::MutexGuard<'_, RouteTable> {
        // Route bookkeeping cannot be left half-done by a panic, so a
        // poisoned table is still consistent.
        self.routes.lock().unwrap_or_else(|poisoned| {
            warn!("broker route table lock was poisoned");
            poisoned.into_inner()
        })
    }
}

/// A live, unbounded stream of messages for one conversation.
///
/// Exclusively owned by the connection that created it. Dropping it
/// unsubscribes immediately.
pub struct Subscription {
    conversation_id: ConversationId,
    client_id: ClientId,
    token: u64,
    receiver: mpsc::UnboundedReceiver<Message>,
    broker: Weak<DeliveryBroker>,
}

impl Subscription {
    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Wait for the next message. `None` once the subscription was replaced,
    /// evicted or the broker is gone.
    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    /// Take an already-queued message without waiting.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.receiver.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(broker) = self.broker.upgrade() {
            broker.release(self.conversation_id, self.client_id, self.token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gubae_shared::{ContentType, MessageId};

    fn message(conversation: ConversationId, seq: u64) -> Message {
        Message {
            id: MessageId::new(),
            conversation_id: conversation,
            seq,
            sender_id: UserId::new("alice"),
            sender_name: "Alice".into(),
            content: format!("message {seq}"),
            content_type: ContentType::Text,
            attachment: None,
            reply_to: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_all_subscribers_see_same_order() {
        let broker = DeliveryBroker::new();
        let conv = ConversationId::new();
        let mut a = broker.subscribe(conv, ClientId::new(), UserId::new("a"));
        let mut b = broker.subscribe(conv, ClientId::new(), UserId::new("b"));

        for seq in 1..=5 {
            assert_eq!(broker.publish(&message(conv, seq)), 2);
        }

        for sub in [&mut a, &mut b] {
            let seqs: Vec<u64> = (0..5).map(|_| sub.try_recv().unwrap().seq).collect();
            assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
            assert!(sub.try_recv().is_none());
        }
    }

    #[tokio::test]
    async fn test_subscription_starts_empty() {
        let broker = DeliveryBroker::new();
        let conv = ConversationId::new();
        broker.publish(&message(conv, 1));

        let mut sub = broker.subscribe(conv, ClientId::new(), UserId::new("a"));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_conversations_are_isolated() {
        let broker = DeliveryBroker::new();
        let (c1, c2) = (ConversationId::new(), ConversationId::new());
        let mut sub = broker.subscribe(c1, ClientId::new(), UserId::new("a"));

        assert_eq!(broker.publish(&message(c2, 1)), 0);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let broker = DeliveryBroker::new();
        let conv = ConversationId::new();
        let sub = broker.subscribe(conv, ClientId::new(), UserId::new("a"));
        assert_eq!(broker.subscriber_count(conv), 1);

        drop(sub);
        assert_eq!(broker.subscriber_count(conv), 0);
        assert_eq!(broker.stats().active_subscriptions, 0);
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_and_old_drop_is_harmless() {
        let broker = DeliveryBroker::new();
        let conv = ConversationId::new();
        let client = ClientId::new();

        let mut old = broker.subscribe(conv, client, UserId::new("a"));
        let mut new = broker.subscribe(conv, client, UserId::new("a"));

        // The old stream ends once its sender was replaced.
        assert!(old.recv().await.is_none());
        drop(old);
        assert_eq!(broker.subscriber_count(conv), 1);

        broker.publish(&message(conv, 1));
        assert_eq!(new.try_recv().map(|m| m.seq), Some(1));
    }

    #[tokio::test]
    async fn test_disconnect_and_evict() {
        let broker = DeliveryBroker::new();
        let (c1, c2) = (ConversationId::new(), ConversationId::new());
        let client = ClientId::new();
        let _s1 = broker.subscribe(c1, client, UserId::new("a"));
        let _s2 = broker.subscribe(c2, client, UserId::new("a"));
        let _other = broker.subscribe(c1, ClientId::new(), UserId::new("b"));

        assert_eq!(broker.disconnect(client), 2);
        assert_eq!(broker.subscriber_count(c1), 1);
        assert_eq!(broker.evict_user(c1, &UserId::new("b")), 1);
        assert_eq!(broker.subscriber_count(c1), 0);
    }
}
