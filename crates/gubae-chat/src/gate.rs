//! Read/write authorization and coarse online/offline presence.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use gubae_shared::{ConversationId, UserId, Visibility};
use gubae_store::Conversation;

use crate::db::SharedDatabase;
use crate::error::{ChatError, ChatResult};
use crate::events::{ChatEvent, EventBus};

/// Last known presence of a user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Presence {
    pub user_id: UserId,
    pub online: bool,
    /// When the current state was reported; `None` if never seen.
    pub since: Option<DateTime<Utc>>,
}

pub struct PresenceGate {
    db: SharedDatabase,
    events: EventBus,
    presence: RwLock<HashMap<UserId, (bool, DateTime<Utc>)>>,
    /// Open connections per user; a user is online while this is non-zero.
    connections: Mutex<HashMap<UserId, usize>>,
}

impl PresenceGate {
    pub fn new(db: SharedDatabase, events: EventBus) -> Self {
        Self {
            db,
            events,
            presence: RwLock::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
        }
    }

    // ------------------------------------------------------------------
    // Authorization
    // ------------------------------------------------------------------

    /// Allow reads to members of an active conversation.
    ///
    /// Every refusal is the same bare [`ChatError::Forbidden`].
    pub fn authorize_read(
        &self,
        conversation: ConversationId,
        user: &UserId,
    ) -> ChatResult<Conversation> {
        let c = self
            .db
            .read(|db| db.get_conversation(conversation))
            .map_err(|e| e.not_found_as(ChatError::ConversationNotFound(conversation)))?;

        if !c.active || !c.is_member(user) {
            debug!(conversation = %conversation, user = %user, "read refused");
            return Err(ChatError::Forbidden);
        }
        Ok(c)
    }

    /// Allow writes to members of an active conversation. In a restricted
    /// community only moderators may write.
    pub fn authorize_write(
        &self,
        conversation: ConversationId,
        user: &UserId,
    ) -> ChatResult<Conversation> {
        let c = self.authorize_read(conversation, user)?;
        if c.visibility == Visibility::Restricted && !c.is_direct() && !c.is_moderator(user) {
            debug!(conversation = %conversation, user = %user, "write refused");
            return Err(ChatError::Forbidden);
        }
        Ok(c)
    }

    // ------------------------------------------------------------------
    // Presence
    // ------------------------------------------------------------------

    /// Record `user` as online as of `at`. Returns `true` if this changed
    /// the visible state.
    pub fn mark_online(&self, user: &UserId, at: DateTime<Utc>) -> ChatResult<bool> {
        self.set_presence(user, true, at)
    }

    pub fn mark_offline(&self, user: &UserId, at: DateTime<Utc>) -> ChatResult<bool> {
        self.set_presence(user, false, at)
    }

    /// A connection for `user` opened. The first one marks them online.
    pub fn connection_opened(&self, user: &UserId, at: DateTime<Utc>) -> ChatResult<bool> {
        let open = {
            let mut connections = self
                .connections
                .lock()
                .map_err(|_| ChatError::Internal("connection lock poisoned".into()))?;
            let open = connections.entry(user.clone()).or_insert(0);
            *open += 1;
            *open
        };
        debug!(user = %user, open, "connection opened");
        self.mark_online(user, at)
    }

    /// A connection for `user` closed. The user goes offline only when it
    /// was their last one.
    pub fn connection_closed(&self, user: &UserId, at: DateTime<Utc>) -> ChatResult<bool> {
        let remaining = {
            let mut connections = self
                .connections
                .lock()
                .map_err(|_| ChatError::Internal("connection lock poisoned".into()))?;
            match connections.get_mut(user) {
                Some(open) if *open > 1 => {
                    *open -= 1;
                    *open
                }
                _ => {
                    connections.remove(user);
                    0
                }
            }
        };
        debug!(user = %user, remaining, "connection closed");
        if remaining > 0 {
            return Ok(false);
        }
        self.mark_offline(user, at)
    }

    /// Last-writer-wins: a report older than the current one is ignored.
    fn set_presence(&self, user: &UserId, online: bool, at: DateTime<Utc>) -> ChatResult<bool> {
        let changed = {
            let mut map = self
                .presence
                .write()
                .map_err(|_| ChatError::Internal("presence lock poisoned".into()))?;
            match map.get(user) {
                Some((_, since)) if *since > at => return Ok(false),
                Some((current, _)) => {
                    let changed = *current != online;
                    map.insert(user.clone(), (online, at));
                    changed
                }
                None => {
                    map.insert(user.clone(), (online, at));
                    true
                }
            }
        };

        if changed {
            debug!(user = %user, online, "presence changed");
            self.events.publish(ChatEvent::PresenceChanged {
                user_id: user.clone(),
                online,
                at,
            });
        }
        Ok(changed)
    }

    fn lookup(&self, user: &UserId) -> ChatResult<Presence> {
        let map = self
            .presence
            .read()
            .map_err(|_| ChatError::Internal("presence lock poisoned".into()))?;
        Ok(match map.get(user) {
            Some((online, since)) => Presence {
                user_id: user.clone(),
                online: *online,
                since: Some(*since),
            },
            None => Presence {
                user_id: user.clone(),
                online: false,
                since: None,
            },
        })
    }

    /// Presence of `target` as seen by `viewer`; only visible to users who
    /// share an active conversation with them.
    pub fn presence_of(&self, viewer: &UserId, target: &UserId) -> ChatResult<Presence> {
        if viewer != target && !self.db.read(|db| db.shares_conversation(viewer, target))? {
            return Err(ChatError::Forbidden);
        }
        self.lookup(target)
    }

    /// Members of `conversation` currently online, for a member viewer.
    pub fn online_members(
        &self,
        conversation: ConversationId,
        viewer: &UserId,
    ) -> ChatResult<Vec<UserId>> {
        let c = self.authorize_read(conversation, viewer)?;
        let mut online = Vec::new();
        for member in c.members {
            if self.lookup(&member)?.online {
                online.push(member);
            }
        }
        Ok(online)
    }
}
