//! Conversation lifecycle and membership.
//!
//! Invariants maintained here:
//! - a direct conversation has exactly two members and no moderators;
//! - a community starts with its creator as sole member and moderator, and
//!   moderators are always members;
//! - conversations are never deleted, only deactivated.

use tracing::{info, warn};

use gubae_shared::{Caller, ConversationId, MembershipAction, Role, UserId, Visibility};
use gubae_store::conversations::{new_community, new_direct};
use gubae_store::{direct_key, Conversation};

use crate::config::ChatConfig;
use crate::db::SharedDatabase;
use crate::error::{ChatError, ChatResult};
use crate::events::{ChatEvent, EventBus};

/// Parameters of a new community.
#[derive(Debug, Clone, Default)]
pub struct NewCommunity {
    pub name: String,
    pub description: String,
    pub visibility: Visibility,
    pub rules: Vec<String>,
    pub avatar_url: Option<String>,
}

/// Fields a moderator may change; `None` keeps the current value and an
/// empty `avatar_url` removes the avatar.
#[derive(Debug, Clone, Default)]
pub struct CommunityUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub rules: Option<Vec<String>>,
    pub avatar_url: Option<String>,
}

pub struct ConversationRegistry {
    db: SharedDatabase,
    events: EventBus,
    config: ChatConfig,
}

impl ConversationRegistry {
    pub fn new(db: SharedDatabase, events: EventBus, config: ChatConfig) -> Self {
        Self { db, events, config }
    }

    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Only callers holding the owner role may create communities.
    pub fn create_community(&self, caller: &Caller, new: NewCommunity) -> ChatResult<Conversation> {
        if caller.role != Role::Owner {
            return Err(ChatError::Forbidden);
        }
        let name = self.validate_name(&new.name)?;

        let mut conversation = new_community(
            &caller.user_id,
            &name,
            new.description.trim(),
            new.visibility,
            clean_rules(new.rules),
        );
        conversation.avatar_url = new
            .avatar_url
            .as_deref()
            .map(check_avatar_url)
            .transpose()?
            .filter(|url| !url.is_empty());
        self.db.with(|db| db.insert_conversation(&conversation, None))?;

        info!(
            conversation = %conversation.id,
            creator = %caller.user_id,
            visibility = %conversation.visibility,
            "community created"
        );
        self.events
            .publish(ChatEvent::ConversationUpdated(conversation.clone()));
        Ok(conversation)
    }

    /// Return the direct thread between `a` and `b`, creating it on first
    /// use. Argument order does not matter.
    pub fn create_or_get_direct(&self, a: &UserId, b: &UserId) -> ChatResult<Conversation> {
        if a == b {
            return Err(ChatError::InvalidRequest(
                "a direct conversation needs two different users".into(),
            ));
        }
        let key = direct_key(a, b);

        if let Some(existing) = self.db.read(|db| db.find_direct_conversation(&key))? {
            return Ok(existing);
        }

        let conversation = new_direct(a, b);
        let created = self.db.with(|db| match db.insert_conversation(&conversation, Some(&key)) {
            Ok(()) => Ok(None),
            // Lost a race against another creator of the same pair.
            Err(e) if e.is_constraint_violation() => db.find_direct_conversation(&key),
            Err(e) => Err(e),
        })?;

        if let Some(existing) = created {
            return Ok(existing);
        }
        info!(conversation = %conversation.id, "direct conversation created");
        self.events
            .publish(ChatEvent::ConversationUpdated(conversation.clone()));
        Ok(conversation)
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    /// Join a community. Joining twice fails softly with
    /// [`ChatError::AlreadyMember`] and changes nothing.
    ///
    /// Public and restricted communities are open; private ones need an
    /// invitation, which is consumed by the join.
    pub fn join(&self, conversation: ConversationId, caller: &Caller) -> ChatResult<Conversation> {
        let user = &caller.user_id;
        let c = self.load(conversation)?;
        if !c.active || c.is_direct() {
            return Err(ChatError::Forbidden);
        }
        if c.is_member(user) {
            return Err(ChatError::AlreadyMember(conversation));
        }

        let admitted = self.db.with(|db| {
            if c.visibility == Visibility::Private && !db.has_invite(conversation, user)? {
                return Ok(false);
            }
            db.add_member(conversation, user)?;
            db.remove_invite(conversation, user)?;
            Ok(true)
        })?;
        if !admitted {
            return Err(ChatError::Forbidden);
        }

        info!(conversation = %conversation, user = %user, "member joined");
        self.membership_changed(conversation, user, MembershipAction::Joined)
    }

    /// Leave a community. A moderator's seat goes with them; if the last
    /// moderator leaves the community stays active without one. Leaving a
    /// conversation one is not a member of is a no-op.
    pub fn leave(&self, conversation: ConversationId, caller: &Caller) -> ChatResult<Conversation> {
        let user = &caller.user_id;
        let c = self.load(conversation)?;
        if c.is_direct() {
            return Err(ChatError::Forbidden);
        }
        if !c.is_member(user) {
            return Ok(c);
        }

        self.db.with(|db| db.remove_member(conversation, user))?;
        info!(conversation = %conversation, user = %user, "member left");

        let updated = self.membership_changed(conversation, user, MembershipAction::Left)?;
        if updated.moderators.is_empty() {
            warn!(conversation = %conversation, "community has no moderators left");
        }
        Ok(updated)
    }

    /// Invite `target` to a community. Only moderators may invite.
    pub fn invite(
        &self,
        conversation: ConversationId,
        actor: &Caller,
        target: &UserId,
    ) -> ChatResult<()> {
        let c = self.load(conversation)?;
        if !c.active || c.is_direct() || !c.is_moderator(&actor.user_id) {
            return Err(ChatError::Forbidden);
        }
        if c.is_member(target) {
            return Err(ChatError::AlreadyMember(conversation));
        }

        let added = self
            .db
            .with(|db| db.add_invite(conversation, target, &actor.user_id))?;
        if added {
            info!(conversation = %conversation, user = %target, by = %actor.user_id, "user invited");
            self.events.publish(ChatEvent::MembershipChanged {
                conversation_id: conversation,
                user_id: target.clone(),
                action: MembershipAction::Invited,
            });
        }
        Ok(())
    }

    /// Make a member a moderator. The actor must be a moderator or the
    /// creator.
    pub fn promote(
        &self,
        conversation: ConversationId,
        actor: &Caller,
        target: &UserId,
    ) -> ChatResult<Conversation> {
        let c = self.load_for_moderation(conversation, &actor.user_id)?;
        if !c.is_member(target) {
            return Err(ChatError::InvalidRequest(
                "only members can be promoted".into(),
            ));
        }
        if !self.db.with(|db| db.add_moderator(conversation, target))? {
            return Ok(c);
        }

        info!(conversation = %conversation, user = %target, by = %actor.user_id, "moderator promoted");
        self.membership_changed(conversation, target, MembershipAction::Promoted)
    }

    /// Remove a moderator seat. Only the creator may demote the creator.
    pub fn demote(
        &self,
        conversation: ConversationId,
        actor: &Caller,
        target: &UserId,
    ) -> ChatResult<Conversation> {
        let c = self.load_for_moderation(conversation, &actor.user_id)?;
        if *target == c.creator_id && actor.user_id != c.creator_id {
            return Err(ChatError::Forbidden);
        }
        if !self.db.with(|db| db.remove_moderator(conversation, target))? {
            return Ok(c);
        }

        info!(conversation = %conversation, user = %target, by = %actor.user_id, "moderator demoted");
        let updated = self.membership_changed(conversation, target, MembershipAction::Demoted)?;
        if updated.moderators.is_empty() {
            warn!(conversation = %conversation, "community has no moderators left");
        }
        Ok(updated)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Deactivate a community. Allowed for owners and the creator. History
    /// is kept; every command then treats the conversation as inactive.
    pub fn deactivate(&self, conversation: ConversationId, caller: &Caller) -> ChatResult<Conversation> {
        let c = self.load(conversation)?;
        if c.is_direct() || (caller.role != Role::Owner && caller.user_id != c.creator_id) {
            return Err(ChatError::Forbidden);
        }
        if !self.db.with(|db| db.set_conversation_active(conversation, false))? {
            return Ok(c);
        }

        info!(conversation = %conversation, by = %caller.user_id, "community deactivated");
        let updated = self.load(conversation)?;
        self.events
            .publish(ChatEvent::ConversationUpdated(updated.clone()));
        Ok(updated)
    }

    /// Change name, description, rules or avatar. Moderators only.
    pub fn update_details(
        &self,
        conversation: ConversationId,
        actor: &Caller,
        update: CommunityUpdate,
    ) -> ChatResult<Conversation> {
        let c = self.load(conversation)?;
        if !c.active || c.is_direct() || !c.is_moderator(&actor.user_id) {
            return Err(ChatError::Forbidden);
        }
        let name = update
            .name
            .as_deref()
            .map(|n| self.validate_name(n))
            .transpose()?;
        let description = update.description.as_deref().map(str::trim);
        let rules = update.rules.map(clean_rules);
        let avatar_url = update.avatar_url.as_deref().map(check_avatar_url).transpose()?;

        self.db.with(|db| {
            db.update_community_details(
                conversation,
                name.as_deref(),
                description,
                rules.as_deref(),
                avatar_url.as_deref(),
            )
        })?;

        let updated = self.load(conversation)?;
        self.events
            .publish(ChatEvent::ConversationUpdated(updated.clone()));
        Ok(updated)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Fetch a conversation as seen by `viewer`. Open communities are
    /// visible to anyone; private communities and direct threads only to
    /// their members.
    pub fn get(&self, conversation: ConversationId, viewer: &UserId) -> ChatResult<Conversation> {
        let c = self.load(conversation)?;
        let open = !c.is_direct() && c.visibility != Visibility::Private;
        if open || c.is_member(viewer) {
            Ok(c)
        } else {
            Err(ChatError::Forbidden)
        }
    }

    pub fn search(&self, viewer: &UserId, query: &str) -> ChatResult<Vec<Conversation>> {
        self.db.read(|db| db.search_communities(viewer, query))
    }

    pub fn list_for_user(&self, user: &UserId) -> ChatResult<Vec<Conversation>> {
        self.db.read(|db| db.list_conversations_for_user(user))
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn load(&self, conversation: ConversationId) -> ChatResult<Conversation> {
        self.db
            .read(|db| db.get_conversation(conversation))
            .map_err(|e| e.not_found_as(ChatError::ConversationNotFound(conversation)))
    }

    /// Load an active community the actor may moderate: a current member who
    /// is a moderator or the creator.
    fn load_for_moderation(
        &self,
        conversation: ConversationId,
        actor: &UserId,
    ) -> ChatResult<Conversation> {
        let c = self.load(conversation)?;
        let allowed = c.is_member(actor) && (c.is_moderator(actor) || c.creator_id == *actor);
        if !c.active || c.is_direct() || !allowed {
            return Err(ChatError::Forbidden);
        }
        Ok(c)
    }

    fn membership_changed(
        &self,
        conversation: ConversationId,
        user: &UserId,
        action: MembershipAction,
    ) -> ChatResult<Conversation> {
        self.events.publish(ChatEvent::MembershipChanged {
            conversation_id: conversation,
            user_id: user.clone(),
            action,
        });
        let updated = self.load(conversation)?;
        self.events
            .publish(ChatEvent::ConversationUpdated(updated.clone()));
        Ok(updated)
    }

    fn validate_name(&self, name: &str) -> ChatResult<String> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ChatError::InvalidRequest("community name is empty".into()));
        }
        if name.chars().count() > self.config.max_name_chars {
            return Err(ChatError::InvalidRequest(format!(
                "community name exceeds {} characters",
                self.config.max_name_chars
            )));
        }
        Ok(name.to_string())
    }
}

/// Trimmed avatar URL; empty is allowed and means "no avatar".
fn check_avatar_url(url: &str) -> ChatResult<String> {
    let url = url.trim();
    if url.is_empty() {
        return Ok(String::new());
    }
    if !(url.starts_with("https://") || url.starts_with("http://")) || url.len() > MAX_AVATAR_URL_LEN {
        return Err(ChatError::InvalidRequest("avatar must be an http(s) URL".into()));
    }
    Ok(url.to_string())
}

const MAX_AVATAR_URL_LEN: usize = 2048;

fn clean_rules(rules: Vec<String>) -> Vec<String> {
    rules
        .into_iter()
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .collect()
}
