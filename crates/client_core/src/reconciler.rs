//! Normalized client view of conversations, presence, and notifications.
//!
//! Every mutation goes through a transition method on [`ChatState`];
//! inbound events and REST hydration results are folded through the same
//! paths, so duplicate deliveries are absorbed by id equality instead of
//! double-counting.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::{
        ConversationPayload, LastMessage, MessagePayload, NotificationPayload, PresenceEntry,
        UserStub,
    },
};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceState {
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ConversationEntry {
    pub conversation_id: ConversationId,
    pub members: Vec<UserStub>,
    pub last_message: Option<LastMessage>,
    pub updated_at: Option<DateTime<Utc>>,
    messages: Vec<MessagePayload>,
    message_ids: HashSet<MessageId>,
    hydrated: bool,
}

impl ConversationEntry {
    /// Entry created from a message that referenced a conversation we have
    /// not seen yet; the authoritative metadata is still in flight.
    fn placeholder(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            members: Vec::new(),
            last_message: None,
            updated_at: None,
            messages: Vec::new(),
            message_ids: HashSet::new(),
            hydrated: false,
        }
    }

    pub fn messages(&self) -> &[MessagePayload] {
        &self.messages
    }

    pub fn contains_message(&self, message_id: MessageId) -> bool {
        self.message_ids.contains(&message_id)
    }
}

#[derive(Default)]
pub struct ChatState {
    conversations: HashMap<ConversationId, ConversationEntry>,
    selected: Option<ConversationId>,
    unread: HashMap<ConversationId, u32>,
    presence: HashMap<UserId, PresenceState>,
    typing: HashSet<ConversationId>,
    notifications: Vec<NotificationPayload>,
}

impl ChatState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the active conversation. Selection clears that conversation's
    /// unread counter in the same transition.
    pub fn select_conversation(&mut self, conversation_id: Option<ConversationId>) {
        self.selected = conversation_id;
        if let Some(id) = conversation_id {
            self.unread.remove(&id);
        }
    }

    pub fn selected_conversation(&self) -> Option<ConversationId> {
        self.selected
    }

    /// Fold one inbound message. Returns whether it was newly inserted.
    ///
    /// A redelivered id changes nothing: no duplicate entry, no unread
    /// increment, no metadata refresh. Messages for unknown conversations
    /// land in a placeholder entry instead of being dropped.
    pub fn record_incoming_message(&mut self, message: MessagePayload) -> bool {
        let conversation_id = message.conversation_id;
        let entry = self
            .conversations
            .entry(conversation_id)
            .or_insert_with(|| ConversationEntry::placeholder(conversation_id));

        if !entry.message_ids.insert(message.message_id) {
            return false;
        }

        entry.last_message = Some(LastMessage {
            text: message.text.clone(),
            sender: message.sender.clone(),
            seen: message.seen,
            created_at: message.created_at,
        });
        entry.updated_at = Some(message.created_at);
        entry.messages.push(message);

        if self.selected != Some(conversation_id) {
            *self.unread.entry(conversation_id).or_insert(0) += 1;
        }
        true
    }

    /// Mark every message not authored by `viewer_id` as seen. Idempotent.
    pub fn mark_seen(&mut self, conversation_id: ConversationId, viewer_id: UserId) {
        let Some(entry) = self.conversations.get_mut(&conversation_id) else {
            return;
        };
        for message in &mut entry.messages {
            if message.sender.user_id != viewer_id {
                message.seen = true;
            }
        }
        if let Some(last) = &mut entry.last_message {
            if last.sender.user_id != viewer_id {
                last.seen = true;
            }
        }
    }

    /// Merge server-supplied conversation metadata. A null incoming
    /// last-message never overwrites a locally present one, and embedded
    /// messages hydrate the list exactly once, deduplicated by id.
    pub fn upsert_conversation(&mut self, payload: ConversationPayload) {
        let conversation_id = payload.conversation_id;
        let entry = self
            .conversations
            .entry(conversation_id)
            .or_insert_with(|| ConversationEntry::placeholder(conversation_id));

        if !payload.members.is_empty() {
            entry.members = payload.members;
        }
        if payload.last_message.is_some() {
            entry.last_message = payload.last_message;
        }
        entry.updated_at = Some(match entry.updated_at {
            Some(local) => local.max(payload.updated_at),
            None => payload.updated_at,
        });

        if !payload.messages.is_empty() {
            Self::hydrate_entry(entry, payload.messages);
        }
    }

    /// Hydrate message history fetched over REST. Applied once per
    /// conversation; later calls are absorbed.
    pub fn hydrate_messages(
        &mut self,
        conversation_id: ConversationId,
        messages: Vec<MessagePayload>,
    ) -> usize {
        let entry = self
            .conversations
            .entry(conversation_id)
            .or_insert_with(|| ConversationEntry::placeholder(conversation_id));
        Self::hydrate_entry(entry, messages)
    }

    fn hydrate_entry(entry: &mut ConversationEntry, messages: Vec<MessagePayload>) -> usize {
        if entry.hydrated {
            return 0;
        }
        let mut inserted = 0;
        for message in messages {
            if entry.message_ids.insert(message.message_id) {
                entry.messages.push(message);
                inserted += 1;
            }
        }
        // History can arrive after live messages; restore timeline order.
        entry
            .messages
            .sort_by_key(|message| (message.created_at, message.message_id.0));
        entry.hydrated = true;
        inserted
    }

    /// Apply a presence transition. Going online clears last-seen; going
    /// offline records the supplied timestamp or the local transition time.
    pub fn set_presence(
        &mut self,
        user_id: UserId,
        online: bool,
        last_seen: Option<DateTime<Utc>>,
    ) {
        let state = if online {
            PresenceState {
                online: true,
                last_seen: None,
            }
        } else {
            PresenceState {
                online: false,
                last_seen: last_seen.or_else(|| Some(Utc::now())),
            }
        };
        self.presence.insert(user_id, state);
    }

    /// Replace the presence map with a server snapshot.
    pub fn set_presence_snapshot(&mut self, entries: Vec<PresenceEntry>) {
        self.presence.clear();
        for entry in entries {
            let last_seen = if entry.online { None } else { entry.last_seen };
            self.presence.insert(
                entry.user_id,
                PresenceState {
                    online: entry.online,
                    last_seen,
                },
            );
        }
    }

    pub fn set_typing(&mut self, conversation_id: ConversationId, is_typing: bool) {
        if is_typing {
            self.typing.insert(conversation_id);
        } else {
            self.typing.remove(&conversation_id);
        }
    }

    pub fn push_notification(&mut self, notification: NotificationPayload) {
        self.notifications.push(notification);
    }

    pub fn take_notifications(&mut self) -> Vec<NotificationPayload> {
        std::mem::take(&mut self.notifications)
    }

    pub fn notifications(&self) -> &[NotificationPayload] {
        &self.notifications
    }

    pub fn conversation(&self, conversation_id: ConversationId) -> Option<&ConversationEntry> {
        self.conversations.get(&conversation_id)
    }

    /// Conversations ordered most-recently-updated first.
    pub fn conversations(&self) -> Vec<&ConversationEntry> {
        let mut entries: Vec<&ConversationEntry> = self.conversations.values().collect();
        entries.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then(a.conversation_id.0.cmp(&b.conversation_id.0))
        });
        entries
    }

    pub fn unread_count(&self, conversation_id: ConversationId) -> u32 {
        self.unread.get(&conversation_id).copied().unwrap_or(0)
    }

    pub fn is_typing(&self, conversation_id: ConversationId) -> bool {
        self.typing.contains(&conversation_id)
    }

    pub fn presence(&self, user_id: UserId) -> Option<&PresenceState> {
        self.presence.get(&user_id)
    }

    /// Users currently online, in stable id order.
    pub fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .presence
            .iter()
            .filter(|(_, state)| state.online)
            .map(|(user_id, _)| *user_id)
            .collect();
        users.sort_by_key(|user_id| user_id.0);
        users
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
