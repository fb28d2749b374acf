use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::{
        ConversationPayload, LastMessage, MessagePayload, NotificationPayload, PresenceEntry,
        UserStub,
    },
};
use uuid::Uuid;

use super::*;

fn ts(raw: &str) -> DateTime<Utc> {
    raw.parse().expect("timestamp")
}

fn stub(user_id: i64) -> UserStub {
    UserStub {
        user_id: UserId(user_id),
        username: None,
    }
}

fn message(id: i64, conversation: i64, sender: i64, text: &str, at: &str) -> MessagePayload {
    MessagePayload {
        message_id: MessageId(id),
        conversation_id: ConversationId(conversation),
        sender: stub(sender),
        text: text.to_string(),
        seen: false,
        created_at: ts(at),
    }
}

fn conversation(id: i64, members: Vec<UserStub>, at: &str) -> ConversationPayload {
    ConversationPayload {
        conversation_id: ConversationId(id),
        members,
        last_message: None,
        updated_at: ts(at),
        messages: Vec::new(),
    }
}

#[test]
fn redelivered_message_id_is_stored_and_counted_once() {
    let mut state = ChatState::new();
    let incoming = message(7, 1, 2, "hello", "2024-01-01T10:00:00Z");

    assert!(state.record_incoming_message(incoming.clone()));
    assert!(!state.record_incoming_message(incoming.clone()));
    assert!(!state.record_incoming_message(incoming));

    let entry = state.conversation(ConversationId(1)).expect("conversation");
    assert_eq!(entry.messages().len(), 1);
    assert_eq!(state.unread_count(ConversationId(1)), 1);
}

#[test]
fn redelivery_does_not_refresh_ordering_metadata() {
    let mut state = ChatState::new();
    state.record_incoming_message(message(1, 1, 2, "first", "2024-01-01T10:00:00Z"));
    state.record_incoming_message(message(2, 1, 2, "second", "2024-01-01T11:00:00Z"));

    // Redeliver the older message; the newer summary must survive.
    state.record_incoming_message(message(1, 1, 2, "first", "2024-01-01T10:00:00Z"));

    let entry = state.conversation(ConversationId(1)).expect("conversation");
    assert_eq!(entry.updated_at, Some(ts("2024-01-01T11:00:00Z")));
    let last = entry.last_message.as_ref().expect("last message");
    assert_eq!(last.text, "second");
}

#[test]
fn selecting_a_conversation_zeroes_its_unread_counter() {
    let mut state = ChatState::new();
    for id in 1..=3 {
        state.record_incoming_message(message(id, 1, 2, "ping", "2024-01-01T10:00:00Z"));
    }
    assert_eq!(state.unread_count(ConversationId(1)), 3);

    state.select_conversation(Some(ConversationId(1)));
    assert_eq!(state.unread_count(ConversationId(1)), 0);
    assert_eq!(state.selected_conversation(), Some(ConversationId(1)));
}

#[test]
fn messages_for_the_selected_conversation_do_not_count_as_unread() {
    let mut state = ChatState::new();
    state.select_conversation(Some(ConversationId(5)));

    state.record_incoming_message(message(1, 5, 2, "hi", "2024-01-01T10:00:00Z"));
    state.record_incoming_message(message(2, 6, 2, "other room", "2024-01-01T10:01:00Z"));

    assert_eq!(state.unread_count(ConversationId(5)), 0);
    assert_eq!(state.unread_count(ConversationId(6)), 1);
}

#[test]
fn mark_seen_is_idempotent_and_skips_the_viewers_own_messages() {
    let mut state = ChatState::new();
    state.record_incoming_message(message(1, 1, 2, "from peer", "2024-01-01T10:00:00Z"));
    state.record_incoming_message(message(2, 1, 9, "from viewer", "2024-01-01T10:01:00Z"));

    state.mark_seen(ConversationId(1), UserId(9));
    let flags_once: Vec<(i64, bool)> = state
        .conversation(ConversationId(1))
        .expect("conversation")
        .messages()
        .iter()
        .map(|m| (m.message_id.0, m.seen))
        .collect();

    state.mark_seen(ConversationId(1), UserId(9));
    let flags_twice: Vec<(i64, bool)> = state
        .conversation(ConversationId(1))
        .expect("conversation")
        .messages()
        .iter()
        .map(|m| (m.message_id.0, m.seen))
        .collect();

    assert_eq!(flags_once, vec![(1, true), (2, false)]);
    assert_eq!(flags_once, flags_twice);
}

#[test]
fn offline_transition_keeps_supplied_last_seen_and_leaves_online_set() {
    let mut state = ChatState::new();
    state.set_presence(UserId(1), true, None);
    assert_eq!(state.online_users(), vec![UserId(1)]);

    state.set_presence(UserId(1), false, Some(ts("2024-01-01T10:00:00Z")));

    let presence = state.presence(UserId(1)).expect("presence");
    assert!(!presence.online);
    assert_eq!(presence.last_seen, Some(ts("2024-01-01T10:00:00Z")));
    assert!(state.online_users().is_empty());
}

#[test]
fn going_online_clears_last_seen() {
    let mut state = ChatState::new();
    state.set_presence(UserId(4), false, Some(ts("2024-01-01T08:00:00Z")));
    state.set_presence(UserId(4), true, Some(ts("2024-01-01T08:00:00Z")));

    let presence = state.presence(UserId(4)).expect("presence");
    assert!(presence.online);
    assert_eq!(presence.last_seen, None);
}

#[test]
fn offline_transition_without_timestamp_records_one() {
    let mut state = ChatState::new();
    state.set_presence(UserId(3), false, None);
    let presence = state.presence(UserId(3)).expect("presence");
    assert!(presence.last_seen.is_some());
}

#[test]
fn presence_snapshot_replaces_prior_state() {
    let mut state = ChatState::new();
    state.set_presence(UserId(1), true, None);

    state.set_presence_snapshot(vec![
        PresenceEntry {
            user_id: UserId(2),
            online: true,
            // A snapshot claiming online with a stale last-seen still obeys
            // the invariant.
            last_seen: Some(ts("2024-01-01T09:00:00Z")),
        },
        PresenceEntry {
            user_id: UserId(3),
            online: false,
            last_seen: Some(ts("2024-01-01T07:30:00Z")),
        },
    ]);

    assert!(state.presence(UserId(1)).is_none());
    assert_eq!(state.presence(UserId(2)).expect("u2").last_seen, None);
    assert_eq!(state.online_users(), vec![UserId(2)]);
}

#[test]
fn null_last_message_never_overwrites_a_local_one() {
    let mut state = ChatState::new();
    state.record_incoming_message(message(1, 1, 2, "hi", "2024-01-01T10:00:00Z"));

    state.upsert_conversation(conversation(1, vec![stub(2), stub(9)], "2024-01-01T09:00:00Z"));

    let entry = state.conversation(ConversationId(1)).expect("conversation");
    assert_eq!(
        entry.last_message.as_ref().map(|m| m.text.as_str()),
        Some("hi")
    );
    assert_eq!(entry.members.len(), 2);
    // A stale server timestamp must not regress local ordering either.
    assert_eq!(entry.updated_at, Some(ts("2024-01-01T10:00:00Z")));
}

#[test]
fn upsert_with_last_message_replaces_the_summary() {
    let mut state = ChatState::new();
    state.record_incoming_message(message(1, 1, 2, "old", "2024-01-01T10:00:00Z"));

    let mut payload = conversation(1, vec![stub(2)], "2024-01-01T12:00:00Z");
    payload.last_message = Some(LastMessage {
        text: "fresh".to_string(),
        sender: stub(2),
        seen: false,
        created_at: ts("2024-01-01T12:00:00Z"),
    });
    state.upsert_conversation(payload);

    let entry = state.conversation(ConversationId(1)).expect("conversation");
    assert_eq!(
        entry.last_message.as_ref().map(|m| m.text.as_str()),
        Some("fresh")
    );
}

#[test]
fn unknown_conversation_gets_a_placeholder_instead_of_dropping_the_message() {
    let mut state = ChatState::new();
    assert!(state.record_incoming_message(message(1, 42, 2, "lost?", "2024-01-01T10:00:00Z")));

    let entry = state.conversation(ConversationId(42)).expect("placeholder");
    assert!(entry.members.is_empty());
    assert_eq!(entry.messages().len(), 1);
    assert_eq!(entry.messages()[0].text, "lost?");
}

#[test]
fn hydration_applies_once_and_dedups_against_live_messages() {
    let mut state = ChatState::new();
    // Live delivery lands before the REST history response.
    state.record_incoming_message(message(3, 1, 2, "live", "2024-01-01T10:02:00Z"));

    let inserted = state.hydrate_messages(
        ConversationId(1),
        vec![
            message(1, 1, 2, "first", "2024-01-01T10:00:00Z"),
            message(2, 1, 9, "second", "2024-01-01T10:01:00Z"),
            message(3, 1, 2, "live", "2024-01-01T10:02:00Z"),
        ],
    );
    assert_eq!(inserted, 2);

    let ids: Vec<i64> = state
        .conversation(ConversationId(1))
        .expect("conversation")
        .messages()
        .iter()
        .map(|m| m.message_id.0)
        .collect();
    assert_eq!(ids, vec![1, 2, 3]);

    // A second hydration is absorbed.
    let inserted = state.hydrate_messages(
        ConversationId(1),
        vec![message(4, 1, 2, "late", "2024-01-01T10:03:00Z")],
    );
    assert_eq!(inserted, 0);
}

#[test]
fn conversations_are_ordered_most_recent_first() {
    let mut state = ChatState::new();
    state.record_incoming_message(message(1, 1, 2, "a", "2024-01-01T10:00:00Z"));
    state.record_incoming_message(message(2, 2, 2, "b", "2024-01-01T11:00:00Z"));
    state.record_incoming_message(message(3, 3, 2, "c", "2024-01-01T09:00:00Z"));

    let order: Vec<i64> = state
        .conversations()
        .iter()
        .map(|entry| entry.conversation_id.0)
        .collect();
    assert_eq!(order, vec![2, 1, 3]);
}

#[test]
fn typing_flag_sets_and_clears() {
    let mut state = ChatState::new();
    state.set_typing(ConversationId(1), true);
    assert!(state.is_typing(ConversationId(1)));
    assert!(!state.is_typing(ConversationId(2)));

    state.set_typing(ConversationId(1), false);
    assert!(!state.is_typing(ConversationId(1)));
}

#[test]
fn notification_sink_accumulates_and_drains() {
    let mut state = ChatState::new();
    state.push_notification(NotificationPayload {
        notification_id: Uuid::new_v4(),
        kind: "attendance".to_string(),
        body: "shift reminder".to_string(),
        created_at: ts("2024-01-01T08:00:00Z"),
    });
    assert_eq!(state.notifications().len(), 1);

    let drained = state.take_notifications();
    assert_eq!(drained.len(), 1);
    assert!(state.notifications().is_empty());
}
