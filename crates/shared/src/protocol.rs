//! Wire contract for the realtime channel.
//!
//! Event names and payload fields are camelCase on the wire; the enums below
//! are adjacently tagged (`event` / `data`) to match the server framing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    domain::{ConversationId, MessageId, UserId},
    error::ApiError,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStub {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: UserStub,
    pub text: String,
    #[serde(default)]
    pub seen: bool,
    pub created_at: DateTime<Utc>,
}

/// Last-message summary carried on a conversation, without the full payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
    pub text: String,
    pub sender: UserStub,
    #[serde(default)]
    pub seen: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationPayload {
    pub conversation_id: ConversationId,
    pub members: Vec<UserStub>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<LastMessage>,
    pub updated_at: DateTime<Utc>,
    /// Message history embedded in an initial payload; empty on updates.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<MessagePayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeenPayload {
    pub conversation_id: ConversationId,
    pub viewer_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub user_id: UserId,
    pub online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    pub notification_id: Uuid,
    pub kind: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// First frame the client sends after the socket upgrade. The bearer token
/// rides in the payload, not a header.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeAck {
    pub session_id: String,
    pub user_id: UserId,
}

/// Server reply to [`HandshakeRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum HandshakeReply {
    ConnectAck(HandshakeAck),
    Error(ApiError),
}

/// Events the server pushes over the realtime channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    NewMessage(MessagePayload),
    Typing(TypingPayload),
    StopTyping(TypingPayload),
    SeenUpdate(SeenPayload),
    UserOnline(PresencePayload),
    UserOffline(PresencePayload),
    PresenceList(Vec<PresenceEntry>),
    NewConversation(ConversationPayload),
    Notification(NotificationPayload),
    Error(ApiError),
}

/// Registry key for [`ServerEvent`] subscriptions. Keeping the discriminant
/// closed means every subscription is typed against a known payload shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NewMessage,
    Typing,
    StopTyping,
    SeenUpdate,
    UserOnline,
    UserOffline,
    PresenceList,
    NewConversation,
    Notification,
    Error,
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ServerEvent::NewMessage(_) => EventKind::NewMessage,
            ServerEvent::Typing(_) => EventKind::Typing,
            ServerEvent::StopTyping(_) => EventKind::StopTyping,
            ServerEvent::SeenUpdate(_) => EventKind::SeenUpdate,
            ServerEvent::UserOnline(_) => EventKind::UserOnline,
            ServerEvent::UserOffline(_) => EventKind::UserOffline,
            ServerEvent::PresenceList(_) => EventKind::PresenceList,
            ServerEvent::NewConversation(_) => EventKind::NewConversation,
            ServerEvent::Notification(_) => EventKind::Notification,
            ServerEvent::Error(_) => EventKind::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRef {
    pub conversation_id: ConversationId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub conversation_id: ConversationId,
    pub text: String,
}

/// Events the client emits to the server. `UserOnline` declares this session
/// online; `PresenceList` requests a presence snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEmit {
    JoinConversation(ConversationRef),
    SendMessage(SendMessagePayload),
    Typing(ConversationRef),
    StopTyping(ConversationRef),
    MarkSeen(ConversationRef),
    UserOnline,
    PresenceList,
}
