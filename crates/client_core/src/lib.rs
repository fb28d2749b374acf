//! Realtime session manager for the attendance and messaging client.
//!
//! One [`SessionClient`] owns at most one live socket per credential. The
//! supervisor task reconnects with backoff, re-declares presence on every
//! successful handshake, drains emissions deferred while offline, and folds
//! inbound events into the [`reconciler::ChatState`] before fanning them out
//! to [`registry::EventRegistry`] subscribers. REST hydration for
//! conversations and message history goes through the same fold paths, so
//! redeliveries are absorbed by id.

pub mod reconciler;
pub mod registry;
pub mod transport;

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use serde::Serialize;
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use shared::{
    domain::{ConnectionStatus, ConversationId, UserId},
    protocol::{
        ClientEmit, ConversationPayload, ConversationRef, EventKind, MessagePayload,
        SendMessagePayload, ServerEvent,
    },
};

use crate::{
    reconciler::ChatState,
    registry::{EventRegistry, Subscription},
    transport::{LinkEvent, ReconnectPolicy, SocketLink, SocketTransport, WebSocketTransport},
};

/// Typing indicators decay after this long without a follow-up event.
const TYPING_EXPIRY: Duration = Duration::from_secs(2);

#[derive(Default)]
struct SessionState {
    server_url: Option<String>,
    credential: Option<String>,
    session_id: Option<String>,
    user_id: Option<UserId>,
    outbound: Option<mpsc::UnboundedSender<ClientEmit>>,
    pending_emissions: Vec<ClientEmit>,
    supervisor: Option<JoinHandle<()>>,
    /// Bumped on every teardown; stale supervisor writes check it first.
    epoch: u64,
    typing_generation: HashMap<ConversationId, u64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OpenConversationRequest {
    peer_id: UserId,
}

pub struct SessionClient {
    http: Client,
    transport: Arc<dyn SocketTransport>,
    policy: ReconnectPolicy,
    registry: EventRegistry,
    state: Mutex<ChatState>,
    inner: Mutex<SessionState>,
    status_tx: watch::Sender<ConnectionStatus>,
    /// Retained so the watch channel stays open; without a live receiver
    /// `status_tx.send` is a silent no-op and `status()` never updates.
    _status_rx: watch::Receiver<ConnectionStatus>,
}

impl SessionClient {
    pub fn new() -> Arc<Self> {
        Self::with_transport(Arc::new(WebSocketTransport), ReconnectPolicy::default())
    }

    pub fn with_transport(
        transport: Arc<dyn SocketTransport>,
        policy: ReconnectPolicy,
    ) -> Arc<Self> {
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        Arc::new(Self {
            http: Client::new(),
            transport,
            policy,
            registry: EventRegistry::new(),
            state: Mutex::new(ChatState::new()),
            inner: Mutex::new(SessionState::default()),
            status_tx,
            _status_rx: status_rx,
        })
    }

    /// Open (or keep) the realtime session for `credential`.
    ///
    /// Re-initializing while the session for the same credential is live is
    /// a no-op; a different credential tears the old session down first.
    pub async fn initialize(self: &Arc<Self>, server_url: &str, credential: &str) -> Result<()> {
        if credential.is_empty() {
            return Err(anyhow!("credential must not be empty"));
        }

        let mut guard = self.inner.lock().await;
        let supervisor_live = guard
            .supervisor
            .as_ref()
            .is_some_and(|task| !task.is_finished());
        if supervisor_live && guard.credential.as_deref() == Some(credential) {
            debug!("session already live for this credential");
            return Ok(());
        }

        if let Some(task) = guard.supervisor.take() {
            task.abort();
        }
        guard.epoch += 1;
        let epoch = guard.epoch;
        guard.server_url = Some(server_url.to_string());
        guard.credential = Some(credential.to_string());
        guard.session_id = None;
        guard.user_id = None;
        guard.outbound = None;

        let client = Arc::clone(self);
        let server_url = server_url.to_string();
        let credential = credential.to_string();
        let _ = self.status_tx.send(ConnectionStatus::Connecting);
        guard.supervisor = Some(tokio::spawn(async move {
            client.run_session(epoch, server_url, credential).await;
        }));
        Ok(())
    }

    /// Tear the session down: abort the supervisor, drop the registry and
    /// any deferred emissions, clear the credential. Safe when already
    /// disconnected.
    pub async fn disconnect(&self) {
        let supervisor = {
            let mut guard = self.inner.lock().await;
            guard.epoch += 1;
            guard.server_url = None;
            guard.credential = None;
            guard.session_id = None;
            guard.user_id = None;
            guard.outbound = None;
            guard.pending_emissions.clear();
            guard.typing_generation.clear();
            guard.supervisor.take()
        };
        if let Some(task) = supervisor {
            task.abort();
        }
        self.registry.clear();
        let _ = self.status_tx.send(ConnectionStatus::Disconnected);
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status().is_connected()
    }

    /// Watch channel mirroring the connection status; the UI renders this
    /// instead of receiving connection failures as errors.
    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    pub async fn session_id(&self) -> Option<String> {
        self.inner.lock().await.session_id.clone()
    }

    pub async fn user_id(&self) -> Option<UserId> {
        self.inner.lock().await.user_id
    }

    pub fn on(
        &self,
        kind: EventKind,
        callback: impl Fn(&ServerEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.registry.on(kind, callback)
    }

    pub fn off(&self, subscription: Subscription) -> bool {
        self.registry.off(subscription)
    }

    pub fn off_all(&self, kind: EventKind) -> usize {
        self.registry.off_all(kind)
    }

    /// Read the reconciled state. Mutation stays behind the session's own
    /// transition paths; callers only get a shared view.
    pub async fn read_state<R>(&self, read: impl FnOnce(&ChatState) -> R) -> R {
        let state = self.state.lock().await;
        read(&state)
    }

    /// Send an event now if connected, otherwise defer it onto the pending
    /// queue drained on the next successful connect. Deferral is not an
    /// error.
    pub async fn emit(&self, event: ClientEmit) {
        let mut guard = self.inner.lock().await;
        match &guard.outbound {
            Some(outbound) => {
                if outbound.send(event.clone()).is_err() {
                    debug!("send path closed mid-emit, deferring");
                    guard.pending_emissions.push(event);
                }
            }
            None => {
                debug!("not connected, deferring emission");
                guard.pending_emissions.push(event);
            }
        }
    }

    /// Select the active conversation, clearing its unread counter, and
    /// join its realtime room.
    pub async fn select_conversation(&self, conversation_id: Option<ConversationId>) {
        {
            let mut state = self.state.lock().await;
            state.select_conversation(conversation_id);
        }
        if let Some(conversation_id) = conversation_id {
            self.emit(ClientEmit::JoinConversation(ConversationRef {
                conversation_id,
            }))
            .await;
        }
    }

    pub async fn send_message(&self, conversation_id: ConversationId, text: impl Into<String>) {
        self.emit(ClientEmit::SendMessage(SendMessagePayload {
            conversation_id,
            text: text.into(),
        }))
        .await;
    }

    pub async fn set_typing(&self, conversation_id: ConversationId, typing: bool) {
        let reference = ConversationRef { conversation_id };
        if typing {
            self.emit(ClientEmit::Typing(reference)).await;
        } else {
            self.emit(ClientEmit::StopTyping(reference)).await;
        }
    }

    /// Fetch the conversation list and fold it into local state. Returns
    /// the conversation ids seen in the response.
    pub async fn hydrate_conversations(&self) -> Result<Vec<ConversationId>> {
        let (server_url, token) = self.rest_context().await?;
        let conversations: Vec<ConversationPayload> = self
            .http
            .get(format!("{server_url}/conversations"))
            .bearer_auth(&token)
            .send()
            .await
            .context("conversation list request failed")?
            .error_for_status()?
            .json()
            .await
            .context("conversation list response was not valid JSON")?;

        let ids: Vec<ConversationId> = conversations
            .iter()
            .map(|c| c.conversation_id)
            .collect();
        let mut state = self.state.lock().await;
        for conversation in conversations {
            state.upsert_conversation(conversation);
        }
        Ok(ids)
    }

    /// Fetch message history for one conversation. Hydration happens once;
    /// anything already delivered over the socket is absorbed by id.
    pub async fn hydrate_messages(&self, conversation_id: ConversationId) -> Result<usize> {
        let (server_url, token) = self.rest_context().await?;
        let messages: Vec<MessagePayload> = self
            .http
            .get(format!(
                "{server_url}/conversations/{}/messages",
                conversation_id.0
            ))
            .bearer_auth(&token)
            .send()
            .await
            .context("message history request failed")?
            .error_for_status()?
            .json()
            .await
            .context("message history response was not valid JSON")?;

        let mut state = self.state.lock().await;
        Ok(state.hydrate_messages(conversation_id, messages))
    }

    /// Fetch or create the conversation with `peer`, fold it into local
    /// state, and return its id.
    pub async fn open_conversation_with(&self, peer: UserId) -> Result<ConversationId> {
        let (server_url, token) = self.rest_context().await?;
        let conversation: ConversationPayload = self
            .http
            .post(format!("{server_url}/conversations"))
            .bearer_auth(&token)
            .json(&OpenConversationRequest { peer_id: peer })
            .send()
            .await
            .context("open conversation request failed")?
            .error_for_status()?
            .json()
            .await
            .context("open conversation response was not valid JSON")?;

        let conversation_id = conversation.conversation_id;
        let mut state = self.state.lock().await;
        state.upsert_conversation(conversation);
        Ok(conversation_id)
    }

    /// Mark a conversation seen: fold locally, persist over REST, and tell
    /// the realtime channel.
    pub async fn mark_conversation_seen(&self, conversation_id: ConversationId) -> Result<()> {
        let viewer = { self.inner.lock().await.user_id };
        if let Some(viewer_id) = viewer {
            let mut state = self.state.lock().await;
            state.mark_seen(conversation_id, viewer_id);
        }

        let (server_url, token) = self.rest_context().await?;
        self.http
            .post(format!(
                "{server_url}/conversations/{}/seen",
                conversation_id.0
            ))
            .bearer_auth(&token)
            .send()
            .await
            .context("mark seen request failed")?
            .error_for_status()?;

        self.emit(ClientEmit::MarkSeen(ConversationRef { conversation_id }))
            .await;
        Ok(())
    }

    async fn rest_context(&self) -> Result<(String, String)> {
        let guard = self.inner.lock().await;
        let server_url = guard
            .server_url
            .clone()
            .ok_or_else(|| anyhow!("session not initialized: missing server url"))?;
        let token = guard
            .credential
            .clone()
            .ok_or_else(|| anyhow!("session not initialized: missing credential"))?;
        Ok((server_url, token))
    }

    async fn run_session(self: Arc<Self>, epoch: u64, server_url: String, credential: String) {
        let mut attempt: u32 = 0;
        loop {
            if !self.is_current(epoch).await {
                return;
            }
            let _ = self.status_tx.send(ConnectionStatus::Connecting);

            match self.transport.connect(&server_url, &credential).await {
                Ok(link) => {
                    attempt = 0;
                    if self.pump_link(epoch, link).await {
                        return;
                    }
                    let _ = self.status_tx.send(ConnectionStatus::Disconnected);
                }
                Err(err) => {
                    warn!(error = %err, server_url = %server_url, "realtime connect failed");
                }
            }

            let delay = self.policy.delay_for(attempt);
            attempt = attempt.saturating_add(1);
            tokio::time::sleep(delay).await;
        }
    }

    /// Drive one established link until it drops. Returns true when the
    /// session was superseded and the supervisor should stop.
    async fn pump_link(self: &Arc<Self>, epoch: u64, mut link: SocketLink) -> bool {
        let pending = {
            let mut guard = self.inner.lock().await;
            if guard.epoch != epoch {
                return true;
            }
            guard.session_id = Some(link.ack.session_id.clone());
            guard.user_id = Some(link.ack.user_id);
            guard.outbound = Some(link.outbound.clone());
            std::mem::take(&mut guard.pending_emissions)
        };
        let _ = self.status_tx.send(ConnectionStatus::Connected);
        info!(
            session_id = %link.ack.session_id,
            user_id = link.ack.user_id.0,
            deferred = pending.len(),
            "realtime session established"
        );

        // Declare this session online, ask for a presence snapshot, then
        // release everything deferred while offline, in queue order.
        let _ = link.outbound.send(ClientEmit::UserOnline);
        let _ = link.outbound.send(ClientEmit::PresenceList);
        for emit in pending {
            let _ = link.outbound.send(emit);
        }

        while let Some(event) = link.inbound.recv().await {
            match event {
                LinkEvent::Event(event) => self.handle_server_event(epoch, event).await,
                LinkEvent::Closed { reason } => {
                    warn!(reason = %reason, "realtime link closed");
                    break;
                }
            }
        }

        let mut guard = self.inner.lock().await;
        if guard.epoch != epoch {
            return true;
        }
        guard.session_id = None;
        guard.outbound = None;
        false
    }

    async fn handle_server_event(self: &Arc<Self>, epoch: u64, event: ServerEvent) {
        {
            let mut state = self.state.lock().await;
            match &event {
                ServerEvent::NewMessage(message) => {
                    state.record_incoming_message(message.clone());
                }
                ServerEvent::Typing(typing) => {
                    state.set_typing(typing.conversation_id, true);
                }
                ServerEvent::StopTyping(typing) => {
                    state.set_typing(typing.conversation_id, false);
                }
                ServerEvent::SeenUpdate(seen) => {
                    state.mark_seen(seen.conversation_id, seen.viewer_id);
                }
                ServerEvent::UserOnline(presence) => {
                    state.set_presence(presence.user_id, true, None);
                }
                ServerEvent::UserOffline(presence) => {
                    state.set_presence(presence.user_id, false, presence.last_seen);
                }
                ServerEvent::PresenceList(entries) => {
                    state.set_presence_snapshot(entries.clone());
                }
                ServerEvent::NewConversation(conversation) => {
                    state.upsert_conversation(conversation.clone());
                }
                ServerEvent::Notification(notification) => {
                    state.push_notification(notification.clone());
                }
                ServerEvent::Error(err) => {
                    warn!(code = ?err.code, message = %err.message, "server error event");
                }
            }
        }

        match &event {
            ServerEvent::Typing(typing) => {
                self.schedule_typing_expiry(epoch, typing.conversation_id)
                    .await;
            }
            ServerEvent::StopTyping(typing) => {
                self.bump_typing_generation(typing.conversation_id).await;
            }
            _ => {}
        }

        self.registry.dispatch(&event);
    }

    /// Clear the typing flag after [`TYPING_EXPIRY`] unless a newer typing
    /// event superseded this one.
    async fn schedule_typing_expiry(self: &Arc<Self>, epoch: u64, conversation_id: ConversationId) {
        let generation = self.bump_typing_generation(conversation_id).await;
        let client = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(TYPING_EXPIRY).await;
            {
                let guard = client.inner.lock().await;
                if guard.epoch != epoch
                    || guard.typing_generation.get(&conversation_id) != Some(&generation)
                {
                    return;
                }
            }
            let mut state = client.state.lock().await;
            state.set_typing(conversation_id, false);
        });
    }

    async fn bump_typing_generation(&self, conversation_id: ConversationId) -> u64 {
        let mut guard = self.inner.lock().await;
        let generation = guard.typing_generation.entry(conversation_id).or_insert(0);
        *generation += 1;
        *generation
    }

    async fn is_current(&self, epoch: u64) -> bool {
        self.inner.lock().await.epoch == epoch
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
