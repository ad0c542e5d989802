//! Per-conversation chat socket with bounded exponential reconnect.
//!
//! A [`ChatSession`] owns one background task that drives the connection:
//! `Disconnected -> Connecting -> Connected -> (Disconnected | Closed)`.
//! Sends are fire-and-forget and are dropped while not connected.

use std::{
    collections::HashMap,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::{ClientFrame, ConversationMessage, FrameUser, ServerFrame},
};
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    api::keys,
    cache::QueryCache,
    config::Settings,
    session::TokenStore,
    ClientEvent, Toast,
};

pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const TYPING_TIMEOUT: Duration = Duration::from_secs(3);
const BASE_RECONNECT_DELAY_MS: u64 = 1_000;
const MAX_RECONNECT_DELAY_MS: u64 = 30_000;
const LINK_BUFFER: usize = 256;
const CHAT_EVENT_BUFFER: usize = 256;

/// `min(1000 * 2^attempt, 30000)` milliseconds.
pub fn reconnect_delay(attempt: u32) -> Duration {
    let ms = 2u64
        .checked_pow(attempt)
        .and_then(|factor| factor.checked_mul(BASE_RECONNECT_DELAY_MS))
        .map_or(MAX_RECONNECT_DELAY_MS, |ms| ms.min(MAX_RECONNECT_DELAY_MS));
    Duration::from_millis(ms)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    /// Reconnects are exhausted; sending stays disabled until reopened.
    pub gave_up: bool,
}

impl ConnectionStatus {
    fn new(state: ConnectionState, reconnect_attempts: u32) -> Self {
        Self {
            state,
            reconnect_attempts,
            gave_up: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    Message(ConversationMessage),
    History(Vec<ConversationMessage>),
    Typing { user: FrameUser, is_typing: bool },
    ReadReceipt { message_id: MessageId, user: FrameUser },
    StatusChanged(ConnectionStatus),
    ConnectionError(String),
    ReconnectFailed,
}

#[derive(Debug)]
pub enum LinkEvent {
    Text(String),
    Error(String),
    Closed,
}

/// An open socket, seen as two queues. Dropping `outgoing` closes it.
pub struct ChatLink {
    pub incoming: mpsc::Receiver<LinkEvent>,
    pub outgoing: mpsc::UnboundedSender<String>,
}

#[async_trait]
pub trait ChatConnector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<ChatLink>;
}

/// WebSocket connector over `tokio-tungstenite`.
pub struct TungsteniteConnector;

#[async_trait]
impl ChatConnector for TungsteniteConnector {
    async fn connect(&self, url: &Url) -> Result<ChatLink> {
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect chat socket: {}", url.path()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (incoming_tx, incoming) = mpsc::channel(LINK_BUFFER);
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(text) = outgoing_rx.recv().await {
                if let Err(err) = ws_writer.send(Message::Text(text)).await {
                    warn!("chat socket write failed: {err}");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                let event = match frame {
                    Ok(Message::Text(text)) => LinkEvent::Text(text),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => LinkEvent::Error(err.to_string()),
                };
                let failed = matches!(event, LinkEvent::Error(_));
                if incoming_tx.send(event).await.is_err() {
                    return;
                }
                if failed {
                    break;
                }
            }
            let _ = incoming_tx.send(LinkEvent::Closed).await;
        });

        Ok(ChatLink { incoming, outgoing })
    }
}

/// Where chat sockets live: `<scheme>://<host>/ws/chat/<id>/?token=<access>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEndpoint {
    pub scheme: String,
    pub host: String,
}

impl ChatEndpoint {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            scheme: settings.ws_scheme().to_string(),
            host: settings.ws_host.clone(),
        }
    }

    pub fn url(&self, conversation_id: ConversationId, token: Option<&str>) -> Result<Url, url::ParseError> {
        let mut url = Url::parse(&format!(
            "{}://{}/ws/chat/{}/",
            self.scheme, self.host, conversation_id
        ))?;
        url.query_pairs_mut()
            .append_pair("token", token.unwrap_or_default());
        Ok(url)
    }
}

/// Everything a session needs besides the conversation id.
#[derive(Clone)]
pub struct ChatContext {
    pub endpoint: ChatEndpoint,
    pub tokens: TokenStore,
    pub connector: Arc<dyn ChatConnector>,
    pub cache: Option<QueryCache>,
    pub events: Option<broadcast::Sender<ClientEvent>>,
}

impl ChatContext {
    pub fn new(endpoint: ChatEndpoint, tokens: TokenStore, connector: Arc<dyn ChatConnector>) -> Self {
        Self {
            endpoint,
            tokens,
            connector,
            cache: None,
            events: None,
        }
    }

    pub fn with_cache(mut self, cache: QueryCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_events(mut self, events: broadcast::Sender<ClientEvent>) -> Self {
        self.events = Some(events);
        self
    }
}

#[derive(Default)]
struct ChatState {
    messages: Vec<ConversationMessage>,
    typing: HashMap<UserId, (FrameUser, Instant)>,
    read_by: HashMap<MessageId, Vec<FrameUser>>,
    outgoing: Option<mpsc::UnboundedSender<String>>,
    local_typing: bool,
    typing_generation: u64,
    closed: bool,
}

struct ChatShared {
    conversation_id: ConversationId,
    context: ChatContext,
    state: Mutex<ChatState>,
    status: watch::Sender<ConnectionStatus>,
    chat_events: broadcast::Sender<ChatEvent>,
}

pub struct ChatSession {
    shared: Arc<ChatShared>,
    driver: Mutex<Option<JoinHandle<()>>>,
    typing_timer: Mutex<Option<JoinHandle<()>>>,
}

impl ChatSession {
    /// Starts connecting in the background and returns immediately.
    pub fn open(conversation_id: ConversationId, context: ChatContext) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::new(ConnectionState::Disconnected, 0));
        let (chat_events, _) = broadcast::channel(CHAT_EVENT_BUFFER);
        let shared = Arc::new(ChatShared {
            conversation_id,
            context,
            state: Mutex::new(ChatState::default()),
            status,
            chat_events,
        });
        shared.set_status(ConnectionStatus::new(ConnectionState::Connecting, 0));
        let driver = tokio::spawn(run_connection(Arc::clone(&shared)));
        Self {
            shared,
            driver: Mutex::new(Some(driver)),
            typing_timer: Mutex::new(None),
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.shared.conversation_id
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.shared.chat_events.subscribe()
    }

    pub fn messages(&self) -> Vec<ConversationMessage> {
        self.shared.state.lock().messages.clone()
    }

    /// Remote participants currently typing; entries lapse after
    /// [`TYPING_TIMEOUT`] without a refresh.
    pub fn typing_users(&self) -> Vec<FrameUser> {
        let now = Instant::now();
        let mut state = self.shared.state.lock();
        state
            .typing
            .retain(|_, (_, since)| now.duration_since(*since) < TYPING_TIMEOUT);
        let mut users: Vec<FrameUser> = state.typing.values().map(|(user, _)| user.clone()).collect();
        users.sort_by_key(|user| user.id.0);
        users
    }

    pub fn read_by(&self, message_id: MessageId) -> Vec<FrameUser> {
        self.shared
            .state
            .lock()
            .read_by
            .get(&message_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Local typing flag as last announced to the room.
    pub fn is_typing(&self) -> bool {
        self.shared.state.lock().local_typing
    }

    /// Returns `false` when the frame was dropped.
    pub fn send_message(&self, content: &str) -> bool {
        let content = content.trim();
        if content.is_empty() {
            return false;
        }
        self.shared.send_frame(&ClientFrame::ChatMessage {
            message: content.to_string(),
        })
    }

    /// Announces typing. `true` clears itself after [`TYPING_TIMEOUT`]
    /// unless superseded by a later call.
    pub fn send_typing_indicator(&self, is_typing: bool) -> bool {
        let sent = self.shared.send_frame(&ClientFrame::Typing { is_typing });
        let generation = {
            let mut state = self.shared.state.lock();
            state.typing_generation += 1;
            state.local_typing = is_typing;
            state.typing_generation
        };

        let mut timer = self.typing_timer.lock();
        if let Some(previous) = timer.take() {
            previous.abort();
        }
        if is_typing {
            let deadline = Instant::now() + TYPING_TIMEOUT;
            let shared = Arc::clone(&self.shared);
            *timer = Some(tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                shared.expire_local_typing(generation);
            }));
        }
        sent
    }

    pub fn send_read_receipt(&self, message_id: MessageId) -> bool {
        self.shared
            .send_frame(&ClientFrame::ReadReceipt { message_id })
    }

    /// Closes the socket and cancels any pending reconnect. Idempotent;
    /// a closed session never reconnects.
    pub fn close(&self) {
        {
            let mut state = self.shared.state.lock();
            state.closed = true;
            state.outgoing = None;
        }
        if let Some(driver) = self.driver.lock().take() {
            driver.abort();
            info!(conversation_id = %self.shared.conversation_id, "chat session closed");
        }
        if let Some(timer) = self.typing_timer.lock().take() {
            timer.abort();
        }
        self.shared
            .set_status(ConnectionStatus::new(ConnectionState::Closed, 0));
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_connection(shared: Arc<ChatShared>) {
    let mut attempts = 0u32;
    loop {
        shared.set_status(ConnectionStatus::new(ConnectionState::Connecting, attempts));
        match shared.connect().await {
            Ok(link) => {
                attempts = 0;
                {
                    let mut state = shared.state.lock();
                    if state.closed {
                        return;
                    }
                    state.outgoing = Some(link.outgoing);
                }
                shared.set_status(ConnectionStatus::new(ConnectionState::Connected, 0));
                info!(conversation_id = %shared.conversation_id, "chat connected");

                let mut incoming = link.incoming;
                while let Some(event) = incoming.recv().await {
                    match event {
                        LinkEvent::Text(text) => shared.dispatch(&text),
                        LinkEvent::Error(err) => shared.report_error(&err),
                        LinkEvent::Closed => break,
                    }
                }
                shared.state.lock().outgoing = None;
                info!(conversation_id = %shared.conversation_id, "chat disconnected");
            }
            Err(err) => shared.report_error(&format!("{err:#}")),
        }
        if shared.state.lock().closed {
            return;
        }

        if attempts >= MAX_RECONNECT_ATTEMPTS {
            shared.give_up(attempts);
            return;
        }
        let delay = reconnect_delay(attempts);
        attempts += 1;
        shared.set_status(ConnectionStatus::new(ConnectionState::Disconnected, attempts));
        info!(
            conversation_id = %shared.conversation_id,
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            "scheduling chat reconnect"
        );
        tokio::time::sleep(delay).await;
    }
}

impl ChatShared {
    async fn connect(&self) -> Result<ChatLink> {
        let token = self.context.tokens.access_token();
        let url = self
            .context
            .endpoint
            .url(self.conversation_id, token.as_deref())
            .context("invalid chat url")?;
        self.context.connector.connect(&url).await
    }

    /// `Closed` is terminal: later transitions are ignored.
    fn set_status(&self, status: ConnectionStatus) {
        let changed = self.status.send_if_modified(|current| {
            if current.state == ConnectionState::Closed || *current == status {
                return false;
            }
            *current = status;
            true
        });
        if !changed {
            return;
        }
        let _ = self.chat_events.send(ChatEvent::StatusChanged(status));
        if let Some(events) = &self.context.events {
            let _ = events.send(ClientEvent::ChatStatus {
                conversation_id: self.conversation_id,
                status,
            });
        }
    }

    fn report_error(&self, err: &str) {
        warn!(conversation_id = %self.conversation_id, "chat connection error: {err}");
        let _ = self
            .chat_events
            .send(ChatEvent::ConnectionError(err.to_string()));
        self.toast(Toast::destructive(
            "Connection error",
            "Lost connection to the chat. Reconnecting...",
        ));
    }

    fn give_up(&self, attempts: u32) {
        warn!(
            conversation_id = %self.conversation_id,
            attempts,
            "chat reconnect attempts exhausted"
        );
        self.set_status(ConnectionStatus {
            state: ConnectionState::Disconnected,
            reconnect_attempts: attempts,
            gave_up: true,
        });
        let _ = self.chat_events.send(ChatEvent::ReconnectFailed);
        self.toast(Toast::destructive(
            "Reconnecting failed",
            "Could not reach the chat server. Reopen the conversation to try again.",
        ));
    }

    fn toast(&self, toast: Toast) {
        if let Some(events) = &self.context.events {
            let _ = events.send(ClientEvent::Toast(toast));
        }
    }

    fn dispatch(&self, raw: &str) {
        let frame = match serde_json::from_str::<ServerFrame>(raw) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(conversation_id = %self.conversation_id, "ignoring malformed chat frame: {err}");
                return;
            }
        };

        match frame {
            ServerFrame::ChatMessage { message } => {
                let message = message.into_message(self.conversation_id);
                self.state.lock().messages.push(message.clone());
                let _ = self.chat_events.send(ChatEvent::Message(message));
                self.invalidate_queries();
            }
            ServerFrame::ConversationHistory { messages } => {
                let messages: Vec<ConversationMessage> = messages
                    .into_iter()
                    .map(|message| message.into_message(self.conversation_id))
                    .collect();
                debug!(
                    conversation_id = %self.conversation_id,
                    count = messages.len(),
                    "received conversation history"
                );
                self.state.lock().messages.extend(messages.iter().cloned());
                let _ = self.chat_events.send(ChatEvent::History(messages));
            }
            ServerFrame::TypingIndicator { user, is_typing } => {
                if self.is_own_user(user.id) {
                    return;
                }
                {
                    let mut state = self.state.lock();
                    if is_typing {
                        state.typing.insert(user.id, (user.clone(), Instant::now()));
                    } else {
                        state.typing.remove(&user.id);
                    }
                }
                let _ = self.chat_events.send(ChatEvent::Typing { user, is_typing });
            }
            ServerFrame::ReadReceipt { message_id, user } => {
                {
                    let mut state = self.state.lock();
                    let readers = state.read_by.entry(message_id).or_default();
                    if !readers.iter().any(|reader| reader.id == user.id) {
                        readers.push(user.clone());
                    }
                }
                let _ = self
                    .chat_events
                    .send(ChatEvent::ReadReceipt { message_id, user });
            }
            ServerFrame::Unknown => {
                debug!(conversation_id = %self.conversation_id, "ignoring chat frame of unknown type");
            }
        }
    }

    fn is_own_user(&self, user_id: UserId) -> bool {
        self.context
            .tokens
            .get_user()
            .and_then(|user| user.id.parse::<i64>().ok())
            .is_some_and(|own| own == user_id.0)
    }

    fn invalidate_queries(&self) {
        if let Some(cache) = &self.context.cache {
            cache.invalidate(&keys::conversation_messages(self.conversation_id));
            cache.invalidate(&keys::conversations());
        }
    }

    fn send_frame(&self, frame: &ClientFrame) -> bool {
        let state = self.state.lock();
        let Some(outgoing) = state.outgoing.as_ref() else {
            debug!(conversation_id = %self.conversation_id, "dropping chat frame while disconnected");
            return false;
        };
        match serde_json::to_string(frame) {
            Ok(text) => outgoing.send(text).is_ok(),
            Err(err) => {
                warn!("failed to encode chat frame: {err}");
                false
            }
        }
    }

    fn expire_local_typing(&self, generation: u64) {
        {
            let mut state = self.state.lock();
            if state.typing_generation != generation || !state.local_typing {
                return;
            }
            state.local_typing = false;
        }
        self.send_frame(&ClientFrame::Typing { is_typing: false });
    }
}

#[cfg(test)]
#[path = "tests/realtime_tests.rs"]
mod tests;
