use super::*;
use crate::cache::QueryOptions;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, Query,
    },
    response::Response,
    routing::get,
    Router,
};
use serde_json::{json, Value};
use shared::protocol::AuthTokens;
use tokio::net::TcpListener;

struct ServerSide {
    url: Url,
    incoming: mpsc::Sender<LinkEvent>,
    outgoing: mpsc::UnboundedReceiver<String>,
}

impl ServerSide {
    async fn push(&self, frame: Value) {
        self.push_raw(frame.to_string()).await;
    }

    async fn push_raw(&self, raw: String) {
        self.incoming.send(LinkEvent::Text(raw)).await.unwrap();
    }

    async fn close(&self) {
        self.incoming.send(LinkEvent::Closed).await.unwrap();
    }

    async fn next_frame(&mut self) -> Value {
        let raw = self.outgoing.recv().await.expect("client frame");
        serde_json::from_str(&raw).unwrap()
    }
}

struct MemoryConnector {
    accept: Mutex<bool>,
    attempts: Mutex<Vec<Instant>>,
    servers: mpsc::UnboundedSender<ServerSide>,
}

impl MemoryConnector {
    fn new(accept: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSide>) {
        let (servers, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                accept: Mutex::new(accept),
                attempts: Mutex::new(Vec::new()),
                servers,
            }),
            rx,
        )
    }

    fn set_accept(&self, accept: bool) {
        *self.accept.lock() = accept;
    }

    fn attempt_count(&self) -> usize {
        self.attempts.lock().len()
    }

    fn gaps(&self) -> Vec<Duration> {
        self.attempts
            .lock()
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .collect()
    }
}

#[async_trait]
impl ChatConnector for MemoryConnector {
    async fn connect(&self, url: &Url) -> Result<ChatLink> {
        self.attempts.lock().push(Instant::now());
        if !*self.accept.lock() {
            anyhow::bail!("connection refused");
        }
        let (incoming_tx, incoming) = mpsc::channel(64);
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let _ = self.servers.send(ServerSide {
            url: url.clone(),
            incoming: incoming_tx,
            outgoing: outgoing_rx,
        });
        Ok(ChatLink { incoming, outgoing })
    }
}

fn signed_in_tokens() -> TokenStore {
    let tokens = TokenStore::in_memory();
    tokens.set_tokens(&AuthTokens {
        access: "token-abc".into(),
        refresh: "refresh-abc".into(),
    });
    tokens
}

fn context(connector: Arc<MemoryConnector>) -> ChatContext {
    ChatContext::new(
        ChatEndpoint {
            scheme: "wss".into(),
            host: "chat.thogmi.org".into(),
        },
        signed_in_tokens(),
        connector,
    )
}

async fn wait_until(
    session: &ChatSession,
    check: impl FnMut(&ConnectionStatus) -> bool,
) -> ConnectionStatus {
    let mut status = session.watch_status();
    let current = *status.wait_for(check).await.unwrap();
    current
}

fn stored(id: i64, content: &str) -> Value {
    json!({
        "id": id,
        "conversation": 42,
        "sender": 3,
        "sender_name": "Ama Owusu",
        "content": content,
        "is_read": true,
        "created_at": "2024-05-01T09:00:00Z"
    })
}

fn ama() -> Value {
    json!({"id": 3, "name": "Ama Owusu"})
}

#[test]
fn reconnect_delay_doubles_and_caps_at_thirty_seconds() {
    let delays: Vec<u128> = (0..7).map(|n| reconnect_delay(n).as_millis()).collect();
    assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);
    assert_eq!(reconnect_delay(200), Duration::from_millis(30_000));
}

#[test]
fn chat_url_carries_conversation_and_token() {
    let endpoint = ChatEndpoint {
        scheme: "wss".into(),
        host: "chat.thogmi.org".into(),
    };
    let url = endpoint.url(ConversationId(42), Some("abc.def")).unwrap();
    assert_eq!(url.as_str(), "wss://chat.thogmi.org/ws/chat/42/?token=abc.def");
    let anonymous = endpoint.url(ConversationId(42), None).unwrap();
    assert_eq!(anonymous.query(), Some("token="));
}

#[tokio::test(start_paused = true)]
async fn refused_connections_back_off_exponentially_then_give_up() {
    let (connector, _servers) = MemoryConnector::new(false);
    let session = ChatSession::open(ConversationId(42), context(Arc::clone(&connector)));
    let mut events = session.subscribe();

    let status = wait_until(&session, |status| status.gave_up).await;

    assert_eq!(status.state, ConnectionState::Disconnected);
    assert_eq!(status.reconnect_attempts, MAX_RECONNECT_ATTEMPTS);
    assert_eq!(connector.attempt_count(), 6);
    assert_eq!(
        connector.gaps(),
        [1, 2, 4, 8, 16].map(Duration::from_secs).to_vec()
    );

    let mut saw_give_up = false;
    while let Ok(event) = events.try_recv() {
        saw_give_up |= event == ChatEvent::ReconnectFailed;
    }
    assert!(saw_give_up);
    assert!(!session.send_message("anyone there?"));
}

#[tokio::test(start_paused = true)]
async fn successful_connect_resets_attempts() {
    let (connector, mut servers) = MemoryConnector::new(false);
    let session = ChatSession::open(ConversationId(42), context(Arc::clone(&connector)));

    wait_until(&session, |status| status.reconnect_attempts == 1).await;
    connector.set_accept(true);
    let status = wait_until(&session, ConnectionStatus::is_connected).await;
    assert_eq!(status.reconnect_attempts, 0);

    let server = servers.recv().await.unwrap();
    server.close().await;
    wait_until(&session, |status| {
        status.state == ConnectionState::Disconnected && status.reconnect_attempts == 1
    })
    .await;
    wait_until(&session, ConnectionStatus::is_connected).await;

    assert_eq!(
        connector.gaps(),
        vec![Duration::from_secs(1), Duration::from_secs(1)]
    );
}

#[tokio::test]
async fn inbound_frames_update_messages_typing_and_receipts_in_order() {
    let (connector, mut servers) = MemoryConnector::new(true);
    let (events_tx, _) = broadcast::channel(16);
    let cache = QueryCache::new(events_tx);
    let thread_key = keys::conversation_messages(ConversationId(42));
    let _: Vec<String> = cache
        .fetch(&thread_key, QueryOptions::MESSAGES, || async { Ok(vec![]) })
        .await
        .unwrap();

    let session = ChatSession::open(
        ConversationId(42),
        context(connector).with_cache(cache.clone()),
    );
    let mut events = session.subscribe();
    let server = servers.recv().await.unwrap();
    assert_eq!(server.url.path(), "/ws/chat/42/");
    assert_eq!(server.url.query(), Some("token=token-abc"));

    server
        .push(json!({
            "type": "conversation_history",
            "messages": [stored(1, "welcome"), stored(2, "service at 9")]
        }))
        .await;
    server.push_raw("not json".into()).await;
    server.push(json!({"type": "presence", "online": 4})).await;
    server
        .push(json!({
            "type": "chat_message",
            "message": {
                "id": 3,
                "content": "see you there",
                "sender": ama(),
                "timestamp": "2024-05-01T10:00:00Z"
            }
        }))
        .await;
    server
        .push(json!({"type": "typing_indicator", "user": ama(), "is_typing": true}))
        .await;
    server
        .push(json!({"type": "read_receipt", "message_id": 3, "user": ama()}))
        .await;

    loop {
        if let ChatEvent::ReadReceipt { .. } = events.recv().await.unwrap() {
            break;
        }
    }

    let ids: Vec<i64> = session.messages().iter().map(|m| m.id.0).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    let live = &session.messages()[2];
    assert_eq!(live.conversation, ConversationId(42));
    assert_eq!(live.sender_name, "Ama Owusu");
    assert_eq!(session.typing_users().len(), 1);
    assert_eq!(session.read_by(MessageId(3))[0].name, "Ama Owusu");
    assert!(session.read_by(MessageId(1)).is_empty());
    assert!(!cache.contains(&thread_key));
}

#[tokio::test(start_paused = true)]
async fn local_typing_clears_itself_after_three_seconds() {
    let (connector, mut servers) = MemoryConnector::new(true);
    let session = ChatSession::open(ConversationId(42), context(connector));
    let mut server = servers.recv().await.unwrap();
    wait_until(&session, ConnectionStatus::is_connected).await;

    assert!(session.send_typing_indicator(true));
    assert_eq!(server.next_frame().await, json!({"type": "typing", "is_typing": true}));
    assert!(session.is_typing());

    tokio::time::advance(Duration::from_millis(2_999)).await;
    assert!(session.is_typing());

    tokio::time::advance(Duration::from_millis(1)).await;
    assert_eq!(server.next_frame().await, json!({"type": "typing", "is_typing": false}));
    assert!(!session.is_typing());
}

#[tokio::test(start_paused = true)]
async fn renewed_typing_postpones_the_clear() {
    let (connector, mut servers) = MemoryConnector::new(true);
    let session = ChatSession::open(ConversationId(42), context(connector));
    let mut server = servers.recv().await.unwrap();
    wait_until(&session, ConnectionStatus::is_connected).await;

    session.send_typing_indicator(true);
    tokio::time::advance(Duration::from_secs(2)).await;
    session.send_typing_indicator(true);
    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(session.is_typing());

    let started = Instant::now();
    assert_eq!(server.next_frame().await["is_typing"], true);
    assert_eq!(server.next_frame().await["is_typing"], true);
    assert_eq!(server.next_frame().await["is_typing"], false);
    assert_eq!(started.elapsed(), Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn sends_are_dropped_while_not_connected() {
    let (connector, mut servers) = MemoryConnector::new(true);
    let session = ChatSession::open(ConversationId(42), context(connector));

    assert_eq!(session.status().state, ConnectionState::Connecting);
    assert!(!session.send_message("too early"));
    assert!(!session.send_read_receipt(MessageId(1)));

    let mut server = servers.recv().await.unwrap();
    wait_until(&session, ConnectionStatus::is_connected).await;
    assert!(!session.send_message("   "));
    assert!(session.send_message("  hello  "));
    assert_eq!(
        server.next_frame().await,
        json!({"type": "chat_message", "message": "hello"})
    );
    assert!(session.send_read_receipt(MessageId(9)));
    assert_eq!(
        server.next_frame().await,
        json!({"type": "read_receipt", "message_id": 9})
    );

    server.close().await;
    wait_until(&session, |status| status.state == ConnectionState::Disconnected).await;
    assert!(!session.send_message("lost"));
}

#[tokio::test(start_paused = true)]
async fn close_cancels_pending_reconnects() {
    let (connector, _servers) = MemoryConnector::new(false);
    let session = ChatSession::open(ConversationId(42), context(Arc::clone(&connector)));
    wait_until(&session, |status| status.reconnect_attempts == 1).await;

    session.close();
    assert_eq!(session.status().state, ConnectionState::Closed);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.attempt_count(), 1);
    assert_eq!(session.status().state, ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn remote_typing_lapses_after_three_seconds_without_frames() {
    let (connector, mut servers) = MemoryConnector::new(true);
    let session = ChatSession::open(ConversationId(42), context(connector));
    let server = servers.recv().await.unwrap();
    wait_until(&session, ConnectionStatus::is_connected).await;
    let mut events = session.subscribe();

    server
        .push(json!({"type": "typing_indicator", "user": ama(), "is_typing": true}))
        .await;
    loop {
        if let ChatEvent::Typing { .. } = events.recv().await.unwrap() {
            break;
        }
    }
    assert_eq!(session.typing_users().len(), 1);

    tokio::time::advance(Duration::from_millis(2_999)).await;
    assert_eq!(session.typing_users().len(), 1);

    tokio::time::advance(Duration::from_millis(1)).await;
    assert!(session.typing_users().is_empty());
}

/// Finishes its handshake inside a single poll, like a blocking TLS setup.
#[derive(Default)]
struct SlowHandshake {
    started: std::sync::atomic::AtomicBool,
    links: Mutex<Vec<(mpsc::Sender<LinkEvent>, mpsc::UnboundedReceiver<String>)>>,
}

#[async_trait]
impl ChatConnector for SlowHandshake {
    async fn connect(&self, _url: &Url) -> Result<ChatLink> {
        self.started.store(true, std::sync::atomic::Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(300));
        let (incoming_tx, incoming) = mpsc::channel(8);
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        self.links.lock().push((incoming_tx, outgoing_rx));
        Ok(ChatLink { incoming, outgoing })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_during_handshake_keeps_session_closed() {
    let connector = Arc::new(SlowHandshake::default());
    let session = ChatSession::open(
        ConversationId(42),
        ChatContext::new(
            ChatEndpoint {
                scheme: "wss".into(),
                host: "chat.thogmi.org".into(),
            },
            signed_in_tokens(),
            connector.clone(),
        ),
    );
    while !connector.started.load(std::sync::atomic::Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    session.close();
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(session.status().state, ConnectionState::Closed);
    assert!(!session.send_message("after close"));
    let mut links = connector.links.lock();
    assert_eq!(links.len(), 1);
    assert!(matches!(
        links[0].1.try_recv(),
        Err(mpsc::error::TryRecvError::Disconnected)
    ));
}

#[tokio::test]
async fn status_changes_are_forwarded_as_client_events() {
    let (connector, _servers) = MemoryConnector::new(true);
    let (events, mut client_events) = broadcast::channel(16);
    let session = ChatSession::open(ConversationId(42), context(connector).with_events(events));
    wait_until(&session, ConnectionStatus::is_connected).await;

    let mut states = Vec::new();
    while let Ok(event) = client_events.try_recv() {
        if let ClientEvent::ChatStatus {
            conversation_id,
            status,
        } = event
        {
            assert_eq!(conversation_id, ConversationId(42));
            states.push(status.state);
        }
    }
    assert_eq!(
        states,
        vec![ConnectionState::Connecting, ConnectionState::Connected]
    );
}

async fn chat_socket(
    ws: WebSocketUpgrade,
    Path(conversation_id): Path<i64>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let token = params.get("token").cloned().unwrap_or_default();
    ws.on_upgrade(move |socket| serve_chat(socket, conversation_id, token))
}

async fn serve_chat(mut socket: WebSocket, conversation_id: i64, token: String) {
    let history = json!({
        "type": "conversation_history",
        "messages": [stored(1, &format!("welcome to {conversation_id}"))]
    });
    if socket
        .send(WsMessage::Text(history.to_string()))
        .await
        .is_err()
    {
        return;
    }
    while let Some(Ok(WsMessage::Text(text))) = socket.recv().await {
        let frame: Value = serde_json::from_str(&text).unwrap_or_default();
        if frame["type"] == "chat_message" {
            let echo = json!({
                "type": "chat_message",
                "message": {
                    "id": 2,
                    "content": frame["message"],
                    "sender": {"id": 7, "name": token},
                    "timestamp": "2024-05-01T10:00:00Z"
                }
            });
            if socket.send(WsMessage::Text(echo.to_string())).await.is_err() {
                return;
            }
        }
    }
}

#[tokio::test]
async fn tungstenite_connector_talks_to_a_real_chat_socket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().route("/ws/chat/:conversation_id/", get(chat_socket));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let settings = Settings {
        api_base_url: format!("http://{addr}/api/v1"),
        ws_host: addr.to_string(),
        ..Settings::default()
    };
    let session = ChatSession::open(
        ConversationId(42),
        ChatContext::new(
            ChatEndpoint::from_settings(&settings),
            signed_in_tokens(),
            Arc::new(TungsteniteConnector),
        ),
    );
    let mut events = session.subscribe();
    wait_until(&session, ConnectionStatus::is_connected).await;

    loop {
        if let ChatEvent::History(history) = events.recv().await.unwrap() {
            assert_eq!(history[0].content, "welcome to 42");
            break;
        }
    }

    assert!(session.send_message("hello from rust"));
    let echoed = loop {
        if let ChatEvent::Message(message) = events.recv().await.unwrap() {
            break message;
        }
    };
    assert_eq!(echoed.content, "hello from rust");
    assert_eq!(echoed.sender_name, "token-abc");
    assert_eq!(session.messages().len(), 2);

    session.close();
    assert_eq!(session.status().state, ConnectionState::Closed);
}
