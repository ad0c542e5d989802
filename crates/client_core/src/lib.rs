use std::sync::Arc;

use shared::{
    domain::ConversationId,
    protocol::{LoginCredentials, User},
};
use tokio::sync::broadcast;
use tracing::info;

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod http;
pub mod notifications;
pub mod realtime;
pub mod session;

use api::{CommunicationsApi, PublicApi};
use auth::AuthService;
use cache::QueryCache;
use config::Settings;
use error::Result;
use http::ApiClient;
use notifications::Notifications;
use realtime::{
    ChatConnector, ChatContext, ChatEndpoint, ChatSession, ConnectionStatus, TungsteniteConnector,
};
use session::{FileStore, TokenStore};

const EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToastVariant {
    Default,
    Destructive,
}

/// Transient notification for the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toast {
    pub title: String,
    pub description: String,
    pub variant: ToastVariant,
}

impl Toast {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            variant: ToastVariant::Default,
        }
    }

    pub fn destructive(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            variant: ToastVariant::Destructive,
            ..Self::new(title, description)
        }
    }
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    Toast(Toast),
    /// The session is gone; the UI should navigate to `route`.
    LoginRequired {
        route: String,
    },
    SessionStarted {
        user: User,
    },
    SessionEnded,
    ChatStatus {
        conversation_id: ConversationId,
        status: ConnectionStatus,
    },
}

/// Application-wide client context: one token store, one HTTP client, one
/// cache and one event channel shared by everything built from it.
pub struct PortalClient {
    settings: Settings,
    tokens: TokenStore,
    api: ApiClient,
    cache: QueryCache,
    events: broadcast::Sender<ClientEvent>,
    auth: AuthService,
    communications: CommunicationsApi,
    public: PublicApi,
    notifications: Notifications,
    connector: Arc<dyn ChatConnector>,
}

impl PortalClient {
    /// Persists the session to `settings.session_file`, or keeps it in
    /// memory when none is configured.
    pub fn from_settings(settings: Settings) -> Result<Self> {
        let tokens = match &settings.session_file {
            Some(path) => TokenStore::new(Arc::new(FileStore::new(path.clone()))),
            None => TokenStore::in_memory(),
        };
        Self::new(settings, tokens)
    }

    pub fn new(settings: Settings, tokens: TokenStore) -> Result<Self> {
        Self::new_with_connector(settings, tokens, Arc::new(TungsteniteConnector))
    }

    pub fn new_with_connector(
        settings: Settings,
        tokens: TokenStore,
        connector: Arc<dyn ChatConnector>,
    ) -> Result<Self> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let cache = QueryCache::new(events.clone());
        let api = ApiClient::with_cache(&settings, tokens.clone(), cache.clone())?;
        let communications = CommunicationsApi::new(
            api.rebased(settings.communications_base()?),
            cache.clone(),
        );
        let public = PublicApi::new(api.clone(), cache.clone());
        let auth = AuthService::new(api.clone());
        let notifications = Notifications::new(communications.clone());
        info!(api = %settings.api_base_url, ws_host = %settings.ws_host, "portal client ready");

        Ok(Self {
            settings,
            tokens,
            api,
            cache,
            events,
            auth,
            communications,
            public,
            notifications,
            connector,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn auth(&self) -> &AuthService {
        &self.auth
    }

    pub fn communications(&self) -> &CommunicationsApi {
        &self.communications
    }

    pub fn public(&self) -> &PublicApi {
        &self.public
    }

    pub fn notifications(&self) -> &Notifications {
        &self.notifications
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Opens the chat socket for one conversation. Closing or dropping the
    /// returned session tears the socket down.
    pub fn open_conversation(&self, conversation_id: ConversationId) -> ChatSession {
        let context = ChatContext::new(
            ChatEndpoint::from_settings(&self.settings),
            self.tokens.clone(),
            Arc::clone(&self.connector),
        )
        .with_cache(self.cache.clone())
        .with_events(self.events.clone());
        ChatSession::open(conversation_id, context)
    }

    pub async fn login(&self, credentials: &LoginCredentials) -> Result<User> {
        let user = self.auth.login(credentials).await?;
        let _ = self.events.send(ClientEvent::SessionStarted { user: user.clone() });
        Ok(user)
    }

    /// Ends the session and forgets every cached query.
    pub async fn logout(&self) {
        self.auth.logout().await;
        self.cache.clear();
        let _ = self.events.send(ClientEvent::SessionEnded);
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
