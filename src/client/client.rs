use crate::application_impl::*;
use crate::application_port::*;
use crate::domain_model::*;
use crate::domain_port::*;
use crate::infra_http::*;
use crate::infra_store::*;
use crate::logger::*;
use crate::realtime::*;
use crate::settings::Settings;
use reqwest::Method;
use std::sync::Arc;
use tokio::sync::watch;

/// Everything a host application talks to: authorized HTTP, chat over the
/// realtime connection, and the session lifecycle.
pub struct Client {
    session_store: Arc<dyn SessionStore>,
    authorizer: Arc<dyn RequestAuthorizer>,
    chat_channel: Arc<dyn ChatChannel>,
    connection: Arc<ConnectionManager>,
    expiry_signal: Arc<SessionExpiredSignal>,
}

impl Client {
    /// Must be called inside a tokio runtime.
    pub fn try_new(settings: &Settings) -> anyhow::Result<Self> {
        let persistence: Arc<dyn SessionPersistence> = match settings.session.backend.as_str() {
            "file" => Arc::new(FileSessionPersistence::new(&settings.session.path)),
            "memory" => Arc::new(MemorySessionPersistence::new()),
            other => return Err(anyhow::anyhow!("Unknown session backend: {}", other)),
        };

        let transport: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::try_new(
            &settings.api.base_url,
            settings.api.request_timeout(),
        )?);

        let realtime = RealtimeConfig {
            url: realtime_url(&settings.api.base_url, &settings.realtime.path)?,
            heartbeat: settings.realtime.heartbeat(),
            reconnect_delay: settings.realtime.reconnect_delay(),
            connect_timeout: settings.realtime.connect_timeout(),
        };

        Ok(Self::from_parts(
            transport,
            persistence,
            Arc::new(WsConnector),
            realtime,
        ))
    }

    pub fn from_parts(
        transport: Arc<dyn HttpTransport>,
        persistence: Arc<dyn SessionPersistence>,
        connector: Arc<dyn RealtimeConnector>,
        realtime: RealtimeConfig,
    ) -> Self {
        let session_store: Arc<dyn SessionStore> =
            Arc::new(PersistentSessionStore::load(persistence));

        let token_exchange: Arc<dyn TokenExchange> =
            Arc::new(HttpTokenExchange::new(transport.clone()));
        let refresher: Arc<dyn TokenRefresher> = Arc::new(RefreshCoordinator::new(
            session_store.clone(),
            token_exchange,
        ));
        let expiry_signal = Arc::new(SessionExpiredSignal::new());
        let authorizer: Arc<dyn RequestAuthorizer> = Arc::new(RealRequestAuthorizer::new(
            transport,
            session_store.clone(),
            refresher,
            expiry_signal.clone(),
        ));

        let realtime_url = realtime.url.clone();
        let connection = Arc::new(ConnectionManager::new(
            realtime,
            connector,
            session_store.clone(),
        ));
        let chat_channel: Arc<dyn ChatChannel> = Arc::new(StompChatChannel::new(
            connection.clone(),
            session_store.clone(),
        ));

        // login and every token rotation go through set_session
        let weak_connection = Arc::downgrade(&connection);
        session_store.on_login(Arc::new(move |_session| {
            if let Some(connection) = weak_connection.upgrade() {
                connection.ensure_connected();
            }
        }));

        info!(%realtime_url, authenticated = session_store.get_session().is_authenticated(), "client ready");

        Self {
            session_store,
            authorizer,
            chat_channel,
            connection,
            expiry_signal,
        }
    }

    pub async fn authorized_request(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<ApiResponse, RequestError> {
        self.authorizer
            .execute(ApiRequest::new(method, path, body))
            .await
    }

    pub fn subscribe_to_conversation<F>(
        &self,
        conversation: &ConversationId,
        on_message: F,
    ) -> Subscription
    where
        F: Fn(serde_json::Value) + Send + Sync + 'static,
    {
        self.chat_channel
            .subscribe_to_conversation(conversation, Arc::new(on_message))
    }

    pub async fn publish_to_conversation(
        &self,
        conversation: &ConversationId,
        content: &str,
    ) -> Result<(), RealtimeError> {
        self.chat_channel
            .publish_to_conversation(conversation, content)
            .await
    }

    pub fn on_session_expired<F>(&self, callback: F)
    where
        F: Fn(&SessionExpired) + Send + Sync + 'static,
    {
        self.expiry_signal.subscribe(Arc::new(callback));
    }

    /// Stores the pair; the realtime connection follows through the login hook.
    pub fn login(&self, pair: TokenPair, role: Role) -> Result<(), SessionError> {
        self.session_store.set_session(pair, role)?;
        info!(%role, "logged in");
        Ok(())
    }

    pub fn logout(&self) -> Result<(), SessionError> {
        self.connection.teardown();
        self.session_store.clear_session()?;
        info!("logged out");
        Ok(())
    }

    pub fn session(&self) -> Session {
        self.session_store.get_session()
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.state()
    }

    pub async fn shutdown(&self) {
        info!("client shutting down...");
        self.connection.shutdown().await;
    }
}
