use crate::application_port::SessionStore;
use crate::domain_model::AccessToken;
use crate::realtime::*;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Inbound silence tolerated before a link is declared dead, in multiples of
/// the negotiated heartbeat.
const HEARTBEAT_GRACE: u32 = 2;

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub url: String,
    pub heartbeat: Duration,
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
}

impl RealtimeConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            heartbeat: Duration::from_secs(4),
            reconnect_delay: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
        }
    }

    fn host(&self) -> String {
        reqwest::Url::parse(&self.url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_owned))
            .unwrap_or_else(|| "localhost".to_owned())
    }
}

#[derive(Debug, Clone, Copy, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct SubscriptionId(pub u64);

impl SubscriptionId {
    pub fn parse(header: &str) -> Option<Self> {
        header.strip_prefix("sub-")?.parse().ok().map(SubscriptionId)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub destination: String,
    pub message_id: Option<String>,
    pub body: String,
}

/// Runs on the manager task; must not block.
pub type MessageHandler = Arc<dyn Fn(InboundMessage) + Send + Sync>;

enum Command {
    EnsureConnected,
    Subscribe {
        id: SubscriptionId,
        topic: String,
        handler: MessageHandler,
    },
    Unsubscribe {
        id: SubscriptionId,
    },
    Publish {
        frame: StompFrame,
        reply: oneshot::Sender<Result<(), RealtimeError>>,
    },
    Teardown,
}

enum LinkEvent {
    Opened { generation: u64 },
    Frame { generation: u64, frame: StompFrame },
    Lost { generation: u64, error: RealtimeError },
}

// region subscription

/// Handle returned by [`ConnectionManager::subscribe`]. Clones share the
/// same release flag.
#[derive(Clone)]
pub struct Subscription {
    id: SubscriptionId,
    topic: String,
    commands: UnboundedSender<Command>,
    released: Arc<AtomicBool>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Removes this subscription only. Later calls are no-ops.
    pub fn unsubscribe(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.commands.send(Command::Unsubscribe { id: self.id });
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("released", &self.released.load(Ordering::SeqCst))
            .finish()
    }
}

// endregion

// region connection manager

/// Owns the one realtime connection. Callers only send commands; all state
/// lives on the manager task, so commands apply in the order they were sent.
pub struct ConnectionManager {
    commands: UnboundedSender<Command>,
    next_subscription: AtomicU64,
    state: watch::Receiver<ConnectionState>,
    shutdown: CancellationToken,
    actor_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(
        config: RealtimeConfig,
        connector: Arc<dyn RealtimeConnector>,
        session_store: Arc<dyn SessionStore>,
    ) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let shutdown = CancellationToken::new();

        let actor = ConnectionActor {
            host: config.host(),
            config,
            connector,
            session_store,
            link: Link::Down,
            generation: 0,
            registrations: BTreeMap::new(),
            topic_subscriptions: HashMap::new(),
            deferred: VecDeque::new(),
            events_tx,
            state_tx,
            shutdown: shutdown.clone(),
        };
        let actor_handle = tokio::spawn(actor.run(commands_rx, events_rx));

        Self {
            commands,
            next_subscription: AtomicU64::new(0),
            state,
            shutdown,
            actor_handle: Mutex::new(Some(actor_handle)),
        }
    }

    /// Non-blocking: reaching `Connected` happens on the manager task.
    pub fn ensure_connected(&self) {
        let _ = self.commands.send(Command::EnsureConnected);
    }

    pub fn subscribe<F>(&self, topic: impl Into<String>, on_message: F) -> Subscription
    where
        F: Fn(InboundMessage) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::SeqCst) + 1);
        let topic = topic.into();
        let _ = self.commands.send(Command::Subscribe {
            id,
            topic: topic.clone(),
            handler: Arc::new(on_message),
        });

        Subscription {
            id,
            topic,
            commands: self.commands.clone(),
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Best effort: without a live connection the payload is dropped and
    /// `PublishWhileDisconnected` returned.
    pub async fn publish(&self, topic: &str, payload: impl Into<String>) -> Result<(), RealtimeError> {
        self.publish_frame(StompFrame::send(topic, payload)).await
    }

    pub async fn publish_json<T: Serialize>(&self, topic: &str, value: &T) -> Result<(), RealtimeError> {
        let body = serde_json::to_string(value)
            .map_err(|e| RealtimeError::MalformedMessage(e.to_string()))?;
        let frame = StompFrame::send(topic, body).header("content-type", "application/json");
        self.publish_frame(frame).await
    }

    async fn publish_frame(&self, frame: StompFrame) -> Result<(), RealtimeError> {
        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(Command::Publish { frame, reply })
            .map_err(|_| RealtimeError::Closed)?;
        outcome.await.map_err(|_| RealtimeError::Closed)?
    }

    pub fn teardown(&self) {
        let _ = self.commands.send(Command::Teardown);
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = match self.actor_handle.lock() {
            Ok(mut lock) => lock.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

// endregion

// region connection actor

struct LinkHandle {
    generation: u64,
    token: AccessToken,
    outbound: UnboundedSender<StompFrame>,
    cancel: CancellationToken,
}

enum Link {
    Down,
    Backoff { token: AccessToken, until: Instant },
    Connecting(LinkHandle),
    Open(LinkHandle),
}

struct Registration {
    topic: String,
    handler: MessageHandler,
}

struct ConnectionActor {
    config: RealtimeConfig,
    host: String,
    connector: Arc<dyn RealtimeConnector>,
    session_store: Arc<dyn SessionStore>,
    link: Link,
    generation: u64,
    /// Everything callers asked for and have not released, by subscribe order.
    registrations: BTreeMap<SubscriptionId, Registration>,
    /// Topics whose SUBSCRIBE went out on the current transport.
    topic_subscriptions: HashMap<String, SubscriptionId>,
    /// Subscribe actions waiting for the next open transport, FIFO.
    deferred: VecDeque<SubscriptionId>,
    events_tx: UnboundedSender<LinkEvent>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
}

impl ConnectionActor {
    async fn run(
        mut self,
        mut commands: UnboundedReceiver<Command>,
        mut events: UnboundedReceiver<LinkEvent>,
    ) {
        tracing::debug!(url = %self.config.url, "connection manager started");
        loop {
            let retry_at = match &self.link {
                Link::Backoff { until, .. } => Some(*until),
                _ => None,
            };

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event),
                _ = sleep_until(retry_at) => self.retry(),
            }
        }

        self.teardown();
        tracing::debug!("connection manager stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::EnsureConnected => self.ensure_connected(),
            Command::Subscribe { id, topic, handler } => self.subscribe(id, topic, handler),
            Command::Unsubscribe { id } => self.unsubscribe(id),
            Command::Publish { frame, reply } => {
                let _ = reply.send(self.publish(frame));
            }
            Command::Teardown => self.teardown(),
        }
    }

    fn handle_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Opened { generation } => {
                if self.mark_open(generation) {
                    tracing::info!(generation, "realtime connection established");
                    self.set_state(ConnectionState::Connected);
                    self.flush_deferred();
                }
            }
            LinkEvent::Frame { generation, frame } => {
                if self.is_current(generation) {
                    self.dispatch(frame);
                }
            }
            LinkEvent::Lost { generation, error } => {
                if self.is_current(generation) {
                    self.link_lost(error);
                }
            }
        }
    }

    fn ensure_connected(&mut self) {
        let token = self.session_store.get_session().access_token;
        let token_matches = match &self.link {
            Link::Connecting(handle) | Link::Open(handle) => Some(handle.token == token),
            Link::Backoff { token: used, .. } => Some(*used == token),
            Link::Down => None,
        };

        match token_matches {
            Some(true) if !token.is_empty() => return,
            Some(_) => {
                tracing::info!("access token changed, replacing realtime connection");
                self.drop_link();
            }
            None => {}
        }

        if token.is_empty() {
            tracing::debug!("no access token, staying disconnected");
            return;
        }
        self.open_link(token);
    }

    fn subscribe(&mut self, id: SubscriptionId, topic: String, handler: MessageHandler) {
        self.ensure_connected();

        let replaced = self
            .registrations
            .iter()
            .find(|(_, registration)| registration.topic == topic)
            .map(|(id, _)| *id);
        if let Some(previous) = replaced {
            tracing::debug!(%topic, "replacing existing subscription");
            self.unsubscribe(previous);
        }

        self.registrations.insert(
            id,
            Registration {
                topic: topic.clone(),
                handler,
            },
        );
        if let Link::Open(handle) = &self.link {
            let _ = handle
                .outbound
                .send(StompFrame::subscribe(&id.to_string(), &topic));
            self.topic_subscriptions.insert(topic, id);
        } else {
            tracing::debug!(%topic, "deferring subscribe until connected");
            self.deferred.push_back(id);
        }
    }

    fn unsubscribe(&mut self, id: SubscriptionId) {
        let Some(registration) = self.registrations.remove(&id) else {
            return;
        };
        self.deferred.retain(|deferred| *deferred != id);

        if self.topic_subscriptions.get(&registration.topic) == Some(&id) {
            self.topic_subscriptions.remove(&registration.topic);
            if let Link::Open(handle) = &self.link {
                let _ = handle.outbound.send(StompFrame::unsubscribe(&id.to_string()));
            }
        }
        tracing::debug!(topic = %registration.topic, "unsubscribed");
    }

    fn publish(&mut self, frame: StompFrame) -> Result<(), RealtimeError> {
        self.ensure_connected();
        match &self.link {
            Link::Open(handle) => handle
                .outbound
                .send(frame)
                .map_err(|_| RealtimeError::Closed),
            _ => {
                let error = RealtimeError::PublishWhileDisconnected;
                tracing::warn!(
                    destination = frame.get("destination").unwrap_or_default(),
                    "{error}"
                );
                Err(error)
            }
        }
    }

    fn teardown(&mut self) {
        if let Link::Open(handle) = &self.link {
            let mut active: Vec<_> = self.topic_subscriptions.values().copied().collect();
            active.sort();
            for id in active {
                let _ = handle.outbound.send(StompFrame::unsubscribe(&id.to_string()));
            }
        }
        let was_up = !matches!(self.link, Link::Down);

        self.drop_link();
        self.registrations.clear();
        self.topic_subscriptions.clear();
        self.deferred.clear();

        if was_up {
            tracing::info!("realtime connection torn down");
        }
    }

    fn flush_deferred(&mut self) {
        let Link::Open(handle) = &self.link else {
            return;
        };
        while let Some(id) = self.deferred.pop_front() {
            let Some(registration) = self.registrations.get(&id) else {
                continue;
            };
            if self.topic_subscriptions.contains_key(&registration.topic) {
                continue;
            }
            let _ = handle
                .outbound
                .send(StompFrame::subscribe(&id.to_string(), &registration.topic));
            self.topic_subscriptions.insert(registration.topic.clone(), id);
        }
    }

    fn dispatch(&mut self, frame: StompFrame) {
        match frame.command {
            StompCommand::Message => {
                let Some(id) = frame.get("subscription").and_then(SubscriptionId::parse) else {
                    tracing::debug!("MESSAGE without a known subscription header");
                    return;
                };
                let Some(registration) = self.registrations.get(&id) else {
                    tracing::trace!(%id, "message for released subscription");
                    return;
                };
                let destination = frame
                    .get("destination")
                    .unwrap_or(&registration.topic)
                    .to_owned();
                let message_id = frame.get("message-id").map(str::to_owned);
                (registration.handler)(InboundMessage {
                    destination,
                    message_id,
                    body: frame.body,
                });
            }
            StompCommand::Error => {
                let message = frame
                    .get("message")
                    .map(str::to_owned)
                    .unwrap_or_else(|| frame.body.clone());
                self.link_lost(RealtimeError::Transport(format!("broker error: {message}")));
            }
            StompCommand::Receipt => {
                tracing::trace!(receipt = frame.get("receipt-id"), "receipt");
            }
            other => tracing::debug!(command = %other, "ignoring frame"),
        }
    }

    fn open_link(&mut self, token: AccessToken) {
        self.generation += 1;
        let generation = self.generation;
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let cancel = self.shutdown.child_token();

        let task = LinkTask {
            generation,
            url: self.config.url.clone(),
            host: self.host.clone(),
            token: token.clone(),
            heartbeat: self.config.heartbeat,
            connect_timeout: self.config.connect_timeout,
            connector: self.connector.clone(),
            events: self.events_tx.clone(),
            outbound: outbound_rx,
            cancel: cancel.clone(),
        };
        tokio::spawn(task.run());

        tracing::debug!(generation, url = %self.config.url, "opening realtime connection");
        self.link = Link::Connecting(LinkHandle {
            generation,
            token,
            outbound,
            cancel,
        });
        self.set_state(ConnectionState::Connecting);
    }

    /// Closes the current transport but keeps registrations; their
    /// subscribe actions go back to the front of the deferred queue.
    fn drop_link(&mut self) {
        match std::mem::replace(&mut self.link, Link::Down) {
            Link::Open(handle) => {
                // dropping the handle closes the outbound queue once DISCONNECT is flushed
                let _ = handle.outbound.send(StompFrame::disconnect());
            }
            Link::Connecting(handle) => handle.cancel.cancel(),
            Link::Backoff { .. } | Link::Down => {}
        }
        self.requeue_active();
        self.set_state(ConnectionState::Disconnected);
    }

    fn link_lost(&mut self, error: RealtimeError) {
        let token = match std::mem::replace(&mut self.link, Link::Down) {
            Link::Connecting(handle) | Link::Open(handle) => {
                handle.cancel.cancel();
                handle.token
            }
            Link::Backoff { token, .. } => token,
            Link::Down => return,
        };

        tracing::warn!(
            delay_ms = self.config.reconnect_delay.as_millis() as u64,
            "realtime connection lost: {error}"
        );
        self.requeue_active();
        self.link = Link::Backoff {
            token,
            until: Instant::now() + self.config.reconnect_delay,
        };
        self.set_state(ConnectionState::Disconnected);
    }

    fn retry(&mut self) {
        self.link = Link::Down;
        let token = self.session_store.get_session().access_token;
        if token.is_empty() {
            tracing::info!("no access token, not reconnecting");
            return;
        }
        self.open_link(token);
    }

    fn requeue_active(&mut self) {
        let mut active: Vec<_> = self.topic_subscriptions.drain().map(|(_, id)| id).collect();
        active.sort();
        for id in active.into_iter().rev() {
            self.deferred.push_front(id);
        }
    }

    fn mark_open(&mut self, generation: u64) -> bool {
        match std::mem::replace(&mut self.link, Link::Down) {
            Link::Connecting(handle) if handle.generation == generation => {
                self.link = Link::Open(handle);
                true
            }
            other => {
                self.link = other;
                false
            }
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        match &self.link {
            Link::Connecting(handle) | Link::Open(handle) => handle.generation == generation,
            Link::Backoff { .. } | Link::Down => false,
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }
}

// endregion

// region link task

/// One transport attempt: connect, STOMP handshake, then pump frames both
/// ways until the transport fails, the outbound queue closes, or the link is
/// cancelled.
struct LinkTask {
    generation: u64,
    url: String,
    host: String,
    token: AccessToken,
    heartbeat: Duration,
    connect_timeout: Duration,
    connector: Arc<dyn RealtimeConnector>,
    events: UnboundedSender<LinkEvent>,
    outbound: UnboundedReceiver<StompFrame>,
    cancel: CancellationToken,
}

fn transport_error(e: impl fmt::Display) -> RealtimeError {
    RealtimeError::Transport(e.to_string())
}

impl LinkTask {
    async fn run(mut self) {
        let cancel = self.cancel.clone();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            result = self.drive() => result,
        };

        if let Err(error) = result {
            let _ = self.events.send(LinkEvent::Lost {
                generation: self.generation,
                error,
            });
        }
    }

    async fn drive(&mut self) -> Result<(), RealtimeError> {
        let ours = HeartBeat::symmetric(self.heartbeat);
        let (mut sender, mut receiver, theirs) =
            tokio::time::timeout(self.connect_timeout, self.handshake(ours))
                .await
                .map_err(|_| RealtimeError::ConnectTimeout)??;

        let generation = self.generation;
        let _ = self.events.send(LinkEvent::Opened { generation });

        let (send_every, expect_every) = HeartBeat::negotiate(ours, theirs);
        let mut ticker = send_every.map(|every| {
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        let silence_limit = expect_every.map(|every| every * HEARTBEAT_GRACE);
        let mut last_inbound = Instant::now();

        loop {
            let watchdog = silence_limit.map(|limit| last_inbound + limit);
            tokio::select! {
                frame = self.outbound.recv() => match frame {
                    Some(frame) => {
                        tracing::trace!(generation, command = %frame.command, "sending frame");
                        sender
                            .send(ConnMessage::Text(frame.encode()))
                            .await
                            .map_err(transport_error)?;
                    }
                    None => {
                        let _ = sender.send(ConnMessage::Close).await;
                        return Ok(());
                    }
                },
                message = receiver.next() => {
                    let message = match message {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => return Err(transport_error(e)),
                        None => return Err(transport_error("closed by peer")),
                    };
                    last_inbound = Instant::now();
                    match message {
                        ConnMessage::Text(text) => match decode_frames(&text) {
                            Ok(frames) => {
                                for frame in frames {
                                    let _ = self.events.send(LinkEvent::Frame { generation, frame });
                                }
                            }
                            Err(e) => {
                                let error = RealtimeError::MalformedMessage(e.to_string());
                                tracing::warn!(generation, "dropping frame: {error}");
                            }
                        },
                        ConnMessage::Close => return Err(transport_error("closed by peer")),
                        ConnMessage::Binary(_) | ConnMessage::Ping | ConnMessage::Pong => {}
                    }
                },
                _ = tick(&mut ticker) => {
                    sender
                        .send(ConnMessage::Text("\n".to_owned()))
                        .await
                        .map_err(transport_error)?;
                },
                _ = sleep_until(watchdog) => {
                    return Err(transport_error("heartbeat timed out"));
                },
            }
        }
    }

    async fn handshake(
        &self,
        ours: HeartBeat,
    ) -> Result<(Box<dyn ConnSender>, Box<dyn ConnReceiver>, HeartBeat), RealtimeError> {
        let (mut sender, mut receiver) = self.connector.connect(&self.url).await?;

        let connect = StompFrame::connect(&self.host, self.token.as_str(), ours);
        sender
            .send(ConnMessage::Text(connect.encode()))
            .await
            .map_err(transport_error)?;

        loop {
            let text = match receiver.next().await {
                Some(Ok(ConnMessage::Text(text))) => text,
                Some(Ok(ConnMessage::Close)) | None => {
                    return Err(transport_error("closed during handshake"));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(transport_error(e)),
            };

            let frames =
                decode_frames(&text).map_err(|e| RealtimeError::Handshake(e.to_string()))?;
            for frame in frames {
                match frame.command {
                    StompCommand::Connected => {
                        let theirs = HeartBeat::parse(frame.get("heart-beat"));
                        return Ok((sender, receiver, theirs));
                    }
                    StompCommand::Error => {
                        let message = frame.get("message").unwrap_or(&frame.body).to_owned();
                        return Err(RealtimeError::Handshake(message));
                    }
                    _ => {}
                }
            }
        }
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// endregion

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_ids_round_trip_through_headers() {
        let id = SubscriptionId(12);
        assert_eq!(id.to_string(), "sub-12");
        assert_eq!(SubscriptionId::parse("sub-12"), Some(id));
        assert_eq!(SubscriptionId::parse("12"), None);
    }

    #[test]
    fn host_comes_from_the_realtime_url() {
        assert_eq!(RealtimeConfig::new("wss://chat.example.org/ws").host(), "chat.example.org");
        assert_eq!(RealtimeConfig::new("not a url").host(), "localhost");
    }
}
