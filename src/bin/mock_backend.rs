//! Local stand-in for the chat backend, for trying the client end to end.
//!
//! ```text
//! $ cargo run --bin mock_backend -- --access-ttl-secs 20
//! $ curl -s -XPOST localhost:8080/dev/login -d '{"subject":"ada"}' -H 'content-type: application/json'
//! $ cargo run -- --access-token <accessToken> --refresh-token <refreshToken>
//! ```

use chrono::Utc;
use clap::Parser;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tether::domain_model::{Role, TokenPair};
use tether::logger::*;
use tether::realtime::{HeartBeat, StompCommand, StompFrame, decode_frames};
use tokio::signal;
use tokio::sync::mpsc;
use uuid::Uuid;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::ws::{Message, WebSocket};
use warp::{Filter, Reply};

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "127.0.0.1:8080")]
    address: SocketAddr,
    /// Short lifetimes make refreshes easy to watch.
    #[arg(long, default_value_t = 30)]
    access_ttl_secs: u64,
    #[arg(long, default_value_t = 3600)]
    refresh_ttl_secs: u64,
}

// region tokens

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum TokenKind {
    Access,
    Refresh,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    scope: String,
    kind: TokenKind,
    exp: i64,
    iat: i64,
    jti: String,
}

#[derive(Debug)]
enum TokenError {
    Expired,
    Invalid,
}

struct Backend {
    signing_key: Vec<u8>,
    access_ttl: Duration,
    refresh_ttl: Duration,
    /// jti of every refresh token that has not been exchanged yet
    live_refresh: DashMap<String, String>,
    topics: DashMap<String, Vec<Subscriber>>,
    next_message: AtomicU64,
}

#[derive(Clone)]
struct Subscriber {
    connection: Uuid,
    id: String,
    outbound: mpsc::UnboundedSender<String>,
}

impl Backend {
    fn new(args: &Args) -> Self {
        let signing_key = std::env::var("JWT_SIGNING_KEY")
            .unwrap_or_else(|_| "my-dev-secret-key".to_string())
            .into_bytes();
        Self {
            signing_key,
            access_ttl: Duration::from_secs(args.access_ttl_secs),
            refresh_ttl: Duration::from_secs(args.refresh_ttl_secs),
            live_refresh: DashMap::new(),
            topics: DashMap::new(),
            next_message: AtomicU64::new(0),
        }
    }

    fn issue(&self, subject: &str, role: Role) -> Result<TokenPair, jsonwebtoken::errors::Error> {
        let scope = role.to_string();
        let access = self.sign(subject, &scope, TokenKind::Access, self.access_ttl, Uuid::new_v4())?;
        let refresh_jti = Uuid::new_v4();
        let refresh = self.sign(subject, &scope, TokenKind::Refresh, self.refresh_ttl, refresh_jti)?;
        self.live_refresh
            .insert(refresh_jti.to_string(), subject.to_owned());

        let mut pair = TokenPair::new(access, refresh);
        pair.authorization_identifier = subject.to_owned();
        pair.scope = Some(scope);
        Ok(pair)
    }

    fn sign(
        &self,
        subject: &str,
        scope: &str,
        kind: TokenKind,
        ttl: Duration,
        jti: Uuid,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let iat_dt = Utc::now();
        let exp_dt = iat_dt + ttl;
        let claims = Claims {
            sub: subject.to_owned(),
            scope: scope.to_owned(),
            kind,
            exp: exp_dt.timestamp(),
            iat: iat_dt.timestamp(),
            jti: jti.to_string(),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(&self.signing_key),
        )
    }

    fn verify(&self, token: &str, kind: TokenKind) -> Result<Claims, TokenError> {
        let mut v = Validation::new(Algorithm::HS256);
        v.validate_exp = true;
        v.validate_aud = false;
        v.leeway = 0;
        let data = decode::<Claims>(token, &DecodingKey::from_secret(&self.signing_key), &v)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid,
            })?;
        if data.claims.kind != kind {
            return Err(TokenError::Invalid);
        }
        Ok(data.claims)
    }

    fn subscribe(&self, topic: &str, subscriber: Subscriber) {
        self.topics
            .entry(topic.to_owned())
            .or_default()
            .push(subscriber);
    }

    fn unsubscribe(&self, connection: Uuid, id: &str) {
        for mut entry in self.topics.iter_mut() {
            entry
                .value_mut()
                .retain(|s| !(s.connection == connection && s.id == id));
        }
    }

    fn drop_connection(&self, connection: Uuid) {
        for mut entry in self.topics.iter_mut() {
            entry.value_mut().retain(|s| s.connection != connection);
        }
    }

    /// `/pub/{app|manager}/send.{id}` fans out on `/sub/chat.{id}`.
    fn route(&self, sender: &Claims, frame: &StompFrame) {
        let Some(conversation) = frame
            .get("destination")
            .and_then(|d| d.rsplit_once("/send."))
            .map(|(_, id)| id.to_owned())
        else {
            warn!(destination = frame.get("destination"), "unroutable SEND");
            return;
        };

        let content = serde_json::from_str::<serde_json::Value>(&frame.body)
            .ok()
            .and_then(|v| v.get("content").cloned())
            .unwrap_or_else(|| serde_json::Value::String(frame.body.clone()));
        let body = serde_json::json!({
            "content": content,
            "sender": sender.sub,
            "senderRole": sender.scope,
            "sentAt": Utc::now().to_rfc3339(),
        })
        .to_string();

        let topic = format!("/sub/chat.{conversation}");
        let subscribers = self
            .topics
            .get(&topic)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        debug!(%topic, fanout = subscribers.len(), "routing chat message");
        for subscriber in subscribers {
            let message_id = self.next_message.fetch_add(1, Ordering::SeqCst).to_string();
            let message = StompFrame::message(&topic, &subscriber.id, &message_id, &body)
                .header("content-type", "application/json");
            let _ = subscriber.outbound.send(message.encode());
        }
    }
}

// endregion

// region http

#[derive(Serialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct LoginRequest {
    subject: String,
    #[serde(default)]
    manager: bool,
}

#[derive(Serialize)]
struct Probe {
    subject: String,
    scope: String,
}

fn reply_json<T: Serialize>(status: StatusCode, body: &T) -> Response {
    warp::reply::with_status(warp::reply::json(body), status).into_response()
}

fn handle_login(request: LoginRequest, backend: Arc<Backend>) -> Response {
    let role = if request.manager { Role::Manager } else { Role::User };
    match backend.issue(&request.subject, role) {
        Ok(pair) => {
            info!(subject = %request.subject, %role, "issued login pair");
            reply_json(StatusCode::OK, &Envelope { data: pair })
        }
        Err(e) => {
            error!("signing tokens: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn handle_exchange(base: String, bearer: Option<String>, backend: Arc<Backend>) -> Response {
    if base != "app" && base != "manager" {
        return StatusCode::NOT_FOUND.into_response();
    }
    let Some(token) = bearer else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let claims = match backend.verify(&token, TokenKind::Refresh) {
        Ok(claims) => claims,
        Err(e) => {
            warn!(?e, "refresh token rejected");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };
    // refresh tokens are single use
    if backend.live_refresh.remove(&claims.jti).is_none() {
        warn!(subject = %claims.sub, "refresh token reused");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let role = Role::from_scope(&claims.scope).unwrap_or_default();
    match backend.issue(&claims.sub, role) {
        Ok(pair) => {
            info!(subject = %claims.sub, "rotated token pair");
            reply_json(StatusCode::OK, &Envelope { data: pair })
        }
        Err(e) => {
            error!("signing tokens: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn handle_probe(_base: String, bearer: Option<String>, backend: Arc<Backend>) -> Response {
    match bearer.map(|token| backend.verify(&token, TokenKind::Access)) {
        Some(Ok(claims)) => reply_json(
            StatusCode::OK,
            &Envelope {
                data: Probe {
                    subject: claims.sub,
                    scope: claims.scope,
                },
            },
        ),
        Some(Err(e)) => {
            debug!(?e, "probe rejected");
            StatusCode::UNAUTHORIZED.into_response()
        }
        None => StatusCode::UNAUTHORIZED.into_response(),
    }
}

fn with(backend: Arc<Backend>) -> impl Filter<Extract = (Arc<Backend>,), Error = Infallible> + Clone {
    warp::any().map(move || backend.clone())
}

fn bearer() -> impl Filter<Extract = (Option<String>,), Error = warp::Rejection> + Clone {
    warp::header::optional::<String>("authorization").map(|header: Option<String>| {
        header.and_then(|h| h.strip_prefix("Bearer ").map(str::to_owned))
    })
}

// endregion

// region broker

async fn run_broker(socket: WebSocket, backend: Arc<Backend>) {
    let connection = Uuid::new_v4();
    let (mut sink, mut stream) = socket.split();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(text) = outbound_rx.recv().await {
            if sink.send(Message::text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut session: Option<Claims> = None;
    'conn: while let Some(Ok(message)) = stream.next().await {
        if message.is_close() {
            break;
        }
        let Ok(text) = message.to_str() else {
            continue;
        };
        let frames = match decode_frames(text) {
            Ok(frames) => frames,
            Err(e) => {
                warn!(%connection, "undecodable frame: {e}");
                continue;
            }
        };
        for frame in frames {
            if !handle_frame(&backend, connection, &outbound, &mut session, frame) {
                break 'conn;
            }
        }
    }

    backend.drop_connection(connection);
    drop(outbound);
    let _ = writer.await;
    debug!(%connection, "broker connection closed");
}

/// Returns whether the connection stays open.
fn handle_frame(
    backend: &Backend,
    connection: Uuid,
    outbound: &mpsc::UnboundedSender<String>,
    session: &mut Option<Claims>,
    frame: StompFrame,
) -> bool {
    match frame.command {
        StompCommand::Connect | StompCommand::Stomp => {
            let token = frame
                .get("Authorization")
                .and_then(|h| h.strip_prefix("Bearer "));
            match token.map(|t| backend.verify(t, TokenKind::Access)) {
                Some(Ok(claims)) => {
                    info!(%connection, subject = %claims.sub, "stomp session opened");
                    let _ = outbound.send(StompFrame::connected(HeartBeat::default()).encode());
                    *session = Some(claims);
                    true
                }
                _ => {
                    let _ = outbound.send(StompFrame::error("invalid access token").encode());
                    false
                }
            }
        }
        StompCommand::Disconnect => false,
        _ if session.is_none() => {
            let _ = outbound.send(StompFrame::error("CONNECT first").encode());
            false
        }
        StompCommand::Subscribe => {
            let (Some(id), Some(destination)) = (frame.get("id"), frame.get("destination")) else {
                let _ = outbound.send(StompFrame::error("SUBSCRIBE needs id and destination").encode());
                return false;
            };
            backend.subscribe(
                destination,
                Subscriber {
                    connection,
                    id: id.to_owned(),
                    outbound: outbound.clone(),
                },
            );
            true
        }
        StompCommand::Unsubscribe => {
            if let Some(id) = frame.get("id") {
                backend.unsubscribe(connection, id);
            }
            true
        }
        StompCommand::Send => {
            if let Some(claims) = session.as_ref() {
                backend.route(claims, &frame);
            }
            true
        }
        other => {
            debug!(%connection, command = %other, "ignoring client frame");
            true
        }
    }
}

// endregion

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _logger = Logger::new_bootstrap();

    let backend = Arc::new(Backend::new(&args));

    let login = warp::post()
        .and(warp::path!("dev" / "login"))
        .and(warp::body::json())
        .and(with(backend.clone()))
        .map(handle_login);

    let exchange = warp::post()
        .and(warp::path!(String / "auth" / "token"))
        .and(bearer())
        .and(with(backend.clone()))
        .map(handle_exchange);

    let probe = warp::get()
        .and(warp::path!(String / "me"))
        .and(bearer())
        .and(with(backend.clone()))
        .map(handle_probe);

    let broker = warp::path("ws")
        .and(warp::path::end())
        .and(warp::ws())
        .and(with(backend.clone()))
        .map(|ws: warp::ws::Ws, backend: Arc<Backend>| {
            ws.on_upgrade(move |socket| run_broker(socket, backend))
        });

    info!(address = %args.address, "mock backend listening");
    warp::serve(login.or(exchange).or(probe).or(broker))
        .bind_with_graceful_shutdown(args.address, async {
            let _ = signal::ctrl_c().await;
        })
        .1
        .await;

    Ok(())
}
