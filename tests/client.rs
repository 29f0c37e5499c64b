use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tether::client::Client;
use tether::domain_model::*;
use tether::domain_port::*;
use tether::infra_http::*;
use tether::infra_store::*;
use tether::realtime::*;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer, connector: Arc<ChannelConnector>) -> (Client, Arc<MemorySessionPersistence>) {
    let transport: Arc<dyn HttpTransport> =
        Arc::new(ReqwestTransport::try_new(&server.uri(), Duration::from_secs(5)).unwrap());
    let persistence = Arc::new(MemorySessionPersistence::new());
    let realtime = RealtimeConfig {
        url: realtime_url(&server.uri(), "/ws").unwrap(),
        heartbeat: Duration::ZERO,
        reconnect_delay: Duration::from_millis(50),
        connect_timeout: Duration::from_secs(1),
    };
    let client = Client::from_parts(transport, persistence.clone(), connector, realtime);
    (client, persistence)
}

#[tokio::test]
async fn login_connects_and_logout_tears_down() {
    let server = MockServer::start().await;
    let (connector, mut brokers) = ChannelConnector::new();
    let (client, persistence) = client(&server, Arc::new(connector));
    assert!(!client.session().is_authenticated());

    client
        .login(TokenPair::new("A1", "R1"), Role::User)
        .unwrap();
    assert_eq!(persistence.stored().unwrap().access_token.as_str(), "A1");

    let mut broker = tokio::time::timeout(Duration::from_secs(2), brokers.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(broker.url.starts_with("ws://127.0.0.1:"));
    let connect = broker.accept().await.unwrap();
    assert_eq!(connect.get("Authorization"), Some("Bearer A1"));

    client.logout().unwrap();
    assert!(!client.session().is_authenticated());
    assert!(persistence.stored().is_none());
    loop {
        match tokio::time::timeout(Duration::from_secs(2), broker.recv_frame()).await.unwrap() {
            Some(frame) => assert_eq!(frame.command, StompCommand::Disconnect),
            None => break,
        }
    }

    client.shutdown().await;
}

#[tokio::test]
async fn refreshed_tokens_reach_the_realtime_connection() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/app/me"))
        .and(header("authorization", "Bearer A1"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/app/me"))
        .and(header("authorization", "Bearer A2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": { "name": "ada" } })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/app/auth/token"))
        .and(header("authorization", "Bearer R1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "accessToken": "A2", "refreshToken": "R2", "scope": "USER" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (connector, mut brokers) = ChannelConnector::new();
    let (client, _) = client(&server, Arc::new(connector));
    let expired = Arc::new(AtomicUsize::new(0));
    let counter = expired.clone();
    client.on_session_expired(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    client
        .login(TokenPair::new("A1", "R1"), Role::User)
        .unwrap();
    let mut first = brokers.recv().await.unwrap();
    first.accept().await.unwrap();

    let response = client
        .authorized_request(reqwest::Method::GET, "/app/me", None)
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    let body: serde_json::Value = response.json().unwrap();
    assert_eq!(body["data"]["name"], "ada");

    let mut second = tokio::time::timeout(Duration::from_secs(2), brokers.recv())
        .await
        .unwrap()
        .unwrap();
    let connect = second.accept().await.unwrap();
    assert_eq!(connect.get("Authorization"), Some("Bearer A2"));
    assert_eq!(expired.load(Ordering::SeqCst), 0);

    client.shutdown().await;
    server.verify().await;
}
