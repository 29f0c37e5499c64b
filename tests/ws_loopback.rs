//! Connection manager over a real WebSocket, against a hand-driven broker.

use futures_util::{SinkExt, Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tether::application_impl::*;
use tether::domain_model::*;
use tether::infra_store::*;
use tether::realtime::*;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

async fn next_frame<S>(ws_rx: &mut S) -> StompFrame
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let message = ws_rx.next().await.unwrap().unwrap();
        if let Message::Text(text) = message {
            let mut frames = decode_frames(text.as_str()).unwrap();
            if !frames.is_empty() {
                return frames.remove(0);
            }
        }
    }
}

#[tokio::test]
async fn stomp_session_over_websocket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let (mut ws_tx, mut ws_rx) = ws.split();

        let connect = next_frame(&mut ws_rx).await;
        assert_eq!(connect.command, StompCommand::Connect);
        assert_eq!(connect.get("Authorization"), Some("Bearer A1"));
        let connected = StompFrame::connected(HeartBeat::default());
        ws_tx.send(Message::text(connected.encode())).await.unwrap();

        let subscribe = next_frame(&mut ws_rx).await;
        assert_eq!(subscribe.command, StompCommand::Subscribe);
        assert_eq!(subscribe.get("destination"), Some("/sub/chat.3"));
        let id = subscribe.get("id").unwrap().to_owned();

        let message = StompFrame::message("/sub/chat.3", &id, "m-1", r#"{"content":"over tcp"}"#);
        ws_tx.send(Message::text(message.encode())).await.unwrap();

        let send = next_frame(&mut ws_rx).await;
        assert_eq!(send.command, StompCommand::Send);
        assert_eq!(send.get("destination"), Some("/pub/app/send.3"));
        send.body
    });

    let session = Session::from_pair(TokenPair::new("A1", "R1"), Role::User);
    let store = Arc::new(PersistentSessionStore::load(Arc::new(
        MemorySessionPersistence::with_session(session),
    )));
    let config = RealtimeConfig {
        url: format!("ws://{addr}/ws"),
        heartbeat: Duration::ZERO,
        reconnect_delay: Duration::from_millis(50),
        connect_timeout: Duration::from_secs(2),
    };
    let manager = ConnectionManager::new(config, Arc::new(WsConnector), store);

    let (tx, mut received) = mpsc::unbounded_channel();
    let _sub = manager.subscribe("/sub/chat.3", move |message| {
        let _ = tx.send(message);
    });

    let message = tokio::time::timeout(Duration::from_secs(5), received.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.body, r#"{"content":"over tcp"}"#);

    manager.publish("/pub/app/send.3", "reply").await.unwrap();
    let echoed = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, "reply");

    manager.shutdown().await;
}
