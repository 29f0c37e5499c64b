use crate::realtime::*;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;

const CHANNEL_CAP: usize = 64;

/// Broker side of an in-process transport handed out by [`ChannelConnector`].
pub struct BrokerEnd {
    pub url: String,
    pub to_client: mpsc::Sender<ConnMessage>,
    pub from_client: mpsc::Receiver<ConnMessage>,
    pending: VecDeque<StompFrame>,
}

impl BrokerEnd {
    /// Next STOMP frame from the client; `None` once the client hung up.
    pub async fn recv_frame(&mut self) -> Option<StompFrame> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Some(frame);
            }
            match self.from_client.recv().await? {
                ConnMessage::Text(text) => match decode_frames(&text) {
                    Ok(frames) => self.pending.extend(frames),
                    Err(e) => tracing::warn!("broker end got undecodable text: {e}"),
                },
                ConnMessage::Close => return None,
                _ => {}
            }
        }
    }

    pub async fn send_frame(&self, frame: &StompFrame) -> bool {
        self.send_text(frame.encode()).await
    }

    pub async fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client
            .send(ConnMessage::Text(text.into()))
            .await
            .is_ok()
    }

    /// Reads the CONNECT frame and answers CONNECTED without heartbeats.
    pub async fn accept(&mut self) -> Option<StompFrame> {
        let connect = self.recv_frame().await?;
        self.send_frame(&StompFrame::connected(HeartBeat::default()))
            .await
            .then_some(connect)
    }
}

/// In-process connector: each `connect` yields a [`BrokerEnd`] on the
/// receiver returned by [`ChannelConnector::new`].
pub struct ChannelConnector {
    accepted: mpsc::UnboundedSender<BrokerEnd>,
    refusals: AtomicUsize,
}

impl ChannelConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BrokerEnd>) {
        let (accepted, broker_ends) = mpsc::unbounded_channel();
        let connector = Self {
            accepted,
            refusals: AtomicUsize::new(0),
        };
        (connector, broker_ends)
    }

    /// Fails the next `count` connection attempts at the transport level.
    pub fn refuse_next(&self, count: usize) {
        self.refusals.store(count, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl RealtimeConnector for ChannelConnector {
    async fn connect(&self, url: &str) -> Result<ConnHalves, RealtimeError> {
        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(RealtimeError::Transport("connection refused".to_owned()));
        }

        let (to_client, client_rx) = mpsc::channel(CHANNEL_CAP);
        let (client_tx, from_client) = mpsc::channel(CHANNEL_CAP);
        let broker = BrokerEnd {
            url: url.to_owned(),
            to_client,
            from_client,
            pending: VecDeque::new(),
        };
        self.accepted
            .send(broker)
            .map_err(|_| RealtimeError::Transport("no broker listening".to_owned()))?;

        Ok((Box::new(client_tx), Box::new(client_rx)))
    }
}
