//! In-memory gateway used by the session and manager tests.

use crate::error::Error;
use crate::transport::{GatewayConnector, GatewayTransport};
use async_trait::async_trait;
use futures_util::{sink, stream};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use url::Url;

#[derive(Debug, Clone)]
pub(crate) struct MockOptions {
    pub heartbeat_interval: u64,
    pub ack_heartbeats: bool,
    pub ready_sequence: u64,
    /// Fixed session id; otherwise `session-{index}`
    pub session_id: Option<String>,
    pub resume_url: Option<String>,
    /// Close every connection with this code right after IDENTIFY
    pub close_on_identify: Option<u16>,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: 41_250,
            ack_heartbeats: true,
            ready_sequence: 1,
            session_id: None,
            resume_url: None,
            close_on_identify: None,
        }
    }
}

/// A frame the client sent
#[derive(Debug, Clone)]
pub(crate) struct ReceivedFrame {
    pub connection: usize,
    pub at: Instant,
    pub payload: Value,
}

impl ReceivedFrame {
    pub fn op(&self) -> u64 {
        self.payload["op"].as_u64().unwrap_or(u64::MAX)
    }

    /// Shard index of an IDENTIFY frame
    pub fn identify_shard(&self) -> Option<u32> {
        self.payload["d"]["shard"][0].as_u64().map(|i| i as u32)
    }
}

#[derive(Default)]
struct MockState {
    options: MockOptions,
    connections: Mutex<Vec<mpsc::UnboundedSender<Message>>>,
    urls: Mutex<Vec<Url>>,
    frames: Mutex<Vec<ReceivedFrame>>,
    fail_next: AtomicUsize,
    fail_all: AtomicBool,
    notify: Notify,
}

impl MockState {
    fn record(&self, connection: usize, payload: Value) {
        self.frames.lock().push(ReceivedFrame {
            connection,
            at: Instant::now(),
            payload,
        });
        self.notify.notify_waiters();
    }
}

/// Scripted gateway server speaking over in-memory channels
#[derive(Clone, Default)]
pub(crate) struct MockGateway {
    state: Arc<MockState>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: MockOptions) -> Self {
        Self {
            state: Arc::new(MockState {
                options,
                ..Default::default()
            }),
        }
    }

    pub fn fail_next_connects(&self, count: usize) {
        self.state.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn fail_all_connects(&self, fail: bool) {
        self.state.fail_all.store(fail, Ordering::SeqCst);
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.lock().len()
    }

    pub fn urls(&self) -> Vec<Url> {
        self.state.urls.lock().clone()
    }

    pub fn frames(&self) -> Vec<ReceivedFrame> {
        self.state.frames.lock().clone()
    }

    pub fn frames_with_op(&self, op: u64) -> Vec<ReceivedFrame> {
        self.frames().into_iter().filter(|f| f.op() == op).collect()
    }

    /// Wait until at least `count` frames with `op` were received
    pub async fn wait_for_frames(&self, op: u64, count: usize) -> Vec<ReceivedFrame> {
        loop {
            let notified = self.state.notify.notified();
            let frames = self.frames_with_op(op);
            if frames.len() >= count {
                return frames;
            }
            notified.await;
        }
    }

    /// Push a raw frame to the client on `connection`
    pub fn send(&self, connection: usize, payload: Value) {
        if let Some(tx) = self.state.connections.lock().get(connection) {
            let _ = tx.send(Message::text(payload.to_string()));
        }
    }

    pub fn dispatch(&self, connection: usize, name: &str, sequence: u64, data: Value) {
        self.send(connection, json!({"op": 0, "t": name, "s": sequence, "d": data}));
    }

    /// Close `connection` from the server side
    pub fn close(&self, connection: usize, code: u16) {
        if let Some(tx) = self.state.connections.lock().get(connection) {
            let _ = tx.send(close_frame(code));
        }
    }
}

#[async_trait]
impl GatewayConnector for MockGateway {
    async fn connect(&self, url: &Url) -> Result<GatewayTransport, Error> {
        let fail_once = self
            .state
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail_once || self.state.fail_all.load(Ordering::SeqCst) {
            return Err(Error::ConnectionFailed {
                attempts: 1,
                last_error: "connection refused".to_string(),
            });
        }

        self.state.urls.lock().push(url.clone());

        let (client_tx, server_rx) = mpsc::unbounded_channel::<Message>();
        let (server_tx, client_rx) = mpsc::unbounded_channel::<Message>();
        let id = {
            let mut connections = self.state.connections.lock();
            connections.push(server_tx.clone());
            connections.len() - 1
        };
        tokio::spawn(serve(self.state.clone(), id, server_rx, server_tx));

        let sink = sink::unfold(client_tx, |tx, message: Message| async move {
            tx.send(message).map_err(|_| WsError::ConnectionClosed)?;
            Ok::<_, WsError>(tx)
        });
        let stream = stream::unfold(client_rx, |mut rx| async move {
            rx.recv().await.map(|message| (Ok::<_, WsError>(message), rx))
        });

        Ok(GatewayTransport::new(Box::pin(sink), Box::pin(stream)))
    }
}

async fn serve(
    state: Arc<MockState>,
    id: usize,
    mut from_client: mpsc::UnboundedReceiver<Message>,
    to_client: mpsc::UnboundedSender<Message>,
) {
    let options = state.options.clone();
    let _ = to_client.send(Message::text(
        json!({"op": 10, "d": {"heartbeat_interval": options.heartbeat_interval}}).to_string(),
    ));

    while let Some(message) = from_client.recv().await {
        let text = match &message {
            Message::Text(text) => text.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };
        let Ok(payload) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        state.record(id, payload.clone());

        let reply = match payload["op"].as_u64() {
            Some(1) if options.ack_heartbeats => json!({"op": 11}),
            Some(2) => {
                if let Some(code) = options.close_on_identify {
                    let _ = to_client.send(close_frame(code));
                    continue;
                }
                let shard = payload["d"]["shard"].clone();
                let session_id = options
                    .session_id
                    .clone()
                    .unwrap_or_else(|| format!("session-{}", shard[0].as_u64().unwrap_or(0)));
                json!({
                    "op": 0,
                    "t": "READY",
                    "s": options.ready_sequence,
                    "d": {
                        "session_id": session_id,
                        "shard": shard,
                        "resume_gateway_url": options.resume_url,
                    }
                })
            }
            Some(6) => json!({"op": 0, "t": "RESUMED", "s": null, "d": {}}),
            _ => continue,
        };
        let _ = to_client.send(Message::text(reply.to_string()));
    }
}

fn close_frame(code: u16) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: "".into(),
    }))
}
