use crate::config::{ConnectionConfig, HealthConfig, IdentifyConfig, ReconnectConfig};
use crate::coordinator::ShardCoordinator;
use crate::dispatch::{Dispatch, GatewayEvent, LifecycleState};
use crate::error::{Error, ErrorKind};
use crate::health::{Heartbeat, HeartbeatMonitor};
use crate::metrics::Metrics;
use crate::payload::{GatewayPayload, Hello, Identify, Opcode, OutboundPayload, Ready, Resume};
use crate::shard::{SessionInfo, ShardInfo};
use crate::transport::{gateway_url, FrameSink, FrameStream, GatewayConnector, GatewayTransport};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Duration, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use url::Url;

/// Close code sent when the session should stay resumable
const RESUMABLE_CLOSE_CODE: u16 = 4000;

/// Commands that can be sent to a shard session
#[derive(Debug)]
pub(crate) enum SessionCommand {
    /// Send a frame (queued until the session is ready)
    Send(OutboundPayload),
    /// Gracefully close the connection
    Close { allow_resume: bool },
    /// Force a resumable reconnection
    Reconnect,
}

/// Live view of a session, shared with its handle
#[derive(Debug)]
pub struct SessionStatus {
    connected: AtomicBool,
    sequence: AtomicU64,
    shard_count: AtomicU32,
    latency_ms: AtomicU64,
    session_id: RwLock<Option<String>>,
    finished: CancellationToken,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            connected: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
            shard_count: AtomicU32::new(0),
            latency_ms: AtomicU64::new(0),
            session_id: RwLock::new(None),
            finished: CancellationToken::new(),
        }
    }
}

impl SessionStatus {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Current resumable session, if any
    pub fn session_info(&self) -> Option<SessionInfo> {
        let session_id = self.session_id.read().clone()?;
        Some(SessionInfo {
            session_id,
            sequence: self.sequence.load(Ordering::Acquire),
        })
    }

    /// Shard count reported in the last READY
    pub fn shard_count(&self) -> Option<u32> {
        match self.shard_count.load(Ordering::Acquire) {
            0 => None,
            count => Some(count),
        }
    }

    pub fn latency(&self) -> Option<Duration> {
        match self.latency_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }

    /// Resolves once the session task has exited
    pub async fn finished(&self) {
        self.finished.cancelled().await
    }

    pub(crate) fn mark_finished(&self) {
        self.connected.store(false, Ordering::Release);
        self.finished.cancel();
    }

    fn set_session(&self, session: Option<&SessionInfo>) {
        *self.session_id.write() = session.map(|s| s.session_id.clone());
        if let Some(session) = session {
            self.sequence.store(session.sequence, Ordering::Release);
        }
    }
}

/// Everything a session shares with its siblings
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub token: String,
    pub url: Url,
    pub max_concurrency: u32,
    pub connection: ConnectionConfig,
    pub reconnect: ReconnectConfig,
    pub health: HealthConfig,
    pub identify: IdentifyConfig,
    pub connector: Arc<dyn GatewayConnector>,
    pub coordinator: Arc<dyn ShardCoordinator>,
    pub metrics: Arc<Metrics>,
    pub close: CancellationToken,
}

#[derive(Debug)]
enum SessionEnd {
    Closed { allow_resume: bool },
    Reconnect { resumable: bool, reason: &'static str },
}

enum Flow {
    Continue,
    Ready,
    End(SessionEnd),
}

#[derive(Debug, PartialEq, Eq)]
enum SequenceCheck {
    InOrder,
    Duplicate,
    Gap { expected: u64 },
}

/// Dispatch sequence bookkeeping for one connection
#[derive(Debug, Default, Clone, Copy)]
struct SequenceTracker {
    last: Option<u64>,
}

impl SequenceTracker {
    fn starting_at(last: Option<u64>) -> Self {
        Self { last }
    }

    fn last(&self) -> Option<u64> {
        self.last
    }

    fn observe(&mut self, sequence: u64) -> SequenceCheck {
        match self.last {
            Some(last) if sequence <= last => SequenceCheck::Duplicate,
            Some(last) if sequence > last + 1 => SequenceCheck::Gap { expected: last + 1 },
            _ => {
                self.last = Some(sequence);
                SequenceCheck::InOrder
            }
        }
    }
}

/// Runs one shard: connects, authenticates, heartbeats and reconnects
pub(crate) struct ShardSession {
    shard: ShardInfo,
    ctx: SessionContext,
    presence: Option<Value>,
    status: Arc<SessionStatus>,
    command_rx: mpsc::Receiver<SessionCommand>,
    events_tx: mpsc::UnboundedSender<GatewayEvent>,
    session: Option<SessionInfo>,
    resume_url: Option<Url>,
    sequence: SequenceTracker,
    attempt: u32,
    auth_failures: u32,
    has_connected: bool,
    pending: Vec<OutboundPayload>,
}

impl ShardSession {
    pub(crate) fn new(
        shard: ShardInfo,
        ctx: SessionContext,
        presence: Option<Value>,
        resume: Option<SessionInfo>,
        status: Arc<SessionStatus>,
        command_rx: mpsc::Receiver<SessionCommand>,
        events_tx: mpsc::UnboundedSender<GatewayEvent>,
    ) -> Self {
        status.set_session(resume.as_ref());
        Self {
            shard,
            ctx,
            presence,
            status,
            command_rx,
            events_tx,
            session: resume,
            resume_url: None,
            sequence: SequenceTracker::default(),
            attempt: 0,
            auth_failures: 0,
            has_connected: false,
            pending: Vec::new(),
        }
    }

    /// Run the session until it is closed or gives up.
    ///
    /// The last lifecycle event emitted is always `Disconnected` or
    /// `DisconnectedResumable`.
    pub(crate) async fn run(mut self) -> Result<(), Error> {
        let index = self.shard.index();

        loop {
            if self.ctx.close.is_cancelled() {
                self.emit(LifecycleState::Disconnected);
                return Ok(());
            }

            self.emit(LifecycleState::Connecting {
                attempt: self.attempt,
            });

            let outcome = self.connect_and_run().await;
            self.status.connected.store(false, Ordering::Release);
            self.ctx.metrics.shard_disconnected(index);

            let (last_error, resumable) = match outcome {
                Ok(SessionEnd::Closed { allow_resume }) => {
                    self.finish_closed(allow_resume);
                    return Ok(());
                }
                Ok(SessionEnd::Reconnect { resumable, reason }) => {
                    info!("[SHARD-{}] Reconnecting: {}", index, reason);
                    (reason.to_string(), resumable)
                }
                Err(e) => {
                    self.ctx.metrics.record_error();
                    match e.kind() {
                        ErrorKind::ShuttingDown => {
                            self.emit(LifecycleState::Disconnected);
                            return Ok(());
                        }
                        ErrorKind::Fatal | ErrorKind::Configuration => {
                            error!("[SHARD-{}] Gateway refused the session: {}", index, e);
                            self.clear_session();
                            self.emit(LifecycleState::Disconnected);
                            return Err(e);
                        }
                        ErrorKind::Authentication => {
                            self.auth_failures += 1;
                            self.clear_session();
                            if self.auth_failures >= self.ctx.reconnect.max_authentication_failures {
                                error!(
                                    "[SHARD-{}] Giving up after {} authentication failures: {}",
                                    index, self.auth_failures, e
                                );
                                self.emit(LifecycleState::Disconnected);
                                return Err(e);
                            }
                            warn!(
                                "[SHARD-{}] Authentication failed ({} of {}): {}",
                                index,
                                self.auth_failures,
                                self.ctx.reconnect.max_authentication_failures,
                                e
                            );
                        }
                        _ => {
                            warn!(
                                "[SHARD-{}] Connection error: {} (attempt {})",
                                index,
                                e,
                                self.attempt + 1
                            );
                        }
                    }
                    let resumable = e.is_resumable();
                    (e.to_string(), resumable)
                }
            };

            if !resumable {
                self.clear_session();
            }

            self.attempt += 1;
            if self.attempt > self.ctx.reconnect.max_retries {
                error!(
                    "[SHARD-{}] Max reconnection attempts ({}) reached",
                    index, self.ctx.reconnect.max_retries
                );
                self.emit(LifecycleState::RetryFailed {
                    attempt: self.attempt - 1,
                    backoff: None,
                });
                self.clear_session();
                self.emit(LifecycleState::Disconnected);
                return Err(Error::ConnectionFailed {
                    attempts: self.attempt - 1,
                    last_error,
                });
            }

            let backoff = self.ctx.reconnect.delay_for_attempt(self.attempt - 1);
            if self.attempt == 1 {
                self.emit(LifecycleState::RetryStarted {
                    backoff,
                    resumable: self.session.is_some(),
                });
            } else {
                self.emit(LifecycleState::RetryFailed {
                    attempt: self.attempt - 1,
                    backoff: Some(backoff),
                });
            }
            self.ctx.metrics.record_reconnection();
            let attempt = self.attempt;
            self.ctx
                .metrics
                .update_shard(index, |s| s.reconnect_attempt = attempt);
            debug!(
                "[SHARD-{}] Reconnecting in {:?} (attempt {})",
                index, backoff, self.attempt
            );

            if !self.wait_backoff(backoff).await {
                return Ok(());
            }
        }
    }

    /// Sleep through the backoff while still honouring close requests.
    /// Returns false when the session ended during the wait.
    async fn wait_backoff(&mut self, backoff: Duration) -> bool {
        let deadline = Instant::now() + backoff;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return true,
                _ = self.ctx.close.cancelled() => {
                    self.emit(LifecycleState::Disconnected);
                    return false;
                }
                cmd = self.command_rx.recv() => match cmd {
                    Some(SessionCommand::Send(payload)) => self.queue(payload),
                    Some(SessionCommand::Close { allow_resume }) => {
                        self.finish_closed(allow_resume);
                        return false;
                    }
                    Some(SessionCommand::Reconnect) => return true,
                    None => {
                        self.finish_closed(false);
                        return false;
                    }
                },
            }
        }
    }

    /// Connect and run until disconnection
    async fn connect_and_run(&mut self) -> Result<SessionEnd, Error> {
        let index = self.shard.index();
        let url = self.connect_url();
        debug!(
            "[SHARD-{}] Connecting to {}",
            index,
            url.host_str().unwrap_or_default()
        );

        let connector = self.ctx.connector.clone();
        let transport = tokio::select! {
            result = timeout(self.ctx.connection.connect_timeout, connector.connect(&url)) => match result {
                Ok(Ok(transport)) => transport,
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(Error::ConnectionFailed {
                        attempts: self.attempt,
                        last_error: "Connection timeout".to_string(),
                    })
                }
            },
            _ = self.ctx.close.cancelled() => return Err(Error::ShuttingDown),
        };
        let GatewayTransport {
            mut sink,
            mut stream,
        } = transport;
        self.ctx.metrics.record_connection();

        let hello = tokio::select! {
            result = timeout(self.ctx.health.hello_timeout, read_hello(&mut stream)) => match result {
                Ok(hello) => hello?,
                Err(_) => return Err(Error::Protocol("no HELLO received".to_string())),
            },
            _ = self.ctx.close.cancelled() => {
                close_sink(&mut sink, CloseCode::Normal.into()).await;
                return Ok(SessionEnd::Closed { allow_resume: false });
            }
        };

        let period = Duration::from_millis(hello.heartbeat_interval.max(1));
        let mut heartbeat = Heartbeat::stopped();
        // Jitter the first beat so shards don't heartbeat in lockstep
        heartbeat.start(period, period.mul_f64(rand::random::<f64>()));
        let mut monitor = HeartbeatMonitor::new(&self.ctx.health);
        debug!("[SHARD-{}] HELLO received, heartbeat every {:?}", index, period);

        self.sequence = SequenceTracker::starting_at(self.session.as_ref().map(|s| s.sequence));

        let coordinator = self.ctx.coordinator.clone();
        let (shard, max_concurrency) = (self.shard, self.ctx.max_concurrency);
        let gate = async move { coordinator.acquire_identify(shard, max_concurrency).await };
        tokio::pin!(gate);

        let mut authenticated = false;
        let mut ready = false;

        let end = loop {
            tokio::select! {
                _ = self.ctx.close.cancelled() => {
                    info!("[SHARD-{}] Shutting down", index);
                    break SessionEnd::Closed { allow_resume: false };
                }

                acquired = &mut gate, if !authenticated => {
                    acquired?;
                    authenticated = true;
                    self.send_authentication(&mut sink).await?;
                }

                cmd = self.command_rx.recv() => match cmd {
                    Some(SessionCommand::Send(payload)) => {
                        if ready {
                            self.send_outbound(&mut sink, &payload).await?;
                        } else {
                            self.queue(payload);
                        }
                    }
                    Some(SessionCommand::Close { allow_resume }) => {
                        info!("[SHARD-{}] Received close command", index);
                        break SessionEnd::Closed { allow_resume };
                    }
                    Some(SessionCommand::Reconnect) => {
                        break SessionEnd::Reconnect {
                            resumable: true,
                            reason: "reconnect requested",
                        };
                    }
                    None => break SessionEnd::Closed { allow_resume: false },
                },

                msg = stream.next() => {
                    let message = match msg {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => return Err(Error::WebSocket(e)),
                        None => {
                            return Err(Error::Closed {
                                code: 1006,
                                reason: "stream ended".to_string(),
                            })
                        }
                    };

                    match message {
                        Message::Close(frame) => {
                            let err = close_error(frame);
                            info!("[SHARD-{}] {}", index, err);
                            return Err(err);
                        }
                        Message::Ping(data) => {
                            let _ = sink.send(Message::Pong(data)).await;
                        }
                        Message::Text(_) | Message::Binary(_) => {
                            let payload = match GatewayPayload::from_message(&message) {
                                Some(Ok(payload)) => payload,
                                Some(Err(e)) => {
                                    warn!("[SHARD-{}] Dropping undecodable frame: {}", index, e);
                                    continue;
                                }
                                None => continue,
                            };

                            match self.handle_payload(payload, &mut sink, &mut monitor).await? {
                                Flow::Continue => {}
                                Flow::Ready => {
                                    ready = true;
                                    self.flush_pending(&mut sink).await?;
                                }
                                Flow::End(end) => break end,
                            }
                        }
                        _ => {}
                    }
                }

                _ = heartbeat.tick() => {
                    if monitor.check_missed_ack() {
                        self.ctx.metrics.record_heartbeat_failure();
                        warn!(
                            "[SHARD-{}] Heartbeat not acknowledged ({} missed), reconnecting",
                            index,
                            monitor.missed()
                        );
                        return Err(Error::HeartbeatTimeout {
                            missed: monitor.missed(),
                        });
                    }
                    self.send_heartbeat(&mut sink, &mut monitor).await?;
                }
            }
        };

        heartbeat.stop();
        let code = match &end {
            SessionEnd::Closed {
                allow_resume: false,
            } => CloseCode::Normal.into(),
            _ => RESUMABLE_CLOSE_CODE,
        };
        close_sink(&mut sink, code).await;

        Ok(end)
    }

    async fn handle_payload(
        &mut self,
        payload: GatewayPayload,
        sink: &mut FrameSink,
        monitor: &mut HeartbeatMonitor,
    ) -> Result<Flow, Error> {
        let index = self.shard.index();

        match payload.opcode() {
            Some(Opcode::Dispatch) => self.handle_dispatch(payload),
            Some(Opcode::Heartbeat) => {
                trace!("[SHARD-{}] Heartbeat requested by gateway", index);
                self.send_heartbeat(sink, monitor).await?;
                Ok(Flow::Continue)
            }
            Some(Opcode::HeartbeatAck) => {
                monitor.record_ack();
                self.ctx.metrics.record_heartbeat_ack();
                if let Some(latency) = monitor.latency() {
                    self.status
                        .latency_ms
                        .store(latency.as_millis().max(1) as u64, Ordering::Relaxed);
                    self.ctx
                        .metrics
                        .update_shard(index, |s| s.latency = Some(latency));
                }
                Ok(Flow::Continue)
            }
            Some(Opcode::Reconnect) => Ok(Flow::End(SessionEnd::Reconnect {
                resumable: true,
                reason: "gateway requested reconnect",
            })),
            Some(Opcode::InvalidSession) => {
                if payload.d.as_bool().unwrap_or(false) {
                    Ok(Flow::End(SessionEnd::Reconnect {
                        resumable: true,
                        reason: "session invalidated (resumable)",
                    }))
                } else {
                    Err(Error::Authentication("session invalidated".to_string()))
                }
            }
            _ => {
                trace!("[SHARD-{}] Ignoring opcode {}", index, payload.op);
                Ok(Flow::Continue)
            }
        }
    }

    fn handle_dispatch(&mut self, payload: GatewayPayload) -> Result<Flow, Error> {
        let index = self.shard.index();

        if let Some(sequence) = payload.s {
            match self.sequence.observe(sequence) {
                SequenceCheck::InOrder => {}
                SequenceCheck::Duplicate => {
                    debug!("[SHARD-{}] Dropping duplicate dispatch {}", index, sequence);
                    return Ok(Flow::Continue);
                }
                SequenceCheck::Gap { expected } => {
                    warn!(
                        "[SHARD-{}] Sequence gap (expected {}, got {}), reconnecting",
                        index, expected, sequence
                    );
                    return Err(Error::SequenceGap {
                        expected,
                        received: sequence,
                    });
                }
            }
            if let Some(session) = self.session.as_mut() {
                session.sequence = sequence;
            }
            self.status.sequence.store(sequence, Ordering::Release);
            self.ctx
                .metrics
                .update_shard(index, |s| s.sequence = Some(sequence));
        }

        let name = payload.t.unwrap_or_default();
        let flow = match name.as_str() {
            "READY" => {
                let ready: Ready = serde_json::from_value(payload.d.clone())
                    .map_err(|e| Error::Protocol(format!("invalid READY: {}", e)))?;
                self.session = Some(SessionInfo {
                    session_id: ready.session_id,
                    sequence: payload.s.unwrap_or(0),
                });
                self.resume_url = ready
                    .resume_gateway_url
                    .as_deref()
                    .and_then(|url| gateway_url(url, &self.ctx.connection).ok());
                if let Some([_, count]) = ready.shard {
                    self.status.shard_count.store(count, Ordering::Release);
                }
                self.status.set_session(self.session.as_ref());
                Some(false)
            }
            "RESUMED" => Some(true),
            _ => None,
        };

        self.ctx.metrics.record_dispatch();
        let _ = self.events_tx.send(GatewayEvent::Dispatch(Dispatch {
            name,
            sequence: payload.s,
            data: payload.d,
        }));

        match flow {
            Some(resumed) => {
                self.on_ready(resumed);
                Ok(Flow::Ready)
            }
            None => Ok(Flow::Continue),
        }
    }

    fn on_ready(&mut self, resumed: bool) {
        let index = self.shard.index();
        if resumed {
            self.ctx.metrics.record_resume();
            info!("[SHARD-{}] Session resumed", index);
        } else {
            self.ctx.metrics.record_identify();
            info!("[SHARD-{}] Session ready", index);
        }

        self.status.connected.store(true, Ordering::Release);
        self.ctx.metrics.shard_connected(index);

        let state = if self.has_connected {
            LifecycleState::RetrySucceeded {
                attempts: self.attempt,
            }
        } else {
            LifecycleState::Connected
        };
        self.has_connected = true;
        self.attempt = 0;
        self.auth_failures = 0;
        self.emit(state);
    }

    async fn send_authentication(&mut self, sink: &mut FrameSink) -> Result<(), Error> {
        let index = self.shard.index();
        let payload = match &self.session {
            Some(session) => {
                info!(
                    "[SHARD-{}] Resuming session at sequence {}",
                    index, session.sequence
                );
                GatewayPayload::resume(&Resume {
                    token: self.ctx.token.clone(),
                    session_id: session.session_id.clone(),
                    seq: session.sequence,
                })
            }
            None => {
                info!("[SHARD-{}] Identifying as shard {}", index, self.shard);
                GatewayPayload::identify(&Identify {
                    token: self.ctx.token.clone(),
                    properties: self.ctx.identify.properties.clone(),
                    shard: [index, self.shard.count()],
                    intents: self.ctx.identify.intents,
                    presence: self.presence.clone(),
                })
            }
        };
        self.send_payload(sink, &payload).await
    }

    async fn send_heartbeat(
        &self,
        sink: &mut FrameSink,
        monitor: &mut HeartbeatMonitor,
    ) -> Result<(), Error> {
        self.send_payload(sink, &GatewayPayload::heartbeat(self.sequence.last()))
            .await?;
        monitor.record_sent();
        self.ctx.metrics.record_heartbeat();
        Ok(())
    }

    async fn send_payload(&self, sink: &mut FrameSink, payload: &GatewayPayload) -> Result<(), Error> {
        let message = payload
            .to_message()
            .map_err(|e| Error::Protocol(format!("failed to encode frame: {}", e)))?;
        sink.send(message).await?;
        self.ctx.metrics.record_message_sent();
        Ok(())
    }

    async fn send_outbound(&self, sink: &mut FrameSink, payload: &OutboundPayload) -> Result<(), Error> {
        let message = payload
            .to_message()
            .map_err(|e| Error::Protocol(format!("failed to encode frame: {}", e)))?;
        sink.send(message).await?;
        self.ctx.metrics.record_message_sent();
        Ok(())
    }

    async fn flush_pending(&mut self, sink: &mut FrameSink) -> Result<(), Error> {
        if self.pending.is_empty() {
            return Ok(());
        }
        debug!(
            "[SHARD-{}] Sending {} queued frames",
            self.shard.index(),
            self.pending.len()
        );
        for payload in std::mem::take(&mut self.pending) {
            self.send_outbound(sink, &payload).await?;
        }
        Ok(())
    }

    fn queue(&mut self, payload: OutboundPayload) {
        if self.pending.len() >= self.ctx.connection.command_buffer {
            warn!(
                "[SHARD-{}] Outbound queue full, dropping frame (op {})",
                self.shard.index(),
                payload.payload.op
            );
            return;
        }
        self.pending.push(payload);
    }

    fn finish_closed(&mut self, allow_resume: bool) {
        let index = self.shard.index();
        match (allow_resume, self.session.clone()) {
            (true, Some(session)) => {
                info!("[SHARD-{}] Closed, session kept for resuming", index);
                self.emit(LifecycleState::DisconnectedResumable { session });
            }
            _ => {
                info!("[SHARD-{}] Connection closed gracefully", index);
                self.clear_session();
                self.emit(LifecycleState::Disconnected);
            }
        }
    }

    fn clear_session(&mut self) {
        self.session = None;
        self.resume_url = None;
        self.status.set_session(None);
    }

    fn connect_url(&self) -> Url {
        match (&self.session, &self.resume_url) {
            (Some(_), Some(url)) => url.clone(),
            _ => self.ctx.url.clone(),
        }
    }

    fn emit(&self, state: LifecycleState) {
        debug!("[SHARD-{}] {:?}", self.shard.index(), state);
        let _ = self.events_tx.send(GatewayEvent::StateChange(state));
    }
}

async fn read_hello(stream: &mut FrameStream) -> Result<Hello, Error> {
    while let Some(message) = stream.next().await {
        let message = message?;
        if let Message::Close(frame) = message {
            return Err(close_error(frame));
        }

        match GatewayPayload::from_message(&message) {
            Some(Ok(payload)) if payload.opcode() == Some(Opcode::Hello) => {
                return serde_json::from_value(payload.d)
                    .map_err(|e| Error::Protocol(format!("invalid HELLO: {}", e)));
            }
            Some(Ok(payload)) => trace!("Ignoring opcode {} before HELLO", payload.op),
            Some(Err(e)) => return Err(Error::Protocol(format!("undecodable frame: {}", e))),
            None => {}
        }
    }

    Err(Error::Closed {
        code: 1006,
        reason: "stream ended before HELLO".to_string(),
    })
}

fn close_error(frame: Option<CloseFrame>) -> Error {
    match frame {
        Some(frame) => Error::Closed {
            code: frame.code.into(),
            reason: frame.reason.to_string(),
        },
        None => Error::Closed {
            code: 1005,
            reason: String::new(),
        },
    }
}

async fn close_sink(sink: &mut FrameSink, code: u16) {
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: "".into(),
    };
    let _ = sink.send(Message::Close(Some(frame))).await;
    let _ = sink.close().await;
}
