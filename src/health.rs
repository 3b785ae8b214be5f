use crate::config::HealthConfig;
use tokio::time::{interval_at, Duration, Instant, Interval, MissedTickBehavior};

/// Tracks heartbeat acknowledgements for a single connection
#[derive(Debug)]
pub struct HeartbeatMonitor {
    max_missed: u32,

    /// Time of last heartbeat sent
    last_sent: Option<Instant>,

    /// Time of last ACK received
    last_ack: Option<Instant>,

    /// Heartbeats in a row that were never acknowledged
    missed: u32,

    /// Whether we're currently waiting for an ACK
    awaiting_ack: bool,

    /// Round trip of the last acknowledged heartbeat
    latency: Option<Duration>,
}

impl HeartbeatMonitor {
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            max_missed: config.max_missed_heartbeat_acks.max(1),
            last_sent: None,
            last_ack: None,
            missed: 0,
            awaiting_ack: false,
            latency: None,
        }
    }

    pub fn record_sent(&mut self) {
        self.last_sent = Some(Instant::now());
        self.awaiting_ack = true;
    }

    pub fn record_ack(&mut self) {
        let now = Instant::now();
        if let Some(sent) = self.last_sent {
            self.latency = Some(now.saturating_duration_since(sent));
        }
        self.last_ack = Some(now);
        self.missed = 0;
        self.awaiting_ack = false;
    }

    /// Call before sending the next heartbeat.
    ///
    /// Counts the previous heartbeat as missed if it was never acknowledged
    /// and returns true once the connection should be treated as dead.
    pub fn check_missed_ack(&mut self) -> bool {
        if self.awaiting_ack {
            self.missed += 1;
        }
        self.missed >= self.max_missed
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }

    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    pub fn last_ack(&self) -> Option<Instant> {
        self.last_ack
    }
}

/// Heartbeat timer owned by one session.
///
/// Stopped until HELLO provides the interval; `tick` never resolves while
/// stopped, so it can sit in a `select!` unconditionally.
#[derive(Debug, Default)]
pub struct Heartbeat {
    interval: Option<Interval>,
}

impl Heartbeat {
    pub fn stopped() -> Self {
        Self::default()
    }

    /// Start ticking every `period`, the first tick after `first_delay`
    pub fn start(&mut self, period: Duration, first_delay: Duration) {
        let mut interval = interval_at(Instant::now() + first_delay, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.interval = Some(interval);
    }

    pub fn stop(&mut self) {
        self.interval = None;
    }

    pub fn is_running(&self) -> bool {
        self.interval.is_some()
    }

    pub async fn tick(&mut self) {
        match self.interval.as_mut() {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}
