use crate::config::ConfigError;
use crate::payload::CloseBehavior;
use thiserror::Error;

/// Categorizes errors for retry and propagation decisions.
///
/// This is a lightweight, copyable view of [`Error`] used by the session
/// retry loop and by callers that only care about the failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid setup; never retried
    Configuration,
    /// Endpoint or shard-count lookup failed
    Discovery,
    /// Connection drop, heartbeat timeout or similar; retried with backoff
    Transient,
    /// Bad token or invalidated session; forces a fresh identify
    Authentication,
    /// The gateway refused the session permanently
    Fatal,
    /// A single event could not be handed to the dispatcher
    Dispatch,
    /// Cache backend failure
    Store,
    /// The manager is shutting down
    ShuttingDown,
}

/// Errors that can occur in gateway-shard-manager
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// Gateway discovery failed
    #[error("Gateway discovery failed: {0}")]
    Discovery(String),

    /// WebSocket protocol error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Connection failed after all retry attempts
    #[error("Connection failed after {attempts} attempts: {last_error}")]
    ConnectionFailed { attempts: u32, last_error: String },

    /// The gateway closed the connection
    #[error("Gateway closed the connection with code {code}: {reason}")]
    Closed { code: u16, reason: String },

    /// Heartbeats went unacknowledged
    #[error("Missed {missed} heartbeat acknowledgements")]
    HeartbeatTimeout { missed: u32 },

    /// Dispatch sequence jumped ahead
    #[error("Sequence gap: expected {expected}, received {received}")]
    SequenceGap { expected: u64, received: u64 },

    /// Authentication rejected or session invalidated
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Unexpected frame or handshake problem
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Event dispatch failed
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// Store backend failed
    #[error("Store error: {0}")]
    Store(String),

    /// Manager is shutting down
    #[error("Gateway is shutting down")]
    ShuttingDown,

    /// Channel send error
    #[error("Channel send error: {0}")]
    ChannelSend(String),
}

impl Error {
    /// Get the kind of this error for decision-making.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_) => ErrorKind::Configuration,
            Error::Discovery(_) => ErrorKind::Discovery,
            Error::Closed { code, .. } => match CloseBehavior::from_code(*code) {
                CloseBehavior::Authentication => ErrorKind::Authentication,
                CloseBehavior::Fatal => ErrorKind::Fatal,
                CloseBehavior::Resume | CloseBehavior::Reconnect => ErrorKind::Transient,
            },
            Error::Authentication(_) => ErrorKind::Authentication,
            Error::Dispatch(_) => ErrorKind::Dispatch,
            Error::Store(_) => ErrorKind::Store,
            Error::ShuttingDown => ErrorKind::ShuttingDown,
            Error::WebSocket(_)
            | Error::ConnectionFailed { .. }
            | Error::HeartbeatTimeout { .. }
            | Error::SequenceGap { .. }
            | Error::Protocol(_)
            | Error::ChannelSend(_) => ErrorKind::Transient,
        }
    }

    /// Whether the session that produced this error may be resumed.
    ///
    /// Only meaningful for transient errors; everything else forces a
    /// fresh identify or ends the shard.
    pub fn is_resumable(&self) -> bool {
        match self {
            Error::Closed { code, .. } => CloseBehavior::from_code(*code) == CloseBehavior::Resume,
            Error::SequenceGap { .. } => false,
            other => other.kind() == ErrorKind::Transient,
        }
    }
}
