use crate::payload::IdentifyProperties;
use std::fmt;
use std::time::Duration;

/// Default identify window: one authentication per bucket every 6 seconds
pub const DEFAULT_IDENTIFY_WINDOW: Duration = Duration::from_secs(6);

/// Configuration for the shard manager
#[derive(Clone)]
pub struct GatewayConfig {
    /// Bot token sent in IDENTIFY/RESUME and used for discovery
    pub token: String,
    /// Connection-related settings
    pub connection: ConnectionConfig,
    /// Backoff settings for reconnection and discovery
    pub reconnect: ReconnectConfig,
    /// Heartbeat settings
    pub health: HealthConfig,
    /// Fields sent with every IDENTIFY
    pub identify: IdentifyConfig,
    /// Minimum gap between two authentications in the same concurrency bucket
    pub identify_window: Duration,
    /// Wait for every shard before `login` returns.
    /// `None` waits only when a single shard is connected.
    pub await_connections: Option<bool>,
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("token", &"***")
            .field("connection", &self.connection)
            .field("reconnect", &self.reconnect)
            .field("health", &self.health)
            .field("identify", &self.identify)
            .field("identify_window", &self.identify_window)
            .field("await_connections", &self.await_connections)
            .finish()
    }
}

impl GatewayConfig {
    /// Create a new builder for configuration
    pub fn builder(token: impl Into<String>) -> GatewayConfigBuilder {
        GatewayConfigBuilder {
            config: GatewayConfig {
                token: token.into(),
                connection: ConnectionConfig::default(),
                reconnect: ReconnectConfig::default(),
                health: HealthConfig::default(),
                identify: IdentifyConfig::default(),
                identify_window: DEFAULT_IDENTIFY_WINDOW,
                await_connections: None,
            },
        }
    }
}

/// Builder for GatewayConfig
#[derive(Debug, Clone)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    /// Set connection configuration
    pub fn connection(mut self, config: ConnectionConfig) -> Self {
        self.config.connection = config;
        self
    }

    /// Set reconnect configuration
    pub fn reconnect(mut self, config: ReconnectConfig) -> Self {
        self.config.reconnect = config;
        self
    }

    /// Set health configuration
    pub fn health(mut self, config: HealthConfig) -> Self {
        self.config.health = config;
        self
    }

    /// Set identify configuration
    pub fn identify(mut self, config: IdentifyConfig) -> Self {
        self.config.identify = config;
        self
    }

    /// Set the per-bucket identify window
    pub fn identify_window(mut self, window: Duration) -> Self {
        self.config.identify_window = window;
        self
    }

    /// Wait for every shard to connect (or give up) before `login` returns
    pub fn await_connections(mut self, enabled: bool) -> Self {
        self.config.await_connections = Some(enabled);
        self
    }

    /// Use a fixed gateway URL when discovery is unavailable
    pub fn gateway_url(mut self, url: impl Into<String>) -> Self {
        self.config.connection.gateway_url = Some(url.into());
        self
    }

    /// Build the configuration with validation.
    ///
    /// Returns an error for invalid configurations (e.g., empty token,
    /// zero identify window, inverted backoff bounds).
    pub fn build(self) -> Result<GatewayConfig, ConfigError> {
        let config = self.config;

        if config.token.trim().is_empty() {
            return Err(ConfigError::MissingToken);
        }

        if config.reconnect.max_backoff < config.reconnect.first_backoff {
            return Err(ConfigError::InvalidBackoff(
                "max_backoff must be >= first_backoff".to_string(),
            ));
        }

        if config.reconnect.multiplier <= 0.0 {
            return Err(ConfigError::InvalidBackoff(
                "multiplier must be > 0".to_string(),
            ));
        }

        if config.reconnect.max_authentication_failures == 0 {
            return Err(ConfigError::InvalidBackoff(
                "max_authentication_failures must be >= 1".to_string(),
            ));
        }

        if config.health.max_missed_heartbeat_acks == 0 {
            return Err(ConfigError::InvalidHealth(
                "max_missed_heartbeat_acks must be >= 1".to_string(),
            ));
        }

        if config.health.hello_timeout.is_zero() || config.connection.connect_timeout.is_zero() {
            return Err(ConfigError::InvalidHealth(
                "timeouts must be non-zero".to_string(),
            ));
        }

        if config.identify_window.is_zero() {
            return Err(ConfigError::InvalidIdentifyWindow);
        }

        if config.connection.command_buffer == 0 {
            return Err(ConfigError::InvalidConnection(
                "command_buffer cannot be 0".to_string(),
            ));
        }

        Ok(config)
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// No token configured
    #[error("A gateway token is required")]
    MissingToken,
    /// Invalid backoff configuration
    #[error("Invalid backoff configuration: {0}")]
    InvalidBackoff(String),
    /// Invalid health configuration
    #[error("Invalid health configuration: {0}")]
    InvalidHealth(String),
    /// Invalid connection configuration
    #[error("Invalid connection configuration: {0}")]
    InvalidConnection(String),
    /// Invalid shard count
    #[error("Invalid shard count: {0}")]
    InvalidShardCount(String),
    /// Shard index outside `0..count`
    #[error("Invalid shard index {index} for shard count {count}")]
    InvalidShardIndex { index: u32, count: u32 },
    /// Concurrency factor must be a power of two
    #[error("Invalid concurrency factor {0}: must be a power of two >= 1")]
    InvalidConcurrency(u32),
    /// Identify window must be non-zero
    #[error("Identify window must be greater than zero")]
    InvalidIdentifyWindow,
    /// Malformed URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

/// Connection-related configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Timeout for establishing a connection
    pub connect_timeout: Duration,
    /// Gateway URL used when discovery is skipped or unavailable
    pub gateway_url: Option<String>,
    /// REST base used by HTTP discovery
    pub api_base: String,
    /// Gateway protocol version (`v` query parameter)
    pub version: u8,
    /// Payload encoding (`encoding` query parameter)
    pub encoding: String,
    /// Transport compression (`compress` query parameter).
    /// The built-in frame decoder only understands uncompressed JSON.
    pub compression: Option<String>,
    /// User-Agent header sent on the WebSocket handshake
    pub user_agent: String,
    /// Buffered outbound commands per shard
    pub command_buffer: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            gateway_url: None,
            api_base: "https://discord.com/api/v10".to_string(),
            version: 10,
            encoding: "json".to_string(),
            compression: None,
            user_agent: concat!(
                "DiscordBot (https://github.com/gateway-shard-manager, ",
                env!("CARGO_PKG_VERSION"),
                ")"
            )
            .to_string(),
            command_buffer: 100,
        }
    }
}

/// Backoff configuration for reconnection
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt
    pub first_backoff: Duration,
    /// Maximum delay between reconnection attempts
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff (typically 2.0)
    pub multiplier: f64,
    /// Whether to add random jitter to delays
    pub jitter: bool,
    /// Reconnection attempts before a shard gives up
    pub max_retries: u32,
    /// Consecutive authentication failures before a shard gives up
    pub max_authentication_failures: u32,
    /// Discovery attempts before `login` fails
    pub max_discovery_retries: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            first_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(120),
            multiplier: 2.0,
            jitter: true, // Full jitter
            max_retries: u32::MAX,
            max_authentication_failures: 3,
            max_discovery_retries: 5,
        }
    }
}

impl ReconnectConfig {
    /// Calculate the delay for a given attempt number (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay = self.first_backoff.as_millis() as f64
            * self.multiplier.powi(attempt.min(64) as i32);
        let capped_delay = base_delay.min(self.max_backoff.as_millis() as f64);

        if self.jitter {
            // Full jitter: random value between 0 and capped_delay
            let jittered = rand::random::<f64>() * capped_delay;
            Duration::from_millis(jittered as u64)
        } else {
            Duration::from_millis(capped_delay as u64)
        }
    }
}

/// Heartbeat configuration
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Timeout for receiving HELLO after connecting
    pub hello_timeout: Duration,
    /// Unacknowledged heartbeats tolerated before the connection is a zombie
    pub max_missed_heartbeat_acks: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            hello_timeout: Duration::from_secs(20),
            max_missed_heartbeat_acks: 1,
        }
    }
}

/// Fields sent with every IDENTIFY
#[derive(Debug, Clone, Default)]
pub struct IdentifyConfig {
    /// Gateway intents bitset; omitted when `None`
    pub intents: Option<u64>,
    /// Connection properties
    pub properties: IdentifyProperties,
}
