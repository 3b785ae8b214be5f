//! # gateway-shard-manager
//!
//! Runs sharded, resumable sessions against a push gateway.
//!
//! ## Features
//!
//! - **Sharding** with recommended or fixed counts, index filters and a
//!   single-connection mode
//! - **Identify rate limiting** per concurrency bucket (one IDENTIFY per
//!   bucket every 6 seconds by default)
//! - **Resume** across reconnects and across logins through the
//!   [`ShardCoordinator`]
//! - **Auto-reconnection** with exponential backoff and full jitter
//! - **Cache invalidation** of the keys each shard wrote when it goes away
//! - **Metrics** for observability
//!
//! ## Example
//!
//! ```ignore
//! use gateway_shard_manager::{GatewayConfig, ShardManager, ShardingStrategy};
//!
//! let config = GatewayConfig::builder(token).build()?;
//! let manager = ShardManager::builder(config)
//!     .sharding(ShardingStrategy::recommended())
//!     .build()?;
//!
//! let mut events = manager.subscribe().unwrap();
//! let gateway = manager.login().await?;
//!
//! while let Ok(event) = events.recv().await {
//!     println!("[{}] {:?}", event.shard, event.event);
//! }
//! ```

mod config;
mod connection;
mod coordinator;
mod discovery;
mod dispatch;
mod error;
mod group;
mod health;
mod limiter;
mod manager;
mod metrics;
mod payload;
mod shard;
mod store;
mod transport;

#[cfg(test)]
mod test_support;

pub use config::{
    ConfigError, ConnectionConfig, GatewayConfig, GatewayConfigBuilder, HealthConfig,
    IdentifyConfig, ReconnectConfig, DEFAULT_IDENTIFY_WINDOW,
};
pub use connection::SessionStatus;
pub use coordinator::{LocalShardCoordinator, ShardCoordinator};
pub use discovery::{GatewayDiscovery, GatewayInfo, HttpDiscovery, StaticDiscovery};
pub use dispatch::{
    BroadcastDispatcher, Dispatch, EventDispatcher, GatewayEvent, LifecycleState, ShardEvent,
};
pub use error::{Error, ErrorKind};
pub use group::{GatewayClientGroup, ShardHandle, ShardingGroup, SingleGroup};
pub use health::{Heartbeat, HeartbeatMonitor};
pub use limiter::IdentifyLimiter;
pub use manager::{
    DestroyHandler, Gateway, PresenceProvider, ResumeProvider, ShardManager, ShardManagerBuilder,
    DEFAULT_GATEWAY_URL,
};
pub use metrics::{Metrics, MetricsSnapshot, ShardMetrics};
pub use payload::{
    CloseBehavior, GatewayPayload, Hello, Identify, IdentifyProperties, Opcode, OutboundPayload,
    Ready, Resume,
};
pub use shard::{
    GroupKind, SessionInfo, ShardCount, ShardInfo, ShardingStrategy, ShardingStrategyBuilder,
};
pub use store::{
    Invalidation, InvalidationStrategy, KeyStore, KeyStoreRegistry, LocalKeyStore, MemoryStore,
    ShardAwareStore, Store, TrackedStore,
};
pub use transport::{
    gateway_url, FrameSink, FrameStream, GatewayConnector, GatewayTransport, WebSocketConnector,
};

/// Result type for gateway-shard-manager operations
pub type Result<T> = std::result::Result<T, Error>;
