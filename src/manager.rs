use crate::config::{ConfigError, GatewayConfig};
use crate::connection::{SessionContext, SessionStatus, ShardSession};
use crate::coordinator::{LocalShardCoordinator, ShardCoordinator};
use crate::discovery::{GatewayDiscovery, GatewayInfo, HttpDiscovery, StaticDiscovery};
use crate::dispatch::{
    BroadcastDispatcher, EventDispatcher, GatewayEvent, LifecycleState, ShardEvent,
};
use crate::error::{Error, ErrorKind};
use crate::group::{GatewayClientGroup, ShardHandle, ShardingGroup, SingleGroup};
use crate::metrics::Metrics;
use crate::payload::GatewayPayload;
use crate::shard::{GroupKind, SessionInfo, ShardCount, ShardInfo, ShardingStrategy};
use crate::store::Invalidation;
use crate::transport::{gateway_url, GatewayConnector, WebSocketConnector};
use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Used when discovery is unavailable and the shard count is fixed
pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg";

/// Runs once after the last shard has disconnected
pub type DestroyHandler = Arc<dyn Fn() -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;

/// Initial presence sent with IDENTIFY
pub type PresenceProvider = Arc<dyn Fn(ShardInfo) -> Option<Value> + Send + Sync>;

/// Session to resume instead of identifying
pub type ResumeProvider = Arc<dyn Fn(ShardInfo) -> Option<SessionInfo> + Send + Sync>;

/// Starts and supervises the shards of one gateway login.
///
/// # Thread Safety
///
/// `ShardManager` is `Send + Sync`. Each call to [`login`](Self::login)
/// produces an independent [`Gateway`] with its own close token and
/// client group; the coordinator, dispatcher and metrics are shared.
pub struct ShardManager {
    config: GatewayConfig,
    sharding: ShardingStrategy,
    discovery: Arc<dyn GatewayDiscovery>,
    connector: Arc<dyn GatewayConnector>,
    coordinator: Arc<dyn ShardCoordinator>,
    dispatcher: Arc<dyn EventDispatcher>,
    broadcast: Option<Arc<BroadcastDispatcher>>,
    invalidation: Arc<Invalidation>,
    destroy: Option<DestroyHandler>,
    presence: Option<PresenceProvider>,
    resume: Option<ResumeProvider>,
    metrics: Arc<Metrics>,
}

/// Builder for [`ShardManager`]; every collaborator has a default.
pub struct ShardManagerBuilder {
    config: GatewayConfig,
    sharding: ShardingStrategy,
    discovery: Option<Arc<dyn GatewayDiscovery>>,
    connector: Option<Arc<dyn GatewayConnector>>,
    coordinator: Option<Arc<dyn ShardCoordinator>>,
    dispatcher: Option<Arc<dyn EventDispatcher>>,
    invalidation: Option<Arc<Invalidation>>,
    destroy: Option<DestroyHandler>,
    presence: Option<PresenceProvider>,
    resume: Option<ResumeProvider>,
}

impl ShardManagerBuilder {
    pub fn sharding(mut self, strategy: ShardingStrategy) -> Self {
        self.sharding = strategy;
        self
    }

    pub fn discovery(mut self, discovery: Arc<dyn GatewayDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn GatewayConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn coordinator(mut self, coordinator: Arc<dyn ShardCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    /// Replace the default broadcast dispatcher
    pub fn dispatcher(mut self, dispatcher: Arc<dyn EventDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn invalidation(mut self, invalidation: Arc<Invalidation>) -> Self {
        self.invalidation = Some(invalidation);
        self
    }

    /// Run `handler` once all shards are gone. The default shuts the
    /// dispatcher down.
    pub fn destroy_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        self.destroy = Some(Arc::new(move || handler().boxed()));
        self
    }

    pub fn presence<F>(mut self, provider: F) -> Self
    where
        F: Fn(ShardInfo) -> Option<Value> + Send + Sync + 'static,
    {
        self.presence = Some(Arc::new(provider));
        self
    }

    pub fn resume<F>(mut self, provider: F) -> Self
    where
        F: Fn(ShardInfo) -> Option<SessionInfo> + Send + Sync + 'static,
    {
        self.resume = Some(Arc::new(provider));
        self
    }

    pub fn build(self) -> Result<ShardManager, ConfigError> {
        let discovery: Arc<dyn GatewayDiscovery> = match self.discovery {
            Some(discovery) => discovery,
            None => Arc::new(HttpDiscovery::new(
                &self.config.connection.api_base,
                self.config.token.clone(),
            )?),
        };

        let connector = self.connector.unwrap_or_else(|| {
            Arc::new(WebSocketConnector::new(self.config.connection.user_agent.clone()))
        });

        let coordinator = self.coordinator.unwrap_or_else(|| {
            Arc::new(LocalShardCoordinator::new(self.config.identify_window))
        });

        let (dispatcher, broadcast): (Arc<dyn EventDispatcher>, _) = match self.dispatcher {
            Some(dispatcher) => (dispatcher, None),
            None => {
                let broadcast = Arc::new(BroadcastDispatcher::default());
                (broadcast.clone(), Some(broadcast))
            }
        };

        Ok(ShardManager {
            config: self.config,
            sharding: self.sharding,
            discovery,
            connector,
            coordinator,
            dispatcher,
            broadcast,
            invalidation: self.invalidation.unwrap_or_default(),
            destroy: self.destroy,
            presence: self.presence,
            resume: self.resume,
            metrics: Arc::new(Metrics::new()),
        })
    }
}

impl ShardManager {
    pub fn builder(config: GatewayConfig) -> ShardManagerBuilder {
        ShardManagerBuilder {
            config,
            sharding: ShardingStrategy::default(),
            discovery: None,
            connector: None,
            coordinator: None,
            dispatcher: None,
            invalidation: None,
            destroy: None,
            presence: None,
            resume: None,
        }
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn invalidation(&self) -> &Arc<Invalidation> {
        &self.invalidation
    }

    /// Subscribe to the default dispatcher. `None` when a custom
    /// dispatcher was configured or the default one was shut down.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<ShardEvent>> {
        self.broadcast.as_ref().and_then(|b| b.subscribe())
    }

    /// Connect every shard selected by the sharding strategy.
    ///
    /// # Errors
    ///
    /// Fails only for configuration errors or when gateway discovery
    /// keeps failing. Shard-level failures are reported through the
    /// dispatcher as lifecycle events.
    pub async fn login(&self) -> Result<Gateway, Error> {
        let info = self.resolve_gateway().await?;
        let discovery = StaticDiscovery::new(info.clone());

        let count = self.sharding.resolve_shard_count(&discovery).await?;
        let factor = self.sharding.max_concurrency(&discovery).await?;
        let base = self
            .config
            .connection
            .gateway_url
            .as_deref()
            .unwrap_or(&info.url);
        let url = gateway_url(base, &self.config.connection)?;

        let shards = self.sharding.shards_to_connect(count);
        if shards.is_empty() {
            return Err(ConfigError::InvalidShardCount(format!(
                "no shards selected out of {}",
                count
            ))
            .into());
        }

        // Every session past the first would replace the previous one in
        // a single group and escape logout
        if self.sharding.group_kind() == GroupKind::Single && shards.len() > 1 {
            return Err(ConfigError::InvalidShardCount(format!(
                "a single group holds exactly one shard, {} selected",
                shards.len()
            ))
            .into());
        }

        info!(
            "Starting {} of {} shards (max concurrency {})",
            shards.len(),
            count,
            factor
        );

        let group: Arc<dyn GatewayClientGroup> = match self.sharding.group_kind() {
            GroupKind::Sharding => Arc::new(ShardingGroup::new(count)),
            GroupKind::Single => Arc::new(SingleGroup::new()),
        };
        let close = CancellationToken::new();

        let lifecycle = Arc::new(Lifecycle {
            coordinator: self.coordinator.clone(),
            invalidation: self.invalidation.clone(),
            group,
            dispatcher: self.dispatcher.clone(),
            metrics: self.metrics.clone(),
            destroy: self.destroy_handler(),
            pending: AtomicUsize::new(shards.len()),
            destroyed: AtomicBool::new(false),
            destroy_done: CancellationToken::new(),
        });

        let launcher = Arc::new(Launcher {
            ctx: SessionContext {
                token: self.config.token.clone(),
                url,
                max_concurrency: factor,
                connection: self.config.connection.clone(),
                reconnect: self.config.reconnect.clone(),
                health: self.config.health.clone(),
                identify: self.config.identify.clone(),
                connector: self.connector.clone(),
                coordinator: self.coordinator.clone(),
                metrics: self.metrics.clone(),
                close: close.clone(),
            },
            lifecycle: lifecycle.clone(),
            presence: self.presence.clone(),
            resume: self.resume.clone(),
        });

        let mut buckets: BTreeMap<u32, Vec<ShardInfo>> = BTreeMap::new();
        for shard in shards {
            buckets.entry(shard.bucket(factor)).or_default().push(shard);
        }

        let (started_tx, mut started_rx) = mpsc::unbounded_channel::<u32>();
        let tasks: Vec<_> = buckets
            .into_iter()
            .map(|(bucket, shards)| {
                let launcher = launcher.clone();
                let started = started_tx.clone();
                tokio::spawn(async move { launcher.run_bucket(bucket, shards, started).await })
            })
            .collect();
        drop(started_tx);

        let await_all = self.config.await_connections.unwrap_or(count == 1);
        if await_all {
            for result in join_all(tasks).await {
                if let Err(e) = result {
                    error!("Shard launcher task failed: {}", e);
                }
            }
        } else if let Some(index) = started_rx.recv().await {
            debug!("[SHARD-{}] First shard resolved, login complete", index);
        }

        Ok(Gateway {
            inner: Arc::new(GatewayInner {
                lifecycle,
                close,
                shard_count: count,
                broadcast: self.broadcast.clone(),
            }),
        })
    }

    fn destroy_handler(&self) -> DestroyHandler {
        match &self.destroy {
            Some(handler) => handler.clone(),
            None => {
                let dispatcher = self.dispatcher.clone();
                Arc::new(move || {
                    let dispatcher = dispatcher.clone();
                    async move {
                        dispatcher.shutdown();
                        Ok(())
                    }
                    .boxed()
                })
            }
        }
    }

    async fn resolve_gateway(&self) -> Result<GatewayInfo, Error> {
        let fixed = match self.sharding.count() {
            ShardCount::Fixed(count) => Some(count),
            ShardCount::Recommended => None,
        };
        let configured_url = self.config.connection.gateway_url.clone();

        // Nothing left to ask the remote for
        if let (Some(count), Some(factor), Some(url)) =
            (fixed, self.sharding.factor(), configured_url.clone())
        {
            return Ok(GatewayInfo {
                url,
                recommended_shard_count: count,
                max_concurrency: factor,
            });
        }

        let max_retries = self.config.reconnect.max_discovery_retries;
        let mut attempt: u32 = 0;
        loop {
            let err = match self.discovery.gateway_info().await {
                Ok(info) => return Ok(info),
                Err(e) => e,
            };

            attempt += 1;
            if err.kind() != ErrorKind::Discovery || attempt > max_retries {
                if let Some(count) = fixed {
                    warn!("Gateway discovery failed ({}), using configured values", err);
                    return Ok(GatewayInfo {
                        url: configured_url.unwrap_or_else(|| DEFAULT_GATEWAY_URL.to_string()),
                        recommended_shard_count: count,
                        max_concurrency: self.sharding.factor().unwrap_or(1),
                    });
                }
                error!("Gateway discovery failed after {} attempts: {}", attempt, err);
                return Err(err);
            }

            let delay = self.config.reconnect.delay_for_attempt(attempt - 1);
            warn!(
                "Gateway discovery failed: {} (retrying in {:?}, attempt {})",
                err, delay, attempt
            );
            sleep(delay).await;
        }
    }
}

/// State shared by every shard of one login
struct Lifecycle {
    coordinator: Arc<dyn ShardCoordinator>,
    invalidation: Arc<Invalidation>,
    group: Arc<dyn GatewayClientGroup>,
    dispatcher: Arc<dyn EventDispatcher>,
    metrics: Arc<Metrics>,
    destroy: DestroyHandler,
    /// Shards not yet registered in the group
    pending: AtomicUsize,
    destroyed: AtomicBool,
    destroy_done: CancellationToken,
}

impl Lifecycle {
    fn publish(&self, shard: ShardInfo, event: GatewayEvent) {
        if let Err(e) = self.dispatcher.publish(ShardEvent { shard, event }) {
            self.metrics.record_dispatch_error();
            warn!("[SHARD-{}] Dropped event: {}", shard.index(), e);
        }
    }

    async fn connected(&self, shard: ShardInfo) {
        if let Err(e) = self.coordinator.publish_connected(shard).await {
            warn!("[SHARD-{}] Failed to publish connection: {}", shard.index(), e);
        }
    }

    async fn invalidate(&self, shard: ShardInfo) {
        let removed = self.invalidation.invalidate(shard).await;
        if removed > 0 {
            debug!("[SHARD-{}] Invalidated {} cached keys", shard.index(), removed);
            self.metrics.record_invalidated_keys(removed);
        }
    }

    async fn disconnected(&self, shard: ShardInfo, session: Option<SessionInfo>) {
        if let Err(e) = self.coordinator.publish_disconnected(shard, session).await {
            warn!("[SHARD-{}] Failed to publish disconnect: {}", shard.index(), e);
        }
        self.invalidate(shard).await;
        self.group.remove(shard.index());
        self.maybe_destroy().await;
    }

    /// Run the destroy handler once nothing is left running or waiting
    async fn maybe_destroy(&self) {
        if !self.group.is_empty() || self.pending.load(Ordering::SeqCst) > 0 {
            return;
        }
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("All shards disconnected, running destroy handler");
        if let Err(e) = (self.destroy)().await {
            error!("Destroy handler failed: {}", e);
        }
        self.destroy_done.cancel();
    }
}

struct Launcher {
    ctx: SessionContext,
    lifecycle: Arc<Lifecycle>,
    presence: Option<PresenceProvider>,
    resume: Option<ResumeProvider>,
}

impl Launcher {
    /// Start the shards of one bucket strictly one after another
    async fn run_bucket(&self, bucket: u32, shards: Vec<ShardInfo>, started: mpsc::UnboundedSender<u32>) {
        debug!("Bucket {} starting {} shards", bucket, shards.len());

        for shard in shards {
            if self.ctx.close.is_cancelled() {
                self.lifecycle.pending.fetch_sub(1, Ordering::SeqCst);
                continue;
            }

            let ready = self.launch(shard).await;
            tokio::select! {
                _ = ready => {}
                _ = self.ctx.close.cancelled() => {}
            }
            let _ = started.send(shard.index());
        }

        // Covers shards skipped after logout
        self.lifecycle.maybe_destroy().await;
    }

    /// Spawn one session; the receiver resolves once it is connected or gone
    async fn launch(&self, shard: ShardInfo) -> oneshot::Receiver<()> {
        let index = shard.index();

        let mut resume = self.resume.as_ref().and_then(|provider| provider(shard));
        if resume.is_none() {
            resume = match self.lifecycle.coordinator.resume_session(shard).await {
                Ok(session) => session,
                Err(e) => {
                    warn!("[SHARD-{}] Could not load stored session: {}", index, e);
                    None
                }
            };
        }
        let presence = self.presence.as_ref().and_then(|provider| provider(shard));

        let (command_tx, command_rx) = mpsc::channel(self.ctx.connection.command_buffer);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let status = Arc::new(SessionStatus::default());

        self.lifecycle
            .group
            .add(index, ShardHandle::new(shard, command_tx, status.clone()));
        self.lifecycle.pending.fetch_sub(1, Ordering::SeqCst);

        let session = ShardSession::new(
            shard,
            self.ctx.clone(),
            presence,
            resume,
            status.clone(),
            command_rx,
            events_tx,
        );
        let metrics = self.ctx.metrics.clone();
        tokio::spawn(run_with_recovery(shard, session, status, metrics));

        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(forward_events(self.lifecycle.clone(), shard, events_rx, ready_tx));
        ready_rx
    }
}

async fn run_with_recovery(
    shard: ShardInfo,
    session: ShardSession,
    status: Arc<SessionStatus>,
    metrics: Arc<Metrics>,
) {
    let index = shard.index();
    match AssertUnwindSafe(session.run()).catch_unwind().await {
        Ok(Ok(())) => {
            debug!("[SHARD-{}] Session task completed normally", index);
        }
        Ok(Err(e)) => {
            warn!("[SHARD-{}] Session task ended with error: {}", index, e);
        }
        Err(panic_err) => {
            let panic_msg = if let Some(s) = panic_err.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic_err.downcast_ref::<String>() {
                s.clone()
            } else {
                "Unknown panic".to_string()
            };
            error!(
                "[SHARD-{}] Session task PANICKED: {}. Shard is now dead.",
                index, panic_msg
            );
            metrics.record_error();
        }
    }
    status.mark_finished();
}

/// Publish a shard's events and react to its lifecycle
async fn forward_events(
    lifecycle: Arc<Lifecycle>,
    shard: ShardInfo,
    mut events: mpsc::UnboundedReceiver<GatewayEvent>,
    ready: oneshot::Sender<()>,
) {
    let mut ready = Some(ready);
    let mut terminated = false;

    while let Some(event) = events.recv().await {
        let state = match &event {
            GatewayEvent::StateChange(state) => Some(state.clone()),
            GatewayEvent::Dispatch(_) => None,
        };
        lifecycle.publish(shard, event);

        match state {
            Some(LifecycleState::Connected) | Some(LifecycleState::RetrySucceeded { .. }) => {
                lifecycle.connected(shard).await;
                if let Some(tx) = ready.take() {
                    let _ = tx.send(());
                }
            }
            Some(LifecycleState::RetryStarted { .. }) | Some(LifecycleState::RetryFailed { .. }) => {
                lifecycle.invalidate(shard).await;
            }
            Some(LifecycleState::Disconnected) => {
                lifecycle.disconnected(shard, None).await;
                terminated = true;
                break;
            }
            Some(LifecycleState::DisconnectedResumable { session }) => {
                lifecycle.disconnected(shard, Some(session)).await;
                terminated = true;
                break;
            }
            Some(LifecycleState::Connecting { .. }) | None => {}
        }
    }

    if !terminated {
        warn!("[SHARD-{}] Session ended without a disconnect event", shard.index());
        lifecycle.publish(shard, GatewayEvent::StateChange(LifecycleState::Disconnected));
        lifecycle.disconnected(shard, None).await;
    }
}

/// A logged-in set of shards
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("shard_count", &self.inner.shard_count)
            .finish_non_exhaustive()
    }
}

struct GatewayInner {
    lifecycle: Arc<Lifecycle>,
    close: CancellationToken,
    shard_count: u32,
    broadcast: Option<Arc<BroadcastDispatcher>>,
}

impl Gateway {
    pub fn group(&self) -> Arc<dyn GatewayClientGroup> {
        self.inner.lifecycle.group.clone()
    }

    pub fn find(&self, index: u32) -> Option<ShardHandle> {
        self.inner.lifecycle.group.find(index)
    }

    pub async fn unicast(&self, index: u32, payload: GatewayPayload) -> Result<(), Error> {
        self.inner.lifecycle.group.unicast(index, payload).await
    }

    pub async fn multicast(&self, payload: GatewayPayload) -> Result<(), Error> {
        self.inner.lifecycle.group.multicast(payload).await
    }

    /// Total shard count; a single group reports what its session observed
    pub fn shard_count(&self) -> u32 {
        self.inner
            .lifecycle
            .group
            .shard_count()
            .unwrap_or(self.inner.shard_count)
    }

    /// Close every shard and wait for the destroy handler to finish
    pub async fn logout(&self) {
        info!("Logging out");
        self.inner.close.cancel();
        self.inner.lifecycle.group.logout().await;
        self.on_disconnect().await;
    }

    /// Resolves once every shard is gone and the destroy handler ran
    pub async fn on_disconnect(&self) {
        self.inner.lifecycle.destroy_done.cancelled().await
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.lifecycle.destroy_done.is_cancelled()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.inner.lifecycle.metrics.clone()
    }

    pub fn dispatcher(&self) -> Arc<dyn EventDispatcher> {
        self.inner.lifecycle.dispatcher.clone()
    }

    /// Subscribe to the default dispatcher, if it is in use and open
    pub fn subscribe(&self) -> Option<broadcast::Receiver<ShardEvent>> {
        self.inner.broadcast.as_ref().and_then(|b| b.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectConfig;
    use crate::dispatch::Dispatch;
    use crate::store::{InvalidationStrategy, MemoryStore};
    use crate::test_support::{MockGateway, MockOptions};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use tokio::time::{timeout, Duration, Instant};

    const WINDOW: Duration = Duration::from_secs(6);

    fn config(await_connections: Option<bool>) -> GatewayConfig {
        let mut builder = GatewayConfig::builder("token").reconnect(ReconnectConfig {
            first_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            jitter: false,
            ..Default::default()
        });
        if let Some(enabled) = await_connections {
            builder = builder.await_connections(enabled);
        }
        builder.build().unwrap()
    }

    fn info(shards: u32, max_concurrency: u32) -> GatewayInfo {
        GatewayInfo {
            url: "wss://gateway.test".to_string(),
            recommended_shard_count: shards,
            max_concurrency,
        }
    }

    fn builder(gateway: &MockGateway, info: GatewayInfo, await_all: Option<bool>) -> ShardManagerBuilder {
        ShardManager::builder(config(await_all))
            .discovery(Arc::new(StaticDiscovery::new(info)))
            .connector(Arc::new(gateway.clone()))
    }

    async fn eventually<F, Fut>(mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        timeout(Duration::from_secs(600), async {
            while !condition().await {
                sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    fn identify_order(gateway: &MockGateway) -> Vec<(u32, Instant)> {
        gateway
            .frames_with_op(2)
            .into_iter()
            .filter_map(|f| f.identify_shard().map(|shard| (shard, f.at)))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_serial_identify_at_factor_one() {
        let gateway = MockGateway::new();
        let manager = builder(&gateway, info(3, 1), Some(true)).build().unwrap();

        let gw = manager.login().await.unwrap();
        assert_eq!(gw.shard_count(), 3);

        let identifies = identify_order(&gateway);
        let order: Vec<u32> = identifies.iter().map(|(shard, _)| *shard).collect();
        assert_eq!(order, vec![0, 1, 2]);
        for pair in identifies.windows(2) {
            assert!(pair[1].1 - pair[0].1 >= WINDOW);
        }

        for frame in gateway.frames_with_op(2) {
            assert_eq!(frame.payload["d"]["shard"][1], 3);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_buckets() {
        let gateway = MockGateway::new();
        let manager = builder(&gateway, info(4, 2), Some(true)).build().unwrap();

        manager.login().await.unwrap();

        let at: BTreeMap<u32, Instant> = identify_order(&gateway).into_iter().collect();
        assert_eq!(at.len(), 4);

        let spread = |a: Instant, b: Instant| if a > b { a - b } else { b - a };
        // Buckets 0 and 1 identify together
        assert!(spread(at[&0], at[&1]) < Duration::from_secs(1));
        assert!(spread(at[&2], at[&3]) < Duration::from_secs(1));
        assert!(at[&2] - at[&0] >= WINDOW);
        assert!(at[&3] - at[&1] >= WINDOW);
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_returns_after_first_shard_by_default() {
        let gateway = MockGateway::new();
        let manager = builder(&gateway, info(3, 1), None).build().unwrap();

        let gw = manager.login().await.unwrap();
        assert_eq!(gateway.frames_with_op(2).len(), 1);

        // The rest keep starting in the background
        gateway.wait_for_frames(2, 3).await;
        gw.logout().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_filtered_shard_set() {
        let gateway = MockGateway::new();
        let sharding = ShardingStrategy::builder()
            .count(4)
            .indexes(vec![0, 2])
            .build()
            .unwrap();
        let manager = builder(&gateway, info(4, 1), Some(true))
            .sharding(sharding)
            .build()
            .unwrap();

        let gw = manager.login().await.unwrap();

        let order: Vec<u32> = identify_order(&gateway).iter().map(|(s, _)| *s).collect();
        assert_eq!(order, vec![0, 2]);
        for frame in gateway.frames_with_op(2) {
            assert_eq!(frame.payload["d"]["shard"][1], 4);
        }
        assert!(gw.find(0).is_some());
        assert!(gw.find(1).is_none());
        assert!(gw.find(2).is_some());
        assert_eq!(gw.shard_count(), 4);
        assert_eq!(gw.group().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_runs_once() {
        let gateway = MockGateway::new();
        let destroyed = Arc::new(AtomicU32::new(0));
        let counter = destroyed.clone();
        let manager = builder(&gateway, info(3, 1), Some(true))
            .destroy_handler(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .build()
            .unwrap();

        let gw = manager.login().await.unwrap();
        assert_eq!(gw.group().len(), 3);

        // Fatal close codes end each shard without retrying
        for connection in 0..3 {
            gateway.close(connection, 4013);
        }

        timeout(Duration::from_secs(60), gw.on_disconnect())
            .await
            .expect("destroy never ran");
        sleep(Duration::from_secs(5)).await;

        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
        assert!(gw.group().is_empty());
        assert!(gw.is_destroyed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_coordinator_tracks_connections() {
        let gateway = MockGateway::new();
        let coordinator = Arc::new(LocalShardCoordinator::new(WINDOW));
        let manager = builder(&gateway, info(2, 1), Some(true))
            .coordinator(coordinator.clone())
            .build()
            .unwrap();

        let gw = manager.login().await.unwrap();
        eventually(|| {
            let coordinator = coordinator.clone();
            async move { coordinator.connected_count().await.unwrap() == 2 }
        })
        .await;

        gw.logout().await;
        assert_eq!(coordinator.connected_count().await.unwrap(), 0);
        assert!(gw.is_destroyed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_across_logins() {
        let gateway = MockGateway::new();
        let manager = builder(&gateway, info(1, 1), None).build().unwrap();

        let gw = manager.login().await.unwrap();
        gw.find(0).unwrap().close(true).await.unwrap();
        timeout(Duration::from_secs(60), gw.on_disconnect())
            .await
            .expect("shard did not close");

        let second = manager.login().await.unwrap();
        assert!(second.find(0).unwrap().is_connected());

        let resume = &gateway.frames_with_op(6)[0];
        assert_eq!(resume.connection, 1);
        assert_eq!(resume.payload["d"]["session_id"], "session-0");
        assert_eq!(resume.payload["d"]["seq"], 1);
        assert_eq!(gateway.frames_with_op(2).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_provider_wins() {
        let gateway = MockGateway::new();
        let manager = builder(&gateway, info(1, 1), None)
            .resume(|shard| {
                Some(SessionInfo {
                    session_id: format!("saved-{}", shard.index()),
                    sequence: 77,
                })
            })
            .build()
            .unwrap();

        manager.login().await.unwrap();

        let resume = &gateway.frames_with_op(6)[0];
        assert_eq!(resume.payload["d"]["session_id"], "saved-0");
        assert_eq!(resume.payload["d"]["seq"], 77);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatches_are_tagged_and_published() {
        let gateway = MockGateway::new();
        let manager = builder(&gateway, info(2, 2), Some(true)).build().unwrap();
        let mut events = manager.subscribe().unwrap();

        let gw = manager.login().await.unwrap();
        gateway.dispatch(1, "MESSAGE_CREATE", 2, json!({"content": "hi"}));

        let event = timeout(Duration::from_secs(60), async {
            loop {
                let event = events.recv().await.unwrap();
                if let GatewayEvent::Dispatch(Dispatch { name, .. }) = &event.event {
                    if name == "MESSAGE_CREATE" {
                        return event;
                    }
                }
            }
        })
        .await
        .unwrap();

        // Connections 0 and 1 may belong to either shard
        let owner = gateway.frames_with_op(2)
            .into_iter()
            .find(|f| f.connection == 1)
            .and_then(|f| f.identify_shard())
            .unwrap();
        assert_eq!(event.shard.index(), owner);
        assert_eq!(event.shard.count(), 2);
        gw.logout().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle_events_are_published() {
        let gateway = MockGateway::new();
        let manager = builder(&gateway, info(1, 1), None).build().unwrap();
        let mut events = manager.subscribe().unwrap();

        let gw = manager.login().await.unwrap();
        gw.logout().await;

        let mut states = Vec::new();
        while let Ok(event) = events.recv().await {
            if let GatewayEvent::StateChange(state) = event.event {
                states.push(state);
            }
        }
        assert_eq!(states.first(), Some(&LifecycleState::Connecting { attempt: 0 }));
        assert!(states.contains(&LifecycleState::Connected));
        assert_eq!(states.last(), Some(&LifecycleState::Disconnected));
    }

    struct FailingDispatcher;

    impl EventDispatcher for FailingDispatcher {
        fn publish(&self, _event: ShardEvent) -> Result<(), Error> {
            Err(Error::Dispatch("sink unavailable".to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_errors_do_not_stop_shards() {
        let gateway = MockGateway::new();
        let manager = builder(&gateway, info(1, 1), None)
            .dispatcher(Arc::new(FailingDispatcher))
            .build()
            .unwrap();
        assert!(manager.subscribe().is_none());

        let gw = manager.login().await.unwrap();
        gateway.dispatch(0, "MESSAGE_CREATE", 2, json!({}));
        gateway.wait_for_frames(1, 1).await;

        assert!(gw.find(0).unwrap().is_connected());
        assert!(gw.metrics().dispatch_errors() >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_invalidates_only_that_shard() {
        let gateway = MockGateway::new();
        let invalidation = Arc::new(Invalidation::new(InvalidationStrategy::KeyTracking));
        let users = invalidation.adapt(MemoryStore::<String, String>::new());
        let manager = builder(&gateway, info(2, 2), Some(true))
            .invalidation(invalidation.clone())
            .build()
            .unwrap();

        let gw = manager.login().await.unwrap();
        let shard0 = gw.find(0).unwrap().shard();
        let shard1 = gw.find(1).unwrap().shard();
        users.save(shard0, "a".into(), "alice".into()).await.unwrap();
        users.save(shard1, "b".into(), "bob".into()).await.unwrap();

        let connection = gateway
            .frames_with_op(2)
            .into_iter()
            .find(|f| f.identify_shard() == Some(0))
            .map(|f| f.connection)
            .unwrap();
        gateway.close(connection, 4013);

        let cached = users.clone();
        eventually(move || {
            let cached = cached.clone();
            async move { cached.find(&"a".to_string()).await.unwrap().is_none() }
        })
        .await;

        assert_eq!(users.find(&"b".to_string()).await.unwrap(), Some("bob".to_string()));
        assert!(gw.find(0).is_none());
        assert!(gw.find(1).is_some());
        assert_eq!(gw.metrics().invalidated_keys(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_invalidates_only_that_shard() {
        let gateway = MockGateway::new();
        let invalidation = Arc::new(Invalidation::new(InvalidationStrategy::KeyTracking));
        let users = invalidation.adapt(MemoryStore::<String, String>::new());
        let manager = builder(&gateway, info(2, 2), Some(true))
            .invalidation(invalidation.clone())
            .build()
            .unwrap();

        let gw = manager.login().await.unwrap();
        let shard0 = gw.find(0).unwrap().shard();
        let shard1 = gw.find(1).unwrap().shard();
        users.save(shard0, "a".into(), "alice".into()).await.unwrap();
        users.save(shard1, "b".into(), "bob".into()).await.unwrap();

        let connection = gateway
            .frames_with_op(2)
            .into_iter()
            .find(|f| f.identify_shard() == Some(0))
            .map(|f| f.connection)
            .unwrap();
        gateway.close(connection, 1001);

        // Shard 0 comes back through RESUME
        gateway.wait_for_frames(6, 1).await;
        let cached = users.clone();
        eventually(move || {
            let cached = cached.clone();
            async move { cached.find(&"a".to_string()).await.unwrap().is_none() }
        })
        .await;

        assert_eq!(users.find(&"b".to_string()).await.unwrap(), Some("bob".to_string()));
        assert!(gw.find(0).is_some());
        assert!(!gw.is_destroyed());
        assert_eq!(gw.metrics().invalidated_keys(), 1);
        gw.logout().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_group_with_several_shards_is_rejected() {
        let gateway = MockGateway::new();
        let sharding = ShardingStrategy::builder()
            .recommended_count()
            .group(GroupKind::Single)
            .build()
            .unwrap();
        let manager = builder(&gateway, info(2, 1), Some(true))
            .sharding(sharding)
            .build()
            .unwrap();

        let err = manager.login().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Configuration(ConfigError::InvalidShardCount(_))
        ));
        assert_eq!(gateway.connection_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_group() {
        let gateway = MockGateway::new();
        let manager = builder(&gateway, info(8, 1), None)
            .sharding(ShardingStrategy::single())
            .build()
            .unwrap();

        let gw = manager.login().await.unwrap();
        assert_eq!(gw.shard_count(), 1);

        let routed = gw.find(5).unwrap();
        assert_eq!(routed.route(), Some(5));
        gw.unicast(5, GatewayPayload::presence_update(json!({"status": "dnd"})))
            .await
            .unwrap();

        let frames = gateway.wait_for_frames(3, 1).await;
        assert_eq!(frames[0].payload["shard"], 5);
    }

    struct FlakyDiscovery {
        failures: AtomicU32,
    }

    #[async_trait]
    impl GatewayDiscovery for FlakyDiscovery {
        async fn gateway_info(&self) -> Result<GatewayInfo, Error> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(Error::Discovery("unavailable".to_string()));
            }
            Ok(info(1, 1))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_is_retried() {
        let gateway = MockGateway::new();
        let manager = ShardManager::builder(config(None))
            .discovery(Arc::new(FlakyDiscovery {
                failures: AtomicU32::new(2),
            }))
            .connector(Arc::new(gateway.clone()))
            .build()
            .unwrap();

        let gw = manager.login().await.unwrap();
        assert_eq!(gw.shard_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_failure_is_fatal_for_recommended_count() {
        let gateway = MockGateway::new();
        let manager = ShardManager::builder(config(None))
            .discovery(Arc::new(FlakyDiscovery {
                failures: AtomicU32::new(u32::MAX),
            }))
            .connector(Arc::new(gateway.clone()))
            .build()
            .unwrap();

        let err = manager.login().await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Discovery);
        assert_eq!(gateway.connection_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_count_survives_discovery_failure() {
        let gateway = MockGateway::new();
        let manager = ShardManager::builder(config(None))
            .sharding(ShardingStrategy::fixed(1).unwrap())
            .discovery(Arc::new(FlakyDiscovery {
                failures: AtomicU32::new(u32::MAX),
            }))
            .connector(Arc::new(gateway.clone()))
            .build()
            .unwrap();

        let gw = manager.login().await.unwrap();
        assert!(gw.find(0).unwrap().is_connected());
        assert_eq!(gateway.urls()[0].host_str(), Some("gateway.discord.gg"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_presence_is_sent_with_identify() {
        let gateway = MockGateway::with_options(MockOptions::default());
        let manager = builder(&gateway, info(1, 1), None)
            .presence(|_| Some(json!({"status": "idle", "afk": false})))
            .build()
            .unwrap();

        manager.login().await.unwrap();

        let identify = &gateway.frames_with_op(2)[0];
        assert_eq!(identify.payload["d"]["presence"]["status"], "idle");
    }
}
