use crate::connection::{SessionCommand, SessionStatus};
use crate::error::Error;
use crate::payload::{GatewayPayload, OutboundPayload};
use crate::shard::{SessionInfo, ShardInfo};
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::join_all;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Handle to one running shard session.
///
/// Cheap to clone. All methods fail with `Error::ChannelSend` once the
/// session task has exited.
#[derive(Debug, Clone)]
pub struct ShardHandle {
    shard: ShardInfo,
    route: Option<u32>,
    commands: mpsc::Sender<SessionCommand>,
    status: Arc<SessionStatus>,
}

impl ShardHandle {
    pub(crate) fn new(
        shard: ShardInfo,
        commands: mpsc::Sender<SessionCommand>,
        status: Arc<SessionStatus>,
    ) -> Self {
        Self {
            shard,
            route: None,
            commands,
            status,
        }
    }

    /// Same session, but every frame sent through it is tagged with `index`
    pub(crate) fn routed(mut self, index: u32) -> Self {
        self.route = Some(index);
        self
    }

    pub fn shard(&self) -> ShardInfo {
        self.shard
    }

    /// Shard index frames sent through this handle are tagged with
    pub fn route(&self) -> Option<u32> {
        self.route
    }

    /// Queue a frame; it is sent once the session is ready
    pub async fn send(&self, payload: GatewayPayload) -> Result<(), Error> {
        let outbound = match self.route {
            Some(index) => OutboundPayload::routed(payload, index),
            None => OutboundPayload::new(payload),
        };
        self.command(SessionCommand::Send(outbound)).await
    }

    /// Close the session. With `allow_resume` the session is kept and
    /// can be resumed by a later login.
    pub async fn close(&self, allow_resume: bool) -> Result<(), Error> {
        self.command(SessionCommand::Close { allow_resume }).await
    }

    /// Drop the connection and resume on a new one
    pub async fn reconnect(&self) -> Result<(), Error> {
        self.command(SessionCommand::Reconnect).await
    }

    /// Resolves once the session task has exited
    pub async fn closed(&self) {
        self.status.finished().await
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }

    pub fn is_connected(&self) -> bool {
        self.status.is_connected()
    }

    pub fn session_info(&self) -> Option<SessionInfo> {
        self.status.session_info()
    }

    /// Shard count the gateway reported in READY
    pub fn shard_count(&self) -> Option<u32> {
        self.status.shard_count()
    }

    pub fn latency(&self) -> Option<Duration> {
        self.status.latency()
    }

    async fn command(&self, command: SessionCommand) -> Result<(), Error> {
        self.commands.send(command).await.map_err(|_| {
            Error::ChannelSend(format!("shard {} session has ended", self.shard.index()))
        })
    }
}

/// The set of live shard handles
#[async_trait]
pub trait GatewayClientGroup: Send + Sync {
    fn add(&self, index: u32, handle: ShardHandle);

    fn remove(&self, index: u32) -> Option<ShardHandle>;

    fn find(&self, index: u32) -> Option<ShardHandle>;

    fn shard_count(&self) -> Option<u32>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send to every shard. Shards whose session has ended are skipped.
    async fn multicast(&self, payload: GatewayPayload) -> Result<(), Error>;

    /// Send to one shard; a no-op when the shard is not in the group
    async fn unicast(&self, index: u32, payload: GatewayPayload) -> Result<(), Error>;

    /// Close every session and wait for all of them to exit
    async fn logout(&self);
}

/// One handle per shard index
#[derive(Debug)]
pub struct ShardingGroup {
    count: u32,
    handles: DashMap<u32, ShardHandle>,
}

impl ShardingGroup {
    pub fn new(count: u32) -> Self {
        Self {
            count,
            handles: DashMap::new(),
        }
    }

    fn handles(&self) -> Vec<ShardHandle> {
        self.handles.iter().map(|entry| entry.value().clone()).collect()
    }
}

#[async_trait]
impl GatewayClientGroup for ShardingGroup {
    fn add(&self, index: u32, handle: ShardHandle) {
        self.handles.insert(index, handle);
    }

    fn remove(&self, index: u32) -> Option<ShardHandle> {
        self.handles.remove(&index).map(|(_, handle)| handle)
    }

    fn find(&self, index: u32) -> Option<ShardHandle> {
        self.handles.get(&index).map(|entry| entry.value().clone())
    }

    fn shard_count(&self) -> Option<u32> {
        Some(self.count)
    }

    fn len(&self) -> usize {
        self.handles.len()
    }

    async fn multicast(&self, payload: GatewayPayload) -> Result<(), Error> {
        for handle in self.handles() {
            if let Err(e) = handle.send(payload.clone()).await {
                debug!("[SHARD-{}] Skipping multicast: {}", handle.shard().index(), e);
            }
        }
        Ok(())
    }

    async fn unicast(&self, index: u32, payload: GatewayPayload) -> Result<(), Error> {
        match self.find(index) {
            Some(handle) => handle.send(payload).await,
            None => Ok(()),
        }
    }

    async fn logout(&self) {
        let handles = self.handles();
        close_all(&handles).await;
    }
}

/// A single session serving every shard index.
///
/// Handles returned by `find` tag outbound frames with the requested
/// index so the remote end can route them.
#[derive(Debug, Default)]
pub struct SingleGroup {
    handle: RwLock<Option<ShardHandle>>,
}

impl SingleGroup {
    pub fn new() -> Self {
        Self::default()
    }

    fn current(&self) -> Option<ShardHandle> {
        self.handle.read().clone()
    }
}

#[async_trait]
impl GatewayClientGroup for SingleGroup {
    fn add(&self, _index: u32, handle: ShardHandle) {
        if let Some(previous) = self.handle.write().replace(handle) {
            warn!(
                "[SHARD-{}] Replaced by a new session in single group",
                previous.shard().index()
            );
        }
    }

    fn remove(&self, index: u32) -> Option<ShardHandle> {
        let mut guard = self.handle.write();
        let attached = guard
            .as_ref()
            .map_or(false, |handle| handle.shard().index() == index);
        if attached {
            guard.take()
        } else {
            None
        }
    }

    fn find(&self, index: u32) -> Option<ShardHandle> {
        self.current().map(|handle| handle.routed(index))
    }

    /// Latest count seen by the live session
    fn shard_count(&self) -> Option<u32> {
        self.current()
            .map(|handle| handle.shard_count().unwrap_or_else(|| handle.shard().count()))
    }

    fn len(&self) -> usize {
        usize::from(self.handle.read().is_some())
    }

    async fn multicast(&self, payload: GatewayPayload) -> Result<(), Error> {
        let Some(handle) = self.current() else {
            return Ok(());
        };
        let count = handle.shard_count().unwrap_or_else(|| handle.shard().count());
        for index in 0..count {
            handle.clone().routed(index).send(payload.clone()).await?;
        }
        Ok(())
    }

    async fn unicast(&self, index: u32, payload: GatewayPayload) -> Result<(), Error> {
        match self.find(index) {
            Some(handle) => handle.send(payload).await,
            None => Ok(()),
        }
    }

    async fn logout(&self) {
        if let Some(handle) = self.current() {
            close_all(&[handle]).await;
        }
    }
}

async fn close_all(handles: &[ShardHandle]) {
    for handle in handles {
        // Already-exited sessions reject the command; closed() still resolves
        let _ = handle.close(false).await;
    }
    join_all(handles.iter().map(|handle| handle.closed())).await;
}
