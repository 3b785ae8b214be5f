use crate::error::Error;
use crate::limiter::IdentifyLimiter;
use crate::shard::{SessionInfo, ShardInfo};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{debug, trace};

/// Coordinates identify slots and connection state across shards.
///
/// The manager only talks to this trait, so an implementation backed by a
/// shared service can coordinate shards running in several processes.
#[async_trait]
pub trait ShardCoordinator: Send + Sync {
    /// Wait until `shard` may send IDENTIFY or RESUME.
    async fn acquire_identify(&self, shard: ShardInfo, max_concurrency: u32) -> Result<(), Error>;

    async fn publish_connected(&self, shard: ShardInfo) -> Result<(), Error>;

    /// Record a disconnect; `session` is kept when the shard may resume later.
    async fn publish_disconnected(
        &self,
        shard: ShardInfo,
        session: Option<SessionInfo>,
    ) -> Result<(), Error>;

    async fn connected_count(&self) -> Result<usize, Error>;

    /// A previously stored session the shard should resume instead of identifying.
    async fn resume_session(&self, _shard: ShardInfo) -> Result<Option<SessionInfo>, Error> {
        Ok(None)
    }
}

/// In-process coordinator
#[derive(Debug)]
pub struct LocalShardCoordinator {
    window: Duration,
    connected: DashSet<u32>,
    sessions: DashMap<u32, SessionInfo>,
    limiters: DashMap<u32, Arc<IdentifyLimiter>>,
}

impl LocalShardCoordinator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            connected: DashSet::new(),
            sessions: DashMap::new(),
            limiters: DashMap::new(),
        }
    }

    fn limiter(&self, max_concurrency: u32) -> Result<Arc<IdentifyLimiter>, Error> {
        let limiter = self
            .limiters
            .entry(max_concurrency)
            .or_try_insert_with(|| IdentifyLimiter::new(max_concurrency, self.window).map(Arc::new))?
            .clone();
        Ok(limiter)
    }

    /// Whether the coordinator currently considers `shard` connected
    pub fn is_connected(&self, shard: ShardInfo) -> bool {
        self.connected.contains(&shard.index())
    }
}

impl Default for LocalShardCoordinator {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_IDENTIFY_WINDOW)
    }
}

#[async_trait]
impl ShardCoordinator for LocalShardCoordinator {
    async fn acquire_identify(&self, shard: ShardInfo, max_concurrency: u32) -> Result<(), Error> {
        let limiter = self.limiter(max_concurrency)?;
        let bucket = shard.bucket(max_concurrency);
        trace!("[SHARD-{}] Waiting for identify bucket {}", shard.index(), bucket);
        limiter.acquire(bucket).await
    }

    async fn publish_connected(&self, shard: ShardInfo) -> Result<(), Error> {
        self.sessions.remove(&shard.index());
        if self.connected.insert(shard.index()) {
            debug!(
                "[SHARD-{}] Marked connected ({} connected)",
                shard.index(),
                self.connected.len()
            );
        }
        Ok(())
    }

    async fn publish_disconnected(
        &self,
        shard: ShardInfo,
        session: Option<SessionInfo>,
    ) -> Result<(), Error> {
        match session {
            Some(session) => {
                self.sessions.insert(shard.index(), session);
            }
            None => {
                self.sessions.remove(&shard.index());
            }
        }
        if self.connected.remove(&shard.index()).is_some() {
            debug!(
                "[SHARD-{}] Marked disconnected ({} connected)",
                shard.index(),
                self.connected.len()
            );
        }
        Ok(())
    }

    async fn connected_count(&self) -> Result<usize, Error> {
        Ok(self.connected.len())
    }

    async fn resume_session(&self, shard: ShardInfo) -> Result<Option<SessionInfo>, Error> {
        Ok(self.sessions.remove(&shard.index()).map(|(_, session)| session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn shard(index: u32, count: u32) -> ShardInfo {
        ShardInfo::new(index, count).unwrap()
    }

    #[tokio::test]
    async fn test_notifications_are_idempotent() {
        let coordinator = LocalShardCoordinator::default();

        coordinator.publish_connected(shard(0, 2)).await.unwrap();
        coordinator.publish_connected(shard(0, 2)).await.unwrap();
        coordinator.publish_connected(shard(1, 2)).await.unwrap();
        assert_eq!(coordinator.connected_count().await.unwrap(), 2);

        coordinator.publish_disconnected(shard(0, 2), None).await.unwrap();
        coordinator.publish_disconnected(shard(0, 2), None).await.unwrap();
        assert_eq!(coordinator.connected_count().await.unwrap(), 1);
        assert!(!coordinator.is_connected(shard(0, 2)));
        assert!(coordinator.is_connected(shard(1, 2)));
    }

    #[tokio::test]
    async fn test_resumable_session_is_handed_back_once() {
        let coordinator = LocalShardCoordinator::default();
        let session = SessionInfo {
            session_id: "abc".to_string(),
            sequence: 42,
        };

        coordinator.publish_connected(shard(0, 1)).await.unwrap();
        coordinator
            .publish_disconnected(shard(0, 1), Some(session.clone()))
            .await
            .unwrap();

        assert_eq!(coordinator.resume_session(shard(0, 1)).await.unwrap(), Some(session));
        assert_eq!(coordinator.resume_session(shard(0, 1)).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_identify_uses_buckets() {
        let coordinator = LocalShardCoordinator::new(Duration::from_secs(6));
        let start = Instant::now();

        // Factor 2: shards 0 and 1 share nothing, shard 2 waits behind shard 0
        coordinator.acquire_identify(shard(0, 4), 2).await.unwrap();
        coordinator.acquire_identify(shard(1, 4), 2).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));

        coordinator.acquire_identify(shard(2, 4), 2).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(6));
    }

    #[tokio::test]
    async fn test_acquire_identify_rejects_bad_factor() {
        let coordinator = LocalShardCoordinator::default();
        assert!(coordinator.acquire_identify(shard(0, 4), 3).await.is_err());
    }
}
