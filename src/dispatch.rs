use crate::error::Error;
use crate::shard::{SessionInfo, ShardInfo};
use parking_lot::RwLock;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

/// Lifecycle transitions of one shard session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleState {
    /// Opening a connection; `attempt` is 0 for the first one
    Connecting { attempt: u32 },
    /// READY or RESUMED received for the first time
    Connected,
    /// Back online after `attempts` retries
    RetrySucceeded { attempts: u32 },
    /// First retry after a live session dropped
    RetryStarted { backoff: Duration, resumable: bool },
    /// A retry failed. `backoff` is `None` once retries are exhausted.
    RetryFailed {
        attempt: u32,
        backoff: Option<Duration>,
    },
    Disconnected,
    /// Closed, but the session can be resumed later
    DisconnectedResumable { session: SessionInfo },
}

impl LifecycleState {
    /// States after which the session task is gone
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LifecycleState::Disconnected | LifecycleState::DisconnectedResumable { .. }
        )
    }
}

/// A gateway DISPATCH frame
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub name: String,
    pub sequence: Option<u64>,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    Dispatch(Dispatch),
    StateChange(LifecycleState),
}

/// An event tagged with the shard that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct ShardEvent {
    pub shard: ShardInfo,
    pub event: GatewayEvent,
}

/// Receives every event the shards produce.
///
/// `publish` is called from the shard forwarding tasks and must not block.
/// An error drops that one event; the shard keeps running.
pub trait EventDispatcher: Send + Sync + 'static {
    fn publish(&self, event: ShardEvent) -> Result<(), Error>;

    /// Stop accepting events
    fn shutdown(&self) {}
}

/// Fans events out over a tokio broadcast channel
#[derive(Debug)]
pub struct BroadcastDispatcher {
    sender: RwLock<Option<broadcast::Sender<ShardEvent>>>,
}

impl BroadcastDispatcher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: RwLock::new(Some(sender)),
        }
    }

    /// `None` once the dispatcher has been shut down
    pub fn subscribe(&self) -> Option<broadcast::Receiver<ShardEvent>> {
        self.sender.read().as_ref().map(|sender| sender.subscribe())
    }

    pub fn is_shutdown(&self) -> bool {
        self.sender.read().is_none()
    }
}

impl Default for BroadcastDispatcher {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventDispatcher for BroadcastDispatcher {
    fn publish(&self, event: ShardEvent) -> Result<(), Error> {
        let guard = self.sender.read();
        let sender = guard
            .as_ref()
            .ok_or_else(|| Error::Dispatch("dispatcher is shut down".to_string()))?;

        // No subscribers is not an error
        let _ = sender.send(event);
        Ok(())
    }

    fn shutdown(&self) {
        if self.sender.write().take().is_some() {
            debug!("Event dispatcher shut down");
        }
    }
}
