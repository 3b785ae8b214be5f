use crate::config::ConfigError;
use crate::error::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::trace;

/// Spaces out authentications per concurrency bucket.
///
/// Each bucket remembers when it last let a shard through; the next caller
/// waits until `window` has passed since then. Buckets are independent and
/// waiters on one bucket are served in arrival order (tokio's mutex is fair).
#[derive(Debug)]
pub struct IdentifyLimiter {
    window: Duration,
    buckets: Vec<Mutex<Option<Instant>>>,
}

impl IdentifyLimiter {
    pub fn new(buckets: u32, window: Duration) -> Result<Self, ConfigError> {
        if !buckets.is_power_of_two() {
            return Err(ConfigError::InvalidConcurrency(buckets));
        }
        if window.is_zero() {
            return Err(ConfigError::InvalidIdentifyWindow);
        }

        Ok(Self {
            window,
            buckets: (0..buckets).map(|_| Mutex::new(None)).collect(),
        })
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn bucket_count(&self) -> u32 {
        self.buckets.len() as u32
    }

    /// Wait for the bucket's turn and record the release.
    ///
    /// Dropping the future while it waits leaves the bucket untouched.
    pub async fn acquire(&self, bucket: u32) -> Result<(), Error> {
        let slot = self
            .buckets
            .get(bucket as usize)
            .ok_or(ConfigError::InvalidShardIndex {
                index: bucket,
                count: self.bucket_count(),
            })?;

        let mut last_release = slot.lock().await;
        if let Some(previous) = *last_release {
            let ready_at = previous + self.window;
            if ready_at > Instant::now() {
                trace!(
                    "Identify bucket {} busy, waiting {:?}",
                    bucket,
                    ready_at - Instant::now()
                );
                sleep_until(ready_at).await;
            }
        }
        *last_release = Some(Instant::now());

        Ok(())
    }
}
