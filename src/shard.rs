use crate::config::ConfigError;
use crate::discovery::GatewayDiscovery;
use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Identifies one shard: its index and the total shard count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardInfo {
    index: u32,
    count: u32,
}

impl ShardInfo {
    pub fn new(index: u32, count: u32) -> Result<Self, ConfigError> {
        if count == 0 {
            return Err(ConfigError::InvalidShardCount(
                "shard count must be >= 1".to_string(),
            ));
        }
        if index >= count {
            return Err(ConfigError::InvalidShardIndex { index, count });
        }
        Ok(Self { index, count })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Concurrency bucket this shard identifies in
    pub fn bucket(&self, factor: u32) -> u32 {
        self.index % factor.max(1)
    }
}

impl fmt::Display for ShardInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.index, self.count)
    }
}

/// Resumable session state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub sequence: u64,
}

/// Where the total shard count comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShardCount {
    /// Ask the remote for its recommendation
    #[default]
    Recommended,
    Fixed(u32),
}

/// Which client group the shards are registered in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupKind {
    /// One session per shard
    #[default]
    Sharding,
    /// A single session standing in for every logical shard
    Single,
}

type ShardFilter = Arc<dyn Fn(&ShardInfo) -> bool + Send + Sync>;

/// Decides how many shards exist, which ones this process runs, and how
/// many may identify concurrently.
#[derive(Clone, Default)]
pub struct ShardingStrategy {
    count: ShardCount,
    indexes: Option<Vec<u32>>,
    filter: Option<ShardFilter>,
    factor: Option<u32>,
    group: GroupKind,
}

impl fmt::Debug for ShardingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardingStrategy")
            .field("count", &self.count)
            .field("indexes", &self.indexes)
            .field("filter", &self.filter.is_some())
            .field("factor", &self.factor)
            .field("group", &self.group)
            .finish()
    }
}

impl ShardingStrategy {
    /// Shard count and concurrency from the remote, all shards
    pub fn recommended() -> Self {
        Self::default()
    }

    /// A fixed shard count, all shards
    pub fn fixed(count: u32) -> Result<Self, ConfigError> {
        Self::builder().count(count).build()
    }

    /// One shard `[0, 1]` in a single-session group
    pub fn single() -> Self {
        Self {
            count: ShardCount::Fixed(1),
            indexes: None,
            filter: None,
            factor: Some(1),
            group: GroupKind::Single,
        }
    }

    pub fn builder() -> ShardingStrategyBuilder {
        ShardingStrategyBuilder {
            strategy: Self::default(),
        }
    }

    pub fn count(&self) -> ShardCount {
        self.count
    }

    pub fn factor(&self) -> Option<u32> {
        self.factor
    }

    pub fn group_kind(&self) -> GroupKind {
        self.group
    }

    /// Total shard count: the fixed value, or the remote's recommendation.
    pub async fn resolve_shard_count(
        &self,
        discovery: &dyn GatewayDiscovery,
    ) -> Result<u32, Error> {
        match self.count {
            ShardCount::Fixed(count) => Ok(count),
            ShardCount::Recommended => {
                let info = discovery.gateway_info().await?;
                if info.recommended_shard_count == 0 {
                    return Err(Error::Discovery(
                        "remote recommended zero shards".to_string(),
                    ));
                }
                Ok(info.recommended_shard_count)
            }
        }
    }

    /// The shards this process should connect, in start order.
    pub fn shards_to_connect(&self, count: u32) -> Vec<ShardInfo> {
        let indexes: Vec<u32> = match &self.indexes {
            Some(indexes) => indexes.clone(),
            None => (0..count).collect(),
        };

        indexes
            .into_iter()
            .filter_map(|index| match ShardInfo::new(index, count) {
                Ok(shard) => Some(shard),
                Err(_) => {
                    warn!(
                        "Ignoring shard index {} outside of shard count {}",
                        index, count
                    );
                    None
                }
            })
            .filter(|shard| self.filter.as_ref().map_or(true, |f| f(shard)))
            .collect()
    }

    /// Number of shards allowed to identify at the same time.
    pub async fn max_concurrency(&self, discovery: &dyn GatewayDiscovery) -> Result<u32, Error> {
        if let Some(factor) = self.factor {
            return Ok(factor);
        }

        let remote = match discovery.gateway_info().await {
            Ok(info) => info.max_concurrency,
            Err(e) if matches!(self.count, ShardCount::Fixed(_)) => {
                warn!("Max concurrency unavailable ({}), identifying serially", e);
                1
            }
            Err(e) => return Err(e),
        };

        Ok(floor_power_of_two(remote))
    }
}

fn floor_power_of_two(value: u32) -> u32 {
    if value <= 1 {
        return 1;
    }
    if value.is_power_of_two() {
        return value;
    }
    let rounded = 1u32 << (31 - value.leading_zeros());
    warn!(
        "Remote max concurrency {} is not a power of two, using {}",
        value, rounded
    );
    rounded
}

/// Builder for ShardingStrategy
#[derive(Debug, Clone)]
pub struct ShardingStrategyBuilder {
    strategy: ShardingStrategy,
}

impl ShardingStrategyBuilder {
    pub fn count(mut self, count: u32) -> Self {
        self.strategy.count = ShardCount::Fixed(count);
        self
    }

    pub fn recommended_count(mut self) -> Self {
        self.strategy.count = ShardCount::Recommended;
        self
    }

    /// Connect only these shard indexes
    pub fn indexes(mut self, indexes: impl IntoIterator<Item = u32>) -> Self {
        self.strategy.indexes = Some(indexes.into_iter().collect());
        self
    }

    /// Connect only shards for which `filter` returns true
    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&ShardInfo) -> bool + Send + Sync + 'static,
    {
        self.strategy.filter = Some(Arc::new(filter));
        self
    }

    /// Override the remote max concurrency
    pub fn factor(mut self, factor: u32) -> Self {
        self.strategy.factor = Some(factor);
        self
    }

    pub fn group(mut self, group: GroupKind) -> Self {
        self.strategy.group = group;
        self
    }

    pub fn build(self) -> Result<ShardingStrategy, ConfigError> {
        if self.strategy.count == ShardCount::Fixed(0) {
            return Err(ConfigError::InvalidShardCount(
                "shard count must be >= 1".to_string(),
            ));
        }

        if let Some(factor) = self.strategy.factor {
            if !factor.is_power_of_two() {
                return Err(ConfigError::InvalidConcurrency(factor));
            }
        }

        if self.strategy.group == GroupKind::Single {
            let several = match (&self.strategy.indexes, self.strategy.count) {
                (Some(indexes), _) => indexes.len() > 1,
                (None, ShardCount::Fixed(count)) => count > 1 && self.strategy.filter.is_none(),
                (None, ShardCount::Recommended) => false,
            };
            if several {
                return Err(ConfigError::InvalidShardCount(
                    "a single group holds exactly one shard".to_string(),
                ));
            }
        }

        Ok(self.strategy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{GatewayInfo, StaticDiscovery};
    use async_trait::async_trait;

    struct FailingDiscovery;

    #[async_trait]
    impl GatewayDiscovery for FailingDiscovery {
        async fn gateway_info(&self) -> Result<GatewayInfo, Error> {
            Err(Error::Discovery("unreachable".to_string()))
        }
    }

    fn remote(shards: u32, max_concurrency: u32) -> StaticDiscovery {
        StaticDiscovery::new(GatewayInfo {
            url: "wss://gateway.example".to_string(),
            recommended_shard_count: shards,
            max_concurrency,
        })
    }

    #[test]
    fn test_shard_info_invariants() {
        assert!(ShardInfo::new(0, 1).is_ok());
        assert_eq!(
            ShardInfo::new(4, 4),
            Err(ConfigError::InvalidShardIndex { index: 4, count: 4 })
        );
        assert!(ShardInfo::new(0, 0).is_err());

        let shard = ShardInfo::new(5, 8).unwrap();
        assert_eq!(shard.bucket(4), 1);
        assert_eq!(shard.bucket(1), 0);
        assert_eq!(shard.to_string(), "[5, 8]");
    }

    #[test]
    fn test_fixed_zero_rejected() {
        assert!(matches!(
            ShardingStrategy::fixed(0),
            Err(ConfigError::InvalidShardCount(_))
        ));
    }

    #[test]
    fn test_factor_must_be_power_of_two() {
        let result = ShardingStrategy::builder().count(4).factor(3).build();
        assert_eq!(result.unwrap_err(), ConfigError::InvalidConcurrency(3));

        assert!(ShardingStrategy::builder().factor(0).build().is_err());
        assert!(ShardingStrategy::builder().factor(16).build().is_ok());
    }

    #[test]
    fn test_filtered_indexes() {
        let strategy = ShardingStrategy::builder()
            .count(4)
            .indexes([0, 2, 9])
            .build()
            .unwrap();

        let shards = strategy.shards_to_connect(4);
        assert_eq!(
            shards,
            vec![ShardInfo::new(0, 4).unwrap(), ShardInfo::new(2, 4).unwrap()]
        );
        assert!(shards.iter().all(|s| s.count() == 4));
    }

    #[test]
    fn test_filter_predicate() {
        let strategy = ShardingStrategy::builder()
            .count(6)
            .filter(|shard| shard.index() % 2 == 1)
            .build()
            .unwrap();

        let indexes: Vec<u32> = strategy
            .shards_to_connect(6)
            .iter()
            .map(|s| s.index())
            .collect();
        assert_eq!(indexes, vec![1, 3, 5]);
    }

    #[test]
    fn test_single() {
        let strategy = ShardingStrategy::single();
        assert_eq!(strategy.group_kind(), GroupKind::Single);
        assert_eq!(strategy.shards_to_connect(1), vec![ShardInfo::new(0, 1).unwrap()]);
    }

    #[test]
    fn test_single_group_rejects_several_shards() {
        let several = ShardingStrategy::builder()
            .count(2)
            .group(GroupKind::Single)
            .build();
        assert!(matches!(several, Err(ConfigError::InvalidShardCount(_))));

        let listed = ShardingStrategy::builder()
            .count(4)
            .indexes(vec![0, 3])
            .group(GroupKind::Single)
            .build();
        assert!(matches!(listed, Err(ConfigError::InvalidShardCount(_))));

        let one = ShardingStrategy::builder()
            .count(4)
            .indexes(vec![3])
            .group(GroupKind::Single)
            .build()
            .unwrap();
        assert_eq!(one.shards_to_connect(4), vec![ShardInfo::new(3, 4).unwrap()]);
    }

    #[tokio::test]
    async fn test_resolve_shard_count() {
        let fixed = ShardingStrategy::fixed(3).unwrap();
        assert_eq!(fixed.resolve_shard_count(&FailingDiscovery).await.unwrap(), 3);

        let recommended = ShardingStrategy::recommended();
        assert_eq!(
            recommended.resolve_shard_count(&remote(7, 1)).await.unwrap(),
            7
        );

        let err = recommended
            .resolve_shard_count(&FailingDiscovery)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Discovery(_)));

        assert!(recommended.resolve_shard_count(&remote(0, 1)).await.is_err());
    }

    #[tokio::test]
    async fn test_max_concurrency() {
        let recommended = ShardingStrategy::recommended();
        assert_eq!(recommended.max_concurrency(&remote(1, 16)).await.unwrap(), 16);
        // Rounded down to a power of two
        assert_eq!(recommended.max_concurrency(&remote(1, 12)).await.unwrap(), 8);
        assert_eq!(recommended.max_concurrency(&remote(1, 0)).await.unwrap(), 1);
        assert!(recommended.max_concurrency(&FailingDiscovery).await.is_err());

        // Explicit factor wins
        let factored = ShardingStrategy::builder().factor(2).build().unwrap();
        assert_eq!(factored.max_concurrency(&remote(1, 16)).await.unwrap(), 2);

        // Fixed count falls back to serial identify
        let fixed = ShardingStrategy::fixed(2).unwrap();
        assert_eq!(fixed.max_concurrency(&FailingDiscovery).await.unwrap(), 1);
    }
}
