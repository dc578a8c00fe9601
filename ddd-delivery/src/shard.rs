//! 分片（ShardIndex）与投递策略（DeliveryStrategy）
//!
//! 策略是纯函数：对固定的分片总数，同一目标永远映射到同一分片。
//! 均匀策略使用 BLAKE3 对目标 ID 取哈希，保证跨进程、跨工具链版本稳定。
//!
use crate::error::{DeliveryError, DeliveryResult};
use crate::message::TypeUrl;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawShardIndex")]
pub struct ShardIndex {
    index: u32,
    of_total: u32,
}

/// 反序列化的中间形态，经 `ShardIndex::new` 校验后才成为分片
#[derive(Deserialize)]
struct RawShardIndex {
    index: u32,
    of_total: u32,
}

impl TryFrom<RawShardIndex> for ShardIndex {
    type Error = DeliveryError;

    fn try_from(raw: RawShardIndex) -> DeliveryResult<Self> {
        Self::new(raw.index, raw.of_total)
    }
}

impl ShardIndex {
    pub fn new(index: u32, of_total: u32) -> DeliveryResult<Self> {
        if of_total == 0 {
            return Err(DeliveryError::invalid_argument(
                "total shard count must be positive",
            ));
        }
        if index >= of_total {
            return Err(DeliveryError::invalid_argument(format!(
                "shard index {index} is out of range for {of_total} shards"
            )));
        }
        Ok(Self { index, of_total })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn of_total(&self) -> u32 {
        self.of_total
    }

    /// 枚举给定总数下的全部分片
    pub fn all(of_total: u32) -> impl Iterator<Item = ShardIndex> {
        (0..of_total).map(move |index| ShardIndex { index, of_total })
    }
}

impl fmt::Display for ShardIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.index, self.of_total)
    }
}

/// 投递策略：决定目标消息落入哪个分片
pub trait DeliveryStrategy: Send + Sync {
    fn index_for(&self, target_id: &str, target_type: &TypeUrl) -> ShardIndex;

    fn shard_count(&self) -> u32;
}

/// 按目标 ID 均匀分布到全部分片
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UniformAcrossAllShards {
    shards: u32,
}

impl UniformAcrossAllShards {
    pub fn for_shards(shards: u32) -> DeliveryResult<Self> {
        if shards == 0 {
            return Err(DeliveryError::invalid_argument(
                "shard count must be positive",
            ));
        }
        Ok(Self { shards })
    }

    /// 全部消息进入 0 号分片，适合单节点部署与测试
    pub fn single_shard() -> Self {
        Self { shards: 1 }
    }
}

impl DeliveryStrategy for UniformAcrossAllShards {
    fn index_for(&self, target_id: &str, _target_type: &TypeUrl) -> ShardIndex {
        if self.shards == 1 {
            return ShardIndex {
                index: 0,
                of_total: 1,
            };
        }
        let digest = blake3::hash(target_id.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest.as_bytes()[..8]);
        let index = (u64::from_le_bytes(head) % u64::from(self.shards)) as u32;
        ShardIndex {
            index,
            of_total: self.shards,
        }
    }

    fn shard_count(&self) -> u32 {
        self.shards
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn order() -> TypeUrl {
        TypeUrl::new("type.example.org/orders.Order")
    }

    #[test]
    fn shard_index_bounds_are_checked() {
        assert!(ShardIndex::new(0, 1).is_ok());
        assert!(ShardIndex::new(1, 1).is_err());
        assert!(ShardIndex::new(0, 0).is_err());
        assert_eq!(ShardIndex::new(2, 4).unwrap().to_string(), "2/4");
    }

    #[test]
    fn deserialization_checks_bounds() {
        let shard: ShardIndex =
            serde_json::from_value(serde_json::json!({ "index": 3, "of_total": 4 })).unwrap();
        assert_eq!(shard, ShardIndex::new(3, 4).unwrap());
        assert_eq!(
            serde_json::from_value::<ShardIndex>(serde_json::to_value(shard).unwrap()).unwrap(),
            shard
        );

        let out_of_range =
            serde_json::from_value::<ShardIndex>(serde_json::json!({ "index": 4, "of_total": 4 }));
        assert!(out_of_range.is_err());
        let no_shards =
            serde_json::from_value::<ShardIndex>(serde_json::json!({ "index": 0, "of_total": 0 }));
        assert!(no_shards.is_err());
    }

    #[test]
    fn single_shard_sends_everything_to_zero() {
        let strategy = UniformAcrossAllShards::single_shard();
        for id in ["a", "b", "order-42"] {
            assert_eq!(strategy.index_for(id, &order()), ShardIndex::new(0, 1).unwrap());
        }
        assert_eq!(strategy.shard_count(), 1);
    }

    #[test]
    fn uniform_strategy_is_stable_and_spreads_targets() {
        let strategy = UniformAcrossAllShards::for_shards(4).unwrap();
        let mut seen = HashSet::new();
        for i in 0..200 {
            let id = format!("order-{i}");
            let first = strategy.index_for(&id, &order());
            let again = strategy.index_for(&id, &order());
            assert_eq!(first, again);
            assert!(first.index() < 4);
            assert_eq!(first.of_total(), 4);
            seen.insert(first.index());
        }
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn zero_shards_is_rejected() {
        assert!(UniformAcrossAllShards::for_shards(0).is_err());
    }

    #[test]
    fn all_enumerates_every_shard_once() {
        let all: Vec<_> = ShardIndex::all(3).map(|s| s.index()).collect();
        assert_eq!(all, vec![0, 1, 2]);
    }
}
