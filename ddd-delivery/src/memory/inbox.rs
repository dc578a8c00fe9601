use crate::error::DeliveryResult as Result;
use crate::inbox::{InboxStorage, WriteOutcome};
use crate::message::{InboxLabel, InboxMessage, Target, TypeUrl};
use crate::shard::ShardIndex;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};

#[derive(Default)]
struct ShardLog {
    next_version: u64,
    messages: BTreeMap<u64, InboxMessage>,
    /// (目标, message_id) -> 序号
    keys: HashMap<(Target, String), u64>,
}

impl ShardLog {
    fn remove(&mut self, version: u64) -> Option<InboxMessage> {
        let removed = self.messages.remove(&version)?;
        let key = (removed.target().clone(), removed.message_id().to_string());
        if self.keys.get(&key) == Some(&version) {
            self.keys.remove(&key);
        }
        Some(removed)
    }

    /// 定位与给定消息同 ID 同序号的记录
    fn find_mut(&mut self, message: &InboxMessage) -> Option<&mut InboxMessage> {
        self.messages
            .get_mut(&message.version())
            .filter(|stored| stored.id() == message.id())
    }
}

/// 基于内存的 InboxStorage 实现
#[derive(Default)]
pub struct InMemoryInboxStorage {
    shards: DashMap<ShardIndex, ShardLog>,
}

impl InMemoryInboxStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// 全部记录数（含保留期内的已投递记录）
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.messages.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 全部待投递消息，按分片与序号排序
    pub fn pending(&self) -> Vec<InboxMessage> {
        let mut all: Vec<InboxMessage> = self
            .shards
            .iter()
            .flat_map(|s| {
                s.messages
                    .values()
                    .filter(|m| m.is_pending())
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        all.sort_by_key(|m| (m.shard(), m.version()));
        all
    }
}

#[async_trait]
impl InboxStorage for InMemoryInboxStorage {
    async fn write(&self, mut message: InboxMessage, now: DateTime<Utc>) -> Result<WriteOutcome> {
        let mut log = self.shards.entry(message.shard()).or_default();
        let key = (message.target().clone(), message.message_id().to_string());

        if let Some(&existing) = log.keys.get(&key) {
            match log.messages.get(&existing).map(|m| m.occupies_dedup_key(now)) {
                Some(true) => return Ok(WriteOutcome::Duplicate),
                // 保留期已过，旧记录让位于新消息
                Some(false) => {
                    log.remove(existing);
                }
                None => {
                    log.keys.remove(&key);
                }
            }
        }

        log.next_version += 1;
        let version = log.next_version;
        message.assign_version(version);
        log.keys.insert(key, version);
        log.messages.insert(version, message);
        Ok(WriteOutcome::Appended { version })
    }

    async fn read_page(
        &self,
        shard: ShardIndex,
        after: Option<u64>,
        limit: usize,
    ) -> Result<Vec<InboxMessage>> {
        let Some(log) = self.shards.get(&shard) else {
            return Ok(Vec::new());
        };
        let from = after.map_or(0, |v| v.saturating_add(1));
        Ok(log
            .messages
            .range(from..)
            .map(|(_, m)| m)
            .filter(|m| m.is_pending())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_delivered(
        &self,
        messages: &[InboxMessage],
        keep_until: DateTime<Utc>,
    ) -> Result<()> {
        for message in messages {
            if let Some(mut log) = self.shards.get_mut(&message.shard()) {
                if let Some(stored) = log.find_mut(message) {
                    stored.mark_delivered(keep_until);
                }
            }
        }
        Ok(())
    }

    async fn remove_all(&self, messages: &[InboxMessage]) -> Result<()> {
        for message in messages {
            if let Some(mut log) = self.shards.get_mut(&message.shard()) {
                if log.find_mut(message).is_some() {
                    log.remove(message.version());
                }
            }
        }
        Ok(())
    }

    async fn remove_expired(&self, shard: ShardIndex, now: DateTime<Utc>) -> Result<usize> {
        let Some(mut log) = self.shards.get_mut(&shard) else {
            return Ok(0);
        };
        let expired: Vec<u64> = log
            .messages
            .iter()
            .filter(|(_, m)| !m.is_pending() && !m.occupies_dedup_key(now))
            .map(|(v, _)| *v)
            .collect();
        for version in &expired {
            log.remove(*version);
        }
        Ok(expired.len())
    }

    async fn count_pending(&self, target_type: &TypeUrl, label: InboxLabel) -> Result<usize> {
        Ok(self
            .shards
            .iter()
            .map(|log| {
                log.messages
                    .values()
                    .filter(|m| {
                        m.is_pending() && m.label() == label && m.target().type_url() == target_type
                    })
                    .count()
            })
            .sum())
    }
}
