use crate::error::DeliveryResult as Result;
use crate::registry::{PickUpOutcome, ShardSessionRecord, ShardedWorkRegistry, WorkerId};
use crate::shard::ShardIndex;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

/// 基于内存的 ShardedWorkRegistry 实现
#[derive(Default)]
pub struct InMemoryShardedWorkRegistry {
    sessions: DashMap<ShardIndex, ShardSessionRecord>,
}

impl InMemoryShardedWorkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前登记的全部租约（含已过期但尚未清除的）
    pub fn sessions(&self) -> Vec<ShardSessionRecord> {
        let mut all: Vec<ShardSessionRecord> =
            self.sessions.iter().map(|s| s.value().clone()).collect();
        all.sort_by_key(|s| s.shard());
        all
    }
}

#[async_trait]
impl ShardedWorkRegistry for InMemoryShardedWorkRegistry {
    async fn pick_up(
        &self,
        shard: ShardIndex,
        worker: &WorkerId,
        now: DateTime<Utc>,
        expiry: TimeDelta,
    ) -> Result<PickUpOutcome> {
        match self.sessions.entry(shard) {
            Entry::Occupied(mut held) => {
                if held.get().is_stale(now, expiry) {
                    let session = ShardSessionRecord::open(shard, worker.clone(), now);
                    held.insert(session.clone());
                    Ok(PickUpOutcome::PickedUp(session))
                } else {
                    Ok(PickUpOutcome::AlreadyPicked {
                        worker: held.get().worker().clone(),
                        when_last_picked: held.get().when_last_picked(),
                    })
                }
            }
            Entry::Vacant(free) => {
                let session = ShardSessionRecord::open(shard, worker.clone(), now);
                free.insert(session.clone());
                Ok(PickUpOutcome::PickedUp(session))
            }
        }
    }

    async fn renew(
        &self,
        session: &ShardSessionRecord,
        now: DateTime<Utc>,
    ) -> Result<Option<ShardSessionRecord>> {
        let Some(mut stored) = self.sessions.get_mut(&session.shard()) else {
            return Ok(None);
        };
        if !stored.same_lease(session) {
            return Ok(None);
        }
        let renewed = stored.renewed(now);
        *stored = renewed.clone();
        Ok(Some(renewed))
    }

    async fn release(&self, session: &ShardSessionRecord) -> Result<()> {
        self.sessions
            .remove_if(&session.shard(), |_, stored| stored.same_lease(session));
        Ok(())
    }

    async fn release_expired(
        &self,
        now: DateTime<Utc>,
        expiry: TimeDelta,
    ) -> Result<Vec<ShardIndex>> {
        let mut released = Vec::new();
        self.sessions.retain(|shard, session| {
            let stale = session.is_stale(now, expiry);
            if stale {
                released.push(*shard);
            }
            !stale
        });
        released.sort();
        Ok(released)
    }
}
