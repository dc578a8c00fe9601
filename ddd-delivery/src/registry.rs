//! 分片工作登记（ShardedWorkRegistry）
//!
//! 集群范围内仲裁“哪个工作节点正在处理哪个分片”。占用以租约表示：
//! - 领取（pick up）是存储层的条件写（CAS），不是进程内锁；
//! - 租约在每处理完一页后续期，长时间未续期即视为过期，可被其他节点接管；
//! - 释放与续期都只作用于自己持有的那一份租约。
//!
//! 崩溃节点遗留的租约过期后由其他节点接管；由于移除是幂等的、顺序来自存储序号，
//! 接管后的重投只会导致处理器被重复调用，而不会丢失或跳过消息。
//!
use crate::{error::DeliveryResult as Result, shard::ShardIndex};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// 工作节点标识：节点 + 节点内的工作者名称
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId {
    node_id: String,
    worker: String,
}

impl WorkerId {
    pub fn new(node_id: impl Into<String>, worker: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            worker: worker.into(),
        }
    }

    /// 为当前进程生成一个随机节点下的工作者
    pub fn generate(worker: impl Into<String>) -> Self {
        Self::new(Uuid::new_v4().to_string(), worker)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node_id, self.worker)
    }
}

/// 分片租约记录
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSessionRecord {
    shard: ShardIndex,
    worker: WorkerId,
    lease_id: Uuid,
    picked_at: DateTime<Utc>,
    when_last_picked: DateTime<Utc>,
}

impl ShardSessionRecord {
    /// 新租约，每次领取都会生成新的 `lease_id`
    pub fn open(shard: ShardIndex, worker: WorkerId, at: DateTime<Utc>) -> Self {
        Self {
            shard,
            worker,
            lease_id: Uuid::new_v4(),
            picked_at: at,
            when_last_picked: at,
        }
    }

    pub fn shard(&self) -> ShardIndex {
        self.shard
    }

    pub fn worker(&self) -> &WorkerId {
        &self.worker
    }

    pub fn lease_id(&self) -> Uuid {
        self.lease_id
    }

    pub fn picked_at(&self) -> DateTime<Utc> {
        self.picked_at
    }

    pub fn when_last_picked(&self) -> DateTime<Utc> {
        self.when_last_picked
    }

    /// 最近一次续期距今已超过 `expiry` 即视为过期
    pub fn is_stale(&self, now: DateTime<Utc>, expiry: TimeDelta) -> bool {
        match self.when_last_picked.checked_add_signed(expiry) {
            Some(deadline) => deadline <= now,
            None => false,
        }
    }

    pub fn same_lease(&self, other: &ShardSessionRecord) -> bool {
        self.shard == other.shard && self.lease_id == other.lease_id
    }

    pub fn renewed(&self, at: DateTime<Utc>) -> Self {
        Self {
            when_last_picked: at,
            ..self.clone()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PickUpOutcome {
    PickedUp(ShardSessionRecord),
    /// 分片被其他存活节点占用，属于预期结果而非错误
    AlreadyPicked {
        worker: WorkerId,
        when_last_picked: DateTime<Utc>,
    },
}

impl PickUpOutcome {
    pub fn session(self) -> Option<ShardSessionRecord> {
        match self {
            PickUpOutcome::PickedUp(s) => Some(s),
            PickUpOutcome::AlreadyPicked { .. } => None,
        }
    }
}

#[async_trait]
pub trait ShardedWorkRegistry: Send + Sync {
    /// 分片未被占用或现有租约已过期时原子地领取
    async fn pick_up(
        &self,
        shard: ShardIndex,
        worker: &WorkerId,
        now: DateTime<Utc>,
        expiry: TimeDelta,
    ) -> Result<PickUpOutcome>;

    /// 续期；租约已被他人接管时返回 `None`
    async fn renew(
        &self,
        session: &ShardSessionRecord,
        now: DateTime<Utc>,
    ) -> Result<Option<ShardSessionRecord>>;

    /// 主动释放；租约已不属于该会话时不做任何事
    async fn release(&self, session: &ShardSessionRecord) -> Result<()>;

    /// 清除全部过期租约，返回被释放的分片
    async fn release_expired(&self, now: DateTime<Utc>, expiry: TimeDelta)
    -> Result<Vec<ShardIndex>>;
}
