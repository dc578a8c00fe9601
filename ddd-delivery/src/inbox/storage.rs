//! 收件箱存储协议（InboxStorage）
//!
//! 按分片组织、分片内按序号排序的持久化消息日志，并承担去重簿记。
//! 所有修改以消息 ID 为键且幂等，因此可被多个工作节点并发访问。
//!
use crate::{
    error::DeliveryResult as Result,
    message::{InboxLabel, InboxMessage, TypeUrl},
    shard::ShardIndex,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// 已追加，携带分片内序号
    Appended { version: u64 },
    /// 相同 (目标, message_id) 的记录仍然有效，本次写入被吸收
    Duplicate,
}

#[async_trait]
pub trait InboxStorage: Send + Sync {
    /// 条件追加：同一目标下相同 `message_id` 的记录仍占据去重键时不写入。
    /// 检查与追加必须对该键原子执行，并为新记录分配分片内单调递增的序号。
    async fn write(&self, message: InboxMessage, now: DateTime<Utc>) -> Result<WriteOutcome>;

    /// 读取分片内序号大于 `after` 的待投递消息，按序号升序，最多 `limit` 条
    async fn read_page(
        &self,
        shard: ShardIndex,
        after: Option<u64>,
        limit: usize,
    ) -> Result<Vec<InboxMessage>>;

    /// 将消息标记为已投递并保留至 `keep_until`；缺失的记录忽略
    async fn mark_delivered(
        &self,
        messages: &[InboxMessage],
        keep_until: DateTime<Utc>,
    ) -> Result<()>;

    /// 按 (ID, 序号) 删除消息；缺失或序号不符的记录忽略
    async fn remove_all(&self, messages: &[InboxMessage]) -> Result<()>;

    /// 清理保留期已过的已投递消息，返回清理条数
    async fn remove_expired(&self, shard: ShardIndex, now: DateTime<Utc>) -> Result<usize>;

    /// 统计某目标类型下指定用途的待投递消息（跨全部分片）
    async fn count_pending(&self, target_type: &TypeUrl, label: InboxLabel) -> Result<usize>;
}
