//! 追赶状态存储协议
//!
use super::{CatchUpId, CatchUpState};
use crate::error::DeliveryResult as Result;
use async_trait::async_trait;

#[async_trait]
pub trait CatchUpStorage: Send + Sync {
    async fn read(&self, id: CatchUpId) -> Result<Option<CatchUpState>>;

    async fn read_all(&self) -> Result<Vec<CatchUpState>>;

    /// 条件写入：仅当已存储版本等于 `expected_version` 时生效（`None` 表示必须不存在）。
    /// 返回 `false` 表示被其他节点抢先更新。
    async fn write(&self, state: &CatchUpState, expected_version: Option<u64>) -> Result<bool>;

    /// 删除已被同一投影更新的追赶取代的完成状态；不存在时忽略
    async fn remove(&self, id: CatchUpId) -> Result<()>;
}
