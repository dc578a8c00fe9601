//! 投影追赶（catch-up）
//!
//! 为新登记的投影回放历史事件，同时不干扰实时投递：
//! - `Started → InProgress`：分页读取事件日志，以 `CatchUp` 用途写入目标收件箱；
//! - `InProgress → CaughtUp`：读到不足一页，说明已追到“当前”；
//! - `CaughtUp → Completed`：该投影不再有待投递的追赶消息，恢复正常的实时投递。
//!
//! 每个实例的第一条历史副本之前写入一条追赶开始标记，投递时由处理器重置
//! 该实例的状态。追赶未完成期间，被覆盖目标的实时事件留在收件箱中暂不投递；
//! 完成后，确已被重放覆盖的实时副本作为重复消息移除，其余照常投递。
//!
mod event_log;
mod process;
mod storage;

pub use event_log::{EventLog, EventLogQuery};
pub use storage::CatchUpStorage;

pub(crate) use process::CatchUpProcess;

use crate::error::{DeliveryError, DeliveryResult};
use crate::event::SerializedEvent;
use crate::handler::MessageHandler;
use crate::message::{InboxLabel, InboxMessage, TypeUrl};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CatchUpId(Uuid);

impl CatchUpId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for CatchUpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for CatchUpId {
    type Err = DeliveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatchUpStatus {
    Started,
    InProgress,
    CaughtUp,
    Completed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CatchUpState {
    id: CatchUpId,
    projection_type: TypeUrl,
    /// `None` 表示覆盖该投影的全部实例
    targets: Option<BTreeSet<String>>,
    status: CatchUpStatus,
    /// 只回放发生于该时间之后的事件
    since: DateTime<Utc>,
    /// 已写入收件箱的最后一个事件位点
    last_sequence: Option<i64>,
    /// 已写入收件箱的历史副本数
    replayed: u64,
    /// 已写入开始标记的实例
    #[serde(default)]
    started_targets: BTreeSet<String>,
    /// 用于条件写入
    version: u64,
    started_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl CatchUpState {
    pub(crate) fn start(
        projection_type: TypeUrl,
        targets: Option<Vec<String>>,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DeliveryResult<Self> {
        let targets = match targets {
            Some(ids) if ids.is_empty() => {
                return Err(DeliveryError::invalid_argument(
                    "catch-up target list is empty; pass None to cover every instance",
                ));
            }
            Some(ids) => Some(ids.into_iter().collect::<BTreeSet<_>>()),
            None => None,
        };
        Ok(Self {
            id: CatchUpId::generate(),
            projection_type,
            targets,
            status: CatchUpStatus::Started,
            since,
            last_sequence: None,
            replayed: 0,
            started_targets: BTreeSet::new(),
            version: 1,
            started_at: now,
            updated_at: now,
        })
    }

    pub fn id(&self) -> CatchUpId {
        self.id
    }

    pub fn projection_type(&self) -> &TypeUrl {
        &self.projection_type
    }

    pub fn targets(&self) -> Option<&BTreeSet<String>> {
        self.targets.as_ref()
    }

    pub fn status(&self) -> CatchUpStatus {
        self.status
    }

    pub fn since(&self) -> DateTime<Utc> {
        self.since
    }

    pub fn last_sequence(&self) -> Option<i64> {
        self.last_sequence
    }

    pub fn replayed(&self) -> u64 {
        self.replayed
    }

    pub fn started_targets(&self) -> &BTreeSet<String> {
        &self.started_targets
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_completed(&self) -> bool {
        self.status == CatchUpStatus::Completed
    }

    pub fn covers(&self, projection_type: &TypeUrl, target_id: &str) -> bool {
        &self.projection_type == projection_type
            && self
                .targets
                .as_ref()
                .is_none_or(|targets| targets.contains(target_id))
    }

    /// 历史副本的去重标识：同一次追赶中同一事件总是得到同一个 ID
    pub(crate) fn message_id_for(&self, event_id: &str) -> String {
        Uuid::new_v5(&self.id.0, event_id.as_bytes()).to_string()
    }

    /// 开始标记的去重标识，每个实例一个
    pub(crate) fn marker_id_for(&self, target_id: &str) -> String {
        Uuid::new_v5(&self.id.0, format!("started:{target_id}").as_bytes()).to_string()
    }

    /// 重放是否为 `target_id` 写入过该事件的历史副本，条件与回放查询一致
    pub(crate) fn replayed_copy_of(
        &self,
        event: &SerializedEvent,
        target_id: &str,
        handler: &dyn MessageHandler,
    ) -> bool {
        let within = match (event.sequence_number(), self.last_sequence) {
            (Some(seq), Some(last)) => seq <= last,
            _ => false,
        };
        within
            && event.occurred_at() >= self.since
            && handler.accepts(event.event_type())
            && handler.route(event).iter().any(|id| id == target_id)
    }

    pub(crate) fn with_started_targets(self, started_targets: BTreeSet<String>) -> Self {
        Self {
            started_targets,
            ..self
        }
    }

    pub(crate) fn advanced(
        &self,
        last_sequence: Option<i64>,
        replayed: usize,
        caught_up: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            status: if caught_up {
                CatchUpStatus::CaughtUp
            } else {
                CatchUpStatus::InProgress
            },
            last_sequence,
            replayed: self.replayed + replayed as u64,
            version: self.version + 1,
            updated_at: now,
            ..self.clone()
        }
    }

    pub(crate) fn completed(&self, now: DateTime<Utc>) -> Self {
        Self {
            status: CatchUpStatus::Completed,
            version: self.version + 1,
            updated_at: now,
            ..self.clone()
        }
    }
}

/// 实时事件在追赶期间的处置
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LiveVerdict {
    Deliver,
    Hold,
    Duplicate,
}

/// 一次投递阶段所见的追赶状态快照
#[derive(Clone, Debug, Default)]
pub(crate) struct CatchUpGate {
    states: Vec<CatchUpState>,
}

impl CatchUpGate {
    pub(crate) fn new(states: Vec<CatchUpState>) -> Self {
        Self { states }
    }

    /// `handler` 为目标类型的处理器，用于复核实时副本是否已被重放覆盖
    pub(crate) fn verdict(
        &self,
        message: &InboxMessage,
        handler: Option<&Arc<dyn MessageHandler>>,
    ) -> LiveVerdict {
        if message.label() != InboxLabel::UpdateSubscriber {
            return LiveVerdict::Deliver;
        }
        let target = message.target();
        let mut covering = self
            .states
            .iter()
            .filter(|s| s.covers(target.type_url(), target.id()))
            .peekable();
        if covering.peek().is_none() {
            return LiveVerdict::Deliver;
        }

        let event = message.payload().as_event();
        let mut verdict = LiveVerdict::Deliver;
        for state in covering {
            if !state.is_completed() {
                return LiveVerdict::Hold;
            }
            if let (Some(event), Some(handler)) = (event, handler) {
                if state.replayed_copy_of(event, target.id(), &**handler) {
                    verdict = LiveVerdict::Duplicate;
                }
            }
        }
        verdict
    }
}
