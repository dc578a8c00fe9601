//! 投递监控（DeliveryMonitor）
//!
//! 可插拔的观察者与调速器：在每个投递阶段结束后决定是否继续（背压/熔断的挂点），
//! 并决定如何处置处理失败的消息。默认策略为“始终继续”。
//!
use crate::catch_up::CatchUpState;
use crate::error::DeliveryError;
use crate::handler::DispatchError;
use crate::message::InboxMessage;
use crate::shard::ShardIndex;
use crate::stage::{DeliveryStage, DeliveryStats};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageDecision {
    Continue,
    Stop,
}

/// 处理失败后的处置方式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureReaction {
    /// 保留在收件箱原位，本轮跳过该目标，后续轮次按原顺序重试
    RetryLater,
    /// 视为已投递（丢弃），继续处理该目标的后续消息
    MarkDelivered,
}

pub trait DeliveryMonitor: Send + Sync {
    fn on_delivery_started(&self, _shard: ShardIndex) {}

    /// 每个阶段结束后调用，返回是否继续读取下一页
    fn on_stage_completed(&self, _stage: &DeliveryStage) -> StageDecision {
        StageDecision::Continue
    }

    fn on_delivery_completed(&self, _stats: &DeliveryStats) {}

    /// 阶段出现致命错误（如存储损坏）；租约随后被释放
    fn on_delivery_failed(&self, _shard: ShardIndex, _error: &DeliveryError) {}

    fn on_reception_failure(
        &self,
        _message: &InboxMessage,
        error: &DispatchError,
    ) -> FailureReaction {
        if error.is_recoverable() {
            FailureReaction::RetryLater
        } else {
            FailureReaction::MarkDelivered
        }
    }

    fn on_catch_up_completed(&self, _state: &CatchUpState) {}
}

/// 默认监控：始终继续
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysContinue;

impl DeliveryMonitor for AlwaysContinue {}
