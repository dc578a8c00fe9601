//! 投递阶段（DeliveryStage）
//!
//! 一个阶段处理从分片读出的一页消息：按目标分组并保持组内顺序，
//! 不同目标并发投递（上限 `target_concurrency`），同一目标串行。
//!
use crate::catch_up::{CatchUpGate, LiveVerdict};
use crate::error::DeliveryResult;
use crate::handler::{DispatchError, HandlerRegistry};
use crate::inbox::{Inbox, InboxPage};
use crate::message::{InboxMessage, Payload, Target};
use crate::monitor::{DeliveryMonitor, FailureReaction};
use crate::registry::WorkerId;
use crate::shard::ShardIndex;
use chrono::{DateTime, Utc};
use futures_util::{StreamExt, stream};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// 单个阶段的结果
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryStage {
    shard: ShardIndex,
    number: u32,
    read: usize,
    delivered: usize,
    duplicates: usize,
    held: usize,
    discarded: usize,
    skipped: usize,
    failed_targets: Vec<Target>,
}

impl DeliveryStage {
    fn new(shard: ShardIndex, number: u32, read: usize) -> Self {
        Self {
            shard,
            number,
            read,
            delivered: 0,
            duplicates: 0,
            held: 0,
            discarded: 0,
            skipped: 0,
            failed_targets: Vec::new(),
        }
    }

    pub fn shard(&self) -> ShardIndex {
        self.shard
    }

    /// 本轮投递中的阶段序号，从 1 开始
    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn read(&self) -> usize {
        self.read
    }

    pub fn delivered(&self) -> usize {
        self.delivered
    }

    /// 追赶完成后作为重复而移除的实时副本数
    pub fn duplicates(&self) -> usize {
        self.duplicates
    }

    /// 因追赶尚未完成而留在收件箱的实时消息数
    pub fn held(&self) -> usize {
        self.held
    }

    /// 处理失败后按监控决定丢弃的消息数
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    /// 因所属目标已失败而本轮跳过的消息数
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn failed_targets(&self) -> &[Target] {
        &self.failed_targets
    }

    fn absorb(&mut self, outcome: TargetOutcome) {
        self.delivered += outcome.delivered;
        self.duplicates += outcome.duplicates;
        self.held += outcome.held;
        self.discarded += outcome.discarded;
        self.skipped += outcome.skipped;
        if outcome.failed {
            self.failed_targets.push(outcome.target);
        }
    }
}

/// 一次投递（一次租约持有期间）的汇总
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryStats {
    shard: ShardIndex,
    worker: WorkerId,
    stages: u32,
    read: usize,
    delivered: usize,
    duplicates: usize,
    held: usize,
    discarded: usize,
    skipped: usize,
    failed_targets: usize,
    purged: usize,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    stopped_by_monitor: bool,
    lease_lost: bool,
    cancelled: bool,
}

impl DeliveryStats {
    pub(crate) fn new(shard: ShardIndex, worker: WorkerId, started_at: DateTime<Utc>) -> Self {
        Self {
            shard,
            worker,
            stages: 0,
            read: 0,
            delivered: 0,
            duplicates: 0,
            held: 0,
            discarded: 0,
            skipped: 0,
            failed_targets: 0,
            purged: 0,
            started_at,
            finished_at: None,
            stopped_by_monitor: false,
            lease_lost: false,
            cancelled: false,
        }
    }

    pub(crate) fn record(&mut self, stage: &DeliveryStage) {
        self.stages += 1;
        self.read += stage.read;
        self.delivered += stage.delivered;
        self.duplicates += stage.duplicates;
        self.held += stage.held;
        self.discarded += stage.discarded;
        self.skipped += stage.skipped;
        self.failed_targets += stage.failed_targets.len();
    }

    pub(crate) fn stop_by_monitor(&mut self) {
        self.stopped_by_monitor = true;
    }

    pub(crate) fn lose_lease(&mut self) {
        self.lease_lost = true;
    }

    pub(crate) fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub(crate) fn finish(&mut self, purged: usize, at: DateTime<Utc>) {
        self.purged = purged;
        self.finished_at = Some(at);
    }

    pub fn shard(&self) -> ShardIndex {
        self.shard
    }

    pub fn worker(&self) -> &WorkerId {
        &self.worker
    }

    pub fn stages(&self) -> u32 {
        self.stages
    }

    pub fn read(&self) -> usize {
        self.read
    }

    pub fn delivered(&self) -> usize {
        self.delivered
    }

    pub fn duplicates(&self) -> usize {
        self.duplicates
    }

    pub fn held(&self) -> usize {
        self.held
    }

    pub fn discarded(&self) -> usize {
        self.discarded
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn failed_targets(&self) -> usize {
        self.failed_targets
    }

    /// 本轮结束时清理的过期已投递记录数
    pub fn purged(&self) -> usize {
        self.purged
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn stopped_by_monitor(&self) -> bool {
        self.stopped_by_monitor
    }

    pub fn lease_lost(&self) -> bool {
        self.lease_lost
    }

    pub fn cancelled(&self) -> bool {
        self.cancelled
    }
}

struct TargetOutcome {
    target: Target,
    delivered: usize,
    duplicates: usize,
    held: usize,
    discarded: usize,
    skipped: usize,
    failed: bool,
}

impl TargetOutcome {
    fn new(target: Target) -> Self {
        Self {
            target,
            delivered: 0,
            duplicates: 0,
            held: 0,
            discarded: 0,
            skipped: 0,
            failed: false,
        }
    }
}

pub(crate) struct StageRunner<'a> {
    pub(crate) handlers: &'a HandlerRegistry,
    pub(crate) inbox: &'a Inbox,
    pub(crate) monitor: &'a Arc<dyn DeliveryMonitor>,
    pub(crate) concurrency: usize,
}

impl StageRunner<'_> {
    /// 投递一页消息。`blocked` 中的目标在本轮早先阶段已失败，其消息全部跳过；
    /// 本阶段新失败的目标会出现在返回值的 `failed_targets` 中。
    pub(crate) async fn run(
        &self,
        shard: ShardIndex,
        number: u32,
        page: InboxPage,
        gate: &CatchUpGate,
        blocked: &HashSet<Target>,
    ) -> DeliveryResult<DeliveryStage> {
        let mut stage = DeliveryStage::new(shard, number, page.messages().len());
        let groups = group_by_target(page.into_messages());

        let results: Vec<DeliveryResult<TargetOutcome>> = stream::iter(groups)
            .map(move |(target, messages)| {
                let is_blocked = blocked.contains(&target);
                self.deliver_target(target, messages, gate, is_blocked)
            })
            .buffer_unordered(self.concurrency.max(1))
            .collect()
            .await;

        // 所有目标结束后再上报首个错误
        let mut first_error = None;
        for result in results {
            match result {
                Ok(outcome) => stage.absorb(outcome),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(stage),
        }
    }

    async fn deliver_target(
        &self,
        target: Target,
        messages: Vec<InboxMessage>,
        gate: &CatchUpGate,
        blocked: bool,
    ) -> DeliveryResult<TargetOutcome> {
        let mut outcome = TargetOutcome::new(target);
        if blocked {
            outcome.skipped = messages.len();
            return Ok(outcome);
        }

        let handler = self.handlers.get(outcome.target.type_url());
        let total = messages.len();
        let mut done: Vec<InboxMessage> = Vec::with_capacity(total);

        for (position, message) in messages.into_iter().enumerate() {
            match gate.verdict(&message, handler) {
                LiveVerdict::Hold => {
                    outcome.held += 1;
                    continue;
                }
                LiveVerdict::Duplicate => {
                    outcome.duplicates += 1;
                    done.push(message);
                    continue;
                }
                LiveVerdict::Deliver => {}
            }

            let result = match (handler, message.payload()) {
                (Some(h), Payload::CatchUpStarted(_)) => {
                    h.on_catch_up_started(outcome.target.id()).await
                }
                (Some(h), _) if h.accepts(message.message_type()) => h.dispatch(&message).await,
                (Some(h), _) => Err(DispatchError::fatal(anyhow::anyhow!(
                    "handler `{}` does not accept `{}`",
                    h.handler_name(),
                    message.message_type()
                ))),
                (None, _) => Err(DispatchError::fatal(anyhow::anyhow!(
                    "no handler registered for {}",
                    outcome.target.type_url()
                ))),
            };

            match result {
                Ok(()) => {
                    outcome.delivered += 1;
                    done.push(message);
                }
                Err(err) => match self.monitor.on_reception_failure(&message, &err) {
                    FailureReaction::MarkDelivered => {
                        warn!(
                            target = %outcome.target,
                            message = %message.id(),
                            message_type = message.message_type(),
                            error = %err,
                            "discarding message after failed dispatch"
                        );
                        outcome.discarded += 1;
                        done.push(message);
                    }
                    FailureReaction::RetryLater => {
                        warn!(
                            target = %outcome.target,
                            message = %message.id(),
                            error = %err,
                            "dispatch failed, target will be retried later"
                        );
                        outcome.failed = true;
                        outcome.skipped = total - position - 1;
                        break;
                    }
                },
            }
        }

        self.inbox.complete(&done).await?;
        debug!(
            target = %outcome.target,
            delivered = outcome.delivered,
            held = outcome.held,
            "target delivered"
        );
        Ok(outcome)
    }
}

/// 按目标分组，组的顺序为目标在页中首次出现的顺序，组内保持版本顺序
fn group_by_target(messages: Vec<InboxMessage>) -> Vec<(Target, Vec<InboxMessage>)> {
    let mut groups: Vec<(Target, Vec<InboxMessage>)> = Vec::new();
    let mut positions: HashMap<Target, usize> = HashMap::new();
    for message in messages {
        match positions.get(message.target()) {
            Some(&i) => groups[i].1.push(message),
            None => {
                positions.insert(message.target().clone(), groups.len());
                groups.push((message.target().clone(), vec![message]));
            }
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn grouping_keeps_first_seen_order_and_per_target_order() {
        let messages = vec![
            testing::command_message("a", "1"),
            testing::command_message("b", "2"),
            testing::command_message("a", "3"),
            testing::command_message("c", "4"),
            testing::command_message("b", "5"),
        ];
        let groups = group_by_target(messages);
        let ids: Vec<(&str, Vec<&str>)> = groups
            .iter()
            .map(|(t, ms)| (t.id(), ms.iter().map(|m| m.message_id()).collect()))
            .collect();
        assert_eq!(
            ids,
            vec![("a", vec!["1", "3"]), ("b", vec!["2", "5"]), ("c", vec!["4"])]
        );
    }

    #[test]
    fn stats_accumulate_stages() {
        let shard = ShardIndex::new(0, 1).unwrap();
        let mut stats = DeliveryStats::new(shard, WorkerId::new("n", "w"), Utc::now());
        let mut stage = DeliveryStage::new(shard, 1, 3);
        stage.absorb(TargetOutcome {
            delivered: 2,
            skipped: 1,
            failed: true,
            ..TargetOutcome::new(testing::command_message("a", "1").target().clone())
        });
        stats.record(&stage);
        stats.record(&DeliveryStage::new(shard, 2, 0));
        stats.finish(4, Utc::now());

        assert_eq!(stats.stages(), 2);
        assert_eq!(stats.read(), 3);
        assert_eq!(stats.delivered(), 2);
        assert_eq!(stats.skipped(), 1);
        assert_eq!(stats.failed_targets(), 1);
        assert_eq!(stats.purged(), 4);
        assert!(stats.finished_at().is_some());
        assert_eq!(stage.failed_targets()[0].id(), "a");
    }
}
