//! 投递编排（Delivery）
//!
//! 持有分片策略、收件箱、工作登记表、处理器查找表与监控，负责：
//! - 生产者入口：计算分片并写入收件箱（去重）；
//! - 按分片投递：领取租约 → 分页执行阶段 → 续约/询问监控 → 清理过期记录 → 释放租约；
//! - 追赶：登记与推进投影的历史回放。
//!
//! 每个分片的状态：空闲 → 已领取 → 投递中 →（空闲 | 失败）。
//!
use crate::catch_up::{CatchUpId, CatchUpProcess, CatchUpState, CatchUpStorage, EventLog};
use crate::clock::{Clock, SystemClock};
use crate::config::DeliveryConfig;
use crate::error::{DeliveryError, DeliveryResult};
use crate::event::SerializedEvent;
use crate::handler::{HandlerRegistry, MessageHandler};
use crate::inbox::{Inbox, InboxStorage, Incoming, WriteOutcome};
use crate::memory::{
    InMemoryCatchUpStorage, InMemoryEventLog, InMemoryInboxStorage, InMemoryShardedWorkRegistry,
};
use crate::message::{CommandMessage, InboxLabel, Payload, Target, TypeUrl};
use crate::monitor::{AlwaysContinue, DeliveryMonitor, StageDecision};
use crate::registry::{PickUpOutcome, ShardSessionRecord, ShardedWorkRegistry, WorkerId};
use crate::shard::{DeliveryStrategy, ShardIndex, UniformAcrossAllShards};
use crate::stage::{DeliveryStats, StageRunner};
use bon::bon;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 生产者写入的结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued { shard: ShardIndex, version: u64 },
    /// 去重窗口内已存在相同消息，本次写入被吸收
    Duplicate { shard: ShardIndex },
}

impl EnqueueOutcome {
    pub fn shard(&self) -> ShardIndex {
        match self {
            EnqueueOutcome::Enqueued { shard, .. } | EnqueueOutcome::Duplicate { shard } => *shard,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, EnqueueOutcome::Duplicate { .. })
    }
}

pub struct Delivery {
    inbox: Arc<Inbox>,
    work_registry: Arc<dyn ShardedWorkRegistry>,
    strategy: Arc<dyn DeliveryStrategy>,
    handlers: HandlerRegistry,
    monitor: Arc<dyn DeliveryMonitor>,
    clock: Arc<dyn Clock>,
    catch_up: CatchUpProcess,
    config: DeliveryConfig,
}

#[bon]
impl Delivery {
    /// 未提供的存储组件使用内存实现；未提供策略时所有目标落在单一分片。
    #[builder]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        handlers: Vec<Arc<dyn MessageHandler>>,
        inbox_storage: Option<Arc<dyn InboxStorage>>,
        work_registry: Option<Arc<dyn ShardedWorkRegistry>>,
        catch_up_storage: Option<Arc<dyn CatchUpStorage>>,
        event_log: Option<Arc<dyn EventLog>>,
        strategy: Option<Arc<dyn DeliveryStrategy>>,
        monitor: Option<Arc<dyn DeliveryMonitor>>,
        clock: Option<Arc<dyn Clock>>,
        #[builder(default)] config: DeliveryConfig,
    ) -> DeliveryResult<Self> {
        config.validate()?;
        let handlers = HandlerRegistry::new(handlers)?;
        if handlers.is_empty() {
            return Err(DeliveryError::invalid_config(
                "at least one message handler is required",
            ));
        }

        let strategy: Arc<dyn DeliveryStrategy> =
            strategy.unwrap_or_else(|| Arc::new(UniformAcrossAllShards::single_shard()));
        if strategy.shard_count() == 0 {
            return Err(DeliveryError::invalid_config("shard count must be positive"));
        }
        let clock: Arc<dyn Clock> = clock.unwrap_or_else(|| Arc::new(SystemClock));
        let monitor: Arc<dyn DeliveryMonitor> = monitor.unwrap_or_else(|| Arc::new(AlwaysContinue));
        let inbox_storage =
            inbox_storage.unwrap_or_else(|| Arc::new(InMemoryInboxStorage::default()));

        let inbox = Arc::new(Inbox::new(
            inbox_storage,
            strategy.clone(),
            clock.clone(),
            config.dedup_window_delta(),
        ));
        let catch_up = CatchUpProcess::new(
            catch_up_storage.unwrap_or_else(|| Arc::new(InMemoryCatchUpStorage::default())),
            event_log.unwrap_or_else(|| Arc::new(InMemoryEventLog::default())),
            inbox.clone(),
            handlers.clone(),
            monitor.clone(),
            clock.clone(),
            config.catch_up_page_size,
        );

        Ok(Self {
            inbox,
            work_registry: work_registry
                .unwrap_or_else(|| Arc::new(InMemoryShardedWorkRegistry::default())),
            strategy,
            handlers,
            monitor,
            clock,
            catch_up,
            config,
        })
    }
}

impl Delivery {
    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    pub fn shard_count(&self) -> u32 {
        self.strategy.shard_count()
    }

    pub fn shards(&self) -> impl Iterator<Item = ShardIndex> + use<> {
        ShardIndex::all(self.shard_count())
    }

    pub fn shard_of(&self, target: &Target) -> ShardIndex {
        self.inbox.shard_of(target)
    }

    /// 因去重而被吸收的写入次数
    pub fn duplicates_absorbed(&self) -> u64 {
        self.inbox.duplicates_absorbed()
    }

    /// 每次有新消息写入收件箱时被通知
    pub fn write_notifier(&self) -> Arc<Notify> {
        self.inbox.write_notifier()
    }

    /// 生产者入口：将消息写入目标所在分片的收件箱
    pub async fn enqueue(&self, target: Target, payload: Payload) -> DeliveryResult<EnqueueOutcome> {
        self.handlers.require(target.type_url())?;
        let label = match payload {
            Payload::Command(_) => InboxLabel::HandleCommand,
            Payload::Event(_) => InboxLabel::UpdateSubscriber,
            Payload::CatchUpStarted(_) => {
                return Err(DeliveryError::invalid_argument(
                    "catch-up markers are written by the catch-up process only",
                ));
            }
        };
        let shard = self.shard_of(&target);
        let outcome = self
            .inbox
            .write(Incoming {
                target,
                label,
                message_id: payload.signal_id().to_string(),
                payload,
                catch_up: None,
            })
            .await?;

        Ok(match outcome {
            WriteOutcome::Appended { version } => EnqueueOutcome::Enqueued { shard, version },
            WriteOutcome::Duplicate => EnqueueOutcome::Duplicate { shard },
        })
    }

    pub async fn enqueue_command(
        &self,
        target: Target,
        command: CommandMessage,
    ) -> DeliveryResult<EnqueueOutcome> {
        self.enqueue(target, Payload::Command(command)).await
    }

    pub async fn enqueue_event(
        &self,
        target: Target,
        event: SerializedEvent,
    ) -> DeliveryResult<EnqueueOutcome> {
        self.enqueue(target, Payload::Event(event)).await
    }

    /// 投递一个分片直至其中没有可投递的消息。分片被其他节点占用时返回 `Ok(None)`。
    pub async fn deliver_messages_from(
        &self,
        shard: ShardIndex,
        worker: &WorkerId,
    ) -> DeliveryResult<Option<DeliveryStats>> {
        self.deliver_messages_until(shard, worker, &CancellationToken::new())
            .await
    }

    /// 与 `deliver_messages_from` 相同，但在每个阶段开始前检查取消信号
    #[tracing::instrument(name = "delivery.pass", skip_all, fields(shard = %shard, worker = %worker))]
    pub async fn deliver_messages_until(
        &self,
        shard: ShardIndex,
        worker: &WorkerId,
        token: &CancellationToken,
    ) -> DeliveryResult<Option<DeliveryStats>> {
        self.check_shard(shard)?;

        let now = self.clock.now();
        let mut session = match self
            .work_registry
            .pick_up(shard, worker, now, self.config.lease_expiry())
            .await?
        {
            PickUpOutcome::PickedUp(session) => session,
            PickUpOutcome::AlreadyPicked {
                worker: owner,
                when_last_picked,
            } => {
                debug!(%owner, %when_last_picked, "shard is picked up by another worker");
                return Ok(None);
            }
        };

        self.monitor.on_delivery_started(shard);
        let mut stats = DeliveryStats::new(shard, worker.clone(), now);

        let purged = match self.run_pass(&mut session, token, &mut stats).await {
            Ok(purged) => purged,
            Err(err) => {
                error!(error = %err, "delivery pass failed");
                self.monitor.on_delivery_failed(shard, &err);
                if let Err(release_err) = self.work_registry.release(&session).await {
                    warn!(error = %release_err, "failed to release shard after failure");
                }
                return Err(err);
            }
        };
        if !stats.lease_lost() {
            self.work_registry.release(&session).await?;
        }
        stats.finish(purged, self.clock.now());

        if stats.read() > 0 {
            info!(
                stages = stats.stages(),
                delivered = stats.delivered(),
                held = stats.held(),
                failed_targets = stats.failed_targets(),
                "shard delivered"
            );
        }
        self.monitor.on_delivery_completed(&stats);
        Ok(Some(stats))
    }

    /// 执行全部阶段，租约仍在时清理过期的已投递记录，返回清理数
    async fn run_pass(
        &self,
        session: &mut ShardSessionRecord,
        token: &CancellationToken,
        stats: &mut DeliveryStats,
    ) -> DeliveryResult<usize> {
        self.run_stages(session, token, stats).await?;
        if stats.lease_lost() {
            return Ok(0);
        }
        self.inbox.purge_expired(session.shard()).await
    }

    async fn run_stages(
        &self,
        session: &mut ShardSessionRecord,
        token: &CancellationToken,
        stats: &mut DeliveryStats,
    ) -> DeliveryResult<()> {
        let shard = session.shard();
        let runner = StageRunner {
            handlers: &self.handlers,
            inbox: &self.inbox,
            monitor: &self.monitor,
            concurrency: self.config.target_concurrency,
        };
        let mut cursor: Option<u64> = None;
        let mut blocked: HashSet<Target> = HashSet::new();
        let mut number = 0;

        loop {
            if token.is_cancelled() {
                debug!("delivery pass cancelled");
                stats.cancel();
                return Ok(());
            }

            let page = self
                .inbox
                .read_page(shard, cursor, self.config.page_size)
                .await?;
            if page.is_empty() {
                return Ok(());
            }
            cursor = page.last_version();
            let more = page.is_full();
            let gate = self.catch_up.gate().await?;

            number += 1;
            let stage = runner.run(shard, number, page, &gate, &blocked).await?;
            blocked.extend(stage.failed_targets().iter().cloned());
            stats.record(&stage);

            match self.work_registry.renew(session, self.clock.now()).await? {
                Some(renewed) => *session = renewed,
                None => {
                    warn!("lease lost during delivery, stopping");
                    stats.lose_lease();
                    return Ok(());
                }
            }

            if self.monitor.on_stage_completed(&stage) == StageDecision::Stop {
                debug!(stage = number, "monitor stopped the delivery pass");
                stats.stop_by_monitor();
                return Ok(());
            }
            if !more {
                return Ok(());
            }
        }
    }

    /// 依次投递所有分片，跳过被其他节点占用的分片
    pub async fn deliver_all(&self, worker: &WorkerId) -> DeliveryResult<Vec<DeliveryStats>> {
        let mut all = Vec::new();
        for shard in self.shards() {
            if let Some(stats) = self.deliver_messages_from(shard, worker).await? {
                all.push(stats);
            }
        }
        Ok(all)
    }

    /// 清除已过期的租约，返回可重新领取的分片
    pub async fn release_expired_sessions(&self) -> DeliveryResult<Vec<ShardIndex>> {
        let released = self
            .work_registry
            .release_expired(self.clock.now(), self.config.lease_expiry())
            .await?;
        for shard in &released {
            warn!(%shard, "expired shard lease released");
        }
        Ok(released)
    }

    /// 为投影登记一次追赶；`targets` 为 `None` 时覆盖该投影的全部实例
    pub async fn start_catch_up(
        &self,
        projection_type: TypeUrl,
        targets: Option<Vec<String>>,
        since: DateTime<Utc>,
    ) -> DeliveryResult<CatchUpId> {
        self.catch_up.start(projection_type, targets, since).await
    }

    /// 将所有未完成的追赶各推进一步
    pub async fn process_catch_ups(&self) -> DeliveryResult<Vec<CatchUpState>> {
        self.catch_up.process_all().await
    }

    pub async fn catch_up_state(&self, id: CatchUpId) -> DeliveryResult<CatchUpState> {
        self.catch_up
            .read(id)
            .await?
            .ok_or(DeliveryError::CatchUpNotFound { id: id.to_string() })
    }

    fn check_shard(&self, shard: ShardIndex) -> DeliveryResult<()> {
        if shard.of_total() != self.shard_count() {
            return Err(DeliveryError::invalid_argument(format!(
                "shard {shard} does not belong to a {}-shard delivery",
                self.shard_count()
            )));
        }
        Ok(())
    }
}
