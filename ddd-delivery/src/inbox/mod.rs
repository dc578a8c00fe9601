//! 收件箱（Inbox）
//!
//! 构建在 `InboxStorage` 之上的投递队列：
//! - 追加时由策略计算分片，并在去重窗口内吸收重复消息（计数可观测）；
//! - 按分片分页读取，校验存储返回的记录确属该分片；
//! - 投递完成后按去重窗口选择删除或标记为已投递并保留。
//!
mod storage;

pub use storage::{InboxStorage, WriteOutcome};

use crate::catch_up::CatchUpId;
use crate::clock::Clock;
use crate::error::{DeliveryError, DeliveryResult};
use crate::message::{InboxLabel, InboxMessage, Payload, Target, TypeUrl};
use crate::shard::{DeliveryStrategy, ShardIndex};
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;
use tracing::debug;

/// 一条待写入的消息（分片与序号由收件箱与存储补全）
pub(crate) struct Incoming {
    pub(crate) target: Target,
    pub(crate) label: InboxLabel,
    pub(crate) message_id: String,
    pub(crate) payload: Payload,
    pub(crate) catch_up: Option<CatchUpId>,
}

/// 一页待投递消息，内容在读取时固定
#[derive(Debug, Clone)]
pub struct InboxPage {
    messages: Vec<InboxMessage>,
    limit: usize,
}

impl InboxPage {
    pub fn messages(&self) -> &[InboxMessage] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<InboxMessage> {
        self.messages
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// 读满一页意味着分片中可能还有更多消息
    pub fn is_full(&self) -> bool {
        self.messages.len() >= self.limit
    }

    pub fn last_version(&self) -> Option<u64> {
        self.messages.last().map(InboxMessage::version)
    }
}

pub struct Inbox {
    storage: Arc<dyn InboxStorage>,
    strategy: Arc<dyn DeliveryStrategy>,
    clock: Arc<dyn Clock>,
    dedup_window: TimeDelta,
    duplicates: AtomicU64,
    written: Arc<Notify>,
}

impl Inbox {
    pub(crate) fn new(
        storage: Arc<dyn InboxStorage>,
        strategy: Arc<dyn DeliveryStrategy>,
        clock: Arc<dyn Clock>,
        dedup_window: TimeDelta,
    ) -> Self {
        Self {
            storage,
            strategy,
            clock,
            dedup_window,
            duplicates: AtomicU64::new(0),
            written: Arc::new(Notify::new()),
        }
    }

    pub fn shard_of(&self, target: &Target) -> ShardIndex {
        self.strategy.index_for(target.id(), target.type_url())
    }

    pub(crate) async fn write(&self, incoming: Incoming) -> DeliveryResult<WriteOutcome> {
        let now = self.clock.now();
        let shard = self.shard_of(&incoming.target);
        let message = InboxMessage::builder()
            .message_id(incoming.message_id)
            .target(incoming.target)
            .shard(shard)
            .label(incoming.label)
            .payload(incoming.payload)
            .when_received(now)
            .maybe_catch_up(incoming.catch_up)
            .build();
        let id = message.id();

        let outcome = self.storage.write(message, now).await?;
        match outcome {
            WriteOutcome::Appended { version } => {
                debug!(%shard, %id, version, "inbox message appended");
                self.written.notify_one();
            }
            WriteOutcome::Duplicate => {
                self.duplicates.fetch_add(1, Ordering::Relaxed);
                debug!(%shard, "duplicate inbox message absorbed");
            }
        }
        Ok(outcome)
    }

    pub(crate) async fn read_page(
        &self,
        shard: ShardIndex,
        after: Option<u64>,
        limit: usize,
    ) -> DeliveryResult<InboxPage> {
        let messages = self.storage.read_page(shard, after, limit).await?;
        let mut previous = after;
        for m in &messages {
            if m.shard() != shard {
                return Err(DeliveryError::corrupted(format!(
                    "message {} of shard {} returned for shard {shard}",
                    m.id(),
                    m.shard()
                )));
            }
            if previous.is_some_and(|p| m.version() <= p) {
                return Err(DeliveryError::corrupted(format!(
                    "page of shard {shard} is not ordered by version"
                )));
            }
            previous = Some(m.version());
        }
        Ok(InboxPage { messages, limit })
    }

    /// 投递完成：窗口为零时删除，否则标记为已投递并保留到窗口结束
    pub(crate) async fn complete(&self, messages: &[InboxMessage]) -> DeliveryResult<()> {
        if messages.is_empty() {
            return Ok(());
        }
        if self.dedup_window.is_zero() {
            self.storage.remove_all(messages).await
        } else {
            let keep_until = self
                .clock
                .now()
                .checked_add_signed(self.dedup_window)
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            self.storage.mark_delivered(messages, keep_until).await
        }
    }

    pub(crate) async fn purge_expired(&self, shard: ShardIndex) -> DeliveryResult<usize> {
        self.storage.remove_expired(shard, self.clock.now()).await
    }

    pub(crate) async fn count_pending(
        &self,
        target_type: &TypeUrl,
        label: InboxLabel,
    ) -> DeliveryResult<usize> {
        self.storage.count_pending(target_type, label).await
    }

    /// 因去重而被吸收的写入次数
    pub fn duplicates_absorbed(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    /// 每次成功追加都会通知一次，供工作循环即时唤醒
    pub fn write_notifier(&self) -> Arc<Notify> {
        self.written.clone()
    }
}
