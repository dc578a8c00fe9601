//! 收件箱消息模型
//!
//! - `Target`：目标实体（类型 URL + 实例 ID）；
//! - `Payload`：命令、事件或追赶开始标记的标签联合体；
//! - `InboxLabel`：消息在收件箱中的用途（处理命令、更新订阅者、追赶重放）；
//! - `InboxMessage`：收件箱中的一条待投递记录，由存储层独占并赋予分片内序号。
//!
use crate::catch_up::CatchUpId;
use crate::error::{DeliveryError, DeliveryResult};
use crate::event::SerializedEvent;
use crate::shard::ShardIndex;
use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// 目标实体的类型 URL
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeUrl(String);

impl TypeUrl {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TypeUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TypeUrl {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// 可寻址的投递目标
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Target {
    type_url: TypeUrl,
    id: String,
}

impl Target {
    pub fn new(type_url: impl Into<TypeUrl>, id: impl Into<String>) -> DeliveryResult<Self> {
        let type_url = type_url.into();
        let id = id.into();
        if type_url.as_str().trim().is_empty() {
            return Err(DeliveryError::invalid_argument("target type URL is empty"));
        }
        if id.trim().is_empty() {
            return Err(DeliveryError::invalid_argument(format!(
                "target id is empty for {type_url}"
            )));
        }
        Ok(Self { type_url, id })
    }

    pub fn type_url(&self) -> &TypeUrl {
        &self.type_url
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.type_url, self.id)
    }
}

/// 待处理的命令
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
pub struct CommandMessage {
    command_id: String,
    command_type: String,
    actor_id: Option<String>,
    correlation_id: Option<String>,
    #[builder(default = Utc::now())]
    issued_at: DateTime<Utc>,
    payload: Value,
}

impl CommandMessage {
    pub fn command_id(&self) -> &str {
        &self.command_id
    }

    pub fn command_type(&self) -> &str {
        &self.command_type
    }

    pub fn actor_id(&self) -> Option<&str> {
        self.actor_id.as_deref()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }
}

/// 追赶开始标记的消息类型
pub const CATCH_UP_STARTED: &str = "ddd.delivery.CatchUpStarted";

/// 投递负载
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum Payload {
    Command(CommandMessage),
    Event(SerializedEvent),
    /// 由追赶流程写在目标第一条历史副本之前；投递时调用
    /// `MessageHandler::on_catch_up_started` 而不是 `dispatch`
    CatchUpStarted(CatchUpId),
}

impl Payload {
    /// 生产者侧的消息标识（命令 ID 或事件 ID）
    pub fn signal_id(&self) -> &str {
        match self {
            Payload::Command(c) => c.command_id(),
            Payload::Event(e) => e.event_id(),
            Payload::CatchUpStarted(_) => CATCH_UP_STARTED,
        }
    }

    pub fn message_type(&self) -> &str {
        match self {
            Payload::Command(c) => c.command_type(),
            Payload::Event(e) => e.event_type(),
            Payload::CatchUpStarted(_) => CATCH_UP_STARTED,
        }
    }

    pub fn as_event(&self) -> Option<&SerializedEvent> {
        match self {
            Payload::Event(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxLabel {
    HandleCommand,
    UpdateSubscriber,
    CatchUp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxMessageStatus {
    ToDeliver,
    Delivered,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InboxMessageId(Uuid);

impl InboxMessageId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for InboxMessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// 收件箱中的一条记录
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
pub struct InboxMessage {
    #[builder(default = InboxMessageId::generate())]
    id: InboxMessageId,
    /// 去重标识：同一目标下相同 message_id 的消息只保留一条
    message_id: String,
    target: Target,
    shard: ShardIndex,
    label: InboxLabel,
    payload: Payload,
    when_received: DateTime<Utc>,
    #[builder(default = InboxMessageStatus::ToDeliver)]
    status: InboxMessageStatus,
    /// 分片内单调递增的序号，由存储层在追加时赋值
    #[builder(default)]
    version: u64,
    keep_until: Option<DateTime<Utc>>,
    catch_up: Option<CatchUpId>,
}

impl InboxMessage {
    pub fn id(&self) -> InboxMessageId {
        self.id
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn shard(&self) -> ShardIndex {
        self.shard
    }

    pub fn label(&self) -> InboxLabel {
        self.label
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn message_type(&self) -> &str {
        self.payload.message_type()
    }

    pub fn when_received(&self) -> DateTime<Utc> {
        self.when_received
    }

    pub fn status(&self) -> InboxMessageStatus {
        self.status
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn keep_until(&self) -> Option<DateTime<Utc>> {
        self.keep_until
    }

    pub fn catch_up(&self) -> Option<CatchUpId> {
        self.catch_up
    }

    pub fn is_pending(&self) -> bool {
        self.status == InboxMessageStatus::ToDeliver
    }

    /// 是否仍占据去重键：待投递，或已投递但仍在保留期内
    pub fn occupies_dedup_key(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            InboxMessageStatus::ToDeliver => true,
            InboxMessageStatus::Delivered => self.keep_until.is_some_and(|until| until > now),
        }
    }

    /// 存储层追加时赋予分片内序号
    pub fn assign_version(&mut self, version: u64) {
        self.version = version;
    }

    /// 存储层在去重窗口非零时调用
    pub fn mark_delivered(&mut self, keep_until: DateTime<Utc>) {
        self.status = InboxMessageStatus::Delivered;
        self.keep_until = Some(keep_until);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn command(id: &str) -> CommandMessage {
        CommandMessage::builder()
            .command_id(id.to_string())
            .command_type("orders.Place".to_string())
            .payload(serde_json::json!({ "sku": "A-1" }))
            .build()
    }

    #[test]
    fn empty_target_parts_are_rejected() {
        assert!(Target::new("type.example.org/orders.Order", "o-1").is_ok());
        assert!(Target::new("type.example.org/orders.Order", " ").is_err());
        assert!(Target::new("", "o-1").is_err());
    }

    #[test]
    fn payload_is_tagged_on_the_wire() {
        let payload = Payload::Command(command("c-1"));
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "command");
        assert_eq!(json["message"]["command_id"], "c-1");
        assert_eq!(payload.signal_id(), "c-1");
        assert_eq!(payload.message_type(), "orders.Place");
        assert!(payload.as_event().is_none());

        let marker = Payload::CatchUpStarted(CatchUpId::generate());
        let json = serde_json::to_value(&marker).unwrap();
        assert_eq!(json["kind"], "catch_up_started");
        assert_eq!(marker.message_type(), CATCH_UP_STARTED);
        assert_eq!(serde_json::from_value::<Payload>(json).unwrap(), marker);
    }

    #[test]
    fn delivered_messages_occupy_the_key_only_while_retained() {
        let now = Utc::now();
        let mut msg = InboxMessage::builder()
            .message_id("c-1".to_string())
            .target(Target::new("type.example.org/orders.Order", "o-1").unwrap())
            .shard(ShardIndex::new(0, 1).unwrap())
            .label(InboxLabel::HandleCommand)
            .payload(Payload::Command(command("c-1")))
            .when_received(now)
            .build();
        assert!(msg.is_pending());
        assert!(msg.occupies_dedup_key(now));

        msg.mark_delivered(now + TimeDelta::seconds(10));
        assert!(!msg.is_pending());
        assert!(msg.occupies_dedup_key(now + TimeDelta::seconds(9)));
        assert!(!msg.occupies_dedup_key(now + TimeDelta::seconds(10)));
    }
}
