//! 事件持久化形态（SerializedEvent）
//!
//! 既是事件日志中的历史事件，也是投递给订阅者的事件负载。
//! 全局位点 `sequence_number` 由事件日志在追加时赋值，追赶流程依赖它判断
//! 实时副本是否已经被历史重放覆盖。
//!
use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
pub struct SerializedEvent {
    /// 事件唯一标识符
    event_id: String,
    /// 事件类型，用于匹配处理器
    event_type: String,
    /// 事件版本
    #[builder(default = 1)]
    event_version: usize,
    /// 全局事件位点，由事件日志在持久化后赋值
    sequence_number: Option<i64>,
    /// 产生事件的聚合 ID
    aggregate_id: String,
    /// 产生事件的聚合类型
    aggregate_type: String,
    /// 关联 ID，用于将多个消息关联到同一个业务操作
    correlation_id: Option<String>,
    /// 因果 ID，用于表示事件的触发来源
    causation_id: Option<String>,
    /// 事件发生时间
    occurred_at: DateTime<Utc>,
    /// 事件负载
    payload: Value,
}

impl SerializedEvent {
    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn event_version(&self) -> usize {
        self.event_version
    }

    pub fn sequence_number(&self) -> Option<i64> {
        self.sequence_number
    }

    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn causation_id(&self) -> Option<&str> {
        self.causation_id.as_deref()
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// 由事件日志在追加时调用
    pub fn with_sequence_number(mut self, sequence_number: i64) -> Self {
        self.sequence_number = Some(sequence_number);
        self
    }
}
