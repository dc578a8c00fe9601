//! 历史事件日志读取协议（EventLog）
//!
//! 追赶流程只需要按全局位点顺序分页读取历史事件。日志在追加时分配
//! 单调递增的 `sequence_number`，并保证读到的位点不会出现“空洞后补”。
//!
use crate::{error::DeliveryResult as Result, event::SerializedEvent};
use async_trait::async_trait;
use bon::Builder;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Builder)]
pub struct EventLogQuery {
    /// 只返回位点严格大于该值的事件
    after_sequence: Option<i64>,
    /// 只返回发生于该时间及之后的事件
    since: Option<DateTime<Utc>>,
    /// 只返回这些类型的事件；`None` 表示全部类型
    event_types: Option<Vec<String>>,
    limit: usize,
}

impl EventLogQuery {
    pub fn after_sequence(&self) -> Option<i64> {
        self.after_sequence
    }

    pub fn since(&self) -> Option<DateTime<Utc>> {
        self.since
    }

    pub fn event_types(&self) -> Option<&[String]> {
        self.event_types.as_deref()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn matches(&self, event: &SerializedEvent) -> bool {
        let after = match (self.after_sequence, event.sequence_number()) {
            (Some(after), Some(seq)) => seq > after,
            (Some(_), None) => false,
            (None, _) => true,
        };
        after
            && self.since.is_none_or(|since| event.occurred_at() >= since)
            && self
                .event_types
                .as_ref()
                .is_none_or(|types| types.iter().any(|t| t == event.event_type()))
    }
}

#[async_trait]
pub trait EventLog: Send + Sync {
    /// 按位点升序返回匹配查询的事件，最多 `query.limit()` 条
    async fn read(&self, query: &EventLogQuery) -> Result<Vec<SerializedEvent>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn event(seq: i64, ty: &str, at: DateTime<Utc>) -> SerializedEvent {
        SerializedEvent::builder()
            .event_id(format!("e-{seq}"))
            .event_type(ty.to_string())
            .aggregate_id("x".to_string())
            .aggregate_type("t/Order".to_string())
            .occurred_at(at)
            .payload(serde_json::json!({}))
            .build()
            .with_sequence_number(seq)
    }

    #[test]
    fn query_filters_by_position_time_and_type() {
        let now = Utc::now();
        let query = EventLogQuery::builder()
            .after_sequence(2)
            .since(now)
            .event_types(vec!["placed".to_string()])
            .limit(10)
            .build();

        assert!(query.matches(&event(3, "placed", now)));
        assert!(!query.matches(&event(2, "placed", now)));
        assert!(!query.matches(&event(3, "cancelled", now)));
        assert!(!query.matches(&event(3, "placed", now - TimeDelta::seconds(1))));

        let open = EventLogQuery::builder().limit(1).build();
        assert!(open.matches(&event(1, "anything", now)));
        assert_eq!(open.limit(), 1);
    }
}
