//! 单元测试共用的消息构造
//!
use crate::event::SerializedEvent;
use crate::message::{CommandMessage, InboxLabel, InboxMessage, Payload, Target, TypeUrl};
use crate::shard::ShardIndex;
use chrono::Utc;

pub(crate) fn projection_type() -> TypeUrl {
    TypeUrl::new("test/OrderProjection")
}

pub(crate) fn order_type() -> TypeUrl {
    TypeUrl::new("test/Order")
}

fn single_shard() -> ShardIndex {
    ShardIndex::new(0, 1).unwrap()
}

/// 投递给订单聚合 `target_id` 的命令消息（单分片）
pub(crate) fn command_message(target_id: &str, command_id: &str) -> InboxMessage {
    let command = CommandMessage::builder()
        .command_id(command_id.to_string())
        .command_type("orders.Place".to_string())
        .payload(serde_json::json!({ "target": target_id }))
        .build();
    InboxMessage::builder()
        .message_id(command_id.to_string())
        .target(Target::new(order_type(), target_id).unwrap())
        .shard(single_shard())
        .label(InboxLabel::HandleCommand)
        .payload(Payload::Command(command))
        .when_received(Utc::now())
        .build()
}

/// 投递给投影 `target_id` 的实时事件消息（单分片）
pub(crate) fn live_event_message(
    target_id: &str,
    event_id: &str,
    sequence_number: Option<i64>,
) -> InboxMessage {
    let event = SerializedEvent::builder()
        .event_id(event_id.to_string())
        .event_type("orders.Placed".to_string())
        .maybe_sequence_number(sequence_number)
        .aggregate_id(target_id.to_string())
        .aggregate_type(order_type().to_string())
        .occurred_at(Utc::now())
        .payload(serde_json::json!({}))
        .build();
    InboxMessage::builder()
        .message_id(event_id.to_string())
        .target(Target::new(projection_type(), target_id).unwrap())
        .shard(single_shard())
        .label(InboxLabel::UpdateSubscriber)
        .payload(Payload::Event(event))
        .when_received(Utc::now())
        .build()
}
