//! 分片消息投递核心（ddd-delivery）
//!
//! 位于“消息已产生”与“目标处理器被调用”之间的投递机制，面向事件溯源/CQRS 应用中
//! 可寻址的目标（聚合、流程管理器、投影）：
//! - 分片（`shard`）：按目标 ID 将消息稳定地映射到固定数量的分片；
//! - 收件箱（`inbox`）：按分片有序存放待投递消息，并在去重窗口内吸收重复写入；
//! - 工作登记表（`registry`）：以带过期时间的租约保证同一时刻至多一个工作者处理某个分片；
//! - 投递（`delivery`、`stage`）：分页读取、按目标保序投递、逐目标确认，失败只影响所属目标；
//! - 监控（`monitor`）：阶段结束后决定是否继续，并决定失败消息的处置；
//! - 追赶（`catch_up`）：为新投影回放历史事件，与实时投递互不干扰；
//! - 引擎（`engine`）：以工作者身份驱动上述流程的长驻任务。
//!
//! 存储与登记表均为协议（trait），`memory` 提供单进程内的实现。
//! 投递语义为“至少一次、目标内有序”：处理器需对重复调用保持幂等。
//!
//! 典型用法：
//! 1. 为每种目标类型实现 `MessageHandler`；
//! 2. 通过 `Delivery::builder()` 装配存储、分片策略、监控与 `DeliveryConfig`；
//! 3. 生产者调用 `enqueue_command`/`enqueue_event` 写入收件箱；
//! 4. 启动 `DeliveryEngine`，或自行调度 `deliver_messages_from`。
//!
pub mod catch_up;
pub mod clock;
pub mod config;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod event;
pub mod handler;
pub mod inbox;
pub mod memory;
pub mod message;
pub mod monitor;
pub mod registry;
pub mod shard;
pub mod stage;

#[cfg(test)]
mod testing;
