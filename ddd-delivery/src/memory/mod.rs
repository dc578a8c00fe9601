//! 内存实现
//!
//! 单进程内的存储与登记表实现，用于测试、演示与单节点部署。
//! 条件写入通过 `DashMap` 的分段锁在单个键上原子完成。
//!
mod catch_up;
mod event_log;
mod inbox;
mod registry;

pub use catch_up::InMemoryCatchUpStorage;
pub use event_log::InMemoryEventLog;
pub use inbox::InMemoryInboxStorage;
pub use registry::InMemoryShardedWorkRegistry;
