use crate::catch_up::{EventLog, EventLogQuery};
use crate::error::DeliveryResult as Result;
use crate::event::SerializedEvent;
use async_trait::async_trait;
use tokio::sync::RwLock;

/// 基于内存的事件日志：追加时分配从 1 开始的连续位点
#[derive(Default)]
pub struct InMemoryEventLog {
    events: RwLock<Vec<SerializedEvent>>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一个事件，返回带位点的副本
    pub async fn append(&self, event: SerializedEvent) -> SerializedEvent {
        let mut events = self.events.write().await;
        let sequenced = event.with_sequence_number(events.len() as i64 + 1);
        events.push(sequenced.clone());
        sequenced
    }

    pub async fn append_all(
        &self,
        events: impl IntoIterator<Item = SerializedEvent>,
    ) -> Vec<SerializedEvent> {
        let mut log = self.events.write().await;
        events
            .into_iter()
            .map(|event| {
                let sequenced = event.with_sequence_number(log.len() as i64 + 1);
                log.push(sequenced.clone());
                sequenced
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn read(&self, query: &EventLogQuery) -> Result<Vec<SerializedEvent>> {
        let events = self.events.read().await;
        Ok(events
            .iter()
            .filter(|e| query.matches(e))
            .take(query.limit())
            .cloned()
            .collect())
    }
}
