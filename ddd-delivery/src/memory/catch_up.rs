use crate::catch_up::{CatchUpId, CatchUpState, CatchUpStorage};
use crate::error::DeliveryResult as Result;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

/// 基于内存的 CatchUpStorage 实现
#[derive(Default)]
pub struct InMemoryCatchUpStorage {
    states: DashMap<CatchUpId, CatchUpState>,
}

impl InMemoryCatchUpStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CatchUpStorage for InMemoryCatchUpStorage {
    async fn read(&self, id: CatchUpId) -> Result<Option<CatchUpState>> {
        Ok(self.states.get(&id).map(|s| s.value().clone()))
    }

    async fn read_all(&self) -> Result<Vec<CatchUpState>> {
        let mut all: Vec<CatchUpState> = self.states.iter().map(|s| s.value().clone()).collect();
        all.sort_by_key(|s| (s.started_at(), s.id()));
        Ok(all)
    }

    async fn write(&self, state: &CatchUpState, expected_version: Option<u64>) -> Result<bool> {
        match (self.states.entry(state.id()), expected_version) {
            (Entry::Vacant(slot), None) => {
                slot.insert(state.clone());
                Ok(true)
            }
            (Entry::Occupied(mut slot), Some(expected)) if slot.get().version() == expected => {
                slot.insert(state.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remove(&self, id: CatchUpId) -> Result<()> {
        self.states.remove(&id);
        Ok(())
    }
}
