//! Durable execution state, keyed by execution id.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::db::SqliteStore;
use crate::domain::PipelineState;

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Insert or replace the state of an execution
    async fn put(&self, state: &PipelineState) -> Result<()>;

    async fn get(&self, execution_id: Uuid) -> Result<Option<PipelineState>>;

    /// Most recently updated first
    async fn list(&self, limit: usize) -> Result<Vec<PipelineState>>;
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn put(&self, state: &PipelineState) -> Result<()> {
        let state = state.clone();
        self.call(move |db| db.put_state(&state)).await
    }

    async fn get(&self, execution_id: Uuid) -> Result<Option<PipelineState>> {
        self.call(move |db| db.get_state(execution_id)).await
    }

    async fn list(&self, limit: usize) -> Result<Vec<PipelineState>> {
        self.call(move |db| db.list_states(limit)).await
    }
}

#[derive(Default)]
pub struct InMemoryStateStore {
    states: Mutex<HashMap<Uuid, PipelineState>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn put(&self, state: &PipelineState) -> Result<()> {
        self.states
            .lock()
            .await
            .insert(state.execution_id, state.clone());
        Ok(())
    }

    async fn get(&self, execution_id: Uuid) -> Result<Option<PipelineState>> {
        Ok(self.states.lock().await.get(&execution_id).cloned())
    }

    async fn list(&self, limit: usize) -> Result<Vec<PipelineState>> {
        let mut states: Vec<PipelineState> = self.states.lock().await.values().cloned().collect();
        states.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        states.truncate(limit);
        Ok(states)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ContentRequest, ExecutionMode, ExecutionStatus, Identity};

    #[tokio::test]
    async fn test_put_replaces_and_list_orders_by_update() {
        let store = InMemoryStateStore::new();
        let identity = Identity::new("acme", "u1");

        let mut first = PipelineState::new(
            Uuid::new_v4(),
            ContentRequest::new("one", identity.clone()),
            ExecutionMode::Automatic,
        );
        let second = PipelineState::new(
            Uuid::new_v4(),
            ContentRequest::new("two", identity),
            ExecutionMode::Automatic,
        );
        store.put(&first).await.unwrap();
        store.put(&second).await.unwrap();

        first.complete();
        store.put(&first).await.unwrap();

        let listed = store.list(10).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].execution_id, first.execution_id);
        assert_eq!(listed[0].status, ExecutionStatus::Completed);
        assert_eq!(store.list(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_state_is_none() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());
    }
}
