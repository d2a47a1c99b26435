//! Instance persistence with optimistic concurrency control.
//!
//! Every persisted mutation bumps the instance version. `save` compares
//! the caller's expected version against the stored one and rejects on
//! mismatch; the losing writer discards its computed mutation, re-reads,
//! and recomputes. No step is ever dispatched twice because the second
//! writer always re-reads state that already contains the first writer's
//! task record.

use dashmap::DashMap;
use uuid::Uuid;
use weft_types::error::StoreError;
use weft_types::instance::{InstanceState, WorkflowInstance};

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

pub trait InstanceStore: Send + Sync + 'static {
    /// Persist a newly created instance at version 0.
    fn insert(
        &self,
        instance: WorkflowInstance,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Load the current snapshot; `instance.version` is the value to pass
    /// back to `save`.
    fn load(
        &self,
        id: Uuid,
    ) -> impl std::future::Future<Output = Result<WorkflowInstance, StoreError>> + Send;

    /// Compare-and-swap write. Succeeds only if the stored version still
    /// equals `expected_version`; the stored copy then carries
    /// `expected_version + 1`, which is also returned.
    fn save(
        &self,
        instance: WorkflowInstance,
        expected_version: u64,
    ) -> impl std::future::Future<Output = Result<u64, StoreError>> + Send;

    /// Ids of all instances currently in `state`.
    fn list_by_state(
        &self,
        state: InstanceState,
    ) -> impl std::future::Future<Output = Vec<Uuid>> + Send;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryInstanceStore {
    instances: DashMap<Uuid, WorkflowInstance>,
}

impl InMemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InstanceStore for InMemoryInstanceStore {
    async fn insert(&self, instance: WorkflowInstance) -> Result<(), StoreError> {
        let id = instance.id;
        if self.instances.contains_key(&id) {
            return Err(StoreError::VersionConflict {
                expected: 0,
                found: instance.version,
            });
        }
        self.instances.insert(id, instance);
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<WorkflowInstance, StoreError> {
        self.instances
            .get(&id)
            .map(|i| i.clone())
            .ok_or(StoreError::NotFound)
    }

    async fn save(
        &self,
        mut instance: WorkflowInstance,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        // The shard guard makes the compare-and-swap atomic.
        let mut entry = self.instances.get_mut(&instance.id).ok_or(StoreError::NotFound)?;
        if entry.version != expected_version {
            return Err(StoreError::VersionConflict {
                expected: expected_version,
                found: entry.version,
            });
        }
        let next = expected_version + 1;
        instance.version = next;
        *entry = instance;
        Ok(next)
    }

    async fn list_by_state(&self, state: InstanceState) -> Vec<Uuid> {
        self.instances
            .iter()
            .filter(|entry| entry.state == state)
            .map(|entry| entry.id)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
