//! Definition registry: versioned, immutable workflow definitions.
//!
//! Publishing validates the DAG and freezes it. Running instances pin a
//! specific `(id, version)` pair, so an in-flight instance never observes
//! a newer definition.

use dashmap::DashMap;
use uuid::Uuid;
use weft_types::definition::{DefinitionStatus, WorkflowDefinition};

use crate::dag::{self, DefinitionError};

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

pub trait DefinitionStore: Send + Sync + 'static {
    /// Validate and freeze a definition. Rejects republishing an existing
    /// version and versions not newer than the latest published one.
    fn publish(
        &self,
        definition: WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), DefinitionError>> + Send;

    /// Fetch an exact published version.
    fn get(
        &self,
        id: Uuid,
        version: u32,
    ) -> impl std::future::Future<Output = Option<WorkflowDefinition>> + Send;

    /// Highest active version for a definition id, if any.
    fn latest_active(
        &self,
        id: Uuid,
    ) -> impl std::future::Future<Output = Option<WorkflowDefinition>> + Send;

    /// Mark a version deprecated: no new instances, running ones finish.
    fn deprecate(
        &self,
        id: Uuid,
        version: u32,
    ) -> impl std::future::Future<Output = Result<(), DefinitionError>> + Send;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryDefinitionStore {
    definitions: DashMap<(Uuid, u32), WorkflowDefinition>,
}

impl InMemoryDefinitionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn latest_version(&self, id: Uuid) -> Option<u32> {
        self.definitions
            .iter()
            .filter(|entry| entry.key().0 == id)
            .map(|entry| entry.key().1)
            .max()
    }
}

impl DefinitionStore for InMemoryDefinitionStore {
    async fn publish(&self, mut definition: WorkflowDefinition) -> Result<(), DefinitionError> {
        dag::validate(&definition)?;

        if self.definitions.contains_key(&(definition.id, definition.version)) {
            return Err(DefinitionError::AlreadyPublished {
                name: definition.name,
                version: definition.version,
            });
        }
        if let Some(latest) = self.latest_version(definition.id)
            && definition.version <= latest
        {
            return Err(DefinitionError::StaleVersion {
                name: definition.name,
                version: definition.version,
                latest,
            });
        }

        definition.status = DefinitionStatus::Active;
        tracing::info!(
            definition_id = %definition.id,
            name = %definition.name,
            version = definition.version,
            steps = definition.steps.len(),
            "definition published"
        );
        self.definitions
            .insert((definition.id, definition.version), definition);
        Ok(())
    }

    async fn get(&self, id: Uuid, version: u32) -> Option<WorkflowDefinition> {
        self.definitions.get(&(id, version)).map(|d| d.clone())
    }

    async fn latest_active(&self, id: Uuid) -> Option<WorkflowDefinition> {
        self.definitions
            .iter()
            .filter(|entry| entry.key().0 == id && entry.status == DefinitionStatus::Active)
            .max_by_key(|entry| entry.key().1)
            .map(|entry| entry.clone())
    }

    async fn deprecate(&self, id: Uuid, version: u32) -> Result<(), DefinitionError> {
        let mut entry = self.definitions.get_mut(&(id, version)).ok_or_else(|| {
            DefinitionError::Invalid(format!("definition {id} version {version} not found"))
        })?;
        entry.status = DefinitionStatus::Deprecated;
        tracing::info!(definition_id = %id, version, "definition deprecated");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
