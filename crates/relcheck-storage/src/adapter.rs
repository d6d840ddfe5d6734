use std::sync::Arc;

use relcheck_core::engine::{CheckError, RelationshipReader, SchemaReader, TupleIterator};
use relcheck_core::schema::EntityDefinition;
use relcheck_core::tuple::{SnapshotToken, TenantId, TupleFilter};

use crate::traits::{RelationshipStore, SchemaStore, StorageError, StoreFactory};

/// Serves the engine's reads from tenant stores handed out by a factory.
pub struct StoreReader<F: StoreFactory> {
    factory: Arc<F>,
}

impl<F: StoreFactory> StoreReader<F> {
    pub fn new(factory: Arc<F>) -> Self {
        Self { factory }
    }
}

fn relationship_error(e: StorageError) -> CheckError {
    CheckError::RelationshipRead(e.to_string())
}

fn schema_error(e: StorageError) -> CheckError {
    match e {
        StorageError::SchemaVersionNotFound(version) => CheckError::SchemaVersionNotFound(version),
        other => CheckError::SchemaRead(other.to_string()),
    }
}

impl<F: StoreFactory> RelationshipReader for StoreReader<F> {
    async fn query_relationships(
        &self,
        tenant_id: &TenantId,
        filter: &TupleFilter,
        snapshot: SnapshotToken,
    ) -> Result<TupleIterator, CheckError> {
        let tuples = self
            .factory
            .for_tenant(tenant_id)
            .read(filter, Some(snapshot))
            .await
            .map_err(relationship_error)?;
        Ok(TupleIterator::new(tuples))
    }

    async fn unique_entity_ids(
        &self,
        tenant_id: &TenantId,
        entity_type: &str,
        snapshot: SnapshotToken,
    ) -> Result<Vec<String>, CheckError> {
        self.factory
            .for_tenant(tenant_id)
            .list_entity_ids(entity_type, Some(snapshot))
            .await
            .map_err(relationship_error)
    }

    async fn head_snapshot(&self, tenant_id: &TenantId) -> Result<SnapshotToken, CheckError> {
        self.factory
            .for_tenant(tenant_id)
            .snapshot()
            .await
            .map_err(relationship_error)
    }
}

impl<F: StoreFactory> SchemaReader for StoreReader<F> {
    async fn read_entity_definition(
        &self,
        tenant_id: &TenantId,
        entity_type: &str,
        version: Option<&str>,
    ) -> Result<(EntityDefinition, String), CheckError> {
        let Some((schema, found)) = self
            .factory
            .for_tenant(tenant_id)
            .read_schema(version)
            .await
            .map_err(schema_error)?
        else {
            return Err(CheckError::TypeNotFound(entity_type.to_string()));
        };

        let definition = schema
            .get_type(entity_type)
            .cloned()
            .ok_or_else(|| CheckError::TypeNotFound(entity_type.to_string()))?;
        Ok((definition, found))
    }
}
