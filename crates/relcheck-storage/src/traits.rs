use relcheck_core::schema::{Schema, ValidationError};
use relcheck_core::tuple::{FilterError, SnapshotToken, TenantId, Tuple, TupleFilter, TupleWrite};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("delete filter must have at least one field set")]
    EmptyDeleteFilter,
    #[error("duplicate tuple in write")]
    DuplicateTuple,
    #[error("invalid filter: {0}")]
    InvalidFilter(#[from] FilterError),
    #[error("snapshot {requested} is ahead of current {current}")]
    SnapshotAhead { requested: u64, current: u64 },
    #[error("schema version not found: {0}")]
    SchemaVersionNotFound(String),
    #[error("invalid schema: {}", join_errors(.0))]
    InvalidSchema(Vec<ValidationError>),
    #[error("internal storage error: {0}")]
    Internal(String),
}

/// Snapshot-versioned tuple storage. A snapshot token is the id of the
/// transaction that produced it; reads without one see the head.
pub trait RelationshipStore: Send + Sync {
    /// Applies `deletes` then `writes` in one transaction.
    fn write(
        &self,
        writes: &[TupleWrite],
        deletes: &[TupleFilter],
    ) -> impl Future<Output = Result<SnapshotToken, StorageError>> + Send;

    fn read(
        &self,
        filter: &TupleFilter,
        snapshot: Option<SnapshotToken>,
    ) -> impl Future<Output = Result<Vec<Tuple>, StorageError>> + Send;

    fn snapshot(&self) -> impl Future<Output = Result<SnapshotToken, StorageError>> + Send;

    /// Distinct ids of entities of `entity_type` with at least one visible
    /// tuple, ordered by id.
    fn list_entity_ids(
        &self,
        entity_type: &str,
        snapshot: Option<SnapshotToken>,
    ) -> impl Future<Output = Result<Vec<String>, StorageError>> + Send;
}

pub trait SchemaStore: Send + Sync {
    /// Validates and stores `schema` as a new version, returning that version.
    fn write_schema(
        &self,
        schema: &Schema,
    ) -> impl Future<Output = Result<String, StorageError>> + Send;

    /// `None` reads the newest version. `Ok(None)` means no schema was ever
    /// written; an unknown explicit version is `SchemaVersionNotFound`.
    fn read_schema(
        &self,
        version: Option<&str>,
    ) -> impl Future<Output = Result<Option<(Schema, String)>, StorageError>> + Send;
}

pub trait StoreFactory: Send + Sync {
    type Store: RelationshipStore + SchemaStore;

    fn for_tenant(&self, tenant_id: &TenantId) -> Self::Store;
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub(crate) fn validate_delete_filter(filter: &TupleFilter) -> Result<(), StorageError> {
    if *filter == TupleFilter::default() {
        return Err(StorageError::EmptyDeleteFilter);
    }
    filter.validate()?;
    Ok(())
}

pub(crate) fn validate_for_write(schema: &Schema) -> Result<(), StorageError> {
    relcheck_core::schema::validate_schema(schema).map_err(StorageError::InvalidSchema)
}
