mod cache;
mod check;
mod expand;
mod lookup;
mod resolver;

#[cfg(test)]
pub(crate) mod fixture;
#[cfg(test)]
mod properties;

pub use check::{CheckEngine, CheckRequest, CheckResult, RequestMetadata};
pub use expand::{ExpandEngine, ExpandRequest, ExpandResult, ExpandTree};
pub use lookup::{LookupEngine, LookupRequest, LookupResult, SkippedCandidate};

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;

use crate::schema::types::EntityDefinition;
use crate::tuple::{SnapshotToken, TenantId, Tuple, TupleFilter};

/// Coarse classification of [`CheckError`] for callers that only need to
/// branch on the kind of failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    SchemaNotFound,
    RelationshipReadError,
    DepthExceeded,
    DeadlineExceeded,
    InvalidRequest,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CheckError {
    #[error("type not found: {0}")]
    TypeNotFound(String),

    #[error("'{name}' is neither a relation nor a permission on type '{type_name}'")]
    ReferenceNotFound { type_name: String, name: String },

    #[error("relation '{relation}' not found on type '{type_name}'")]
    RelationNotFound { type_name: String, relation: String },

    #[error("schema version not found: {0}")]
    SchemaVersionNotFound(String),

    #[error("schema read error: {0}")]
    SchemaRead(String),

    #[error("relationship read error: {0}")]
    RelationshipRead(String),

    #[error("max depth exceeded: budget of {0} exhausted")]
    DepthExceeded(u32),

    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl CheckError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CheckError::TypeNotFound(_)
            | CheckError::ReferenceNotFound { .. }
            | CheckError::RelationNotFound { .. }
            | CheckError::SchemaVersionNotFound(_)
            | CheckError::SchemaRead(_) => ErrorKind::SchemaNotFound,
            CheckError::RelationshipRead(_) => ErrorKind::RelationshipReadError,
            CheckError::DepthExceeded(_) => ErrorKind::DepthExceeded,
            CheckError::DeadlineExceeded(_) => ErrorKind::DeadlineExceeded,
            CheckError::InvalidRequest(_) => ErrorKind::InvalidRequest,
        }
    }
}

/// What a lookup does when the check for one candidate fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LookupErrorPolicy {
    /// Fail the whole lookup with the candidate's error.
    #[default]
    Abort,
    /// Leave the candidate out and report it in [`LookupResult::skipped`].
    Skip,
}

/// Hard ceiling on any depth budget. Each unit of depth nests a few poll
/// frames, so the budget is what bounds stack use.
pub const MAX_DEPTH_LIMIT: u32 = 64;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on any request's depth budget. Values above
    /// [`MAX_DEPTH_LIMIT`] are clamped to it.
    pub max_depth: u32,
    /// Sibling branches (or lookup candidates) evaluated at once.
    pub max_concurrent_branches: usize,
    pub lookup_error_policy: LookupErrorPolicy,
    /// Deadline applied when a request does not carry its own.
    pub timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_depth: 50,
            max_concurrent_branches: 10,
            lookup_error_policy: LookupErrorPolicy::Abort,
            timeout: None,
        }
    }
}

/// Single-pass sequence of tuples returned by one relationship query.
/// Reading again means issuing the query again.
#[derive(Debug, Default)]
pub struct TupleIterator {
    inner: std::vec::IntoIter<Tuple>,
}

impl TupleIterator {
    pub fn new(tuples: Vec<Tuple>) -> Self {
        Self {
            inner: tuples.into_iter(),
        }
    }
}

impl From<Vec<Tuple>> for TupleIterator {
    fn from(tuples: Vec<Tuple>) -> Self {
        Self::new(tuples)
    }
}

impl Iterator for TupleIterator {
    type Item = Tuple;

    fn next(&mut self) -> Option<Tuple> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

pub trait RelationshipReader: Send + Sync {
    fn query_relationships(
        &self,
        tenant_id: &TenantId,
        filter: &TupleFilter,
        snapshot: SnapshotToken,
    ) -> impl Future<Output = Result<TupleIterator, CheckError>> + Send;

    /// Every distinct entity id of `entity_type` visible at `snapshot`.
    fn unique_entity_ids(
        &self,
        tenant_id: &TenantId,
        entity_type: &str,
        snapshot: SnapshotToken,
    ) -> impl Future<Output = Result<Vec<String>, CheckError>> + Send;

    fn head_snapshot(
        &self,
        tenant_id: &TenantId,
    ) -> impl Future<Output = Result<SnapshotToken, CheckError>> + Send;
}

pub trait SchemaReader: Send + Sync {
    /// Reads one entity definition. `version = None` means the newest schema;
    /// the version actually read is returned next to the definition.
    fn read_entity_definition(
        &self,
        tenant_id: &TenantId,
        entity_type: &str,
        version: Option<&str>,
    ) -> impl Future<Output = Result<(EntityDefinition, String), CheckError>> + Send;
}
