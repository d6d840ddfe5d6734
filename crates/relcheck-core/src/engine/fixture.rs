//! In-process readers for engine tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::schema::{Schema, schema_from_json};
use crate::schema::types::EntityDefinition;
use crate::tuple::{SnapshotToken, TenantId, Tuple, TupleFilter};

use super::{CheckError, RelationshipReader, SchemaReader, TupleIterator};

pub(crate) const FIXTURE_VERSION: &str = "1";

/// Serves a fixed tuple set and schema. Reads of selected relations can be
/// made to fail or to never complete.
pub(crate) struct FixtureReader {
    tuples: Vec<Tuple>,
    schema: Schema,
    failing: HashSet<String>,
    stalled: HashSet<String>,
    reversed: bool,
    reads: AtomicUsize,
}

impl FixtureReader {
    pub(crate) fn new(tuples: Vec<Tuple>) -> Self {
        Self {
            tuples,
            schema: Schema::default(),
            failing: HashSet::new(),
            stalled: HashSet::new(),
            reversed: false,
            reads: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }

    pub(crate) fn failing_on(mut self, relation: &str) -> Self {
        self.failing.insert(relation.to_string());
        self
    }

    pub(crate) fn stalled_on(mut self, relation: &str) -> Self {
        self.stalled.insert(relation.to_string());
        self
    }

    /// Returns query results in reverse storage order.
    pub(crate) fn reversed(mut self) -> Self {
        self.reversed = true;
        self
    }

    pub(crate) fn snapshot(&self) -> SnapshotToken {
        SnapshotToken::new(7)
    }

    /// Relationship queries issued so far, stalled ones included.
    pub(crate) fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl RelationshipReader for FixtureReader {
    async fn query_relationships(
        &self,
        _tenant_id: &TenantId,
        filter: &TupleFilter,
        _snapshot: SnapshotToken,
    ) -> Result<TupleIterator, CheckError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let relation = filter.relation.as_deref().unwrap_or_default();
        if self.stalled.contains(relation) {
            std::future::pending::<()>().await;
        }
        if self.failing.contains(relation) {
            return Err(CheckError::RelationshipRead(format!(
                "injected failure reading '{relation}'"
            )));
        }

        let mut matched: Vec<Tuple> = self
            .tuples
            .iter()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        if self.reversed {
            matched.reverse();
        }
        Ok(TupleIterator::new(matched))
    }

    async fn unique_entity_ids(
        &self,
        _tenant_id: &TenantId,
        entity_type: &str,
        _snapshot: SnapshotToken,
    ) -> Result<Vec<String>, CheckError> {
        let mut seen = HashSet::new();
        Ok(self
            .tuples
            .iter()
            .filter(|t| t.entity.entity_type == entity_type)
            .map(|t| t.entity.entity_id.clone())
            .filter(|id| seen.insert(id.clone()))
            .collect())
    }

    async fn head_snapshot(&self, _tenant_id: &TenantId) -> Result<SnapshotToken, CheckError> {
        Ok(self.snapshot())
    }
}

impl SchemaReader for FixtureReader {
    async fn read_entity_definition(
        &self,
        _tenant_id: &TenantId,
        entity_type: &str,
        version: Option<&str>,
    ) -> Result<(EntityDefinition, String), CheckError> {
        if let Some(version) = version
            && version != FIXTURE_VERSION
        {
            return Err(CheckError::SchemaVersionNotFound(version.to_string()));
        }
        let definition = self
            .schema
            .get_type(entity_type)
            .cloned()
            .ok_or_else(|| CheckError::TypeNotFound(entity_type.to_string()))?;
        Ok((definition, FIXTURE_VERSION.to_string()))
    }
}

pub(crate) fn schema(value: serde_json::Value) -> Schema {
    schema_from_json(&value.to_string()).expect("fixture schema must be valid")
}

/// Users, organizations with admins, folders with collaborators, and docs
/// readable by their owner, their folder's collaborators, or their org's
/// admins.
pub(crate) fn documents_schema() -> Schema {
    schema(serde_json::json!({
        "types": [
            {"name": "user"},
            {
                "name": "organization",
                "relations": [{"name": "admin", "subject_types": [{"type_name": "user"}]}]
            },
            {
                "name": "folder",
                "relations": [{"name": "collaborator", "subject_types": [{"type_name": "user"}]}]
            },
            {
                "name": "doc",
                "relations": [
                    {"name": "owner", "subject_types": [{"type_name": "user"}]},
                    {"name": "parent", "subject_types": [{"type_name": "folder"}]},
                    {"name": "org", "subject_types": [{"type_name": "organization"}]}
                ],
                "permissions": [{
                    "name": "read",
                    "rule": {"union": [
                        {"union": [{"this": "owner"}, {"arrow": ["parent", "collaborator"]}]},
                        {"arrow": ["org", "admin"]}
                    ]}
                }]
            }
        ]
    }))
}

pub(crate) fn documents_tuples() -> Vec<Tuple> {
    [
        "doc:1#owner@user:2",
        "doc:2#owner@user:8",
        "doc:1#parent@folder:1",
        "folder:1#collaborator@user:1",
        "folder:1#collaborator@user:3",
        "doc:1#org@organization:1",
        "organization:1#admin@user:1",
    ]
    .into_iter()
    .map(tuple)
    .collect()
}

/// Parses `type:id#relation@subject`.
pub(crate) fn tuple(raw: &str) -> Tuple {
    let (resource, subject) = raw.split_once('@').expect("tuple needs '@'");
    let (entity, relation) = resource.split_once('#').expect("tuple needs '#'");
    Tuple::new(
        entity.parse().expect("valid entity"),
        relation,
        subject.parse().expect("valid subject"),
    )
}
