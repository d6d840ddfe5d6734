use std::collections::HashSet;

use crate::tuple::{EntityRef, SnapshotToken, SubjectRef, TenantId, Tuple, TupleFilter};

use super::{CheckError, RelationshipReader};

/// Subjects stored under one `(entity, relation)` pair, deduplicated and
/// split by kind.
#[derive(Debug, Default)]
pub(super) struct Members {
    /// Concrete subjects (no relation, or the ellipsis marker).
    pub(super) direct: Vec<SubjectRef>,
    /// Usersets like `group:eng#member` that must be expanded further.
    pub(super) usersets: Vec<SubjectRef>,
}

impl Members {
    pub(super) fn contains(&self, subject: &SubjectRef) -> bool {
        self.direct
            .iter()
            .chain(&self.usersets)
            .any(|member| member.same_member(subject))
    }

    /// `(entity, relation)` pairs to evaluate for each userset member.
    pub(super) fn userset_targets(&self) -> Vec<(EntityRef, String)> {
        self.usersets
            .iter()
            .filter_map(|s| {
                s.normalized_relation()
                    .map(|relation| (s.entity(), relation.to_string()))
            })
            .collect()
    }
}

/// Where one call reads relationships from: the store at the pinned
/// snapshot, followed by the tuples supplied with the request.
pub(super) struct TupleSource<'a, R> {
    pub(super) reader: &'a R,
    pub(super) tenant_id: &'a TenantId,
    pub(super) snapshot: SnapshotToken,
    pub(super) contextual: &'a [Tuple],
}

impl<R: RelationshipReader> TupleSource<'_, R> {
    async fn relation_tuples(
        &self,
        entity: &EntityRef,
        relation: &str,
    ) -> Result<impl Iterator<Item = Tuple>, CheckError> {
        let filter = TupleFilter::for_relation(entity, relation);
        let stored = self
            .reader
            .query_relationships(self.tenant_id, &filter, self.snapshot)
            .await?;
        let contextual: Vec<Tuple> = self
            .contextual
            .iter()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        Ok(stored.chain(contextual))
    }
}

pub(super) async fn resolve_members<R: RelationshipReader>(
    source: &TupleSource<'_, R>,
    entity: &EntityRef,
    relation: &str,
) -> Result<Members, CheckError> {
    let tuples = source.relation_tuples(entity, relation).await?;

    let mut seen = HashSet::new();
    let mut members = Members::default();
    for tuple in tuples {
        let subject = tuple.subject;
        let key = (
            subject.subject_type.clone(),
            subject.subject_id.clone(),
            subject.normalized_relation().map(str::to_string),
        );
        if !seen.insert(key) {
            continue;
        }
        if subject.is_direct() {
            members.direct.push(subject);
        } else {
            members.usersets.push(subject);
        }
    }
    Ok(members)
}

/// Entities reached from `entity` over `relation`, in first-seen order.
/// Userset relations on the stored subjects are ignored: traversal always
/// lands on the subject entity itself.
pub(super) async fn related_entities<R: RelationshipReader>(
    source: &TupleSource<'_, R>,
    entity: &EntityRef,
    relation: &str,
) -> Result<Vec<EntityRef>, CheckError> {
    let tuples = source.relation_tuples(entity, relation).await?;

    let mut seen = HashSet::new();
    Ok(tuples
        .map(|tuple| tuple.subject.entity())
        .filter(|related| seen.insert(related.clone()))
        .collect())
}
