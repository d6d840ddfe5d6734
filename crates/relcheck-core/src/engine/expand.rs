use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};

use crate::logging;
use crate::schema::types::{EntityDefinition, Reference, RewriteRule};
use crate::tuple::{EntityRef, SnapshotToken, SubjectRef, TenantId};

use super::check::{
    CallScope, CheckEngine, RequestMetadata, require_relation, validate_contextual_tuples,
    validate_entity, validate_name, with_deadline,
};
use super::resolver::{related_entities, resolve_members};
use super::{CheckError, EngineConfig, RelationshipReader, SchemaReader};

type Expansion<'a> = Pin<Box<dyn Future<Output = Result<ExpandTree, CheckError>> + Send + 'a>>;

#[derive(Debug, Clone)]
pub struct ExpandRequest {
    pub tenant_id: TenantId,
    pub entity: EntityRef,
    /// Permission or relation name on the entity's type.
    pub permission: String,
    pub metadata: RequestMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpandResult {
    pub tree: ExpandTree,
    pub snapshot: SnapshotToken,
    pub schema_version: String,
}

/// Who holds a permission, as the rule tree that grants it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpandTree {
    /// Subjects stored under `entity#relation`, usersets included, and the
    /// expansion of each userset.
    Relation {
        entity: EntityRef,
        relation: String,
        subjects: Vec<SubjectRef>,
        usersets: Vec<ExpandTree>,
    },
    Permission {
        entity: EntityRef,
        permission: String,
        rule: Box<ExpandTree>,
    },
    Union(Vec<ExpandTree>),
    Intersection(Vec<ExpandTree>),
    /// Everyone not granted by the child.
    Exclusion(Box<ExpandTree>),
    /// `target` on each entity reached over `entity#relation` whose type
    /// defines it.
    Arrow {
        entity: EntityRef,
        relation: String,
        target: String,
        children: Vec<ExpandTree>,
    },
    /// `entity#name` is already being expanded further up this branch.
    Cycle { entity: EntityRef, name: String },
}

impl ExpandTree {
    /// Every concrete subject stored anywhere in the tree, in first-seen
    /// order, ignoring what the operators would do with them.
    pub fn direct_subjects(&self) -> Vec<&SubjectRef> {
        let mut found = Vec::new();
        self.collect_direct(&mut found);
        found
    }

    fn collect_direct<'t>(&'t self, found: &mut Vec<&'t SubjectRef>) {
        match self {
            ExpandTree::Relation {
                subjects, usersets, ..
            } => {
                for subject in subjects.iter().filter(|s| s.is_direct()) {
                    if !found.iter().any(|f| f.same_member(subject)) {
                        found.push(subject);
                    }
                }
                usersets.iter().for_each(|t| t.collect_direct(found));
            }
            ExpandTree::Permission { rule, .. } => rule.collect_direct(found),
            ExpandTree::Union(children)
            | ExpandTree::Intersection(children)
            | ExpandTree::Arrow { children, .. } => {
                children.iter().for_each(|t| t.collect_direct(found));
            }
            ExpandTree::Exclusion(child) => child.collect_direct(found),
            ExpandTree::Cycle { .. } => {}
        }
    }
}

/// Builds the tree of relations and operators behind a permission on one
/// entity, at a single snapshot and schema version.
pub struct ExpandEngine<R, S> {
    checker: CheckEngine<R, S>,
}

impl<R: RelationshipReader, S: SchemaReader> ExpandEngine<R, S> {
    pub fn new(relationships: Arc<R>, schemas: Arc<S>, config: EngineConfig) -> Self {
        Self {
            checker: CheckEngine::new(relationships, schemas, config),
        }
    }

    pub async fn expand(&self, request: &ExpandRequest) -> Result<ExpandResult, CheckError> {
        let depth = self.checker.initial_depth(request.metadata.depth)?;
        validate_entity(&request.entity)?;
        validate_name("permission", &request.permission)?;
        validate_contextual_tuples(&request.metadata.contextual_tuples)?;

        let outcome = with_deadline(self.checker.deadline(&request.metadata), async {
            let scope = self
                .checker
                .open_scope(
                    &request.tenant_id,
                    None,
                    &request.entity.entity_type,
                    &request.metadata,
                    depth,
                )
                .await?;
            let tree = self
                .expand_named(&scope, &request.entity, &request.permission, depth, &[])
                .await?;
            Ok(ExpandResult {
                tree,
                snapshot: scope.snapshot,
                schema_version: scope.schema_version,
            })
        })
        .await;

        match &outcome {
            Ok(result) => logging::expand_completed(request, result),
            Err(error) => logging::expand_failed(request, error),
        }
        outcome
    }

    /// Expands `name` on `entity`, spending one unit of depth. `trail` holds
    /// the named references already open on this branch.
    fn expand_named<'a>(
        &'a self,
        scope: &'a CallScope,
        entity: &'a EntityRef,
        name: &'a str,
        depth: u32,
        trail: &'a [(EntityRef, String)],
    ) -> Expansion<'a> {
        Box::pin(async move {
            if depth == 0 {
                return Err(CheckError::DepthExceeded(scope.budget));
            }
            if trail.iter().any(|(e, n)| e == entity && n == name) {
                return Ok(ExpandTree::Cycle {
                    entity: entity.clone(),
                    name: name.to_string(),
                });
            }
            scope.count_evaluation().await;

            let definition = self.checker.definition(scope, &entity.entity_type).await?;
            let mut trail = trail.to_vec();
            trail.push((entity.clone(), name.to_string()));

            match definition.reference(name) {
                Some(Reference::Relation(_)) => {
                    self.expand_relation(scope, entity, name, depth - 1, &trail)
                        .await
                }
                Some(Reference::Permission(permission)) => {
                    let rule = &permission.rule;
                    let rule = self
                        .expand_rule(scope, &definition, rule, entity, depth - 1, &trail)
                        .await?;
                    Ok(ExpandTree::Permission {
                        entity: entity.clone(),
                        permission: name.to_string(),
                        rule: Box::new(rule),
                    })
                }
                None => Err(CheckError::ReferenceNotFound {
                    type_name: entity.entity_type.clone(),
                    name: name.to_string(),
                }),
            }
        })
    }

    fn expand_rule<'a>(
        &'a self,
        scope: &'a CallScope,
        definition: &'a EntityDefinition,
        rule: &'a RewriteRule,
        entity: &'a EntityRef,
        depth: u32,
        trail: &'a [(EntityRef, String)],
    ) -> Expansion<'a> {
        Box::pin(async move {
            match rule {
                RewriteRule::This(relation) => {
                    require_relation(definition, relation)?;
                    self.expand_relation(scope, entity, relation, depth, trail)
                        .await
                }
                RewriteRule::Computed(name) => {
                    self.expand_named(scope, entity, name, depth, trail).await
                }
                RewriteRule::Arrow(relation, target) => {
                    require_relation(definition, relation)?;
                    self.expand_arrow(scope, entity, relation, target, depth, trail)
                        .await
                }
                RewriteRule::Union(children) => {
                    let expansions = children
                        .iter()
                        .map(|child| {
                            self.expand_rule(scope, definition, child, entity, depth, trail)
                        })
                        .collect();
                    Ok(ExpandTree::Union(self.expand_all(expansions).await?))
                }
                RewriteRule::Intersection(children) => {
                    let expansions = children
                        .iter()
                        .map(|child| {
                            self.expand_rule(scope, definition, child, entity, depth, trail)
                        })
                        .collect();
                    Ok(ExpandTree::Intersection(self.expand_all(expansions).await?))
                }
                RewriteRule::Exclusion(child) => {
                    let child = self
                        .expand_rule(scope, definition, child, entity, depth, trail)
                        .await?;
                    Ok(ExpandTree::Exclusion(Box::new(child)))
                }
            }
        })
    }

    async fn expand_relation(
        &self,
        scope: &CallScope,
        entity: &EntityRef,
        relation: &str,
        depth: u32,
        trail: &[(EntityRef, String)],
    ) -> Result<ExpandTree, CheckError> {
        let members = resolve_members(&self.checker.source(scope), entity, relation).await?;

        let targets = members.userset_targets();
        let expansions = targets
            .iter()
            .map(|(member, member_relation)| {
                self.expand_named(scope, member, member_relation, depth, trail)
            })
            .collect();
        let usersets = self.expand_all(expansions).await?;

        Ok(ExpandTree::Relation {
            entity: entity.clone(),
            relation: relation.to_string(),
            subjects: members.direct.into_iter().chain(members.usersets).collect(),
            usersets,
        })
    }

    async fn expand_arrow(
        &self,
        scope: &CallScope,
        entity: &EntityRef,
        relation: &str,
        target: &str,
        depth: u32,
        trail: &[(EntityRef, String)],
    ) -> Result<ExpandTree, CheckError> {
        let related = related_entities(&self.checker.source(scope), entity, relation).await?;
        let reachable = self.checker.arrow_targets(scope, &related, target).await?;

        let expansions = reachable
            .into_iter()
            .map(|related| self.expand_named(scope, related, target, depth, trail))
            .collect();

        Ok(ExpandTree::Arrow {
            entity: entity.clone(),
            relation: relation.to_string(),
            target: target.to_string(),
            children: self.expand_all(expansions).await?,
        })
    }

    /// Runs sibling expansions with bounded concurrency, keeping their
    /// order. The first error cancels the rest.
    async fn expand_all(
        &self,
        expansions: Vec<Expansion<'_>>,
    ) -> Result<Vec<ExpandTree>, CheckError> {
        stream::iter(expansions)
            .buffered(self.checker.fan_out())
            .try_collect()
            .await
    }
}
