use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures::stream::{self, StreamExt};

use crate::logging;
use crate::schema::types::{EntityDefinition, Reference, RewriteRule};
use crate::tuple::{Consistency, EntityRef, SnapshotToken, SubjectRef, TenantId, Tuple};

use super::cache::CallCache;
use super::resolver::{TupleSource, related_entities, resolve_members};
use super::{CheckError, EngineConfig, MAX_DEPTH_LIMIT, RelationshipReader, SchemaReader};

type Verdict<'a> = Pin<Box<dyn Future<Output = Result<bool, CheckError>> + Send + 'a>>;

/// Uncached evaluations between two yields to the runtime.
const YIELD_INTERVAL: u32 = 16;

/// Per-call options shared by check, expand and lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMetadata {
    pub consistency: Consistency,
    /// `None` reads the newest schema.
    pub schema_version: Option<String>,
    /// Recursion budget. Must be positive; clamped to
    /// [`EngineConfig::max_depth`].
    pub depth: u32,
    /// Overrides [`EngineConfig::timeout`] for this call.
    pub timeout: Option<Duration>,
    /// Tuples that hold for this call only. They are read alongside the
    /// stored ones and never written.
    pub contextual_tuples: Vec<Tuple>,
}

impl RequestMetadata {
    pub fn new(depth: u32) -> Self {
        Self {
            consistency: Consistency::Latest,
            schema_version: None,
            depth,
            timeout: None,
            contextual_tuples: Vec::new(),
        }
    }

    pub fn at_snapshot(mut self, snapshot: SnapshotToken) -> Self {
        self.consistency = Consistency::AtSnapshot(snapshot);
        self
    }

    pub fn with_schema_version(mut self, version: impl Into<String>) -> Self {
        self.schema_version = Some(version.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_contextual_tuples(mut self, tuples: impl IntoIterator<Item = Tuple>) -> Self {
        self.contextual_tuples.extend(tuples);
        self
    }
}

#[derive(Debug, Clone)]
pub struct CheckRequest {
    pub tenant_id: TenantId,
    pub entity: EntityRef,
    /// Permission or relation name on the entity's type.
    pub permission: String,
    pub subject: SubjectRef,
    pub metadata: RequestMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub allowed: bool,
    /// Named evaluations that were not answered from the call cache.
    pub check_count: u32,
    pub snapshot: SnapshotToken,
    pub schema_version: String,
}

/// State pinned for the whole of one check, expand or lookup call.
pub(super) struct CallScope {
    pub(super) tenant_id: TenantId,
    /// Absent for expand, which has no subject to match.
    pub(super) subject: Option<SubjectRef>,
    pub(super) snapshot: SnapshotToken,
    pub(super) schema_version: String,
    pub(super) contextual: Vec<Tuple>,
    pub(super) budget: u32,
    cache: CallCache,
    check_count: AtomicU32,
}

impl CallScope {
    pub(super) fn check_count(&self) -> u32 {
        self.check_count.load(Ordering::Relaxed)
    }

    /// Counts one uncached evaluation. Every [`YIELD_INTERVAL`] of them the
    /// task yields, so deadlines and stalled siblings get polled even when
    /// every read completes immediately.
    pub(super) async fn count_evaluation(&self) {
        let evaluated = self.check_count.fetch_add(1, Ordering::Relaxed) + 1;
        if evaluated % YIELD_INTERVAL == 0 {
            tokio::task::yield_now().await;
        }
    }

    /// The query subject is itself the userset `entity#name`.
    fn is_subject(&self, entity: &EntityRef, name: &str) -> bool {
        self.subject.as_ref().is_some_and(|subject| {
            subject.normalized_relation() == Some(name)
                && subject.subject_type == entity.entity_type
                && subject.subject_id == entity.entity_id
        })
    }
}

pub struct CheckEngine<R, S> {
    pub(super) relationships: Arc<R>,
    schemas: Arc<S>,
    pub(super) config: EngineConfig,
}

impl<R: RelationshipReader, S: SchemaReader> CheckEngine<R, S> {
    pub fn new(relationships: Arc<R>, schemas: Arc<S>, config: EngineConfig) -> Self {
        Self {
            relationships,
            schemas,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Decides whether `request.subject` holds `request.permission` on
    /// `request.entity`.
    ///
    /// Requires a tokio runtime with the time driver when a deadline applies.
    pub async fn check(&self, request: &CheckRequest) -> Result<CheckResult, CheckError> {
        let depth = self.initial_depth(request.metadata.depth)?;
        validate_entity(&request.entity)?;
        validate_subject(&request.subject)?;
        validate_name("permission", &request.permission)?;
        validate_contextual_tuples(&request.metadata.contextual_tuples)?;

        let outcome = with_deadline(self.deadline(&request.metadata), async {
            let scope = self
                .open_scope(
                    &request.tenant_id,
                    Some(&request.subject),
                    &request.entity.entity_type,
                    &request.metadata,
                    depth,
                )
                .await?;
            let allowed = self
                .evaluate_named(&scope, &request.entity, &request.permission, depth)
                .await?;
            let check_count = scope.check_count();
            Ok(CheckResult {
                allowed,
                check_count,
                snapshot: scope.snapshot,
                schema_version: scope.schema_version,
            })
        })
        .await;

        match &outcome {
            Ok(result) => logging::check_decided(request, result),
            Err(error) => logging::check_failed(request, error),
        }
        outcome
    }

    /// The request's budget, clamped to the configured maximum and to
    /// [`MAX_DEPTH_LIMIT`].
    pub(super) fn initial_depth(&self, requested: u32) -> Result<u32, CheckError> {
        if requested == 0 {
            return Err(CheckError::InvalidRequest(
                "depth must be greater than zero".to_string(),
            ));
        }
        Ok(requested.min(self.config.max_depth).min(MAX_DEPTH_LIMIT))
    }

    pub(super) fn deadline(&self, metadata: &RequestMetadata) -> Option<Duration> {
        metadata.timeout.or(self.config.timeout)
    }

    pub(super) fn fan_out(&self) -> usize {
        self.config.max_concurrent_branches.max(1)
    }

    /// Pins the snapshot and schema version for the call and warms the
    /// definition cache with `entity_type`.
    pub(super) async fn open_scope(
        &self,
        tenant_id: &TenantId,
        subject: Option<&SubjectRef>,
        entity_type: &str,
        metadata: &RequestMetadata,
        budget: u32,
    ) -> Result<CallScope, CheckError> {
        let snapshot = match metadata.consistency {
            Consistency::Latest => self.relationships.head_snapshot(tenant_id).await?,
            Consistency::AtSnapshot(token) => token,
        };
        let (definition, schema_version) = self
            .schemas
            .read_entity_definition(tenant_id, entity_type, metadata.schema_version.as_deref())
            .await?;

        let scope = CallScope {
            tenant_id: tenant_id.clone(),
            subject: subject.cloned(),
            snapshot,
            schema_version,
            contextual: metadata.contextual_tuples.clone(),
            budget,
            cache: CallCache::default(),
            check_count: AtomicU32::new(0),
        };
        scope.cache.record_definition(Arc::new(definition));
        Ok(scope)
    }

    pub(super) fn source<'a>(&'a self, scope: &'a CallScope) -> TupleSource<'a, R> {
        TupleSource {
            reader: self.relationships.as_ref(),
            tenant_id: &scope.tenant_id,
            snapshot: scope.snapshot,
            contextual: &scope.contextual,
        }
    }

    pub(super) async fn definition(
        &self,
        scope: &CallScope,
        entity_type: &str,
    ) -> Result<Arc<EntityDefinition>, CheckError> {
        if let Some(definition) = scope.cache.definition(entity_type) {
            return Ok(definition);
        }
        let (definition, _) = self
            .schemas
            .read_entity_definition(&scope.tenant_id, entity_type, Some(&scope.schema_version))
            .await?;
        let definition = Arc::new(definition);
        scope.cache.record_definition(Arc::clone(&definition));
        Ok(definition)
    }

    /// Entities among `related` whose type defines `target`. An arrow may
    /// land on several subject types and only some of them need to carry
    /// the target; the others cannot grant anything.
    pub(super) async fn arrow_targets<'e>(
        &self,
        scope: &CallScope,
        related: &'e [EntityRef],
        target: &str,
    ) -> Result<Vec<&'e EntityRef>, CheckError> {
        let mut reachable = Vec::with_capacity(related.len());
        for entity in related {
            let definition = self.definition(scope, &entity.entity_type).await?;
            if definition.reference(target).is_some() {
                reachable.push(entity);
            }
        }
        Ok(reachable)
    }

    /// Evaluates relation or permission `name` on `entity`. Every call
    /// spends one unit of `depth`; a call that finds none left fails.
    pub(super) fn evaluate_named<'a>(
        &'a self,
        scope: &'a CallScope,
        entity: &'a EntityRef,
        name: &'a str,
        depth: u32,
    ) -> Verdict<'a> {
        Box::pin(async move {
            if depth == 0 {
                return Err(CheckError::DepthExceeded(scope.budget));
            }
            if scope.is_subject(entity, name) {
                return Ok(true);
            }
            let slot = scope.cache.verdict_slot(entity, name, depth);
            let verdict = slot
                .get_or_init(|| self.evaluate_uncached(scope, entity, name, depth))
                .await;
            verdict.clone()
        })
    }

    async fn evaluate_uncached(
        &self,
        scope: &CallScope,
        entity: &EntityRef,
        name: &str,
        depth: u32,
    ) -> Result<bool, CheckError> {
        scope.count_evaluation().await;

        let definition = self.definition(scope, &entity.entity_type).await?;
        match definition.reference(name) {
            Some(Reference::Relation(_)) => {
                self.evaluate_direct(scope, entity, name, depth - 1).await
            }
            Some(Reference::Permission(permission)) => {
                self.evaluate_rule(scope, &definition, &permission.rule, entity, depth - 1)
                    .await
            }
            None => Err(CheckError::ReferenceNotFound {
                type_name: entity.entity_type.clone(),
                name: name.to_string(),
            }),
        }
    }

    fn evaluate_rule<'a>(
        &'a self,
        scope: &'a CallScope,
        definition: &'a EntityDefinition,
        rule: &'a RewriteRule,
        entity: &'a EntityRef,
        depth: u32,
    ) -> Verdict<'a> {
        Box::pin(async move {
            match rule {
                RewriteRule::This(relation) => {
                    require_relation(definition, relation)?;
                    self.evaluate_direct(scope, entity, relation, depth).await
                }
                RewriteRule::Computed(name) => {
                    self.evaluate_named(scope, entity, name, depth).await
                }
                RewriteRule::Arrow(relation, target) => {
                    require_relation(definition, relation)?;
                    self.evaluate_arrow(scope, entity, relation, target, depth)
                        .await
                }
                RewriteRule::Union(children) => {
                    let branches = children
                        .iter()
                        .map(|child| self.evaluate_rule(scope, definition, child, entity, depth))
                        .collect();
                    any_allowed(branches, self.fan_out()).await
                }
                RewriteRule::Intersection(children) => {
                    let branches = children
                        .iter()
                        .map(|child| self.evaluate_rule(scope, definition, child, entity, depth))
                        .collect();
                    all_allowed(branches, self.fan_out()).await
                }
                RewriteRule::Exclusion(child) => {
                    let allowed = self
                        .evaluate_rule(scope, definition, child, entity, depth)
                        .await?;
                    Ok(!allowed)
                }
            }
        })
    }

    /// Subjects stored under `entity#relation`: an exact match allows,
    /// otherwise every userset member is expanded.
    async fn evaluate_direct(
        &self,
        scope: &CallScope,
        entity: &EntityRef,
        relation: &str,
        depth: u32,
    ) -> Result<bool, CheckError> {
        let members = resolve_members(&self.source(scope), entity, relation).await?;
        if scope
            .subject
            .as_ref()
            .is_some_and(|subject| members.contains(subject))
        {
            return Ok(true);
        }

        let targets = members.userset_targets();
        let branches = targets
            .iter()
            .map(|(member, member_relation)| {
                self.evaluate_named(scope, member, member_relation, depth)
            })
            .collect();
        any_allowed(branches, self.fan_out()).await
    }

    /// `target` evaluated on every entity reached over `entity#relation`
    /// whose type defines it.
    async fn evaluate_arrow(
        &self,
        scope: &CallScope,
        entity: &EntityRef,
        relation: &str,
        target: &str,
        depth: u32,
    ) -> Result<bool, CheckError> {
        let related = related_entities(&self.source(scope), entity, relation).await?;
        let reachable = self.arrow_targets(scope, &related, target).await?;

        let branches = reachable
            .into_iter()
            .map(|related| self.evaluate_named(scope, related, target, depth))
            .collect();
        any_allowed(branches, self.fan_out()).await
    }
}

/// ALLOWED as soon as one branch allows; dropping the stream cancels the
/// rest. Otherwise the first error seen, else DENIED.
async fn any_allowed(branches: Vec<Verdict<'_>>, fan_out: usize) -> Result<bool, CheckError> {
    let mut pending = stream::iter(branches).buffer_unordered(fan_out);
    let mut failure = None;
    while let Some(verdict) = pending.next().await {
        match verdict {
            Ok(true) => return Ok(true),
            Ok(false) => {}
            Err(error) => {
                failure.get_or_insert(error);
            }
        }
    }
    failure.map_or(Ok(false), Err)
}

/// DENIED as soon as one branch denies. Otherwise the first error seen,
/// else ALLOWED. An empty intersection denies.
async fn all_allowed(branches: Vec<Verdict<'_>>, fan_out: usize) -> Result<bool, CheckError> {
    if branches.is_empty() {
        return Ok(false);
    }
    let mut pending = stream::iter(branches).buffer_unordered(fan_out);
    let mut failure = None;
    while let Some(verdict) = pending.next().await {
        match verdict {
            Ok(false) => return Ok(false),
            Ok(true) => {}
            Err(error) => {
                failure.get_or_insert(error);
            }
        }
    }
    failure.map_or(Ok(true), Err)
}

pub(super) async fn with_deadline<T, F>(deadline: Option<Duration>, work: F) -> Result<T, CheckError>
where
    F: Future<Output = Result<T, CheckError>>,
{
    match deadline {
        Some(limit) => tokio::time::timeout(limit, work)
            .await
            .map_err(|_| CheckError::DeadlineExceeded(limit))?,
        None => work.await,
    }
}

pub(super) fn require_relation(
    definition: &EntityDefinition,
    relation: &str,
) -> Result<(), CheckError> {
    if definition.get_relation(relation).is_none() {
        return Err(CheckError::RelationNotFound {
            type_name: definition.name.clone(),
            relation: relation.to_string(),
        });
    }
    Ok(())
}

pub(super) fn validate_name(what: &str, value: &str) -> Result<(), CheckError> {
    if value.is_empty() {
        return Err(CheckError::InvalidRequest(format!("{what} must not be empty")));
    }
    Ok(())
}

pub(super) fn validate_entity(entity: &EntityRef) -> Result<(), CheckError> {
    validate_name("entity type", &entity.entity_type)?;
    validate_name("entity id", &entity.entity_id)
}

pub(super) fn validate_subject(subject: &SubjectRef) -> Result<(), CheckError> {
    validate_name("subject type", &subject.subject_type)?;
    validate_name("subject id", &subject.subject_id)?;
    if matches!(subject.subject_relation.as_deref(), Some("")) {
        return Err(CheckError::InvalidRequest(
            "subject relation must not be empty".to_string(),
        ));
    }
    Ok(())
}

pub(super) fn validate_contextual_tuples(tuples: &[Tuple]) -> Result<(), CheckError> {
    for tuple in tuples {
        validate_entity(&tuple.entity)?;
        validate_name("contextual tuple relation", &tuple.relation)?;
        validate_subject(&tuple.subject)?;
    }
    Ok(())
}
