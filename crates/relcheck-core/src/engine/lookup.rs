use std::collections::HashSet;
use std::sync::Arc;

use futures::stream::{self, StreamExt};

use crate::logging;
use crate::tuple::{EntityRef, SnapshotToken, SubjectRef, TenantId};

use super::check::{
    CheckEngine, RequestMetadata, validate_contextual_tuples, validate_name, validate_subject,
    with_deadline,
};
use super::{CheckError, EngineConfig, LookupErrorPolicy, RelationshipReader, SchemaReader};

#[derive(Debug, Clone)]
pub struct LookupRequest {
    pub tenant_id: TenantId,
    pub entity_type: String,
    pub permission: String,
    pub subject: SubjectRef,
    pub metadata: RequestMetadata,
    /// Stop once this many allowed ids are collected.
    pub limit: Option<usize>,
    /// Sort `entity_ids` instead of keeping enumeration order.
    pub sorted: bool,
}

#[derive(Debug)]
pub struct SkippedCandidate {
    pub entity_id: String,
    pub error: CheckError,
}

#[derive(Debug)]
pub struct LookupResult {
    pub entity_ids: Vec<String>,
    /// Candidates left out under [`LookupErrorPolicy::Skip`].
    pub skipped: Vec<SkippedCandidate>,
    pub check_count: u32,
    pub snapshot: SnapshotToken,
    pub schema_version: String,
}

/// Answers "which entities of a type can this subject act on" by checking
/// every known entity of the type.
pub struct LookupEngine<R, S> {
    checker: CheckEngine<R, S>,
}

impl<R: RelationshipReader, S: SchemaReader> LookupEngine<R, S> {
    pub fn new(relationships: Arc<R>, schemas: Arc<S>, config: EngineConfig) -> Self {
        Self {
            checker: CheckEngine::new(relationships, schemas, config),
        }
    }

    pub fn check_engine(&self) -> &CheckEngine<R, S> {
        &self.checker
    }

    pub async fn lookup_entity(&self, request: &LookupRequest) -> Result<LookupResult, CheckError> {
        let depth = self.checker.initial_depth(request.metadata.depth)?;
        validate_name("entity type", &request.entity_type)?;
        validate_name("permission", &request.permission)?;
        validate_subject(&request.subject)?;
        validate_contextual_tuples(&request.metadata.contextual_tuples)?;
        if request.limit == Some(0) {
            return Err(CheckError::InvalidRequest(
                "limit must be greater than zero".to_string(),
            ));
        }

        let outcome = with_deadline(
            self.checker.deadline(&request.metadata),
            self.run(request, depth),
        )
        .await;

        match &outcome {
            Ok(result) => logging::lookup_completed(request, result),
            Err(error) => logging::lookup_failed(request, error),
        }
        outcome
    }

    async fn run(&self, request: &LookupRequest, depth: u32) -> Result<LookupResult, CheckError> {
        let scope = self
            .checker
            .open_scope(
                &request.tenant_id,
                Some(&request.subject),
                &request.entity_type,
                &request.metadata,
                depth,
            )
            .await?;
        let definition = self.checker.definition(&scope, &request.entity_type).await?;
        if definition.reference(&request.permission).is_none() {
            return Err(CheckError::ReferenceNotFound {
                type_name: request.entity_type.clone(),
                name: request.permission.clone(),
            });
        }

        let mut ids = self
            .checker
            .relationships
            .unique_entity_ids(&scope.tenant_id, &request.entity_type, scope.snapshot)
            .await?;
        // Entities known only from contextual tuples are candidates too.
        let mut seen: HashSet<String> = ids.iter().cloned().collect();
        for tuple in &scope.contextual {
            if tuple.entity.entity_type == request.entity_type
                && seen.insert(tuple.entity.entity_id.clone())
            {
                ids.push(tuple.entity.entity_id.clone());
            }
        }
        let candidates: Vec<EntityRef> = ids
            .into_iter()
            .map(|id| EntityRef::new(&request.entity_type, id))
            .collect();

        // One cache serves every candidate; each check starts with the full budget.
        let checks: Vec<_> = candidates
            .iter()
            .map(|candidate| {
                self.checker
                    .evaluate_named(&scope, candidate, &request.permission, depth)
            })
            .collect();
        let mut verdicts = stream::iter(checks)
            .buffered(self.checker.fan_out())
            .enumerate();

        let mut entity_ids = Vec::new();
        let mut skipped = Vec::new();
        while let Some((index, verdict)) = verdicts.next().await {
            let entity_id = &candidates[index].entity_id;
            match verdict {
                Ok(true) => {
                    entity_ids.push(entity_id.clone());
                    if request.limit.is_some_and(|limit| entity_ids.len() >= limit) {
                        break;
                    }
                }
                Ok(false) => {}
                Err(error) => match self.checker.config.lookup_error_policy {
                    LookupErrorPolicy::Abort => return Err(error),
                    LookupErrorPolicy::Skip => {
                        logging::candidate_skipped(request, entity_id, &error);
                        skipped.push(SkippedCandidate {
                            entity_id: entity_id.clone(),
                            error,
                        });
                    }
                },
            }
        }
        drop(verdicts);

        if request.sorted {
            entity_ids.sort();
        }

        Ok(LookupResult {
            entity_ids,
            skipped,
            check_count: scope.check_count(),
            snapshot: scope.snapshot,
            schema_version: scope.schema_version,
        })
    }
}
