use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;

use crate::schema::types::EntityDefinition;
use crate::tuple::EntityRef;

use super::CheckError;

type VerdictKey = (EntityRef, String, u32);

/// Outcome of one `(entity, name, depth)` evaluation, filled at most once.
/// Concurrent evaluations of the same key wait on the first one; if that one
/// is cancelled, a waiter takes over.
pub(super) type VerdictSlot = Arc<OnceCell<Result<bool, CheckError>>>;

/// Memo scoped to a single check or lookup call. Dropped with the call, so
/// nothing leaks across snapshots or schema versions.
///
/// Verdicts are keyed by remaining depth as well as by `(entity, name)`: a
/// branch that exhausted a small budget must not answer for a larger one.
/// Errors are memoized too, so a cycle that runs out of depth is explored
/// once per remaining depth rather than once per path.
#[derive(Debug, Default)]
pub(super) struct CallCache {
    verdicts: Mutex<HashMap<VerdictKey, VerdictSlot>>,
    definitions: Mutex<HashMap<String, Arc<EntityDefinition>>>,
}

impl CallCache {
    pub(super) fn verdict_slot(&self, entity: &EntityRef, name: &str, depth: u32) -> VerdictSlot {
        let mut verdicts = self.verdicts.lock().unwrap_or_else(|e| e.into_inner());
        let slot = verdicts
            .entry((entity.clone(), name.to_string(), depth))
            .or_default();
        Arc::clone(slot)
    }

    pub(super) fn definition(&self, entity_type: &str) -> Option<Arc<EntityDefinition>> {
        let definitions = self.definitions.lock().unwrap_or_else(|e| e.into_inner());
        definitions.get(entity_type).cloned()
    }

    pub(super) fn record_definition(&self, definition: Arc<EntityDefinition>) {
        let mut definitions = self.definitions.lock().unwrap_or_else(|e| e.into_inner());
        definitions.insert(definition.name.clone(), definition);
    }
}
