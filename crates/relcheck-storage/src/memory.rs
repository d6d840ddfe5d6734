use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use relcheck_core::schema::Schema;
use relcheck_core::tuple::{SnapshotToken, TenantId, Tuple, TupleFilter, TupleWrite};

use crate::traits::{
    RelationshipStore, SchemaStore, StorageError, StoreFactory, validate_delete_filter,
    validate_for_write,
};

const ACTIVE_TX_ID: u64 = u64::MAX;

#[derive(Debug, Clone)]
struct StoredTuple {
    tuple: Tuple,
    created_tx_id: u64,
    deleted_tx_id: u64,
}

impl StoredTuple {
    fn is_active(&self) -> bool {
        self.deleted_tx_id == ACTIVE_TX_ID
    }

    fn visible_at(&self, snapshot: u64) -> bool {
        self.created_tx_id <= snapshot && self.deleted_tx_id > snapshot
    }
}

#[derive(Debug, Default)]
struct InnerState {
    current_tx: u64,
    tuples: Vec<StoredTuple>,
    schemas: Vec<Schema>,
}

impl InnerState {
    fn resolve_snapshot(&self, snapshot: Option<SnapshotToken>) -> Result<u64, StorageError> {
        match snapshot {
            Some(token) if token.value() > self.current_tx => Err(StorageError::SnapshotAhead {
                requested: token.value(),
                current: self.current_tx,
            }),
            Some(token) => Ok(token.value()),
            None => Ok(self.current_tx),
        }
    }
}

/// MVCC tuple store held in process memory. Schema versions are "1", "2", ...
/// in write order.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<InnerState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, InnerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl RelationshipStore for InMemoryStore {
    async fn write(
        &self,
        writes: &[TupleWrite],
        deletes: &[TupleFilter],
    ) -> Result<SnapshotToken, StorageError> {
        for filter in deletes {
            validate_delete_filter(filter)?;
        }
        for (i, w) in writes.iter().enumerate() {
            if writes[i + 1..].contains(w) {
                return Err(StorageError::DuplicateTuple);
            }
        }

        let mut state = self.state();
        let tx_id = state.current_tx + 1;

        let doomed: Vec<usize> = state
            .tuples
            .iter()
            .enumerate()
            .filter(|(_, t)| t.is_active() && deletes.iter().any(|f| f.matches(&t.tuple)))
            .map(|(i, _)| i)
            .collect();

        let mut fresh = Vec::with_capacity(writes.len());
        for w in writes {
            let tuple = Tuple::from(w.clone());
            let still_active = state
                .tuples
                .iter()
                .enumerate()
                .any(|(i, t)| t.is_active() && t.tuple == tuple && !doomed.contains(&i));
            if still_active {
                return Err(StorageError::DuplicateTuple);
            }
            fresh.push(StoredTuple {
                tuple,
                created_tx_id: tx_id,
                deleted_tx_id: ACTIVE_TX_ID,
            });
        }

        for i in doomed {
            state.tuples[i].deleted_tx_id = tx_id;
        }
        state.tuples.extend(fresh);
        state.current_tx = tx_id;

        Ok(SnapshotToken::new(tx_id))
    }

    async fn read(
        &self,
        filter: &TupleFilter,
        snapshot: Option<SnapshotToken>,
    ) -> Result<Vec<Tuple>, StorageError> {
        filter.validate()?;
        let state = self.state();
        let snap = state.resolve_snapshot(snapshot)?;

        let results = state
            .tuples
            .iter()
            .filter(|t| t.visible_at(snap) && filter.matches(&t.tuple))
            .map(|t| t.tuple.clone())
            .collect();

        Ok(results)
    }

    async fn snapshot(&self) -> Result<SnapshotToken, StorageError> {
        Ok(SnapshotToken::new(self.state().current_tx))
    }

    async fn list_entity_ids(
        &self,
        entity_type: &str,
        snapshot: Option<SnapshotToken>,
    ) -> Result<Vec<String>, StorageError> {
        let state = self.state();
        let snap = state.resolve_snapshot(snapshot)?;

        let ids: BTreeSet<&str> = state
            .tuples
            .iter()
            .filter(|t| t.visible_at(snap) && t.tuple.entity.entity_type == entity_type)
            .map(|t| t.tuple.entity.entity_id.as_str())
            .collect();

        Ok(ids.into_iter().map(str::to_string).collect())
    }
}

impl SchemaStore for InMemoryStore {
    async fn write_schema(&self, schema: &Schema) -> Result<String, StorageError> {
        validate_for_write(schema)?;
        let mut state = self.state();
        state.schemas.push(schema.clone());
        Ok(state.schemas.len().to_string())
    }

    async fn read_schema(
        &self,
        version: Option<&str>,
    ) -> Result<Option<(Schema, String)>, StorageError> {
        let state = self.state();
        match version {
            None => Ok(state
                .schemas
                .last()
                .map(|s| (s.clone(), state.schemas.len().to_string()))),
            Some(v) => {
                let schema = v
                    .parse::<usize>()
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .and_then(|i| state.schemas.get(i))
                    .ok_or_else(|| StorageError::SchemaVersionNotFound(v.to_string()))?;
                Ok(Some((schema.clone(), v.to_string())))
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStoreFactory {
    stores: Mutex<HashMap<TenantId, InMemoryStore>>,
}

impl InMemoryStoreFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoreFactory for InMemoryStoreFactory {
    type Store = InMemoryStore;

    fn for_tenant(&self, tenant_id: &TenantId) -> InMemoryStore {
        let mut stores = self.stores.lock().unwrap_or_else(|e| e.into_inner());
        stores.entry(tenant_id.clone()).or_default().clone()
    }
}
