pub mod migrations;
mod queries;

use std::collections::HashMap;
use std::sync::Mutex;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use relcheck_core::config::DatabaseConfig;
use relcheck_core::schema::{Schema, schema_from_json, schema_to_json};
use relcheck_core::tuple::{SnapshotToken, TenantId, Tuple, TupleFilter, TupleWrite};

use crate::traits::{
    RelationshipStore, SchemaStore, StorageError, StoreFactory, validate_delete_filter,
    validate_for_write,
};

fn schema_name_for_tenant(tenant_id: &TenantId) -> String {
    let simple = tenant_id.as_uuid().as_simple().to_string();
    format!("tenant_{simple}")
}

fn to_storage_error(e: sqlx::Error) -> StorageError {
    StorageError::Internal(e.to_string())
}

/// Tuple and schema storage for one tenant, living in its own Postgres schema.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
    schema: String,
}

impl PostgresStore {
    async fn resolve_snapshot(&self, snapshot: Option<SnapshotToken>) -> Result<i64, StorageError> {
        let current = queries::current_tx_id(&self.pool, &self.schema).await?;
        match snapshot {
            #[allow(clippy::cast_sign_loss)]
            Some(token) if token.value() > current as u64 => Err(StorageError::SnapshotAhead {
                requested: token.value(),
                current: current as u64,
            }),
            #[allow(clippy::cast_possible_wrap)]
            Some(token) => Ok(token.value() as i64),
            None => Ok(current),
        }
    }
}

impl RelationshipStore for PostgresStore {
    async fn write(
        &self,
        writes: &[TupleWrite],
        deletes: &[TupleFilter],
    ) -> Result<SnapshotToken, StorageError> {
        for filter in deletes {
            validate_delete_filter(filter)?;
        }

        let mut tx = self.pool.begin().await.map_err(to_storage_error)?;
        queries::lock_transactions(&mut *tx, &self.schema).await?;
        let tx_id = queries::next_tx_id(&mut *tx, &self.schema).await?;

        for filter in deletes {
            queries::delete_matching_tuples(&mut *tx, &self.schema, filter, tx_id).await?;
        }

        for w in writes {
            queries::insert_tuple(&mut *tx, &self.schema, w, tx_id).await?;
        }

        queries::record_transaction(&mut *tx, &self.schema, tx_id).await?;
        tx.commit().await.map_err(to_storage_error)?;

        #[allow(clippy::cast_sign_loss)]
        Ok(SnapshotToken::new(tx_id as u64))
    }

    async fn read(
        &self,
        filter: &TupleFilter,
        snapshot: Option<SnapshotToken>,
    ) -> Result<Vec<Tuple>, StorageError> {
        filter.validate()?;
        let snap = self.resolve_snapshot(snapshot).await?;
        queries::read_tuples(&self.pool, &self.schema, filter, snap).await
    }

    async fn snapshot(&self) -> Result<SnapshotToken, StorageError> {
        let current = queries::current_tx_id(&self.pool, &self.schema).await?;
        #[allow(clippy::cast_sign_loss)]
        Ok(SnapshotToken::new(current as u64))
    }

    async fn list_entity_ids(
        &self,
        entity_type: &str,
        snapshot: Option<SnapshotToken>,
    ) -> Result<Vec<String>, StorageError> {
        let snap = self.resolve_snapshot(snapshot).await?;
        queries::list_distinct_entity_ids(&self.pool, &self.schema, entity_type, snap).await
    }
}

impl SchemaStore for PostgresStore {
    async fn write_schema(&self, schema: &Schema) -> Result<String, StorageError> {
        validate_for_write(schema)?;
        let definition =
            schema_to_json(schema).map_err(|e| StorageError::Internal(e.to_string()))?;
        let version =
            queries::insert_schema_definition(&self.pool, &self.schema, &definition).await?;

        tracing::debug!(
            schema = self.schema.as_str(),
            version,
            types = schema.types.len(),
            "schema version written"
        );
        Ok(version.to_string())
    }

    async fn read_schema(
        &self,
        version: Option<&str>,
    ) -> Result<Option<(Schema, String)>, StorageError> {
        let wanted = match version {
            Some(v) => Some(
                v.parse::<i64>()
                    .map_err(|_| StorageError::SchemaVersionNotFound(v.to_string()))?,
            ),
            None => None,
        };

        let row = queries::read_schema_definition(&self.pool, &self.schema, wanted).await?;
        let Some((definition, found)) = row else {
            return match version {
                Some(v) => Err(StorageError::SchemaVersionNotFound(v.to_string())),
                None => Ok(None),
            };
        };

        let schema = schema_from_json(&definition).map_err(|e| {
            StorageError::Internal(format!("stored schema version {found} is unreadable: {e}"))
        })?;
        Ok(Some((schema, found.to_string())))
    }
}

pub struct PostgresStoreFactory {
    pool: PgPool,
    schemas: Mutex<HashMap<TenantId, String>>,
}

impl PostgresStoreFactory {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            schemas: Mutex::new(HashMap::new()),
        }
    }

    /// Opens a pool sized by `config` and applies the shared migrations.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(to_storage_error)?;
        migrations::run_shared_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub async fn provision_tenant(
        &self,
        tenant_id: &TenantId,
        name: &str,
    ) -> Result<(), StorageError> {
        let schema_name = schema_name_for_tenant(tenant_id);

        sqlx::query(
            "INSERT INTO tenants (id, name, pg_schema) VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
        )
        .bind(tenant_id.as_uuid())
        .bind(name)
        .bind(&schema_name)
        .execute(&self.pool)
        .await
        .map_err(to_storage_error)?;

        migrations::create_tenant_schema(&self.pool, &schema_name).await?;

        let mut schemas = self.schemas.lock().unwrap_or_else(|e| e.into_inner());
        schemas.insert(tenant_id.clone(), schema_name);

        Ok(())
    }
}

impl StoreFactory for PostgresStoreFactory {
    type Store = PostgresStore;

    fn for_tenant(&self, tenant_id: &TenantId) -> PostgresStore {
        let schemas = self.schemas.lock().unwrap_or_else(|e| e.into_inner());
        let schema = schemas
            .get(tenant_id)
            .cloned()
            .unwrap_or_else(|| schema_name_for_tenant(tenant_id));

        PostgresStore {
            pool: self.pool.clone(),
            schema,
        }
    }
}
