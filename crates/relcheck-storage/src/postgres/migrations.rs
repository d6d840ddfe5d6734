use sqlx::PgPool;

use crate::traits::StorageError;

pub fn validate_schema_name(name: &str) -> Result<(), StorageError> {
    let is_valid = name.starts_with("tenant_")
        && name.len() == 39
        && name[7..].chars().all(|c| c.is_ascii_hexdigit());
    if !is_valid {
        return Err(StorageError::Internal(format!(
            "invalid tenant schema name: {name}"
        )));
    }
    Ok(())
}

pub async fn run_shared_migrations(pool: &PgPool) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tenants (
            id          UUID PRIMARY KEY,
            name        TEXT NOT NULL UNIQUE,
            pg_schema   TEXT NOT NULL UNIQUE,
            created_at  TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(to_storage_error)?;

    tracing::debug!("shared migrations applied");
    Ok(())
}

fn to_storage_error(e: sqlx::Error) -> StorageError {
    StorageError::Internal(e.to_string())
}

/// Creates the per-tenant Postgres schema: tuples and their indexes, schema
/// versions, the transaction id sequence and the committed transaction log.
/// Idempotent.
pub async fn create_tenant_schema(pool: &PgPool, schema_name: &str) -> Result<(), StorageError> {
    validate_schema_name(schema_name)?;

    let statements = [
        format!("CREATE SCHEMA IF NOT EXISTS {schema_name}"),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {schema_name}.relation_tuples (
                id               BIGSERIAL PRIMARY KEY,
                entity_type      TEXT NOT NULL,
                entity_id        TEXT NOT NULL,
                relation         TEXT NOT NULL,
                subject_type     TEXT NOT NULL,
                subject_id       TEXT NOT NULL,
                subject_relation TEXT,
                created_tx_id    BIGINT NOT NULL,
                deleted_tx_id    BIGINT NOT NULL DEFAULT 9223372036854775807,
                UNIQUE NULLS NOT DISTINCT (entity_type, entity_id, relation, subject_type,
                       subject_id, subject_relation, deleted_tx_id)
            )
            "#
        ),
        format!(
            r#"
            CREATE INDEX IF NOT EXISTS idx_tuples_lookup
            ON {schema_name}.relation_tuples
                (entity_type, entity_id, relation, deleted_tx_id)
            "#
        ),
        format!(
            r#"
            CREATE INDEX IF NOT EXISTS idx_tuples_reverse
            ON {schema_name}.relation_tuples
                (subject_type, subject_id, subject_relation, deleted_tx_id)
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {schema_name}.schema_definitions (
                version     BIGSERIAL PRIMARY KEY,
                definition  TEXT NOT NULL,
                created_at  TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#
        ),
        format!("CREATE SEQUENCE IF NOT EXISTS {schema_name}.tx_id_seq"),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {schema_name}.transactions (
                tx_id         BIGINT PRIMARY KEY,
                committed_at  TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#
        ),
    ];

    for statement in &statements {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(to_storage_error)?;
    }

    tracing::debug!(schema = schema_name, "tenant schema migrated");
    Ok(())
}
