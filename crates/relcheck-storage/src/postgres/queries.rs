use relcheck_core::tuple::{EntityRef, SubjectRef, Tuple, TupleFilter, TupleWrite};

use crate::traits::StorageError;

const ACTIVE_TX_ID: i64 = i64::MAX;

fn to_storage_error(e: sqlx::Error) -> StorageError {
    StorageError::Internal(e.to_string())
}

/// Appends one condition per set filter field. Placeholders start at
/// `first_bind`; the returned values are bound in order after the fixed ones.
fn filter_conditions<'f>(
    filter: &'f TupleFilter,
    conditions: &mut Vec<String>,
    first_bind: usize,
) -> Vec<&'f str> {
    let mut binds: Vec<&str> = Vec::new();
    let next = |binds: &mut Vec<&'f str>, value: &'f str| {
        binds.push(value);
        first_bind + binds.len() - 1
    };

    if let Some(ref et) = filter.entity_type {
        let idx = next(&mut binds, et);
        conditions.push(format!("entity_type = ${idx}"));
    }
    if !filter.entity_ids.is_empty() {
        let placeholders: Vec<String> = filter
            .entity_ids
            .iter()
            .map(|id| format!("${}", next(&mut binds, id)))
            .collect();
        conditions.push(format!("entity_id IN ({})", placeholders.join(", ")));
    }
    if let Some(ref r) = filter.relation {
        let idx = next(&mut binds, r);
        conditions.push(format!("relation = ${idx}"));
    }
    if let Some(ref st) = filter.subject_type {
        let idx = next(&mut binds, st);
        conditions.push(format!("subject_type = ${idx}"));
    }
    if let Some(ref si) = filter.subject_id {
        let idx = next(&mut binds, si);
        conditions.push(format!("subject_id = ${idx}"));
    }
    match filter.subject_relation {
        None => {}
        Some(None) => conditions.push("subject_relation IS NULL".to_string()),
        Some(Some(ref rel)) => {
            let idx = next(&mut binds, rel);
            conditions.push(format!("subject_relation = ${idx}"));
        }
    }

    binds
}

pub async fn next_tx_id<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    schema: &str,
) -> Result<i64, StorageError> {
    let query = format!("SELECT nextval('{schema}.tx_id_seq')");
    let row: (i64,) = sqlx::query_as(&query)
        .fetch_one(executor)
        .await
        .map_err(to_storage_error)?;

    if row.0 == ACTIVE_TX_ID {
        return Err(StorageError::Internal(
            "transaction id sequence exhausted".to_string(),
        ));
    }

    Ok(row.0)
}

/// Serializes writers so transaction ids commit in allocation order. Held
/// until the surrounding transaction ends; plain reads are not blocked.
pub async fn lock_transactions<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    schema: &str,
) -> Result<(), StorageError> {
    let query = format!("LOCK TABLE {schema}.transactions IN EXCLUSIVE MODE");
    sqlx::query(&query)
        .execute(executor)
        .await
        .map_err(to_storage_error)?;
    Ok(())
}

/// Marks `tx_id` committed once the surrounding transaction commits.
pub async fn record_transaction<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    schema: &str,
    tx_id: i64,
) -> Result<(), StorageError> {
    let query = format!("INSERT INTO {schema}.transactions (tx_id) VALUES ($1)");
    sqlx::query(&query)
        .bind(tx_id)
        .execute(executor)
        .await
        .map_err(to_storage_error)?;
    Ok(())
}

/// Highest committed transaction id. Ids handed out by the sequence to
/// writers still in flight are not visible here.
pub async fn current_tx_id<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    schema: &str,
) -> Result<i64, StorageError> {
    let query = format!("SELECT COALESCE(MAX(tx_id), 0) FROM {schema}.transactions");
    let row: (i64,) = sqlx::query_as(&query)
        .fetch_one(executor)
        .await
        .map_err(to_storage_error)?;
    Ok(row.0)
}

pub async fn insert_tuple<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    schema: &str,
    write: &TupleWrite,
    tx_id: i64,
) -> Result<(), StorageError> {
    let query = format!(
        r#"
        INSERT INTO {schema}.relation_tuples
            (entity_type, entity_id, relation, subject_type, subject_id, subject_relation, created_tx_id, deleted_tx_id)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#
    );
    sqlx::query(&query)
        .bind(&write.entity.entity_type)
        .bind(&write.entity.entity_id)
        .bind(&write.relation)
        .bind(&write.subject.subject_type)
        .bind(&write.subject.subject_id)
        .bind(&write.subject.subject_relation)
        .bind(tx_id)
        .bind(ACTIVE_TX_ID)
        .execute(executor)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.is_unique_violation()
            {
                return StorageError::DuplicateTuple;
            }
            to_storage_error(e)
        })?;
    Ok(())
}

pub async fn delete_matching_tuples<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    schema: &str,
    filter: &TupleFilter,
    tx_id: i64,
) -> Result<u64, StorageError> {
    // $1 = ACTIVE_TX_ID (WHERE), $2 = tx_id (SET)
    let mut conditions = vec!["deleted_tx_id = $1".to_string()];
    let binds = filter_conditions(filter, &mut conditions, 3);

    let query = format!(
        "UPDATE {schema}.relation_tuples SET deleted_tx_id = $2 WHERE {}",
        conditions.join(" AND ")
    );

    let mut q = sqlx::query(&query).bind(ACTIVE_TX_ID).bind(tx_id);
    for bind in binds {
        q = q.bind(bind);
    }
    let result = q.execute(executor).await.map_err(to_storage_error)?;
    Ok(result.rows_affected())
}

pub async fn read_tuples<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    schema: &str,
    filter: &TupleFilter,
    snapshot: i64,
) -> Result<Vec<Tuple>, StorageError> {
    // $1 = snapshot
    let mut conditions = vec![
        "created_tx_id <= $1".to_string(),
        "deleted_tx_id > $1".to_string(),
    ];
    let binds = filter_conditions(filter, &mut conditions, 2);

    let query = format!(
        r#"SELECT entity_type, entity_id, relation, subject_type, subject_id, subject_relation
           FROM {schema}.relation_tuples
           WHERE {}
           ORDER BY created_tx_id, id"#,
        conditions.join(" AND ")
    );

    let mut q =
        sqlx::query_as::<_, (String, String, String, String, String, Option<String>)>(&query)
            .bind(snapshot);
    for bind in binds {
        q = q.bind(bind);
    }

    let rows = q.fetch_all(executor).await.map_err(to_storage_error)?;

    let tuples = rows
        .into_iter()
        .map(
            |(entity_type, entity_id, relation, subject_type, subject_id, subject_relation)| {
                let subject = match subject_relation {
                    None => SubjectRef::direct(subject_type, subject_id),
                    Some(rel) => SubjectRef::userset(subject_type, subject_id, rel),
                };
                Tuple::new(EntityRef::new(entity_type, entity_id), relation, subject)
            },
        )
        .collect();

    Ok(tuples)
}

pub async fn list_distinct_entity_ids<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    schema: &str,
    entity_type: &str,
    snapshot: i64,
) -> Result<Vec<String>, StorageError> {
    let query = format!(
        r#"SELECT DISTINCT entity_id
           FROM {schema}.relation_tuples
           WHERE entity_type = $1 AND created_tx_id <= $2 AND deleted_tx_id > $2
           ORDER BY entity_id"#
    );

    let rows: Vec<(String,)> = sqlx::query_as(&query)
        .bind(entity_type)
        .bind(snapshot)
        .fetch_all(executor)
        .await
        .map_err(to_storage_error)?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

pub async fn insert_schema_definition<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    schema: &str,
    definition: &str,
) -> Result<i64, StorageError> {
    let query = format!(
        "INSERT INTO {schema}.schema_definitions (definition) VALUES ($1) RETURNING version"
    );
    let row: (i64,) = sqlx::query_as(&query)
        .bind(definition)
        .fetch_one(executor)
        .await
        .map_err(to_storage_error)?;
    Ok(row.0)
}

pub async fn read_schema_definition<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    schema: &str,
    version: Option<i64>,
) -> Result<Option<(String, i64)>, StorageError> {
    let row: Option<(String, i64)> = match version {
        Some(v) => {
            let query = format!(
                "SELECT definition, version FROM {schema}.schema_definitions WHERE version = $1"
            );
            sqlx::query_as(&query)
                .bind(v)
                .fetch_optional(executor)
                .await
        }
        None => {
            let query = format!(
                "SELECT definition, version FROM {schema}.schema_definitions ORDER BY version DESC LIMIT 1"
            );
            sqlx::query_as(&query).fetch_optional(executor).await
        }
    }
    .map_err(to_storage_error)?;
    Ok(row)
}
