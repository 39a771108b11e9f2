use chrono::Utc;
use serde_json::Value;
use sqlx::{sqlite::SqliteRow, Row};

use opsdesk_core::domain::idempotency::{
    ConflictPolicy, IdempotencyKey, IdempotencyRecord, IdempotencyScope,
};

use super::{format_timestamp, parse_json, parse_timestamp, IdempotencyStore, RepositoryError};
use crate::DbPool;

const UPSERT_OVERWRITE: &str = "INSERT INTO idempotency_record (
        scope,
        key,
        request_hash,
        response_json,
        created_at,
        updated_at
     ) VALUES (?, ?, ?, ?, ?, ?)
     ON CONFLICT(scope, key) DO UPDATE SET
        request_hash = excluded.request_hash,
        response_json = excluded.response_json,
        updated_at = excluded.updated_at
     RETURNING scope, key, request_hash, response_json, created_at, updated_at";

const UPSERT_REJECT: &str = "INSERT INTO idempotency_record (
        scope,
        key,
        request_hash,
        response_json,
        created_at,
        updated_at
     ) VALUES (?, ?, ?, ?, ?, ?)
     ON CONFLICT(scope, key) DO UPDATE SET
        response_json = excluded.response_json,
        updated_at = excluded.updated_at
     WHERE idempotency_record.request_hash = excluded.request_hash
     RETURNING scope, key, request_hash, response_json, created_at, updated_at";

pub struct SqlIdempotencyStore {
    pool: DbPool,
    policy: ConflictPolicy,
}

impl SqlIdempotencyStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool, policy: ConflictPolicy::default() }
    }

    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[async_trait::async_trait]
impl IdempotencyStore for SqlIdempotencyStore {
    async fn get(
        &self,
        scope: &IdempotencyScope,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, RepositoryError> {
        let row = sqlx::query(
            "SELECT scope, key, request_hash, response_json, created_at, updated_at
             FROM idempotency_record
             WHERE scope = ? AND key = ?",
        )
        .bind(&scope.0)
        .bind(&key.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(record_from_row).transpose()
    }

    async fn put(
        &self,
        scope: &IdempotencyScope,
        key: &IdempotencyKey,
        request_hash: &str,
        response: &Value,
    ) -> Result<IdempotencyRecord, RepositoryError> {
        let statement = match self.policy {
            ConflictPolicy::Overwrite => UPSERT_OVERWRITE,
            ConflictPolicy::Reject => UPSERT_REJECT,
        };
        let now = format_timestamp(&Utc::now());

        // A single statement keeps concurrent puts for the same key atomic.
        let row = sqlx::query(statement)
            .bind(&scope.0)
            .bind(&key.0)
            .bind(request_hash)
            .bind(response.to_string())
            .bind(&now)
            .bind(&now)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => record_from_row(row),
            None => Err(RepositoryError::Conflict(format!(
                "idempotency key `{}` in scope `{}` was already used for a different request",
                key.0, scope.0
            ))),
        }
    }
}

fn record_from_row(row: SqliteRow) -> Result<IdempotencyRecord, RepositoryError> {
    let response_raw = row.try_get::<String, _>("response_json")?;

    Ok(IdempotencyRecord {
        scope: IdempotencyScope(row.try_get("scope")?),
        key: IdempotencyKey(row.try_get("key")?),
        request_hash: row.try_get("request_hash")?,
        response: parse_json("response_json", &response_raw)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use opsdesk_core::domain::idempotency::{ConflictPolicy, IdempotencyKey, IdempotencyScope};

    use super::SqlIdempotencyStore;
    use crate::migrations;
    use crate::repositories::{IdempotencyStore, RepositoryError};
    use crate::{connect_with_settings, DbPool};

    fn scope() -> IdempotencyScope {
        IdempotencyScope("create_sales_order".to_string())
    }

    fn key() -> IdempotencyKey {
        IdempotencyKey("idem-0001".to_string())
    }

    #[tokio::test]
    async fn repeated_put_with_same_hash_returns_identical_response() {
        let pool = setup_pool().await;
        let store = SqlIdempotencyStore::new(pool.clone());
        let response = json!({ "order_number": "SO-1001" });

        let first = store.put(&scope(), &key(), "hash-a", &response).await.expect("first put");
        let second = store.put(&scope(), &key(), "hash-a", &response).await.expect("second put");

        assert_eq!(first.response, second.response);
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(store.get(&scope(), &key()).await.expect("get").map(|r| r.response), Some(response));

        pool.close().await;
    }

    #[tokio::test]
    async fn overwrite_policy_lets_last_write_win() {
        let pool = setup_pool().await;
        let store = SqlIdempotencyStore::new(pool.clone());

        store.put(&scope(), &key(), "hash-a", &json!({ "n": 1 })).await.expect("first put");
        let replaced =
            store.put(&scope(), &key(), "hash-b", &json!({ "n": 2 })).await.expect("overwrite");

        assert_eq!(replaced.request_hash, "hash-b");
        assert_eq!(replaced.response, json!({ "n": 2 }));

        pool.close().await;
    }

    #[tokio::test]
    async fn reject_policy_reports_conflict_and_keeps_original() {
        let pool = setup_pool().await;
        let store = SqlIdempotencyStore::new(pool.clone()).with_policy(ConflictPolicy::Reject);

        store.put(&scope(), &key(), "hash-a", &json!({ "n": 1 })).await.expect("first put");
        let error = store
            .put(&scope(), &key(), "hash-b", &json!({ "n": 2 }))
            .await
            .expect_err("conflicting put");
        assert!(matches!(error, RepositoryError::Conflict(_)));

        let stored = store.get(&scope(), &key()).await.expect("get").expect("record");
        assert_eq!(stored.request_hash, "hash-a");
        assert_eq!(stored.response, json!({ "n": 1 }));

        pool.close().await;
    }

    #[tokio::test]
    async fn keys_are_isolated_per_scope() {
        let pool = setup_pool().await;
        let store = SqlIdempotencyStore::new(pool.clone()).with_policy(ConflictPolicy::Reject);
        let other_scope = IdempotencyScope("create_quote".to_string());

        store.put(&scope(), &key(), "hash-a", &json!("so")).await.expect("put so");
        store.put(&other_scope, &key(), "hash-b", &json!("quote")).await.expect("put quote");

        let quote = store.get(&other_scope, &key()).await.expect("get").expect("record");
        assert_eq!(quote.response, json!("quote"));

        pool.close().await;
    }

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }
}
