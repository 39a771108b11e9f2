use sqlx::{sqlite::SqliteRow, Row};

use opsdesk_core::domain::conversation::SessionId;
use opsdesk_core::domain::trace::{ToolInvocationTrace, TraceId, TraceStatus};

use super::{
    format_timestamp, parse_json, parse_optional_timestamp, parse_timestamp, RepositoryError,
    TraceRepository,
};
use crate::DbPool;

pub struct SqlTraceRepository {
    pool: DbPool,
}

impl SqlTraceRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl TraceRepository for SqlTraceRepository {
    async fn open(&self, trace: &ToolInvocationTrace) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO tool_invocation_trace (
                trace_id,
                session_id,
                tool,
                status,
                input_json,
                output_json,
                error,
                started_at,
                finished_at
             ) VALUES (?, ?, ?, ?, ?, NULL, NULL, ?, NULL)",
        )
        .bind(&trace.trace_id.0)
        .bind(&trace.session_id.0)
        .bind(&trace.tool)
        .bind(TraceStatus::Pending.as_str())
        .bind(trace.input.to_string())
        .bind(format_timestamp(&trace.started_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn finalize(&self, trace: &ToolInvocationTrace) -> Result<(), RepositoryError> {
        if trace.status == TraceStatus::Pending {
            return Err(RepositoryError::Conflict(format!(
                "trace `{}` cannot be finalized while still pending",
                trace.trace_id.0
            )));
        }

        let result = sqlx::query(
            "UPDATE tool_invocation_trace
             SET status = ?,
                 output_json = ?,
                 error = ?,
                 finished_at = ?
             WHERE trace_id = ? AND status = 'pending'",
        )
        .bind(trace.status.as_str())
        .bind(trace.output.as_ref().map(|output| output.to_string()))
        .bind(trace.error.as_deref())
        .bind(trace.finished_at.as_ref().map(format_timestamp))
        .bind(&trace.trace_id.0)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        match self.find(&trace.trace_id).await? {
            Some(stored) => Err(RepositoryError::Conflict(format!(
                "trace `{}` was already finalized as {}",
                stored.trace_id.0,
                stored.status.as_str()
            ))),
            None => Err(RepositoryError::NotFound(format!("trace `{}`", trace.trace_id.0))),
        }
    }

    async fn find(&self, id: &TraceId) -> Result<Option<ToolInvocationTrace>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                trace_id,
                session_id,
                tool,
                status,
                input_json,
                output_json,
                error,
                started_at,
                finished_at
             FROM tool_invocation_trace
             WHERE trace_id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(trace_from_row).transpose()
    }

    async fn list_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<ToolInvocationTrace>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                trace_id,
                session_id,
                tool,
                status,
                input_json,
                output_json,
                error,
                started_at,
                finished_at
             FROM tool_invocation_trace
             WHERE session_id = ?
             ORDER BY started_at ASC, trace_id ASC",
        )
        .bind(&session_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(trace_from_row).collect()
    }
}

fn trace_from_row(row: SqliteRow) -> Result<ToolInvocationTrace, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = TraceStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown trace status `{status_raw}`")))?;
    let input_raw = row.try_get::<String, _>("input_json")?;
    let output = row
        .try_get::<Option<String>, _>("output_json")?
        .map(|raw| parse_json("output_json", &raw))
        .transpose()?;

    Ok(ToolInvocationTrace {
        trace_id: TraceId(row.try_get("trace_id")?),
        session_id: SessionId(row.try_get("session_id")?),
        tool: row.try_get("tool")?,
        status,
        input: parse_json("input_json", &input_raw)?,
        output,
        error: row.try_get("error")?,
        started_at: parse_timestamp("started_at", row.try_get("started_at")?)?,
        finished_at: parse_optional_timestamp("finished_at", row.try_get("finished_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use opsdesk_core::domain::conversation::SessionId;
    use opsdesk_core::domain::trace::{ToolInvocationTrace, TraceStatus};

    use super::SqlTraceRepository;
    use crate::migrations;
    use crate::repositories::{RepositoryError, TraceRepository};
    use crate::{connect_with_settings, DbPool};

    #[tokio::test]
    async fn trace_is_opened_then_finalized_once() {
        let pool = setup_pool().await;
        let repo = SqlTraceRepository::new(pool.clone());
        let mut trace = ToolInvocationTrace::open(
            SessionId("S-1".to_string()),
            "create_sales_order",
            json!({ "request": "create a sales order" }),
        );

        repo.open(&trace).await.expect("open");
        let pending = repo.find(&trace.trace_id).await.expect("find").expect("stored");
        assert_eq!(pending.status, TraceStatus::Pending);

        trace.succeed(json!({ "order_number": "SO-7" })).expect("succeed");
        repo.finalize(&trace).await.expect("finalize");

        let stored = repo.find(&trace.trace_id).await.expect("find").expect("stored");
        assert_eq!(stored, trace);

        let error = repo.finalize(&trace).await.expect_err("second finalize");
        assert!(matches!(error, RepositoryError::Conflict(_)));

        pool.close().await;
    }

    #[tokio::test]
    async fn failed_traces_are_listed_per_session() {
        let pool = setup_pool().await;
        let repo = SqlTraceRepository::new(pool.clone());
        let session = SessionId("S-2".to_string());
        let mut trace = ToolInvocationTrace::open(session.clone(), "create_quote", json!({}));

        repo.open(&trace).await.expect("open");
        trace.fail("`request` is required").expect("fail");
        repo.finalize(&trace).await.expect("finalize");

        let listed = repo.list_for_session(&session).await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, TraceStatus::Failure);
        assert_eq!(listed[0].error.as_deref(), Some("`request` is required"));
        assert!(repo.list_for_session(&SessionId("S-x".to_string())).await.expect("list").is_empty());

        pool.close().await;
    }

    #[tokio::test]
    async fn finalizing_unknown_trace_reports_not_found() {
        let pool = setup_pool().await;
        let repo = SqlTraceRepository::new(pool.clone());
        let mut trace =
            ToolInvocationTrace::open(SessionId("S-3".to_string()), "create_task", json!({}));
        trace.succeed(json!({ "task_id": "T-1" })).expect("succeed");

        let error = repo.finalize(&trace).await.expect_err("never opened");
        assert!(matches!(error, RepositoryError::NotFound(_)));

        pool.close().await;
    }

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }
}
