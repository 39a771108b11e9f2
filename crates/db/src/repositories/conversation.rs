use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};

use opsdesk_core::domain::conversation::{
    Message, MessageId, MessagePayload, MessageRole, Session, SessionId,
};

use super::{
    format_timestamp, parse_timestamp, CompactionOutcome, CompactionPlanner,
    ConversationRepository, RepositoryError,
};
use crate::DbPool;

pub struct SqlConversationRepository {
    pool: DbPool,
}

impl SqlConversationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ConversationRepository for SqlConversationRepository {
    async fn ensure_session(&self, session: Session) -> Result<Session, RepositoryError> {
        let row = sqlx::query(
            "INSERT INTO conversation_session (
                id,
                user_id,
                company_id,
                created_at,
                last_activity_at
             ) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                user_id = COALESCE(conversation_session.user_id, excluded.user_id),
                company_id = COALESCE(conversation_session.company_id, excluded.company_id)
             RETURNING id, user_id, company_id, created_at, last_activity_at",
        )
        .bind(&session.id.0)
        .bind(session.user_id.as_deref())
        .bind(session.company_id.as_deref())
        .bind(format_timestamp(&session.created_at))
        .bind(format_timestamp(&session.last_activity_at))
        .fetch_one(&self.pool)
        .await?;

        session_from_row(row)
    }

    async fn find_session(&self, id: &SessionId) -> Result<Option<Session>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, user_id, company_id, created_at, last_activity_at
             FROM conversation_session
             WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(session_from_row).transpose()
    }

    async fn touch_session(
        &self,
        id: &SessionId,
        at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        touch(&mut conn, id, at).await
    }

    async fn append_messages(&self, messages: Vec<Message>) -> Result<(), RepositoryError> {
        if messages.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for message in &messages {
            insert_message(&mut tx, message).await?;
        }
        tx.commit().await?;

        Ok(())
    }

    async fn list_messages(&self, id: &SessionId) -> Result<Vec<Message>, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        select_messages(&mut conn, id).await
    }

    async fn count_messages(&self, id: &SessionId) -> Result<usize, RepositoryError> {
        let count = sqlx::query(
            "SELECT COUNT(*) AS count FROM conversation_message WHERE session_id = ?",
        )
        .bind(&id.0)
        .fetch_one(&self.pool)
        .await?
        .try_get::<i64, _>("count")?;

        usize::try_from(count).map_err(|_| {
            RepositoryError::Decode(format!("invalid message count for `{}`: {count}", id.0))
        })
    }

    async fn compact(
        &self,
        id: &SessionId,
        planner: &dyn CompactionPlanner,
    ) -> Result<Option<CompactionOutcome>, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let snapshot = select_messages(&mut tx, id).await?;
        let Some(plan) = planner.plan(&snapshot) else {
            tx.rollback().await?;
            return Ok(None);
        };

        let mut deleted = 0usize;
        for message_id in &plan.delete_ids {
            let result =
                sqlx::query("DELETE FROM conversation_message WHERE id = ? AND session_id = ?")
                    .bind(&message_id.0)
                    .bind(&id.0)
                    .execute(&mut *tx)
                    .await?;
            deleted += result.rows_affected() as usize;
        }

        if deleted != plan.delete_ids.len() {
            tx.rollback().await?;
            return Err(RepositoryError::Conflict(format!(
                "compaction of session `{}` expected to delete {} messages but deleted {deleted}",
                id.0,
                plan.delete_ids.len()
            )));
        }

        insert_message(&mut tx, &plan.summary_message).await?;
        touch(&mut tx, id, Utc::now()).await?;
        tx.commit().await?;

        Ok(Some(CompactionOutcome {
            deleted,
            summary_id: plan.summary_message.id.clone(),
            remaining: snapshot.len() - deleted + 1,
        }))
    }
}

async fn insert_message(
    conn: &mut SqliteConnection,
    message: &Message,
) -> Result<(), RepositoryError> {
    sqlx::query(
        "INSERT INTO conversation_message (
            id,
            session_id,
            role,
            kind,
            body_json,
            created_at
         ) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&message.id.0)
    .bind(&message.session_id.0)
    .bind(message.role.as_str())
    .bind(message.payload.kind())
    .bind(message.payload.encode_body())
    .bind(format_timestamp(&message.created_at))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn select_messages(
    conn: &mut SqliteConnection,
    id: &SessionId,
) -> Result<Vec<Message>, RepositoryError> {
    let rows = sqlx::query(
        "SELECT id, session_id, role, kind, body_json, created_at
         FROM conversation_message
         WHERE session_id = ?
         ORDER BY created_at ASC, id ASC",
    )
    .bind(&id.0)
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter().map(message_from_row).collect()
}

async fn touch(
    conn: &mut SqliteConnection,
    id: &SessionId,
    at: DateTime<Utc>,
) -> Result<(), RepositoryError> {
    let result = sqlx::query(
        "UPDATE conversation_session
         SET last_activity_at = MAX(last_activity_at, ?)
         WHERE id = ?",
    )
    .bind(format_timestamp(&at))
    .bind(&id.0)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(RepositoryError::NotFound(format!("session `{}`", id.0)));
    }
    Ok(())
}

fn session_from_row(row: SqliteRow) -> Result<Session, RepositoryError> {
    Ok(Session {
        id: SessionId(row.try_get("id")?),
        user_id: row.try_get("user_id")?,
        company_id: row.try_get("company_id")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        last_activity_at: parse_timestamp("last_activity_at", row.try_get("last_activity_at")?)?,
    })
}

fn message_from_row(row: SqliteRow) -> Result<Message, RepositoryError> {
    let role_raw = row.try_get::<String, _>("role")?;
    let role = MessageRole::parse(&role_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown message role `{role_raw}`")))?;
    let kind = row.try_get::<String, _>("kind")?;
    let body = row.try_get::<String, _>("body_json")?;
    let payload = MessagePayload::decode(&kind, &body).map_err(RepositoryError::Decode)?;

    Ok(Message {
        id: MessageId(row.try_get("id")?),
        session_id: SessionId(row.try_get("session_id")?),
        role,
        payload,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};

    use opsdesk_core::domain::conversation::{
        ConversationSummary, Message, MessageId, MessagePayload, MessageRole, Session, SessionId,
    };

    use super::SqlConversationRepository;
    use crate::migrations;
    use crate::repositories::{
        CompactionPlan, CompactionPlanner, ConversationRepository, RepositoryError,
    };
    use crate::{connect_with_settings, DbPool};

    struct KeepLast(usize);

    impl CompactionPlanner for KeepLast {
        fn plan(&self, messages: &[Message]) -> Option<CompactionPlan> {
            if messages.len() <= self.0 {
                return None;
            }
            let older = &messages[..messages.len() - self.0];
            let last = older.last()?;
            let summary = ConversationSummary {
                summary_text: format!("{} earlier messages", older.len()),
                highlights: Vec::new(),
                resolution: None,
                last_summarized_message_id: last.id.clone(),
                summarized_count: older.len(),
            };
            let mut summary_message = Message::new(
                last.session_id.clone(),
                MessageRole::Assistant,
                MessagePayload::Summary(summary),
            );
            summary_message.created_at = last.created_at;
            Some(CompactionPlan {
                delete_ids: older.iter().map(|message| message.id.clone()).collect(),
                summary_message,
            })
        }
    }

    #[tokio::test]
    async fn ensure_session_is_idempotent_and_fills_missing_owner() {
        let pool = setup_pool().await;
        let repo = SqlConversationRepository::new(pool.clone());
        let id = SessionId("S-100".to_string());

        let first = repo.ensure_session(Session::new(id.clone(), None, None)).await.expect("create");
        assert_eq!(first.user_id, None);

        let second = repo
            .ensure_session(Session::new(id.clone(), Some("U-1".to_string()), None))
            .await
            .expect("ensure existing");
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.user_id.as_deref(), Some("U-1"));

        let third = repo
            .ensure_session(Session::new(id.clone(), Some("U-2".to_string()), None))
            .await
            .expect("ensure again");
        assert_eq!(third.user_id.as_deref(), Some("U-1"));

        pool.close().await;
    }

    #[tokio::test]
    async fn messages_round_trip_in_timestamp_then_id_order() {
        let pool = setup_pool().await;
        let repo = SqlConversationRepository::new(pool.clone());
        let id = seed_session(&repo, "S-200").await;

        let base = parse_ts("2026-03-01T09:00:00Z");
        let mut late = text_message(&id, "late", base + Duration::seconds(5));
        late.id = MessageId("00-late".to_string());
        let mut tie_b = text_message(&id, "tie-b", base);
        tie_b.id = MessageId("02-b".to_string());
        let mut tie_a = text_message(&id, "tie-a", base);
        tie_a.id = MessageId("01-a".to_string());

        repo.append_messages(vec![late.clone(), tie_b.clone(), tie_a.clone()])
            .await
            .expect("append");

        let listed = repo.list_messages(&id).await.expect("list");
        assert_eq!(listed, vec![tie_a, tie_b, late]);
        assert_eq!(repo.count_messages(&id).await.expect("count"), 3);

        pool.close().await;
    }

    #[tokio::test]
    async fn append_to_unknown_session_is_rejected() {
        let pool = setup_pool().await;
        let repo = SqlConversationRepository::new(pool.clone());
        let orphan = text_message(&SessionId("S-missing".to_string()), "hello", Utc::now());

        let error = repo.append_messages(vec![orphan]).await.expect_err("foreign key");
        assert!(matches!(error, RepositoryError::Database(_)));

        pool.close().await;
    }

    #[tokio::test]
    async fn compaction_replaces_older_messages_atomically() {
        let pool = setup_pool().await;
        let repo = SqlConversationRepository::new(pool.clone());
        let id = seed_session(&repo, "S-300").await;

        let base = parse_ts("2026-03-01T09:00:00Z");
        let messages: Vec<Message> = (0..8)
            .map(|index| text_message(&id, &format!("m{index}"), base + Duration::seconds(index)))
            .collect();
        repo.append_messages(messages.clone()).await.expect("append");

        let outcome = repo.compact(&id, &KeepLast(3)).await.expect("compact").expect("planned");
        assert_eq!(outcome.deleted, 5);
        assert_eq!(outcome.remaining, 4);

        let listed = repo.list_messages(&id).await.expect("list");
        assert_eq!(listed.len(), 4);
        let summary = listed[0].summary().expect("summary first");
        assert_eq!(summary.summarized_count, 5);
        assert_eq!(summary.last_summarized_message_id, messages[4].id);
        assert_eq!(listed[1..].to_vec(), messages[5..].to_vec());

        let untouched = repo.compact(&id, &KeepLast(10)).await.expect("no-op compaction");
        assert_eq!(untouched, None);
        assert_eq!(repo.count_messages(&id).await.expect("count"), 4);

        pool.close().await;
    }

    #[tokio::test]
    async fn touch_unknown_session_reports_not_found() {
        let pool = setup_pool().await;
        let repo = SqlConversationRepository::new(pool.clone());

        let error = repo
            .touch_session(&SessionId("S-none".to_string()), Utc::now())
            .await
            .expect_err("missing session");
        assert!(matches!(error, RepositoryError::NotFound(_)));

        pool.close().await;
    }

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    async fn seed_session(repo: &SqlConversationRepository, id: &str) -> SessionId {
        let id = SessionId(id.to_string());
        repo.ensure_session(Session::new(id.clone(), Some("U-1".to_string()), None))
            .await
            .expect("seed session");
        id
    }

    fn text_message(session: &SessionId, text: &str, at: DateTime<Utc>) -> Message {
        let mut message = Message::new(session.clone(), MessageRole::User, MessagePayload::text(text));
        message.created_at = at;
        message
    }

    fn parse_ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("valid rfc3339").with_timezone(&Utc)
    }
}
