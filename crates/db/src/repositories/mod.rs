use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use thiserror::Error;

use opsdesk_core::domain::conversation::{Message, MessageId, Session, SessionId};
use opsdesk_core::domain::idempotency::{IdempotencyKey, IdempotencyRecord, IdempotencyScope};
use opsdesk_core::domain::trace::{ToolInvocationTrace, TraceId};

pub mod conversation;
pub mod idempotency;
pub mod memory;
pub mod trace;

pub use conversation::SqlConversationRepository;
pub use idempotency::SqlIdempotencyStore;
pub use memory::{InMemoryConversationRepository, InMemoryIdempotencyStore, InMemoryTraceRepository};
pub use trace::SqlTraceRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
}

/// Decides what a compaction pass replaces, given the full ordered history.
///
/// Returning `None` leaves the session untouched.
pub trait CompactionPlanner: Send + Sync {
    fn plan(&self, messages: &[Message]) -> Option<CompactionPlan>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompactionPlan {
    pub delete_ids: Vec<MessageId>,
    pub summary_message: Message,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompactionOutcome {
    pub deleted: usize,
    pub summary_id: MessageId,
    pub remaining: usize,
}

#[async_trait]
pub trait ConversationRepository: Send + Sync {
    /// Creates the session if absent and returns the stored row. Missing owner
    /// fields on an existing session are filled in, present ones are kept.
    async fn ensure_session(&self, session: Session) -> Result<Session, RepositoryError>;

    async fn find_session(&self, id: &SessionId) -> Result<Option<Session>, RepositoryError>;

    async fn touch_session(
        &self,
        id: &SessionId,
        at: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    async fn append_messages(&self, messages: Vec<Message>) -> Result<(), RepositoryError>;

    /// All messages of a session in `(created_at, id)` order.
    async fn list_messages(&self, id: &SessionId) -> Result<Vec<Message>, RepositoryError>;

    async fn count_messages(&self, id: &SessionId) -> Result<usize, RepositoryError>;

    /// Runs one atomic compaction pass: snapshot, plan, delete, insert the
    /// summary and touch the session. Nothing is written when the planner
    /// declines or any step fails.
    async fn compact(
        &self,
        id: &SessionId,
        planner: &dyn CompactionPlanner,
    ) -> Result<Option<CompactionOutcome>, RepositoryError>;
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn get(
        &self,
        scope: &IdempotencyScope,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, RepositoryError>;

    /// Stores a response under `(scope, key)` and returns the record now held.
    /// Under the reject policy a differing `request_hash` yields `Conflict`.
    async fn put(
        &self,
        scope: &IdempotencyScope,
        key: &IdempotencyKey,
        request_hash: &str,
        response: &Value,
    ) -> Result<IdempotencyRecord, RepositoryError>;
}

#[async_trait]
pub trait TraceRepository: Send + Sync {
    async fn open(&self, trace: &ToolInvocationTrace) -> Result<(), RepositoryError>;

    /// Persists a finalized trace. Fails with `Conflict` when the stored row is
    /// no longer pending and with `NotFound` when it was never opened.
    async fn finalize(&self, trace: &ToolInvocationTrace) -> Result<(), RepositoryError>;

    async fn find(&self, id: &TraceId) -> Result<Option<ToolInvocationTrace>, RepositoryError>;

    async fn list_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<ToolInvocationTrace>, RepositoryError>;
}

/// Fixed-width encoding so lexical and chronological order agree in SQL.
pub(crate) fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}

pub(crate) fn parse_json(column: &str, value: &str) -> Result<Value, RepositoryError> {
    serde_json::from_str(value)
        .map_err(|error| RepositoryError::Decode(format!("invalid json in `{column}`: {error}")))
}
