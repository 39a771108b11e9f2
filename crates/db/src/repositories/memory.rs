use std::collections::hash_map::Entry;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;

use opsdesk_core::domain::conversation::{sort_messages, Message, Session, SessionId};
use opsdesk_core::domain::idempotency::{
    ConflictPolicy, IdempotencyKey, IdempotencyRecord, IdempotencyScope,
};
use opsdesk_core::domain::trace::{ToolInvocationTrace, TraceId, TraceStatus};

use super::{
    CompactionOutcome, CompactionPlanner, ConversationRepository, IdempotencyStore,
    RepositoryError, TraceRepository,
};

#[derive(Default)]
struct ConversationState {
    sessions: HashMap<String, Session>,
    messages: HashMap<String, Vec<Message>>,
}

/// Sessions and messages behind one lock so compaction stays atomic.
#[derive(Default)]
pub struct InMemoryConversationRepository {
    state: RwLock<ConversationState>,
}

#[async_trait::async_trait]
impl ConversationRepository for InMemoryConversationRepository {
    async fn ensure_session(&self, session: Session) -> Result<Session, RepositoryError> {
        let mut state = self.state.write().await;
        let stored = state.sessions.entry(session.id.0.clone()).or_insert_with(|| session.clone());
        if stored.user_id.is_none() {
            stored.user_id = session.user_id;
        }
        if stored.company_id.is_none() {
            stored.company_id = session.company_id;
        }
        Ok(stored.clone())
    }

    async fn find_session(&self, id: &SessionId) -> Result<Option<Session>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state.sessions.get(&id.0).cloned())
    }

    async fn touch_session(
        &self,
        id: &SessionId,
        at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        touch(&mut state, id, at)
    }

    async fn append_messages(&self, messages: Vec<Message>) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        if let Some(orphan) =
            messages.iter().find(|message| !state.sessions.contains_key(&message.session_id.0))
        {
            return Err(RepositoryError::NotFound(format!("session `{}`", orphan.session_id.0)));
        }

        let duplicate = messages.iter().find(|message| {
            state.messages.get(&message.session_id.0).is_some_and(|log| {
                log.iter().any(|existing| existing.id == message.id)
            })
        });
        if let Some(duplicate) = duplicate {
            return Err(RepositoryError::Conflict(format!("message `{}`", duplicate.id.0)));
        }

        for message in messages {
            let log = state.messages.entry(message.session_id.0.clone()).or_default();
            log.push(message);
            sort_messages(log);
        }
        Ok(())
    }

    async fn list_messages(&self, id: &SessionId) -> Result<Vec<Message>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state.messages.get(&id.0).cloned().unwrap_or_default())
    }

    async fn count_messages(&self, id: &SessionId) -> Result<usize, RepositoryError> {
        let state = self.state.read().await;
        Ok(state.messages.get(&id.0).map(Vec::len).unwrap_or(0))
    }

    async fn compact(
        &self,
        id: &SessionId,
        planner: &dyn CompactionPlanner,
    ) -> Result<Option<CompactionOutcome>, RepositoryError> {
        let mut state = self.state.write().await;
        let snapshot = state.messages.get(&id.0).cloned().unwrap_or_default();
        let Some(plan) = planner.plan(&snapshot) else {
            return Ok(None);
        };

        let mut retained: Vec<Message> =
            snapshot.into_iter().filter(|message| !plan.delete_ids.contains(&message.id)).collect();
        let deleted = state.messages.get(&id.0).map(Vec::len).unwrap_or(0) - retained.len();
        if deleted != plan.delete_ids.len() {
            return Err(RepositoryError::Conflict(format!(
                "compaction of session `{}` expected to delete {} messages but matched {deleted}",
                id.0,
                plan.delete_ids.len()
            )));
        }

        touch(&mut state, id, Utc::now())?;
        let summary_id = plan.summary_message.id.clone();
        retained.push(plan.summary_message);
        sort_messages(&mut retained);
        let remaining = retained.len();
        state.messages.insert(id.0.clone(), retained);

        Ok(Some(CompactionOutcome { deleted, summary_id, remaining }))
    }
}

fn touch(
    state: &mut ConversationState,
    id: &SessionId,
    at: DateTime<Utc>,
) -> Result<(), RepositoryError> {
    let session = state
        .sessions
        .get_mut(&id.0)
        .ok_or_else(|| RepositoryError::NotFound(format!("session `{}`", id.0)))?;
    session.last_activity_at = session.last_activity_at.max(at);
    Ok(())
}

#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    records: RwLock<HashMap<(String, String), IdempotencyRecord>>,
    policy: ConflictPolicy,
}

impl InMemoryIdempotencyStore {
    pub fn with_policy(policy: ConflictPolicy) -> Self {
        Self { records: RwLock::default(), policy }
    }
}

#[async_trait::async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn get(
        &self,
        scope: &IdempotencyScope,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, RepositoryError> {
        let records = self.records.read().await;
        Ok(records.get(&(scope.0.clone(), key.0.clone())).cloned())
    }

    async fn put(
        &self,
        scope: &IdempotencyScope,
        key: &IdempotencyKey,
        request_hash: &str,
        response: &Value,
    ) -> Result<IdempotencyRecord, RepositoryError> {
        let mut records = self.records.write().await;
        let now = Utc::now();
        let entry = records.entry((scope.0.clone(), key.0.clone()));

        let record = match entry {
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                if record.request_hash != request_hash && self.policy == ConflictPolicy::Reject {
                    return Err(RepositoryError::Conflict(format!(
                        "idempotency key `{}` in scope `{}` was already used for a different request",
                        key.0, scope.0
                    )));
                }
                record.request_hash = request_hash.to_string();
                record.response = response.clone();
                record.updated_at = now;
                record.clone()
            }
            Entry::Vacant(vacant) => vacant
                .insert(IdempotencyRecord {
                    scope: scope.clone(),
                    key: key.clone(),
                    request_hash: request_hash.to_string(),
                    response: response.clone(),
                    created_at: now,
                    updated_at: now,
                })
                .clone(),
        };

        Ok(record)
    }
}

#[derive(Default)]
pub struct InMemoryTraceRepository {
    traces: RwLock<Vec<ToolInvocationTrace>>,
}

impl InMemoryTraceRepository {
    pub async fn all(&self) -> Vec<ToolInvocationTrace> {
        self.traces.read().await.clone()
    }
}

#[async_trait::async_trait]
impl TraceRepository for InMemoryTraceRepository {
    async fn open(&self, trace: &ToolInvocationTrace) -> Result<(), RepositoryError> {
        let mut traces = self.traces.write().await;
        if traces.iter().any(|stored| stored.trace_id == trace.trace_id) {
            return Err(RepositoryError::Conflict(format!("trace `{}`", trace.trace_id.0)));
        }
        let mut pending = trace.clone();
        pending.status = TraceStatus::Pending;
        pending.output = None;
        pending.error = None;
        pending.finished_at = None;
        traces.push(pending);
        Ok(())
    }

    async fn finalize(&self, trace: &ToolInvocationTrace) -> Result<(), RepositoryError> {
        if trace.status == TraceStatus::Pending {
            return Err(RepositoryError::Conflict(format!(
                "trace `{}` cannot be finalized while still pending",
                trace.trace_id.0
            )));
        }

        let mut traces = self.traces.write().await;
        let stored = traces
            .iter_mut()
            .find(|stored| stored.trace_id == trace.trace_id)
            .ok_or_else(|| RepositoryError::NotFound(format!("trace `{}`", trace.trace_id.0)))?;
        if stored.status != TraceStatus::Pending {
            return Err(RepositoryError::Conflict(format!(
                "trace `{}` was already finalized as {}",
                stored.trace_id.0,
                stored.status.as_str()
            )));
        }
        *stored = trace.clone();
        Ok(())
    }

    async fn find(&self, id: &TraceId) -> Result<Option<ToolInvocationTrace>, RepositoryError> {
        let traces = self.traces.read().await;
        Ok(traces.iter().find(|trace| &trace.trace_id == id).cloned())
    }

    async fn list_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<ToolInvocationTrace>, RepositoryError> {
        let traces = self.traces.read().await;
        Ok(traces.iter().filter(|trace| &trace.session_id == session_id).cloned().collect())
    }
}
