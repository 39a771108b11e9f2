use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use opsdesk_core::analytics::{AnalyticsEventType, AnalyticsSink, AnalyticsStatus};
use opsdesk_core::domain::conversation::{
    timestamp_now, Citation, ConversationSummary, Message, MessagePayload, MessageRole, Session,
    SessionId, Severity,
};
use opsdesk_core::domain::envelope::ToolResultEnvelope;
use opsdesk_core::domain::idempotency::ConflictPolicy;
use opsdesk_core::errors::DomainError;
use opsdesk_db::{ConversationRepository, IdempotencyStore, TraceRepository};

use crate::classifier::{
    ClassifiedIntent, IntentClassifier, DOCUMENTATION_RESULT_COUNT, SEARCH_DOCUMENTATION,
};
use crate::composer::{compose, Capabilities};
use crate::identity::{MemoizedServiceIdentity, ServiceIdentityResolver};
use crate::llm::LlmClient;
use crate::memory::{MemoryManager, MemoryPolicy};
use crate::tools::{
    inject_idempotency_key, IdempotentExecutor, Tool, ToolCatalog, ToolContext, ToolProvider,
    ToolRegistry,
};
use crate::trace::TraceRecorder;

pub const DOCUMENTATION_UNAVAILABLE: &str =
    "I was unable to search the documentation right now.";
pub const DOCUMENTATION_NOT_FOUND: &str =
    "I couldn't find any documentation that matches your question.";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TurnRequest {
    pub session_id: SessionId,
    pub message: String,
    pub idempotency_key: Option<String>,
    pub user_id: Option<String>,
    pub company_id: Option<String>,
}

impl TurnRequest {
    pub fn new(session_id: SessionId, message: impl Into<String>) -> Self {
        Self {
            session_id,
            message: message.into(),
            idempotency_key: None,
            user_id: None,
            company_id: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>, company_id: Option<String>) -> Self {
        self.user_id = Some(user_id.into());
        self.company_id = company_id;
        self
    }
}

/// One item of a turn's reply, as sent to the client.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseEvent {
    Text {
        content: String,
        timestamp: DateTime<Utc>,
    },
    ToolResult {
        tool: String,
        content: String,
        severity: Severity,
        #[serde(skip_serializing_if = "Option::is_none")]
        ui_hints: Option<Value>,
        timestamp: DateTime<Utc>,
    },
    DocCitations {
        content: String,
        citations: Vec<Citation>,
        timestamp: DateTime<Utc>,
    },
    TaskEvent {
        content: String,
        task_id: Option<String>,
        title: String,
        status: String,
        timestamp: DateTime<Utc>,
    },
    Summary {
        summary: ConversationSummary,
        timestamp: DateTime<Utc>,
    },
}

impl ResponseEvent {
    pub fn content(&self) -> &str {
        match self {
            Self::Text { content, .. }
            | Self::ToolResult { content, .. }
            | Self::DocCitations { content, .. }
            | Self::TaskEvent { content, .. } => content,
            Self::Summary { summary, .. } => &summary.summary_text,
        }
    }
}

impl From<&Message> for ResponseEvent {
    fn from(message: &Message) -> Self {
        let timestamp = message.created_at;
        match &message.payload {
            MessagePayload::Text { text } => Self::Text { content: text.clone(), timestamp },
            MessagePayload::ToolOutcome { tool, text, severity, ui_hints } => Self::ToolResult {
                tool: tool.clone(),
                content: text.clone(),
                severity: *severity,
                ui_hints: ui_hints.clone(),
                timestamp,
            },
            MessagePayload::DocCitations { text, citations } => Self::DocCitations {
                content: text.clone(),
                citations: citations.clone(),
                timestamp,
            },
            MessagePayload::TaskEvent { task_id, title, status } => Self::TaskEvent {
                content: format!("Task '{title}' {status}"),
                task_id: task_id.clone(),
                title: title.clone(),
                status: status.clone(),
                timestamp,
            },
            MessagePayload::Summary(summary) => {
                Self::Summary { summary: summary.clone(), timestamp }
            }
        }
    }
}

/// Which branch of the pipeline answered the turn.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnRoute {
    Tool { tool: String, replayed: bool },
    ToolFailed { tool: String },
    InvalidArguments { tool: String },
    Documentation,
    Llm,
    Capabilities,
}

impl TurnRoute {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tool { .. } => "tool",
            Self::ToolFailed { .. } => "tool_failed",
            Self::InvalidArguments { .. } => "invalid_arguments",
            Self::Documentation => "documentation",
            Self::Llm => "llm",
            Self::Capabilities => "capabilities",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TurnResponse {
    pub session_id: SessionId,
    pub events: Vec<ResponseEvent>,
    pub route: TurnRoute,
}

/// Collaborators the runtime is assembled from.
pub struct AgentComponents {
    pub conversations: Arc<dyn ConversationRepository>,
    pub traces: Arc<dyn TraceRepository>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub tools: Arc<dyn ToolProvider>,
    pub analytics: Arc<dyn AnalyticsSink>,
    pub identity: Arc<dyn ServiceIdentityResolver>,
    pub catalog: ToolCatalog,
    pub memory_policy: MemoryPolicy,
    pub conflict_policy: ConflictPolicy,
}

pub struct AgentRuntime {
    conversations: Arc<dyn ConversationRepository>,
    tools: Arc<dyn ToolProvider>,
    catalog: ToolCatalog,
    classifier: IntentClassifier,
    executor: IdempotentExecutor,
    recorder: TraceRecorder,
    memory: MemoryManager,
    identity: MemoizedServiceIdentity,
    llm: Option<Arc<dyn LlmClient>>,
}

impl AgentRuntime {
    pub fn new(components: AgentComponents) -> Self {
        let AgentComponents {
            conversations,
            traces,
            idempotency,
            tools,
            analytics,
            identity,
            catalog,
            memory_policy,
            conflict_policy,
        } = components;

        Self {
            memory: MemoryManager::new(conversations.clone(), memory_policy),
            conversations,
            tools,
            catalog,
            classifier: IntentClassifier::new(),
            executor: IdempotentExecutor::new(idempotency, conflict_policy),
            recorder: TraceRecorder::new(traces, analytics),
            identity: MemoizedServiceIdentity::new(identity),
            llm: None,
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    pub fn conversations(&self) -> &Arc<dyn ConversationRepository> {
        &self.conversations
    }

    /// Handles one user message. Always answers with at least one event;
    /// failures along the way degrade into fallback text instead of errors.
    pub async fn handle_message(&self, request: TurnRequest) -> TurnResponse {
        let started = Instant::now();
        let session_id = request.session_id.clone();
        let user_message = Message::new(
            session_id.clone(),
            MessageRole::User,
            MessagePayload::text(request.message.clone()),
        );

        let session = match self
            .conversations
            .ensure_session(Session::new(
                session_id.clone(),
                request.user_id.clone(),
                request.company_id.clone(),
            ))
            .await
        {
            Ok(session) => Some(session),
            Err(error) => {
                warn!(
                    event_name = "agent.session.ensure_failed",
                    session_id = %session_id.0,
                    error = %error,
                    "failed to load session; continuing without stored owner"
                );
                None
            }
        };

        let idempotency_key = request
            .idempotency_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let context = ToolContext {
            session_id: session_id.clone(),
            user_id: request
                .user_id
                .clone()
                .or_else(|| session.as_ref().and_then(|session| session.user_id.clone())),
            company_id: request
                .company_id
                .clone()
                .or_else(|| session.as_ref().and_then(|session| session.company_id.clone())),
            idempotency_key,
        };
        let registry = self.tools.registry_for(&context);

        let (mut payloads, route) = self.route(&request.message, &context, &registry).await;
        if payloads.is_empty() {
            payloads.push(self.capability_message(&registry));
        }

        let replies: Vec<Message> = payloads
            .into_iter()
            .map(|payload| Message::new(session_id.clone(), MessageRole::Assistant, payload))
            .collect();
        let events: Vec<ResponseEvent> = replies.iter().map(ResponseEvent::from).collect();

        self.record(&session_id, user_message, replies).await;

        info!(
            event_name = "agent.turn.completed",
            session_id = %session_id.0,
            correlation_id = %context.idempotency_key,
            route = route.as_str(),
            event_count = events.len(),
            latency_ms = started.elapsed().as_millis() as u64,
            "turn completed"
        );

        TurnResponse { session_id, events, route }
    }

    async fn route(
        &self,
        text: &str,
        context: &ToolContext,
        registry: &ToolRegistry,
    ) -> (Vec<MessagePayload>, TurnRoute) {
        let intent = self.classifier.classify(text);
        if let Some(intent) = &intent {
            if let Some(tool) = registry.get(&intent.tool) {
                let capabilities = capabilities_of(registry);
                return self.dispatch(text, context, intent, tool, &capabilities).await;
            }
        }

        self.recorder.routing_miss(&context.session_id, intent.as_ref().map(|i| i.tool.as_str()));

        if let Some(payload) = self.documentation_fallback(text, context, registry).await {
            return (vec![payload], TurnRoute::Documentation);
        }
        if let Some(payload) = self.llm_fallback(text, context).await {
            return (vec![payload], TurnRoute::Llm);
        }
        (vec![self.capability_message(registry)], TurnRoute::Capabilities)
    }

    async fn dispatch(
        &self,
        text: &str,
        context: &ToolContext,
        intent: &ClassifiedIntent,
        tool: Arc<dyn Tool>,
        capabilities: &Capabilities,
    ) -> (Vec<MessagePayload>, TurnRoute) {
        let name = intent.tool.clone();
        let args = if self.catalog.is_side_effecting(&name) {
            inject_idempotency_key(intent.args.clone(), &context.idempotency_key)
        } else {
            intent.args.clone()
        };

        if let Err(error) = self.catalog.validate(&name, &args) {
            let violation = match error {
                DomainError::InvalidToolArguments { violation, .. } => violation,
                other => other.to_string(),
            };
            self.recorder
                .record_validation_failure(&context.session_id, &name, &args, &violation)
                .await;
            let payload = MessagePayload::ToolOutcome {
                tool: name.clone(),
                text: format!("Invalid arguments for tool {name}: {violation}"),
                severity: Severity::Error,
                ui_hints: None,
            };
            return (vec![payload], TurnRoute::InvalidArguments { tool: name });
        }

        let mut trace = self.recorder.start(&context.session_id, &name, &args).await;
        match self.executor.execute(tool.as_ref(), args).await {
            Ok(outcome) => {
                self.recorder.finish_success(&mut trace, &outcome.response).await;
                let payload = self.normalize(text, &name, &outcome.response, capabilities);
                (vec![payload], TurnRoute::Tool { tool: name, replayed: outcome.replayed })
            }
            Err(error) => {
                let message = format!("{error:#}");
                self.recorder.finish_failure(&mut trace, &message).await;
                warn!(
                    event_name = "agent.tool.failed",
                    session_id = %context.session_id.0,
                    tool = %name,
                    trace_id = %trace.trace_id.0,
                    error = %message,
                    "tool execution failed"
                );
                let payload = MessagePayload::ToolOutcome {
                    tool: name.clone(),
                    text: format!("Failed to {}: {message}", self.catalog.action_for(&name)),
                    severity: Severity::Error,
                    ui_hints: None,
                };
                (vec![payload], TurnRoute::ToolFailed { tool: name })
            }
        }
    }

    fn normalize(
        &self,
        text: &str,
        tool: &str,
        response: &Value,
        capabilities: &Capabilities,
    ) -> MessagePayload {
        if let Some(envelope) = ToolResultEnvelope::from_tool_result(response) {
            let composed = compose(text, tool, &envelope, capabilities);
            return MessagePayload::ToolOutcome {
                tool: tool.to_string(),
                text: composed.text,
                severity: composed.severity,
                ui_hints: composed.ui_hints,
            };
        }

        if tool == SEARCH_DOCUMENTATION {
            let citations = citations_from(response);
            if citations.is_empty() {
                return MessagePayload::text(DOCUMENTATION_NOT_FOUND);
            }
            return citations_payload(citations);
        }

        if let Some(task) = task_from(tool, response, text) {
            return task;
        }

        let message = response
            .get("message")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|message| !message.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("Completed: {}.", self.catalog.action_for(tool)));
        MessagePayload::ToolOutcome {
            tool: tool.to_string(),
            text: message,
            severity: Severity::Info,
            ui_hints: None,
        }
    }

    async fn documentation_fallback(
        &self,
        text: &str,
        context: &ToolContext,
        registry: &ToolRegistry,
    ) -> Option<MessagePayload> {
        let tool = registry.get(SEARCH_DOCUMENTATION)?;
        let query = text.trim();
        if query.is_empty() {
            return None;
        }
        let args = json!({ "query": query, "k": DOCUMENTATION_RESULT_COUNT });

        let mut trace = self.recorder.start(&context.session_id, SEARCH_DOCUMENTATION, &args).await;
        match tool.execute(args).await {
            Ok(response) => {
                self.recorder.finish_success(&mut trace, &response).await;
                let citations = citations_from(&response);
                let status = if citations.is_empty() {
                    AnalyticsStatus::Miss
                } else {
                    AnalyticsStatus::Success
                };
                self.recorder.fallback(&context.session_id, AnalyticsEventType::DocsFallback, status);
                (!citations.is_empty()).then(|| citations_payload(citations))
            }
            Err(error) => {
                let message = format!("{error:#}");
                self.recorder.finish_failure(&mut trace, &message).await;
                self.recorder.fallback(
                    &context.session_id,
                    AnalyticsEventType::DocsFallback,
                    AnalyticsStatus::Failure,
                );
                warn!(
                    event_name = "agent.docs_fallback.failed",
                    session_id = %context.session_id.0,
                    error = %message,
                    "documentation fallback failed"
                );
                Some(MessagePayload::text(DOCUMENTATION_UNAVAILABLE))
            }
        }
    }

    async fn llm_fallback(&self, text: &str, context: &ToolContext) -> Option<MessagePayload> {
        let llm = self.llm.as_ref()?;
        if text.trim().is_empty() {
            return None;
        }

        let user_id = match &context.user_id {
            Some(user_id) => Some(user_id.clone()),
            None => match self.identity.get().await {
                Ok(identity) => Some(identity.user_id.clone()),
                Err(error) => {
                    warn!(
                        event_name = "agent.identity.unresolved",
                        session_id = %context.session_id.0,
                        error = %error,
                        "service identity unavailable; calling llm without user"
                    );
                    None
                }
            },
        };

        match llm.send_message(text, user_id.as_deref()).await {
            Ok(reply) if !reply.trim().is_empty() => {
                self.recorder.fallback(
                    &context.session_id,
                    AnalyticsEventType::LlmFallback,
                    AnalyticsStatus::Success,
                );
                Some(MessagePayload::text(reply.trim()))
            }
            Ok(_) => {
                self.recorder.fallback(
                    &context.session_id,
                    AnalyticsEventType::LlmFallback,
                    AnalyticsStatus::Miss,
                );
                None
            }
            Err(error) => {
                warn!(
                    event_name = "agent.llm_fallback.failed",
                    session_id = %context.session_id.0,
                    error = %error,
                    "llm fallback failed"
                );
                self.recorder.fallback(
                    &context.session_id,
                    AnalyticsEventType::LlmFallback,
                    AnalyticsStatus::Failure,
                );
                None
            }
        }
    }

    fn capability_message(&self, registry: &ToolRegistry) -> MessagePayload {
        let actions: Vec<String> =
            registry.names().iter().map(|name| self.catalog.action_for(name)).collect();
        let text = if actions.is_empty() {
            "I couldn't match that to anything I can do right now. Try asking about sales orders, purchase orders, quotes, vendor calls, pickups or reminders.".to_string()
        } else {
            format!(
                "I couldn't match that to an available action. I can {}.",
                actions.join("; ")
            )
        };
        MessagePayload::text(text)
    }

    async fn record(&self, session_id: &SessionId, user_message: Message, replies: Vec<Message>) {
        let mut batch = Vec::with_capacity(replies.len() + 1);
        batch.push(user_message);
        batch.extend(replies);

        if let Err(error) = self.conversations.append_messages(batch).await {
            warn!(
                event_name = "agent.turn.record_failed",
                session_id = %session_id.0,
                error = %error,
                "failed to persist turn messages"
            );
            return;
        }
        if let Err(error) = self.conversations.touch_session(session_id, timestamp_now()).await {
            warn!(
                event_name = "agent.session.touch_failed",
                session_id = %session_id.0,
                error = %error,
                "failed to update session activity"
            );
        }
        self.memory.spawn_compaction(session_id.clone());
    }
}

/// Create offers in empty lookups follow the create tools actually available.
fn capabilities_of(registry: &ToolRegistry) -> Capabilities {
    Capabilities {
        can_create_vendor: registry.contains("create_vendor"),
        can_create_customer: registry.contains("create_customer"),
        can_create_part: registry.contains("create_part"),
    }
}

fn citations_from(response: &Value) -> Vec<Citation> {
    response
        .get("citations")
        .and_then(Value::as_array)
        .map(|citations| {
            citations
                .iter()
                .filter_map(|citation| serde_json::from_value::<Citation>(citation.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

fn citations_payload(citations: Vec<Citation>) -> MessagePayload {
    let mut lines = vec!["Here is what I found in the documentation:".to_string()];
    lines.extend(
        citations
            .iter()
            .enumerate()
            .map(|(index, citation)| format!("{}. {} ({})", index + 1, citation.title, citation.path)),
    );
    MessagePayload::DocCitations { text: lines.join("\n"), citations }
}

fn task_from(tool: &str, response: &Value, text: &str) -> Option<MessagePayload> {
    let task = response.get("task").filter(|task| task.is_object()).unwrap_or(response);
    let task_id = task
        .get("task_id")
        .or_else(|| task.get("id"))
        .and_then(|id| match id {
            Value::String(id) => Some(id.clone()),
            Value::Number(id) => Some(id.to_string()),
            _ => None,
        });
    if tool != "create_task" && response.get("task").is_none() && response.get("task_id").is_none() {
        return None;
    }

    let title = task
        .get("title")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| text.trim().to_string());
    let status = task
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or("created")
        .to_string();
    Some(MessagePayload::TaskEvent { task_id, title, status })
}
