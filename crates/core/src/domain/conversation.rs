use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    /// Time-ordered id so that messages sharing a timestamp keep insertion order.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}

/// Current time truncated to microseconds, the precision persisted by storage.
pub fn timestamp_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub user_id: Option<String>,
    pub company_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: SessionId, user_id: Option<String>, company_id: Option<String>) -> Self {
        let now = timestamp_now();
        Self { id, user_id, company_id, created_at: now, last_activity_at: now }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub title: String,
    pub path: String,
    #[serde(default)]
    pub score: f64,
}

/// Derived compaction summary. Never authoritative: the message log is.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub summary_text: String,
    pub highlights: Vec<String>,
    pub resolution: Option<String>,
    pub last_summarized_message_id: MessageId,
    pub summarized_count: usize,
}

impl ConversationSummary {
    pub fn is_stale(&self, newest_message_id: &MessageId) -> bool {
        &self.last_summarized_message_id != newest_message_id
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessagePayload {
    Text {
        text: String,
    },
    TaskEvent {
        task_id: Option<String>,
        title: String,
        status: String,
    },
    DocCitations {
        text: String,
        citations: Vec<Citation>,
    },
    ToolOutcome {
        tool: String,
        text: String,
        severity: Severity,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ui_hints: Option<Value>,
    },
    Summary(ConversationSummary),
}

impl MessagePayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::TaskEvent { .. } => "task_event",
            Self::DocCitations { .. } => "doc_citations",
            Self::ToolOutcome { .. } => "tool_outcome",
            Self::Summary(_) => "summary",
        }
    }

    /// The user-readable text carried by the payload, if any.
    pub fn display_text(&self) -> Option<&str> {
        match self {
            Self::Text { text }
            | Self::DocCitations { text, .. }
            | Self::ToolOutcome { text, .. } => Some(text.as_str()),
            Self::TaskEvent { title, .. } => Some(title.as_str()),
            Self::Summary(summary) => Some(summary.summary_text.as_str()),
        }
    }

    /// Decodes a stored body by its discriminant instead of probing its shape.
    pub fn decode(kind: &str, body: &str) -> Result<Self, String> {
        let value: Value = serde_json::from_str(body)
            .map_err(|error| format!("payload body is not valid json: {error}"))?;
        let decoded = match kind {
            "text" => serde_json::from_value::<TextBody>(value).map(|body| Self::Text {
                text: body.text,
            }),
            "task_event" => serde_json::from_value::<TaskEventBody>(value).map(|body| {
                Self::TaskEvent { task_id: body.task_id, title: body.title, status: body.status }
            }),
            "doc_citations" => serde_json::from_value::<DocCitationsBody>(value)
                .map(|body| Self::DocCitations { text: body.text, citations: body.citations }),
            "tool_outcome" => serde_json::from_value::<ToolOutcomeBody>(value).map(|body| {
                Self::ToolOutcome {
                    tool: body.tool,
                    text: body.text,
                    severity: body.severity,
                    ui_hints: body.ui_hints,
                }
            }),
            "summary" => serde_json::from_value::<ConversationSummary>(value).map(Self::Summary),
            other => return Err(format!("unknown message payload kind `{other}`")),
        };
        decoded.map_err(|error| format!("invalid `{kind}` payload: {error}"))
    }

    /// Encodes the payload body without its discriminant.
    pub fn encode_body(&self) -> String {
        let body = match self {
            Self::Text { text } => serde_json::json!({ "text": text }),
            Self::TaskEvent { task_id, title, status } => {
                serde_json::json!({ "task_id": task_id, "title": title, "status": status })
            }
            Self::DocCitations { text, citations } => {
                serde_json::json!({ "text": text, "citations": citations })
            }
            Self::ToolOutcome { tool, text, severity, ui_hints } => serde_json::json!({
                "tool": tool,
                "text": text,
                "severity": severity,
                "ui_hints": ui_hints,
            }),
            Self::Summary(summary) => serde_json::to_value(summary).unwrap_or(Value::Null),
        };
        body.to_string()
    }
}

#[derive(Deserialize)]
struct TextBody {
    text: String,
}

#[derive(Deserialize)]
struct TaskEventBody {
    task_id: Option<String>,
    title: String,
    status: String,
}

#[derive(Deserialize)]
struct DocCitationsBody {
    text: String,
    #[serde(default)]
    citations: Vec<Citation>,
}

#[derive(Deserialize)]
struct ToolOutcomeBody {
    tool: String,
    text: String,
    severity: Severity,
    #[serde(default)]
    ui_hints: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub session_id: SessionId,
    pub role: MessageRole,
    pub payload: MessagePayload,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(session_id: SessionId, role: MessageRole, payload: MessagePayload) -> Self {
        Self { id: MessageId::generate(), session_id, role, payload, created_at: timestamp_now() }
    }

    /// Sort key for the authoritative `(created_at, id)` ordering.
    pub fn ordering_key(&self) -> (DateTime<Utc>, &str) {
        (self.created_at, self.id.0.as_str())
    }

    pub fn summary(&self) -> Option<&ConversationSummary> {
        match &self.payload {
            MessagePayload::Summary(summary) => Some(summary),
            _ => None,
        }
    }
}

pub fn sort_messages(messages: &mut [Message]) {
    messages.sort_by(|left, right| left.ordering_key().cmp(&right.ordering_key()));
}
