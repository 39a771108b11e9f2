use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::conversation::{timestamp_now, SessionId};
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceId(pub String);

impl TraceId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Pending,
    Success,
    Failure,
}

impl TraceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocationTrace {
    pub trace_id: TraceId,
    pub session_id: SessionId,
    pub tool: String,
    pub status: TraceStatus,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ToolInvocationTrace {
    pub fn open(session_id: SessionId, tool: impl Into<String>, input: Value) -> Self {
        Self {
            trace_id: TraceId::generate(),
            session_id,
            tool: tool.into(),
            status: TraceStatus::Pending,
            input,
            output: None,
            error: None,
            started_at: timestamp_now(),
            finished_at: None,
        }
    }

    pub fn succeed(&mut self, output: Value) -> Result<(), DomainError> {
        self.ensure_pending()?;
        self.status = TraceStatus::Success;
        self.output = Some(output);
        self.finished_at = Some(timestamp_now());
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), DomainError> {
        self.ensure_pending()?;
        self.status = TraceStatus::Failure;
        self.error = Some(error.into());
        self.finished_at = Some(timestamp_now());
        Ok(())
    }

    pub fn latency_ms(&self) -> Option<i64> {
        self.finished_at.map(|finished| (finished - self.started_at).num_milliseconds())
    }

    fn ensure_pending(&self) -> Result<(), DomainError> {
        if self.status == TraceStatus::Pending {
            return Ok(());
        }
        Err(DomainError::InvariantViolation(format!(
            "trace {} already finalized as {}",
            self.trace_id.0,
            self.status.as_str()
        )))
    }
}
