use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::conversation::SessionId;
use crate::domain::trace::TraceId;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyticsEventType {
    ToolStarted,
    ToolFinished,
    ToolValidationFailed,
    RoutingMiss,
    DocsFallback,
    LlmFallback,
}

impl AnalyticsEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToolStarted => "tool_started",
            Self::ToolFinished => "tool_finished",
            Self::ToolValidationFailed => "tool_validation_failed",
            Self::RoutingMiss => "routing_miss",
            Self::DocsFallback => "docs_fallback",
            Self::LlmFallback => "llm_fallback",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyticsStatus {
    Success,
    Failure,
    Miss,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyticsEvent {
    pub source: String,
    pub session_id: SessionId,
    pub tool: Option<String>,
    pub event_type: AnalyticsEventType,
    pub status: Option<AnalyticsStatus>,
    pub error_code: Option<String>,
    pub trace_id: Option<TraceId>,
    pub latency_ms: Option<i64>,
    pub metadata: BTreeMap<String, String>,
    pub occurred_at: DateTime<Utc>,
}

impl AnalyticsEvent {
    pub fn new(
        source: impl Into<String>,
        session_id: SessionId,
        event_type: AnalyticsEventType,
    ) -> Self {
        Self {
            source: source.into(),
            session_id,
            tool: None,
            event_type,
            status: None,
            error_code: None,
            trace_id: None,
            latency_ms: None,
            metadata: BTreeMap::new(),
            occurred_at: Utc::now(),
        }
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    pub fn with_status(mut self, status: AnalyticsStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_error_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    pub fn with_trace(mut self, trace_id: TraceId) -> Self {
        self.trace_id = Some(trace_id);
        self
    }

    pub fn with_latency_ms(mut self, latency_ms: Option<i64>) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

pub trait AnalyticsSink: Send + Sync {
    fn emit(&self, event: AnalyticsEvent);
}

#[derive(Clone, Default)]
pub struct InMemoryAnalyticsSink {
    events: Arc<Mutex<Vec<AnalyticsEvent>>>,
}

impl InMemoryAnalyticsSink {
    pub fn events(&self) -> Vec<AnalyticsEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn count_of(&self, event_type: &AnalyticsEventType) -> usize {
        self.events().iter().filter(|event| &event.event_type == event_type).count()
    }
}

impl AnalyticsSink for InMemoryAnalyticsSink {
    fn emit(&self, event: AnalyticsEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

/// Drops every event. Used when no sink is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopAnalyticsSink;

impl AnalyticsSink for NoopAnalyticsSink {
    fn emit(&self, _event: AnalyticsEvent) {}
}

#[cfg(test)]
mod tests {
    use crate::analytics::{
        AnalyticsEvent, AnalyticsEventType, AnalyticsSink, AnalyticsStatus, InMemoryAnalyticsSink,
    };
    use crate::domain::conversation::SessionId;
    use crate::domain::trace::TraceId;

    #[test]
    fn in_memory_sink_records_events_with_correlation_fields() {
        let sink = InMemoryAnalyticsSink::default();
        sink.emit(
            AnalyticsEvent::new(
                "orchestrator",
                SessionId("S-2026-0042".to_owned()),
                AnalyticsEventType::ToolFinished,
            )
            .with_tool("create_sales_order")
            .with_status(AnalyticsStatus::Success)
            .with_trace(TraceId("trace-1".to_owned()))
            .with_latency_ms(Some(12))
            .with_metadata("classified", "true"),
        );

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].session_id.0, "S-2026-0042");
        assert_eq!(events[0].tool.as_deref(), Some("create_sales_order"));
        assert_eq!(events[0].latency_ms, Some(12));
        assert!(events[0].metadata.contains_key("classified"));
        assert_eq!(sink.count_of(&AnalyticsEventType::ToolFinished), 1);
    }
}
