use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use opsdesk_core::analytics::{AnalyticsEvent, AnalyticsEventType, AnalyticsSink, AnalyticsStatus};
use opsdesk_core::domain::conversation::SessionId;
use opsdesk_core::domain::trace::ToolInvocationTrace;
use opsdesk_db::TraceRepository;

pub const ORCHESTRATOR_SOURCE: &str = "orchestrator";

/// Persists tool invocation traces and emits the matching analytics events.
///
/// Recording never fails a turn: storage errors are logged and dropped.
#[derive(Clone)]
pub struct TraceRecorder {
    repo: Arc<dyn TraceRepository>,
    analytics: Arc<dyn AnalyticsSink>,
    source: String,
}

impl TraceRecorder {
    pub fn new(repo: Arc<dyn TraceRepository>, analytics: Arc<dyn AnalyticsSink>) -> Self {
        Self { repo, analytics, source: ORCHESTRATOR_SOURCE.to_string() }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub async fn start(&self, session_id: &SessionId, tool: &str, input: &Value) -> ToolInvocationTrace {
        let trace = self.open(session_id, tool, input).await;
        self.analytics.emit(
            AnalyticsEvent::new(&self.source, session_id.clone(), AnalyticsEventType::ToolStarted)
                .with_tool(tool)
                .with_trace(trace.trace_id.clone()),
        );
        trace
    }

    async fn open(&self, session_id: &SessionId, tool: &str, input: &Value) -> ToolInvocationTrace {
        let trace = ToolInvocationTrace::open(session_id.clone(), tool, input.clone());
        if let Err(error) = self.repo.open(&trace).await {
            warn!(
                event_name = "agent.trace.open_failed",
                session_id = %session_id.0,
                tool,
                trace_id = %trace.trace_id.0,
                error = %error,
                "failed to persist tool trace"
            );
        }
        trace
    }

    pub async fn finish_success(&self, trace: &mut ToolInvocationTrace, output: &Value) {
        if let Err(error) = trace.succeed(output.clone()) {
            warn!(trace_id = %trace.trace_id.0, error = %error, "trace already finalized");
            return;
        }
        self.finalize(trace, AnalyticsStatus::Success, None).await;
    }

    pub async fn finish_failure(&self, trace: &mut ToolInvocationTrace, error_message: &str) {
        if let Err(error) = trace.fail(error_message) {
            warn!(trace_id = %trace.trace_id.0, error = %error, "trace already finalized");
            return;
        }
        self.finalize(trace, AnalyticsStatus::Failure, Some("tool_error")).await;
    }

    /// Records a call that was refused before execution. No `ToolStarted`
    /// is emitted since the tool never ran.
    pub async fn record_validation_failure(
        &self,
        session_id: &SessionId,
        tool: &str,
        input: &Value,
        violation: &str,
    ) -> ToolInvocationTrace {
        let mut trace = self.open(session_id, tool, input).await;
        if let Err(error) = trace.fail(violation) {
            warn!(trace_id = %trace.trace_id.0, error = %error, "trace already finalized");
            return trace;
        }
        self.persist_final(&trace).await;
        self.analytics.emit(
            AnalyticsEvent::new(
                &self.source,
                session_id.clone(),
                AnalyticsEventType::ToolValidationFailed,
            )
            .with_tool(tool)
            .with_status(AnalyticsStatus::Failure)
            .with_error_code("invalid_arguments")
            .with_trace(trace.trace_id.clone())
            .with_metadata("violation", violation),
        );
        trace
    }

    pub fn routing_miss(&self, session_id: &SessionId, classified_tool: Option<&str>) {
        let mut event =
            AnalyticsEvent::new(&self.source, session_id.clone(), AnalyticsEventType::RoutingMiss)
                .with_status(AnalyticsStatus::Miss);
        if let Some(tool) = classified_tool {
            event = event.with_tool(tool).with_metadata("reason", "tool_unavailable");
        } else {
            event = event.with_metadata("reason", "unclassified");
        }
        self.analytics.emit(event);
    }

    pub fn fallback(
        &self,
        session_id: &SessionId,
        event_type: AnalyticsEventType,
        status: AnalyticsStatus,
    ) {
        self.analytics.emit(
            AnalyticsEvent::new(&self.source, session_id.clone(), event_type).with_status(status),
        );
    }

    async fn finalize(
        &self,
        trace: &ToolInvocationTrace,
        status: AnalyticsStatus,
        error_code: Option<&str>,
    ) {
        self.persist_final(trace).await;

        let mut event = AnalyticsEvent::new(
            &self.source,
            trace.session_id.clone(),
            AnalyticsEventType::ToolFinished,
        )
        .with_tool(&trace.tool)
        .with_status(status)
        .with_trace(trace.trace_id.clone())
        .with_latency_ms(trace.latency_ms());
        if let Some(code) = error_code {
            event = event.with_error_code(code);
        }
        self.analytics.emit(event);
    }

    async fn persist_final(&self, trace: &ToolInvocationTrace) {
        if let Err(error) = self.repo.finalize(trace).await {
            warn!(
                event_name = "agent.trace.finalize_failed",
                session_id = %trace.session_id.0,
                tool = %trace.tool,
                trace_id = %trace.trace_id.0,
                error = %error,
                "failed to finalize tool trace"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use opsdesk_core::analytics::{AnalyticsEventType, AnalyticsStatus, InMemoryAnalyticsSink};
    use opsdesk_core::domain::conversation::SessionId;
    use opsdesk_core::domain::trace::TraceStatus;
    use opsdesk_db::repositories::InMemoryTraceRepository;
    use opsdesk_db::TraceRepository;

    use super::TraceRecorder;

    fn recorder() -> (TraceRecorder, Arc<InMemoryTraceRepository>, InMemoryAnalyticsSink) {
        let repo = Arc::new(InMemoryTraceRepository::default());
        let sink = InMemoryAnalyticsSink::default();
        (TraceRecorder::new(repo.clone(), Arc::new(sink.clone())), repo, sink)
    }

    #[tokio::test]
    async fn successful_call_is_traced_with_latency() {
        let (recorder, repo, sink) = recorder();
        let session = SessionId("S-1".to_string());

        let mut trace = recorder.start(&session, "create_task", &json!({ "title": "call" })).await;
        recorder.finish_success(&mut trace, &json!({ "task_id": "T-1" })).await;
        recorder.finish_failure(&mut trace, "late").await;

        let stored = repo.find(&trace.trace_id).await.expect("find").expect("stored");
        assert_eq!(stored.status, TraceStatus::Success);
        assert_eq!(sink.count_of(&AnalyticsEventType::ToolStarted), 1);
        assert_eq!(sink.count_of(&AnalyticsEventType::ToolFinished), 1);
        let finished = sink
            .events()
            .into_iter()
            .find(|event| event.event_type == AnalyticsEventType::ToolFinished)
            .expect("finished event");
        assert_eq!(finished.status, Some(AnalyticsStatus::Success));
        assert!(finished.latency_ms.is_some());
    }

    #[tokio::test]
    async fn validation_failure_persists_failed_trace() {
        let (recorder, repo, sink) = recorder();
        let session = SessionId("S-2".to_string());

        let trace = recorder
            .record_validation_failure(&session, "update_quote", &json!({}), "`request` is required")
            .await;

        let stored = repo.find(&trace.trace_id).await.expect("find").expect("stored");
        assert_eq!(stored.status, TraceStatus::Failure);
        assert_eq!(stored.error.as_deref(), Some("`request` is required"));
        assert_eq!(sink.count_of(&AnalyticsEventType::ToolValidationFailed), 1);
        assert_eq!(sink.count_of(&AnalyticsEventType::ToolStarted), 0);
        assert_eq!(sink.count_of(&AnalyticsEventType::ToolFinished), 0);
    }

    #[test]
    fn routing_miss_records_reason() {
        let (recorder, _repo, sink) = recorder();
        recorder.routing_miss(&SessionId("S-3".to_string()), Some("create_quote"));
        recorder.routing_miss(&SessionId("S-3".to_string()), None);

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].metadata.get("reason").map(String::as_str), Some("tool_unavailable"));
        assert_eq!(events[1].metadata.get("reason").map(String::as_str), Some("unclassified"));
        assert!(events.iter().all(|event| event.status == Some(AnalyticsStatus::Miss)));
    }
}
