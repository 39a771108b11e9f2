use tracing::info;

use opsdesk_core::analytics::{AnalyticsEvent, AnalyticsSink, AnalyticsStatus};

/// Writes analytics events into the structured log.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAnalyticsSink;

impl AnalyticsSink for TracingAnalyticsSink {
    fn emit(&self, event: AnalyticsEvent) {
        let status = event.status.as_ref().map(|status| match status {
            AnalyticsStatus::Success => "success",
            AnalyticsStatus::Failure => "failure",
            AnalyticsStatus::Miss => "miss",
        });

        info!(
            event_name = %format!("analytics.{}", event.event_type.as_str()),
            source = %event.source,
            session_id = %event.session_id.0,
            tool = event.tool.as_deref().unwrap_or(""),
            status = status.unwrap_or(""),
            error_code = event.error_code.as_deref().unwrap_or(""),
            trace_id = event.trace_id.as_ref().map(|trace| trace.0.as_str()).unwrap_or(""),
            latency_ms = event.latency_ms,
            metadata = ?event.metadata,
            occurred_at = %event.occurred_at.to_rfc3339(),
            "analytics event"
        );
    }
}
