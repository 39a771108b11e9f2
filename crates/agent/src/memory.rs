use std::sync::Arc;

use chrono::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use opsdesk_core::config::MemoryConfig;
use opsdesk_core::domain::conversation::{
    ConversationSummary, Message, MessagePayload, MessageRole, SessionId,
};
use opsdesk_db::{CompactionOutcome, CompactionPlan, CompactionPlanner, ConversationRepository};
use opsdesk_db::repositories::RepositoryError;

pub const MAX_HIGHLIGHTS: usize = 3;
pub const PENDING_RESOLUTION: &str = "Pending: no assistant resolution yet.";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryPolicy {
    pub max_messages: usize,
    pub recent_window: usize,
    pub highlight_chars: usize,
}

impl Default for MemoryPolicy {
    fn default() -> Self {
        Self { max_messages: 60, recent_window: 20, highlight_chars: 160 }
    }
}

impl From<&MemoryConfig> for MemoryPolicy {
    fn from(config: &MemoryConfig) -> Self {
        Self {
            max_messages: config.max_messages,
            recent_window: config.recent_window,
            highlight_chars: config.highlight_chars,
        }
    }
}

/// Plans a compaction once a session grows past the policy ceiling: every
/// message outside the recent window collapses into one summary message.
#[derive(Clone, Copy, Debug, Default)]
pub struct SummaryPlanner {
    policy: MemoryPolicy,
}

impl SummaryPlanner {
    pub fn new(policy: MemoryPolicy) -> Self {
        Self { policy }
    }
}

impl CompactionPlanner for SummaryPlanner {
    fn plan(&self, messages: &[Message]) -> Option<CompactionPlan> {
        if messages.len() <= self.policy.max_messages {
            return None;
        }

        let split = messages.len().saturating_sub(self.policy.recent_window);
        let older = &messages[..split];
        let last = older.last()?;
        let summary = summarize(older, &self.policy)?;

        let mut summary_message = Message::new(
            last.session_id.clone(),
            MessageRole::Assistant,
            MessagePayload::Summary(summary),
        );
        // Sits where the summarized span ended. On a timestamp tie with the
        // first recent message it moves 1µs earlier, since ties order by id
        // and the summary's id is always the newest.
        summary_message.created_at = match messages.get(split) {
            Some(first_recent) if first_recent.created_at <= last.created_at => {
                first_recent.created_at - Duration::microseconds(1)
            }
            _ => last.created_at,
        };

        Some(CompactionPlan {
            delete_ids: older.iter().map(|message| message.id.clone()).collect(),
            summary_message,
        })
    }
}

/// Condenses an ordered span of messages. Earlier summaries inside the span
/// are folded in, so repeated compactions keep their history.
pub fn summarize(messages: &[Message], policy: &MemoryPolicy) -> Option<ConversationSummary> {
    let last = messages.last()?;

    let mut summarized_count = 0;
    let mut highlights: Vec<String> = Vec::new();
    let mut resolution: Option<String> = None;

    for message in messages {
        if let Some(prior) = message.summary() {
            summarized_count += prior.summarized_count;
            highlights.extend(prior.highlights.iter().cloned());
            if prior.resolution.is_some() {
                resolution = prior.resolution.clone();
            }
            continue;
        }

        summarized_count += 1;
        let Some(text) = message.payload.display_text().map(str::trim) else {
            continue;
        };
        if text.is_empty() {
            continue;
        }
        match message.role {
            MessageRole::User => highlights.push(truncate(text, policy.highlight_chars)),
            MessageRole::Assistant => resolution = Some(text.to_string()),
            MessageRole::System => {}
        }
    }

    let keep_from = highlights.len().saturating_sub(MAX_HIGHLIGHTS);
    let highlights = highlights.split_off(keep_from);

    Some(ConversationSummary {
        summary_text: summary_text(summarized_count, &highlights, resolution.as_deref()),
        highlights,
        resolution,
        last_summarized_message_id: last.id.clone(),
        summarized_count,
    })
}

fn summary_text(count: usize, highlights: &[String], resolution: Option<&str>) -> String {
    let mut lines = vec![format!("Summary of {count} earlier message(s).")];
    if !highlights.is_empty() {
        lines.push(format!("Recent requests: {}", highlights.join(" | ")));
    }
    match resolution {
        Some(resolution) => lines.push(format!("Latest resolution: {resolution}")),
        None => lines.push(PENDING_RESOLUTION.to_string()),
    }
    lines.join("\n")
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let kept: String = text.chars().take(limit.saturating_sub(1)).collect();
    format!("{}…", kept.trim_end())
}

/// Keeps sessions under the message ceiling and serves their summaries.
#[derive(Clone)]
pub struct MemoryManager {
    repo: Arc<dyn ConversationRepository>,
    planner: SummaryPlanner,
}

impl MemoryManager {
    pub fn new(repo: Arc<dyn ConversationRepository>, policy: MemoryPolicy) -> Self {
        Self { repo, planner: SummaryPlanner::new(policy) }
    }

    pub fn policy(&self) -> &MemoryPolicy {
        &self.planner.policy
    }

    pub async fn compact(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<CompactionOutcome>, RepositoryError> {
        self.repo.compact(session_id, &self.planner).await
    }

    /// Runs compaction off the request path. A failed pass is retried by the
    /// next turn's pass.
    pub fn spawn_compaction(&self, session_id: SessionId) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            match manager.compact(&session_id).await {
                Ok(Some(outcome)) => info!(
                    event_name = "agent.memory.compacted",
                    session_id = %session_id.0,
                    deleted = outcome.deleted,
                    remaining = outcome.remaining,
                    summary_id = %outcome.summary_id.0,
                    "conversation compacted"
                ),
                Ok(None) => {}
                Err(error) => warn!(
                    event_name = "agent.memory.compaction_failed",
                    session_id = %session_id.0,
                    error = %error,
                    "conversation compaction failed; will retry next turn"
                ),
            }
        })
    }

    /// The newest stored summary when it still covers the whole history,
    /// otherwise one recomputed on the fly. Nothing is persisted here.
    pub async fn current_summary(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<ConversationSummary>, RepositoryError> {
        let messages = self.repo.list_messages(session_id).await?;
        let Some(newest) = messages.last() else {
            return Ok(None);
        };

        if let Some(stored) = messages.iter().rev().find_map(Message::summary) {
            if !stored.is_stale(&newest.id) {
                return Ok(Some(stored.clone()));
            }
        }

        Ok(summarize(&messages, self.policy()))
    }
}
