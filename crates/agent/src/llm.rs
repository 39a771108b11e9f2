use anyhow::Result;
use async_trait::async_trait;

/// Free-form model used when no tool or document answers a message.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn send_message(&self, text: &str, user_id: Option<&str>) -> Result<String>;
}
