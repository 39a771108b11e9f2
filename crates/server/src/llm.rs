use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::warn;

use opsdesk_agent::llm::LlmClient;
use opsdesk_core::config::{LlmConfig, LlmProvider};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_OUTPUT_TOKENS: u32 = 1024;
const SYSTEM_PROMPT: &str = "You are the operations desk assistant. Answer briefly. You cannot create, change or send business documents yourself; point the user to the matching request instead.";

/// Fallback model reached over the provider's HTTP API.
pub struct HttpLlmClient {
    client: Client,
    provider: LlmProvider,
    base_url: String,
    model: String,
    api_key: Option<SecretString>,
    max_retries: u32,
}

impl HttpLlmClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let base_url = match (config.provider, config.base_url.as_deref()) {
            (_, Some(url)) => url.trim_end_matches('/').to_string(),
            (LlmProvider::OpenAi, None) => OPENAI_BASE_URL.to_string(),
            (LlmProvider::Anthropic, None) => ANTHROPIC_BASE_URL.to_string(),
            (LlmProvider::Ollama, None) => bail!("llm.base_url is required for ollama"),
        };
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("building llm http client")?;

        Ok(Self {
            client,
            provider: config.provider,
            base_url,
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            max_retries: config.max_retries,
        })
    }

    fn request(&self, text: &str, user_id: Option<&str>) -> RequestBuilder {
        let (path, body) = request_body(self.provider, &self.model, text, user_id);
        let mut request = self.client.post(format!("{}{path}", self.base_url)).json(&body);
        if let Some(key) = &self.api_key {
            request = match self.provider {
                LlmProvider::OpenAi => request.bearer_auth(key.expose_secret()),
                LlmProvider::Anthropic => request
                    .header("x-api-key", key.expose_secret())
                    .header("anthropic-version", ANTHROPIC_VERSION),
                LlmProvider::Ollama => request,
            };
        }
        request
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn send_message(&self, text: &str, user_id: Option<&str>) -> Result<String> {
        let mut attempt = 0;
        loop {
            let outcome = self.request(text, user_id).send().await;
            let retryable = match &outcome {
                Ok(response) => response.status().is_server_error(),
                Err(error) => error.is_timeout() || error.is_connect(),
            };
            if retryable && attempt < self.max_retries {
                attempt += 1;
                warn!(
                    event_name = "server.llm.retry",
                    provider = ?self.provider,
                    attempt,
                    "llm request failed; retrying"
                );
                tokio::time::sleep(Duration::from_millis(250 * u64::from(attempt))).await;
                continue;
            }

            let response = outcome.context("llm request failed")?;
            let status = response.status();
            if !status.is_success() {
                bail!("llm provider returned {status}");
            }
            let payload: Value = response.json().await.context("llm returned invalid json")?;
            return parse_reply(self.provider, &payload)
                .ok_or_else(|| anyhow!("llm response carried no text"));
        }
    }
}

fn request_body(
    provider: LlmProvider,
    model: &str,
    text: &str,
    user_id: Option<&str>,
) -> (&'static str, Value) {
    match provider {
        LlmProvider::OpenAi => {
            let mut body = json!({
                "model": model,
                "messages": [
                    { "role": "system", "content": SYSTEM_PROMPT },
                    { "role": "user", "content": text }
                ],
            });
            if let Some(user_id) = user_id {
                body["user"] = json!(user_id);
            }
            ("/chat/completions", body)
        }
        LlmProvider::Anthropic => {
            let mut body = json!({
                "model": model,
                "max_tokens": MAX_OUTPUT_TOKENS,
                "system": SYSTEM_PROMPT,
                "messages": [{ "role": "user", "content": text }],
            });
            if let Some(user_id) = user_id {
                body["metadata"] = json!({ "user_id": user_id });
            }
            ("/messages", body)
        }
        LlmProvider::Ollama => (
            "/api/generate",
            json!({ "model": model, "system": SYSTEM_PROMPT, "prompt": text, "stream": false }),
        ),
    }
}

fn parse_reply(provider: LlmProvider, payload: &Value) -> Option<String> {
    let text = match provider {
        LlmProvider::OpenAi => payload.pointer("/choices/0/message/content")?.as_str()?.to_string(),
        LlmProvider::Anthropic => payload
            .get("content")?
            .as_array()?
            .iter()
            .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        LlmProvider::Ollama => payload.get("response")?.as_str()?.to_string(),
    };
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use opsdesk_core::config::{LlmConfig, LlmProvider};

    use super::{parse_reply, request_body, HttpLlmClient};

    #[test]
    fn request_shapes_follow_provider() {
        let (path, body) = request_body(LlmProvider::OpenAi, "gpt-4o-mini", "hi", Some("u-1"));
        assert_eq!(path, "/chat/completions");
        assert_eq!(body["messages"][1]["content"], "hi");
        assert_eq!(body["user"], "u-1");

        let (path, body) = request_body(LlmProvider::Anthropic, "claude", "hi", Some("u-1"));
        assert_eq!(path, "/messages");
        assert_eq!(body["metadata"]["user_id"], "u-1");

        let (path, body) = request_body(LlmProvider::Ollama, "llama3.1", "hi", None);
        assert_eq!(path, "/api/generate");
        assert_eq!(body["stream"], false);
    }

    #[test]
    fn replies_are_extracted_per_provider() {
        assert_eq!(
            parse_reply(
                LlmProvider::OpenAi,
                &json!({ "choices": [{ "message": { "content": " Hello " } }] })
            ),
            Some("Hello".to_string())
        );
        assert_eq!(
            parse_reply(
                LlmProvider::Anthropic,
                &json!({ "content": [{ "type": "text", "text": "Hi" }, { "type": "tool_use" }] })
            ),
            Some("Hi".to_string())
        );
        assert_eq!(parse_reply(LlmProvider::Ollama, &json!({ "response": "" })), None);
    }

    #[test]
    fn ollama_requires_base_url() {
        let config = LlmConfig {
            provider: LlmProvider::Ollama,
            api_key: None,
            base_url: None,
            model: "llama3.1".to_string(),
            timeout_secs: 5,
            max_retries: 0,
        };
        assert!(HttpLlmClient::from_config(&config).is_err());
    }
}
