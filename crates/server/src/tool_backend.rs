use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use opsdesk_agent::tools::{Tool, ToolCatalog, ToolContext, ToolProvider, ToolRegistry};
use opsdesk_core::config::ToolsConfig;

pub const SESSION_HEADER: &str = "x-opsdesk-session-id";
pub const USER_HEADER: &str = "x-opsdesk-user-id";
pub const COMPANY_HEADER: &str = "x-opsdesk-company-id";
pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

/// Serves every business action from a remote backend at
/// `POST {base_url}/tools/{name}`.
#[derive(Clone)]
pub struct HttpToolProvider {
    client: Client,
    base_url: Arc<str>,
    tool_names: Arc<[String]>,
}

impl HttpToolProvider {
    /// `None` when no backend is configured.
    pub fn from_config(config: &ToolsConfig, catalog: &ToolCatalog) -> Result<Option<Self>> {
        let Some(base_url) = config.base_url.as_deref() else {
            return Ok(None);
        };

        let tool_names: Vec<String> = if config.enabled.is_empty() {
            catalog.names().map(str::to_string).collect()
        } else {
            config.enabled.clone()
        };
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("building tool backend http client")?;

        Ok(Some(Self {
            client,
            base_url: Arc::from(base_url.trim_end_matches('/')),
            tool_names: tool_names.into(),
        }))
    }

    pub fn tool_names(&self) -> &[String] {
        &self.tool_names
    }
}

impl ToolProvider for HttpToolProvider {
    fn registry_for(&self, context: &ToolContext) -> ToolRegistry {
        let mut registry = ToolRegistry::default();
        for name in self.tool_names.iter() {
            registry.register(HttpTool {
                name: name.clone(),
                endpoint: format!("{}/tools/{name}", self.base_url),
                client: self.client.clone(),
                context: context.clone(),
            });
        }
        registry
    }
}

struct HttpTool {
    name: String,
    endpoint: String,
    client: Client,
    context: ToolContext,
}

#[async_trait]
impl Tool for HttpTool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, input: Value) -> Result<Value> {
        let idempotency_key = input
            .get("idempotency_key")
            .and_then(Value::as_str)
            .unwrap_or(&self.context.idempotency_key)
            .to_string();

        let mut request = self
            .client
            .post(&self.endpoint)
            .header(SESSION_HEADER, &self.context.session_id.0)
            .header(IDEMPOTENCY_HEADER, idempotency_key)
            .json(&input);
        if let Some(user_id) = &self.context.user_id {
            request = request.header(USER_HEADER, user_id);
        }
        if let Some(company_id) = &self.context.company_id {
            request = request.header(COMPANY_HEADER, company_id);
        }

        let response =
            request.send().await.with_context(|| format!("calling tool backend for {}", self.name))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("tool backend returned {status}: {}", snippet(&body));
        }

        response.json::<Value>().await.context("tool backend returned invalid json")
    }
}

fn snippet(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= 200 {
        return trimmed.to_string();
    }
    let head: String = trimmed.chars().take(200).collect();
    format!("{head}…")
}

#[cfg(test)]
mod tests {
    use opsdesk_agent::tools::{ToolCatalog, ToolContext, ToolProvider};
    use opsdesk_core::config::ToolsConfig;
    use opsdesk_core::domain::conversation::SessionId;

    use super::{snippet, HttpToolProvider};

    fn context() -> ToolContext {
        ToolContext {
            session_id: SessionId("S-1".to_string()),
            user_id: Some("u-1".to_string()),
            company_id: None,
            idempotency_key: "k-1".to_string(),
        }
    }

    #[test]
    fn no_backend_means_no_provider() {
        let config = ToolsConfig { base_url: None, enabled: Vec::new(), timeout_secs: 5 };
        let provider =
            HttpToolProvider::from_config(&config, &ToolCatalog::standard()).expect("config");
        assert!(provider.is_none());
    }

    #[test]
    fn enabled_list_limits_registered_tools() {
        let config = ToolsConfig {
            base_url: Some("http://tools.internal/".to_string()),
            enabled: vec!["create_task".to_string(), "search_documentation".to_string()],
            timeout_secs: 5,
        };
        let provider = HttpToolProvider::from_config(&config, &ToolCatalog::standard())
            .expect("config")
            .expect("provider");

        let registry = provider.registry_for(&context());
        assert_eq!(
            registry.names(),
            vec!["create_task".to_string(), "search_documentation".to_string()]
        );
    }

    #[test]
    fn empty_enabled_list_registers_whole_catalog() {
        let catalog = ToolCatalog::standard();
        let config = ToolsConfig {
            base_url: Some("https://tools.internal".to_string()),
            enabled: Vec::new(),
            timeout_secs: 5,
        };
        let provider =
            HttpToolProvider::from_config(&config, &catalog).expect("config").expect("provider");

        assert_eq!(provider.registry_for(&context()).len(), catalog.names().count());
        assert!(provider.tool_names().iter().any(|name| name == "update_pickup_time"));
    }

    #[test]
    fn long_error_bodies_are_clipped() {
        let body = "e".repeat(500);
        assert_eq!(snippet(&body).chars().count(), 201);
        assert_eq!(snippet("  short  "), "short");
    }
}
