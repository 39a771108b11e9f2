use std::sync::Arc;

use axum::Router;
use opsdesk_agent::identity::ConfiguredServiceIdentity;
use opsdesk_agent::tools::{StaticToolProvider, ToolCatalog, ToolProvider};
use opsdesk_agent::{AgentComponents, AgentRuntime, MemoryPolicy};
use opsdesk_core::config::{AppConfig, ConfigError, LoadOptions};
use opsdesk_core::confirmation::{ConfirmationError, ConfirmationSigner};
use opsdesk_db::repositories::{SqlConversationRepository, SqlIdempotencyStore, SqlTraceRepository};
use opsdesk_db::{connect_with_config, migrations, DbPool};
use thiserror::Error;
use tracing::info;

use crate::analytics::TracingAnalyticsSink;
use crate::llm::HttpLlmClient;
use crate::tool_backend::HttpToolProvider;
use crate::{health, routes};

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub runtime: Arc<AgentRuntime>,
    pub signer: Arc<ConfirmationSigner>,
    pub tool_backend: Option<String>,
}

impl Application {
    pub fn router(&self) -> Router {
        routes::router(routes::ApiState { runtime: self.runtime.clone(), signer: self.signer.clone() })
            .merge(health::router(self.db_pool.clone(), self.tool_backend.clone()))
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("confirmation signer setup failed: {0}")]
    Confirmation(#[from] ConfirmationError),
    #[error("integration setup failed: {0}")]
    Integration(String),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let catalog = ToolCatalog::standard();
    let http_tools = HttpToolProvider::from_config(&config.tools, &catalog)
        .map_err(|error| BootstrapError::Integration(format!("{error:#}")))?;
    let tool_backend = config.tools.base_url.clone();
    let tools: Arc<dyn ToolProvider> = match http_tools {
        Some(provider) => {
            info!(
                event_name = "system.bootstrap.tools_configured",
                correlation_id = "bootstrap",
                tool_count = provider.tool_names().len(),
                "tool backend configured"
            );
            Arc::new(provider)
        }
        None => Arc::new(StaticToolProvider::default()),
    };

    let llm = HttpLlmClient::from_config(&config.llm)
        .map_err(|error| BootstrapError::Integration(format!("{error:#}")))?;

    let conflict_policy = config.idempotency.conflict_policy;
    let runtime = AgentRuntime::new(AgentComponents {
        conversations: Arc::new(SqlConversationRepository::new(db_pool.clone())),
        traces: Arc::new(SqlTraceRepository::new(db_pool.clone())),
        idempotency: Arc::new(SqlIdempotencyStore::new(db_pool.clone()).with_policy(conflict_policy)),
        tools,
        analytics: Arc::new(TracingAnalyticsSink),
        identity: Arc::new(ConfiguredServiceIdentity::from(&config.service_account)),
        catalog,
        memory_policy: MemoryPolicy::from(&config.memory),
        conflict_policy,
    })
    .with_llm(Arc::new(llm));

    let signer = ConfirmationSigner::new(config.confirmation.secret.clone())?;

    Ok(Application {
        config,
        db_pool,
        runtime: Arc::new(runtime),
        signer: Arc::new(signer),
        tool_backend,
    })
}

#[cfg(test)]
mod tests {
    use opsdesk_core::config::{ConfigOverrides, LoadOptions};

    use crate::bootstrap::bootstrap;

    #[tokio::test]
    async fn bootstrap_fails_fast_without_confirmation_secret() {
        let result = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .await;

        let message = result.err().expect("error").to_string();
        assert!(message.contains("confirmation.secret"));
    }

    #[tokio::test]
    async fn bootstrap_applies_migrations_and_wires_runtime() {
        let app = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:?cache=shared".to_string()),
                confirmation_secret: Some("bootstrap-test-secret-01".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .await
        .expect("bootstrap should succeed with valid overrides");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN \
             ('conversation_session', 'conversation_message', 'tool_invocation_trace', 'idempotency_record')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("count tables");
        assert_eq!(table_count, 4);
        assert!(app.tool_backend.is_none());

        let token = app.signer.issue("plan-1").expect("token");
        assert!(app.signer.verify("plan-1", &token));

        app.db_pool.close().await;
    }
}
