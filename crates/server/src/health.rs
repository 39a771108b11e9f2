use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use opsdesk_db::{ping, DbPool};
use serde::Serialize;

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
    tool_backend: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub database: HealthCheck,
    pub tools: HealthCheck,
    pub checked_at: String,
}

/// Readiness follows the database only; a missing tool backend is reported
/// but the agent still answers through its fallbacks.
pub fn router(db_pool: DbPool, tool_backend: Option<String>) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState { db_pool, tool_backend })
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let ready = database.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: "opsdesk-server runtime initialized".to_string(),
        },
        database,
        tools: tools_check(state.tool_backend.as_deref()),
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match ping(pool).await {
        Ok(()) => HealthCheck { status: "ready", detail: "database query succeeded".to_string() },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}

fn tools_check(tool_backend: Option<&str>) -> HealthCheck {
    match tool_backend {
        Some(url) => HealthCheck { status: "ready", detail: format!("tool backend at {url}") },
        None => HealthCheck {
            status: "disabled",
            detail: "no tool backend configured; fallbacks only".to_string(),
        },
    }
}
