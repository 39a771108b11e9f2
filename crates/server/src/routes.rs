use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use opsdesk_agent::{AgentRuntime, TurnRequest, TurnResponse};
use opsdesk_core::confirmation::ConfirmationSigner;
use opsdesk_core::domain::conversation::{ConversationSummary, Message, SessionId};
use opsdesk_core::errors::{ApplicationError, InterfaceError};
use opsdesk_db::RepositoryError;

pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";
pub const USER_HEADER: &str = "x-user-id";
pub const COMPANY_HEADER: &str = "x-company-id";

#[derive(Clone)]
pub struct ApiState {
    pub runtime: Arc<AgentRuntime>,
    pub signer: Arc<ConfirmationSigner>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/sessions/{session_id}/messages", post(post_message).get(list_messages))
        .route("/sessions/{session_id}/summary", get(session_summary))
        .route("/plans/{plan_id}/confirmation", post(issue_confirmation))
        .route("/plans/{plan_id}/confirmation/verify", post(verify_confirmation))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct PostMessageRequest {
    pub message: String,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MessagesResponse {
    pub session_id: SessionId,
    pub messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
pub struct SummaryResponse {
    pub session_id: SessionId,
    pub summary: ConversationSummary,
}

#[derive(Debug, Serialize)]
pub struct ConfirmationResponse {
    pub plan_id: String,
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub plan_id: String,
    pub valid: bool,
}

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: String,
    pub detail: Option<String>,
    pub correlation_id: String,
}

/// Interface error rendered as a JSON response.
#[derive(Debug)]
pub struct ApiError(pub InterfaceError);

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self(InterfaceError::BadRequest { message: message.into(), correlation_id: correlation_id() })
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self(InterfaceError::NotFound { message: message.into(), correlation_id: correlation_id() })
    }

    fn persistence(error: RepositoryError) -> Self {
        let interface = ApplicationError::Persistence(error.to_string()).into_interface(correlation_id());
        warn!(
            event_name = "server.api.persistence_failed",
            correlation_id = interface.correlation_id(),
            error = %error,
            "request failed on storage"
        );
        Self(interface)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match &self.0 {
            InterfaceError::BadRequest { message, .. } => (StatusCode::BAD_REQUEST, Some(message.clone())),
            InterfaceError::NotFound { message, .. } => (StatusCode::NOT_FOUND, Some(message.clone())),
            InterfaceError::ServiceUnavailable { .. } => (StatusCode::SERVICE_UNAVAILABLE, None),
            InterfaceError::Internal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, None),
        };
        let body = ApiErrorBody {
            error: self.0.user_message().to_string(),
            detail,
            correlation_id: self.0.correlation_id().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

fn correlation_id() -> String {
    format!("req-{}", Uuid::new_v4())
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

async fn post_message(
    Path(session_id): Path<String>,
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<PostMessageRequest>,
) -> Result<Json<TurnResponse>, ApiError> {
    if body.message.trim().is_empty() {
        return Err(ApiError::bad_request("message must not be empty"));
    }

    let mut request = TurnRequest::new(SessionId(session_id), body.message);
    request.idempotency_key = body
        .idempotency_key
        .filter(|key| !key.trim().is_empty())
        .or_else(|| header(&headers, IDEMPOTENCY_HEADER));
    request.user_id = header(&headers, USER_HEADER);
    request.company_id = header(&headers, COMPANY_HEADER);

    Ok(Json(state.runtime.handle_message(request).await))
}

async fn list_messages(
    Path(session_id): Path<String>,
    State(state): State<ApiState>,
) -> Result<Json<MessagesResponse>, ApiError> {
    let session_id = SessionId(session_id);
    let conversations = state.runtime.conversations();
    if conversations.find_session(&session_id).await.map_err(ApiError::persistence)?.is_none() {
        return Err(ApiError::not_found(format!("session `{}` does not exist", session_id.0)));
    }
    let messages = conversations.list_messages(&session_id).await.map_err(ApiError::persistence)?;
    Ok(Json(MessagesResponse { session_id, messages }))
}

async fn session_summary(
    Path(session_id): Path<String>,
    State(state): State<ApiState>,
) -> Result<Json<SummaryResponse>, ApiError> {
    let session_id = SessionId(session_id);
    match state.runtime.memory().current_summary(&session_id).await.map_err(ApiError::persistence)? {
        Some(summary) => Ok(Json(SummaryResponse { session_id, summary })),
        None => Err(ApiError::not_found(format!("session `{}` has no messages", session_id.0))),
    }
}

async fn issue_confirmation(
    Path(plan_id): Path<String>,
    State(state): State<ApiState>,
) -> Result<Json<ConfirmationResponse>, ApiError> {
    let token = state.signer.issue(&plan_id).map_err(|error| ApiError::bad_request(error.to_string()))?;
    Ok(Json(ConfirmationResponse { plan_id, token }))
}

async fn verify_confirmation(
    Path(plan_id): Path<String>,
    State(state): State<ApiState>,
    Json(body): Json<VerifyRequest>,
) -> Json<VerifyResponse> {
    let valid = state.signer.verify(&plan_id, body.token.trim());
    Json(VerifyResponse { plan_id, valid })
}
