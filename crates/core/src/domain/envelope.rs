//! Presentation-free result shape every tool handler returns.
//!
//! Tool handlers never produce user-facing text; the agent's response
//! composer turns an envelope into text and UI hints.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Error code used when a tool reports failure without naming one.
pub const UNKNOWN_ERROR_CODE: &str = "unknown";
/// Error code used when a result claims to be an envelope but does not decode.
pub const INVALID_ENVELOPE_CODE: &str = "invalid_envelope";

pub type EnvelopeRow = Map<String, Value>;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
}

/// Which lookup strategies a tool tried before reporting an empty result.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchAttempts {
    #[serde(default)]
    pub exact: bool,
    #[serde(default)]
    pub fuzzy: bool,
    #[serde(default)]
    pub schema_refreshed: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeError {
    #[serde(default = "unknown_code")]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

impl EnvelopeError {
    pub fn new(code: impl Into<String>) -> Self {
        Self { code: code.into(), message: String::new() }
    }
}

fn unknown_code() -> String {
    UNKNOWN_ERROR_CODE.to_string()
}

/// Accepts `{code, message}`, a bare code string, or nothing at all.
fn lenient_error<'de, D>(deserializer: D) -> Result<Option<EnvelopeError>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Code(String),
        Detail(EnvelopeError),
    }

    Ok(match Option::<Repr>::deserialize(deserializer)? {
        None => None,
        Some(Repr::Code(code)) if code.trim().is_empty() => Some(EnvelopeError::new(UNKNOWN_ERROR_CODE)),
        Some(Repr::Code(code)) => Some(EnvelopeError::new(code.trim())),
        Some(Repr::Detail(error)) => Some(error),
    })
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EnvelopeOutcome {
    Success {
        #[serde(default)]
        rows: Vec<EnvelopeRow>,
    },
    Disambiguation {
        #[serde(default)]
        candidates: Vec<EnvelopeRow>,
    },
    Empty {
        #[serde(default)]
        attempts: MatchAttempts,
    },
    Error {
        #[serde(default, deserialize_with = "lenient_error", skip_serializing_if = "Option::is_none")]
        error: Option<EnvelopeError>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResultEnvelope {
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<EnvelopeQuery>,
    #[serde(flatten)]
    pub outcome: EnvelopeOutcome,
}

impl ToolResultEnvelope {
    /// Interprets an arbitrary tool result as an envelope when it carries a
    /// recognised `type` discriminant. A recognised discriminant with a body
    /// that does not decode becomes an `invalid_envelope` error so a broken
    /// result is never reported as a plain completion.
    pub fn from_tool_result(value: &Value) -> Option<Self> {
        let kind = value.get("type")?.as_str()?;
        if !matches!(kind, "success" | "disambiguation" | "empty" | "error") {
            return None;
        }
        Some(serde_json::from_value(value.clone()).unwrap_or_else(|_| Self {
            source: value.get("source").and_then(Value::as_str).unwrap_or_default().to_string(),
            query: None,
            outcome: EnvelopeOutcome::Error {
                error: Some(EnvelopeError::new(INVALID_ENVELOPE_CODE)),
            },
        }))
    }

    /// The reported error code, if this is an error envelope.
    pub fn error_code(&self) -> Option<&str> {
        match &self.outcome {
            EnvelopeOutcome::Error { error } => {
                Some(error.as_ref().map(|error| error.code.as_str()).unwrap_or(UNKNOWN_ERROR_CODE))
            }
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self.outcome {
            EnvelopeOutcome::Success { .. } => "success",
            EnvelopeOutcome::Disambiguation { .. } => "disambiguation",
            EnvelopeOutcome::Empty { .. } => "empty",
            EnvelopeOutcome::Error { .. } => "error",
        }
    }

    pub fn entity_type(&self) -> Option<&str> {
        self.query.as_ref().and_then(|query| query.entity_type.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{EnvelopeError, EnvelopeOutcome, MatchAttempts, ToolResultEnvelope};

    #[test]
    fn parses_empty_envelope_with_query_metadata() {
        let envelope = ToolResultEnvelope::from_tool_result(&json!({
            "type": "empty",
            "source": "vendor_lookup",
            "query": { "entity_type": "vendor", "entity_name": "Acme" },
            "attempts": { "exact": true, "fuzzy": false, "schema_refreshed": false }
        }))
        .expect("envelope");

        assert_eq!(envelope.kind(), "empty");
        assert_eq!(envelope.entity_type(), Some("vendor"));
        assert_eq!(
            envelope.outcome,
            EnvelopeOutcome::Empty {
                attempts: MatchAttempts { exact: true, fuzzy: false, schema_refreshed: false }
            }
        );
    }

    #[test]
    fn plain_tool_results_are_not_envelopes() {
        assert!(ToolResultEnvelope::from_tool_result(&json!({ "order_number": "SO-1" })).is_none());
        assert!(ToolResultEnvelope::from_tool_result(&json!({ "type": "order" })).is_none());
    }

    #[test]
    fn partial_error_envelopes_still_decode_as_errors() {
        let bare = ToolResultEnvelope::from_tool_result(&json!({
            "type": "error",
            "source": "quote_service"
        }))
        .expect("envelope");
        assert_eq!(bare.outcome, EnvelopeOutcome::Error { error: None });
        assert_eq!(bare.error_code(), Some("unknown"));

        let without_code = ToolResultEnvelope::from_tool_result(&json!({
            "type": "error",
            "error": { "message": "db down" }
        }))
        .expect("envelope");
        assert_eq!(without_code.error_code(), Some("unknown"));

        let as_string = ToolResultEnvelope::from_tool_result(&json!({
            "type": "error",
            "error": "permission_denied"
        }))
        .expect("envelope");
        assert_eq!(
            as_string.outcome,
            EnvelopeOutcome::Error { error: Some(EnvelopeError::new("permission_denied")) }
        );
    }

    #[test]
    fn undecodable_bodies_become_invalid_envelope_errors() {
        let rows = ToolResultEnvelope::from_tool_result(&json!({
            "type": "success",
            "source": "part_lookup",
            "rows": [{ "part_number": "P-1" }, "P-2"]
        }))
        .expect("envelope");
        assert_eq!(rows.kind(), "error");
        assert_eq!(rows.source, "part_lookup");
        assert_eq!(rows.error_code(), Some("invalid_envelope"));

        let candidates = ToolResultEnvelope::from_tool_result(&json!({
            "type": "disambiguation",
            "candidates": 3
        }))
        .expect("envelope");
        assert_eq!(candidates.error_code(), Some("invalid_envelope"));
    }
}
