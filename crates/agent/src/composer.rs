//! Turns tool result envelopes into user-facing text and UI hints.
//!
//! Everything here is pure: the same envelope and capabilities always yield
//! the same response.

use serde_json::{json, Map, Value};

use opsdesk_core::domain::conversation::Severity;
use opsdesk_core::domain::envelope::{
    EnvelopeOutcome, EnvelopeRow, MatchAttempts, ToolResultEnvelope, UNKNOWN_ERROR_CODE,
};

pub const MAX_PREVIEW_ROWS: usize = 5;
const NAME_FIELDS: [&str; 4] = ["display_name", "name", "company_name", "title"];

/// What the current user may create from an empty lookup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub can_create_vendor: bool,
    pub can_create_customer: bool,
    pub can_create_part: bool,
}

impl Capabilities {
    pub fn all() -> Self {
        Self { can_create_vendor: true, can_create_customer: true, can_create_part: true }
    }

    fn can_create(&self, entity: &str) -> bool {
        match entity {
            "vendor" => self.can_create_vendor,
            "customer" => self.can_create_customer,
            "part" => self.can_create_part,
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ComposedResponse {
    pub text: String,
    pub ui_hints: Option<Value>,
    pub severity: Severity,
}

pub fn compose(
    user_text: &str,
    tool: &str,
    envelope: &ToolResultEnvelope,
    capabilities: &Capabilities,
) -> ComposedResponse {
    let entity = entity_label(tool, envelope);
    match &envelope.outcome {
        EnvelopeOutcome::Success { rows } => compose_success(user_text, &entity, envelope, rows),
        EnvelopeOutcome::Disambiguation { candidates } => compose_disambiguation(candidates),
        EnvelopeOutcome::Empty { attempts } => {
            compose_empty(user_text, &entity, envelope, attempts, capabilities)
        }
        EnvelopeOutcome::Error { error } => {
            compose_error(error.as_ref().map_or(UNKNOWN_ERROR_CODE, |error| error.code.as_str()))
        }
    }
}

fn entity_label(tool: &str, envelope: &ToolResultEnvelope) -> String {
    if let Some(entity) = envelope.entity_type() {
        return entity.trim().to_ascii_lowercase();
    }
    let fallback = ["vendor", "customer", "part", "sales_order", "purchase_order", "quote"]
        .into_iter()
        .find(|entity| tool.contains(entity));
    fallback.unwrap_or("record").to_string()
}

fn display_entity(entity: &str) -> String {
    entity.replace('_', " ")
}

fn column_template(entity: &str) -> Option<&'static [&'static str]> {
    let columns: &'static [&'static str] = match entity {
        "vendor" => &["vendor_id", "display_name", "email", "phone", "city", "status"],
        "customer" => &["customer_id", "display_name", "email", "phone", "city", "balance"],
        "part" => &["part_number", "description", "quantity_on_hand", "unit_cost", "location"],
        "sales_order" => &["order_number", "customer", "status", "order_date", "total"],
        "purchase_order" => &["order_number", "vendor", "status", "order_date", "total"],
        "quote" => &["quote_number", "customer", "status", "expires_on", "total"],
        _ => return None,
    };
    Some(columns)
}

fn next_steps(entity: &str) -> &'static [&'static str] {
    match entity {
        "vendor" => &["Open the vendor record", "Start a vendor call", "Create a purchase order"],
        "customer" => &["Open the customer record", "Create a quote", "Create a sales order"],
        "part" => &["Check stock by location", "Create a purchase order for this part"],
        "sales_order" => &["Update the sales order", "Email the sales order", "Close the sales order"],
        "purchase_order" => {
            &["Update the purchase order", "Email the purchase order", "Close the purchase order"]
        }
        "quote" => &["Update the quote", "Email the quote", "Convert the quote to a sales order"],
        _ => &["Refine the search", "Ask for a specific record"],
    }
}

/// Template columns that carry at least one non-null value across the rows.
pub fn preview_columns(entity: &str, rows: &[EnvelopeRow]) -> Vec<String> {
    let candidates: Vec<String> = match column_template(entity) {
        Some(template) => template.iter().map(|column| column.to_string()).collect(),
        None => rows.first().map(|row| row.keys().cloned().collect()).unwrap_or_default(),
    };

    candidates
        .into_iter()
        .filter(|column| rows.iter().any(|row| row.get(column).is_some_and(|value| !value.is_null())))
        .collect()
}

fn compose_success(
    user_text: &str,
    entity: &str,
    envelope: &ToolResultEnvelope,
    rows: &[EnvelopeRow],
) -> ComposedResponse {
    let identifier = envelope
        .query
        .as_ref()
        .and_then(|query| query.identifier.clone().or_else(|| query.entity_name.clone()))
        .or_else(|| rows.first().and_then(first_name_like))
        .unwrap_or_else(|| user_text.trim().to_string());

    let columns = preview_columns(entity, rows);
    let preview: Vec<Value> = rows
        .iter()
        .take(MAX_PREVIEW_ROWS)
        .map(|row| {
            Value::Object(
                columns
                    .iter()
                    .map(|column| (column.clone(), row.get(column).cloned().unwrap_or(Value::Null)))
                    .collect::<Map<String, Value>>(),
            )
        })
        .collect();

    let mut lines = vec![format!(
        "Found {} {}(s) for '{}'.",
        rows.len(),
        display_entity(entity),
        identifier
    )];
    if !columns.is_empty() {
        lines.push(String::new());
        lines.push(columns.join(" | "));
        for row in rows.iter().take(MAX_PREVIEW_ROWS) {
            let cells: Vec<String> =
                columns.iter().map(|column| cell(row.get(column))).collect();
            lines.push(cells.join(" | "));
        }
        if rows.len() > MAX_PREVIEW_ROWS {
            lines.push(format!("…and {} more.", rows.len() - MAX_PREVIEW_ROWS));
        }
    }
    let steps = next_steps(entity);
    lines.push(String::new());
    lines.push("Next steps:".to_string());
    lines.extend(steps.iter().map(|step| format!("- {step}")));

    ComposedResponse {
        text: lines.join("\n"),
        ui_hints: Some(json!({
            "columns": columns,
            "preview": preview,
            "total": rows.len(),
            "next_steps": steps,
        })),
        severity: Severity::Info,
    }
}

fn compose_disambiguation(candidates: &[EnvelopeRow]) -> ComposedResponse {
    let mut lines = vec!["I found several possible matches:".to_string()];
    for (index, candidate) in candidates.iter().enumerate() {
        lines.push(format!("{}. {}", index + 1, describe_candidate(candidate)));
    }
    lines.push("Reply with a number or the exact name.".to_string());

    ComposedResponse {
        text: lines.join("\n"),
        ui_hints: Some(json!({ "candidates": candidates })),
        severity: Severity::Info,
    }
}

fn describe_candidate(candidate: &EnvelopeRow) -> String {
    let name = first_name_like(candidate);
    let id = candidate
        .iter()
        .find(|(key, value)| (key.as_str() == "id" || key.ends_with("_id")) && is_present(value))
        .map(|(key, value)| (key.clone(), cell(Some(value))));

    let mut parts: Vec<String> = Vec::new();
    if let Some(name) = &name {
        parts.push(name.clone());
    }
    if let Some((_, id)) = &id {
        parts.push(format!("({id})"));
    }
    let details: Vec<String> = candidate
        .iter()
        .filter(|(key, value)| {
            !NAME_FIELDS.contains(&key.as_str())
                && id.as_ref().map_or(true, |(id_key, _)| id_key != *key)
                && is_present(value)
                && !value.is_array()
                && !value.is_object()
        })
        .map(|(_, value)| cell(Some(value)))
        .collect();
    if !details.is_empty() {
        parts.push(format!("- {}", details.join(", ")));
    }

    if parts.is_empty() {
        "(unnamed record)".to_string()
    } else {
        parts.join(" ")
    }
}

fn compose_empty(
    user_text: &str,
    entity: &str,
    envelope: &ToolResultEnvelope,
    attempts: &MatchAttempts,
    capabilities: &Capabilities,
) -> ComposedResponse {
    let name = envelope
        .query
        .as_ref()
        .and_then(|query| query.entity_name.clone().or_else(|| query.identifier.clone()))
        .unwrap_or_else(|| user_text.trim().to_string());
    let label = display_entity(entity);

    let mut lines = vec![format!("No {label} named '{name}' was found.")];

    let mut tried = Vec::new();
    if attempts.exact {
        tried.push("exact match");
    }
    if attempts.fuzzy {
        tried.push("fuzzy match");
    }
    if attempts.schema_refreshed {
        tried.push("schema refresh and retry");
    }
    if !tried.is_empty() {
        lines.push(format!("I tried: {}.", tried.join(", ")));
    }

    let mut steps = vec![format!("Try a broader search for part of the {label} name.")];
    let mut hints = Map::new();
    if capabilities.can_create(entity) {
        steps.push(format!("Create {label} \"{name}\""));
        hints.insert(
            "create".to_string(),
            json!({ "entity_type": entity, "prefill": { "display_name": name } }),
        );
    }
    lines.push("Next steps:".to_string());
    lines.extend(steps.iter().map(|step| format!("- {step}")));
    hints.insert("next_steps".to_string(), json!(steps));

    ComposedResponse {
        text: lines.join("\n"),
        ui_hints: Some(Value::Object(hints)),
        severity: Severity::Warning,
    }
}

fn compose_error(code: &str) -> ComposedResponse {
    let normalized = code.trim().to_ascii_lowercase();
    let text = match normalized.as_str() {
        "validation" | "validation_error" | "invalid_input" | "bad_request" => {
            "The request had invalid or missing details. Please check the values and try again."
                .to_string()
        }
        "permission" | "permission_denied" | "forbidden" | "unauthorized" => {
            "You don't have permission to do that. Ask an administrator for access.".to_string()
        }
        "schema_drift" | "schema_mismatch" | "schema_error" => {
            "The data source has changed in a way I can't handle yet. An administrator needs to review the integration."
                .to_string()
        }
        _ => format!("Something went wrong on our side (error code: {}). Please try again later.", code.trim()),
    };

    ComposedResponse {
        text,
        ui_hints: Some(json!({ "error_code": normalized })),
        severity: Severity::Error,
    }
}

fn first_name_like(row: &EnvelopeRow) -> Option<String> {
    NAME_FIELDS.iter().find_map(|field| {
        row.get(*field).and_then(Value::as_str).map(str::trim).filter(|name| !name.is_empty()).map(str::to_string)
    })
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(text) => !text.trim().is_empty(),
        _ => true,
    }
}

fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}
