use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use opsdesk_core::canonical::hash_json;
use opsdesk_core::domain::conversation::SessionId;
use opsdesk_core::domain::idempotency::{ConflictPolicy, IdempotencyKey, IdempotencyScope};
use opsdesk_core::errors::DomainError;
use opsdesk_db::IdempotencyStore;

use crate::classifier::{BusinessEntity, PickupField, VerbFamily, SEARCH_DOCUMENTATION};

pub const IDEMPOTENCY_KEY_ARG: &str = "idempotency_key";

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    async fn execute(&self, input: Value) -> Result<Value>;
}

/// Adapts an async closure into a [`Tool`].
pub struct FnTool<F> {
    name: String,
    handler: F,
}

impl<F> FnTool<F> {
    pub fn new(name: impl Into<String>, handler: F) -> Self {
        Self { name: name.into(), handler }
    }
}

#[async_trait]
impl<F, Fut> Tool for FnTool<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, input: Value) -> Result<Value> {
        (self.handler)(input).await
    }
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn register<T>(&mut self, tool: T)
    where
        T: Tool + 'static,
    {
        self.register_shared(Arc::new(tool));
    }

    pub fn register_shared(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Request-scoped identity handed to the provider that builds the registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolContext {
    pub session_id: SessionId,
    pub user_id: Option<String>,
    pub company_id: Option<String>,
    pub idempotency_key: String,
}

/// Builds the set of business actions available to one turn.
pub trait ToolProvider: Send + Sync {
    fn registry_for(&self, context: &ToolContext) -> ToolRegistry;
}

/// Serves the same tools to every turn.
#[derive(Clone, Default)]
pub struct StaticToolProvider {
    registry: ToolRegistry,
}

impl StaticToolProvider {
    pub fn new(registry: ToolRegistry) -> Self {
        Self { registry }
    }
}

impl ToolProvider for StaticToolProvider {
    fn registry_for(&self, _context: &ToolContext) -> ToolRegistry {
        self.registry.clone()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
}

impl ArgType {
    fn describe(&self) -> &'static str {
        match self {
            Self::String => "a string",
            Self::Integer => "an integer",
            Self::Number => "a number",
            Self::Boolean => "a boolean",
            Self::Object => "an object",
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldRule {
    pub name: &'static str,
    pub kind: ArgType,
    pub required: bool,
    pub non_empty: bool,
}

/// Ordered field rules for one tool. Unknown fields are passed through.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ArgSchema {
    fields: Vec<FieldRule>,
}

impl ArgSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required_text(mut self, name: &'static str) -> Self {
        self.fields.push(FieldRule { name, kind: ArgType::String, required: true, non_empty: true });
        self
    }

    pub fn optional(mut self, name: &'static str, kind: ArgType) -> Self {
        self.fields.push(FieldRule { name, kind, required: false, non_empty: false });
        self
    }

    pub fn required(mut self, name: &'static str, kind: ArgType) -> Self {
        self.fields.push(FieldRule { name, kind, required: true, non_empty: false });
        self
    }

    /// Returns the first violation in declaration order.
    pub fn validate(&self, args: &Value) -> std::result::Result<(), String> {
        let Some(object) = args.as_object() else {
            return Err("arguments must be a JSON object".to_string());
        };

        for rule in &self.fields {
            match object.get(rule.name) {
                None | Some(Value::Null) if rule.required => {
                    return Err(format!("`{}` is required", rule.name));
                }
                None | Some(Value::Null) => {}
                Some(value) if !rule.kind.accepts(value) => {
                    return Err(format!("`{}` must be {}", rule.name, rule.kind.describe()));
                }
                Some(Value::String(text)) if rule.non_empty && text.trim().is_empty() => {
                    return Err(format!("`{}` must not be empty", rule.name));
                }
                Some(_) => {}
            }
        }

        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolSpec {
    pub name: String,
    /// Completes "Failed to ..." in user-facing failure messages.
    pub action: String,
    pub side_effecting: bool,
    pub schema: ArgSchema,
}

#[derive(Clone, Debug, Default)]
pub struct ToolCatalog {
    specs: BTreeMap<String, ToolSpec>,
}

impl ToolCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Every tool the classifier can route to.
    pub fn standard() -> Self {
        let mut catalog = Self::default();

        catalog.insert(ToolSpec {
            name: SEARCH_DOCUMENTATION.to_string(),
            action: "search the documentation".to_string(),
            side_effecting: false,
            schema: ArgSchema::new().required_text("query").optional("k", ArgType::Integer),
        });

        for entity in BusinessEntity::PRECEDENCE {
            for verb in VerbFamily::PRECEDENCE {
                let mut schema = ArgSchema::new().required_text("request");
                schema = match verb {
                    VerbFamily::Update | VerbFamily::Close => schema.required_text("reference"),
                    VerbFamily::Create | VerbFamily::Email => {
                        schema.optional("reference", ArgType::String)
                    }
                };
                if verb == VerbFamily::Email {
                    schema = schema.optional("recipient", ArgType::String);
                }
                catalog.insert(ToolSpec {
                    name: format!("{}_{}", verb.prefix(), entity.slug()),
                    action: format!("{} the {}", verb.prefix(), entity.label()),
                    side_effecting: true,
                    schema: schema.optional(IDEMPOTENCY_KEY_ARG, ArgType::String),
                });
            }
        }

        for (name, action, side_effecting) in [
            ("start_vendor_call", "start the vendor call", true),
            ("poll_vendor_call", "check the vendor call status", false),
            ("send_vendor_call_email", "send the vendor call follow-up email", true),
        ] {
            catalog.insert(ToolSpec {
                name: name.to_string(),
                action: action.to_string(),
                side_effecting,
                schema: ArgSchema::new()
                    .required_text("request")
                    .optional("reference", ArgType::String)
                    .optional(IDEMPOTENCY_KEY_ARG, ArgType::String),
            });
        }

        for field in PickupField::PRECEDENCE {
            catalog.insert(ToolSpec {
                name: field.tool_name(),
                action: format!("update the pickup {}", field.as_str()),
                side_effecting: true,
                schema: ArgSchema::new()
                    .required_text("value")
                    .optional("reference", ArgType::String)
                    .optional(IDEMPOTENCY_KEY_ARG, ArgType::String),
            });
        }

        catalog.insert(ToolSpec {
            name: "create_task".to_string(),
            action: "create the task".to_string(),
            side_effecting: true,
            schema: ArgSchema::new()
                .required_text("title")
                .optional("body", ArgType::String)
                .optional(IDEMPOTENCY_KEY_ARG, ArgType::String),
        });

        catalog
    }

    pub fn insert(&mut self, spec: ToolSpec) {
        self.specs.insert(spec.name.clone(), spec);
    }

    pub fn with_spec(mut self, spec: ToolSpec) -> Self {
        self.insert(spec);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.specs.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.specs.keys().map(String::as_str)
    }

    /// Human description of a tool's action, with a fallback for unknown tools.
    pub fn action_for(&self, name: &str) -> String {
        self.get(name)
            .map(|spec| spec.action.clone())
            .unwrap_or_else(|| format!("run {}", name.replace('_', " ")))
    }

    pub fn validate(&self, name: &str, args: &Value) -> std::result::Result<(), DomainError> {
        let Some(spec) = self.get(name) else {
            return Ok(());
        };
        spec.schema.validate(args).map_err(|violation| DomainError::InvalidToolArguments {
            tool: name.to_string(),
            violation,
        })
    }

    pub fn is_side_effecting(&self, name: &str) -> bool {
        self.get(name).map(|spec| spec.side_effecting).unwrap_or(false)
    }
}

/// Adds the idempotency key unless the caller already supplied one.
pub fn inject_idempotency_key(args: Value, key: &str) -> Value {
    match args {
        Value::Object(mut object) => {
            object
                .entry(IDEMPOTENCY_KEY_ARG.to_string())
                .or_insert_with(|| Value::from(key.to_string()));
            Value::Object(object)
        }
        other => other,
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExecutionOutcome {
    pub response: Value,
    pub replayed: bool,
}

/// Runs side-effecting tools at most once per `(tool, idempotency key)`.
///
/// A stored response for the same key and request fingerprint is replayed
/// without calling the tool. Calls for the same key are serialized in
/// process so concurrent duplicates replay rather than execute twice.
pub struct IdempotentExecutor {
    store: Arc<dyn IdempotencyStore>,
    policy: ConflictPolicy,
    in_flight: Mutex<HashMap<(String, String), Weak<tokio::sync::Mutex<()>>>>,
}

impl IdempotentExecutor {
    pub fn new(store: Arc<dyn IdempotencyStore>, policy: ConflictPolicy) -> Self {
        Self { store, policy, in_flight: Mutex::new(HashMap::new()) }
    }

    pub async fn execute(&self, tool: &dyn Tool, args: Value) -> Result<ExecutionOutcome> {
        let Some(key) = args.get(IDEMPOTENCY_KEY_ARG).and_then(Value::as_str).map(str::to_string)
        else {
            let response = tool.execute(args).await?;
            return Ok(ExecutionOutcome { response, replayed: false });
        };

        let scope = IdempotencyScope(tool.name().to_string());
        let key = IdempotencyKey(key);
        let request_hash = hash_json(&fingerprint_args(&args))?;

        let slot = self.slot_for(&scope, &key);
        let _guard = slot.lock().await;

        match self.store.get(&scope, &key).await {
            Ok(Some(record)) if record.request_hash == request_hash => {
                debug!(
                    event_name = "agent.idempotency.replay",
                    tool = %scope.0,
                    idempotency_key = %key.0,
                    "replaying stored tool response"
                );
                return Ok(ExecutionOutcome { response: record.response, replayed: true });
            }
            Ok(Some(_)) if self.policy == ConflictPolicy::Reject => {
                return Err(DomainError::IdempotencyConflict { scope: scope.0, key: key.0 }.into());
            }
            Ok(Some(_)) => {
                warn!(
                    event_name = "agent.idempotency.overwrite",
                    tool = %scope.0,
                    idempotency_key = %key.0,
                    "idempotency key reused with a different request; executing again"
                );
            }
            Ok(None) => {}
            Err(error) => {
                warn!(
                    event_name = "agent.idempotency.lookup_failed",
                    tool = %scope.0,
                    idempotency_key = %key.0,
                    error = %error,
                    "idempotency lookup failed; executing without replay protection"
                );
            }
        }

        let response = tool.execute(args).await?;

        if let Err(error) = self.store.put(&scope, &key, &request_hash, &response).await {
            warn!(
                event_name = "agent.idempotency.store_failed",
                tool = %scope.0,
                idempotency_key = %key.0,
                error = %error,
                "tool executed but its response could not be stored"
            );
        }

        Ok(ExecutionOutcome { response, replayed: false })
    }

    fn slot_for(
        &self,
        scope: &IdempotencyScope,
        key: &IdempotencyKey,
    ) -> Arc<tokio::sync::Mutex<()>> {
        let mut in_flight = match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        in_flight.retain(|_, slot| slot.strong_count() > 0);

        let id = (scope.0.clone(), key.0.clone());
        if let Some(existing) = in_flight.get(&id).and_then(Weak::upgrade) {
            return existing;
        }
        let slot = Arc::new(tokio::sync::Mutex::new(()));
        in_flight.insert(id, Arc::downgrade(&slot));
        slot
    }
}

/// The request fingerprint excludes the key itself.
fn fingerprint_args(args: &Value) -> Value {
    match args {
        Value::Object(object) => Value::Object(
            object
                .iter()
                .filter(|(name, _)| name.as_str() != IDEMPOTENCY_KEY_ARG)
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect::<Map<String, Value>>(),
        ),
        other => other.clone(),
    }
}
