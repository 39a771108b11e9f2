use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::idempotency::ConflictPolicy;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub server: ServerConfig,
    pub tools: ToolsConfig,
    pub memory: MemoryConfig,
    pub idempotency: IdempotencyConfig,
    pub confirmation: ConfirmationConfig,
    pub service_account: ServiceAccountConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

/// Where the business-action backend lives and which of its tools are exposed.
#[derive(Clone, Debug)]
pub struct ToolsConfig {
    pub base_url: Option<String>,
    pub enabled: Vec<String>,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct MemoryConfig {
    pub max_messages: usize,
    pub recent_window: usize,
    pub highlight_chars: usize,
}

#[derive(Clone, Debug)]
pub struct IdempotencyConfig {
    pub conflict_policy: ConflictPolicy,
}

#[derive(Clone, Debug)]
pub struct ConfirmationConfig {
    pub secret: SecretString,
}

#[derive(Clone, Debug)]
pub struct ServiceAccountConfig {
    pub user_id: String,
    pub company_id: Option<String>,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    OpenAi,
    Anthropic,
    Ollama,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub tools_base_url: Option<String>,
    pub conflict_policy: Option<ConflictPolicy>,
    pub confirmation_secret: Option<String>,
    pub server_port: Option<u16>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://opsdesk.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: Some("http://localhost:11434".to_string()),
                model: "llama3.1".to_string(),
                timeout_secs: 30,
                max_retries: 2,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            tools: ToolsConfig { base_url: None, enabled: Vec::new(), timeout_secs: 30 },
            memory: MemoryConfig { max_messages: 60, recent_window: 20, highlight_chars: 160 },
            idempotency: IdempotencyConfig { conflict_policy: ConflictPolicy::Overwrite },
            confirmation: ConfirmationConfig { secret: String::new().into() },
            service_account: ServiceAccountConfig {
                user_id: "opsdesk-service".to_string(),
                company_id: None,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" | "open_ai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected openai|anthropic|ollama)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("opsdesk.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(max_retries) = llm.max_retries {
                self.llm.max_retries = max_retries;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(tools) = patch.tools {
            if let Some(base_url) = tools.base_url {
                self.tools.base_url = Some(base_url);
            }
            if let Some(enabled) = tools.enabled {
                self.tools.enabled = enabled;
            }
            if let Some(timeout_secs) = tools.timeout_secs {
                self.tools.timeout_secs = timeout_secs;
            }
        }

        if let Some(memory) = patch.memory {
            if let Some(max_messages) = memory.max_messages {
                self.memory.max_messages = max_messages;
            }
            if let Some(recent_window) = memory.recent_window {
                self.memory.recent_window = recent_window;
            }
            if let Some(highlight_chars) = memory.highlight_chars {
                self.memory.highlight_chars = highlight_chars;
            }
        }

        if let Some(idempotency) = patch.idempotency {
            if let Some(conflict_policy) = idempotency.conflict_policy {
                self.idempotency.conflict_policy = conflict_policy;
            }
        }

        if let Some(confirmation) = patch.confirmation {
            if let Some(secret) = confirmation.secret {
                self.confirmation.secret = secret_value(secret);
            }
        }

        if let Some(service_account) = patch.service_account {
            if let Some(user_id) = service_account.user_id {
                self.service_account.user_id = user_id;
            }
            if let Some(company_id) = service_account.company_id {
                self.service_account.company_id = Some(company_id);
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("OPSDESK_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("OPSDESK_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_number("OPSDESK_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("OPSDESK_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_number("OPSDESK_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("OPSDESK_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("OPSDESK_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("OPSDESK_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("OPSDESK_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("OPSDESK_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_number("OPSDESK_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("OPSDESK_LLM_MAX_RETRIES") {
            self.llm.max_retries = parse_number("OPSDESK_LLM_MAX_RETRIES", &value)?;
        }

        if let Some(value) = read_env("OPSDESK_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("OPSDESK_SERVER_PORT") {
            self.server.port = parse_number("OPSDESK_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("OPSDESK_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_number("OPSDESK_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("OPSDESK_TOOLS_BASE_URL") {
            self.tools.base_url = Some(value);
        }
        if let Some(value) = read_env("OPSDESK_TOOLS_ENABLED") {
            self.tools.enabled = value
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(value) = read_env("OPSDESK_TOOLS_TIMEOUT_SECS") {
            self.tools.timeout_secs = parse_number("OPSDESK_TOOLS_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("OPSDESK_MEMORY_MAX_MESSAGES") {
            self.memory.max_messages = parse_number("OPSDESK_MEMORY_MAX_MESSAGES", &value)?;
        }
        if let Some(value) = read_env("OPSDESK_MEMORY_RECENT_WINDOW") {
            self.memory.recent_window = parse_number("OPSDESK_MEMORY_RECENT_WINDOW", &value)?;
        }

        if let Some(value) = read_env("OPSDESK_IDEMPOTENCY_CONFLICT_POLICY") {
            self.idempotency.conflict_policy = value.parse().map_err(|_| {
                ConfigError::InvalidEnvOverride {
                    key: "OPSDESK_IDEMPOTENCY_CONFLICT_POLICY".to_string(),
                    value: value.clone(),
                }
            })?;
        }

        if let Some(value) = read_env("OPSDESK_CONFIRMATION_SECRET") {
            self.confirmation.secret = secret_value(value);
        }

        if let Some(value) = read_env("OPSDESK_SERVICE_ACCOUNT_USER_ID") {
            self.service_account.user_id = value;
        }
        if let Some(value) = read_env("OPSDESK_SERVICE_ACCOUNT_COMPANY_ID") {
            self.service_account.company_id = Some(value);
        }

        let log_level =
            read_env("OPSDESK_LOGGING_LEVEL").or_else(|| read_env("OPSDESK_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("OPSDESK_LOGGING_FORMAT").or_else(|| read_env("OPSDESK_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(tools_base_url) = overrides.tools_base_url {
            self.tools.base_url = Some(tools_base_url);
        }
        if let Some(conflict_policy) = overrides.conflict_policy {
            self.idempotency.conflict_policy = conflict_policy;
        }
        if let Some(confirmation_secret) = overrides.confirmation_secret {
            self.confirmation.secret = secret_value(confirmation_secret);
        }
        if let Some(server_port) = overrides.server_port {
            self.server.port = server_port;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_llm(&self.llm)?;
        validate_server(&self.server)?;
        validate_tools(&self.tools)?;
        validate_memory(&self.memory)?;
        validate_confirmation(&self.confirmation)?;
        validate_service_account(&self.service_account)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("opsdesk.toml"), PathBuf::from("config/opsdesk.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    match llm.provider {
        LlmProvider::OpenAi | LlmProvider::Anthropic => {
            let missing = llm
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.api_key is required for openai/anthropic providers".to_string(),
                ));
            }
        }
        LlmProvider::Ollama => {
            let missing =
                llm.base_url.as_ref().map(|value| value.trim().is_empty()).unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.base_url is required for ollama provider".to_string(),
                ));
            }
        }
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_tools(tools: &ToolsConfig) -> Result<(), ConfigError> {
    if let Some(base_url) = &tools.base_url {
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::Validation(
                "tools.base_url must start with http:// or https://".to_string(),
            ));
        }
    }

    if tools.timeout_secs == 0 || tools.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "tools.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_memory(memory: &MemoryConfig) -> Result<(), ConfigError> {
    if memory.recent_window == 0 {
        return Err(ConfigError::Validation(
            "memory.recent_window must be greater than zero".to_string(),
        ));
    }

    if memory.max_messages <= memory.recent_window {
        return Err(ConfigError::Validation(
            "memory.max_messages must be greater than memory.recent_window".to_string(),
        ));
    }

    if memory.highlight_chars < 16 {
        return Err(ConfigError::Validation(
            "memory.highlight_chars must be at least 16".to_string(),
        ));
    }

    Ok(())
}

fn validate_confirmation(confirmation: &ConfirmationConfig) -> Result<(), ConfigError> {
    let secret = confirmation.secret.expose_secret();
    if secret.trim().is_empty() {
        return Err(ConfigError::Validation(
            "confirmation.secret is required (set OPSDESK_CONFIRMATION_SECRET)".to_string(),
        ));
    }
    if secret.len() < 16 {
        return Err(ConfigError::Validation(
            "confirmation.secret must be at least 16 bytes long".to_string(),
        ));
    }
    Ok(())
}

fn validate_service_account(service_account: &ServiceAccountConfig) -> Result<(), ConfigError> {
    if service_account.user_id.trim().is_empty() {
        return Err(ConfigError::Validation(
            "service_account.user_id must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    llm: Option<LlmPatch>,
    server: Option<ServerPatch>,
    tools: Option<ToolsPatch>,
    memory: Option<MemoryPatch>,
    idempotency: Option<IdempotencyPatch>,
    confirmation: Option<ConfirmationPatch>,
    service_account: Option<ServiceAccountPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ToolsPatch {
    base_url: Option<String>,
    enabled: Option<Vec<String>>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct MemoryPatch {
    max_messages: Option<usize>,
    recent_window: Option<usize>,
    highlight_chars: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct IdempotencyPatch {
    conflict_policy: Option<ConflictPolicy>,
}

#[derive(Debug, Default, Deserialize)]
struct ConfirmationPatch {
    secret: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ServiceAccountPatch {
    user_id: Option<String>,
    company_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};
    use crate::domain::idempotency::ConflictPolicy;

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    const TEST_SECRET: &str = "unit-test-confirmation-secret";

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_OPSDESK_SECRET", TEST_SECRET);

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("opsdesk.toml");
            fs::write(
                &path,
                r#"
[confirmation]
secret = "${TEST_OPSDESK_SECRET}"

[memory]
max_messages = 80
recent_window = 25
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.confirmation.secret.expose_secret() == TEST_SECRET,
                "confirmation secret should be interpolated from environment",
            )?;
            ensure(config.memory.max_messages == 80, "memory ceiling should come from file")?;
            ensure(config.memory.recent_window == 25, "recent window should come from file")?;
            Ok(())
        })();

        clear_vars(&["TEST_OPSDESK_SECRET"]);
        result
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("OPSDESK_CONFIRMATION_SECRET", TEST_SECRET);
        env::set_var("OPSDESK_LOG_LEVEL", "warn");
        env::set_var("OPSDESK_LOG_FORMAT", "pretty");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Pretty),
                "pretty logging format should be set from env var",
            )?;
            Ok(())
        })();

        clear_vars(&["OPSDESK_CONFIRMATION_SECRET", "OPSDESK_LOG_LEVEL", "OPSDESK_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("OPSDESK_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("OPSDESK_IDEMPOTENCY_CONFLICT_POLICY", "reject");
        env::set_var("OPSDESK_TOOLS_ENABLED", "create_quote, search_documentation");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("opsdesk.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[confirmation]
secret = "file-confirmation-secret"

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(
                config.idempotency.conflict_policy == ConflictPolicy::Reject,
                "env conflict policy should win over defaults",
            )?;
            ensure(
                config.tools.enabled == vec!["create_quote", "search_documentation"],
                "enabled tools should be split and trimmed",
            )?;
            Ok(())
        })();

        clear_vars(&[
            "OPSDESK_DATABASE_URL",
            "OPSDESK_IDEMPOTENCY_CONFLICT_POLICY",
            "OPSDESK_TOOLS_ENABLED",
        ]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let error = match AppConfig::load(LoadOptions::default()) {
            Ok(_) => {
                return Err("expected validation failure but config load succeeded".to_string())
            }
            Err(error) => error,
        };
        let has_message = matches!(
            error,
            ConfigError::Validation(ref message) if message.contains("confirmation.secret")
        );
        ensure(has_message, "validation failure should mention confirmation.secret")
    }

    #[test]
    fn memory_window_must_fit_under_ceiling() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("OPSDESK_CONFIRMATION_SECRET", TEST_SECRET);
        env::set_var("OPSDESK_MEMORY_RECENT_WINDOW", "60");

        let result = match AppConfig::load(LoadOptions::default()) {
            Ok(_) => Err("expected memory validation failure".to_string()),
            Err(ConfigError::Validation(message)) => ensure(
                message.contains("memory.max_messages"),
                "validation failure should mention memory.max_messages",
            ),
            Err(other) => Err(format!("unexpected error: {other}")),
        };

        clear_vars(&["OPSDESK_CONFIRMATION_SECRET", "OPSDESK_MEMORY_RECENT_WINDOW"]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("OPSDESK_CONFIRMATION_SECRET", "confirmation-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(
                !debug.contains("confirmation-secret-value"),
                "debug output should not contain the confirmation secret",
            )?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )?;
            ensure(config.memory.max_messages == 60, "default memory ceiling should be 60")?;
            ensure(config.memory.recent_window == 20, "default recent window should be 20")?;
            Ok(())
        })();

        clear_vars(&["OPSDESK_CONFIRMATION_SECRET"]);
        result
    }
}
