use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub server: ServerConfig,
    pub gateway: GatewayConfig,
    pub oauth: OauthConfig,
    pub worker: WorkerConfig,
    pub logging: LoggingConfig,
    pub messages: Messages,
    pub prompts: Prompts,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: SecretString,
    pub dbname: String,
    pub sslmode: String,
    pub schema: String,
    pub max_open_conns: u32,
    pub max_idle_conns: u32,
    pub conn_max_lifetime_secs: u64,
}

impl DatabaseConfig {
    /// Postgres connection URL. The schema lands in `options` so every
    /// session's `search_path` points at it.
    pub fn url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}&options=-csearch_path%3D{}",
            self.user,
            self.password.expose_secret(),
            self.host,
            self.port,
            self.dbname,
            self.sslmode,
            self.schema,
        )
    }
}

/// Per-operation model settings. Classification, extraction and
/// normalization share `semantic`; reply generation and summaries share
/// `dialogue`.
#[derive(Clone, Debug)]
pub struct ModelConfig {
    pub model: String,
    pub temperature: f64,
    pub max_completion_tokens: u32,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: SecretString,
    pub timeout_secs: u64,
    pub semantic: ModelConfig,
    pub dialogue: ModelConfig,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub api_prefix: String,
    pub web_prefix: String,
    pub jwt_secret: SecretString,
    /// Accept `x-user-id` as a fallback identity when no valid bearer token
    /// is presented. Development convenience; off by default.
    pub allow_header_fallback: bool,
}

impl ServerConfig {
    /// Normalized API prefix: no trailing slash, `/api` when unset.
    pub fn api_prefix(&self) -> String {
        let trimmed = self.api_prefix.trim().trim_matches('/');
        if trimmed.is_empty() {
            "/api".to_string()
        } else {
            format!("/{trimmed}")
        }
    }
}

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub ws_url: String,
    pub app_id: String,
    pub app_secret: SecretString,
}

#[derive(Clone, Debug)]
pub struct OauthConfig {
    /// Base URL of the chat platform's open API; the token and user-info
    /// endpoints derive from it.
    pub base_url: String,
}

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub worker_size: usize,
    pub queue_capacity: usize,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
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

/// Canned reply strings. Defaults are the production wording; deployments
/// override them per tenant.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Messages {
    pub new_user: String,
    pub welcome_back: String,
    pub continue_session: String,
    pub new_dialog: String,
    pub asking_other_customers: String,
    pub outputting_confirm: String,
    pub outputting_ended: String,
    pub system_error: String,
    pub process_error: String,
    pub text_only: String,
    pub parse_error: String,
}

impl Default for Messages {
    fn default() -> Self {
        Self {
            new_user: "你好，我是跟进记录助手，随时可以把今天的客户跟进情况说给我听。".to_string(),
            welcome_back: "欢迎回来，有新的客户跟进情况要整理吗？".to_string(),
            continue_session: "我们接着上次的记录继续吧。".to_string(),
            new_dialog: "有新的客户跟进情况要整理吗？直接说就行。".to_string(),
            asking_other_customers: "这位客户的跟进记录已经确认，还有其他客户要补充吗？"
                .to_string(),
            outputting_confirm: "好的，所有跟进记录已经整理完毕，我来帮你保存。".to_string(),
            outputting_ended: "对话已结束，如果有新的客户跟进情况要整理，再找我~".to_string(),
            system_error: "系统开小差了，请稍后再试。".to_string(),
            process_error: "抱歉，我遇到了一些问题，请稍后再试。".to_string(),
            text_only: "抱歉，我只能处理文本消息".to_string(),
            parse_error: "消息解析失败，请重新发送".to_string(),
        }
    }
}

/// Prompt templates for the seven LLM operations. All external
/// configuration; empty templates disable the classification they belong to.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Prompts {
    pub is_customer_follow_related: String,
    pub is_user_confirmation: String,
    pub is_user_no_more_customers: String,
    pub semantic_analysis: String,
    pub dialogue_collecting: String,
    pub dialogue_confirming: String,
    pub customer_summary: String,
    pub entity_normalization: String,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_host: Option<String>,
    pub database_dbname: Option<String>,
    pub llm_base_url: Option<String>,
    pub llm_api_key: Option<String>,
    pub jwt_secret: Option<String>,
    pub log_level: Option<String>,
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
                host: "localhost".to_string(),
                port: 5432,
                user: "salesnote".to_string(),
                password: SecretString::from(String::new()),
                dbname: "salesnote".to_string(),
                sslmode: "disable".to_string(),
                schema: "sale".to_string(),
                max_open_conns: 10,
                max_idle_conns: 5,
                conn_max_lifetime_secs: 1800,
            },
            llm: LlmConfig {
                base_url: "https://api.openai.com/v1".to_string(),
                api_key: SecretString::from(String::new()),
                timeout_secs: 60,
                semantic: ModelConfig {
                    model: "gpt-4o-mini".to_string(),
                    temperature: 0.1,
                    max_completion_tokens: 2048,
                },
                dialogue: ModelConfig {
                    model: "gpt-4o".to_string(),
                    temperature: 0.7,
                    max_completion_tokens: 1024,
                },
            },
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                read_timeout_secs: 30,
                write_timeout_secs: 30,
                idle_timeout_secs: 120,
                api_prefix: "/api".to_string(),
                web_prefix: "/".to_string(),
                jwt_secret: SecretString::from(String::new()),
                allow_header_fallback: false,
            },
            gateway: GatewayConfig {
                ws_url: String::new(),
                app_id: String::new(),
                app_secret: SecretString::from(String::new()),
            },
            oauth: OauthConfig { base_url: "https://open.feishu.cn".to_string() },
            worker: WorkerConfig { worker_size: 5, queue_capacity: 100 },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
            messages: Messages::default(),
            prompts: Prompts::default(),
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
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("salesnote.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            apply(&mut self.database.host, database.host);
            apply(&mut self.database.port, database.port);
            apply(&mut self.database.user, database.user);
            if let Some(password) = database.password {
                self.database.password = SecretString::from(password);
            }
            apply(&mut self.database.dbname, database.dbname);
            apply(&mut self.database.sslmode, database.sslmode);
            apply(&mut self.database.schema, database.schema);
            apply(&mut self.database.max_open_conns, database.max_open_conns);
            apply(&mut self.database.max_idle_conns, database.max_idle_conns);
            apply(&mut self.database.conn_max_lifetime_secs, database.conn_max_lifetime_secs);
        }

        if let Some(llm) = patch.llm {
            apply(&mut self.llm.base_url, llm.base_url);
            if let Some(api_key) = llm.api_key {
                self.llm.api_key = SecretString::from(api_key);
            }
            apply(&mut self.llm.timeout_secs, llm.timeout_secs);
            if let Some(semantic) = llm.semantic {
                apply_model(&mut self.llm.semantic, semantic);
            }
            if let Some(dialogue) = llm.dialogue {
                apply_model(&mut self.llm.dialogue, dialogue);
            }
        }

        if let Some(server) = patch.server {
            apply(&mut self.server.host, server.host);
            apply(&mut self.server.port, server.port);
            apply(&mut self.server.read_timeout_secs, server.read_timeout_secs);
            apply(&mut self.server.write_timeout_secs, server.write_timeout_secs);
            apply(&mut self.server.idle_timeout_secs, server.idle_timeout_secs);
            apply(&mut self.server.api_prefix, server.api_prefix);
            apply(&mut self.server.web_prefix, server.web_prefix);
            if let Some(jwt_secret) = server.jwt_secret {
                self.server.jwt_secret = SecretString::from(jwt_secret);
            }
            apply(&mut self.server.allow_header_fallback, server.allow_header_fallback);
        }

        if let Some(gateway) = patch.gateway {
            apply(&mut self.gateway.ws_url, gateway.ws_url);
            apply(&mut self.gateway.app_id, gateway.app_id);
            if let Some(app_secret) = gateway.app_secret {
                self.gateway.app_secret = SecretString::from(app_secret);
            }
        }

        if let Some(oauth) = patch.oauth {
            apply(&mut self.oauth.base_url, oauth.base_url);
        }

        if let Some(worker) = patch.worker {
            apply(&mut self.worker.worker_size, worker.worker_size);
            apply(&mut self.worker.queue_capacity, worker.queue_capacity);
        }

        if let Some(logging) = patch.logging {
            apply(&mut self.logging.level, logging.level);
            apply(&mut self.logging.format, logging.format);
        }

        if let Some(messages) = patch.messages {
            self.messages = messages;
        }
        if let Some(prompts) = patch.prompts {
            self.prompts = prompts;
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("SALESNOTE_DATABASE_HOST") {
            self.database.host = value;
        }
        if let Some(value) = read_env("SALESNOTE_DATABASE_PORT") {
            self.database.port = parse_u16("SALESNOTE_DATABASE_PORT", &value)?;
        }
        if let Some(value) = read_env("SALESNOTE_DATABASE_USER") {
            self.database.user = value;
        }
        if let Some(value) = read_env("SALESNOTE_DATABASE_PASSWORD") {
            self.database.password = SecretString::from(value);
        }
        if let Some(value) = read_env("SALESNOTE_DATABASE_DBNAME") {
            self.database.dbname = value;
        }
        if let Some(value) = read_env("SALESNOTE_LLM_BASE_URL") {
            self.llm.base_url = value;
        }
        if let Some(value) = read_env("SALESNOTE_LLM_API_KEY") {
            self.llm.api_key = SecretString::from(value);
        }
        if let Some(value) = read_env("SALESNOTE_SERVER_PORT") {
            self.server.port = parse_u16("SALESNOTE_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("SALESNOTE_SERVER_JWT_SECRET") {
            self.server.jwt_secret = SecretString::from(value);
        }
        if let Some(value) = read_env("SALESNOTE_GATEWAY_APP_SECRET") {
            self.gateway.app_secret = SecretString::from(value);
        }
        if let Some(value) = read_env("SALESNOTE_LOG_LEVEL") {
            self.logging.level = value;
        }
        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(host) = overrides.database_host {
            self.database.host = host;
        }
        if let Some(dbname) = overrides.database_dbname {
            self.database.dbname = dbname;
        }
        if let Some(base_url) = overrides.llm_base_url {
            self.llm.base_url = base_url;
        }
        if let Some(api_key) = overrides.llm_api_key {
            self.llm.api_key = SecretString::from(api_key);
        }
        if let Some(jwt_secret) = overrides.jwt_secret {
            self.server.jwt_secret = SecretString::from(jwt_secret);
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.max_open_conns == 0 {
            return Err(ConfigError::Validation(
                "database.max_open_conns must be greater than zero".to_string(),
            ));
        }
        if self.database.max_idle_conns > self.database.max_open_conns {
            return Err(ConfigError::Validation(
                "database.max_idle_conns must not exceed database.max_open_conns".to_string(),
            ));
        }
        if self.llm.base_url.trim().is_empty() {
            return Err(ConfigError::Validation("llm.base_url is required".to_string()));
        }
        if self.llm.timeout_secs == 0 || self.llm.timeout_secs > 300 {
            return Err(ConfigError::Validation(
                "llm.timeout_secs must be in range 1..=300".to_string(),
            ));
        }
        if self.server.port == 0 {
            return Err(ConfigError::Validation(
                "server.port must be greater than zero".to_string(),
            ));
        }
        let secret = self.server.jwt_secret.expose_secret();
        if !secret.is_empty() && secret.len() < 16 {
            return Err(ConfigError::Validation(
                "server.jwt_secret must be at least 16 bytes when set".to_string(),
            ));
        }
        if self.worker.worker_size == 0 {
            return Err(ConfigError::Validation(
                "worker.worker_size must be greater than zero".to_string(),
            ));
        }
        if self.worker.queue_capacity == 0 {
            return Err(ConfigError::Validation(
                "worker.queue_capacity must be greater than zero".to_string(),
            ));
        }
        let level = self.logging.level.trim().to_ascii_lowercase();
        match level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
            _ => Err(ConfigError::Validation(
                "logging.level must be one of trace|debug|info|warn|error".to_string(),
            )),
        }
    }
}

fn apply<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn apply_model(slot: &mut ModelConfig, patch: ModelPatch) {
    apply(&mut slot.model, patch.model);
    apply(&mut slot.temperature, patch.temperature);
    apply(&mut slot.max_completion_tokens, patch.max_completion_tokens);
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("salesnote.toml"), PathBuf::from("config/salesnote.toml")]
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

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    llm: Option<LlmPatch>,
    server: Option<ServerPatch>,
    gateway: Option<GatewayPatch>,
    oauth: Option<OauthPatch>,
    worker: Option<WorkerPatch>,
    logging: Option<LoggingPatch>,
    messages: Option<Messages>,
    prompts: Option<Prompts>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    host: Option<String>,
    port: Option<u16>,
    user: Option<String>,
    password: Option<String>,
    dbname: Option<String>,
    sslmode: Option<String>,
    schema: Option<String>,
    max_open_conns: Option<u32>,
    max_idle_conns: Option<u32>,
    conn_max_lifetime_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ModelPatch {
    model: Option<String>,
    temperature: Option<f64>,
    max_completion_tokens: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    base_url: Option<String>,
    api_key: Option<String>,
    timeout_secs: Option<u64>,
    semantic: Option<ModelPatch>,
    dialogue: Option<ModelPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    host: Option<String>,
    port: Option<u16>,
    read_timeout_secs: Option<u64>,
    write_timeout_secs: Option<u64>,
    idle_timeout_secs: Option<u64>,
    api_prefix: Option<String>,
    web_prefix: Option<String>,
    jwt_secret: Option<String>,
    allow_header_fallback: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct GatewayPatch {
    ws_url: Option<String>,
    app_id: Option<String>,
    app_secret: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OauthPatch {
    base_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WorkerPatch {
    worker_size: Option<usize>,
    queue_capacity: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
