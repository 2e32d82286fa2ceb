//! Gateway configuration.
//!
//! The configuration is assembled once at startup from an optional YAML/JSON
//! file and the process environment, validated, and then shared read-only with
//! every request through `AppState`. Nothing in here is mutated afterwards.
//!
//! Environment variables (override file values):
//! - LISTEN_HOST / LISTEN_PORT
//! - API_MASTER_KEY                        -> bearer key required by the API (optional)
//! - ERNIE_UPSTREAM_URL                    -> conversation endpoint
//! - ERNIE_UPSTREAM_TIMEOUT_SECONDS        -> upper bound on one upstream call
//! - ERNIE_MODELS = alias=backend,...      -> advertised aliases, in order
//! - ERNIE_DEFAULT_BACKEND                 -> backend used for unknown aliases
//! - ERNIE_PROMPT_MODE = last_message|transcript
//! - ERNIE_ACCOUNT_<ID>_COOKIE / _ACS_TOKEN / _SIGN (BAIDU_ACCOUNT_<ID>_* also accepted)
//! - CORS_ALLOWED_ORIGINS = * | origin,origin

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::error::GatewayError;

pub const DEFAULT_LISTEN_HOST: &str = "0.0.0.0";
pub const DEFAULT_LISTEN_PORT: u16 = 8083;
pub const DEFAULT_UPSTREAM_URL: &str = "https://ernie.baidu.com/eb/chat/conversation/v2";
pub const DEFAULT_UPSTREAM_TIMEOUT_SECONDS: u64 = 60;
pub const DEFAULT_BACKEND_MODEL: &str = "EB45T";

/// `BAIDU_ACCOUNT_` is the older spelling and is still read.
const ACCOUNT_ENV_PREFIXES: [&str; 2] = ["ERNIE_ACCOUNT_", "BAIDU_ACCOUNT_"];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Public model name and the upstream-internal model it maps to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelAlias {
    pub alias: String,
    pub backend: String,
}

/// Ordered alias table. Order is the order advertised by `/v1/models`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelCatalog {
    aliases: Vec<ModelAlias>,
    default_backend: String,
}

impl ModelCatalog {
    pub fn new(aliases: Vec<ModelAlias>, default_backend: impl Into<String>) -> Self {
        Self {
            aliases,
            default_backend: default_backend.into(),
        }
    }

    /// Backend model for an alias; unknown aliases resolve to the default backend.
    pub fn resolve(&self, alias: &str) -> &str {
        self.aliases
            .iter()
            .find(|a| a.alias == alias)
            .map(|a| a.backend.as_str())
            .unwrap_or(self.default_backend.as_str())
    }

    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.aliases.iter().map(|a| a.alias.as_str())
    }

    pub fn default_backend(&self) -> &str {
        &self.default_backend
    }

    /// Alias echoed back when a request names no model.
    pub fn default_alias(&self) -> &str {
        self.aliases
            .first()
            .map(|a| a.alias.as_str())
            .unwrap_or("ernie-4.5-turbo")
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.aliases.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one model alias must be configured".into(),
            ));
        }
        if self.default_backend.trim().is_empty() {
            return Err(ConfigError::Invalid("default backend is empty".into()));
        }
        for (idx, entry) in self.aliases.iter().enumerate() {
            if entry.alias.trim().is_empty() || entry.backend.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "model entry #{idx} has an empty alias or backend"
                )));
            }
            if self.aliases[..idx].iter().any(|a| a.alias == entry.alias) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate model alias `{}`",
                    entry.alias
                )));
            }
        }
        Ok(())
    }
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::new(
            vec![
                ModelAlias {
                    alias: "ernie-4.5-turbo".into(),
                    backend: "EB45T".into(),
                },
                ModelAlias {
                    alias: "ernie-x1".into(),
                    backend: "X1_1".into(),
                },
            ],
            DEFAULT_BACKEND_MODEL,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Upstream authentication material for one account.
#[derive(Clone, Default, Deserialize, PartialEq, Eq)]
pub struct AccountCredentials {
    #[serde(default)]
    pub cookie: String,
    #[serde(default)]
    pub acs_token: String,
    /// Per-request signing value copied into the conversation body.
    #[serde(default)]
    pub sign: String,
}

impl AccountCredentials {
    /// Fails with the first empty field, checked in cookie, token, sign order.
    pub fn validate(&self, account: &AccountId) -> Result<(), GatewayError> {
        let fields = [
            ("cookie", &self.cookie),
            ("acs_token", &self.acs_token),
            ("sign", &self.sign),
        ];
        for (field, value) in fields {
            if value.trim().is_empty() {
                return Err(GatewayError::Configuration {
                    account: account.to_string(),
                    field,
                });
            }
        }
        Ok(())
    }
}

impl fmt::Debug for AccountCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn redact(v: &str) -> &'static str {
            if v.is_empty() {
                "<empty>"
            } else {
                "<redacted>"
            }
        }
        f.debug_struct("AccountCredentials")
            .field("cookie", &redact(&self.cookie))
            .field("acs_token", &redact(&self.acs_token))
            .field("sign", &redact(&self.sign))
            .finish()
    }
}

/// Accounts in configuration order.
#[derive(Debug, Clone, Default)]
pub struct AccountRegistry {
    accounts: Vec<(AccountId, AccountCredentials)>,
}

impl AccountRegistry {
    pub fn insert(&mut self, id: AccountId, credentials: AccountCredentials) {
        match self.accounts.iter_mut().find(|(existing, _)| *existing == id) {
            Some((_, slot)) => *slot = credentials,
            None => self.accounts.push((id, credentials)),
        }
    }

    pub fn get(&self, id: &AccountId) -> Option<&AccountCredentials> {
        self.accounts
            .iter()
            .find(|(existing, _)| existing == id)
            .map(|(_, c)| c)
    }

    /// Account used for the next request. Only one account is ever in play:
    /// the first configured one.
    pub fn select(&self) -> Result<&AccountId, GatewayError> {
        self.accounts
            .first()
            .map(|(id, _)| id)
            .ok_or(GatewayError::NoAccount)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AccountId, &AccountCredentials)> {
        self.accounts.iter().map(|(id, c)| (id, c))
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    fn entry(&mut self, id: AccountId) -> &mut AccountCredentials {
        let pos = match self.accounts.iter().position(|(existing, _)| *existing == id) {
            Some(pos) => pos,
            None => {
                self.accounts.push((id, AccountCredentials::default()));
                self.accounts.len() - 1
            }
        };
        &mut self.accounts[pos].1
    }
}

/// How the inbound message list becomes the single upstream prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptMode {
    /// Forward only the last message. Earlier turns are dropped.
    #[default]
    LastMessage,
    /// Flatten every message into one `role: content` transcript.
    Transcript,
}

impl PromptMode {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "last" | "last_message" => Some(PromptMode::LastMessage),
            "transcript" | "history" => Some(PromptMode::Transcript),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamSettings {
    pub url: String,
    /// Bound on the whole call, connect through last body byte.
    pub timeout: Duration,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_UPSTREAM_URL.into(),
            timeout: Duration::from_secs(DEFAULT_UPSTREAM_TIMEOUT_SECONDS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen_host: String,
    pub listen_port: u16,
    pub master_key: Option<String>,
    pub upstream: UpstreamSettings,
    pub models: ModelCatalog,
    pub accounts: AccountRegistry,
    pub prompt_mode: PromptMode,
    /// Empty means any origin.
    pub cors_allowed_origins: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_host: DEFAULT_LISTEN_HOST.into(),
            listen_port: DEFAULT_LISTEN_PORT,
            master_key: None,
            upstream: UpstreamSettings::default(),
            models: ModelCatalog::default(),
            accounts: AccountRegistry::default(),
            prompt_mode: PromptMode::default(),
            cors_allowed_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    listen_host: Option<String>,
    listen_port: Option<u16>,
    api_master_key: Option<String>,
    upstream_url: Option<String>,
    upstream_timeout_seconds: Option<u64>,
    prompt_mode: Option<PromptMode>,
    models: Option<Vec<ModelAlias>>,
    default_backend: Option<String>,
    accounts: Vec<FileAccount>,
    cors_allowed_origins: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct FileAccount {
    id: String,
    #[serde(flatten)]
    credentials: AccountCredentials,
}

impl GatewayConfig {
    /// Load from an optional file plus the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let text = match path {
            Some(p) => Some(std::fs::read_to_string(p)?),
            None => None,
        };
        Self::from_sources(text.as_deref(), std::env::vars())
    }

    /// Build from file text (YAML or JSON) and an explicit set of variables.
    pub fn from_sources<I>(file_text: Option<&str>, vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let file: FileConfig = match file_text {
            Some(text) if !text.trim().is_empty() => serde_yaml::from_str(text)?,
            _ => FileConfig::default(),
        };

        let mut cfg = GatewayConfig::default();
        let mut models = file.models;
        let mut default_backend = file.default_backend;
        let mut timeout_secs = file.upstream_timeout_seconds;

        if let Some(v) = file.listen_host {
            cfg.listen_host = v;
        }
        if let Some(v) = file.listen_port {
            cfg.listen_port = v;
        }
        cfg.master_key = file.api_master_key;
        if let Some(v) = file.upstream_url {
            cfg.upstream.url = v;
        }
        if let Some(v) = file.prompt_mode {
            cfg.prompt_mode = v;
        }
        if let Some(v) = file.cors_allowed_origins {
            cfg.cors_allowed_origins = v;
        }
        for account in file.accounts {
            cfg.accounts
                .insert(AccountId::new(account.id), account.credentials);
        }

        let mut env_accounts: BTreeMap<String, Vec<(&'static str, String)>> = BTreeMap::new();
        for (key, value) in vars {
            let value = value.trim().to_string();
            match key.as_str() {
                "LISTEN_HOST" if !value.is_empty() => cfg.listen_host = value,
                "LISTEN_PORT" if !value.is_empty() => {
                    cfg.listen_port = value.parse().map_err(|_| {
                        ConfigError::Invalid(format!("LISTEN_PORT is not a port: {value}"))
                    })?;
                }
                "API_MASTER_KEY" if !value.is_empty() => cfg.master_key = Some(value),
                "ERNIE_UPSTREAM_URL" if !value.is_empty() => cfg.upstream.url = value,
                "ERNIE_UPSTREAM_TIMEOUT_SECONDS" if !value.is_empty() => {
                    timeout_secs = Some(value.parse().map_err(|_| {
                        ConfigError::Invalid(format!(
                            "ERNIE_UPSTREAM_TIMEOUT_SECONDS is not a number: {value}"
                        ))
                    })?);
                }
                "ERNIE_MODELS" if !value.is_empty() => models = Some(parse_model_list(&value)?),
                "ERNIE_DEFAULT_BACKEND" if !value.is_empty() => default_backend = Some(value),
                "ERNIE_PROMPT_MODE" if !value.is_empty() => {
                    cfg.prompt_mode = PromptMode::parse(&value).ok_or_else(|| {
                        ConfigError::Invalid(format!("unknown ERNIE_PROMPT_MODE: {value}"))
                    })?;
                }
                "CORS_ALLOWED_ORIGINS" if !value.is_empty() => {
                    cfg.cors_allowed_origins = if value == "*" {
                        Vec::new()
                    } else {
                        value
                            .split(',')
                            .map(|o| o.trim().to_string())
                            .filter(|o| !o.is_empty())
                            .collect()
                    };
                }
                _ => {
                    if let Some((id, field)) = parse_account_key(&key) {
                        env_accounts
                            .entry(id.to_string())
                            .or_default()
                            .push((field, value));
                    }
                }
            }
        }

        for (id, fields) in env_accounts {
            let creds = cfg.accounts.entry(AccountId::new(id));
            for (field, value) in fields {
                match field {
                    "cookie" => creds.cookie = value,
                    "acs_token" => creds.acs_token = value,
                    _ => creds.sign = value,
                }
            }
        }

        if cfg
            .master_key
            .as_deref()
            .is_some_and(|k| k.trim().is_empty())
        {
            cfg.master_key = None;
        }
        if let Some(secs) = timeout_secs {
            cfg.upstream.timeout = Duration::from_secs(secs);
        }
        if models.is_some() || default_backend.is_some() {
            cfg.models = ModelCatalog::new(
                models.unwrap_or_else(|| ModelCatalog::default().aliases),
                default_backend.unwrap_or_else(|| DEFAULT_BACKEND_MODEL.to_string()),
            );
        }

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_port == 0 {
            return Err(ConfigError::Invalid("listen port must be non-zero".into()));
        }
        if self.upstream.timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "upstream timeout must be non-zero".into(),
            ));
        }
        if self.upstream.url.trim().is_empty() {
            return Err(ConfigError::Invalid("upstream url is empty".into()));
        }
        self.models.validate()
    }

    /// Accounts whose credentials would fail a request, for startup diagnostics.
    pub fn incomplete_accounts(&self) -> Vec<GatewayError> {
        self.accounts
            .iter()
            .filter_map(|(id, creds)| creds.validate(id).err())
            .collect()
    }
}

fn parse_model_list(raw: &str) -> Result<Vec<ModelAlias>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|pair| {
            let (alias, backend) = pair.split_once('=').ok_or_else(|| {
                ConfigError::Invalid(format!("ERNIE_MODELS entry `{pair}` is not alias=backend"))
            })?;
            Ok(ModelAlias {
                alias: alias.trim().to_string(),
                backend: backend.trim().to_string(),
            })
        })
        .collect()
}

fn parse_account_key(key: &str) -> Option<(&str, &'static str)> {
    let rest = ACCOUNT_ENV_PREFIXES
        .iter()
        .find_map(|prefix| key.strip_prefix(prefix))?;
    let (id, field) = if let Some(id) = rest.strip_suffix("_ACS_TOKEN") {
        (id, "acs_token")
    } else if let Some(id) = rest.strip_suffix("_COOKIE") {
        (id, "cookie")
    } else if let Some(id) = rest.strip_suffix("_SIGN") {
        (id, "sign")
    } else {
        return None;
    };
    (!id.is_empty()).then_some((id, field))
}
