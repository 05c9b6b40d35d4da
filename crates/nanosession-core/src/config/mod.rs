use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::{self, CookieOptions, CookieSigner};
use crate::error::ConfigError;
use crate::id::IdStrategy;
use crate::store::{MemoryStore, SessionStore};

/// Root configuration for the session layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    /// Cookie name carrying the session id.
    pub name: String,
    pub generate_id: IdStrategy,
    /// Signing secret(s). The first one signs; all of them verify.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<SecretConfig>,
    /// Persist brand-new sessions even if the handler left them empty.
    pub save_uninitialized: bool,
    pub cookie: CookieOptions,
    pub store: StoreConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: "sid".to_string(),
            generate_id: IdStrategy::default(),
            secret: None,
            save_uninitialized: true,
            cookie: CookieOptions::default(),
            store: StoreConfig::default(),
        }
    }
}

/// A single secret or a rotation list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SecretConfig {
    One(String),
    Many(Vec<String>),
}

impl SecretConfig {
    pub fn secrets(&self) -> Vec<&str> {
        match self {
            SecretConfig::One(secret) => vec![secret.as_str()],
            SecretConfig::Many(secrets) => secrets.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreConfig {
    pub kind: StoreKind,
    pub sweep_interval_secs: u64,
    /// Retention for sessions whose cookie has no max-age.
    pub default_ttl_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Memory,
            sweep_interval_secs: crate::store::memory::DEFAULT_SWEEP_INTERVAL.as_secs(),
            default_ttl_secs: crate::store::memory::DEFAULT_TTL.as_secs(),
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::InvalidStore(
                "sweepIntervalSecs must be greater than 0".to_string(),
            ));
        }
        let max_secs = crate::store::memory::MAX_TTL.as_secs();
        if self.sweep_interval_secs > max_secs {
            return Err(ConfigError::InvalidStore(format!(
                "sweepIntervalSecs must be at most {}",
                max_secs
            )));
        }
        if self.default_ttl_secs == 0 {
            return Err(ConfigError::InvalidStore(
                "defaultTtlSecs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the memory store this config describes.
    pub fn build_memory(&self) -> Result<MemoryStore, ConfigError> {
        self.validate()?;
        Ok(MemoryStore::with_options(
            Duration::from_secs(self.sweep_interval_secs),
            Duration::from_secs(self.default_ttl_secs),
        ))
    }

    /// Build the configured store.
    pub fn build(&self) -> Result<Arc<dyn SessionStore>, ConfigError> {
        match self.kind {
            StoreKind::Memory => Ok(Arc::new(self.build_memory()?)),
        }
    }
}

impl SessionConfig {
    /// Build from a JSON value, checking `generateId` before anything else
    /// so a non-string generator is reported as such.
    pub fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        if let Some(generate_id) = value.get("generateId") {
            match generate_id {
                serde_json::Value::String(name) => {
                    name.parse::<IdStrategy>()?;
                }
                other => {
                    return Err(ConfigError::InvalidGenerateId(format!(
                        "expected one of {:?}, got {}",
                        IdStrategy::NAMES,
                        other
                    )));
                }
            }
        }
        let config: SessionConfig = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Self::from_value(serde_json::from_str(json)?)
    }

    /// Run every setup-time check.
    pub fn validate(&self) -> Result<(), ConfigError> {
        codec::validate_name(&self.name)?;
        self.cookie.validate()?;
        self.signer()?;
        self.store.validate()?;
        Ok(())
    }

    pub fn signer(&self) -> Result<CookieSigner, ConfigError> {
        match &self.secret {
            Some(secret) => {
                let secrets = secret.secrets();
                if secrets.is_empty() {
                    return Err(ConfigError::InvalidCookie(
                        "secret list must not be empty".to_string(),
                    ));
                }
                CookieSigner::new(secrets)
            }
            None => Ok(CookieSigner::default()),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_generate_id(mut self, strategy: IdStrategy) -> Self {
        self.generate_id = strategy;
        self
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(SecretConfig::One(secret.into()));
        self
    }

    pub fn with_secrets<I, S>(mut self, secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.secret = Some(SecretConfig::Many(
            secrets.into_iter().map(Into::into).collect(),
        ));
        self
    }

    pub fn with_save_uninitialized(mut self, save: bool) -> Self {
        self.save_uninitialized = save;
        self
    }

    pub fn with_cookie(mut self, cookie: CookieOptions) -> Self {
        self.cookie = cookie;
        self
    }

    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }
}

/// Load configuration from the environment.
///
/// Priority:
/// 1. `NANOSESSION_CONFIG` env var — full JSON config
/// 2. Individual env vars merged on top of the file config (or defaults)
pub fn load_config_from_env(config_path: Option<&Path>) -> Result<SessionConfig, ConfigError> {
    if let Ok(json) = std::env::var("NANOSESSION_CONFIG") {
        return SessionConfig::from_json(&json);
    }

    let mut cfg = load_config(config_path)?;

    if let Ok(v) = std::env::var("NANOSESSION_COOKIE_NAME") {
        cfg.name = v;
    }
    if let Ok(v) = std::env::var("NANOSESSION_SECRET") {
        cfg.secret = Some(SecretConfig::One(v));
    }
    if let Ok(v) = std::env::var("NANOSESSION_MAX_AGE") {
        let max_age = v.trim().parse::<u64>().map_err(|e| {
            ConfigError::InvalidCookie(format!("NANOSESSION_MAX_AGE={:?}: {}", v, e))
        })?;
        cfg.cookie.max_age = Some(max_age);
    }

    cfg.validate()?;
    Ok(cfg)
}

/// Get the default configuration file path.
pub fn get_config_path() -> PathBuf {
    PathBuf::from("nanosession.json")
}

/// Load configuration from file, falling back to defaults when the
/// default file is absent.
///
/// An explicitly given path must exist.
pub fn load_config(config_path: Option<&Path>) -> Result<SessionConfig, ConfigError> {
    let path = match config_path {
        Some(path) => {
            if !path.exists() {
                return Err(ConfigError::NotFound(path.to_path_buf()));
            }
            path.to_path_buf()
        }
        None => {
            let path = get_config_path();
            if !path.exists() {
                return Ok(SessionConfig::default());
            }
            path
        }
    };

    let content = std::fs::read_to_string(&path)?;
    let config = SessionConfig::from_json(&content)?;
    tracing::debug!("Loaded session config from {}", path.display());
    Ok(config)
}
