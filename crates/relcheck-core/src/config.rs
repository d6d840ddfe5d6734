use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::engine::{EngineConfig, LookupErrorPolicy, MAX_DEPTH_LIMIT};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineConfigValues,
    pub database: DatabaseConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfigValues {
    pub max_depth: u32,
    pub max_concurrent_branches: usize,
    pub lookup_error_policy: LookupErrorPolicy,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,
    pub level: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl Default for EngineConfigValues {
    fn default() -> Self {
        Self {
            max_depth: 50,
            max_concurrent_branches: 10,
            lookup_error_policy: LookupErrorPolicy::Abort,
            timeout_ms: None,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost:5432/relcheck".to_string(),
            max_connections: 10,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Reads `config_path` (or starts from defaults), then applies
    /// `RELCHECK_*` environment overrides and validates the result.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = if let Some(path) = config_path {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e.to_string()))?;
            toml::from_str::<AppConfig>(&contents)
                .map_err(|e| ConfigError::ParseToml(e.to_string()))?
        } else {
            AppConfig::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    /// Unparseable values are ignored and the configured value kept.
    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("RELCHECK_ENGINE_MAX_DEPTH")
            && let Ok(n) = v.parse()
        {
            self.engine.max_depth = n;
        }
        if let Some(v) = var("RELCHECK_ENGINE_MAX_CONCURRENT_BRANCHES")
            && let Ok(n) = v.parse()
        {
            self.engine.max_concurrent_branches = n;
        }
        if let Some(v) = var("RELCHECK_ENGINE_TIMEOUT_MS")
            && let Ok(ms) = v.parse()
        {
            self.engine.timeout_ms = Some(ms);
        }
        if let Some(v) = var("RELCHECK_LOOKUP_ERROR_POLICY") {
            match v.as_str() {
                "abort" => self.engine.lookup_error_policy = LookupErrorPolicy::Abort,
                "skip" => self.engine.lookup_error_policy = LookupErrorPolicy::Skip,
                _ => {}
            }
        }
        if let Some(v) = var("RELCHECK_DATABASE_URL") {
            self.database.url = v;
        }
        if let Some(v) = var("RELCHECK_DATABASE_MAX_CONNECTIONS")
            && let Ok(n) = v.parse()
        {
            self.database.max_connections = n;
        }
        if let Some(v) = var("RELCHECK_LOG_LEVEL") {
            self.log.level = v;
        }
        if let Some(v) = var("RELCHECK_LOG_FORMAT") {
            match v.as_str() {
                "json" => self.log.format = LogFormat::Json,
                "pretty" => self.log.format = LogFormat::Pretty,
                _ => {}
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.max_depth == 0 {
            return Err(ConfigError::Validation(
                "engine.max_depth must be non-zero".to_string(),
            ));
        }
        if self.engine.max_depth > MAX_DEPTH_LIMIT {
            return Err(ConfigError::Validation(format!(
                "engine.max_depth must be at most {MAX_DEPTH_LIMIT}"
            )));
        }
        if self.engine.max_concurrent_branches == 0 {
            return Err(ConfigError::Validation(
                "engine.max_concurrent_branches must be non-zero".to_string(),
            ));
        }
        if self.engine.timeout_ms == Some(0) {
            return Err(ConfigError::Validation(
                "engine.timeout_ms must be non-zero when set".to_string(),
            ));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::Validation(
                "database.max_connections must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_depth: self.engine.max_depth,
            max_concurrent_branches: self.engine.max_concurrent_branches,
            lookup_error_policy: self.engine.lookup_error_policy,
            timeout: self.engine.timeout_ms.map(Duration::from_millis),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{0}': {1}")]
    ReadFile(String, String),

    #[error("failed to parse TOML config: {0}")]
    ParseToml(String),

    #[error("config validation failed: {0}")]
    Validation(String),
}
