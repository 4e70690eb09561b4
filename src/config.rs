//! Layered settings
//!
//! Built-in defaults, then `config/default`, `config/{ENVIRONMENT}` and
//! `config/local` (all optional), then `INTERCEPTOR__*` environment
//! variables (`INTERCEPTOR__PROXY__REQUEST_TIMEOUT_SECS=10`).

use crate::domain::{Mapping, MappingCode};
use crate::proxy::guard::RateLimitConfig;
use crate::proxy::headers::HeaderPolicyConfig;
use crate::proxy::observer_hub::ObserverConfig;
use crate::proxy::types::{DeploymentMode, ProxyConfig};
use ::config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::time::Duration;

pub use ::config::ConfigError;

const ENV_PREFIX: &str = "INTERCEPTOR";

/// Default bound on in-memory records per mapping code
pub const DEFAULT_RETAIN_PER_CODE: usize = 1000;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub application: ApplicationSettings,
    pub proxy: ProxySettings,
    #[serde(default)]
    pub headers: HeaderPolicyConfig,
    pub rate_limit: RateLimitSettings,
    pub observers: ObserverSettings,
    pub access: AccessSettings,
    pub cors: CorsSettings,
    #[serde(default)]
    pub database: Option<DatabaseSettings>,
    pub logging: LoggingSettings,
    #[serde(default)]
    pub mappings: Vec<MappingSeed>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApplicationSettings {
    pub host: String,
    pub port: u16,
    pub environment: String,
    pub mode: DeploymentMode,
    /// Seconds to wait for in-flight work after a shutdown signal
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxySettings {
    pub max_request_size: usize,
    pub request_capture_limit: usize,
    pub response_capture_limit: usize,
    pub request_timeout_secs: u64,
    pub mock_segment: String,
    #[serde(default)]
    pub denied_content_types: Vec<String>,
    pub log_queue_capacity: usize,
    /// Records kept per mapping code by the in-memory log store
    pub retain_per_code: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitSettings {
    pub enabled: bool,
    pub max_requests: u32,
    pub window_secs: u64,
    pub client_ip_header: String,
    pub purge_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ObserverSettings {
    pub channel_capacity: usize,
    pub heartbeat_interval_secs: u64,
    pub inactivity_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AccessSettings {
    /// When true every observer may read every mapping
    pub global_access: bool,
    /// Session verification endpoint; `tokens` is used when absent
    #[serde(default)]
    pub session_url: Option<String>,
    pub session_timeout_ms: u64,
    /// Static session table; a list because configuration keys are
    /// case-folded
    #[serde(default)]
    pub tokens: Vec<StaticToken>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StaticToken {
    pub token: String,
    pub subject: String,
}

impl AccessSettings {
    pub fn token_table(&self) -> HashMap<String, String> {
        self.tokens
            .iter()
            .map(|t| (t.token.clone(), t.subject.clone()))
            .collect()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorsSettings {
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub max_age_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database_name: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

fn default_max_connections() -> u32 {
    10
}

fn default_acquire_timeout_secs() -> u64 {
    5
}

impl DatabaseSettings {
    pub fn url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, self.database_name
        )
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
    /// `json` or `pretty`
    pub format: String,
}

/// Mapping preloaded into the in-memory store
#[derive(Debug, Deserialize, Clone)]
pub struct MappingSeed {
    pub code: String,
    pub destination: String,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl MappingSeed {
    pub fn to_mapping(&self) -> crate::Result<Mapping> {
        let code = MappingCode::try_new(self.code.clone())
            .map_err(|e| crate::Error::invalid_setting(format!("mappings.{}", self.code), e.to_string()))?;

        let mut mapping = Mapping::new(code, self.destination.clone());
        if let Some(owner) = &self.owner {
            mapping = mapping.with_owner(owner.clone());
        }
        if !self.active {
            mapping = mapping.deactivated();
        }
        Ok(mapping)
    }
}

impl Settings {
    /// Load from `./config` and the process environment
    pub fn new() -> Result<Self, ConfigError> {
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());
        Self::load(Path::new("config"), &environment)
    }

    pub fn load(config_dir: &Path, environment: &str) -> Result<Self, ConfigError> {
        let proxy_defaults = ProxyConfig::default();
        let rate_defaults = RateLimitConfig::default();
        let observer_defaults = ObserverConfig::default();

        let config = Config::builder()
            .set_default("application.host", "0.0.0.0")?
            .set_default("application.port", 8080)?
            .set_default("application.environment", environment)?
            .set_default("application.mode", "open")?
            .set_default("application.shutdown_grace_secs", 10)?
            .set_default("proxy.max_request_size", proxy_defaults.max_request_size as u64)?
            .set_default("proxy.request_capture_limit", proxy_defaults.request_capture_limit as u64)?
            .set_default("proxy.response_capture_limit", proxy_defaults.response_capture_limit as u64)?
            .set_default("proxy.request_timeout_secs", proxy_defaults.request_timeout.as_secs())?
            .set_default("proxy.mock_segment", proxy_defaults.mock_segment)?
            .set_default("proxy.log_queue_capacity", proxy_defaults.log_queue_capacity as u64)?
            .set_default("proxy.retain_per_code", DEFAULT_RETAIN_PER_CODE as u64)?
            .set_default("rate_limit.enabled", rate_defaults.enabled)?
            .set_default("rate_limit.max_requests", u64::from(rate_defaults.max_requests))?
            .set_default("rate_limit.window_secs", rate_defaults.window.as_secs())?
            .set_default("rate_limit.client_ip_header", rate_defaults.client_ip_header)?
            .set_default("rate_limit.purge_interval_secs", 60)?
            .set_default("observers.channel_capacity", observer_defaults.channel_capacity as u64)?
            .set_default(
                "observers.heartbeat_interval_secs",
                observer_defaults.heartbeat_interval.as_secs(),
            )?
            .set_default(
                "observers.inactivity_timeout_secs",
                observer_defaults.inactivity_timeout.as_secs(),
            )?
            .set_default("access.global_access", true)?
            .set_default("access.session_timeout_ms", 3000)?
            .set_default("cors.allowed_origins", vec!["*"])?
            .set_default(
                "cors.allowed_methods",
                vec!["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS", "HEAD"],
            )?
            .set_default(
                "cors.allowed_headers",
                vec!["content-type", "authorization", "x-request-id", "x-session-token"],
            )?
            .set_default("cors.max_age_secs", 600)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "json")?
            .add_source(File::from(config_dir.join("default")).required(false))
            .add_source(File::from(config_dir.join(environment)).required(false))
            .add_source(File::from(config_dir.join("local")).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        config.try_deserialize()
    }

    pub fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            max_request_size: self.proxy.max_request_size,
            request_capture_limit: self.proxy.request_capture_limit,
            response_capture_limit: self.proxy.response_capture_limit,
            request_timeout: Duration::from_secs(self.proxy.request_timeout_secs),
            mock_segment: self.proxy.mock_segment.clone(),
            denied_content_types: self.proxy.denied_content_types.clone(),
            log_queue_capacity: self.proxy.log_queue_capacity,
        }
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            enabled: self.rate_limit.enabled,
            max_requests: self.rate_limit.max_requests,
            window: Duration::from_secs(self.rate_limit.window_secs),
            client_ip_header: self.rate_limit.client_ip_header.to_ascii_lowercase(),
        }
    }

    pub fn observer_config(&self) -> ObserverConfig {
        ObserverConfig {
            channel_capacity: self.observers.channel_capacity,
            heartbeat_interval: Duration::from_secs(self.observers.heartbeat_interval_secs.max(1)),
            inactivity_timeout: Duration::from_secs(self.observers.inactivity_timeout_secs),
        }
    }

    /// Seed mappings, validated
    pub fn seed_mappings(&self) -> crate::Result<Vec<Mapping>> {
        self.mappings.iter().map(MappingSeed::to_mapping).collect()
    }
}
