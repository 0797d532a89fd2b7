pub mod api;
pub mod dispatch;
pub mod error;
pub mod filters;
pub mod hook;
pub mod logging;
pub mod rate_limit;
pub mod request;
pub mod runner;
pub mod template;
pub mod webhook;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use error::HookError;
use filters::AllowListSetting;
use hook::{Hook, HookRegistry};
use rate_limit::RateLimiter;

const DEFAULT_ALLOWED_IP: &str = "127.0.0.1";
const DEFAULT_TOKEN_KEY: &str = "token";
const DEFAULT_RATE_LIMIT_WINDOW: u64 = 60;
const DEFAULT_EXEC_LOG: &str = "./logs/deploy.log";

#[derive(Debug, Deserialize, Clone)]
pub struct HooksConfig {
    /// Seconds to wait for an output log to open before failing the dispatch.
    pub sink_timeout_secs: Option<u64>,
    /// Take the caller address from `X-Forwarded-For` (behind a reverse proxy).
    #[serde(default)]
    pub trust_proxy: bool,
    #[serde(default)]
    pub hook: Vec<HookConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HookConfig {
    pub route: String,
    pub name: Option<String>,
    #[serde(default = "default_ips")]
    pub ips: AllowListSetting,
    pub token: Option<AllowListSetting>,
    #[serde(alias = "tokenKey")]
    pub token_key: Option<String>,
    pub branches: Option<AllowListSetting>,
    pub exec: Option<String>,
    #[serde(alias = "execLog", alias = "log")]
    pub exec_log: Option<String>,
    #[serde(default)]
    pub strict: bool,
    pub rate_limit: Option<usize>,
    pub rate_limit_window: Option<u64>,
}

fn default_ips() -> AllowListSetting {
    AllowListSetting::One(DEFAULT_ALLOWED_IP.to_string())
}

impl HooksConfig {
    pub fn sink_timeout(&self) -> Duration {
        self.sink_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(runner::DEFAULT_SINK_TIMEOUT)
    }
}

impl HookConfig {
    /// Name used in logs and for rate limiting; defaults to the route.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.route)
    }

    pub fn get_token_key(&self) -> &str {
        self.token_key.as_deref().unwrap_or(DEFAULT_TOKEN_KEY)
    }

    /// Output log for `exec`. A hook with a command and no log setting writes
    /// to `./logs/deploy.log`; an empty setting discards the output.
    pub fn get_exec_log(&self) -> Option<&str> {
        match self.exec_log.as_deref() {
            Some(log) if log.trim().is_empty() => None,
            Some(log) => Some(log),
            None if self.exec.is_some() => Some(DEFAULT_EXEC_LOG),
            None => None,
        }
    }

    pub fn get_rate_limit_window(&self) -> u64 {
        self.rate_limit_window.unwrap_or(DEFAULT_RATE_LIMIT_WINDOW)
    }
}

/// Parse a TOML hooks file and check that every hook can be built.
pub fn parse_config(config_str: &str) -> Result<HooksConfig, HookError> {
    let config: HooksConfig = toml::from_str(config_str)?;
    if config.hook.is_empty() {
        return Err(HookError::ConfigError(
            "no [[hook]] entries configured".to_string(),
        ));
    }
    let runner = runner::Runner::new(config.sink_timeout());
    for hook_config in &config.hook {
        Hook::from_config(hook_config, &runner)?;
    }
    Ok(config)
}

/// Load and parse the configuration file
pub fn load_config(path: impl AsRef<Path>) -> Result<HooksConfig, HookError> {
    let path = path.as_ref();
    let config_str = std::fs::read_to_string(path).map_err(|e| {
        HookError::ConfigError(format!(
            "Failed to read config file '{}': {}",
            path.display(),
            e
        ))
    })?;

    parse_config(&config_str).map_err(|e| match e {
        HookError::TomlParseError(e) => HookError::ConfigError(format!(
            "Failed to parse config file '{}': {}",
            path.display(),
            e
        )),
        other => other,
    })
}

pub struct AppState {
    pub hooks: HookRegistry,
    pub trust_proxy: bool,
    pub rate_limiter: Mutex<RateLimiter>,
    pub accepted_count: AtomicU64,
    pub start_time: Instant,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: &HooksConfig) -> Result<Self, HookError> {
        Ok(Self::from_registry(
            HookRegistry::from_config(config)?,
            config.trust_proxy,
        ))
    }

    pub fn from_registry(hooks: HookRegistry, trust_proxy: bool) -> Self {
        Self {
            hooks,
            trust_proxy,
            rate_limiter: Mutex::new(RateLimiter::new()),
            accepted_count: AtomicU64::new(0),
            start_time: Instant::now(),
            started_at: Utc::now(),
        }
    }
}

pub type SharedState = Arc<AppState>;
