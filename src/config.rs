use crate::push::ReconnectPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub listen: String,
    pub server_url: String,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub push: PushConfig,
    #[serde(default)]
    pub liveness: LivenessConfig,
    #[serde(default = "default_window_capacity")]
    pub window_capacity: usize,
    #[serde(default)]
    pub roster: RosterConfig,
    #[serde(default)]
    pub render: RenderConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PollConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,
    #[serde(default)]
    pub fetch_timeout_ms: Option<u64>,
}

impl PollConfig {
    pub fn fetch_timeout_ms(&self) -> u64 {
        self.fetch_timeout_ms.unwrap_or(self.interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PushConfig {
    #[serde(default = "default_push_enabled")]
    pub enabled: bool,
    #[serde(default = "default_push_url")]
    pub url: String,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_kind")]
    pub kind: BackoffKind,
    #[serde(default = "default_backoff_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_backoff_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
}

impl BackoffConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        match self.kind {
            BackoffKind::Fixed => ReconnectPolicy::Fixed {
                interval: Duration::from_millis(self.interval_ms),
                max_attempts: self.max_attempts,
            },
            BackoffKind::Exponential => ReconnectPolicy::Exponential {
                initial: Duration::from_millis(self.interval_ms),
                max_delay: Duration::from_millis(self.max_delay_ms),
                multiplier: self.multiplier,
                max_attempts: self.max_attempts,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LivenessConfig {
    #[serde(default = "default_staleness_secs")]
    pub staleness_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RosterConfig {
    #[serde(default = "default_roster_refresh_secs")]
    pub refresh_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RenderConfig {
    #[serde(default = "default_render_interval_ms")]
    pub interval_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval_ms(),
            fetch_timeout_ms: None,
        }
    }
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            enabled: default_push_enabled(),
            url: default_push_url(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            kind: default_backoff_kind(),
            interval_ms: default_backoff_interval_ms(),
            max_attempts: default_backoff_max_attempts(),
            max_delay_ms: default_backoff_max_delay_ms(),
            multiplier: default_backoff_multiplier(),
        }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            staleness_secs: default_staleness_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for RosterConfig {
    fn default() -> Self {
        Self {
            refresh_secs: default_roster_refresh_secs(),
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_render_interval_ms(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation("listen is required".to_string()));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "listen must be a valid host:port address".to_string(),
            ));
        }
        if self.window_capacity < 1 {
            return Err(ConfigError::Validation(
                "window_capacity must be >= 1".to_string(),
            ));
        }

        validate_server_url(&self.server_url)?;
        validate_poll(&self.poll)?;
        validate_push(&self.push)?;
        validate_liveness(&self.liveness)?;

        if self.roster.refresh_secs < 1 {
            return Err(ConfigError::Validation(
                "roster.refresh_secs must be >= 1".to_string(),
            ));
        }
        if self.render.interval_ms < 100 {
            return Err(ConfigError::Validation(
                "render.interval_ms must be >= 100".to_string(),
            ));
        }

        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../fleetsync.yaml.example")
    }
}

fn validate_server_url(url: &str) -> Result<(), ConfigError> {
    if url.trim().is_empty() {
        return Err(ConfigError::Validation("server_url is required".to_string()));
    }
    match reqwest::Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
        Ok(parsed) => Err(ConfigError::Validation(format!(
            "server_url must use http or https, got '{}'",
            parsed.scheme()
        ))),
        Err(err) => Err(ConfigError::Validation(format!(
            "server_url '{url}' is not a valid URL: {err}"
        ))),
    }
}

fn validate_poll(cfg: &PollConfig) -> Result<(), ConfigError> {
    if cfg.interval_ms < 100 {
        return Err(ConfigError::Validation(
            "poll.interval_ms must be >= 100".to_string(),
        ));
    }
    if cfg.fetch_timeout_ms() == 0 {
        return Err(ConfigError::Validation(
            "poll.fetch_timeout_ms must be > 0".to_string(),
        ));
    }
    if cfg.fetch_timeout_ms() > cfg.interval_ms {
        return Err(ConfigError::Validation(
            "poll.fetch_timeout_ms must not exceed poll.interval_ms".to_string(),
        ));
    }
    Ok(())
}

fn validate_push(cfg: &PushConfig) -> Result<(), ConfigError> {
    if cfg.enabled {
        match reqwest::Url::parse(&cfg.url) {
            Ok(parsed) if matches!(parsed.scheme(), "ws" | "wss") => {}
            Ok(_) => {
                return Err(ConfigError::Validation(
                    "push.url must use ws or wss".to_string(),
                ))
            }
            Err(err) => {
                return Err(ConfigError::Validation(format!(
                    "push.url '{}' is not a valid URL: {err}",
                    cfg.url
                )))
            }
        }
    }

    let backoff = &cfg.backoff;
    if backoff.max_attempts < 1 {
        return Err(ConfigError::Validation(
            "push.backoff.max_attempts must be >= 1".to_string(),
        ));
    }
    if backoff.interval_ms == 0 {
        return Err(ConfigError::Validation(
            "push.backoff.interval_ms must be > 0".to_string(),
        ));
    }
    if backoff.kind == BackoffKind::Exponential {
        if !(backoff.multiplier.is_finite() && backoff.multiplier >= 1.0) {
            return Err(ConfigError::Validation(
                "push.backoff.multiplier must be a finite number >= 1".to_string(),
            ));
        }
        if backoff.max_delay_ms < backoff.interval_ms {
            return Err(ConfigError::Validation(
                "push.backoff.max_delay_ms must be >= push.backoff.interval_ms".to_string(),
            ));
        }
    }
    Ok(())
}

fn validate_liveness(cfg: &LivenessConfig) -> Result<(), ConfigError> {
    if cfg.staleness_secs < 1 {
        return Err(ConfigError::Validation(
            "liveness.staleness_secs must be >= 1".to_string(),
        ));
    }
    if cfg.sweep_interval_secs < 1 {
        return Err(ConfigError::Validation(
            "liveness.sweep_interval_secs must be >= 1".to_string(),
        ));
    }
    Ok(())
}

const fn default_window_capacity() -> usize {
    crate::store::DEFAULT_WINDOW_CAPACITY
}

const fn default_poll_interval_ms() -> u64 {
    crate::poll::DEFAULT_POLL_INTERVAL.as_millis() as u64
}

const fn default_push_enabled() -> bool {
    true
}

fn default_push_url() -> String {
    "ws://localhost:8080/ws/live".to_string()
}

const fn default_backoff_kind() -> BackoffKind {
    BackoffKind::Fixed
}

const fn default_backoff_interval_ms() -> u64 {
    3000
}

const fn default_backoff_max_attempts() -> u32 {
    10
}

const fn default_backoff_max_delay_ms() -> u64 {
    30_000
}

const fn default_backoff_multiplier() -> f64 {
    2.0
}

const fn default_staleness_secs() -> u64 {
    60
}

const fn default_sweep_interval_secs() -> u64 {
    5
}

const fn default_roster_refresh_secs() -> u64 {
    30
}

const fn default_render_interval_ms() -> u64 {
    crate::render::DEFAULT_RENDER_INTERVAL.as_millis() as u64
}
