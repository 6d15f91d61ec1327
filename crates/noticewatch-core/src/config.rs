//! Pipeline configuration: defaults, `NOTICEWATCH_*` overrides and validation.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use noticewatch_store::StoreConfig;
use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::extract::ExtractionConfig;
use crate::latency::LatencyConfig;
use crate::logging::LoggingConfig;
use crate::rate_limiter::RateLimitConfig;
use crate::retry::RetryConfig;
use crate::timing::DEFAULT_LIVE_WINDOW;
use crate::ValidationError;

/// Everything a [`NoticeClient`](crate::NoticeClient) and its loops need.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Watermark key of the polling channel.
    pub poll_source: String,
    /// Source name stamped on push-channel events.
    pub push_source: String,
    /// Structured notice-listing endpoint.
    pub api_url: String,
    /// Markup rendering of the same board.
    pub board_url: Option<String>,
    /// Base for resolving relative links; defaults to `board_url`.
    pub board_base_url: Option<String>,
    /// Websocket endpoint of the push channel.
    pub push_url: Option<String>,
    pub request_timeout: Duration,
    pub poll_interval: Duration,
    pub maintenance_interval: Duration,
    pub live_window: Duration,
    /// Cross-source suppression window per base ticker.
    pub cooldown: Duration,
    /// Offset subtracted from `now` when the watermark is re-armed at boot.
    pub grace_window: Duration,
    /// How long processed events are kept.
    pub retention: Duration,
    /// Rate-limit windows unused for this long are evicted.
    pub rate_limit_idle: Duration,
    pub extraction: ExtractionConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    pub rate_limit: RateLimitConfig,
    pub latency: LatencyConfig,
    pub logging: LoggingConfig,
    /// Data directory; `None` resolves `NOTICEWATCH_HOME` and friends.
    pub store_home: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_source: String::from("notice-api"),
            push_source: String::from("notice-push"),
            api_url: String::from("https://api.exchange.test/v1/notices"),
            board_url: None,
            board_base_url: None,
            push_url: None,
            request_timeout: Duration::from_secs(3),
            poll_interval: Duration::from_secs(3),
            maintenance_interval: Duration::from_secs(60),
            live_window: DEFAULT_LIVE_WINDOW,
            cooldown: Duration::from_secs(30 * 60),
            grace_window: Duration::from_secs(5),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            rate_limit_idle: Duration::from_secs(10 * 60),
            extraction: ExtractionConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            rate_limit: RateLimitConfig::default(),
            latency: LatencyConfig::default(),
            logging: LoggingConfig::default(),
            store_home: None,
        }
    }
}

impl PipelineConfig {
    /// Defaults overlaid with `NOTICEWATCH_*` environment variables.
    pub fn from_env() -> Result<Self, ValidationError> {
        let mut config = Self::default();
        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from `lookup`, keyed by environment variable name.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ValidationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(value) = text("NOTICEWATCH_API_URL") {
            self.api_url = value;
        }
        if let Some(value) = text("NOTICEWATCH_BOARD_URL") {
            self.board_url = Some(value);
        }
        if let Some(value) = text("NOTICEWATCH_PUSH_URL") {
            self.push_url = Some(value);
        }
        if let Some(value) = text("NOTICEWATCH_HOME") {
            self.store_home = Some(PathBuf::from(value));
        }
        if let Some(value) = text("NOTICEWATCH_LOG_LEVEL") {
            self.logging.level = value;
        }
        if let Some(value) = text("NOTICEWATCH_LOG_FORMAT") {
            self.logging.format = value;
        }
        if let Some(value) = text("NOTICEWATCH_POLL_INTERVAL_MS") {
            self.poll_interval = parse_millis("poll_interval", &value)?;
        }
        if let Some(value) = text("NOTICEWATCH_LIVE_WINDOW_MS") {
            self.live_window = parse_millis("live_window", &value)?;
        }
        if let Some(value) = text("NOTICEWATCH_COOLDOWN_MS") {
            self.cooldown = parse_millis("cooldown", &value)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.poll_source.trim().is_empty() {
            return Err(invalid("poll_source", "must not be empty"));
        }
        if self.push_source.trim().is_empty() {
            return Err(invalid("push_source", "must not be empty"));
        }
        if self.poll_interval.is_zero() {
            return Err(invalid("poll_interval", "must be greater than zero"));
        }
        if self.maintenance_interval.is_zero() {
            return Err(invalid("maintenance_interval", "must be greater than zero"));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(invalid("circuit_breaker.failure_threshold", "must be at least 1"));
        }
        if self.rate_limit.max_requests == 0 {
            return Err(invalid("rate_limit.max_requests", "must be at least 1"));
        }
        if self.api_url.trim().is_empty() && self.board_url.is_none() {
            return Err(invalid("api_url", "either api_url or board_url is required"));
        }
        Ok(())
    }

    /// Base URL for resolving relative notice links. Notices published without
    /// a link resolve `notice/{id}` against it.
    pub fn link_base(&self) -> Option<&str> {
        self.board_base_url
            .as_deref()
            .or(self.board_url.as_deref())
            .or(Some(self.api_url.as_str()))
            .filter(|value| !value.trim().is_empty())
    }

    pub fn store_config(&self) -> StoreConfig {
        match &self.store_home {
            Some(home) => StoreConfig::in_dir(home.clone()),
            None => StoreConfig::default(),
        }
    }
}

fn parse_millis(field: &'static str, value: &str) -> Result<Duration, ValidationError> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|err| invalid(field, &format!("'{value}' is not a millisecond count: {err}")))
}

fn invalid(field: &'static str, reason: &str) -> ValidationError {
    ValidationError::InvalidConfig {
        field,
        reason: reason.to_owned(),
    }
}
