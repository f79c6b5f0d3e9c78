use clap::{ArgAction, Parser};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{ThrottlerError, ThrottlerResult};

const VALID_ENVIRONMENTS: [&str; 4] = ["development", "staging", "production", "test"];

#[derive(Debug, Clone, Parser, Serialize, Deserialize)]
#[command(name = "gatekeeper", version, about)]
#[serde(default)]
pub struct Config {
    /// Server bind address
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:4000")]
    pub bind_addr: SocketAddr,

    /// Environment (development|staging|production|test)
    #[arg(long = "env", env = "APP_ENV", default_value = "development")]
    pub environment: String,

    /// Log level used when RUST_LOG is not set
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Enable per-client rate limiting
    #[arg(
        long = "limiter-enabled",
        env = "LIMITER_ENABLED",
        default_value_t = true,
        action = ArgAction::Set,
    )]
    pub rate_limit_enabled: bool,

    /// Token refill rate per client
    #[arg(long = "limiter-rps", env = "LIMITER_RPS", default_value_t = 2.0)]
    pub requests_per_second: f64,

    /// Maximum burst per client
    #[arg(long = "limiter-burst", env = "LIMITER_BURST", default_value_t = 4)]
    pub burst: u32,

    /// Resolve clients from X-Forwarded-For / X-Real-IP
    #[arg(long, env = "TRUST_PROXY_HEADERS", default_value_t = false, action = ArgAction::Set)]
    pub trust_proxy_headers: bool,

    /// How often idle clients are evicted
    #[arg(
        long,
        env = "SWEEP_INTERVAL",
        default_value = "1m",
        value_parser = humantime::parse_duration,
    )]
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Idle time after which a client is evicted
    #[arg(
        long,
        env = "IDLE_EVICTION_THRESHOLD",
        default_value = "3m",
        value_parser = humantime::parse_duration,
    )]
    #[serde(with = "humantime_serde")]
    pub idle_eviction_threshold: Duration,

    /// Upper bound on the graceful shutdown drain
    #[arg(
        long,
        env = "SHUTDOWN_DRAIN_DEADLINE",
        default_value = "30s",
        value_parser = humantime::parse_duration,
    )]
    #[serde(with = "humantime_serde")]
    pub shutdown_drain_deadline: Duration,

    /// Upper bound on handling one request
    #[arg(
        long,
        env = "REQUEST_TIMEOUT",
        default_value = "10s",
        value_parser = humantime::parse_duration,
    )]
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Largest accepted request body in bytes
    #[arg(long, env = "MAX_BODY_BYTES", default_value_t = 1_048_576)]
    pub max_body_bytes: usize,

    /// Simulated delivery time of a queued notification
    #[arg(
        long,
        env = "NOTIFICATION_DELAY",
        default_value = "500ms",
        value_parser = humantime::parse_duration,
    )]
    #[serde(with = "humantime_serde")]
    pub notification_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 4000)),
            environment: "development".to_string(),
            log_level: "info".to_string(),
            rate_limit_enabled: true,
            requests_per_second: 2.0,
            burst: 4,
            trust_proxy_headers: false,
            sweep_interval: Duration::from_secs(60),
            idle_eviction_threshold: Duration::from_secs(180),
            shutdown_drain_deadline: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
            max_body_bytes: 1_048_576,
            notification_delay: Duration::from_millis(500),
        }
    }
}

impl Config {
    /// Parse command line flags, falling back to environment variables
    pub fn from_args() -> ThrottlerResult<Self> {
        let config = Config::parse();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ThrottlerResult<()> {
        if !VALID_ENVIRONMENTS.contains(&self.environment.to_lowercase().as_str()) {
            return Err(ThrottlerError::ConfigurationError(format!(
                "Invalid environment '{}'. Must be one of: {:?}",
                self.environment, VALID_ENVIRONMENTS
            )));
        }

        if self.burst == 0 {
            return Err(ThrottlerError::ConfigurationError(
                "Limiter burst must be greater than 0".to_string(),
            ));
        }

        if !self.requests_per_second.is_finite() || self.requests_per_second < 0.0 {
            return Err(ThrottlerError::ConfigurationError(
                "Limiter rps must be a non-negative number".to_string(),
            ));
        }

        if self.sweep_interval.is_zero() {
            return Err(ThrottlerError::ConfigurationError(
                "Sweep interval must be greater than 0".to_string(),
            ));
        }

        if self.idle_eviction_threshold < self.sweep_interval {
            return Err(ThrottlerError::ConfigurationError(
                "Idle eviction threshold must not be shorter than the sweep interval".to_string(),
            ));
        }

        if self.shutdown_drain_deadline.is_zero() {
            return Err(ThrottlerError::ConfigurationError(
                "Shutdown drain deadline must be greater than 0".to_string(),
            ));
        }

        if self.request_timeout.is_zero() {
            return Err(ThrottlerError::ConfigurationError(
                "Request timeout must be greater than 0".to_string(),
            ));
        }

        if self.max_body_bytes == 0 {
            return Err(ThrottlerError::ConfigurationError(
                "Max body bytes must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
