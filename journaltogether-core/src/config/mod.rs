//! Configuration management for journaltogether
//!
//! Defaults, TOML files and `JOURNALTOGETHER_*` environment overrides, with
//! validation applied after every load.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

mod error;

pub use error::ConfigError;

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Session bootstrap and its collaborators
    pub session: SessionConfig,

    /// Remote store
    pub store: StoreConfig,

    /// Membership reconciler
    pub membership: MembershipConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a magic code stays redeemable
    #[serde(with = "humantime_serde")]
    pub code_ttl: Duration,

    /// Lifetime of the signed credential returned for a code
    #[serde(with = "humantime_serde")]
    pub credential_ttl: Duration,

    /// Clock difference tolerated when the auth service checks credential times
    #[serde(with = "humantime_serde")]
    pub max_clock_skew: Duration,
}

/// Store configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON document loaded into the in-memory store at startup
    pub seed_file: Option<PathBuf>,
}

/// Membership configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipConfig {
    /// Upper bound on a single store read or transaction
    #[serde(with = "humantime_serde")]
    pub operation_timeout: Duration,

    /// Upper bound on handing an invitation to the application server
    #[serde(with = "humantime_serde")]
    pub invite_delivery_timeout: Duration,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable JSON formatting
    pub json_format: bool,

    /// Include target module
    pub with_target: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            code_ttl: Duration::from_secs(10 * 60),
            credential_ttl: Duration::from_secs(5 * 60),
            max_clock_skew: Duration::from_secs(30),
        }
    }
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(10),
            invite_delivery_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_target: true,
        }
    }
}

fn parse_var<T>(name: &str, expected: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw.parse::<T>().map(Some).map_err(|e| ConfigError::Env {
            var: name.to_string(),
            expected,
            reason: e.to_string(),
        }),
        Err(_) => Ok(None),
    }
}

fn parse_duration_var(name: &str) -> Result<Option<Duration>, ConfigError> {
    match env::var(name) {
        Ok(raw) => humantime::parse_duration(&raw)
            .map(Some)
            .map_err(|e| ConfigError::Env {
                var: name.to_string(),
                expected: "duration",
                reason: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Load configuration from environment variables on top of the defaults
    ///
    /// Environment variables follow the pattern: JOURNALTOGETHER_<SECTION>_<KEY>
    /// Example: JOURNALTOGETHER_SESSION_CODE_TTL=15m
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Overlay `JOURNALTOGETHER_*` variables onto this configuration
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        // Session config
        if let Some(ttl) = parse_duration_var("JOURNALTOGETHER_SESSION_CODE_TTL")? {
            self.session.code_ttl = ttl;
        }
        if let Some(ttl) = parse_duration_var("JOURNALTOGETHER_SESSION_CREDENTIAL_TTL")? {
            self.session.credential_ttl = ttl;
        }
        if let Some(skew) = parse_duration_var("JOURNALTOGETHER_SESSION_MAX_CLOCK_SKEW")? {
            self.session.max_clock_skew = skew;
        }

        // Store config
        if let Ok(seed) = env::var("JOURNALTOGETHER_STORE_SEED_FILE") {
            self.store.seed_file = Some(PathBuf::from(seed));
        }

        // Membership config
        if let Some(timeout) = parse_duration_var("JOURNALTOGETHER_MEMBERSHIP_OPERATION_TIMEOUT")? {
            self.membership.operation_timeout = timeout;
        }
        if let Some(timeout) =
            parse_duration_var("JOURNALTOGETHER_MEMBERSHIP_INVITE_DELIVERY_TIMEOUT")?
        {
            self.membership.invite_delivery_timeout = timeout;
        }

        // Logging config
        if let Ok(level) = env::var("JOURNALTOGETHER_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(json) = parse_var("JOURNALTOGETHER_LOG_JSON", "boolean")? {
            self.logging.json_format = json;
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Validate session config
        if self.session.code_ttl.is_zero() {
            return Err(ConfigError::invalid("session.code_ttl", "must be greater than 0"));
        }
        if self.session.credential_ttl.is_zero() {
            return Err(ConfigError::invalid(
                "session.credential_ttl",
                "must be greater than 0",
            ));
        }
        if self.session.max_clock_skew >= self.session.credential_ttl {
            return Err(ConfigError::invalid(
                "session.max_clock_skew",
                "must be shorter than credential_ttl",
            ));
        }

        // Validate membership config
        if self.membership.operation_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "membership.operation_timeout",
                "must be greater than 0",
            ));
        }
        if self.membership.invite_delivery_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "membership.invite_delivery_timeout",
                "must be greater than 0",
            ));
        }

        // Validate logging config
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::invalid(
                "logging.level",
                format!("unknown level {:?}", self.logging.level),
            ));
        }

        Ok(())
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Render(e.to_string()))
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents = self.to_toml()?;
        std::fs::write(path, contents).map_err(|e| ConfigError::Write {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(())
    }
}
