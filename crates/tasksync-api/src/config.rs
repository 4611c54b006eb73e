use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

const MIN_JWT_SECRET_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub database_path: String,
    pub jwt_secret: String,
    pub jwt_issuer: Option<String>,
    pub jwt_audience: String,
    pub auth_clock_skew: Duration,
    pub rate_limit_window: Duration,
    pub push_rate_limit_per_window: u32,
    pub pull_rate_limit_per_window: u32,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("database_path", &self.database_path)
            .field("jwt_secret", &"[REDACTED]")
            .field("jwt_issuer", &self.jwt_issuer)
            .field("jwt_audience", &self.jwt_audience)
            .field("auth_clock_skew", &self.auth_clock_skew)
            .field("rate_limit_window", &self.rate_limit_window)
            .field(
                "push_rate_limit_per_window",
                &self.push_rate_limit_per_window,
            )
            .field(
                "pull_rate_limit_per_window",
                &self.pull_rate_limit_per_window,
            )
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "TASKSYNC_BIND_ADDR", "127.0.0.1:8080");
        let database_path = value_or_default(&lookup, "TASKSYNC_DATABASE_PATH", "tasksync.db");

        let jwt_secret = required_trimmed(&lookup, "TASKSYNC_JWT_SECRET")?;
        if jwt_secret.len() < MIN_JWT_SECRET_LEN {
            return Err(ConfigError::Invalid(format!(
                "TASKSYNC_JWT_SECRET must be at least {MIN_JWT_SECRET_LEN} bytes"
            )));
        }
        let jwt_issuer = optional_trimmed(&lookup, "TASKSYNC_JWT_ISSUER");
        let jwt_audience = value_or_default(&lookup, "TASKSYNC_JWT_AUDIENCE", "authenticated");

        let auth_clock_skew_secs =
            bounded_integer(&lookup, "AUTH_CLOCK_SKEW_SECS", "60", 0..=300)?;
        let rate_limit_window_secs =
            bounded_integer(&lookup, "RATE_LIMIT_WINDOW_SECS", "60", 10..=3_600)?;
        let push_rate_limit_per_window =
            bounded_integer(&lookup, "PUSH_RATE_LIMIT_PER_WINDOW", "60", 1..=1_000)?;
        let pull_rate_limit_per_window =
            bounded_integer(&lookup, "PULL_RATE_LIMIT_PER_WINDOW", "240", 1..=5_000)?;

        Ok(Self {
            bind_addr,
            database_path,
            jwt_secret,
            jwt_issuer,
            jwt_audience,
            auth_clock_skew: Duration::from_secs(auth_clock_skew_secs),
            rate_limit_window: Duration::from_secs(rate_limit_window_secs),
            push_rate_limit_per_window: u32::try_from(push_rate_limit_per_window)
                .map_err(|_| ConfigError::Invalid("PUSH_RATE_LIMIT_PER_WINDOW".to_string()))?,
            pull_rate_limit_per_window: u32::try_from(pull_rate_limit_per_window)
                .map_err(|_| ConfigError::Invalid("PULL_RATE_LIMIT_PER_WINDOW".to_string()))?,
        })
    }
}

fn bounded_integer(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: &str,
    range: std::ops::RangeInclusive<u64>,
) -> Result<u64, ConfigError> {
    let describe = || {
        format!(
            "{name} must be an integer in [{}, {}]",
            range.start(),
            range.end()
        )
    };
    let value = value_or_default(lookup, name, default)
        .parse::<u64>()
        .map_err(|_| ConfigError::Invalid(describe()))?;
    if !range.contains(&value) {
        return Err(ConfigError::Invalid(describe()));
    }
    Ok(value)
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn required_trimmed(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    optional_trimmed(lookup, name).ok_or(ConfigError::MissingVar(name))
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn config_from(map: &HashMap<&str, &str>) -> Result<AppConfig, ConfigError> {
        AppConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
    }

    #[test]
    fn config_requires_jwt_secret() {
        let map: HashMap<&str, &str> = HashMap::new();
        let err = config_from(&map).unwrap_err();
        assert!(err.to_string().contains("TASKSYNC_JWT_SECRET"));
    }

    #[test]
    fn config_rejects_short_secret() {
        let map = HashMap::from([("TASKSYNC_JWT_SECRET", "short")]);
        assert!(matches!(config_from(&map), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn config_applies_defaults() {
        let map = HashMap::from([("TASKSYNC_JWT_SECRET", SECRET)]);
        let config = config_from(&map).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.database_path, "tasksync.db");
        assert_eq!(config.jwt_audience, "authenticated");
        assert_eq!(config.jwt_issuer, None);
        assert_eq!(config.rate_limit_window, Duration::from_secs(60));
        assert_eq!(config.push_rate_limit_per_window, 60);
        assert_eq!(config.pull_rate_limit_per_window, 240);
    }

    #[test]
    fn config_validates_ranges() {
        let map = HashMap::from([
            ("TASKSYNC_JWT_SECRET", SECRET),
            ("RATE_LIMIT_WINDOW_SECS", "5"),
        ]);
        let err = config_from(&map).unwrap_err();
        assert!(err.to_string().contains("RATE_LIMIT_WINDOW_SECS"));

        let map = HashMap::from([
            ("TASKSYNC_JWT_SECRET", SECRET),
            ("AUTH_CLOCK_SKEW_SECS", "soon"),
        ]);
        assert!(config_from(&map).is_err());
    }

    #[test]
    fn config_redacts_sensitive_debug_fields() {
        let map = HashMap::from([("TASKSYNC_JWT_SECRET", SECRET)]);
        let config = config_from(&map).unwrap();

        let debug_output = format!("{config:?}");
        assert!(!debug_output.contains(SECRET));
        assert!(debug_output.contains("[REDACTED]"));
    }
}
