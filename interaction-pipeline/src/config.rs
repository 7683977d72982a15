use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use interaction_common::retry::RetryPolicy;
use thiserror::Error;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3303")]
    pub port: u16,

    /// Which database driver `database_url` points at: sqlite or mysql.
    #[envconfig(from = "DATABASE_DRIVER", default = "sqlite")]
    pub database_driver: String,

    #[envconfig(from = "DATABASE_URL", default = "sqlite://interactions.db?mode=rwc")]
    pub database_url: String,

    #[envconfig(from = "MAX_DB_CONNECTIONS", default = "10")]
    pub max_db_connections: u32,

    /// Counters and cached profiles live in memory unless a Redis URL is set.
    #[envconfig(from = "REDIS_URL")]
    pub redis_url: Option<String>,

    #[envconfig(from = "EVENT_BUFFER_SIZE", default = "1024")]
    pub event_buffer_size: usize,

    #[envconfig(from = "CLEANUP_INTERVAL_SECS", default = "1800")]
    pub cleanup_interval_secs: u64,

    #[envconfig(from = "DEFAULT_RETENTION_INTERVAL_SECS", default = "7200")]
    pub default_retention_interval_secs: i64,

    /// Read retention from the users table when a profile is missing from the cache.
    #[envconfig(from = "RETENTION_PROFILE_FALLBACK", default = "false")]
    pub retention_profile_fallback: bool,

    #[envconfig(from = "MAX_CALLBACK_FAILURES", default = "5")]
    pub max_callback_failures: i64,

    #[envconfig(from = "MAX_CONCURRENT_CALLBACKS", default = "1024")]
    pub max_concurrent_callbacks: usize,

    #[envconfig(from = "CALLBACK_REQUEST_TIMEOUT", default = "10000")]
    pub callback_request_timeout: EnvMsDuration,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,

    #[envconfig(from = "INSERT_FAILURE_POLICY", default = "fatal")]
    pub insert_failure_policy: InsertFailurePolicy,

    #[envconfig(from = "SHUTDOWN_TIMEOUT", default = "30000")]
    pub shutdown_timeout: EnvMsDuration,

    #[envconfig(from = "MAX_BODY_SIZE", default = "1000000")]
    pub max_body_size: usize,

    #[envconfig(from = "CONCURRENCY_LIMIT", default = "1000")]
    pub concurrency_limit: usize,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn cleanup_interval(&self) -> time::Duration {
        time::Duration::from_secs(self.cleanup_interval_secs)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Envconfig, Clone)]
pub struct RetryPolicyConfig {
    #[envconfig(from = "CALLBACK_MAX_ATTEMPTS", default = "3")]
    pub max_attempts: u32,

    #[envconfig(from = "CALLBACK_BACKOFF_COEFFICIENT", default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(from = "CALLBACK_INITIAL_INTERVAL", default = "5000")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(from = "CALLBACK_MAXIMUM_INTERVAL", default = "60000")]
    pub maximum_interval: EnvMsDuration,
}

impl RetryPolicyConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::build(self.backoff_coefficient, self.initial_interval.0)
            .maximum_interval(self.maximum_interval.0)
            .max_attempts(self.max_attempts)
            .provide()
    }
}

/// What the dispatcher does when an interaction cannot be persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertFailurePolicy {
    /// Stop the dispatcher, which brings the whole process down.
    Fatal,
    /// Log, count and move on to the next interaction.
    Skip,
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0} is not a valid insert failure policy")]
pub struct ParseInsertFailurePolicyError(pub String);

impl FromStr for InsertFailurePolicy {
    type Err = ParseInsertFailurePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_ref() {
            "fatal" => Ok(InsertFailurePolicy::Fatal),
            "skip" => Ok(InsertFailurePolicy::Skip),
            invalid => Err(ParseInsertFailurePolicyError(invalid.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::init_from_hashmap(&HashMap::new()).expect("defaults should parse");

        assert_eq!(config.bind(), "0.0.0.0:3303");
        assert_eq!(config.database_driver, "sqlite");
        assert_eq!(config.redis_url, None);
        assert_eq!(config.cleanup_interval(), time::Duration::from_secs(1800));
        assert_eq!(config.default_retention_interval_secs, 7200);
        assert_eq!(config.max_callback_failures, 5);
        assert_eq!(config.insert_failure_policy, InsertFailurePolicy::Fatal);
        assert_eq!(config.retry_policy.policy(), RetryPolicy::default());
    }

    #[test]
    fn test_overrides() {
        let env = HashMap::from([
            ("DATABASE_DRIVER".to_owned(), "mysql".to_owned()),
            ("INSERT_FAILURE_POLICY".to_owned(), "skip".to_owned()),
            ("CALLBACK_MAX_ATTEMPTS".to_owned(), "5".to_owned()),
            ("CALLBACK_INITIAL_INTERVAL".to_owned(), "10".to_owned()),
            ("REDIS_URL".to_owned(), "redis://localhost:6379".to_owned()),
        ]);

        let config = Config::init_from_hashmap(&env).expect("overrides should parse");

        assert_eq!(config.database_driver, "mysql");
        assert_eq!(config.insert_failure_policy, InsertFailurePolicy::Skip);
        assert_eq!(config.redis_url.as_deref(), Some("redis://localhost:6379"));

        let policy = config.retry_policy.policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.retry_interval(1), time::Duration::from_millis(10));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(EnvMsDuration::from_str("soon").is_err());
        assert_eq!(
            InsertFailurePolicy::from_str("retry"),
            Err(ParseInsertFailurePolicyError("retry".to_owned()))
        );
        let error: Box<dyn std::error::Error> =
            Box::new(InsertFailurePolicy::from_str("Retry").unwrap_err());
        assert_eq!(error.to_string(), "retry is not a valid insert failure policy");

        let env = HashMap::from([("INSERT_FAILURE_POLICY".to_owned(), "retry".to_owned())]);
        assert!(Config::init_from_hashmap(&env).is_err());
    }
}
