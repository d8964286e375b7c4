use crate::backoff::{BackoffStrategy, RetryPolicy};
use secrecy::SecretString;
use std::{str::FromStr, time::Duration};
use tracing::Level;
use url::Url;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Settings a [`Session`](crate::session::Session) is constructed with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    pub endpoint: String,
    pub retry: RetryPolicy,
    /// Capacity of the outbound queue; `send` reports backpressure beyond it.
    pub send_buffer: usize,
    /// How long a replaced transport may take to flush its close frame.
    pub close_grace: Duration,
}

impl SessionConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            retry: RetryPolicy::default(),
            send_buffer: 64,
            close_grace: Duration::from_millis(500),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_send_buffer(mut self, send_buffer: usize) -> Self {
        self.send_buffer = send_buffer.max(1);
        self
    }
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Debug)]
pub struct Config {
    pub session: SessionConfig,
    pub token: Option<SecretString>,
    pub secret_service_url: Option<Url>,
    pub secret_id: Option<String>,
    pub log_level: Level,
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with_endpoint(None)
    }

    /// Like [`Config::from_env`], but `endpoint` (when given) takes
    /// precedence over `REALTIME_ENDPOINT`.
    pub fn from_env_with_endpoint(endpoint: Option<String>) -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let endpoint = match endpoint {
            Some(endpoint) => endpoint,
            None => std::env::var("REALTIME_ENDPOINT")
                .map_err(|_| ConfigError::MissingVar("REALTIME_ENDPOINT".to_string()))?,
        };

        let token = std::env::var("REALTIME_TOKEN")
            .ok()
            .filter(|t| !t.is_empty())
            .map(SecretString::from);

        let retry_limit = parse_var("REALTIME_RETRY_LIMIT", 5u32)?;
        let base_ms = parse_var("REALTIME_RETRY_BASE_MS", 1000u64)?;
        let max_ms = parse_var("REALTIME_RETRY_MAX_MS", 30_000u64)?;
        let strategy = parse_var("REALTIME_BACKOFF", BackoffStrategy::Linear)?;
        let send_buffer = parse_var("REALTIME_SEND_BUFFER", 64usize)?;
        if send_buffer == 0 {
            return Err(ConfigError::InvalidValue(
                "REALTIME_SEND_BUFFER".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let secret_service_url = match std::env::var("SECRET_SERVICE_URL") {
            Ok(raw) => Some(Url::parse(&raw).map_err(|e| {
                ConfigError::InvalidValue("SECRET_SERVICE_URL".to_string(), e.to_string())
            })?),
            Err(_) => None,
        };
        let secret_id = std::env::var("SECRET_ID").ok().filter(|s| !s.is_empty());
        if secret_id.is_some() && secret_service_url.is_none() {
            return Err(ConfigError::MissingVar(
                "SECRET_SERVICE_URL must be set when SECRET_ID is used".to_string(),
            ));
        }

        let retry = RetryPolicy::new(retry_limit, Duration::from_millis(base_ms))
            .with_max_delay(Duration::from_millis(max_ms.max(base_ms)))
            .with_strategy(strategy);

        Ok(Self {
            session: SessionConfig::new(endpoint)
                .with_retry(retry)
                .with_send_buffer(send_buffer),
            token,
            secret_service_url,
            secret_id,
            log_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use serial_test::serial;
    use std::env;

    fn clear_env_vars() {
        unsafe {
            env::remove_var("REALTIME_ENDPOINT");
            env::remove_var("REALTIME_TOKEN");
            env::remove_var("REALTIME_RETRY_LIMIT");
            env::remove_var("REALTIME_RETRY_BASE_MS");
            env::remove_var("REALTIME_RETRY_MAX_MS");
            env::remove_var("REALTIME_BACKOFF");
            env::remove_var("REALTIME_SEND_BUFFER");
            env::remove_var("RUST_LOG");
            env::remove_var("SECRET_SERVICE_URL");
            env::remove_var("SECRET_ID");
        }
    }

    #[test]
    fn test_config_error_display() {
        let missing_var = ConfigError::MissingVar("TEST_VAR".to_string());
        assert_eq!(
            format!("{}", missing_var),
            "Missing environment variable: TEST_VAR"
        );

        let invalid_value =
            ConfigError::InvalidValue("TEST_VAR".to_string(), "bad_value".to_string());
        assert_eq!(
            format!("{}", invalid_value),
            "Invalid value for environment variable TEST_VAR: bad_value"
        );
    }

    #[test]
    #[serial]
    fn test_config_from_env_minimal() {
        clear_env_vars();
        unsafe {
            env::set_var("REALTIME_ENDPOINT", "https://api.example.com/realtime");
        }

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.session.endpoint, "https://api.example.com/realtime");
        assert_eq!(config.session.retry, RetryPolicy::default());
        assert_eq!(config.session.send_buffer, 64);
        assert!(config.token.is_none());
        assert!(config.secret_service_url.is_none());
        assert!(config.secret_id.is_none());
        assert_eq!(config.log_level, Level::INFO);
    }

    #[test]
    #[serial]
    fn test_config_from_env_custom_values() {
        clear_env_vars();
        unsafe {
            env::set_var("REALTIME_ENDPOINT", "ws://127.0.0.1:9000");
            env::set_var("REALTIME_TOKEN", "tok-123");
            env::set_var("REALTIME_RETRY_LIMIT", "3");
            env::set_var("REALTIME_RETRY_BASE_MS", "100");
            env::set_var("REALTIME_RETRY_MAX_MS", "800");
            env::set_var("REALTIME_BACKOFF", "exponential");
            env::set_var("REALTIME_SEND_BUFFER", "8");
            env::set_var("RUST_LOG", "debug");
            env::set_var("SECRET_SERVICE_URL", "https://secrets.example.com/v1/secrets");
            env::set_var("SECRET_ID", "realtime");
        }

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.session.retry.limit, 3);
        assert_eq!(config.session.retry.base_delay, Duration::from_millis(100));
        assert_eq!(config.session.retry.max_delay, Duration::from_millis(800));
        assert_eq!(config.session.retry.strategy, BackoffStrategy::Exponential);
        assert_eq!(config.session.send_buffer, 8);
        assert_eq!(config.token.unwrap().expose_secret(), "tok-123");
        assert_eq!(
            config.secret_service_url.unwrap().as_str(),
            "https://secrets.example.com/v1/secrets"
        );
        assert_eq!(config.secret_id.as_deref(), Some("realtime"));
        assert_eq!(config.log_level, Level::DEBUG);
    }

    #[test]
    #[serial]
    fn test_config_missing_endpoint() {
        clear_env_vars();

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::MissingVar(var) => assert_eq!(var, "REALTIME_ENDPOINT"),
            _ => panic!("Expected MissingVar for REALTIME_ENDPOINT"),
        }
    }

    #[test]
    #[serial]
    fn test_config_endpoint_override() {
        clear_env_vars();
        let config = Config::from_env_with_endpoint(Some("ws://override:9000".to_string()))
            .expect("Config should load successfully");
        assert_eq!(config.session.endpoint, "ws://override:9000");

        unsafe {
            env::set_var("REALTIME_ENDPOINT", "ws://from-env");
        }
        let config = Config::from_env_with_endpoint(Some("ws://override:9000".to_string()))
            .expect("Config should load successfully");
        assert_eq!(config.session.endpoint, "ws://override:9000");
    }

    #[test]
    #[serial]
    fn test_config_invalid_retry_limit() {
        clear_env_vars();
        unsafe {
            env::set_var("REALTIME_ENDPOINT", "ws://localhost");
            env::set_var("REALTIME_RETRY_LIMIT", "-1");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "REALTIME_RETRY_LIMIT"),
            _ => panic!("Expected InvalidValue for REALTIME_RETRY_LIMIT"),
        }
    }

    #[test]
    #[serial]
    fn test_config_invalid_backoff() {
        clear_env_vars();
        unsafe {
            env::set_var("REALTIME_ENDPOINT", "ws://localhost");
            env::set_var("REALTIME_BACKOFF", "random");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "REALTIME_BACKOFF"),
            _ => panic!("Expected InvalidValue for REALTIME_BACKOFF"),
        }
    }

    #[test]
    #[serial]
    fn test_config_invalid_log_level() {
        clear_env_vars();
        unsafe {
            env::set_var("REALTIME_ENDPOINT", "ws://localhost");
            env::set_var("RUST_LOG", "not-a-level");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "RUST_LOG"),
            _ => panic!("Expected InvalidValue for RUST_LOG"),
        }
    }

    #[test]
    #[serial]
    fn test_config_secret_id_requires_service_url() {
        clear_env_vars();
        unsafe {
            env::set_var("REALTIME_ENDPOINT", "ws://localhost");
            env::set_var("SECRET_ID", "realtime");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::MissingVar(msg) => assert!(msg.contains("SECRET_SERVICE_URL")),
            _ => panic!("Expected MissingVar for SECRET_SERVICE_URL"),
        }
    }

    #[test]
    #[serial]
    fn test_config_zero_send_buffer_rejected() {
        clear_env_vars();
        unsafe {
            env::set_var("REALTIME_ENDPOINT", "ws://localhost");
            env::set_var("REALTIME_SEND_BUFFER", "0");
        }

        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::InvalidValue(var, _)) if var == "REALTIME_SEND_BUFFER"
        ));
    }
}
