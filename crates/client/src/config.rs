//! Client configuration from environment variables.

use std::fmt;
use std::time::Duration;

use rand::Rng;

use crate::error::{SyncError, SyncResult};

/// Alias/secret pair presented in the login frame.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub alias: String,
    pub secret_key: String,
}

impl Credentials {
    pub fn new(alias: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            secret_key: secret_key.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("alias", &self.alias)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Exponential backoff policy.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Maximum number of attempts (0 = unlimited)
    pub max_attempts: u32,
    /// Initial delay in milliseconds
    pub initial_delay_ms: u32,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u32,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f32,
    /// Fraction of the delay randomised in either direction
    pub jitter: f32,
}

impl BackoffConfig {
    /// Policy for re-opening the socket.
    pub fn reconnect() -> Self {
        Self {
            max_attempts: 10,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 1.5,
            jitter: 0.2,
        }
    }

    /// Policy for retrying a rejected or unacknowledged subscribe.
    pub fn subscribe() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter: 0.0,
        }
    }

    /// Calculate delay for a given attempt number (zero-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let delay = self.initial_delay_ms as f32 * self.backoff_multiplier.powi(exponent);
        let capped = delay.min(self.max_delay_ms as f32);

        let spread = capped * self.jitter;
        let jittered = if spread > 0.0 {
            capped + rand::thread_rng().gen_range(-spread..=spread)
        } else {
            capped
        };
        Duration::from_millis(jittered.max(0.0) as u64)
    }

    /// Whether `attempts` made so far use up the budget.
    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts > 0 && attempts >= self.max_attempts
    }
}

/// Everything the realtime core needs to reach its two endpoints.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// WebSocket endpoint of the change-notification server.
    pub socket_url: String,
    /// Request/response endpoint of the document store.
    pub fetch_url: String,
    pub credentials: Credentials,
    /// Period of the authentication watchdog.
    pub heartbeat_interval: Duration,
    /// How long to wait for a login acknowledgement.
    pub handshake_timeout: Duration,
    /// How long to wait for a subscribe acknowledgement.
    pub subscribe_ack_timeout: Duration,
    /// Upper bound for a single fetch request.
    pub request_timeout: Duration,
    pub reconnect: BackoffConfig,
    pub subscribe_retry: BackoffConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            socket_url: "ws://localhost:8080/socket".to_string(),
            fetch_url: "http://localhost:8080/api/query".to_string(),
            credentials: Credentials::default(),
            heartbeat_interval: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            subscribe_ack_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            reconnect: BackoffConfig::reconnect(),
            subscribe_retry: BackoffConfig::subscribe(),
        }
    }
}

impl SyncConfig {
    /// Read configuration from environment variables.
    ///
    /// Environment variables (all optional):
    /// - `CRMSYNC_SOCKET_URL`: change-notification socket (default: "ws://localhost:8080/socket")
    /// - `CRMSYNC_FETCH_URL`: document store endpoint (default: "http://localhost:8080/api/query")
    /// - `CRMSYNC_ALIAS` / `CRMSYNC_SECRET_KEY`: login pair (default: empty)
    /// - `CRMSYNC_HEARTBEAT_SECS`: watchdog period (default: 30)
    /// - `CRMSYNC_HANDSHAKE_TIMEOUT_SECS`: login ack timeout (default: 10)
    /// - `CRMSYNC_SUBSCRIBE_TIMEOUT_SECS`: subscribe ack timeout (default: 10)
    /// - `CRMSYNC_REQUEST_TIMEOUT_SECS`: fetch request timeout (default: 30)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            socket_url: std::env::var("CRMSYNC_SOCKET_URL").unwrap_or(defaults.socket_url),
            fetch_url: std::env::var("CRMSYNC_FETCH_URL").unwrap_or(defaults.fetch_url),
            credentials: Credentials {
                alias: std::env::var("CRMSYNC_ALIAS").unwrap_or_default(),
                secret_key: std::env::var("CRMSYNC_SECRET_KEY").unwrap_or_default(),
            },
            heartbeat_interval: env_secs("CRMSYNC_HEARTBEAT_SECS", defaults.heartbeat_interval),
            handshake_timeout: env_secs(
                "CRMSYNC_HANDSHAKE_TIMEOUT_SECS",
                defaults.handshake_timeout,
            ),
            subscribe_ack_timeout: env_secs(
                "CRMSYNC_SUBSCRIBE_TIMEOUT_SECS",
                defaults.subscribe_ack_timeout,
            ),
            request_timeout: env_secs("CRMSYNC_REQUEST_TIMEOUT_SECS", defaults.request_timeout),
            ..defaults
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn validate(&self) -> SyncResult<()> {
        check_url(&self.socket_url, &["ws", "wss"])?;
        check_url(&self.fetch_url, &["http", "https"])?;
        for (name, value) in [
            ("heartbeat_interval", self.heartbeat_interval),
            ("handshake_timeout", self.handshake_timeout),
            ("subscribe_ack_timeout", self.subscribe_ack_timeout),
        ] {
            if value.is_zero() {
                return Err(SyncError::Config(format!("{name} must be greater than zero")));
            }
        }
        Ok(())
    }
}

fn env_secs(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn check_url(raw: &str, schemes: &[&str]) -> SyncResult<()> {
    let parsed =
        url::Url::parse(raw).map_err(|e| SyncError::Config(format!("invalid URL `{raw}`: {e}")))?;
    if !schemes.contains(&parsed.scheme()) {
        return Err(SyncError::Config(format!(
            "`{raw}` must use one of: {}",
            schemes.join(", ")
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = BackoffConfig {
            jitter: 0.0,
            ..BackoffConfig::subscribe()
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(10_000));
    }

    #[test]
    fn jitter_stays_within_spread() {
        let policy = BackoffConfig::reconnect();
        for _ in 0..50 {
            let delay = policy.delay_for_attempt(0).as_millis();
            assert!((800..=1200).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn zero_max_attempts_never_exhausts() {
        let policy = BackoffConfig {
            max_attempts: 0,
            ..BackoffConfig::subscribe()
        };
        assert!(!policy.exhausted(u32::MAX));
        assert!(BackoffConfig::subscribe().exhausted(5));
        assert!(!BackoffConfig::subscribe().exhausted(4));
    }

    #[test]
    fn validate_rejects_wrong_schemes() {
        let config = SyncConfig {
            socket_url: "http://localhost/socket".into(),
            ..SyncConfig::default()
        };
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
        assert!(SyncConfig::default().validate().is_ok());
    }

    #[test]
    fn credentials_debug_hides_secret() {
        let creds = Credentials::new("mobile", "s3cret");
        assert!(!format!("{creds:?}").contains("s3cret"));
    }
}
