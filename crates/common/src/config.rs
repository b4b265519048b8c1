use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::types::Provider;

/// Store backend selected at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    Redis,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(StoreBackend::Postgres),
            "redis" => Ok(StoreBackend::Redis),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(anyhow::anyhow!(
                "Unknown store backend '{}'. Valid backends: postgres, redis, memory",
                other
            )),
        }
    }
}

/// Exponential backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Attempts after which a retryable outcome becomes permanent.
    pub max_attempts: u32,
    /// Delay before the first retry. Doubled on every further attempt.
    pub base_delay: Duration,
    /// Hard cap on the computed delay.
    pub max_delay: Duration,
    /// Add bounded random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(3600),
            jitter: true,
        }
    }
}

/// Default dispatcher pool size per provider family.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherDefaults {
    pub apns: usize,
    pub gcm: usize,
    pub wpns: usize,
    pub adm: usize,
}

impl DispatcherDefaults {
    pub fn for_provider(&self, provider: Provider) -> usize {
        let size = match provider {
            Provider::Apns => self.apns,
            Provider::Gcm => self.gcm,
            Provider::Wpns => self.wpns,
            Provider::Adm => self.adm,
        };
        size.max(1)
    }
}

impl Default for DispatcherDefaults {
    fn default() -> Self {
        Self {
            apns: 1,
            gcm: 1,
            wpns: 1,
            adm: 1,
        }
    }
}

/// Binary gateway settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ApnsConfig {
    /// `(host, port)` replacing the environment's gateway.
    pub gateway_override: Option<(String, u16)>,
    /// `(host, port)` replacing the environment's feedback service.
    pub feedback_override: Option<(String, u16)>,
    /// Number of recent sends kept for error correlation.
    pub ring_buffer_capacity: usize,
    /// How long the error reader waits for a frame before re-checking shutdown.
    pub error_select_timeout: Duration,
    /// Reconnect before writing when the socket has been idle this long.
    pub idle_reconnect: Duration,
    pub feedback_poll: Duration,
}

impl Default for ApnsConfig {
    fn default() -> Self {
        Self {
            gateway_override: None,
            feedback_override: None,
            ring_buffer_capacity: 1000,
            error_select_timeout: Duration::from_secs(10),
            idle_reconnect: Duration::from_secs(30 * 60),
            feedback_poll: Duration::from_secs(60),
        }
    }
}

/// Connect and read timeouts plus the HTTP provider endpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub gcm_endpoint: String,
    /// Contains a `{registration_id}` placeholder.
    pub adm_endpoint: String,
    pub adm_token_endpoint: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            gcm_endpoint: "https://fcm.googleapis.com/fcm/send".to_string(),
            adm_endpoint:
                "https://api.amazon.com/messaging/registrations/{registration_id}/messages"
                    .to_string(),
            adm_token_endpoint: "https://api.amazon.com/auth/O2/token".to_string(),
        }
    }
}

/// Global daemon configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub store: StoreBackend,

    /// PostgreSQL connection string (required for the postgres backend)
    pub database_url: Option<String>,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Redis connection string
    pub redis_url: String,

    /// Feeder poll interval
    pub push_poll: Duration,

    /// Notifications fetched per app per feeder cycle
    pub batch_size: usize,

    /// Queue depth above which the feeder skips an app for a cycle
    pub queue_watermark: usize,

    /// How long an idle worker waits on an empty queue before re-checking shutdown
    pub pop_timeout: Duration,

    /// Periodic resynchronisation interval. `None` disables the timer.
    pub sync_interval: Option<Duration>,

    pub dispatchers: DispatcherDefaults,

    /// Backoff for retryable notification outcomes
    pub retry: RetryConfig,

    /// Backoff for apps whose pool failed to start
    pub app_retry: RetryConfig,

    pub apns: ApnsConfig,

    pub http: HttpConfig,

    /// Group same-payload notifications into multicast requests
    pub batch_deliveries: bool,

    /// Deliver everything that is due once, then exit
    pub push_mode: bool,

    /// Emit human-readable logs instead of JSON
    pub pretty_logs: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            store: StoreBackend::Memory,
            database_url: None,
            db_max_connections: 20,
            redis_url: "redis://localhost:6379".to_string(),
            push_poll: Duration::from_secs(2),
            batch_size: 100,
            queue_watermark: 1000,
            pop_timeout: Duration::from_secs(1),
            sync_interval: Some(Duration::from_secs(60)),
            dispatchers: DispatcherDefaults::default(),
            retry: RetryConfig::default(),
            app_retry: RetryConfig {
                max_attempts: u32::MAX,
                base_delay: Duration::from_secs(5),
                max_delay: Duration::from_secs(300),
                jitter: true,
            },
            apns: ApnsConfig::default(),
            http: HttpConfig::default(),
            batch_deliveries: true,
            push_mode: false,
            pretty_logs: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let store: StoreBackend = env_or("PUSHGATE_STORE", StoreBackend::Postgres)?;
        let database_url = std::env::var("DATABASE_URL").ok();
        if store == StoreBackend::Postgres && database_url.is_none() {
            return Err(anyhow::anyhow!(
                "DATABASE_URL environment variable is required for the postgres store"
            ));
        }

        let sync_interval_secs: u64 = env_or("PUSHGATE_SYNC_INTERVAL_SECS", 60)?;

        Ok(Self {
            store,
            database_url,
            db_max_connections: env_or("DB_MAX_CONNECTIONS", defaults.db_max_connections)?,
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            push_poll: Duration::from_millis(env_or("PUSHGATE_PUSH_POLL_MS", 2000)?),
            batch_size: env_or("PUSHGATE_BATCH_SIZE", defaults.batch_size)?,
            queue_watermark: env_or("PUSHGATE_QUEUE_WATERMARK", defaults.queue_watermark)?,
            pop_timeout: Duration::from_millis(env_or("PUSHGATE_POP_TIMEOUT_MS", 1000)?),
            sync_interval: (sync_interval_secs > 0)
                .then(|| Duration::from_secs(sync_interval_secs)),
            dispatchers: DispatcherDefaults {
                apns: env_or("PUSHGATE_DISPATCHERS_APNS", 1)?,
                gcm: env_or("PUSHGATE_DISPATCHERS_GCM", 1)?,
                wpns: env_or("PUSHGATE_DISPATCHERS_WPNS", 1)?,
                adm: env_or("PUSHGATE_DISPATCHERS_ADM", 1)?,
            },
            retry: RetryConfig {
                max_attempts: env_or("PUSHGATE_MAX_ATTEMPTS", defaults.retry.max_attempts)?,
                base_delay: Duration::from_millis(env_or("PUSHGATE_BACKOFF_BASE_MS", 2000)?),
                max_delay: Duration::from_secs(env_or("PUSHGATE_BACKOFF_MAX_SECS", 3600)?),
                jitter: env_or("PUSHGATE_BACKOFF_JITTER", true)?,
            },
            app_retry: RetryConfig {
                base_delay: Duration::from_secs(env_or("PUSHGATE_APP_RETRY_BASE_SECS", 5)?),
                max_delay: Duration::from_secs(env_or("PUSHGATE_APP_RETRY_MAX_SECS", 300)?),
                ..defaults.app_retry
            },
            apns: ApnsConfig {
                gateway_override: env_host_port("PUSHGATE_APNS_GATEWAY")?,
                feedback_override: env_host_port("PUSHGATE_APNS_FEEDBACK")?,
                ring_buffer_capacity: env_or(
                    "PUSHGATE_RING_BUFFER_CAPACITY",
                    defaults.apns.ring_buffer_capacity,
                )?,
                error_select_timeout: Duration::from_millis(env_or(
                    "PUSHGATE_ERROR_SELECT_TIMEOUT_MS",
                    10_000,
                )?),
                idle_reconnect: Duration::from_secs(env_or("PUSHGATE_IDLE_RECONNECT_SECS", 1800)?),
                feedback_poll: Duration::from_secs(env_or("PUSHGATE_FEEDBACK_POLL_SECS", 60)?),
            },
            http: HttpConfig {
                connect_timeout: Duration::from_millis(env_or(
                    "PUSHGATE_CONNECT_TIMEOUT_MS",
                    10_000,
                )?),
                read_timeout: Duration::from_millis(env_or("PUSHGATE_READ_TIMEOUT_MS", 30_000)?),
                gcm_endpoint: std::env::var("PUSHGATE_GCM_ENDPOINT")
                    .unwrap_or(defaults.http.gcm_endpoint),
                adm_endpoint: std::env::var("PUSHGATE_ADM_ENDPOINT")
                    .unwrap_or(defaults.http.adm_endpoint),
                adm_token_endpoint: std::env::var("PUSHGATE_ADM_TOKEN_ENDPOINT")
                    .unwrap_or(defaults.http.adm_token_endpoint),
            },
            batch_deliveries: env_or("PUSHGATE_BATCH_DELIVERIES", true)?,
            push_mode: env_or("PUSHGATE_PUSH_MODE", false)?,
            pretty_logs: std::env::var("PUSHGATE_LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("pretty"))
                .unwrap_or(false),
        })
    }
}

/// Read `name` and parse it, falling back to `default` when unset.
fn env_or<T: FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} has an invalid value: '{}'", name, raw)),
        Err(_) => Ok(default),
    }
}

fn env_host_port(name: &str) -> anyhow::Result<Option<(String, u16)>> {
    match std::env::var(name) {
        Ok(raw) => parse_host_port(&raw)
            .map(Some)
            .ok_or_else(|| anyhow::anyhow!("{} must be in host:port form, got '{}'", name, raw)),
        Err(_) => Ok(None),
    }
}

/// Split `host:port`.
pub fn parse_host_port(raw: &str) -> Option<(String, u16)> {
    let (host, port) = raw.trim().rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_backend_parse() {
        assert_eq!("postgres".parse::<StoreBackend>().unwrap(), StoreBackend::Postgres);
        assert_eq!("Redis".parse::<StoreBackend>().unwrap(), StoreBackend::Redis);
        assert_eq!(" memory ".parse::<StoreBackend>().unwrap(), StoreBackend::Memory);
        assert!("mongo".parse::<StoreBackend>().is_err());
    }

    #[test]
    fn test_parse_host_port() {
        assert_eq!(
            parse_host_port("gateway.push.apple.com:2195"),
            Some(("gateway.push.apple.com".to_string(), 2195))
        );
        assert_eq!(parse_host_port("localhost"), None);
        assert_eq!(parse_host_port(":2195"), None);
        assert_eq!(parse_host_port("host:notaport"), None);
    }

    #[test]
    fn test_dispatcher_defaults_never_zero() {
        let defaults = DispatcherDefaults {
            apns: 0,
            ..DispatcherDefaults::default()
        };
        assert_eq!(defaults.for_provider(Provider::Apns), 1);
        assert_eq!(defaults.for_provider(Provider::Gcm), 1);
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.store, StoreBackend::Memory);
        assert_eq!(config.apns.ring_buffer_capacity, 1000);
        assert_eq!(config.retry.max_attempts, 10);
        assert!(config.batch_deliveries);
    }
}
