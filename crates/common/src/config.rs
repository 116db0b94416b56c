use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string (presence records)
    pub redis_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 10)
    pub db_max_connections: u32,

    /// Port the HTTP API listens on (default: 3000)
    pub api_port: u16,

    /// JWT secret for API authentication
    pub jwt_secret: String,

    /// JWT token expiry in hours
    pub jwt_expiry_hours: u64,

    /// Shared key for trigger callers (cron, chat transport) sent as `X-API-Key`
    pub service_api_key: Option<String>,

    /// Maximum provider calls in flight per dispatch (default: 16)
    pub dispatch_concurrency: usize,

    /// Timeout for a single provider call in milliseconds (default: 10000)
    pub provider_timeout_ms: u64,

    /// Maximum entries claimed per queue run (default: 100)
    pub queue_batch_size: i64,

    /// Delivery attempts before an entry is marked failed (default: 3)
    pub queue_max_attempts: i32,

    /// Base retry backoff in seconds, doubled per attempt (default: 60)
    pub retry_backoff_secs: u64,

    /// Seconds after which a `sending` claim is considered abandoned (default: 300)
    pub stale_claim_secs: u64,

    /// Seconds a presence heartbeat stays valid (default: 30)
    pub presence_window_secs: u64,

    /// Expo push endpoint
    pub expo_push_url: String,

    /// Optional Expo access token (enhanced push security)
    pub expo_access_token: Option<String>,

    /// Firebase project id; FCM delivery is disabled when unset
    pub fcm_project_id: Option<String>,

    /// OAuth2 bearer token for the FCM HTTP v1 API
    pub fcm_access_token: Option<String>,

    /// FCM API base URL
    pub fcm_base_url: String,

    /// Path to the PKCS#12 APNs client certificate; APNs delivery is disabled when unset
    pub apns_cert_path: Option<String>,

    /// Password for the PKCS#12 bundle
    pub apns_cert_password: String,

    /// APNs topic (the app bundle id)
    pub apns_topic: Option<String>,

    /// APNs host (production or sandbox)
    pub apns_base_url: String,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            db_max_connections: parse_var("DB_MAX_CONNECTIONS", 10)?,
            api_port: parse_var("API_PORT", 3000)?,
            jwt_secret: std::env::var("JWT_SECRET")
                .map_err(|_| anyhow::anyhow!("JWT_SECRET environment variable is required"))?,
            jwt_expiry_hours: parse_var("JWT_EXPIRY_HOURS", 24)?,
            service_api_key: std::env::var("SERVICE_API_KEY").ok(),
            dispatch_concurrency: parse_var("DISPATCH_CONCURRENCY", 16)?,
            provider_timeout_ms: parse_var("PROVIDER_TIMEOUT_MS", 10_000)?,
            queue_batch_size: parse_var("QUEUE_BATCH_SIZE", 100)?,
            queue_max_attempts: parse_var("QUEUE_MAX_ATTEMPTS", 3)?,
            retry_backoff_secs: parse_var("RETRY_BACKOFF_SECS", 60)?,
            stale_claim_secs: parse_var("STALE_CLAIM_SECS", 300)?,
            presence_window_secs: parse_var("PRESENCE_WINDOW_SECS", 30)?,
            expo_push_url: std::env::var("EXPO_PUSH_URL")
                .unwrap_or_else(|_| "https://exp.host/--/api/v2/push/send".to_string()),
            expo_access_token: std::env::var("EXPO_ACCESS_TOKEN").ok(),
            fcm_project_id: std::env::var("FCM_PROJECT_ID").ok(),
            fcm_access_token: std::env::var("FCM_ACCESS_TOKEN").ok(),
            fcm_base_url: std::env::var("FCM_BASE_URL")
                .unwrap_or_else(|_| "https://fcm.googleapis.com".to_string()),
            apns_cert_path: std::env::var("APNS_CERT_PATH").ok(),
            apns_cert_password: std::env::var("APNS_CERT_PASSWORD").unwrap_or_default(),
            apns_topic: std::env::var("APNS_TOPIC").ok(),
            apns_base_url: std::env::var("APNS_BASE_URL")
                .unwrap_or_else(|_| "https://api.push.apple.com".to_string()),
        })
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }

    pub fn stale_claim_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_claim_secs as i64)
    }

    /// Base delay before the first retry of a transient failure.
    pub fn retry_backoff(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retry_backoff_secs as i64)
    }

    pub fn presence_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.presence_window_secs as i64)
    }
}

/// Read an optional numeric variable, falling back to `default` when unset.
fn parse_var<T: FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("{} must be a valid {}", name, std::any::type_name::<T>())),
        Err(_) => Ok(default),
    }
}
