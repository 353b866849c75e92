use std::env;
use std::str::FromStr;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub supabase_jwt_secret: String,
    pub redis_url: Option<String>,
    pub port: u16,

    // Queue and admission
    pub max_queue_size: u64,
    pub max_open_sessions_per_patient: u64,
    pub accept_rate_limit: u64,
    pub accept_rate_window_seconds: u64,

    // Payment
    pub payment_deadline_seconds: i64,
    pub consultation_fee: i64,
    pub consultation_currency: String,
    pub enable_mock_payment: bool,
    pub payment_gateway_url: Option<String>,
    pub payment_gateway_api_key: Option<String>,

    // Notifications and workers
    pub notification_webhook_url: Option<String>,
    pub notification_max_attempts: u32,
    pub notification_backoff_ms: u64,
    pub worker_concurrency: u32,
    pub scheduler_poll_interval_ms: u64,

    pub consent_version: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let config = Self {
            supabase_url: env::var("SUPABASE_URL")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_URL not set, using empty value");
                    String::new()
                }),
            supabase_anon_key: env::var("SUPABASE_ANON_PUBLIC_KEY")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_ANON_PUBLIC_KEY not set, using empty value");
                    String::new()
                }),
            supabase_jwt_secret: env::var("SUPABASE_JWT_SECRET")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_JWT_SECRET not set, using empty value");
                    String::new()
                }),
            redis_url: optional_env("REDIS_URL"),
            port: parse_env("PORT", 3000),

            max_queue_size: parse_env("MAX_QUEUE_SIZE", 50),
            max_open_sessions_per_patient: parse_env("MAX_OPEN_SESSIONS_PER_PATIENT", 3),
            accept_rate_limit: parse_env("ACCEPT_RATE_LIMIT", 5),
            accept_rate_window_seconds: parse_env("ACCEPT_RATE_WINDOW_SECONDS", 60),

            payment_deadline_seconds: parse_env("PAYMENT_DEADLINE_SECONDS", 15 * 60),
            consultation_fee: parse_env("CONSULTATION_FEE", 500),
            consultation_currency: env::var("CONSULTATION_CURRENCY")
                .unwrap_or_else(|_| "INR".to_string()),
            enable_mock_payment: parse_env("ENABLE_MOCK_PAYMENT", false),
            payment_gateway_url: optional_env("PAYMENT_GATEWAY_URL"),
            payment_gateway_api_key: optional_env("PAYMENT_GATEWAY_API_KEY"),

            notification_webhook_url: optional_env("NOTIFICATION_WEBHOOK_URL"),
            notification_max_attempts: parse_env("NOTIFICATION_MAX_ATTEMPTS", 3),
            notification_backoff_ms: parse_env("NOTIFICATION_BACKOFF_MS", 2000),
            worker_concurrency: parse_env("WORKER_CONCURRENCY", 5),
            scheduler_poll_interval_ms: parse_env("SCHEDULER_POLL_INTERVAL_MS", 500),

            consent_version: env::var("CONSENT_VERSION")
                .unwrap_or_else(|_| "v1.0.0".to_string()),
        };

        if !config.is_configured() {
            warn!("Application not fully configured - missing environment variables");
        }

        if !config.enable_mock_payment && config.payment_gateway_url.is_none() {
            warn!("Neither ENABLE_MOCK_PAYMENT nor PAYMENT_GATEWAY_URL is set - payments will be declined");
        }

        config
    }

    pub fn is_configured(&self) -> bool {
        !self.supabase_url.is_empty()
            && !self.supabase_anon_key.is_empty()
            && !self.supabase_jwt_secret.is_empty()
    }

    pub fn uses_redis(&self) -> bool {
        self.redis_url.as_deref().map_or(false, |url| !url.is_empty())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            supabase_url: String::new(),
            supabase_anon_key: String::new(),
            supabase_jwt_secret: String::new(),
            redis_url: None,
            port: 3000,
            max_queue_size: 50,
            max_open_sessions_per_patient: 3,
            accept_rate_limit: 5,
            accept_rate_window_seconds: 60,
            payment_deadline_seconds: 15 * 60,
            consultation_fee: 500,
            consultation_currency: "INR".to_string(),
            enable_mock_payment: false,
            payment_gateway_url: None,
            payment_gateway_api_key: None,
            notification_webhook_url: None,
            notification_max_attempts: 3,
            notification_backoff_ms: 2000,
            worker_concurrency: 5,
            scheduler_poll_interval_ms: 500,
            consent_version: "v1.0.0".to_string(),
        }
    }
}

fn optional_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_env<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("{} has an invalid value '{}', using default", key, raw);
            default
        }),
        Err(_) => default,
    }
}
