use secrecy::Secret;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub host: String,
    pub port: u16,

    // External record API (attendance of record)
    pub record_api_url: String,
    pub record_api_token: Secret<String>,

    // Identity comparison service
    pub comparison_api_url: String,
    pub comparison_api_key: Option<Secret<String>>,
    pub comparison_rate_limit_per_sec: u32,
    pub match_threshold: f32,

    // Reference image store
    pub reference_store_url: String,
    pub reference_cache_ttl_secs: u64,
    pub reference_cache_max_entries: usize,

    // Session lifecycle
    pub session_ttl_secs: u64,
    pub report_delay_secs: u64,
    pub geofence_radius_m: f64,
    pub session_retention_secs: u64,

    // Verification queue
    pub queue_capacity: usize,
    pub queue_min_workers: usize,
    pub queue_max_workers: usize,
    pub compute_fraction: f64,
    pub update_channel_capacity: usize,

    // Retry budget
    pub max_verification_attempts: u32,
    pub retry_retention_secs: u64,

    // Background sweep (six-field cron expression, seconds first)
    pub sweep_schedule: String,

    // Outbound HTTP
    pub http_timeout_secs: u64,
    pub submission_retry_attempts: u32,
    pub submission_retry_delay_ms: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        // Load .env file if it exists (for local development)
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            .add_source(config::Environment::default().separator("__"))
            .build()?;

        Ok(Self {
            database_url: config.get("database_url")?,
            host: config.get("host").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: config.get("port").unwrap_or(8080),

            record_api_url: config.get("record_api_url")?,
            record_api_token: Secret::new(config.get("record_api_token")?),

            comparison_api_url: config.get("comparison_api_url")?,
            comparison_api_key: config
                .get::<String>("comparison_api_key")
                .ok()
                .map(Secret::new),
            comparison_rate_limit_per_sec: config
                .get("comparison_rate_limit_per_sec")
                .unwrap_or(8),
            match_threshold: config.get("match_threshold").unwrap_or(50.0),

            reference_store_url: config.get("reference_store_url")?,
            reference_cache_ttl_secs: config.get("reference_cache_ttl_secs").unwrap_or(300),
            reference_cache_max_entries: config.get("reference_cache_max_entries").unwrap_or(100),

            session_ttl_secs: config.get("session_ttl_secs").unwrap_or(150),
            report_delay_secs: config.get("report_delay_secs").unwrap_or(15),
            geofence_radius_m: config.get("geofence_radius_m").unwrap_or(50.0),
            session_retention_secs: config.get("session_retention_secs").unwrap_or(86_400),

            queue_capacity: config.get("queue_capacity").unwrap_or(1000),
            queue_min_workers: config.get("queue_min_workers").unwrap_or(2),
            queue_max_workers: config.get("queue_max_workers").unwrap_or(100),
            compute_fraction: config.get("compute_fraction").unwrap_or(0.8),
            update_channel_capacity: config.get("update_channel_capacity").unwrap_or(256),

            max_verification_attempts: config.get("max_verification_attempts").unwrap_or(2),
            retry_retention_secs: config.get("retry_retention_secs").unwrap_or(3600),

            sweep_schedule: config
                .get("sweep_schedule")
                .unwrap_or_else(|_| "0 */5 * * * *".to_string()),

            http_timeout_secs: config.get("http_timeout_secs").unwrap_or(10),
            submission_retry_attempts: config.get("submission_retry_attempts").unwrap_or(3),
            submission_retry_delay_ms: config.get("submission_retry_delay_ms").unwrap_or(500),
        })
    }
}
