use crate::error::MailQueueError;
use std::env;

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub metrics_port: u16,
    pub tracking_base_url: String,
    pub worker: WorkerConfig,
    /// Per-minute cap applied to newly minted API keys when the caller
    /// does not set one; null means uncapped.
    pub default_key_rate_limit: Option<i64>,
    pub smtp_timeout_ms: u64,
    pub webhook_timeout_seconds: u64,
    pub reconcile_interval_seconds: u64,
    pub reputation_interval_seconds: u64,
    pub scheduler_interval_seconds: u64,
}

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub worker_count: usize,
    pub job_poll_interval_ms: u64,
    pub visibility_timeout_seconds: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: 10,
            job_poll_interval_ms: 1000,
            visibility_timeout_seconds: 300,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: &str) -> Result<T, MailQueueError> {
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| MailQueueError::Config(format!("Invalid {name} value")))
}

impl Config {
    pub fn from_env() -> Result<Self, MailQueueError> {
        let database_url = env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite:data/mailqueue.db?mode=rwc".to_string());
        let port = env_parse("PORT", "8080")?;
        let metrics_port = env_parse("MQ_METRICS_PORT", "9090")?;

        let tracking_base_url = env::var("MQ_TRACKING_BASE_URL")
            .unwrap_or_else(|_| format!("http://localhost:{port}"));

        let worker = WorkerConfig {
            worker_count: env_parse("MQ_WORKER_COUNT", "10")?,
            job_poll_interval_ms: env_parse("MQ_JOB_POLL_INTERVAL_MS", "1000")?,
            visibility_timeout_seconds: env_parse("MQ_JOB_VISIBILITY_TIMEOUT_SECONDS", "300")?,
        };

        // Ensure data directory exists for sqlite file databases
        if let Some(db_path_str) = database_url.strip_prefix("sqlite:") {
            if let Some(db_path) = db_path_str.split('?').next() {
                if let Some(parent) = std::path::Path::new(db_path).parent() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        MailQueueError::Config(format!("Failed to create data directory: {e}"))
                    })?;
                }
            }
        }

        let default_key_rate_limit = env::var("MQ_DEFAULT_KEY_RATE_LIMIT")
            .ok()
            .and_then(|v| v.parse::<i64>().ok());

        Ok(Config {
            database_url,
            port,
            metrics_port,
            tracking_base_url,
            worker,
            default_key_rate_limit,
            smtp_timeout_ms: env_parse("MQ_SMTP_TIMEOUT_MS", "30000")?,
            webhook_timeout_seconds: env_parse("MQ_WEBHOOK_TIMEOUT_SECONDS", "30")?,
            reconcile_interval_seconds: env_parse("MQ_RECONCILE_INTERVAL_SECONDS", "60")?,
            reputation_interval_seconds: env_parse("MQ_REPUTATION_INTERVAL_SECONDS", "60")?,
            scheduler_interval_seconds: env_parse("MQ_SCHEDULER_INTERVAL_SECONDS", "60")?,
        })
    }
}
