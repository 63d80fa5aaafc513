use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// Runtime configuration, read from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_base_url: String,
    pub data_dir: PathBuf,
    pub session_file: PathBuf,
    pub http_timeout: Duration,
    pub poll_interval: Duration,
    pub reconcile: ReconcileOptions,
}

/// Tuning for the reconciliation engine.
#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    /// Entries reconciled at once within one pass.
    pub concurrency: usize,
    /// Network attempts per edit marker before an entry stays "attempted".
    pub retry_max_attempts: u32,
    /// Delay before the first retry; doubles per further attempt.
    pub retry_backoff: Duration,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            retry_max_attempts: 3,
            retry_backoff: Duration::from_millis(2000),
        }
    }
}

impl ReconcileOptions {
    /// Backoff before retry number `attempts` (1-based count of failures so far).
    pub fn backoff_after(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(16);
        self.retry_backoff.saturating_mul(1u32 << exp)
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        let api_base_url = dotenv::var("PATHS_API_BASE_URL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "http://localhost:8080".to_string());
        let data_dir = PathBuf::from(
            dotenv::var("PATHS_DATA_DIR").unwrap_or_else(|_| "./data/paths".to_string()),
        );
        let session_file = dotenv::var("PATHS_SESSION_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("session.json"));

        let defaults = ReconcileOptions::default();
        let reconcile = ReconcileOptions {
            concurrency: env_parse("PATHS_RECONCILE_CONCURRENCY", defaults.concurrency)?.max(1),
            retry_max_attempts: env_parse("PATHS_RETRY_MAX_ATTEMPTS", defaults.retry_max_attempts)?
                .max(1),
            retry_backoff: Duration::from_millis(env_parse("PATHS_RETRY_BACKOFF_MS", 2000u64)?),
        };

        Ok(Self {
            api_base_url,
            data_dir,
            session_file,
            http_timeout: Duration::from_secs(env_parse("PATHS_HTTP_TIMEOUT_SECS", 30u64)?),
            poll_interval: Duration::from_secs(env_parse("PATHS_POLL_INTERVAL_SECS", 60u64)?),
            reconcile,
        })
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match dotenv::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw)),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let opts = ReconcileOptions {
            retry_backoff: Duration::from_millis(100),
            ..Default::default()
        };
        assert_eq!(opts.backoff_after(1), Duration::from_millis(100));
        assert_eq!(opts.backoff_after(2), Duration::from_millis(200));
        assert_eq!(opts.backoff_after(3), Duration::from_millis(400));
    }

    #[test]
    fn test_env_parse_default_when_unset() {
        let value: u32 = env_parse("PATHS_TEST_SURELY_UNSET_KEY", 7).unwrap();
        assert_eq!(value, 7);
    }
}
