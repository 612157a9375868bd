//! Source-database connections.

use std::time::Duration;

use anyhow::Result;
use sqlx::PgPool;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay: Duration::from_millis(200),
        }
    }
}

/// Connect with retry; covers container startup timing and transient
/// network failures.
pub async fn connect_with_retry(url: &str) -> Result<PgPool> {
    connect_with_retry_config(url, &ConnectionConfig::default()).await
}

pub async fn connect_with_retry_config(url: &str, config: &ConnectionConfig) -> Result<PgPool> {
    let mut last_error = None;

    for attempt in 0..=config.max_retries {
        match PgPool::connect(url).await {
            Ok(pool) => {
                if attempt > 0 {
                    info!(attempt, "connected to database after retry");
                }
                return Ok(pool);
            }
            Err(e) => {
                last_error = Some(e);
                if attempt < config.max_retries {
                    warn!(attempt, "database not ready, retrying");
                    tokio::time::sleep(config.retry_delay).await;
                }
            }
        }
    }

    Err(anyhow::anyhow!(
        "failed to connect to database after {} attempts: {}",
        config.max_retries + 1,
        last_error.expect("at least one attempt failed")
    ))
}

/// Current transaction id; the upper bound for catch-up windows.
pub async fn current_txid(pool: &PgPool) -> Result<u64> {
    let txid: i64 = sqlx::query_scalar("SELECT txid_current()")
        .fetch_one(pool)
        .await?;
    Ok(txid as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_config_default() {
        let config = ConnectionConfig::default();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.retry_delay, Duration::from_millis(200));
    }
}
