//! Retry logic with exponential backoff
//!
//! Writes that lose a lock race against another worker surface as
//! [`CheckpointError::Conflict`]. [`with_retry`] re-runs such operations with
//! exponential backoff; every other error is returned immediately.

use crate::error::{CheckpointError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Initial delay before first retry (in milliseconds)
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries (in milliseconds)
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff (e.g., 2.0 for doubling)
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_retries() -> usize {
    3
}

fn default_initial_delay() -> u64 {
    50
}

fn default_max_delay() -> u64 {
    2_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration
    pub fn new(
        max_retries: usize,
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_delay_ms,
            max_delay_ms,
            multiplier,
        }
    }

    /// No retries at all
    pub fn disabled() -> Self {
        Self::new(0, 0, 0, 1.0)
    }

    /// Calculate delay for a given attempt number (0-indexed)
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        let delay_ms = (self.initial_delay_ms as f64) * self.multiplier.powi(attempt as i32);
        let capped_delay = delay_ms.min(self.max_delay_ms as f64);
        Duration::from_millis(capped_delay as u64)
    }
}

/// Execute a storage operation, retrying on conflicts
///
/// # Arguments
/// * `config` - Retry configuration
/// * `operation_name` - Operation identifier for logging
/// * `operation` - Async function to execute; called once per attempt
///
/// # Returns
/// The first success, the first non-conflict error, or
/// [`CheckpointError::Conflict`] carrying the total attempt count.
pub async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        if attempt > 0 {
            let delay = config.calculate_delay(attempt - 1);
            debug!(
                operation = %operation_name,
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                "Retrying after delay"
            );
            sleep(delay).await;
        }

        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(operation = %operation_name, attempt = attempt, "Retry succeeded");
                }
                return Ok(result);
            }
            Err(CheckpointError::Conflict { message, .. }) => {
                if attempt < config.max_retries {
                    warn!(
                        operation = %operation_name,
                        attempt = attempt + 1,
                        max_retries = config.max_retries,
                        error = %message,
                        "Write conflict, will retry"
                    );
                    attempt += 1;
                } else {
                    warn!(
                        operation = %operation_name,
                        attempt = attempt + 1,
                        error = %message,
                        "Write conflict, max retries exhausted"
                    );
                    return Err(CheckpointError::Conflict {
                        attempts: attempt + 1,
                        message,
                    });
                }
            }
            Err(other) => return Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    fn conflict() -> CheckpointError {
        CheckpointError::Conflict {
            attempts: 1,
            message: "database is locked".to_string(),
        }
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.initial_delay_ms, 50);
        assert_eq!(config.max_delay_ms, 2_000);
        assert_eq!(config.multiplier, 2.0);
    }

    #[test]
    fn test_calculate_delay_capped() {
        let config = RetryConfig::new(10, 100, 300, 2.0);

        assert_eq!(config.calculate_delay(0).as_millis(), 100);
        assert_eq!(config.calculate_delay(1).as_millis(), 200);
        // 400 capped at 300
        assert_eq!(config.calculate_delay(2).as_millis(), 300);
    }

    #[tokio::test]
    async fn test_with_retry_succeeds_after_conflicts() {
        let config = RetryConfig::new(3, 0, 0, 2.0);
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result = with_retry(&config, "put", || {
            let attempts = attempts_clone.clone();
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(conflict())
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_exhausted_reports_attempts() {
        let config = RetryConfig::new(2, 0, 0, 2.0);

        let result: Result<()> = with_retry(&config, "put", || async { Err(conflict()) }).await;

        match result {
            Err(CheckpointError::Conflict { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_with_retry_does_not_retry_other_errors() {
        let config = RetryConfig::new(3, 0, 0, 2.0);
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<()> = with_retry(&config, "put", || {
            let attempts = attempts_clone.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(CheckpointError::Invalid("bad key".to_string()))
            }
        })
        .await;

        assert!(matches!(result, Err(CheckpointError::Invalid(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
