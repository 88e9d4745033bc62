// ===============================
// src/retry.rs
// ===============================
//
// Bounded retry shared by the websocket feed and the relay broker.
// Fixed delay between attempts, no sleep after the last one.
//
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, warn};

use crate::error::RetryExhausted;
use crate::metrics::RECONNECTS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 5, delay: Duration::from_secs(5) }
    }
}

pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    target: &str,
    mut op: F,
) -> Result<T, RetryExhausted>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max = policy.max_attempts.max(1);
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                RECONNECTS.with_label_values(&[target]).inc();
                if attempt >= max {
                    error!(%target, attempt, max, error = %e, "max retry attempts reached, giving up");
                    return Err(RetryExhausted {
                        target: target.to_string(),
                        attempts: attempt,
                        last_error: e.to_string(),
                    });
                }
                warn!(%target, attempt, max, error = %e, "connect failed, retrying");
                sleep(policy.delay).await;
            }
        }
    }
}
