//! Bounded retry with exponential backoff for transient failures

use std::future::Future;
use std::io::ErrorKind;
use std::time::Duration;

use tracing::warn;

use crate::config::{DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_BASE_DELAY, MAX_RETRY_DELAY};

/// How many times an operation is attempted and how long to wait in between
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Never less than 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_RETRY_BASE_DELAY,
            max_delay: MAX_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: MAX_RETRY_DELAY,
        }
    }

    /// A policy that never retries
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Delay to wait after the given (1-based) failed attempt
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// The last error of an operation that did not succeed, with the number of
/// attempts made before giving up
#[derive(Debug)]
pub struct Exhausted<E> {
    pub attempts: u32,
    pub error: E,
}

/// Run `attempt` until it succeeds, fails with a non-transient error, or the
/// policy's attempt bound is reached
pub async fn with_retry<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    operation: &str,
    is_transient: C,
    mut attempt: F,
) -> Result<T, Exhausted<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempts >= max_attempts || !is_transient(&error) {
                    return Err(Exhausted { attempts, error });
                }

                let delay = policy.delay_after(attempts);
                warn!(
                    operation,
                    attempt = attempts,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "transient failure, retrying: {error:#}"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Check if an error is worth retrying (transient errors that may resolve on
/// their own: timeouts, dropped connections, server restarts)
pub fn is_transient(error: &anyhow::Error) -> bool {
    for cause in error.chain() {
        if let Some(e) = cause.downcast_ref::<sqlx::Error>() {
            return is_transient_sqlx(e);
        }
        if cause.is::<tokio::time::error::Elapsed>() {
            return true;
        }
        if let Some(e) = cause.downcast_ref::<std::io::Error>() {
            return is_transient_io(e.kind());
        }
    }
    false
}

fn is_transient_sqlx(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Io(e) => is_transient_io(e.kind()),
        sqlx::Error::Tls(_) | sqlx::Error::PoolTimedOut | sqlx::Error::Protocol(_) => true,
        sqlx::Error::Database(db) => db.code().is_some_and(|code| is_transient_sqlstate(&code)),
        _ => {
            let message = error.to_string().to_lowercase();
            message.contains("server unavailable")
                || message.contains("connection reset")
                || message.contains("broken pipe")
                || message.contains("timed out")
        }
    }
}

fn is_transient_io(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::TimedOut
            | ErrorKind::Interrupted
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
    )
}

/// SQLSTATE codes for connection loss, resource exhaustion, server shutdown,
/// serialization failure and deadlock
fn is_transient_sqlstate(code: &str) -> bool {
    code.starts_with("08")
        || code.starts_with("53")
        || code.starts_with("57P0")
        || code == "40001"
        || code == "40P01"
}
