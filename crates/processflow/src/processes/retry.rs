use chrono::{DateTime, Utc};
use rand::Rng;

use crate::processes::error_codes::ErrorCode;
use crate::processes::execution::{ExecutionContext, ExecutionFailure};
use crate::processes::model::ClientProcess;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base_seconds: i64,
    pub max_seconds: i64,
    pub jitter_pct: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_seconds: 2,
            max_seconds: 15 * 60,
            jitter_pct: 0.20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    NonRetryable,
}

pub fn classify_error(code: ErrorCode) -> ErrorClass {
    match code {
        ErrorCode::BadPayload | ErrorCode::UnknownJobType | ErrorCode::ResourceMissing => {
            ErrorClass::NonRetryable
        }
        ErrorCode::Timeout
        | ErrorCode::DbDeadlock
        | ErrorCode::Serialization
        | ErrorCode::RateLimit
        | ErrorCode::DependencyDown
        | ErrorCode::Panic
        | ErrorCode::Unknown => ErrorClass::Retryable,
    }
}

/// Turn a handler failure into the execution context for `processed`.
///
/// Permanent when the code cannot be retried, when the attempt being recorded
/// uses up `tries`, or when the dispatch deadline has passed. A process with
/// neither `tries` nor `timeout_at` retries until it succeeds or hits a
/// non-retryable code.
pub fn execution_for_failure(
    process: &ClientProcess,
    code: ErrorCode,
    message: impl Into<String>,
    now: DateTime<Utc>,
) -> ExecutionContext {
    let failure = ExecutionFailure::new(code, message);
    let attempt_no = process.attempts().saturating_add(1);

    let exhausted = process.tries().is_some_and(|tries| attempt_no >= tries);
    let expired = process.timeout_at().is_some_and(|deadline| now >= deadline);

    let ctx = if classify_error(code) == ErrorClass::NonRetryable || exhausted || expired {
        ExecutionContext::permanent(failure)
    } else {
        ExecutionContext::transient(failure)
    };
    ctx.finished_at(now)
}

pub fn next_delay_seconds(attempt_no: i32, cfg: &RetryConfig, rng: &mut impl Rng) -> i64 {
    let attempt_no = attempt_no.max(1) as u32;

    // exponent = attempt_no - 1
    let exp = attempt_no.saturating_sub(1);

    // 2^exp, saturating; the cap below handles huge values
    let pow2 = 1_i64.checked_shl(exp).unwrap_or(i64::MAX);

    let delay = cfg.base_seconds.saturating_mul(pow2).min(cfg.max_seconds);

    // jitter in range [-jitter_pct, +jitter_pct]
    let jitter_range = (delay as f64) * cfg.jitter_pct;
    if jitter_range <= 0.0 {
        return delay.clamp(0, cfg.max_seconds);
    }
    let jitter = rng.gen_range(-jitter_range..=jitter_range);

    let jittered = (delay as f64 + jitter).round() as i64;
    jittered.clamp(0, cfg.max_seconds)
}
