//! Retry strategies with exponential backoff and jitter.
//!
//! Git pushes race with other agents: a lost push is retried after a rebase,
//! with delays spread by jitter so a fleet of agents does not hammer the
//! remote in lockstep. Presets bound the two retry loops the engine runs
//! (completion push, zombie recovery).

use std::fmt;
use std::time::Duration;

/// Configuration for a retry loop.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Jitter factor in `[0, 1)`: the computed delay is scaled by a random
    /// factor in `(1 - jitter, 1 + jitter)`.
    pub jitter: f64,
}

/// Predefined retry policies for the engine's two bounded loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPreset {
    /// Completion push/merge loop: races with other agents, so it retries
    /// generously.
    WuDone,
    /// Zombie recovery: bounded tighter because each attempt rewrites the
    /// worktree YAML.
    Recovery,
}

impl RetryPreset {
    pub fn config(self) -> RetryConfig {
        match self {
            RetryPreset::WuDone => RetryConfig {
                max_attempts: 5,
                base_delay_ms: 500,
                max_delay_ms: 8_000,
                multiplier: 2.0,
                jitter: 0.3,
            },
            RetryPreset::Recovery => RetryConfig {
                max_attempts: 3,
                base_delay_ms: 1_000,
                max_delay_ms: 10_000,
                multiplier: 2.0,
                jitter: 0.1,
            },
        }
    }
}

/// Delay before retry number `attempt` (0-indexed):
/// `clamp(base * multiplier^attempt, base, max)`, then jitter.
pub fn calculate_backoff_delay(attempt: u32, cfg: &RetryConfig) -> Duration {
    let exp = cfg.multiplier.powi(attempt.min(32) as i32);
    let raw = (cfg.base_delay_ms as f64 * exp)
        .clamp(cfg.base_delay_ms as f64, cfg.max_delay_ms as f64);
    let jittered = if cfg.jitter > 0.0 {
        let factor = 1.0 - cfg.jitter + rand::random::<f64>() * 2.0 * cfg.jitter;
        raw * factor
    } else {
        raw
    };
    Duration::from_millis(jittered.round() as u64)
}

/// Final failure of a retry loop, wrapping the last error with the attempt
/// count.
#[derive(Debug)]
pub struct RetryExhausted<E> {
    pub attempts: u32,
    pub last: E,
}

impl<E: fmt::Display> fmt::Display for RetryExhausted<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed after {} attempt(s): {}", self.attempts, self.last)
    }
}

impl<E: fmt::Display + fmt::Debug> std::error::Error for RetryExhausted<E> {}

/// Run `op` up to `cfg.max_attempts` times, sleeping the computed backoff
/// between attempts. `should_retry` can stop the loop early for errors that
/// will never succeed (non-retryable git failures); `on_retry` observes each
/// scheduled retry.
pub fn with_retry<T, E>(
    cfg: &RetryConfig,
    mut should_retry: impl FnMut(&E) -> bool,
    mut on_retry: impl FnMut(u32, &E, Duration),
    mut op: impl FnMut(u32) -> Result<T, E>,
) -> Result<T, RetryExhausted<E>> {
    let mut attempt = 0;
    loop {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(err) => {
                let next = attempt + 1;
                if next >= cfg.max_attempts || !should_retry(&err) {
                    return Err(RetryExhausted {
                        attempts: next,
                        last: err,
                    });
                }
                let delay = calculate_backoff_delay(attempt, cfg);
                on_retry(next, &err, delay);
                std::thread::sleep(delay);
                attempt = next;
            }
        }
    }
}

/// Whether a git failure message is worth retrying after a rebase.
///
/// Matches the push races other agents cause; everything else (conflicts,
/// auth, missing refs) fails fast.
pub fn is_retryable_git_failure(message: &str) -> bool {
    const PATTERNS: &[&str] = &[
        "non-fast-forward",
        "fetch first",
        "cannot lock ref",
        "failed to push some refs",
        "Not possible to fast-forward",
        "stale info",
    ];
    PATTERNS.iter().any(|p| message.contains(p))
}
