use std::collections::HashMap;
use std::env;
use std::sync::Mutex;
use std::time::Instant;

use crate::error::AppError;

/// Sliding-window limits applied at the API boundary, on top of (not instead
/// of) the named resource caps (`max_message_size_kb`, `max_messages_per_agent`)
/// that `lifecycle` enforces directly against store state.
///
/// Environment variables:
/// - `RATE_LIMIT_SEND` — max `send` calls per minute per sender (default: 120)
/// - `RATE_LIMIT_PULL` — max `pull` calls per minute per recipient (default: 300)
/// - `RATE_LIMIT_REGISTER` — max registrations per hour per caller IP (default: 20)
pub struct RateLimitConfig {
    pub send_max: usize,
    pub send_window_secs: u64,
    pub pull_max: usize,
    pub pull_window_secs: u64,
    pub register_max: usize,
    pub register_window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            send_max: 120,
            send_window_secs: 60,
            pull_max: 300,
            pull_window_secs: 60,
            register_max: 20,
            register_window_secs: 3600,
        }
    }
}

impl RateLimitConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(val) = env::var("RATE_LIMIT_SEND")
            && let Ok(n) = val.parse::<usize>()
        {
            config.send_max = n;
        }
        if let Ok(val) = env::var("RATE_LIMIT_PULL")
            && let Ok(n) = val.parse::<usize>()
        {
            config.pull_max = n;
        }
        if let Ok(val) = env::var("RATE_LIMIT_REGISTER")
            && let Ok(n) = val.parse::<usize>()
        {
            config.register_max = n;
        }
        config
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitInfo {
    pub allowed: bool,
    pub limit: usize,
    pub remaining: usize,
    pub retry_after_secs: u64,
}

impl RateLimitInfo {
    pub fn into_result(self) -> Result<(), AppError> {
        if self.allowed {
            Ok(())
        } else {
            Err(AppError::TooManyRequests {
                retry_after_secs: self.retry_after_secs,
            })
        }
    }
}

pub struct RateLimiter {
    limits: Mutex<HashMap<String, Vec<Instant>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        RateLimiter {
            limits: Mutex::new(HashMap::new()),
        }
    }

    /// `key` is typically `"send:<agent_id>"`; `max`/`window_secs` bound a
    /// sliding window. Returns false once the window is saturated.
    pub fn check_with_info(&self, key: &str, max: usize, window_secs: u64) -> RateLimitInfo {
        let mut limits = self.limits.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let window = std::time::Duration::from_secs(window_secs);

        let entries = limits.entry(key.to_string()).or_default();
        entries.retain(|t| now.duration_since(*t) < window);

        if entries.len() >= max {
            let oldest = match entries.iter().min() {
                Some(t) => *t,
                None => {
                    return RateLimitInfo {
                        allowed: false,
                        remaining: 0,
                        limit: max,
                        retry_after_secs: 1,
                    };
                }
            };
            let elapsed = now.duration_since(oldest);
            let retry_after = if elapsed < window {
                (window - elapsed).as_secs() + 1
            } else {
                1
            };
            return RateLimitInfo {
                allowed: false,
                limit: max,
                remaining: 0,
                retry_after_secs: retry_after,
            };
        }

        entries.push(now);
        let remaining = max - entries.len();
        RateLimitInfo {
            allowed: true,
            limit: max,
            remaining,
            retry_after_secs: 0,
        }
    }

    pub fn check(&self, key: &str, max: usize, window_secs: u64) -> Result<(), AppError> {
        self.check_with_info(key, max, window_secs).into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_max_then_blocks() {
        let limiter = RateLimiter::new();
        for _ in 0..3 {
            assert!(limiter.check("send:agent-a", 3, 60).is_ok());
        }
        assert!(limiter.check("send:agent-a", 3, 60).is_err());
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new();
        for _ in 0..2 {
            assert!(limiter.check("send:agent-a", 2, 60).is_ok());
        }
        assert!(limiter.check("send:agent-b", 2, 60).is_ok());
    }
}
