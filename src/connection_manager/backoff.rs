//! Exponential backoff policy for reconnection

use std::time::Duration;

use crate::config::ConnectionConfig;

/// Outcome of consulting the policy after a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Wait `delay`, then make attempt number `attempt` (1-based)
    Retry { attempt: u32, delay: Duration },
    /// Attempts exhausted; the connection is dead until re-added
    GiveUp { attempts: u32 },
}

/// `delay = base * 2^attempts`, no jitter, capped at `max_attempts`
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    base_delay_ms: u64,
    max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(base_delay_ms: u64, max_attempts: u32) -> Self {
        Self {
            base_delay_ms: base_delay_ms.max(1),
            max_attempts,
        }
    }

    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::new(config.reconnect_base_delay_ms, config.max_reconnect_attempts)
    }

    /// Decide what to do given the attempts already made in this failure episode
    pub fn next(&self, attempts_so_far: u32) -> ReconnectDecision {
        if attempts_so_far >= self.max_attempts {
            return ReconnectDecision::GiveUp {
                attempts: attempts_so_far,
            };
        }

        ReconnectDecision::Retry {
            attempt: attempts_so_far + 1,
            delay: self.delay_for(attempts_so_far),
        }
    }

    pub fn delay_for(&self, attempts_so_far: u32) -> Duration {
        let factor = 1u64.checked_shl(attempts_so_far).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double() {
        let policy = ReconnectPolicy::new(100, 3);

        assert_eq!(
            policy.next(0),
            ReconnectDecision::Retry {
                attempt: 1,
                delay: Duration::from_millis(100)
            }
        );
        assert_eq!(
            policy.next(1),
            ReconnectDecision::Retry {
                attempt: 2,
                delay: Duration::from_millis(200)
            }
        );
        assert_eq!(
            policy.next(2),
            ReconnectDecision::Retry {
                attempt: 3,
                delay: Duration::from_millis(400)
            }
        );
        assert_eq!(policy.next(3), ReconnectDecision::GiveUp { attempts: 3 });
    }

    #[test]
    fn test_delays_strictly_increase() {
        let policy = ReconnectPolicy::new(7, 20);
        let delays: Vec<Duration> = (0..20).map(|n| policy.delay_for(n)).collect();
        assert!(delays.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn test_zero_attempts_gives_up_immediately() {
        let policy = ReconnectPolicy::new(100, 0);
        assert_eq!(policy.next(0), ReconnectDecision::GiveUp { attempts: 0 });
    }

    #[test]
    fn test_huge_attempt_count_saturates() {
        let policy = ReconnectPolicy::new(1_000, u32::MAX);
        assert_eq!(policy.delay_for(80), Duration::from_millis(u64::MAX));
    }
}
