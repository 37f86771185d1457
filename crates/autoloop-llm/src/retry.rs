//! Retry budget and backoff for transient provider failures
//!
//! Retries draw from a shared token bucket refilled by successful calls, so
//! a failing upstream burns the budget instead of producing a retry storm.

use std::sync::Mutex;
use std::time::Duration;

/// Process-wide retry budget.
///
/// Each successful call deposits `refill_ratio` tokens; each retry withdraws
/// one whole token. The balance is capped so a long healthy stretch cannot
/// bank an unbounded number of retries.
pub struct RetryBudget {
    inner: Mutex<BudgetState>,
    capacity: f64,
    refill_ratio: f64,
}

struct BudgetState {
    tokens: f64,
}

impl RetryBudget {
    pub fn new(capacity: u32, refill_ratio: f64) -> Self {
        Self {
            inner: Mutex::new(BudgetState {
                tokens: capacity as f64,
            }),
            capacity: capacity as f64,
            refill_ratio,
        }
    }

    /// Withdraw one retry token. Returns false when the budget is exhausted.
    pub fn try_withdraw(&self) -> bool {
        let mut state = self.inner.lock().expect("retry budget poisoned");
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Deposit the success fraction back into the bucket.
    pub fn deposit(&self) {
        let mut state = self.inner.lock().expect("retry budget poisoned");
        state.tokens = (state.tokens + self.refill_ratio).min(self.capacity);
    }

    pub fn remaining(&self) -> u32 {
        self.inner.lock().expect("retry budget poisoned").tokens as u32
    }
}

impl Default for RetryBudget {
    /// 10 banked retries, refilled at a 10% success ratio (one retry earned
    /// per ten clean calls).
    fn default() -> Self {
        Self::new(10, 0.1)
    }
}

/// Exponential backoff parameters.
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub multiplier: f64,
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 500,
            multiplier: 2.0,
            max_ms: 30_000,
        }
    }
}

impl BackoffConfig {
    /// Delay for the given attempt (0-based), with up to 25% random jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt as i32);
        let base = ((self.base_ms as f64 * exp) as u64).min(self.max_ms);
        let jitter_span = base / 4;
        let jitter = if jitter_span == 0 {
            0
        } else {
            // uuid v4 is already in the dependency tree; its low bits are
            // a perfectly serviceable jitter source.
            (uuid::Uuid::new_v4().as_u128() % (jitter_span as u128 + 1)) as u64
        };
        Duration::from_millis(base + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_exhausts_and_refills() {
        let budget = RetryBudget::new(2, 0.5);
        assert!(budget.try_withdraw());
        assert!(budget.try_withdraw());
        assert!(!budget.try_withdraw());

        budget.deposit();
        budget.deposit(); // 2 * 0.5 = 1 token
        assert!(budget.try_withdraw());
        assert!(!budget.try_withdraw());
    }

    #[test]
    fn budget_caps_at_capacity() {
        let budget = RetryBudget::new(3, 1.0);
        for _ in 0..100 {
            budget.deposit();
        }
        assert_eq!(budget.remaining(), 3);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let cfg = BackoffConfig {
            base_ms: 100,
            multiplier: 2.0,
            max_ms: 1_000,
        };
        let d0 = cfg.delay_for(0);
        let d3 = cfg.delay_for(3);
        assert!(d0 >= Duration::from_millis(100));
        assert!(d0 <= Duration::from_millis(125));
        assert!(d3 >= Duration::from_millis(800));
        // attempt 10 would be 102400ms uncapped; cap is 1000 + 250 jitter
        assert!(cfg.delay_for(10) <= Duration::from_millis(1_250));
    }
}
