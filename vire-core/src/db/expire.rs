//! Active-expiration sampling and the shard-level average-TTL estimator.
//!
//! Grounded on spec.md §4.4 and §4.7's active-expire-cycle description:
//! sample a handful of keys carrying a TTL; if more than a quarter came back
//! already expired, take another sampling pass; track `avg_ttl` as an EWMA
//! over observed TTLs so the cron can spend more time on shards whose keys
//! expire soonest.

use std::time::{SystemTime, UNIX_EPOCH};

pub const ACTIVE_EXPIRE_SAMPLE_SIZE: usize = 20;
pub const ACTIVE_EXPIRE_REPEAT_THRESHOLD: f64 = 0.25;
const EWMA_NEW_WEIGHT: f64 = 0.02;

#[derive(Debug, Default, Clone, Copy)]
pub struct ExpireStats {
    pub avg_ttl_ms: f64,
}

impl ExpireStats {
    pub fn observe(&mut self, ttl_ms: i64) {
        let ttl = ttl_ms.max(0) as f64;
        if self.avg_ttl_ms == 0.0 {
            self.avg_ttl_ms = ttl;
        } else {
            self.avg_ttl_ms = EWMA_NEW_WEIGHT * ttl + (1.0 - EWMA_NEW_WEIGHT) * self.avg_ttl_ms;
        }
    }
}

pub fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ewma_converges_towards_repeated_observations() {
        let mut s = ExpireStats::default();
        for _ in 0..500 {
            s.observe(1000);
        }
        assert!((s.avg_ttl_ms - 1000.0).abs() < 1.0);
    }
}
