//! Reconnect backoff (spec §4.7): base 1s, factor 2, jitter 0.85-1.15, cap 30s,
//! max 10 attempts.

use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

/// Compute the delay before reconnect attempt `attempt` (1-based).
/// Returns `None` once `attempt` exceeds `max_attempts`.
pub fn delay_for_attempt(cfg: &BackoffConfig, attempt: u32) -> Option<Duration> {
    if attempt == 0 || attempt > cfg.max_attempts {
        return None;
    }
    let unjittered = cfg.base.as_secs_f64() * cfg.factor.powi(attempt as i32 - 1);
    let capped = unjittered.min(cfg.cap.as_secs_f64());
    let jitter = rand::thread_rng().gen_range(cfg.jitter_min..=cfg.jitter_max);
    Some(Duration::from_secs_f64(capped * jitter))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_then_caps() {
        let cfg = BackoffConfig::default();
        let first = delay_for_attempt(&cfg, 1).unwrap();
        assert!(first.as_secs_f64() >= 0.85 && first.as_secs_f64() <= 1.15);

        let late = delay_for_attempt(&cfg, 9).unwrap();
        assert!(late.as_secs_f64() <= cfg.cap.as_secs_f64() * cfg.jitter_max);
    }

    #[test]
    fn exhausts_after_max_attempts() {
        let cfg = BackoffConfig::default();
        assert!(delay_for_attempt(&cfg, cfg.max_attempts).is_some());
        assert!(delay_for_attempt(&cfg, cfg.max_attempts + 1).is_none());
    }
}
