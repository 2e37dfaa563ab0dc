//! The retransmission schedule for confirmable messages.
//!
//! The schedule is pure state: the endpoint driver owns the actual timers
//! and asks it how long to sleep and whether another attempt is allowed.
//! NON and ACK messages never get a schedule.

use std::time::Duration;

use rand::Rng;

use crate::config::ClientConfig;

#[derive(Debug, Clone)]
pub struct RetransmitSchedule {
    timeout: Duration,
    scale: f64,
    attempts: u32,
    max_retransmit: u32,
}

impl RetransmitSchedule {
    /// Draws the jittered initial timeout from
    /// `[ackTimeout, ackTimeout * ackRandomFactor)`.
    pub fn new(config: &ClientConfig) -> RetransmitSchedule {
        let factor = if config.ack_random_factor > 1.0 {
            rand::thread_rng().gen_range(1.0..config.ack_random_factor)
        } else {
            1.0
        };
        RetransmitSchedule {
            timeout: config.ack_timeout.mul_f64(factor),
            scale: config.ack_timeout_scale,
            attempts: 0,
            max_retransmit: config.max_retransmit,
        }
    }

    /// How long to wait before the next retransmission (or the final
    /// timeout verdict).
    pub fn delay(&self) -> Duration {
        self.timeout
    }

    /// Books one attempt and backs off. Returns `false` once the
    /// retransmission limit is exhausted and the exchange must time out.
    pub fn advance(&mut self) -> bool {
        self.attempts += 1;
        if self.attempts > self.max_retransmit {
            return false;
        }
        self.timeout = self.timeout.mul_f64(self.scale);
        true
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.min(self.max_retransmit)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_initial_delay_within_jitter_window() {
        let config = ClientConfig::default();
        for _ in 0..100 {
            let schedule = RetransmitSchedule::new(&config);
            assert!(schedule.delay() >= Duration::from_secs(2));
            assert!(schedule.delay() < Duration::from_secs(3));
        }
    }

    #[test]
    fn test_exponential_backoff() {
        let config = ClientConfig::default();
        let mut schedule = RetransmitSchedule::new(&config);
        let base = schedule.delay();

        assert!(schedule.advance());
        assert_eq!(schedule.delay(), base.mul_f64(2.0));
        assert!(schedule.advance());
        assert_eq!(schedule.delay(), base.mul_f64(4.0));
    }

    #[test]
    fn test_attempt_limit() {
        let config = ClientConfig::default();
        let mut schedule = RetransmitSchedule::new(&config);

        for _ in 0..config.max_retransmit {
            assert!(schedule.advance());
        }
        assert!(!schedule.advance());
        assert_eq!(schedule.attempts(), config.max_retransmit);
    }

    #[test]
    fn test_custom_limits() {
        let config = ClientConfig {
            max_retransmit: 0,
            ..ClientConfig::default()
        };
        let mut schedule = RetransmitSchedule::new(&config);
        assert!(!schedule.advance());
    }
}
