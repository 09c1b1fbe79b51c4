use std::sync::Mutex;

use serde::Serialize;

use crate::error::codes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownConfig {
    pub auth_required_ms: u64,
    pub challenge_ms: u64,
    pub rate_limited_ms: u64,
    pub degraded_ms: u64,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            auth_required_ms: 300_000,
            challenge_ms: 90_000,
            rate_limited_ms: 45_000,
            degraded_ms: 15_000,
        }
    }
}

impl CooldownConfig {
    pub fn normalized(self) -> Self {
        Self {
            auth_required_ms: self.auth_required_ms.max(1_000),
            challenge_ms: self.challenge_ms.max(1_000),
            rate_limited_ms: self.rate_limited_ms.max(1_000),
            degraded_ms: self.degraded_ms.max(1_000),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SignalSnapshot {
    pub auth_required_until: u64,
    pub challenge_until: u64,
    pub rate_limited_until: u64,
    pub degraded_until: u64,
    pub cooldown_until: u64,
}

#[derive(Debug, Default)]
struct Deadlines {
    auth_required_until: u64,
    challenge_until: u64,
    rate_limited_until: u64,
    degraded_until: u64,
}

#[derive(Debug, Default)]
pub struct CooldownSignals {
    config: CooldownConfig,
    inner: Mutex<Deadlines>,
}

impl CooldownSignals {
    pub fn new(config: CooldownConfig) -> Self {
        Self {
            config: config.normalized(),
            inner: Mutex::new(Deadlines::default()),
        }
    }

    // Deadlines only move forward; a shorter later cooldown never shrinks one.
    pub fn apply_for_code(&self, code: &str, now_ms: u64) {
        let config = self.config;
        let mut inner = self.lock();
        match code {
            codes::UPSTREAM_LOGIN_REQUIRED => {
                inner.auth_required_until = inner
                    .auth_required_until
                    .max(now_ms + config.auth_required_ms);
            }
            codes::UPSTREAM_CHALLENGE => {
                inner.challenge_until = inner.challenge_until.max(now_ms + config.challenge_ms);
            }
            codes::UPSTREAM_RATE_LIMITED => {
                inner.rate_limited_until =
                    inner.rate_limited_until.max(now_ms + config.rate_limited_ms);
            }
            codes::UPSTREAM_UNAVAILABLE => {
                inner.degraded_until = inner.degraded_until.max(now_ms + config.degraded_ms);
            }
            _ => {}
        }
    }

    pub fn gate_deadline(&self) -> u64 {
        self.snapshot().cooldown_until
    }

    pub fn snapshot(&self) -> SignalSnapshot {
        let inner = self.lock();
        let cooldown_until = inner
            .auth_required_until
            .max(inner.challenge_until)
            .max(inner.rate_limited_until)
            .max(inner.degraded_until);
        SignalSnapshot {
            auth_required_until: inner.auth_required_until,
            challenge_until: inner.challenge_until,
            rate_limited_until: inner.rate_limited_until,
            degraded_until: inner.degraded_until,
            cooldown_until,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Deadlines> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_required_advances_auth_deadline_by_configured_cooldown() {
        let signals = CooldownSignals::new(CooldownConfig::default());
        let now = 1_000_000;
        signals.apply_for_code(codes::UPSTREAM_LOGIN_REQUIRED, now);

        let snapshot = signals.snapshot();
        assert_eq!(snapshot.auth_required_until, now + 300_000);
        assert_eq!(snapshot.cooldown_until, now + 300_000);
        assert_eq!(snapshot.challenge_until, 0);
    }

    #[test]
    fn gate_is_max_of_all_deadlines() {
        let signals = CooldownSignals::new(CooldownConfig {
            auth_required_ms: 1_000,
            challenge_ms: 5_000,
            rate_limited_ms: 2_000,
            degraded_ms: 1_000,
        });
        let now = 50_000;
        signals.apply_for_code(codes::UPSTREAM_RATE_LIMITED, now);
        signals.apply_for_code(codes::UPSTREAM_CHALLENGE, now);

        assert_eq!(signals.gate_deadline(), now + 5_000);
    }

    #[test]
    fn deadlines_never_move_backwards() {
        let signals = CooldownSignals::new(CooldownConfig::default());
        signals.apply_for_code(codes::UPSTREAM_UNAVAILABLE, 100_000);
        let first = signals.snapshot().degraded_until;
        signals.apply_for_code(codes::UPSTREAM_UNAVAILABLE, 10_000);
        assert_eq!(signals.snapshot().degraded_until, first);
    }

    #[test]
    fn floors_apply_to_degenerate_config() {
        let signals = CooldownSignals::new(CooldownConfig {
            auth_required_ms: 0,
            challenge_ms: 1,
            rate_limited_ms: 10,
            degraded_ms: 0,
        });
        signals.apply_for_code(codes::UPSTREAM_LOGIN_REQUIRED, 1_000);
        assert!(signals.snapshot().auth_required_until >= 2_000);
    }

    #[test]
    fn non_signal_codes_leave_deadlines_untouched() {
        let signals = CooldownSignals::new(CooldownConfig::default());
        signals.apply_for_code(codes::UPSTREAM_TIMEOUT, 1_000);
        signals.apply_for_code(codes::INTERNAL_ERROR, 1_000);
        assert_eq!(signals.snapshot(), SignalSnapshot::default());
    }
}
