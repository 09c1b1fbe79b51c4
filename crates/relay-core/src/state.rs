use serde::Serialize;

use crate::signals::SignalSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationalState {
    AuthRequired,
    Challenge,
    RateLimited,
    Degraded,
    Ready,
}

impl OperationalState {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationalState::AuthRequired => "auth_required",
            OperationalState::Challenge => "challenge",
            OperationalState::RateLimited => "rate_limited",
            OperationalState::Degraded => "degraded",
            OperationalState::Ready => "ready",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StateSummary {
    pub state: OperationalState,
    pub reasons: Vec<&'static str>,
    pub queue_depth: usize,
    pub error_rate: f64,
}

// Pure projection; connectivity is probed by the caller, never here.
pub fn resolve_state(
    now_ms: u64,
    connectivity_ok: bool,
    signals: &SignalSnapshot,
    queue_depth: usize,
    error_rate: f64,
) -> StateSummary {
    let auth_active = signals.auth_required_until > now_ms;
    let challenge_active = signals.challenge_until > now_ms;
    let rate_active = signals.rate_limited_until > now_ms;
    let degraded_cooldown = signals.degraded_until > now_ms;

    let mut reasons = Vec::new();
    if auth_active {
        reasons.push("auth_required_signal");
    }
    if challenge_active {
        reasons.push("challenge_signal");
    }
    if rate_active {
        reasons.push("rate_limited_signal");
    }
    if !connectivity_ok {
        reasons.push("connectivity_check_failed");
    }
    if degraded_cooldown {
        reasons.push("degraded_cooldown");
    }

    let state = if auth_active {
        OperationalState::AuthRequired
    } else if challenge_active {
        OperationalState::Challenge
    } else if rate_active {
        OperationalState::RateLimited
    } else if !connectivity_ok || degraded_cooldown {
        OperationalState::Degraded
    } else {
        OperationalState::Ready
    };

    StateSummary {
        state,
        reasons,
        queue_depth,
        error_rate,
    }
}
