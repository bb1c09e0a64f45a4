//! Rate-limit gate
//!
//! The cloud API rate limits per project, so every object reconciled with the
//! same token shares one budget. When a call site sees a rate-limit response it
//! marks `HetznerAPIReachable` False on its object; the gate then keeps that
//! object away from the API until the configured wait has passed since the
//! condition flipped.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, warn};

use crate::conditions::{reasons, types, ConditionSeverity, Conditions};

/// Requeue delay while the gate is closed
pub const RATE_LIMIT_REQUEUE: Duration = Duration::from_secs(30);

/// Default time to stay away from the API after a rate-limit response
pub const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(5 * 60);

/// Gate decision
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Gate {
    /// Talk to the API
    Proceed,
    /// Stay away; requeue after the given delay
    Defer(Duration),
}

/// Per-object backoff gate driven by the `HetznerAPIReachable` condition
#[derive(Clone, Copy, Debug)]
pub struct RateLimitGate {
    wait: Duration,
}

impl Default for RateLimitGate {
    fn default() -> Self {
        Self::new(DEFAULT_RATE_LIMIT_WAIT)
    }
}

impl RateLimitGate {
    /// Gate with the given wait duration
    pub fn new(wait: Duration) -> Self {
        Self { wait }
    }

    /// The configured wait
    pub fn wait(&self) -> Duration {
        self.wait
    }

    /// Check the gate now
    pub fn check(&self, conditions: &mut Conditions) -> Gate {
        self.check_at(conditions, Utc::now())
    }

    /// Check the gate at `now`
    ///
    /// Returns [`Gate::Defer`] while `HetznerAPIReachable` is False and the
    /// wait since its last transition has not elapsed. Once it has, the
    /// condition is flipped back to True and the caller proceeds.
    pub fn check_at(&self, conditions: &mut Conditions, now: DateTime<Utc>) -> Gate {
        let Some(condition) = conditions.get(types::HETZNER_API_REACHABLE) else {
            return Gate::Proceed;
        };
        if !condition.is_false() {
            return Gate::Proceed;
        }

        let wait = TimeDelta::from_std(self.wait).unwrap_or(TimeDelta::MAX);
        let reopens_at = condition.last_transition_time.checked_add_signed(wait);
        match reopens_at {
            Some(at) if now >= at => {
                debug!("rate limit wait elapsed, reopening gate");
                conditions.mark_true(types::HETZNER_API_REACHABLE);
                Gate::Proceed
            }
            _ => Gate::Defer(RATE_LIMIT_REQUEUE),
        }
    }
}

/// Record that a call to the API was rate limited
pub fn mark_rate_limited(conditions: &mut Conditions, operation: &str) {
    warn!(operation, "cloud API rate limit exceeded");
    conditions.mark_false(
        types::HETZNER_API_REACHABLE,
        reasons::RATE_LIMIT_EXCEEDED,
        ConditionSeverity::Warning,
        format!("exceeded rate limit with calling function {operation:?}"),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limited_at(at: DateTime<Utc>) -> Conditions {
        let mut set = Conditions::new();
        mark_rate_limited(&mut set, "create_server");
        let mut list: Vec<crate::Condition> = set.into();
        list[0].last_transition_time = at;
        list.into()
    }

    #[test]
    fn proceeds_without_condition() {
        let gate = RateLimitGate::default();
        let mut set = Conditions::new();
        assert_eq!(gate.check(&mut set), Gate::Proceed);
        assert!(set.is_empty());
    }

    /// Story: no API call before T+W, exactly one retry window after
    #[test]
    fn story_gate_is_monotonic_in_time() {
        let gate = RateLimitGate::new(Duration::from_secs(300));
        let t = Utc::now() - TimeDelta::seconds(1000);
        let mut set = limited_at(t);

        for offset in [0, 1, 150, 299] {
            let now = t + TimeDelta::seconds(offset);
            assert_eq!(
                gate.check_at(&mut set, now),
                Gate::Defer(RATE_LIMIT_REQUEUE),
                "gate must stay closed {offset}s after the rate limit"
            );
            assert!(set.is_false(types::HETZNER_API_REACHABLE));
        }

        let now = t + TimeDelta::seconds(300);
        assert_eq!(gate.check_at(&mut set, now), Gate::Proceed);
        assert!(set.is_true(types::HETZNER_API_REACHABLE));

        // Gate stays open until a call site observes another rate limit
        assert_eq!(gate.check_at(&mut set, now), Gate::Proceed);
    }

    #[test]
    fn gate_never_sets_false_itself() {
        let gate = RateLimitGate::default();
        let mut set = Conditions::new();
        set.mark_true(types::HETZNER_API_REACHABLE);
        assert_eq!(gate.check(&mut set), Gate::Proceed);
        assert!(set.is_true(types::HETZNER_API_REACHABLE));
    }

    #[test]
    fn repeated_rate_limits_do_not_extend_the_wait() {
        let gate = RateLimitGate::new(Duration::from_secs(60));
        let t = Utc::now() - TimeDelta::seconds(61);
        let mut set = limited_at(t);
        mark_rate_limited(&mut set, "reboot_server");
        assert_eq!(gate.check(&mut set), Gate::Proceed);
    }
}
