//! C5: Throttle gate.
//!
//! Per-rule send counts are a separate record keyed by `(user_id, rule_id)`,
//! never a mutation of the rule value itself -- throttle state has its own
//! lifecycle (reset every rolling hour) independent of rule configuration,
//! which can be edited concurrently by the user.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

#[derive(Debug, Clone)]
struct ThrottleWindow {
    /// Evicted lazily: any timestamp older than one hour is dropped before
    /// counting, rather than tracked against a fixed window boundary -- a
    /// burst at t=59m and another at t=61m both see only the still-live
    /// tail, not a hard reset at t=60m.
    sent_at: Vec<DateTime<Utc>>,
    last_sent: Option<DateTime<Utc>>,
}

impl ThrottleWindow {
    fn evict_stale(&mut self, now: DateTime<Utc>) {
        self.sent_at.retain(|t| now - *t < Duration::hours(1));
    }
}

#[derive(Default)]
pub struct ThrottleGate {
    windows: DashMap<(String, String), ThrottleWindow>,
}

impl ThrottleGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the send is allowed: under `max_per_hour` (if set)
    /// and at least `cooldown` since the last successful send (if nonzero).
    /// A denied message still leaves state untouched so it can be recorded
    /// as `Drop("throttled")` by the caller.
    pub fn check_and_record(
        &self,
        user_id: &str,
        rule_id: &str,
        max_per_hour: Option<u32>,
        cooldown: Duration,
        now: DateTime<Utc>,
    ) -> bool {
        let key = (user_id.to_string(), rule_id.to_string());
        let mut entry = self.windows.entry(key).or_insert_with(|| ThrottleWindow {
            sent_at: Vec::new(),
            last_sent: None,
        });

        entry.evict_stale(now);

        if let Some(last_sent) = entry.last_sent {
            if cooldown > Duration::zero() && now - last_sent < cooldown {
                return false;
            }
        }

        if let Some(max) = max_per_hour {
            if entry.sent_at.len() as u32 >= max {
                return false;
            }
        }

        entry.sent_at.push(now);
        entry.last_sent = Some(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_max_then_denies() {
        let gate = ThrottleGate::new();
        let now = Utc::now();

        for _ in 0..3 {
            assert!(gate.check_and_record("u1", "r1", Some(3), Duration::zero(), now));
        }
        assert!(!gate.check_and_record("u1", "r1", Some(3), Duration::zero(), now));
    }

    #[test]
    fn window_resets_after_an_hour() {
        let gate = ThrottleGate::new();
        let now = Utc::now();

        for _ in 0..3 {
            assert!(gate.check_and_record("u1", "r1", Some(3), Duration::zero(), now));
        }
        assert!(!gate.check_and_record("u1", "r1", Some(3), Duration::zero(), now));

        let later = now + Duration::hours(1) + Duration::seconds(1);
        assert!(gate.check_and_record("u1", "r1", Some(3), Duration::zero(), later));
    }

    #[test]
    fn no_max_per_hour_is_never_throttled() {
        let gate = ThrottleGate::new();
        let now = Utc::now();
        for _ in 0..100 {
            assert!(gate.check_and_record("u1", "r1", None, Duration::zero(), now));
        }
    }

    #[test]
    fn different_users_have_independent_windows() {
        let gate = ThrottleGate::new();
        let now = Utc::now();
        assert!(gate.check_and_record("u1", "r1", Some(1), Duration::zero(), now));
        assert!(!gate.check_and_record("u1", "r1", Some(1), Duration::zero(), now));
        assert!(gate.check_and_record("u2", "r1", Some(1), Duration::zero(), now));
    }

    #[test]
    fn cooldown_denies_before_it_elapses_even_under_max_per_hour() {
        let gate = ThrottleGate::new();
        let now = Utc::now();
        let cooldown = Duration::seconds(30);

        assert!(gate.check_and_record("u1", "r1", Some(10), cooldown, now));
        assert!(!gate.check_and_record(
            "u1",
            "r1",
            Some(10),
            cooldown,
            now + Duration::seconds(10)
        ));
        assert!(gate.check_and_record(
            "u1",
            "r1",
            Some(10),
            cooldown,
            now + Duration::seconds(31)
        ));
    }
}
