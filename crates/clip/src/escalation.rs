//! Retry escalation.
//!
//! A client re-issuing the same call with identical arguments inside the
//! configured window is taken as a signal that the last summary was too
//! aggressive. Each repeat multiplies the summary budget:
//! `multiplier^min(k-1, maxLevels)` on the k-th call, resetting once the
//! window has elapsed since the first call of the streak.

use crate::policy::RetryEscalation;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Streak {
    count: u32,
    first_seen: Instant,
    last_seen: Instant,
}

pub struct RetryEscalationTracker {
    settings: RetryEscalation,
    streaks: Mutex<HashMap<(String, String), Streak>>,
}

impl RetryEscalationTracker {
    pub fn new(settings: RetryEscalation) -> Self {
        Self {
            settings,
            streaks: Mutex::new(HashMap::new()),
        }
    }

    /// Record one call and return the budget factor to apply to it.
    ///
    /// The current call counts toward its own streak: the first call returns
    /// 1.0, the k-th repeat within the window returns
    /// `multiplier^min(k-1, maxLevels)`.
    pub fn record(&self, qualified: &str, args_hash: &str) -> f64 {
        self.record_at(qualified, args_hash, Instant::now())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), Streak>> {
        match self.streaks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn record_at(&self, qualified: &str, args_hash: &str, now: Instant) -> f64 {
        if !self.settings.enabled {
            return 1.0;
        }
        let key = (qualified.to_string(), args_hash.to_string());
        let mut streaks = self.lock();
        let streak = streaks
            .entry(key)
            .and_modify(|s| {
                if now.duration_since(s.first_seen) > self.settings.window {
                    *s = Streak {
                        count: 1,
                        first_seen: now,
                        last_seen: now,
                    };
                } else {
                    s.count += 1;
                    s.last_seen = now;
                }
            })
            .or_insert(Streak {
                count: 1,
                first_seen: now,
                last_seen: now,
            });
        let exponent = (streak.count - 1).min(self.settings.max_levels);
        self.settings.token_multiplier.powi(exponent as i32)
    }

    /// Drop streaks whose window has elapsed. Called by the periodic sweep.
    pub fn prune(&self) -> usize {
        self.prune_at(Instant::now())
    }

    fn prune_at(&self, now: Instant) -> usize {
        let mut streaks = self.lock();
        let before = streaks.len();
        streaks.retain(|_, s| now.duration_since(s.last_seen) <= self.settings.window);
        before - streaks.len()
    }
}
