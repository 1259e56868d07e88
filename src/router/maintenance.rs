//! Periodic upkeep cadence: reach decay, self-training searches, and
//! re-searching recently served targets.

use std::time::{Duration, Instant};

use crate::config::Config;

/// Maintenance timer state
#[derive(Debug)]
pub(crate) struct Maintenance {
    last_decay: Instant,
    last_local_search: Instant,
    last_global_search: Instant,
}

/// What upkeep is due this tick
#[derive(Debug, PartialEq)]
pub(crate) struct MaintenanceDecisions {
    /// Whole seconds of reach decay to apply; None when under a second
    /// has passed.
    pub decay_seconds: Option<u32>,

    /// Whether to consider a self-training search for a random target.
    pub local_search_due: bool,

    /// Whether to re-issue a recently served search target.
    pub global_search_due: bool,
}

impl Maintenance {
    pub fn new() -> Self {
        let now = Instant::now();
        Maintenance {
            last_decay: now,
            last_local_search: now,
            last_global_search: now,
        }
    }

    /// Determine what upkeep should run, resetting the timers that fire.
    pub fn decisions_at(&mut self, now: Instant, config: &Config) -> MaintenanceDecisions {
        let decay_elapsed = now.duration_since(self.last_decay);
        let decay_seconds = if decay_elapsed >= Duration::from_secs(1) {
            let whole = decay_elapsed.as_secs().min(u32::MAX as u64) as u32;
            // Only consume the whole seconds; the fraction stays on the clock.
            self.last_decay += Duration::from_secs(whole as u64);
            Some(whole)
        } else {
            None
        };

        let local_search_due =
            now.duration_since(self.last_local_search) >= config.local_maintenance_search_period;
        if local_search_due {
            self.last_local_search = now;
        }

        let global_search_due =
            now.duration_since(self.last_global_search) >= config.global_maintenance_search_period;
        if global_search_due {
            self.last_global_search = now;
        }

        MaintenanceDecisions {
            decay_seconds,
            local_search_due,
            global_search_due,
        }
    }
}
