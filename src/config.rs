//! Router configuration.

use std::time::Duration;

use crate::common::Id;

/// Max nodes kept in the node store.
pub const DEFAULT_NODE_STORE_SIZE: usize = 16384;

/// Nodes per reply and initial seeds per search.
pub const DEFAULT_RETURN_SIZE: usize = 8;

/// Seconds of history in the global mean response time window.
pub const DEFAULT_GMRT_WINDOW_SECONDS: u64 = 256;

/// Synthetic sample seeding the global mean response time, so the first
/// searches get a sane next-probe delay.
pub const DEFAULT_GMRT_INITIAL_MILLIS: u32 = 100;

/// Consecutive timeouts before a node is dropped from the store.
pub const DEFAULT_MAX_TIMEOUTS: u32 = 10;

/// Upper bound on a probe timeout; 2x the global mean response time is
/// used when lower.
pub const DEFAULT_SEARCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Linear reach decay; drains a saturated score in about 250 seconds.
pub const DEFAULT_REACH_DECREASE_PER_SECOND: u32 = u32::MAX / 2 / 250;

pub const DEFAULT_LOCAL_MAINTENANCE_SEARCH_PERIOD: Duration = Duration::from_secs(90);

pub const DEFAULT_GLOBAL_MAINTENANCE_SEARCH_PERIOD: Duration = Duration::from_secs(150);

#[derive(Debug, Clone)]
/// Router configurations
pub struct Config {
    /// This node's id, from which all distances are measured.
    ///
    /// Defaults to None, where a random id is generated.
    pub id: Option<Id>,
    /// Max nodes kept in the node store.
    ///
    /// Defaults to [DEFAULT_NODE_STORE_SIZE]
    pub node_store_size: usize,
    /// Nodes returned per reply, and seeds taken per search (K).
    ///
    /// Defaults to [DEFAULT_RETURN_SIZE]
    pub return_size: usize,
    /// Averaging window of the global mean response time.
    ///
    /// Defaults to [DEFAULT_GMRT_WINDOW_SECONDS]
    pub gmrt_window_seconds: u64,
    /// Seed sample for the global mean response time.
    ///
    /// Defaults to [DEFAULT_GMRT_INITIAL_MILLIS]
    pub gmrt_initial_millis: u32,
    /// Cap on the per-probe timeout.
    ///
    /// Probes normally time out after twice the global mean response time;
    /// on a congested path that can grow without bound, so it is clamped
    /// to this duration.
    ///
    /// Defaults to [DEFAULT_SEARCH_TIMEOUT]
    pub search_timeout: Duration,
    /// Consecutive timeouts before a node is removed from the store.
    ///
    /// Defaults to [DEFAULT_MAX_TIMEOUTS]
    pub max_timeouts: u32,
    /// Linear reach decay per second.
    ///
    /// Defaults to [DEFAULT_REACH_DECREASE_PER_SECOND]
    pub reach_decrease_per_second: u32,
    /// How often to consider a self-training search for a random target.
    ///
    /// Defaults to [DEFAULT_LOCAL_MAINTENANCE_SEARCH_PERIOD]
    pub local_maintenance_search_period: Duration,
    /// How often to re-issue a recently served search target ourselves.
    ///
    /// Defaults to [DEFAULT_GLOBAL_MAINTENANCE_SEARCH_PERIOD]
    pub global_maintenance_search_period: Duration,
    /// Explicit port to listen on.
    ///
    /// Defaults to None
    pub port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            id: None,
            node_store_size: DEFAULT_NODE_STORE_SIZE,
            return_size: DEFAULT_RETURN_SIZE,
            gmrt_window_seconds: DEFAULT_GMRT_WINDOW_SECONDS,
            gmrt_initial_millis: DEFAULT_GMRT_INITIAL_MILLIS,
            search_timeout: DEFAULT_SEARCH_TIMEOUT,
            max_timeouts: DEFAULT_MAX_TIMEOUTS,
            reach_decrease_per_second: DEFAULT_REACH_DECREASE_PER_SECOND,
            local_maintenance_search_period: DEFAULT_LOCAL_MAINTENANCE_SEARCH_PERIOD,
            global_maintenance_search_period: DEFAULT_GLOBAL_MAINTENANCE_SEARCH_PERIOD,
            port: None,
        }
    }
}
