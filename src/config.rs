use std::time::Duration;

use crate::types::PeerId;

/// Leader subsystem configuration.
///
/// The consumer constructs this struct however they want (env vars, TOML,
/// etc.); chronicle does no file I/O or env reading. Timing knobs are
/// multiples of `heartbeat_interval` unless noted.
#[derive(Debug, Clone)]
pub struct Config {
    /// This node's identity. The string is also the cluster TCP address
    /// peers use to reach it (`host:port`).
    pub peer_id: PeerId,
    /// Address the inbound cluster listener binds to. Usually
    /// `0.0.0.0:port` with the same port as `peer_id`.
    pub listen_addr: String,
    /// How often an active leader sends heartbeats. The base unit for
    /// every other timeout.
    pub heartbeat_interval: Duration,
    /// Upper bound of the randomized observer wait, in heartbeat
    /// intervals (scaled further by the election backoff).
    pub observer_multiplier: u32,
    /// How long a candidate waits for its election to finish, in
    /// heartbeat intervals.
    pub candidate_multiplier: u32,
    /// How long a follower (or a node that just voted) waits without
    /// hearing from the leader before reverting to observer, in heartbeat
    /// intervals.
    pub follower_multiplier: u32,
    /// Ceiling of the exponential election backoff factor.
    pub max_backoff: u32,
    /// After winning quorum, how long a candidate keeps collecting
    /// outstanding vote replies to learn of higher terms.
    pub extra_wait_time: Duration,
    /// Idle period before a non-participating node verifies its own
    /// cluster membership.
    pub check_member_after: Duration,
    /// How long a membership probe may run before it is abandoned.
    pub check_member_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            peer_id: PeerId::new(""),
            listen_addr: String::new(),
            heartbeat_interval: Duration::from_millis(100),
            observer_multiplier: 5,
            candidate_multiplier: 50,
            follower_multiplier: 20,
            max_backoff: 16,
            extra_wait_time: Duration::from_millis(10),
            check_member_after: Duration::from_secs(10),
            check_member_timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Candidate election deadline (`candidate_multiplier · H`).
    pub(crate) fn candidate_timeout(&self) -> Duration {
        self.heartbeat_interval * self.candidate_multiplier
    }

    /// Follower/voted liveness deadline (`follower_multiplier · H`).
    pub(crate) fn follower_timeout(&self) -> Duration {
        self.heartbeat_interval * self.follower_multiplier
    }
}
