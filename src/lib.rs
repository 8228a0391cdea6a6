//! chronicle — replicated configuration store core.
//!
//! This crate implements the leader lifecycle of a small strongly
//! consistent cluster: discovering and electing a single leader under a
//! quorum discipline, keeping it alive with heartbeats over TCP +
//! MessagePack, detecting leadership loss, publishing leader snapshots to
//! in-process clients, and letting silently removed nodes find out and
//! mark themselves removed.
//!
//! # Quick start
//!
//! 1. Implement [`Agent`] over your metadata/log engine (or embed
//!    [`MemoryAgent`]).
//! 2. Construct a [`Config`], an [`EventBus`], and a [`PeerMonitor`].
//! 3. Call [`LeaderHandle::spawn`] on every node.
//! 4. Use [`get_leader`](LeaderHandle::get_leader) /
//!    [`wait_for_leader`](LeaderHandle::wait_for_leader) to route client
//!    work; wire your proposer to
//!    [`note_term_established`](LeaderHandle::note_term_established).

pub mod agent;
pub mod config;
pub mod events;
pub mod leader;
pub mod status;
pub mod transport;
pub mod types;

mod election;
mod membership;
mod rpc;
mod server;
mod timer;

pub use agent::{Agent, AgentError, MemoryAgent, Metadata, SystemState};
pub use config::Config;
pub use events::{ClusterEvent, EventBus, PeerEvent, PeerMonitor};
pub use leader::LeaderHandle;
pub use status::{LeaderWatch, NoLeader};
pub use types::{
    ClusterConfig, HistoryId, Incarnation, LeaderInfo, LeaderStatus, LogPosition, PeerId, Quorum,
    Term,
};
