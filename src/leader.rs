//! The leader lifecycle task: a single state machine per node that elects
//! a leader under a quorum discipline, keeps it alive with heartbeats,
//! detects leadership loss, publishes leader snapshots to local clients,
//! and periodically verifies the node's own cluster membership.
//!
//! All state lives in one spawned task; peer traffic, timers, metadata
//! events, and worker results arrive as messages and are handled without
//! blocking. Elections and membership probes run as one-shot child tasks
//! that report a single typed outcome.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::agent::{Agent, Metadata, SystemState};
use crate::config::Config;
use crate::election::{self, ElectionError, ElectionWin};
use crate::events::{ClusterEvent, EventBus, PeerEvent, PeerMonitor};
use crate::membership::{self, MemberCheckOutcome};
use crate::rpc::{
    EventMsg, MemberCheckReply, MemberCheckRequest, VoteRefusal, VoteReply, VoteRequest,
};
use crate::server;
use crate::status::{leader_cell, LeaderPublisher, LeaderWatch, NoLeader};
use crate::timer::{Backoff, TimerFired, TimerName, TimerSet};
use crate::transport::PeerTransport;
use crate::types::{HistoryId, Incarnation, LeaderInfo, LeaderStatus, PeerId, Term};

const COMMAND_DEPTH: usize = 256;

// ============================================================================
// Messages into the leader task
// ============================================================================

#[derive(Debug)]
pub(crate) enum Command {
    // Local API.
    NoteTermEstablished {
        history_id: HistoryId,
        term: Term,
    },
    NoteTermFinished {
        history_id: HistoryId,
        term: Term,
    },
    AnnounceLeaderStatus,
    Sync {
        reply: oneshot::Sender<()>,
    },
    Shutdown,

    // Inbound peer traffic, routed here by the server.
    Heartbeat(LeaderInfo),
    SteppingDown(LeaderInfo),
    Vote {
        request: VoteRequest,
        reply: oneshot::Sender<VoteReply>,
    },
    MemberCheck {
        request: MemberCheckRequest,
        reply: oneshot::Sender<MemberCheckReply>,
    },

    // Worker completions, tagged with the spawn generation so a result
    // from a killed worker is discarded.
    ElectionDone {
        generation: u64,
        outcome: Result<ElectionWin, ElectionError>,
    },
    MemberCheckDone {
        generation: u64,
        outcome: MemberCheckOutcome,
    },
}

// ============================================================================
// States
// ============================================================================

#[derive(Debug, Clone)]
enum State {
    /// Not participating, or waiting out the randomized backoff before
    /// competing.
    Observer { electable: bool, removed: bool },
    /// Granted a vote in the current term; no leader known yet.
    VotedFor { peer: PeerId },
    /// An election worker is running.
    Candidate,
    Leader(LeaderInfo),
    /// Tracking a remote leader via its heartbeats.
    Follower(LeaderInfo),
    /// A membership probe is running.
    CheckMember,
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::Observer { .. } => "observer",
            State::VotedFor { .. } => "voted",
            State::Candidate => "candidate",
            State::Leader(_) => "leader",
            State::Follower(_) => "follower",
            State::CheckMember => "check-member",
        }
    }

    fn leader_info(&self) -> Option<&LeaderInfo> {
        match self {
            State::Leader(info) | State::Follower(info) => Some(info),
            _ => None,
        }
    }
}

/// Why the leader task stopped.
enum TaskExit {
    Shutdown,
    Fatal(String),
}

/// What this node knows about the current leader term when judging an
/// incoming heartbeat.
#[derive(Debug, Clone)]
struct KnownLeader {
    term: Term,
    status: KnownStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KnownStatus {
    Established,
    Tentative,
    /// No active leader; `term` is the last established term.
    Inactive,
}

enum HeartbeatDecision {
    Accept,
    Reject(&'static str),
    /// Two established leaders in the same term: a broken invariant, not
    /// a recoverable condition.
    Fatal(String),
}

/// The §4.5 acceptance rules, as a pure function.
fn evaluate_heartbeat(ours: &KnownLeader, incoming: &LeaderInfo) -> HeartbeatDecision {
    // Identical term tuple: the leader we already know (or a refresh of
    // the last established term's leader).
    if incoming.term == ours.term {
        return HeartbeatDecision::Accept;
    }

    match incoming.term.number.cmp(&ours.term.number) {
        std::cmp::Ordering::Greater => HeartbeatDecision::Accept,
        std::cmp::Ordering::Less => HeartbeatDecision::Reject("stale term"),
        // Same term number coined by a different peer: two contenders.
        std::cmp::Ordering::Equal => match incoming.status {
            LeaderStatus::Established => {
                if ours.status == KnownStatus::Established {
                    HeartbeatDecision::Fatal(format!(
                        "two established leaders in term {}: ours {}, theirs {}",
                        ours.term.number, ours.term, incoming.term
                    ))
                } else {
                    HeartbeatDecision::Accept
                }
            }
            LeaderStatus::Tentative => {
                if ours.status == KnownStatus::Inactive {
                    HeartbeatDecision::Accept
                } else {
                    HeartbeatDecision::Reject("have leader")
                }
            }
        },
    }
}

// ============================================================================
// The leader task
// ============================================================================

struct LeaderTask {
    config: Config,
    agent: Arc<dyn Agent>,
    transport: Arc<PeerTransport>,
    monitor: PeerMonitor,
    publisher: LeaderPublisher,
    command_tx: mpsc::Sender<Command>,

    state: State,
    /// All config members except self.
    peers: Vec<PeerId>,
    history_id: Option<HistoryId>,
    /// Last known established term in the current history.
    established_term: Option<Term>,
    electable: bool,
    removed: bool,

    timers: TimerSet,
    backoff: Backoff,
    worker: Option<JoinHandle<()>>,
    worker_generation: u64,
}

impl LeaderTask {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut timer_rx: mpsc::UnboundedReceiver<TimerFired>,
        mut events: broadcast::Receiver<ClusterEvent>,
        mut peer_events: broadcast::Receiver<PeerEvent>,
    ) -> (TaskExit, mpsc::Receiver<Command>) {
        if let Err(reason) = self.init() {
            self.kill_worker();
            return (TaskExit::Fatal(reason), commands);
        }

        let exit = loop {
            let result = tokio::select! {
                cmd = commands.recv() => match cmd {
                    None | Some(Command::Shutdown) => break TaskExit::Shutdown,
                    Some(cmd) => self.handle_command(cmd),
                },
                Some(fired) = timer_rx.recv() => {
                    self.handle_timer(fired);
                    Ok(())
                }
                event = events.recv() => match event {
                    Ok(event) => {
                        self.handle_cluster_event(event);
                        Ok(())
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Metadata events lagged, resyncing from agent");
                        self.resync_metadata();
                        Ok(())
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break TaskExit::Shutdown;
                    }
                },
                event = peer_events.recv() => {
                    if let Ok(event) = event {
                        self.handle_peer_event(event);
                    }
                    Ok(())
                }
            };
            if let Err(reason) = result {
                break TaskExit::Fatal(reason);
            }
        };

        self.kill_worker();
        (exit, commands)
    }

    /// Query the agent for the starting state and reach out to peers.
    fn init(&mut self) -> Result<(), String> {
        self.agent.sync();
        match self.agent.get_system_state() {
            SystemState::Provisioned(meta) => {
                self.apply_metadata(&meta);
                self.removed = false;
                self.enter(State::Observer {
                    electable: self.electable,
                    removed: false,
                });
            }
            SystemState::Removed(meta) => {
                self.apply_metadata(&meta);
                self.removed = true;
                self.electable = false;
                self.enter(State::Observer {
                    electable: false,
                    removed: true,
                });
            }
            SystemState::JoiningCluster(meta) => {
                self.history_id = Some(meta.history_id.clone());
                self.enter(State::Observer {
                    electable: false,
                    removed: false,
                });
            }
            SystemState::NotProvisioned => {
                return Err("system is neither provisioned, joining, nor removed".to_string());
            }
        }

        for peer in &self.peers {
            if !self.monitor.is_live(peer) {
                self.transport.connect(peer);
            }
        }
        Ok(())
    }

    /// Refresh caches from a metadata snapshot.
    fn apply_metadata(&mut self, meta: &Metadata) {
        let me = &self.config.peer_id;
        self.peers = meta.config.members.keys().filter(|p| *p != me).cloned().collect();
        self.history_id = Some(meta.history_id.clone());
        self.electable = meta.is_electable();
        self.established_term = Some(meta.term.clone());
    }

    fn resync_metadata(&mut self) {
        if let Ok(meta) = self.agent.get_metadata() {
            self.apply_metadata(&meta);
        }
    }

    /// The observer state matching the current flags.
    fn observer(&self) -> State {
        State::Observer {
            electable: self.electable && !self.removed,
            removed: self.removed,
        }
    }

    // ------------------------------------------------------------------
    // State entry
    // ------------------------------------------------------------------

    fn enter(&mut self, next: State) {
        let prev = std::mem::replace(&mut self.state, next);

        // Announce departure when leaving leadership.
        if let State::Leader(info) = &prev {
            if !matches!(self.state, State::Leader(_)) {
                info!(term = %info.term, "Stepping down");
                self.broadcast(EventMsg::SteppingDown(info.clone()));
            }
        }

        if prev.name() != self.state.name() {
            info!(from = prev.name(), to = self.state.name(), "State change");
        }

        self.publish();
        self.timers.cancel_state_scoped();
        self.kill_worker();

        match &self.state {
            State::Observer {
                electable: true, ..
            } => {
                let wait = self
                    .backoff
                    .observer_wait(self.config.heartbeat_interval, self.config.observer_multiplier);
                self.timers.arm(TimerName::State, wait);
            }
            State::Observer { .. } => {}
            State::VotedFor { .. } | State::Follower(_) => {
                self.timers.arm(TimerName::State, self.config.follower_timeout());
            }
            State::Candidate => {
                self.timers.arm(TimerName::State, self.config.candidate_timeout());
            }
            State::CheckMember => {
                self.timers.arm(TimerName::State, self.config.check_member_timeout);
            }
            State::Leader(_) => {
                self.timers
                    .arm_periodic(TimerName::SendHeartbeat, self.config.heartbeat_interval);
            }
        }

        if matches!(
            self.state,
            State::Leader(_) | State::Follower(_) | State::VotedFor { .. }
        ) {
            self.backoff.reset();
        }

        if self.member_check_eligible() {
            if !self.timers.is_armed(TimerName::CheckMember) {
                self.timers.arm(TimerName::CheckMember, self.config.check_member_after);
            }
        } else {
            self.timers.cancel(TimerName::CheckMember);
        }

        match self.state {
            State::Candidate => self.spawn_election(),
            State::CheckMember => self.spawn_member_check(),
            _ => {}
        }
    }

    fn member_check_eligible(&self) -> bool {
        !matches!(
            self.state,
            State::Leader(_)
                | State::Follower(_)
                | State::CheckMember
                | State::Observer { removed: true, .. }
        )
    }

    /// Republish the leader snapshot if it changed.
    fn publish(&mut self) {
        let info = self.state.leader_info().cloned();
        if self.publisher.current() != info {
            match &info {
                Some(info) => info!(leader = %info, "Publishing leader"),
                None => debug!("Clearing published leader"),
            }
            self.publisher.publish(info);
        }
    }

    fn broadcast(&self, event: EventMsg) {
        let live = self.monitor.live_peers();
        for peer in self.peers.iter().filter(|p| live.contains(*p)) {
            self.transport.cast(peer, event.clone());
        }
    }

    fn send_heartbeats(&self) {
        if let State::Leader(info) = &self.state {
            self.broadcast(EventMsg::Heartbeat(info.clone()));
        }
    }

    // ------------------------------------------------------------------
    // Workers
    // ------------------------------------------------------------------

    fn kill_worker(&mut self) {
        if let Some(handle) = self.worker.take() {
            handle.abort();
            self.worker_generation += 1;
        }
    }

    fn spawn_election(&mut self) {
        self.worker_generation += 1;
        let generation = self.worker_generation;
        let me = self.config.peer_id.clone();
        let agent = Arc::clone(&self.agent);
        let transport = Arc::clone(&self.transport);
        let tx = self.command_tx.clone();
        let request_timeout = self.config.candidate_timeout();
        let extra_wait = self.config.extra_wait_time;

        self.worker = Some(tokio::spawn(async move {
            let outcome =
                election::run_election(me, agent, transport, request_timeout, extra_wait).await;
            let _ = tx.send(Command::ElectionDone { generation, outcome }).await;
        }));
    }

    fn spawn_member_check(&mut self) {
        self.worker_generation += 1;
        let generation = self.worker_generation;
        let me = self.config.peer_id.clone();
        let agent = Arc::clone(&self.agent);
        let transport = Arc::clone(&self.transport);
        let tx = self.command_tx.clone();
        let request_timeout = self.config.check_member_timeout;

        self.worker = Some(tokio::spawn(async move {
            let outcome = membership::run_member_check(me, agent, transport, request_timeout).await;
            let _ = tx
                .send(Command::MemberCheckDone { generation, outcome })
                .await;
        }));
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    fn handle_timer(&mut self, fired: TimerFired) {
        if !self.timers.is_current(&fired) {
            return;
        }

        match fired.name {
            TimerName::State => match self.state.clone() {
                State::Observer {
                    electable: true, ..
                } => {
                    debug!("Observer wait over, standing for election");
                    self.enter(State::Candidate);
                }
                State::Observer { .. } => {}
                State::VotedFor { peer } => {
                    debug!(peer = %peer, "No leader emerged after vote");
                    self.enter(self.observer());
                }
                State::Follower(info) => {
                    info!(leader = %info.leader, "Leader went silent");
                    self.enter(self.observer());
                }
                // The worker stalled without reporting.
                State::Candidate => {
                    warn!("Election timed out");
                    self.backoff.double();
                    self.enter(self.observer());
                }
                State::CheckMember => {
                    warn!("Membership probe timed out");
                    self.enter(self.observer());
                }
                State::Leader(_) => {}
            },
            TimerName::SendHeartbeat => self.send_heartbeats(),
            TimerName::CheckMember => {
                if self.member_check_eligible() {
                    self.enter(State::CheckMember);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    fn handle_command(&mut self, cmd: Command) -> Result<(), String> {
        match cmd {
            Command::NoteTermEstablished { history_id, term } => {
                self.note_term_established(history_id, term);
            }
            Command::NoteTermFinished { history_id, term } => {
                let finished = matches!(
                    &self.state,
                    State::Leader(info) if info.history_id == history_id && info.term == term
                );
                if finished {
                    info!(term = %term, "Proposer gave up the term");
                    self.enter(self.observer());
                }
            }
            Command::AnnounceLeaderStatus => {
                // Forced republish wakes waiters even on an unchanged value.
                self.publisher.publish(self.state.leader_info().cloned());
            }
            Command::Sync { reply } => {
                self.agent.sync();
                let _ = reply.send(());
            }
            Command::Heartbeat(info) => return self.handle_heartbeat(info),
            Command::SteppingDown(info) => {
                let tracked = matches!(
                    &self.state,
                    State::Follower(current) if current.leader == info.leader
                );
                if tracked {
                    info!(leader = %info.leader, "Leader stepped down");
                    self.enter(self.observer());
                }
            }
            Command::Vote { request, reply } => {
                let response = self.handle_vote(request);
                let _ = reply.send(response);
            }
            Command::MemberCheck { request, reply } => {
                let response = match self.agent.check_member(
                    &request.history_id,
                    &request.peer,
                    request.peer_incarnation,
                    request.peer_seqno,
                ) {
                    Ok(member) => MemberCheckReply::Known(member),
                    Err(e) => MemberCheckReply::Unknown(e.to_string()),
                };
                let _ = reply.send(response);
            }
            Command::ElectionDone { generation, outcome } => {
                self.election_done(generation, outcome);
            }
            Command::MemberCheckDone { generation, outcome } => {
                self.member_check_done(generation, outcome);
            }
            Command::Shutdown => unreachable!("handled by the run loop"),
        }
        Ok(())
    }

    fn note_term_established(&mut self, history_id: HistoryId, term: Term) {
        if self.history_id.as_ref() != Some(&history_id) {
            debug!(term = %term, "Ignoring establishment notice for another history");
            return;
        }
        self.record_established(&history_id, &term);

        if let State::Leader(info) = &self.state {
            if info.status == LeaderStatus::Tentative && info.term == term {
                let mut established = info.clone();
                established.status = LeaderStatus::Established;
                info!(term = %term, "Leadership established");
                self.enter(State::Leader(established));
            }
        }
    }

    fn handle_heartbeat(&mut self, info: LeaderInfo) -> Result<(), String> {
        // A node never follows itself; its own leadership flows through
        // the election worker.
        if info.leader == self.config.peer_id {
            return Ok(());
        }
        if self.history_id.as_ref() != Some(&info.history_id) {
            debug!(from = %info.leader, "Dropping heartbeat from another history");
            return Ok(());
        }

        match evaluate_heartbeat(&self.known_leader(), &info) {
            HeartbeatDecision::Accept => {
                // Establishment learned over the wire counts: once this
                // node has seen term N established, no stale established
                // heartbeat below N may win it back, and its vote grants
                // are judged against that progress.
                if info.status == LeaderStatus::Established {
                    self.record_established(&info.history_id, &info.term);
                }
                self.enter(State::Follower(info));
                Ok(())
            }
            HeartbeatDecision::Reject(reason) => {
                debug!(from = %info.leader, reason, "Rejecting heartbeat");
                Ok(())
            }
            HeartbeatDecision::Fatal(reason) => Err(reason),
        }
    }

    /// Remember the highest established term seen in the current history,
    /// both in this task and in the agent's metadata.
    fn record_established(&mut self, history_id: &HistoryId, term: &Term) {
        let newer = self
            .established_term
            .as_ref()
            .map_or(true, |t| term.number > t.number);
        if newer {
            self.established_term = Some(term.clone());
        }
        if let Err(e) = self.agent.record_established_term(history_id, term) {
            debug!(term = %term, error = %e, "Agent did not record established term");
        }
    }

    fn known_leader(&self) -> KnownLeader {
        match &self.state {
            State::Leader(info) | State::Follower(info) => KnownLeader {
                term: info.term.clone(),
                status: match info.status {
                    LeaderStatus::Established => KnownStatus::Established,
                    LeaderStatus::Tentative => KnownStatus::Tentative,
                },
            },
            _ => KnownLeader {
                term: self.established_term.clone().unwrap_or_else(Term::initial),
                status: KnownStatus::Inactive,
            },
        }
    }

    fn handle_vote(&mut self, request: VoteRequest) -> VoteReply {
        match &self.state {
            State::Candidate => VoteReply::Refused(VoteRefusal::InElection),
            State::CheckMember => VoteReply::Refused(VoteRefusal::CheckMember),
            State::Leader(info) | State::Follower(info) => {
                VoteReply::Refused(VoteRefusal::HaveLeader(info.clone()))
            }
            State::Observer { .. } | State::VotedFor { .. } => {
                match self.agent.check_grant_vote(
                    &request.candidate,
                    &request.history_id,
                    &request.position,
                ) {
                    Ok(latest_term) => {
                        info!(candidate = %request.candidate, "Granting vote");
                        // A fresh vote entry, also when re-granting: the
                        // liveness timer starts over.
                        self.enter(State::VotedFor {
                            peer: request.candidate,
                        });
                        VoteReply::Granted { latest_term }
                    }
                    Err(e) => {
                        debug!(candidate = %request.candidate, reason = %e, "Withholding vote");
                        VoteReply::Refused(VoteRefusal::AgentRefused(e.to_string()))
                    }
                }
            }
        }
    }

    fn election_done(
        &mut self,
        generation: u64,
        outcome: Result<ElectionWin, ElectionError>,
    ) {
        if generation != self.worker_generation {
            debug!("Discarding result of a cancelled election");
            return;
        }
        self.worker = None;
        if !matches!(self.state, State::Candidate) {
            return;
        }

        match outcome {
            Ok(win) => {
                let me = &self.config.peer_id;
                let term = win.max_term.next(me);
                info!(term = %term, "Won election");
                self.enter(State::Leader(LeaderInfo {
                    leader: me.clone(),
                    history_id: win.history_id,
                    term,
                    status: LeaderStatus::Tentative,
                }));
            }
            Err(e) => {
                info!(error = %e, backoff = self.backoff.factor(), "Election failed");
                self.backoff.double();
                self.enter(self.observer());
            }
        }
    }

    fn member_check_done(&mut self, generation: u64, outcome: MemberCheckOutcome) {
        if generation != self.worker_generation {
            return;
        }
        self.worker = None;
        if !matches!(self.state, State::CheckMember) {
            return;
        }

        if let MemberCheckOutcome::Removed { confirmed_by } = &outcome {
            warn!(confirmed_by = %confirmed_by, "This node was removed from the cluster");
            match self.agent.get_metadata() {
                Ok(meta) => match self.agent.mark_removed(&meta.peer, meta.peer_incarnation) {
                    Ok(()) => {
                        // Flip the flags right away rather than waiting for
                        // the agent's removal event, so no election can
                        // start in between.
                        self.removed = true;
                        self.electable = false;
                    }
                    Err(e) => warn!(error = %e, "Failed to record removal"),
                },
                Err(e) => warn!(error = %e, "Failed to record removal"),
            }
        }
        // The probe always lands back in observer.
        self.enter(self.observer());
    }

    // ------------------------------------------------------------------
    // Metadata and peer events
    // ------------------------------------------------------------------

    fn handle_cluster_event(&mut self, event: ClusterEvent) {
        match event {
            ClusterEvent::SystemProvisioned(meta) => {
                self.apply_metadata(&meta);
                self.removed = false;
                info!(electable = self.electable, "System provisioned");
                self.enter(self.observer());
            }
            ClusterEvent::SystemRemoved(_meta) => {
                info!("System removed");
                self.removed = true;
                self.electable = false;
                // A leader keeps its state and terminates on its own
                // accord (the proposer winds the term down).
                if !matches!(self.state, State::Leader(_)) {
                    self.enter(State::Observer {
                        electable: false,
                        removed: true,
                    });
                }
            }
            ClusterEvent::NewHistory { history_id, metadata } => {
                info!(history = %history_id, "New history");
                self.apply_metadata(&metadata);
                self.enter(self.observer());
            }
            ClusterEvent::TermEstablished { term } => {
                let history_id = match &self.history_id {
                    Some(hid) => hid.clone(),
                    None => return,
                };
                self.note_term_established(history_id, term);
            }
            ClusterEvent::NewConfig { config: _, metadata } => {
                let was_electable = self.electable;
                self.apply_metadata(&metadata);
                for peer in &self.peers {
                    if !self.monitor.is_live(peer) {
                        self.transport.connect(peer);
                    }
                }
                if was_electable != self.electable {
                    info!(electable = self.electable, "Electability changed");
                    // A leader stays; its proposer steps it down if the new
                    // config demands it.
                    if !matches!(self.state, State::Leader(_)) {
                        self.enter(self.observer());
                    }
                }
            }
        }
    }

    fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Up(peer) => {
                debug!(peer = %peer, "Peer reachable");
            }
            PeerEvent::Down(peer) => {
                // Tear down the stale connection; the next contact redials.
                self.transport.disconnect(&peer);
                let lost_leader = matches!(&self.state, State::Follower(info) if info.leader == peer);
                let lost_vote =
                    matches!(&self.state, State::VotedFor { peer: voted } if *voted == peer);
                if lost_leader || lost_vote {
                    info!(peer = %peer, "Tracked peer went down");
                    self.enter(self.observer());
                }
            }
        }
    }
}

// ============================================================================
// Public handle and supervision
// ============================================================================

/// Handle to a node's leader subsystem.
///
/// Spawning starts the leader task (supervised: it is restarted from the
/// agent's system state if it hits a fatal condition), the inbound TCP
/// server, and the per-peer outbound connections.
pub struct LeaderHandle {
    commands: mpsc::Sender<Command>,
    watch: LeaderWatch,
    supervisor: JoinHandle<()>,
    server: JoinHandle<()>,
}

impl LeaderHandle {
    /// Start the leader subsystem for this node.
    pub fn spawn(
        config: Config,
        agent: Arc<dyn Agent>,
        monitor: PeerMonitor,
        bus: &EventBus,
    ) -> LeaderHandle {
        let transport = PeerTransport::new();
        let (publisher, watch) = leader_cell();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_DEPTH);

        let server = server::start(config.listen_addr.clone(), command_tx.clone());

        let supervisor = tokio::spawn(supervise(
            config,
            agent,
            transport,
            monitor,
            bus.clone(),
            publisher,
            command_tx.clone(),
            command_rx,
        ));

        LeaderHandle {
            commands: command_tx,
            watch,
            supervisor,
            server,
        }
    }

    /// The current leader, if one is established.
    pub fn get_leader(&self) -> Option<(PeerId, Incarnation)> {
        self.watch.get_leader()
    }

    /// Wait for an established leader with an incarnation different from
    /// `prev` (any leader when `prev` is `None`).
    pub async fn wait_for_leader(
        &self,
        prev: Option<&Incarnation>,
        timeout: Duration,
    ) -> Result<(PeerId, Incarnation), NoLeader> {
        self.watch.wait_for_leader(prev, timeout).await
    }

    /// A cloneable read handle on the leader publication.
    pub fn leader_watch(&self) -> LeaderWatch {
        self.watch.clone()
    }

    /// Force a republish of the current leader snapshot.
    pub async fn announce_leader_status(&self) {
        let _ = self.commands.send(Command::AnnounceLeaderStatus).await;
    }

    /// Called by the proposer once quorum commit in `term` is confirmed.
    pub async fn note_term_established(&self, history_id: HistoryId, term: Term) {
        let _ = self
            .commands
            .send(Command::NoteTermEstablished { history_id, term })
            .await;
    }

    /// Called by the proposer when it gives up on `term`.
    pub async fn note_term_finished(&self, history_id: HistoryId, term: Term) {
        let _ = self
            .commands
            .send(Command::NoteTermFinished { history_id, term })
            .await;
    }

    /// Flush queued work: returns once every message sent before this call
    /// has been handled.
    pub async fn sync(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Sync { reply: tx }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Stop the leader task and the inbound server.
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown).await;
        let _ = self.supervisor.await;
        self.server.abort();
    }
}

#[allow(clippy::too_many_arguments)]
async fn supervise(
    config: Config,
    agent: Arc<dyn Agent>,
    transport: Arc<PeerTransport>,
    monitor: PeerMonitor,
    bus: EventBus,
    publisher: LeaderPublisher,
    command_tx: mpsc::Sender<Command>,
    mut command_rx: mpsc::Receiver<Command>,
) {
    loop {
        let (timers, timer_rx) = TimerSet::new();
        let task = LeaderTask {
            config: config.clone(),
            agent: Arc::clone(&agent),
            transport: Arc::clone(&transport),
            monitor: monitor.clone(),
            publisher: publisher.clone(),
            command_tx: command_tx.clone(),
            state: State::Observer {
                electable: false,
                removed: false,
            },
            peers: Vec::new(),
            history_id: None,
            established_term: None,
            electable: false,
            removed: false,
            timers,
            backoff: Backoff::new(config.max_backoff),
            worker: None,
            worker_generation: 0,
        };

        let (exit, rx) = task
            .run(command_rx, timer_rx, bus.subscribe(), monitor.subscribe())
            .await;
        command_rx = rx;

        match exit {
            TaskExit::Shutdown => {
                publisher.publish(None);
                return;
            }
            TaskExit::Fatal(reason) => {
                error!(reason = %reason, "Leader task failed, restarting");
                publisher.publish(None);
                tokio::time::sleep(config.heartbeat_interval).await;
            }
        }
    }
}
