//! Single-term Raft-style coordinator: elects a leader among the modules
//! currently reachable on the control-plane multicast group, and has the
//! leader aggregate every module's [`LocalState`] into one
//! [`GlobalPatchState`] classification, broadcast as `GlobalStateUpdate`.
//!
//! This is deliberately not full Raft log replication — there is no log,
//! no commit index, just a rotating term/leader used to pick exactly one
//! aggregator at a time.

use crate::directive::{
    Directive, DirectiveGlobalStateUpdate, DirectiveHeartbeat, DirectiveHeartbeatResponse,
    DirectiveRequestVote, DirectiveRequestVoteResponse, GlobalPatchState, HeldInputJack,
    HeldOutputJack, LocalState,
};
use crate::{ModuleId, MAX_HOSTS};
use heapless::{Deque, FnvIndexMap, FnvIndexSet};
use rand_core::RngCore;

const ELECTION_TIMEOUT_MIN: i64 = 150;
const ELECTION_TIMEOUT_MAX: i64 = 300;
const HEARTBEAT_INTERVAL: i64 = 50;
/// How long a peer's last-reported state is still trusted once it stops
/// responding, before the aggregator drops it from consideration.
const PEER_TIMEOUT: i64 = 5 * HEARTBEAT_INTERVAL;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Roles {
    Follower,
    Candidate,
    Leader,
}

struct PeerRecord {
    state: LocalState,
    last_seen: i64,
}

pub(crate) struct PatchCoordinator<R: RngCore> {
    id: ModuleId,
    rand_source: R,
    role: Roles,
    term: u64,
    voted_for: Option<ModuleId>,
    votes_got: usize,
    known_hosts: FnvIndexSet<ModuleId, MAX_HOSTS>,
    next_election_deadline: i64,
    next_heartbeat_deadline: i64,
    iteration: u32,
    local_state: LocalState,
    peer_states: FnvIndexMap<ModuleId, PeerRecord, MAX_HOSTS>,
    last_global_state: Option<(GlobalPatchState, Option<HeldInputJack>, Option<HeldOutputJack>)>,
    pending: Deque<Directive, 4>,
}

impl<R: RngCore> PatchCoordinator<R> {
    pub(crate) fn new(id: ModuleId, time: i64, mut rand_source: R) -> Self {
        let deadline = time + election_timeout(&mut rand_source);
        PatchCoordinator {
            id,
            rand_source,
            role: Roles::Follower,
            term: 0,
            voted_for: None,
            votes_got: 0,
            known_hosts: FnvIndexSet::new(),
            next_election_deadline: deadline,
            next_heartbeat_deadline: i64::MAX,
            iteration: 0,
            local_state: LocalState::default(),
            peer_states: FnvIndexMap::new(),
            last_global_state: None,
            pending: Deque::new(),
        }
    }

    pub(crate) fn update_local_state(&mut self, state: LocalState) {
        self.local_state = state;
    }

    pub(crate) fn is_leader(&self) -> bool {
        self.role == Roles::Leader
    }

    /// Process an incoming directive (when `incoming` is `Some`) or check
    /// timers (when `None`); returns at most one directive to emit, with
    /// any further backlog drained on subsequent calls.
    pub(crate) fn poll(&mut self, incoming: Option<Directive>, time: i64) -> Option<Directive> {
        if incoming.is_none() {
            if let Some(queued) = self.pending.pop_front() {
                return Some(queued);
            }
            return self.handle_timers(time);
        }
        self.handle_message(incoming.unwrap(), time)
    }

    fn handle_message(&mut self, directive: Directive, time: i64) -> Option<Directive> {
        match directive {
            Directive::Heartbeat(h) => {
                if h.term > self.term {
                    self.become_follower(h.term);
                }
                if h.term < self.term {
                    return Some(Directive::HeartbeatResponse(DirectiveHeartbeatResponse {
                        uuid: self.id.clone(),
                        term: self.term,
                        success: false,
                        iteration: None,
                        state: None,
                    }));
                }
                self.role = Roles::Follower;
                self.reset_election_timer(time);
                Some(Directive::HeartbeatResponse(DirectiveHeartbeatResponse {
                    uuid: self.id.clone(),
                    term: self.term,
                    success: true,
                    iteration: Some(h.iteration),
                    state: Some(self.local_state.clone()),
                }))
            }
            Directive::HeartbeatResponse(r) => {
                if r.term > self.term {
                    self.become_follower(r.term);
                }
                if let Some(state) = r.state {
                    self.record_peer(r.uuid, state, time);
                }
                None
            }
            Directive::RequestVote(rv) => {
                if rv.term > self.term {
                    self.become_follower(rv.term);
                }
                let grant = rv.term >= self.term
                    && (self.voted_for.is_none() || self.voted_for.as_ref() == Some(&rv.uuid));
                if grant {
                    self.voted_for = Some(rv.uuid.clone());
                    self.reset_election_timer(time);
                }
                Some(Directive::RequestVoteResponse(DirectiveRequestVoteResponse {
                    uuid: self.id.clone(),
                    term: self.term,
                    voted_for: self.voted_for.clone(),
                    vote_granted: grant,
                }))
            }
            Directive::RequestVoteResponse(rv) => {
                if rv.term > self.term {
                    self.become_follower(rv.term);
                    return None;
                }
                if self.role == Roles::Candidate && rv.term == self.term {
                    let _ = self.known_hosts.insert(rv.uuid);
                    if rv.vote_granted {
                        self.votes_got += 1;
                    }
                    if self.votes_got * 2 >= self.known_hosts.len() {
                        self.become_leader(time);
                    }
                }
                None
            }
            Directive::Update(u) => {
                self.record_peer(u.uuid, u.local_state, time);
                None
            }
            _ => None,
        }
    }

    fn handle_timers(&mut self, time: i64) -> Option<Directive> {
        match self.role {
            Roles::Follower | Roles::Candidate => {
                if time >= self.next_election_deadline {
                    self.become_candidate(time);
                    return Some(Directive::RequestVote(DirectiveRequestVote {
                        uuid: self.id.clone(),
                        term: self.term,
                    }));
                }
                None
            }
            Roles::Leader => {
                if time >= self.next_heartbeat_deadline {
                    self.next_heartbeat_deadline = time + HEARTBEAT_INTERVAL;
                    if let Some(gsu) = self.age_and_aggregate(time) {
                        let _ = self.pending.push_back(Directive::GlobalStateUpdate(gsu));
                    }
                    self.iteration += 1;
                    let local = self.local_state.clone();
                    self.record_peer(self.id.clone(), local, time);
                    let _ = self.pending.push_back(Directive::Heartbeat(DirectiveHeartbeat {
                        uuid: self.id.clone(),
                        term: self.term,
                        iteration: self.iteration,
                    }));
                    return self.pending.pop_front();
                }
                None
            }
        }
    }

    fn age_and_aggregate(&mut self, time: i64) -> Option<DirectiveGlobalStateUpdate> {
        let mut stale: heapless::Vec<ModuleId, MAX_HOSTS> = heapless::Vec::new();
        let mut total_inputs = 0usize;
        let mut total_outputs = 0usize;
        let mut first_input: Option<HeldInputJack> = None;
        let mut first_output: Option<HeldOutputJack> = None;

        for (id, record) in self.peer_states.iter() {
            if time - record.last_seen > PEER_TIMEOUT {
                let _ = stale.push(id.clone());
                continue;
            }
            total_inputs += record.state.held_inputs.len();
            total_outputs += record.state.held_outputs.len();
            if first_input.is_none() {
                first_input = record.state.first_held_input().cloned();
            }
            if first_output.is_none() {
                first_output = record.state.first_held_output().cloned();
            }
        }
        for id in stale.iter() {
            self.peer_states.remove(id);
        }

        let new_state = if total_inputs == 0 && total_outputs == 0 {
            GlobalPatchState::Idle
        } else if total_inputs > 1 || total_outputs > 1 {
            GlobalPatchState::Blocked
        } else if total_inputs == 1 && total_outputs == 1 {
            GlobalPatchState::PatchToggled
        } else {
            GlobalPatchState::PatchEnabled
        };

        let snapshot = (new_state, first_input.clone(), first_output.clone());
        if self.last_global_state.as_ref() == Some(&snapshot) {
            return None;
        }
        self.last_global_state = Some(snapshot);

        Some(DirectiveGlobalStateUpdate {
            uuid: self.id.clone(),
            patch_state: new_state,
            input: first_input,
            output: first_output,
        })
    }

    fn record_peer(&mut self, id: ModuleId, state: LocalState, time: i64) {
        if let Some(record) = self.peer_states.get_mut(&id) {
            record.state = state;
            record.last_seen = time;
            return;
        }
        if self.peer_states.len() >= MAX_HOSTS {
            if let Some(victim) = self
                .peer_states
                .iter()
                .min_by_key(|(_, r)| r.last_seen)
                .map(|(k, _)| k.clone())
            {
                self.peer_states.remove(&victim);
            }
        }
        let _ = self.peer_states.insert(id, PeerRecord { state, last_seen: time });
    }

    fn become_follower(&mut self, term: u64) {
        self.role = Roles::Follower;
        self.term = term;
        self.voted_for = None;
    }

    fn become_candidate(&mut self, time: i64) {
        self.role = Roles::Candidate;
        self.term += 1;
        self.voted_for = Some(self.id.clone());
        self.votes_got = 1;
        self.known_hosts.clear();
        let _ = self.known_hosts.insert(self.id.clone());
        self.reset_election_timer(time);
    }

    fn become_leader(&mut self, time: i64) {
        info!("{} elected leader for term {}", self.id, self.term);
        self.role = Roles::Leader;
        self.iteration = 0;
        self.next_heartbeat_deadline = time;
        let local = self.local_state.clone();
        self.record_peer(self.id.clone(), local, time);
    }

    fn reset_election_timer(&mut self, time: i64) {
        self.next_election_deadline = time + election_timeout(&mut self.rand_source);
    }
}

fn election_timeout<R: RngCore>(rand_source: &mut R) -> i64 {
    let span = (ELECTION_TIMEOUT_MAX - ELECTION_TIMEOUT_MIN) as u32;
    ELECTION_TIMEOUT_MIN + (rand_source.next_u32() % span) as i64
}
