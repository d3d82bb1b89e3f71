//! Peer bookkeeping: liveness, readiness, replication progress and the
//! quorum arithmetic derived from them.

use std::rc::Rc;
use std::sync::Arc;
use std::{cell::RefCell, time::Duration};

use tokio::time::Instant;

use crate::config::RaftConfig;
use crate::fiber::Completer;
use crate::fiber::FiberFuture;
use crate::fiber::FiberGroup;
use crate::network::RaftNetwork;
use crate::quorum;
use crate::raft::PingRequest;
use crate::types::GroupId;
use crate::types::NodeId;

/// Per-peer replication and liveness state.
#[derive(Debug, Clone)]
pub struct RaftMember {
    pub node: NodeId,
    /// Highest index known replicated on the peer. Monotonic within a
    /// term.
    pub match_index: u64,
    /// Next index to send to the peer.
    pub next_index: u64,
    /// Send time of the last successful vote or append to this peer;
    /// feeds the leader lease.
    pub last_confirm: Option<Instant>,
    /// Last RAFT_PING round-trip succeeded and the peer had the group.
    pub ready: bool,
    /// The peer is receiving a snapshot instead of log entries.
    pub installing_snapshot: bool,
    /// Observers replicate but never vote and are not counted in quorums.
    pub observer: bool,
}

impl RaftMember {
    fn new(node: NodeId, observer: bool) -> Self {
        Self {
            node,
            match_index: 0,
            next_index: 1,
            last_confirm: None,
            ready: false,
            installing_snapshot: false,
            observer,
        }
    }
}

struct MemberState {
    members: Vec<RaftMember>,
    ready_waiters: Vec<(usize, Completer<()>)>,
}

/// Tracks every other node of the group. Cheap to clone, group-local.
#[derive(Clone)]
pub(crate) struct MemberManager {
    node_id: NodeId,
    voting_total: usize,
    self_voting: bool,
    state: Rc<RefCell<MemberState>>,
}

impl MemberManager {
    pub fn new(node_id: NodeId, node_ids: &[NodeId], observer_ids: &[NodeId]) -> Self {
        let mut members = Vec::new();
        for &id in node_ids {
            if id != node_id {
                members.push(RaftMember::new(id, false));
            }
        }
        for &id in observer_ids {
            if id != node_id {
                members.push(RaftMember::new(id, true));
            }
        }
        Self {
            node_id,
            voting_total: node_ids.len(),
            self_voting: node_ids.contains(&node_id),
            state: Rc::new(RefCell::new(MemberState {
                members,
                ready_waiters: Vec::new(),
            })),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Number of voting members, including self if voting.
    pub fn voting_total(&self) -> usize {
        self.voting_total
    }

    pub fn self_voting(&self) -> bool {
        self.self_voting
    }

    pub fn elect_quorum(&self) -> usize {
        quorum::elect_quorum(self.voting_total)
    }

    pub fn rw_quorum(&self) -> usize {
        quorum::rw_quorum(self.voting_total)
    }

    /// Voting peers (excluding self). Non-ready peers are included: they
    /// count towards quorum sizes even while fan-out skips them.
    pub fn voting_peers(&self) -> Vec<NodeId> {
        self.state
            .borrow()
            .members
            .iter()
            .filter(|m| !m.observer)
            .map(|m| m.node)
            .collect()
    }

    /// Everyone the leader replicates to: voting peers plus observers.
    pub fn replicate_targets(&self) -> Vec<NodeId> {
        self.state.borrow().members.iter().map(|m| m.node).collect()
    }

    pub fn is_ready(&self, node: NodeId) -> bool {
        self.state
            .borrow()
            .members
            .iter()
            .find(|m| m.node == node)
            .map(|m| m.ready)
            .unwrap_or(false)
    }

    pub fn member(&self, node: NodeId) -> Option<RaftMember> {
        self.state.borrow().members.iter().find(|m| m.node == node).cloned()
    }

    fn with_member<R>(&self, node: NodeId, f: impl FnOnce(&mut RaftMember) -> R) -> Option<R> {
        let mut state = self.state.borrow_mut();
        state.members.iter_mut().find(|m| m.node == node).map(f)
    }

    /// Record a liveness transition. Idempotent; completes ready futures
    /// once enough members are up.
    pub fn set_ready(&self, node: NodeId, ready: bool) {
        let changed = self
            .with_member(node, |m| {
                let changed = m.ready != ready;
                m.ready = ready;
                changed
            })
            .unwrap_or(false);
        if changed {
            tracing::debug!(node, ready, "member readiness changed");
        }
        let count = self.ready_count();
        let fired: Vec<Completer<()>> = {
            let mut state = self.state.borrow_mut();
            let mut fired = Vec::new();
            let mut i = 0;
            while i < state.ready_waiters.len() {
                if state.ready_waiters[i].0 <= count {
                    fired.push(state.ready_waiters.swap_remove(i).1);
                } else {
                    i += 1;
                }
            }
            fired
        };
        for completer in fired {
            completer.complete(());
        }
    }

    /// Ready members including self.
    pub fn ready_count(&self) -> usize {
        1 + self
            .state
            .borrow()
            .members
            .iter()
            .filter(|m| m.ready)
            .count()
    }

    /// Completes once at least `n` members (counting self) are ready.
    /// Gates `submit` at startup.
    pub fn ready_future(&self, n: usize) -> FiberFuture<()> {
        let (fut, completer) = FiberFuture::new();
        if self.ready_count() >= n {
            completer.complete(());
        } else {
            self.state.borrow_mut().ready_waiters.push((n, completer));
        }
        fut
    }

    /// Note a confirmed round-trip that was *sent* at `sent_at`.
    pub fn record_confirm(&self, node: NodeId, sent_at: Instant) {
        self.with_member(node, |m| {
            m.last_confirm = Some(match m.last_confirm {
                Some(prev) => prev.max(sent_at),
                None => sent_at,
            });
        });
    }

    pub fn update_match(&self, node: NodeId, match_index: u64) {
        self.with_member(node, |m| {
            m.match_index = m.match_index.max(match_index);
            m.next_index = m.match_index + 1;
        });
    }

    pub fn set_installing_snapshot(&self, node: NodeId, installing: bool) {
        self.with_member(node, |m| m.installing_snapshot = installing);
    }

    /// Reset replication progress when this node becomes leader. Confirm
    /// times survive: the vote grants that elected us already seed the
    /// lease.
    pub fn reset_for_leader(&self, last_log_index: u64) {
        let mut state = self.state.borrow_mut();
        for m in state.members.iter_mut() {
            m.match_index = 0;
            m.next_index = last_log_index + 1;
            m.installing_snapshot = false;
        }
    }

    /// The lease horizon: the rw-quorum-th smallest confirm time plus the
    /// election timeout. Self counts as confirmed now. `None` while a
    /// quorum has never confirmed.
    pub fn lease_end(&self, elect_timeout: Duration) -> Option<Instant> {
        if !self.self_voting {
            return None;
        }
        let mut confirms: Vec<Option<Instant>> = vec![Some(Instant::now())];
        {
            let state = self.state.borrow();
            for m in state.members.iter().filter(|m| !m.observer) {
                confirms.push(m.last_confirm);
            }
        }
        // None (never confirmed) sorts oldest.
        confirms.sort();
        let pick = confirms.len() - self.rw_quorum();
        confirms[pick].map(|at| at + elect_timeout)
    }

    /// The largest index replicated on an rw-quorum of voting members,
    /// with the leader's own log standing in for self.
    pub fn quorum_match_index(&self, leader_last_index: u64) -> u64 {
        let mut matches: Vec<u64> = Vec::with_capacity(self.voting_total);
        if self.self_voting {
            matches.push(leader_last_index);
        }
        {
            let state = self.state.borrow();
            for m in state.members.iter().filter(|m| !m.observer) {
                matches.push(m.match_index);
            }
        }
        matches.sort_unstable_by(|a, b| b.cmp(a));
        let quorum = self.rw_quorum();
        if matches.len() < quorum {
            return 0;
        }
        matches[quorum - 1]
    }

    /// Spawn the per-peer liveness loop: a RAFT_PING every heartbeat
    /// interval, flipping `ready` on the outcome.
    pub fn spawn_ping_fibers<N: RaftNetwork>(
        &self,
        group: &FiberGroup,
        network: Arc<N>,
        config: Arc<RaftConfig>,
        group_id: GroupId,
    ) {
        for target in self.replicate_targets() {
            let manager = self.clone();
            let network = network.clone();
            let config = config.clone();
            let fiber_group = group.clone();
            group.spawn_daemon(format!("ping-{}", target), async move {
                loop {
                    let req = PingRequest {
                        group_id,
                        node_id: manager.node_id,
                    };
                    let outcome = tokio::time::timeout(config.rpc_timeout, network.ping(target, req)).await;
                    let ready = matches!(&outcome, Ok(Ok(resp)) if resp.group_ready && resp.node_id == target);
                    manager.set_ready(target, ready);
                    tokio::select! {
                        _ = tokio::time::sleep(config.heartbeat_interval) => {}
                        _ = fiber_group.stopped() => return,
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn quorum_sizes_follow_membership() {
        let m = MemberManager::new(1, &[1, 2, 3], &[]);
        assert_eq!(m.elect_quorum(), 2);
        assert_eq!(m.rw_quorum(), 2);
        let m4 = MemberManager::new(1, &[1, 2, 3, 4], &[]);
        assert_eq!(m4.elect_quorum(), 3);
        assert_eq!(m4.rw_quorum(), 2);
    }

    #[test]
    fn observers_replicate_but_do_not_vote() {
        let m = MemberManager::new(1, &[1, 2, 3], &[9]);
        assert_eq!(m.voting_peers(), vec![2, 3]);
        assert_eq!(m.replicate_targets(), vec![2, 3, 9]);
        assert_eq!(m.voting_total(), 3);
    }

    #[test]
    fn quorum_match_index_takes_the_quorum_th_largest() {
        let m = MemberManager::new(1, &[1, 2, 3], &[]);
        m.update_match(2, 5);
        m.update_match(3, 3);
        // Matches: self=10, 5, 3; rw quorum 2 -> 5.
        assert_eq!(m.quorum_match_index(10), 5);
        m.update_match(3, 9);
        assert_eq!(m.quorum_match_index(10), 9);
    }

    #[test]
    fn match_index_is_monotonic() {
        let m = MemberManager::new(1, &[1, 2], &[]);
        m.update_match(2, 9);
        m.update_match(2, 4);
        assert_eq!(m.member(2).unwrap().match_index, 9);
    }

    #[test]
    fn lease_requires_a_quorum_of_confirms() {
        let m = MemberManager::new(1, &[1, 2, 3], &[]);
        let timeout = Duration::from_millis(100);
        // Only self confirmed: no lease for a 3-node group.
        assert!(m.lease_end(timeout).is_none());
        let sent = Instant::now();
        m.record_confirm(2, sent);
        let lease = m.lease_end(timeout).expect("quorum confirmed");
        assert_eq!(lease, sent + timeout);
    }

    #[test]
    fn single_node_group_always_holds_its_lease() {
        let m = MemberManager::new(1, &[1], &[]);
        assert!(m.lease_end(Duration::from_millis(50)).is_some());
    }

    #[tokio::test]
    async fn ready_future_completes_at_threshold() {
        let m = MemberManager::new(1, &[1, 2, 3], &[]);
        let fut = m.ready_future(2);
        m.set_ready(2, true);
        fut.await.unwrap();
        assert_eq!(m.ready_count(), 2);
        // Idempotent transitions do not double-count.
        m.set_ready(2, true);
        assert_eq!(m.ready_count(), 2);
    }
}
