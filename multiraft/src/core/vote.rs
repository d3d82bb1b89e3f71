//! Elections: the vote/pre-vote responder, the follower's pre-vote round
//! and the candidate loop.

use tokio::time::sleep_until;
use tokio::time::Duration;
use tokio::time::Instant;

use crate::core::RaftCore;
use crate::error::RaftResult;
use crate::fiber::with_deadline;
use crate::fiber::FiberChannel;
use crate::network::RaftNetwork;
use crate::raft::GroupMsg;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::types::MessageSummary;
use crate::types::NodeId;
use crate::types::Role;

/// One vote RPC outcome, tagged with the election round it belongs to.
struct VoteReply {
    vote_id: u64,
    target: NodeId,
    sent_at: Instant,
    resp: anyhow::Result<VoteResponse>,
}

impl<N: RaftNetwork> RaftCore<N> {
    /// Answer RAFT_REQUEST_VOTE for both pre-votes and real votes.
    #[tracing::instrument(level = "debug", skip(self, req), fields(group = self.group_id, req = %req.summary()))]
    pub(super) async fn handle_vote_request(&mut self, req: VoteRequest) -> RaftResult<VoteResponse> {
        if !self.members.self_voting() {
            // Observers never vote.
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }
        if req.term < self.current_term {
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        let log_up_to_date = (req.last_log_term, req.last_log_index)
            >= (self.last_log_term, self.last_log_index);

        if req.pre_vote {
            // A pre-vote probes without touching term or votedFor. Grant
            // only if no current leader has been heard from within the
            // election window, so a partitioned node cannot disrupt a
            // stable group. A leader is its own leader contact.
            let quiet = if self.role.is_leader() {
                false
            } else {
                match self.last_leader_contact {
                    Some(at) => at.elapsed() >= self.config.elect_timeout,
                    None => true,
                }
            };
            let granted = quiet && log_up_to_date && req.term > self.current_term;
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: granted,
            });
        }

        if req.term > self.current_term {
            self.update_current_term(req.term, None).await?;
            if self.role.is_leader() || self.role.is_candidate() {
                self.set_role(Role::Follower);
            }
        }

        let can_vote = match self.voted_for {
            None => true,
            Some(v) => v == req.candidate_id,
        };
        let granted = can_vote && log_up_to_date;
        if granted {
            self.voted_for = Some(req.candidate_id);
            self.save_status().await?;
            self.reset_election_deadline(false);
        }
        tracing::info!(
            group = self.group_id,
            candidate = req.candidate_id,
            term = req.term,
            granted,
            "vote decided"
        );
        Ok(VoteResponse {
            term: self.current_term,
            vote_granted: granted,
        })
    }

    /// Fan one vote round out to the voting peers. Replies land in the
    /// returned channel tagged with `vote_id`.
    fn spawn_vote_round(&mut self, pre_vote: bool) -> FiberChannel<VoteReply> {
        self.vote_id += 1;
        let vote_id = self.vote_id;
        let replies: FiberChannel<VoteReply> = FiberChannel::new();
        let term = if pre_vote {
            self.current_term + 1
        } else {
            self.current_term
        };
        for target in self.members.voting_peers() {
            if !self.members.is_ready(target) {
                // Skipped by fan-out, still counted in the quorum size.
                tracing::debug!(group = self.group_id, target, "skipping non-ready peer in vote round");
                continue;
            }
            let req = VoteRequest {
                group_id: self.group_id,
                term,
                candidate_id: self.node_id,
                last_log_index: self.last_log_index,
                last_log_term: self.last_log_term,
                pre_vote,
            };
            let network = self.network.clone();
            let rpc_timeout = self.config.rpc_timeout;
            let replies = replies.clone();
            self.group.spawn_daemon(format!("vote-{}", target), async move {
                let sent_at = Instant::now();
                let resp = match tokio::time::timeout(rpc_timeout, network.vote(target, req)).await {
                    Ok(res) => res,
                    Err(_) => Err(anyhow::anyhow!("vote rpc to {} timed out", target)),
                };
                replies.send(VoteReply {
                    vote_id,
                    target,
                    sent_at,
                    resp,
                });
            });
        }
        replies
    }

    /// The pre-vote round run off the follower's election timeout.
    /// Returns true when an elect quorum (self included) granted and the
    /// real election may start. Never mutates persistent state.
    pub(super) async fn run_pre_vote(&mut self) -> RaftResult<bool> {
        if !self.members.self_voting() {
            return Ok(false);
        }
        // Push the next election attempt out a second so a slow pre-vote
        // round cannot stack elections.
        self.election_deadline = Instant::now() + Duration::from_secs(1);

        let quorum = self.members.elect_quorum();
        let mut granted = 1usize; // self
        if granted >= quorum {
            return Ok(true);
        }

        tracing::info!(group = self.group_id, term = self.current_term, "starting pre-vote");
        let replies = self.spawn_vote_round(true);
        let deadline = Instant::now() + self.config.rpc_timeout;
        let mut answered = 0usize;
        let peers = self.members.voting_peers().len();
        while answered < peers {
            let reply = match with_deadline(deadline, replies.recv()).await {
                Ok(Ok(reply)) => reply,
                _ => break,
            };
            answered += 1;
            if reply.vote_id != self.vote_id {
                continue;
            }
            match reply.resp {
                Ok(resp) if resp.vote_granted => {
                    granted += 1;
                    if granted >= quorum {
                        tracing::info!(group = self.group_id, granted, "pre-vote succeeded");
                        return Ok(true);
                    }
                }
                Ok(resp) => {
                    if resp.term > self.current_term {
                        self.update_current_term(resp.term, None).await?;
                        return Ok(false);
                    }
                }
                Err(err) => {
                    tracing::debug!(group = self.group_id, target = reply.target, error = %err, "pre-vote rpc failed");
                }
            }
        }
        tracing::debug!(group = self.group_id, granted, quorum, "pre-vote fell short");
        Ok(false)
    }

    /// The candidate loop. Each outer iteration is a new term.
    #[tracing::instrument(level = "trace", skip(self), fields(group = self.group_id, raft_state = "candidate"))]
    pub(super) async fn candidate_loop(&mut self) -> RaftResult<()> {
        loop {
            if !self.role.is_candidate() {
                return Ok(());
            }

            // New term: vote for self and persist before soliciting.
            self.current_term += 1;
            self.voted_for = Some(self.node_id);
            self.current_leader = None;
            self.save_status().await?;
            self.reset_election_deadline(false);
            self.publish_status();

            let quorum = self.members.elect_quorum();
            let mut granted = 1usize;
            tracing::info!(group = self.group_id, term = self.current_term, quorum, "election started");
            if granted >= quorum {
                self.set_role(Role::Leader);
                return Ok(());
            }
            let replies = self.spawn_vote_round(false);

            loop {
                if !self.role.is_candidate() {
                    return Ok(());
                }
                let deadline = self.election_deadline;
                tokio::select! {
                    _ = sleep_until(deadline) => break, // Round timed out; next term.
                    reply = replies.recv() => {
                        let reply = match reply {
                            Ok(r) => r,
                            Err(_) => break,
                        };
                        if reply.vote_id != self.vote_id {
                            continue;
                        }
                        match reply.resp {
                            Ok(resp) if resp.vote_granted => {
                                // The grant's send time seeds the leader
                                // lease.
                                self.members.record_confirm(reply.target, reply.sent_at);
                                granted += 1;
                                if granted >= quorum {
                                    tracing::info!(group = self.group_id, term = self.current_term, "won election");
                                    self.set_role(Role::Leader);
                                    return Ok(());
                                }
                            }
                            Ok(resp) => {
                                if resp.term > self.current_term {
                                    self.update_current_term(resp.term, None).await?;
                                    self.set_role(Role::Follower);
                                    return Ok(());
                                }
                            }
                            Err(err) => {
                                tracing::debug!(group = self.group_id, target = reply.target, error = %err, "vote rpc failed");
                            }
                        }
                    }
                    msg = self.rx_api.recv() => match msg {
                        Some(GroupMsg::AppendEntries { rpc, tx }) => {
                            // A valid AppendEntries from a current-term
                            // leader converts us; handled inside.
                            let res = self.handle_append_entries_request(rpc).await;
                            self.forward_fatal(&res)?;
                            let _ = tx.send(res);
                        }
                        Some(msg) => self.handle_msg_default(msg).await?,
                        None => self.set_role(Role::Shutdown),
                    },
                    _ = self.group.stopped() => self.set_role(Role::Shutdown),
                }
            }
        }
    }
}
