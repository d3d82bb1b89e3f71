//! The AppendEntries responder: consistency check, divergent-tail
//! rewrite, commit advancement and apply.

use crate::core::RaftCore;
use crate::error::RaftResult;
use crate::network::RaftNetwork;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::types::MessageSummary;
use crate::types::Role;

impl<N: RaftNetwork> RaftCore<N> {
    #[tracing::instrument(level = "trace", skip(self, req), fields(group = self.group_id, req = %req.summary()))]
    pub(super) async fn handle_append_entries_request(
        &mut self,
        req: AppendEntriesRequest,
    ) -> RaftResult<AppendEntriesResponse> {
        if req.term < self.current_term {
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                suggested_next_index: self.last_log_index + 1,
            });
        }

        // A valid append from the current term's leader: adopt it.
        self.update_current_term(req.term, None).await?;
        if self.role.is_leader() || self.role.is_candidate() {
            self.set_role(Role::Follower);
        }
        if self.current_leader != Some(req.leader_id) {
            self.current_leader = Some(req.leader_id);
            self.publish_status();
        }
        self.reset_election_deadline(true);

        // Consistency check on the entry preceding the batch.
        if req.prev_log_index > self.last_log_index {
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                suggested_next_index: self.last_log_index + 1,
            });
        }
        if req.prev_log_index >= self.log.first_index().saturating_sub(1) && req.prev_log_index > 0 {
            match self.log.term_of(req.prev_log_index).await? {
                Some(term) if term == req.prev_log_term => {}
                Some(_) | None => {
                    // Mismatch (or reclaimed prefix): have the leader
                    // rewind. Never below what is already committed.
                    let suggested = (self.commit_index + 1).max(self.log.first_index());
                    tracing::debug!(
                        group = self.group_id,
                        prev = req.prev_log_index,
                        suggested,
                        "append entries consistency check failed"
                    );
                    return Ok(AppendEntriesResponse {
                        term: self.current_term,
                        success: false,
                        suggested_next_index: suggested,
                    });
                }
            }
        }

        // Skip entries we already hold with matching terms; append from
        // the first divergence. Committed entries never diverge.
        let mut first_new = None;
        for entry in &req.entries {
            if entry.index <= self.commit_index {
                continue;
            }
            if entry.index <= self.last_log_index {
                if self.log.term_of(entry.index).await? == Some(entry.term) {
                    continue;
                }
            }
            first_new = Some(entry.index);
            break;
        }

        if let Some(from) = first_new {
            let batch: Vec<_> = req.entries.iter().filter(|e| e.index >= from).cloned().collect();
            if from <= self.last_log_index {
                // Rewriting a divergent tail aborts any of our own
                // in-flight proposals in that range.
                self.abort_tail_cache_from(from);
            }
            self.log.append(&batch).await?;
            let last = batch.last().expect("non-empty batch");
            self.last_log_index = last.index;
            self.last_log_term = last.term;
            self.last_persist_index = last.index;
            self.last_persist_term = last.term;
        }

        // Advance commit to what the leader says, bounded by what we
        // actually hold.
        let new_commit = req.leader_commit.min(self.last_log_index);
        if new_commit > self.commit_index {
            self.commit_index = new_commit;
            self.log.flush_index(new_commit).await?;
            self.drive_apply().await?;
        }
        self.publish_status();

        Ok(AppendEntriesResponse {
            term: self.current_term,
            success: true,
            suggested_next_index: self.last_log_index + 1,
        })
    }
}
