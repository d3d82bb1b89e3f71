//! The client-facing paths of the core: proposal intake, the linearizable
//! read barrier, and the apply pipeline feeding the state machine.

use std::sync::Arc;

use bytes::Bytes;
use tokio::time::Instant;

use crate::core::RaftCore;
use crate::core::RaftTask;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::fiber::with_deadline;
use crate::fiber::Completer;
use crate::network::RaftNetwork;
use crate::raft::PendingGuard;
use crate::raft::SubmitRequest;
use crate::raft::SubmitResponse;
use crate::types::ItemType;
use crate::types::LogItem;

impl<N: RaftNetwork> RaftCore<N> {
    /// Build and persist the next log entry from a proposal. Leader only.
    pub(super) async fn append_submit(
        &mut self,
        req: SubmitRequest,
        completer: Completer<SubmitResponse>,
        guard: PendingGuard,
    ) -> RaftResult<Option<Arc<LogItem>>> {
        if self.error {
            completer.fail(RaftError::GroupError);
            drop(guard);
            return Ok(None);
        }
        let index = self.last_log_index + 1;
        let item = Arc::new(LogItem {
            index,
            term: self.current_term,
            prev_log_term: self.last_log_term,
            timestamp: self.now_millis(),
            item_type: ItemType::Normal,
            biz_type: req.biz_type,
            header: req.header,
            body: req.body,
        });

        self.log.append(std::slice::from_ref(&*item)).await?;
        self.last_log_index = index;
        self.last_log_term = item.term;
        self.last_persist_index = index;
        self.last_persist_term = item.term;
        self.tail_cache
            .insert(index, RaftTask::new(item.clone(), completer, guard));
        Ok(Some(item))
    }

    /// Append the empty entry a new leader commits to anchor its term.
    pub(super) async fn append_term_start(&mut self) -> RaftResult<Arc<LogItem>> {
        let index = self.last_log_index + 1;
        let item = Arc::new(LogItem::term_start(
            index,
            self.current_term,
            self.last_log_term,
            self.now_millis(),
        ));
        self.log.append(std::slice::from_ref(&*item)).await?;
        self.last_log_index = index;
        self.last_log_term = item.term;
        self.last_persist_index = index;
        self.last_persist_term = item.term;
        self.first_commit_of_term = Some(index);
        tracing::debug!(group = self.group_id, index, term = self.current_term, "term-start entry appended");
        Ok(item)
    }

    /// The linearizable read barrier.
    ///
    /// Confirms leadership and lease, then waits until the first commit
    /// of this term has been applied so the new leader's state machine is
    /// provably current, and answers with the applied index.
    pub(super) fn handle_read_index(
        &mut self,
        deadline: Instant,
        tx: tokio::sync::oneshot::Sender<RaftResult<u64>>,
    ) {
        if self.error {
            let _ = tx.send(Err(RaftError::GroupError));
            return;
        }
        if !self.role.is_leader() {
            let _ = tx.send(Err(RaftError::NotLeader {
                leader: self.current_leader,
            }));
            return;
        }
        let lease_ok = self.lease_end.map(|end| Instant::now() < end).unwrap_or(false);
        if !lease_ok {
            let _ = tx.send(Err(RaftError::NotLeader {
                leader: Some(self.node_id),
            }));
            return;
        }
        let Some(first_commit) = self.first_commit_of_term else {
            let _ = tx.send(Err(RaftError::NotLeader {
                leader: Some(self.node_id),
            }));
            return;
        };

        // Wait off the published status so the core loop keeps running.
        let mut rx = self.status_tx.subscribe();
        let term = self.current_term;
        self.group.spawn_daemon("read-index", async move {
            let res = with_deadline(deadline, async {
                loop {
                    let ready = {
                        let status = rx.borrow();
                        if status.error || !status.role.is_leader() || status.current_term != term {
                            break Err(RaftError::NotLeader {
                                leader: status.current_leader,
                            });
                        }
                        status.last_applied >= first_commit
                    };
                    if ready {
                        let status = rx.borrow().clone();
                        if !status.lease_valid() {
                            break Err(RaftError::NotLeader {
                                leader: status.current_leader,
                            });
                        }
                        break Ok(status.last_applied);
                    }
                    if rx.changed().await.is_err() {
                        break Err(RaftError::Stopped);
                    }
                }
            })
            .await;
            let res = match res {
                Ok(inner) => inner,
                Err(err) => Err(err),
            };
            let _ = tx.send(res);
        });
    }

    /// Apply committed entries in strict index order, completing any
    /// parked proposals with the state machine's outputs.
    pub(super) async fn drive_apply(&mut self) -> RaftResult<()> {
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let (item, task) = match self.tail_cache.remove(&index) {
                Some(task) => (task.item.clone(), Some(task)),
                None => {
                    let mut read = self.log.read(index, 1, u64::MAX).await?;
                    match read.pop() {
                        Some(item) => (Arc::new(item), None),
                        None => {
                            return Err(RaftError::LogGap {
                                first: index,
                                next: self.log.next_index(),
                            })
                        }
                    }
                }
            };

            let output = match item.item_type {
                ItemType::TermStart => Bytes::new(),
                ItemType::Normal => match self.sm.exec(index, item.term, &item).await {
                    Ok(output) => output,
                    Err(err) => {
                        tracing::error!(group = self.group_id, index, error = %err, "state machine failed");
                        if let Some(task) = task {
                            task.completer.fail(RaftError::StateMachine(anyhow::anyhow!("{}", err)));
                        }
                        return Err(RaftError::StateMachine(err));
                    }
                },
            };

            self.last_applied = index;
            if let Some(task) = task {
                task.completer.complete(SubmitResponse { index, output });
            }
        }
        self.publish_status();
        Ok(())
    }
}
