//! The atomically published group status and helpers for observing it.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::RaftError;
use crate::error::RaftResult;
use crate::types::GroupId;
use crate::types::NodeId;
use crate::types::Role;
use crate::types::Term;

/// A frozen snapshot of a group's externally visible state.
///
/// The core fiber publishes a fresh value whenever role, leader, lease or
/// applied index change; readers on any thread observe a coherent record
/// without taking locks.
#[derive(Clone, Debug)]
pub struct ShareStatus {
    pub group_id: GroupId,
    pub node_id: NodeId,
    pub role: Role,
    pub current_term: Term,
    pub current_leader: Option<NodeId>,
    pub last_log_index: u64,
    pub commit_index: u64,
    pub last_applied: u64,
    /// End of the leader lease; linearizable reads require `now` before
    /// it.
    pub lease_end: Option<Instant>,
    /// Index of the first entry this leader committed in its term; the
    /// read path waits for it to be applied.
    pub first_commit_of_term: Option<u64>,
    /// The group hit a fatal error and rejects reads and writes.
    pub error: bool,
}

impl ShareStatus {
    pub fn new_initial(group_id: GroupId, node_id: NodeId) -> Self {
        Self {
            group_id,
            node_id,
            role: Role::Follower,
            current_term: 0,
            current_leader: None,
            last_log_index: 0,
            commit_index: 0,
            last_applied: 0,
            lease_end: None,
            first_commit_of_term: None,
            error: false,
        }
    }

    /// Whether this node may serve a linearizable read right now.
    pub fn lease_valid(&self) -> bool {
        self.role.is_leader() && self.lease_end.map(|end| Instant::now() < end).unwrap_or(false)
    }
}

/// Waits for the published status to satisfy a condition.
///
/// ```ignore
/// group.wait(None).applied(3).await?;
/// group.wait(Some(timeout)).role(Role::Leader, "become leader").await?;
/// ```
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<ShareStatus>,
}

impl Wait {
    /// Block until `func` accepts the status, or time out.
    pub async fn status<T>(&self, func: T, msg: &str) -> RaftResult<ShareStatus>
    where
        T: Fn(&ShareStatus) -> bool + Send,
    {
        let deadline = Instant::now() + self.timeout;
        let mut rx = self.rx.clone();
        loop {
            {
                let current = rx.borrow();
                if func(&current) {
                    return Ok(current.clone());
                }
            }
            let changed = tokio::time::timeout_at(deadline, rx.changed()).await;
            match changed {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(RaftError::Stopped),
                Err(_) => {
                    let current = rx.borrow().clone();
                    tracing::debug!(?current, msg, "wait timed out");
                    return Err(RaftError::Timeout);
                }
            }
        }
    }

    pub async fn applied(&self, want: u64, msg: &str) -> RaftResult<ShareStatus> {
        self.status(|s| s.last_applied >= want, msg).await
    }

    pub async fn log(&self, want: u64, msg: &str) -> RaftResult<ShareStatus> {
        self.status(|s| s.last_log_index >= want, msg).await
    }

    pub async fn role(&self, want: Role, msg: &str) -> RaftResult<ShareStatus> {
        self.status(|s| s.role == want, msg).await
    }

    pub async fn leader(&self, want: NodeId, msg: &str) -> RaftResult<ShareStatus> {
        self.status(|s| s.current_leader == Some(want), msg).await
    }

    pub async fn term_at_least(&self, want: Term, msg: &str) -> RaftResult<ShareStatus> {
        self.status(|s| s.current_term >= want, msg).await
    }
}
