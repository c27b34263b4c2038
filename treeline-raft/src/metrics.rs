//! Raft metrics for observability.
//!
//! Applications may use this data in whatever way is needed. The obvious use cases are to expose
//! these metrics to a metrics collection system like Prometheus. Applications may also
//! use this data to trigger events within higher levels of the parent application.
//!
//! Metrics are observed on a running Raft node via the `Raft::metrics()` method, which will
//! return a stream of metrics.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use crate::core::State;
use crate::raft::MembershipConfig;
use crate::raft_types::LogId;
use crate::NodeId;

/// A set of metrics describing the current state of a Raft node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftMetrics {
    /// The ID of the Raft node.
    pub id: NodeId,
    /// The state of the Raft node.
    pub state: State,
    /// The current term of the Raft node.
    pub current_term: u64,
    /// The last log index to be appended to this Raft node's log.
    pub last_log_index: u64,
    /// The last log index to be applied to this Raft node's state machine.
    pub last_applied: u64,
    /// The current cluster leader.
    pub current_leader: Option<NodeId>,
    /// The current membership config of the cluster.
    pub membership_config: MembershipConfig,
    /// The id of the last log entry covered by the node's current snapshot.
    pub snapshot: LogId,
    /// Whether this node, as a follower, currently considers itself in sync with its leader.
    ///
    /// Always `true` on a leader; reset on leader change and re-earned once the commit-index
    /// lag falls within the configured threshold.
    pub sync: bool,
    /// On a leader, the most recently matched log id per follower. `None` on other states.
    pub replication: Option<BTreeMap<NodeId, LogId>>,
}

impl RaftMetrics {
    pub(crate) fn new_initial(id: NodeId) -> Self {
        let membership_config = MembershipConfig::new_initial(id);
        Self {
            id,
            state: State::Follower,
            current_term: 0,
            last_log_index: 0,
            last_applied: 0,
            current_leader: None,
            membership_config,
            snapshot: LogId::default(),
            sync: false,
            replication: None,
        }
    }
}

/// An error which may arise while waiting for a metrics condition.
#[derive(Debug, Error)]
pub enum WaitError {
    /// The wait timed out before the condition was observed.
    #[error("timeout after {0:?} when {1}")]
    Timeout(Duration, String),
    /// The Raft node whose metrics are being observed has shut down.
    #[error("raft is shutting down")]
    ShuttingDown,
}

/// A handle for waiting on a Raft node's metrics to satisfy some condition.
///
/// ```ignore
/// # use std::time::Duration;
/// # use treeline_raft::{Raft, State};
/// let w = raft.wait(Some(Duration::from_millis(500)));
///
/// // Wait for log 3 to be received and applied:
/// w.log(3, "log 3").await?;
///
/// // Wait for the node to become leader:
/// w.state(State::Leader, "become leader").await?;
/// ```
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<RaftMetrics>,
}

impl Wait {
    /// Wait for metrics to satisfy the given predicate, or timeout.
    pub async fn metrics<T>(&self, func: T, msg: impl ToString) -> Result<RaftMetrics, WaitError>
    where T: Fn(&RaftMetrics) -> bool {
        let mut rx = self.rx.clone();
        loop {
            let latest = rx.borrow().clone();
            if func(&latest) {
                tracing::debug!("wait is satisfied: {}", msg.to_string());
                return Ok(latest);
            }

            let delay = tokio::time::sleep(self.timeout);
            tokio::pin!(delay);

            tokio::select! {
                _ = &mut delay => {
                    return Err(WaitError::Timeout(self.timeout, format!("{} latest: {:?}", msg.to_string(), latest)));
                }
                changed = rx.changed() => {
                    changed.map_err(|_| WaitError::ShuttingDown)?;
                }
            }
        }
    }

    /// Wait for the log to be appended and applied at least through `want`.
    pub async fn log(&self, want: u64, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |m| m.last_log_index >= want && m.last_applied >= want,
            format!("{} .last_log_index and .last_applied >= {}", msg.to_string(), want),
        )
        .await
    }

    /// Wait for the node to report the given state.
    pub async fn state(&self, want: State, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(|m| m.state == want, format!("{} .state == {:?}", msg.to_string(), want)).await
    }

    /// Wait for the node to report the given current leader.
    pub async fn current_leader(&self, leader: NodeId, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |m| m.current_leader == Some(leader),
            format!("{} .current_leader == {}", msg.to_string(), leader),
        )
        .await
    }

    /// Wait for the node's snapshot to cover at least the given index.
    pub async fn snapshot(&self, want_index: u64, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |m| m.snapshot.index >= want_index,
            format!("{} .snapshot.index >= {}", msg.to_string(), want_index),
        )
        .await
    }

    /// Wait for the node to report the given sync status.
    pub async fn sync(&self, want: bool, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(|m| m.sync == want, format!("{} .sync == {}", msg.to_string(), want)).await
    }
}
