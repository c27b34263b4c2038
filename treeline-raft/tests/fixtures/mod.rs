//! Test fixtures: an in-process network router over a registry of Raft nodes.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Result;
use tokio::sync::RwLock;
use treeline_journal::BlobData;
use treeline_journal::BlobResponse;
use treeline_journal::JournalStore;
use treeline_raft::async_trait::async_trait;
use treeline_raft::raft::{AppendEntriesRequest, AppendEntriesResponse, ClientWriteRequest, ClientWriteResponse, InstallSnapshotRequest, InstallSnapshotResponse, VoteRequest, VoteResponse};
use treeline_raft::Config;
use treeline_raft::NodeId;
use treeline_raft::Raft;
use treeline_raft::RaftNetwork;
use treeline_raft::State;

pub type MemRaft = Raft<BlobData, BlobResponse, RaftRouter, JournalStore>;

static TRACING: Once = Once::new();

/// Initialize a tracing subscriber for test output, once per process.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A generous default timeout for metrics waits.
pub fn timeout() -> Option<Duration> {
    Some(Duration::from_secs(30))
}

/// An emulated network transport over a routing table of in-process Raft nodes.
///
/// Nodes can be isolated, after which RPCs to them fail, emulating a partition.
pub struct RaftRouter {
    config: Arc<Config>,
    routing_table: RwLock<BTreeMap<NodeId, (MemRaft, Arc<JournalStore>)>>,
    isolated_nodes: RwLock<HashSet<NodeId>>,
    /// Temp dirs backing each node's store, kept alive for the router's lifetime.
    dirs: std::sync::Mutex<Vec<tempfile::TempDir>>,
}

impl RaftRouter {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            routing_table: RwLock::new(BTreeMap::new()),
            isolated_nodes: RwLock::new(HashSet::new()),
            dirs: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Create and register a new Raft node backed by a `JournalStore` in a temp dir.
    pub async fn new_raft_node(self: &Arc<Self>, id: NodeId) -> MemRaft {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let store = Arc::new(JournalStore::open(id, dir.path()).expect("failed to open journal store"));
        self.dirs.lock().unwrap().push(dir);
        let node = Raft::new(id, self.config.clone(), self.clone(), store.clone());
        self.routing_table.write().await.insert(id, (node.clone(), store));
        node
    }

    /// Initialize every node with the same member set.
    pub async fn initialize(&self, members: &BTreeSet<NodeId>) -> Result<()> {
        for id in members {
            let node = self.get_raft_handle(*id).await?;
            node.initialize(members.clone()).await?;
        }
        Ok(())
    }

    pub async fn get_raft_handle(&self, id: NodeId) -> Result<MemRaft> {
        let table = self.routing_table.read().await;
        let (node, _) = table.get(&id).ok_or_else(|| anyhow!("node {} not found in routing table", id))?;
        Ok(node.clone())
    }

    pub async fn get_store(&self, id: NodeId) -> Result<Arc<JournalStore>> {
        let table = self.routing_table.read().await;
        let (_, store) = table.get(&id).ok_or_else(|| anyhow!("node {} not found in routing table", id))?;
        Ok(store.clone())
    }

    /// Cut a node off from the network: RPCs addressed to it fail until it is restored.
    pub async fn isolate_node(&self, id: NodeId) {
        self.isolated_nodes.write().await.insert(id);
    }

    /// Restore an isolated node.
    pub async fn restore_node(&self, id: NodeId) {
        self.isolated_nodes.write().await.remove(&id);
    }

    /// Submit a client write to the given node.
    pub async fn client_request(&self, target: NodeId, payload: &[u8]) -> Result<ClientWriteResponse<BlobResponse>> {
        let node = self.get_raft_handle(target).await?;
        node.client_write(ClientWriteRequest::new(BlobData::new(payload)))
            .await
            .map_err(|err| anyhow!("client write failed: {:?}", err))
    }

    /// Submit `count` client writes to the given node.
    pub async fn client_request_many(&self, target: NodeId, prefix: &str, count: usize) -> Result<()> {
        for i in 0..count {
            self.client_request(target, format!("{}-{}", prefix, i).as_bytes()).await?;
        }
        Ok(())
    }

    /// The node currently reporting itself leader, if exactly one does.
    pub async fn current_leaders(&self) -> Vec<NodeId> {
        let table = self.routing_table.read().await;
        let mut leaders = Vec::new();
        for (id, (node, _)) in table.iter() {
            if node.metrics().borrow().state == State::Leader {
                leaders.push(*id);
            }
        }
        leaders
    }

    /// Wait until some node reports itself leader, returning its id.
    pub async fn wait_for_leader(&self, within: Duration, msg: &str) -> Result<NodeId> {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            let leaders = self.current_leaders().await;
            if let Some(leader) = leaders.first() {
                return Ok(*leader);
            }
            if tokio::time::Instant::now() > deadline {
                return Err(anyhow!("timeout waiting for a leader: {}", msg));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Wait for all given nodes to have appended and applied the log at least through `want`.
    pub async fn wait_for_log(&self, nodes: &BTreeSet<NodeId>, want: u64, msg: &str) -> Result<()> {
        for id in nodes {
            let node = self.get_raft_handle(*id).await?;
            node.wait(timeout()).log(want, format!("{} (node {})", msg, id)).await?;
        }
        Ok(())
    }

    /// Wait for all given nodes to reach the given state.
    pub async fn wait_for_state(&self, nodes: &BTreeSet<NodeId>, want: State, msg: &str) -> Result<()> {
        for id in nodes {
            let node = self.get_raft_handle(*id).await?;
            node.wait(timeout()).state(want, format!("{} (node {})", msg, id)).await?;
        }
        Ok(())
    }

    /// Wait for all given nodes' snapshots to cover at least `want_index`.
    pub async fn wait_for_snapshot(&self, nodes: &BTreeSet<NodeId>, want_index: u64, msg: &str) -> Result<()> {
        for id in nodes {
            let node = self.get_raft_handle(*id).await?;
            node.wait(timeout()).snapshot(want_index, format!("{} (node {})", msg, id)).await?;
        }
        Ok(())
    }

    /// An RPC is deliverable only when neither endpoint is isolated.
    async fn check_reachable(&self, from: NodeId, target: NodeId) -> Result<()> {
        let isolated = self.isolated_nodes.read().await;
        if isolated.contains(&target) {
            return Err(anyhow!("target node {} is isolated", target));
        }
        if isolated.contains(&from) {
            return Err(anyhow!("source node {} is isolated", from));
        }
        Ok(())
    }
}

#[async_trait]
impl RaftNetwork<BlobData> for RaftRouter {
    async fn send_append_entries(&self, target: NodeId, rpc: AppendEntriesRequest<BlobData>) -> Result<AppendEntriesResponse> {
        self.check_reachable(rpc.leader_id, target).await?;
        let node = self.get_raft_handle(target).await?;
        Ok(node.append_entries(rpc).await?)
    }

    async fn send_install_snapshot(&self, target: NodeId, rpc: InstallSnapshotRequest) -> Result<InstallSnapshotResponse> {
        self.check_reachable(rpc.leader_id, target).await?;
        let node = self.get_raft_handle(target).await?;
        Ok(node.install_snapshot(rpc).await?)
    }

    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse> {
        self.check_reachable(rpc.candidate_id, target).await?;
        let node = self.get_raft_handle(target).await?;
        Ok(node.vote(rpc).await?)
    }
}
