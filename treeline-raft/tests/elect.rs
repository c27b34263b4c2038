mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
use treeline_raft::Config;

use crate::fixtures::{init_tracing, timeout, RaftRouter};

/// A three-node cluster elects exactly one leader, replicates writes to all members, and
/// followers report themselves in sync.
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn three_node_election_and_replication() -> Result<()> {
    init_tracing();

    let config = Arc::new(Config::build("test".into()).validate()?);
    let router = Arc::new(RaftRouter::new(config));
    let members = btreeset![0, 1, 2];
    for id in &members {
        router.new_raft_node(*id).await;
    }

    tracing::info!("--- initializing cluster");
    router.initialize(&members).await?;
    let leader = router.wait_for_leader(Duration::from_secs(30), "initial election").await?;

    tracing::info!(leader, "--- waiting for all nodes to agree on the leader");
    for id in &members {
        let node = router.get_raft_handle(*id).await?;
        node.wait(timeout()).current_leader(leader, "agree on leader").await?;
    }

    // Election safety: exactly one node believes itself leader.
    let leaders = router.current_leaders().await;
    assert_eq!(leaders, vec![leader], "expected exactly one leader");

    // All nodes report the same term.
    let leader_term = router.get_raft_handle(leader).await?.metrics().borrow().current_term;
    for id in &members {
        let term = router.get_raft_handle(*id).await?.metrics().borrow().current_term;
        assert_eq!(term, leader_term, "node {} disagrees on term", id);
    }

    tracing::info!("--- writing through the leader");
    router.client_request_many(leader, "client", 5).await?;
    // Blank entry + 5 writes.
    router.wait_for_log(&members, 6, "writes replicated to all members").await?;

    tracing::info!("--- followers report in sync");
    for id in members.iter().filter(|id| **id != leader) {
        let node = router.get_raft_handle(*id).await?;
        node.wait(timeout()).sync(true, "follower in sync").await?;
    }

    // All state machines hold the same applied data.
    let leader_sm = router.get_store(leader).await?.state_machine().await;
    assert_eq!(leader_sm.entries.len(), 5);
    for id in &members {
        let sm = router.get_store(*id).await?.state_machine().await;
        assert_eq!(sm.entries, leader_sm.entries, "node {} state machine diverges", id);
    }

    Ok(())
}
