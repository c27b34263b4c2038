mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
use treeline_raft::{Config, SnapshotPolicy};

use crate::fixtures::{init_tracing, timeout, RaftRouter};

/// Log compaction and chunked snapshot transfer to a lagging follower.
///
/// - bring up a three-node cluster,
/// - cut one follower off and write enough entries to trigger snapshot capture on the leader,
/// - restore the follower and assert it is brought back up to speed through a chunked
///   InstallSnapshot stream followed by normal replication.
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn compaction_and_snapshot_install() -> Result<()> {
    init_tracing();

    let snapshot_threshold: u64 = 10;
    let config = Arc::new(
        Config::build("test".into())
            .snapshot_policy(SnapshotPolicy::LogsSinceLast(snapshot_threshold))
            // Tiny chunks so the transfer exercises the multi-chunk path.
            .snapshot_max_chunk_size(64)
            .validate()?,
    );
    let router = Arc::new(RaftRouter::new(config));
    let members = btreeset![0, 1, 2];
    for id in &members {
        router.new_raft_node(*id).await;
    }

    tracing::info!("--- initializing cluster");
    router.initialize(&members).await?;
    let leader = router.wait_for_leader(Duration::from_secs(30), "initial election").await?;
    router.wait_for_log(&members, 1, "blank entry replicated").await?;

    let lagging = *members.iter().find(|id| **id != leader).expect("a follower must exist");
    tracing::info!(lagging, "--- isolating follower");
    router.isolate_node(lagging).await;

    tracing::info!("--- writing past the snapshot threshold");
    let writes = (snapshot_threshold * 3) as usize;
    router.client_request_many(leader, "client", writes).await?;
    let majority = btreeset![leader];
    router.wait_for_log(&majority, 1 + writes as u64, "writes committed on the leader").await?;

    tracing::info!("--- waiting for snapshot capture on the leader");
    let leader_node = router.get_raft_handle(leader).await?;
    leader_node
        .wait(timeout())
        .snapshot(snapshot_threshold, "leader snapshot covers the threshold")
        .await?;

    tracing::info!(lagging, "--- restoring follower, expecting snapshot install");
    router.restore_node(lagging).await;

    let lagging_node = router.get_raft_handle(lagging).await?;
    lagging_node
        .wait(Some(Duration::from_secs(60)))
        .snapshot(snapshot_threshold, "lagging follower received a snapshot")
        .await?;
    lagging_node
        .wait(Some(Duration::from_secs(60)))
        .log(1 + writes as u64, "lagging follower fully caught up")
        .await?;

    // The follower's state machine converges with the leader's.
    let leader_sm = router.get_store(leader).await?.state_machine().await;
    let lagging_sm = router.get_store(lagging).await?.state_machine().await;
    assert_eq!(lagging_sm.entries, leader_sm.entries, "state machines diverge after snapshot install");
    assert_eq!(leader_sm.entries.len(), writes);

    Ok(())
}
