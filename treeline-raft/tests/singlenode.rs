mod fixtures;

use std::sync::Arc;

use anyhow::Result;
use maplit::btreeset;
use treeline_raft::{Config, State};

use crate::fixtures::{init_tracing, timeout, RaftRouter};

/// A single-node cluster commits and applies client writes without any peers.
///
/// - initialize a one-node cluster; the node becomes leader immediately,
/// - send client requests and assert they are committed and applied.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn singlenode() -> Result<()> {
    init_tracing();

    let config = Arc::new(Config::build("test".into()).validate()?);
    let router = Arc::new(RaftRouter::new(config));
    let node = router.new_raft_node(0).await;

    tracing::info!("--- initializing single node cluster");
    node.initialize(btreeset![0]).await?;
    node.wait(timeout()).state(State::Leader, "single node becomes leader").await?;
    // The leader's blank entry is committed on taking office.
    node.wait(timeout()).log(1, "initial blank entry is applied").await?;

    tracing::info!("--- sending client requests");
    router.client_request_many(0, "client", 10).await?;
    node.wait(timeout()).log(11, "client writes are applied").await?;

    let sm = router.get_store(0).await?.state_machine().await;
    assert_eq!(sm.last_applied, 11);
    assert_eq!(sm.entries.len(), 10);
    assert_eq!(sm.entries.get(&2).map(|data| data.as_slice()), Some(&b"client-0"[..]));

    Ok(())
}
