//! The `JournalStore` against the `RaftStorage` contract: hard state durability, recovery,
//! compaction and snapshot installation.

use tokio::io::AsyncWriteExt;
use treeline_journal::{BlobData, JournalStore, StateMachine};
use treeline_raft::raft::{Entry, EntryNormal, EntryPayload, MembershipConfig};
use treeline_raft::storage::{HardState, RaftStorage, SnapshotMeta};
use treeline_raft::LogId;

fn entry(term: u64, index: u64) -> Entry<BlobData> {
    Entry {
        log_id: LogId::new(term, index),
        payload: EntryPayload::Normal(EntryNormal {
            data: BlobData::new(format!("payload-{:04}", index).into_bytes()),
        }),
    }
}

fn small_options() -> treeline_journal::JournalStoreOptions {
    treeline_journal::JournalStoreOptions {
        max_segment_bytes: 256,
        index_density: 0.2,
    }
}

#[tokio::test]
async fn initial_state_is_pristine_then_recovered() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    {
        let store = JournalStore::open(7, dir.path())?;
        let initial = store.get_initial_state().await?;
        assert_eq!(initial.last_log_id, LogId::default());
        assert_eq!(initial.last_applied_log, 0);
        assert_eq!(initial.hard_state.current_term, 0);
        assert!(initial.hard_state.membership.contains(&7));

        store
            .save_hard_state(&HardState {
                current_term: 3,
                voted_for: Some(1),
                membership: MembershipConfig {
                    members: [1, 2, 7].into_iter().collect(),
                },
            })
            .await?;
        for index in 1..=4 {
            store.append_entry_to_log(&entry(3, index)).await?;
        }
    }

    // Hard state and log survive a restart.
    let store = JournalStore::open(7, dir.path())?;
    let initial = store.get_initial_state().await?;
    assert_eq!(initial.last_log_id, LogId::new(3, 4));
    assert_eq!(initial.hard_state.current_term, 3);
    assert_eq!(initial.hard_state.voted_for, Some(1));
    assert_eq!(initial.hard_state.membership.members.len(), 3);
    Ok(())
}

#[tokio::test]
async fn log_read_write_and_truncation() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = JournalStore::open(1, dir.path())?;

    let batch: Vec<_> = (1..=8).map(|index| entry(1, index)).collect();
    store.replicate_to_log(&batch).await?;

    let read = store.get_log_entries(3, 6).await?;
    assert_eq!(read.iter().map(|e| e.log_id.index).collect::<Vec<_>>(), vec![3, 4, 5]);
    assert_eq!(store.try_get_log_entry(8).await?.unwrap().log_id, LogId::new(1, 8));

    store.delete_logs_from(6).await?;
    assert_eq!(store.try_get_log_entry(6).await?, None);
    assert_eq!(store.journal_entry_count().await, 5);
    Ok(())
}

#[tokio::test]
async fn compaction_persists_snapshot_before_trimming() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = JournalStore::open_with_options(1, dir.path(), small_options())?;

    let batch: Vec<_> = (1..=12).map(|index| entry(1, index)).collect();
    store.replicate_to_log(&batch).await?;
    let applied: Vec<_> = batch
        .iter()
        .filter_map(|e| match &e.payload {
            EntryPayload::Normal(inner) => Some((&e.log_id, &inner.data)),
            _ => None,
        })
        .collect();
    store.replicate_to_state_machine(&applied).await?;

    let snapshot = store.do_log_compaction(7).await?;
    assert_eq!(snapshot.meta.last_log_id, LogId::new(1, 7));
    assert!(snapshot.meta.total_len > 0);

    // The journal has been trimmed to whole-segment granularity below the boundary.
    let first = store.journal_first_index().await;
    assert!(first > 1 && first <= 8, "unexpected first retained index {}", first);

    // Reads below the trim are an error, which is what pushes a lagging follower onto the
    // snapshot path.
    assert!(store.get_log_entries(1, 3).await.is_err());

    // The published snapshot is the current one.
    let current = store.get_current_snapshot().await?.unwrap();
    assert_eq!(current.meta.last_log_id, LogId::new(1, 7));

    // After a restart the state machine is recovered from the snapshot.
    drop(store);
    let store = JournalStore::open_with_options(1, dir.path(), small_options())?;
    let initial = store.get_initial_state().await?;
    assert_eq!(initial.last_log_id, LogId::new(1, 12), "log suffix beyond the snapshot is retained");
    assert_eq!(initial.last_applied_log, 7);
    let sm = store.state_machine().await;
    assert_eq!(sm.entries.len(), 7);
    assert_eq!(sm.entries.get(&7).map(|d| d.as_slice()), Some(&b"payload-0007"[..]));
    Ok(())
}

#[tokio::test]
async fn snapshot_installation_replaces_log_and_state_machine() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = JournalStore::open(2, dir.path())?;

    // A short local log, about to be superseded by a snapshot from the leader.
    let batch: Vec<_> = (1..=3).map(|index| entry(1, index)).collect();
    store.replicate_to_log(&batch).await?;

    // The "leader's" snapshot body: a state machine through index 50.
    let leader_sm = StateMachine {
        last_applied: 50,
        entries: (1..=50u64).map(|index| (index, format!("leader-{}", index).into_bytes())).collect(),
    };
    let body = serde_json::to_vec(&leader_sm)?;
    let meta = SnapshotMeta {
        last_log_id: LogId::new(4, 50),
        snapshot_id: "4-50-9".into(),
        total_len: body.len() as u64,
        chunk_size: 64,
    };

    // Stream the body in as the install path does: create, write, shut down, finalize.
    let (_snapshot_id, mut file) = store.create_snapshot().await?;
    file.write_all(&body).await?;
    file.shutdown().await?;
    store.finalize_snapshot_installation(&meta, file, None).await?;

    // The local log is gone, replaced by the snapshot boundary.
    assert_eq!(store.journal_entry_count().await, 0);
    assert_eq!(store.journal_first_index().await, 51);
    let sm = store.state_machine().await;
    assert_eq!(sm.last_applied, 50);
    assert_eq!(sm.entries.len(), 50);

    // Appends continue after the snapshot boundary.
    store.append_entry_to_log(&entry(4, 51)).await?;
    assert_eq!(store.try_get_log_entry(51).await?.unwrap().log_id, LogId::new(4, 51));

    // The installed snapshot is now the current one, and survives a restart.
    drop(store);
    let store = JournalStore::open(2, dir.path())?;
    let current = store.get_current_snapshot().await?.unwrap();
    assert_eq!(current.meta.last_log_id, LogId::new(4, 50));
    let initial = store.get_initial_state().await?;
    assert_eq!(initial.last_applied_log, 50);
    assert_eq!(initial.last_log_id, LogId::new(4, 51));
    Ok(())
}
