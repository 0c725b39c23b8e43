//! Commit and rollback across in-process data nodes.

use std::sync::Arc;
use std::time::Duration;

use kestrel_cluster::{
    execute_utility, BarrierLock, ExecNodes, InProcessCluster, JournalEvent, LocalGtm,
    NodeTxnStatus, RemoteQueryState, RemoteStep, Reply, SessionContext, TwoPhaseCoordinator,
    TxnPhaseStatus,
};
use kestrel_common::error::{KestrelError, TxnError};
use kestrel_common::types::NodeId;

fn setup(ids: &[u32]) -> (Arc<InProcessCluster>, Arc<LocalGtm>, SessionContext) {
    setup_with_timeout(ids, 2_000)
}

fn setup_with_timeout(
    ids: &[u32],
    receive_timeout_ms: u64,
) -> (Arc<InProcessCluster>, Arc<LocalGtm>, SessionContext) {
    let cluster = InProcessCluster::new(ids);
    cluster.on_all("UPDATE t", Reply::command("UPDATE 1"));
    cluster.on_all("SELECT v", Reply::int_column("v", &[7]));
    let gtm = Arc::new(LocalGtm::new());
    let mut config = cluster.config();
    config.executor.receive_timeout_ms = receive_timeout_ms;
    let session = SessionContext::new(
        Arc::new(config),
        cluster.pool_manager(),
        gtm.clone(),
        Arc::new(BarrierLock::new()),
    );
    (cluster, gtm, session)
}

async fn read_on(s: &mut SessionContext, node: u32) {
    let step = RemoteStep::new("SELECT v", ExecNodes::single(NodeId(node)));
    let (rows, _) = RemoteQueryState::new(step).execute(s).await.unwrap();
    assert_eq!(rows.len(), 1);
}

fn ran(cluster: &InProcessCluster, node: u32, prefix: &str) -> bool {
    cluster.queries(node).iter().any(|q| q.starts_with(prefix))
}

fn count(cluster: &InProcessCluster, node: u32, sql: &str) -> usize {
    cluster.queries(node).iter().filter(|q| q.as_str() == sql).count()
}

/// Global xid announced right before the first query starting with `prefix`.
fn gxid_before(cluster: &InProcessCluster, node: u32, prefix: &str) -> Option<u64> {
    let events: Vec<JournalEvent> = cluster
        .journal()
        .into_iter()
        .filter(|e| e.node == NodeId(node))
        .map(|e| e.event)
        .collect();
    let at = events
        .iter()
        .position(|e| matches!(e, JournalEvent::Query(q) if q.starts_with(prefix)))?;
    match events.get(at.checked_sub(1)?)? {
        JournalEvent::GlobalXid(x) => Some(*x),
        _ => None,
    }
}

async fn update_on(s: &mut SessionContext, nodes: &[u32]) {
    let nodes: Vec<NodeId> = nodes.iter().map(|n| NodeId(*n)).collect();
    execute_utility(s, "UPDATE t SET v = 1", &nodes, false)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_two_writers_commit_prepared_everywhere() {
    let (cluster, gtm, mut s) = setup(&[1, 2, 3]);
    execute_utility(&mut s, "UPDATE t SET v = 1", &[NodeId(1), NodeId(2)], false)
        .await
        .unwrap();
    read_on(&mut s, 3).await;
    assert_eq!(s.txn().read_nodes(), &[NodeId(3)]);

    let coord = TwoPhaseCoordinator::from_config(s.config());
    assert!(coord.uses_two_phase(s.txn()));
    let status = coord.commit_transaction(&mut s).await.unwrap();
    assert_eq!(status, TxnPhaseStatus::Committed);

    let gid = cluster.node(1).committed_gids()[0].clone();
    assert!(gid.starts_with("T_"));
    assert_eq!(cluster.node(2).committed_gids(), vec![gid.clone()]);
    assert!(cluster.node(1).prepared_gids().is_empty());
    assert!(cluster.node(2).prepared_gids().is_empty());

    // The reader only ever sees a plain COMMIT.
    assert!(!ran(&cluster, 3, "PREPARE"));
    assert!(cluster.queries(3).iter().any(|q| q == "COMMIT"));

    assert!(gtm.in_doubt(&gid).is_none());
    assert_eq!(gtm.committed_count(), 1);
    assert!(s.txn().participants().is_empty());
    assert!(s.pool().held_nodes().is_empty());
}

#[tokio::test]
async fn test_prepare_failure_rolls_back_everyone() {
    let (cluster, gtm, mut s) = setup(&[1, 2]);
    cluster
        .node(2)
        .on("PREPARE TRANSACTION", Reply::error("XX000", "disk full"));
    execute_utility(&mut s, "UPDATE t SET v = 1", &[NodeId(1), NodeId(2)], false)
        .await
        .unwrap();

    let coord = TwoPhaseCoordinator::from_config(s.config());
    let err = coord.commit_transaction(&mut s).await.unwrap_err();
    assert!(matches!(
        err,
        KestrelError::Txn(TxnError::PrepareFailed { node: NodeId(2), .. })
    ));

    assert!(cluster.node(1).committed_gids().is_empty());
    assert!(cluster.node(2).committed_gids().is_empty());
    assert!(cluster.node(1).prepared_gids().is_empty());
    assert!(ran(&cluster, 1, "ROLLBACK PREPARED"));
    assert!(!ran(&cluster, 1, "COMMIT"));
    assert!(cluster.queries(2).iter().any(|q| q == "ROLLBACK"));
    assert_eq!(gtm.aborted_count(), 1);
    assert!(gtm.list_in_doubt().is_empty());
}

#[tokio::test]
async fn test_commit_prepared_failure_is_partial_commit() {
    let (cluster, gtm, mut s) = setup(&[1, 2]);
    cluster
        .node(2)
        .on("COMMIT PREPARED", Reply::error("58030", "could not write file"));
    execute_utility(&mut s, "UPDATE t SET v = 1", &[NodeId(1), NodeId(2)], false)
        .await
        .unwrap();

    let coord = TwoPhaseCoordinator::from_config(s.config());
    let err = coord.commit_transaction(&mut s).await.unwrap_err();
    let KestrelError::Txn(TxnError::PartiallyCommitted { gid, failed_nodes }) = err else {
        panic!("expected a partial commit, got {err:?}");
    };
    assert_eq!(failed_nodes, vec![NodeId(2)]);
    assert_eq!(cluster.node(1).committed_gids(), vec![gid.clone()]);
    assert!(cluster.node(2).is_prepared(&gid));

    // Not rolled back: node 1 already committed.
    assert!(!ran(&cluster, 1, "ROLLBACK"));
    assert!(!ran(&cluster, 2, "ROLLBACK"));

    assert_eq!(gtm.partial_commit_count(), 1);
    let in_doubt = gtm.in_doubt(&gid).unwrap();
    assert!(in_doubt.partially_committed);
    assert_eq!(in_doubt.nodes, vec![NodeId(2)]);

    assert_eq!(s.txn().status(), TxnPhaseStatus::PartCommitted);
    assert_eq!(s.txn().node_status(NodeId(1)), Some(NodeTxnStatus::Committed));
    assert_eq!(s.txn().node_status(NodeId(2)), Some(NodeTxnStatus::CommitFailed));
    s.reset_transaction();
    assert!(s.txn().participants().is_empty());
}

#[tokio::test]
async fn test_single_writer_commits_in_one_phase() {
    let (cluster, _gtm, mut s) = setup(&[1, 2]);
    execute_utility(&mut s, "UPDATE t SET v = 1", &[NodeId(1)], false)
        .await
        .unwrap();
    read_on(&mut s, 2).await;

    let coord = TwoPhaseCoordinator::from_config(s.config());
    assert!(!coord.uses_two_phase(s.txn()));
    let status = coord.commit_transaction(&mut s).await.unwrap();
    assert_eq!(status, TxnPhaseStatus::Committed);
    for node in [1, 2] {
        assert!(!ran(&cluster, node, "PREPARE"));
        assert!(cluster.queries(node).iter().any(|q| q == "COMMIT"));
    }
}

#[tokio::test]
async fn test_two_phase_disabled_commits_writers_directly() {
    let (cluster, gtm, mut s) = setup(&[1, 2]);
    execute_utility(&mut s, "UPDATE t SET v = 1", &[NodeId(1), NodeId(2)], false)
        .await
        .unwrap();

    let coord = TwoPhaseCoordinator::new(false, "T");
    assert!(s.txn().requires_two_phase());
    assert!(!coord.uses_two_phase(s.txn()));
    let status = coord.commit_transaction(&mut s).await.unwrap();
    assert_eq!(status, TxnPhaseStatus::Committed);
    assert!(!ran(&cluster, 1, "PREPARE"));
    assert!(!ran(&cluster, 2, "PREPARE"));
    assert!(gtm.list_in_doubt().is_empty());
}

#[tokio::test]
async fn test_rollback_sends_plain_rollback() {
    let (cluster, gtm, mut s) = setup(&[1, 2]);
    execute_utility(&mut s, "UPDATE t SET v = 1", &[NodeId(1), NodeId(2)], false)
        .await
        .unwrap();

    let coord = TwoPhaseCoordinator::from_config(s.config());
    let status = coord.rollback_transaction(&mut s).await;
    assert_eq!(status, TxnPhaseStatus::Aborted);
    for node in [1, 2] {
        assert!(cluster.queries(node).iter().any(|q| q == "ROLLBACK"));
    }
    assert_eq!(gtm.aborted_count(), 1);
    assert!(s.pool().held_nodes().is_empty());
}

#[tokio::test]
async fn test_lost_node_during_commit_is_partial() {
    let (cluster, gtm, mut s) = setup(&[1, 2]);
    cluster.node(2).on("COMMIT PREPARED", Reply::Disconnect);
    execute_utility(&mut s, "UPDATE t SET v = 1", &[NodeId(1), NodeId(2)], false)
        .await
        .unwrap();

    let coord = TwoPhaseCoordinator::from_config(s.config());
    let err = coord.commit_transaction(&mut s).await.unwrap_err();
    assert!(matches!(
        err,
        KestrelError::Txn(TxnError::PartiallyCommitted { .. })
    ));
    assert_eq!(gtm.partial_commit_count(), 1);
    assert_eq!(s.txn().status(), TxnPhaseStatus::PartCommitted);
}

#[tokio::test]
async fn test_barrier_released_before_commit_replies() {
    let (cluster, _gtm, mut s) = setup_with_timeout(&[1, 2], 300);
    cluster.node(2).on("COMMIT PREPARED", Reply::Hang);
    update_on(&mut s, &[1, 2]).await;

    let barrier = s.barrier().clone();
    let coord = TwoPhaseCoordinator::from_config(s.config());
    let (result, barrier_free) = tokio::join!(coord.commit_transaction(&mut s), async {
        // Dispatch is done by now; node 2 has not answered.
        tokio::time::sleep(Duration::from_millis(100)).await;
        barrier.try_write().is_some()
    });
    assert!(barrier_free);
    assert!(matches!(
        result,
        Err(KestrelError::Txn(TxnError::PartiallyCommitted { .. }))
    ));
}

#[tokio::test]
async fn test_next_transaction_after_partial_commit_starts_clean() {
    let (cluster, gtm, mut s) = setup(&[1, 2]);
    cluster
        .node(2)
        .on("COMMIT PREPARED", Reply::error("58030", "could not write file"));
    update_on(&mut s, &[1, 2]).await;
    let coord = TwoPhaseCoordinator::from_config(s.config());
    let err = coord.commit_transaction(&mut s).await.unwrap_err();
    let KestrelError::Txn(TxnError::PartiallyCommitted { gid, .. }) = err else {
        panic!("expected a partial commit, got {err:?}");
    };
    assert_eq!(s.txn().status(), TxnPhaseStatus::PartCommitted);

    update_on(&mut s, &[1]).await;
    assert_eq!(count(&cluster, 1, "BEGIN"), 2);
    assert_eq!(s.txn().write_nodes(), &[NodeId(1)]);
    assert!(s.txn().gid().is_none());

    let status = coord.commit_transaction(&mut s).await.unwrap();
    assert_eq!(status, TxnPhaseStatus::Committed);
    let commit_prepared = cluster
        .queries(1)
        .iter()
        .filter(|q| q.starts_with("COMMIT PREPARED"))
        .count();
    assert_eq!(commit_prepared, 1);
    assert_eq!(count(&cluster, 1, "COMMIT"), 1);

    // Still waiting for an operator.
    assert!(gtm.in_doubt(&gid).unwrap().partially_committed);
}

#[tokio::test]
async fn test_rollback_prepared_failing_on_some_nodes_is_part_aborted() {
    let (cluster, _gtm, mut s) = setup(&[1, 2, 3]);
    cluster
        .node(2)
        .on("ROLLBACK PREPARED", Reply::error("58030", "could not remove state file"));
    cluster
        .node(3)
        .on("PREPARE TRANSACTION", Reply::error("XX000", "disk full"));
    update_on(&mut s, &[1, 2, 3]).await;

    let coord = TwoPhaseCoordinator::from_config(s.config());
    let err = coord.prepare(&mut s).await.unwrap_err();
    assert!(matches!(
        err,
        KestrelError::Txn(TxnError::PrepareFailed { node: NodeId(3), .. })
    ));
    let gid = s.txn().gid().unwrap().to_string();

    let status = coord.abort(&mut s).await;
    assert_eq!(status, TxnPhaseStatus::PartAborted);
    assert_eq!(s.txn().status(), TxnPhaseStatus::PartAborted);
    assert_eq!(s.txn().node_status(NodeId(1)), Some(NodeTxnStatus::Aborted));
    assert_eq!(s.txn().node_status(NodeId(2)), Some(NodeTxnStatus::AbortFailed));
    assert_eq!(s.txn().node_status(NodeId(3)), Some(NodeTxnStatus::Aborted));
    assert!(!cluster.node(1).is_prepared(&gid));
    assert!(cluster.node(2).is_prepared(&gid));
    assert_eq!(count(&cluster, 3, "ROLLBACK"), 1);

    // Prepared nodes are rolled back under a fresh auxiliary id.
    let aux = s.txn().aux_txn_id.unwrap();
    assert_ne!(Some(aux), s.txn().txn_id);
    assert_eq!(gxid_before(&cluster, 1, "ROLLBACK PREPARED"), Some(aux.0));
    assert_eq!(gxid_before(&cluster, 2, "ROLLBACK PREPARED"), Some(aux.0));
    assert_eq!(gxid_before(&cluster, 3, "ROLLBACK"), None);
}

#[tokio::test]
async fn test_rollback_prepared_failing_everywhere_is_abort_failed() {
    let (cluster, gtm, mut s) = setup(&[1, 2]);
    cluster.on_all("ROLLBACK PREPARED", Reply::error("58030", "could not remove state file"));
    update_on(&mut s, &[1, 2]).await;

    let coord = TwoPhaseCoordinator::from_config(s.config());
    assert!(coord.prepare(&mut s).await.unwrap());
    let gid = s.txn().gid().unwrap().to_string();

    // Logged, never raised: the caller gets a status back.
    let status = coord.rollback_transaction(&mut s).await;
    assert_eq!(status, TxnPhaseStatus::AbortFailed);
    assert!(cluster.node(1).is_prepared(&gid));
    assert!(cluster.node(2).is_prepared(&gid));
    assert_eq!(gtm.aborted_count(), 1);
    assert!(s.txn().participants().is_empty());
    assert!(s.pool().held_nodes().is_empty());
}

#[tokio::test]
async fn test_single_writer_commit_failure_rolls_back() {
    let (cluster, gtm, mut s) = setup(&[1]);
    cluster
        .node(1)
        .on("COMMIT", Reply::error("40001", "could not serialize access"));
    update_on(&mut s, &[1]).await;

    let coord = TwoPhaseCoordinator::from_config(s.config());
    let err = coord.commit_transaction(&mut s).await.unwrap_err();
    assert!(matches!(
        err,
        KestrelError::Txn(TxnError::CommitFailed { node: NodeId(1), .. })
    ));
    assert_eq!(count(&cluster, 1, "ROLLBACK"), 1);
    assert_eq!(gtm.aborted_count(), 1);
    assert_eq!(gtm.committed_count(), 0);
    assert!(s.txn().participants().is_empty());
}
