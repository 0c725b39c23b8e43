//! Global transaction id service.
//!
//! The coordinator asks this service for top-level and auxiliary transaction
//! ids and tells it which nodes hold a prepared transaction. A partially
//! committed transaction is recorded here and is never reported as finished
//! until an operator resolves it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;

use kestrel_common::types::{join_nodes, NodeId, TxnId};

/// Final outcome of a global transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalOutcome {
    Committed,
    Aborted,
}

/// External transaction-id service.
pub trait TransactionIdService: Send + Sync {
    fn begin_transaction(&self) -> TxnId;

    /// Fresh id driving `COMMIT PREPARED`; the original id is spent.
    fn begin_auxiliary(&self, gid: &str) -> TxnId;

    fn record_prepared(&self, gid: &str, txn: TxnId, nodes: &[NodeId]);

    /// Record that `gid` committed on some nodes and failed on `remaining`.
    fn record_partial_commit(&self, gid: &str, txn: TxnId, remaining: &[NodeId]);

    fn finish(&self, txn: TxnId, gid: Option<&str>, outcome: GlobalOutcome);
}

/// A prepared or partially committed global transaction.
#[derive(Debug, Clone)]
pub struct InDoubtTxn {
    pub gid: String,
    pub txn_id: TxnId,
    pub nodes: Vec<NodeId>,
    /// Some nodes committed; `nodes` are the ones that did not.
    pub partially_committed: bool,
    pub recorded_at: Instant,
}

/// In-memory [`TransactionIdService`] with an in-doubt registry for operators.
#[derive(Debug)]
pub struct LocalGtm {
    next_txn: AtomicU64,
    in_doubt: RwLock<HashMap<String, InDoubtTxn>>,
    partial_commits: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
}

impl Default for LocalGtm {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalGtm {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next_txn: AtomicU64::new(first),
            in_doubt: RwLock::new(HashMap::new()),
            partial_commits: AtomicU64::new(0),
            committed: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
        }
    }

    pub fn in_doubt(&self, gid: &str) -> Option<InDoubtTxn> {
        self.in_doubt.read().get(gid).cloned()
    }

    /// Snapshot of every unresolved global transaction, oldest first.
    pub fn list_in_doubt(&self) -> Vec<InDoubtTxn> {
        let mut out: Vec<InDoubtTxn> = self.in_doubt.read().values().cloned().collect();
        out.sort_by_key(|t| t.recorded_at);
        out
    }

    /// Operator resolution of a partially committed transaction.
    pub fn resolve(&self, gid: &str, outcome: GlobalOutcome) -> bool {
        let removed = self.in_doubt.write().remove(gid);
        if let Some(txn) = &removed {
            tracing::info!(gid, txn = %txn.txn_id, ?outcome, "in-doubt transaction resolved");
            self.count_outcome(outcome);
        }
        removed.is_some()
    }

    pub fn partial_commit_count(&self) -> u64 {
        self.partial_commits.load(Ordering::Relaxed)
    }

    pub fn committed_count(&self) -> u64 {
        self.committed.load(Ordering::Relaxed)
    }

    pub fn aborted_count(&self) -> u64 {
        self.aborted.load(Ordering::Relaxed)
    }

    fn count_outcome(&self, outcome: GlobalOutcome) {
        match outcome {
            GlobalOutcome::Committed => self.committed.fetch_add(1, Ordering::Relaxed),
            GlobalOutcome::Aborted => self.aborted.fetch_add(1, Ordering::Relaxed),
        };
    }
}

impl TransactionIdService for LocalGtm {
    fn begin_transaction(&self) -> TxnId {
        TxnId(self.next_txn.fetch_add(1, Ordering::SeqCst))
    }

    fn begin_auxiliary(&self, gid: &str) -> TxnId {
        let txn = TxnId(self.next_txn.fetch_add(1, Ordering::SeqCst));
        tracing::debug!(gid, aux = %txn, "auxiliary transaction id issued");
        txn
    }

    fn record_prepared(&self, gid: &str, txn: TxnId, nodes: &[NodeId]) {
        self.in_doubt.write().insert(
            gid.to_string(),
            InDoubtTxn {
                gid: gid.to_string(),
                txn_id: txn,
                nodes: nodes.to_vec(),
                partially_committed: false,
                recorded_at: Instant::now(),
            },
        );
    }

    fn record_partial_commit(&self, gid: &str, txn: TxnId, remaining: &[NodeId]) {
        self.partial_commits.fetch_add(1, Ordering::Relaxed);
        tracing::error!(
            gid,
            txn = %txn,
            nodes = %join_nodes(remaining),
            "partially committed transaction recorded; manual resolution required"
        );
        let mut in_doubt = self.in_doubt.write();
        let entry = in_doubt.entry(gid.to_string()).or_insert_with(|| InDoubtTxn {
            gid: gid.to_string(),
            txn_id: txn,
            nodes: Vec::new(),
            partially_committed: false,
            recorded_at: Instant::now(),
        });
        entry.nodes = remaining.to_vec();
        entry.partially_committed = true;
    }

    fn finish(&self, txn: TxnId, gid: Option<&str>, outcome: GlobalOutcome) {
        if let Some(gid) = gid {
            let mut in_doubt = self.in_doubt.write();
            if in_doubt.get(gid).is_some_and(|t| t.partially_committed) {
                tracing::warn!(gid, txn = %txn, "not finishing a partially committed transaction");
                return;
            }
            in_doubt.remove(gid);
        }
        self.count_outcome(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic() {
        let gtm = LocalGtm::new();
        let a = gtm.begin_transaction();
        let b = gtm.begin_auxiliary("T_1");
        assert!(b > a);
    }

    #[test]
    fn test_prepared_then_finished() {
        let gtm = LocalGtm::new();
        let txn = gtm.begin_transaction();
        gtm.record_prepared("T_1", txn, &[NodeId(1), NodeId(2)]);
        assert_eq!(gtm.list_in_doubt().len(), 1);
        gtm.finish(txn, Some("T_1"), GlobalOutcome::Committed);
        assert!(gtm.list_in_doubt().is_empty());
        assert_eq!(gtm.committed_count(), 1);
    }

    #[test]
    fn test_partial_commit_survives_finish() {
        let gtm = LocalGtm::new();
        let txn = gtm.begin_transaction();
        gtm.record_prepared("T_2", txn, &[NodeId(1), NodeId(2)]);
        gtm.record_partial_commit("T_2", txn, &[NodeId(2)]);
        gtm.finish(txn, Some("T_2"), GlobalOutcome::Committed);

        let entry = gtm.in_doubt("T_2").unwrap();
        assert!(entry.partially_committed);
        assert_eq!(entry.nodes, vec![NodeId(2)]);
        assert_eq!(gtm.committed_count(), 0);

        assert!(gtm.resolve("T_2", GlobalOutcome::Committed));
        assert!(gtm.in_doubt("T_2").is_none());
        assert_eq!(gtm.committed_count(), 1);
    }
}
