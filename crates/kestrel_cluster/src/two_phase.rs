//! Distributed transaction coordinator.
//!
//! Tracks which data nodes a transaction read from or wrote to, and ends it
//! with a plain COMMIT/ROLLBACK fan-out or, when more than one node wrote,
//! with PREPARE TRANSACTION followed by COMMIT PREPARED.
//!
//! Partial-failure handling:
//!
//! | phase   | failure                               | result         |
//! |---------|---------------------------------------|----------------|
//! | prepare | any node                              | PrepareFailed  |
//! | commit  | before any node was told to commit    | CommitFailed   |
//! | commit  | some nodes committed, some did not    | PartCommitted  |
//! | abort   | every node                            | AbortFailed    |
//! | abort   | some nodes                            | PartAborted    |
//!
//! PartCommitted is handed to the GTM once and the state is kept for an
//! operator until the next transaction begins; abort failures are only
//! logged. COMMIT PREPARED and ROLLBACK PREPARED run under an auxiliary
//! transaction id.

use std::collections::BTreeMap;

use kestrel_common::config::KestrelConfig;
use kestrel_common::error::{KestrelError, KestrelResult, TxnError};
use kestrel_common::types::{join_nodes, NodeId, TxnId};
use kestrel_protocol::FrontendMessage;

use crate::combiner::{CombineType, CombinerId};
use crate::gtm::GlobalOutcome;
use crate::session::{DriveUntil, SessionContext};

/// Where one participant is in the commit protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeTxnStatus {
    Active,
    PrepareSent,
    Prepared,
    PrepareFailed,
    CommitSent,
    Committed,
    CommitFailed,
    AbortSent,
    Aborted,
    AbortFailed,
}

/// Outcome of the distributed transaction as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxnPhaseStatus {
    #[default]
    None,
    Prepared,
    PrepareFailed,
    Committed,
    CommitFailed,
    PartCommitted,
    Aborted,
    AbortFailed,
    PartAborted,
}

impl TxnPhaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TxnPhaseStatus::None => "none",
            TxnPhaseStatus::Prepared => "prepared",
            TxnPhaseStatus::PrepareFailed => "prepare_failed",
            TxnPhaseStatus::Committed => "committed",
            TxnPhaseStatus::CommitFailed => "commit_failed",
            TxnPhaseStatus::PartCommitted => "part_committed",
            TxnPhaseStatus::Aborted => "aborted",
            TxnPhaseStatus::AbortFailed => "abort_failed",
            TxnPhaseStatus::PartAborted => "part_aborted",
        }
    }
}

/// Per-session distributed transaction state. Reset at transaction end,
/// or when the next transaction begins after a partial commit.
#[derive(Debug, Default)]
pub struct DistributedTxnState {
    pub txn_id: Option<TxnId>,
    /// Id under which the commit of a prepared transaction runs.
    pub aux_txn_id: Option<TxnId>,
    gid: Option<String>,
    write_nodes: Vec<NodeId>,
    read_nodes: Vec<NodeId>,
    node_status: BTreeMap<NodeId, NodeTxnStatus>,
    /// Nodes that were sent PREPARE TRANSACTION.
    prepare_sent: Vec<NodeId>,
    status: TxnPhaseStatus,
    local_write: bool,
    temp_object_touched: bool,
}

impl DistributedTxnState {
    /// Record a write on `node`. A node that only read so far is promoted.
    pub fn register_write(&mut self, node: NodeId) {
        self.read_nodes.retain(|n| *n != node);
        if !self.write_nodes.contains(&node) {
            self.write_nodes.push(node);
        }
        self.node_status.entry(node).or_insert(NodeTxnStatus::Active);
    }

    pub fn register_read(&mut self, node: NodeId) {
        if !self.is_participant(node) {
            self.read_nodes.push(node);
            self.node_status.insert(node, NodeTxnStatus::Active);
        }
    }

    pub fn is_participant(&self, node: NodeId) -> bool {
        self.write_nodes.contains(&node) || self.read_nodes.contains(&node)
    }

    /// Writers first, then readers.
    pub fn participants(&self) -> Vec<NodeId> {
        self.write_nodes
            .iter()
            .chain(self.read_nodes.iter())
            .copied()
            .collect()
    }

    pub fn write_nodes(&self) -> &[NodeId] {
        &self.write_nodes
    }

    pub fn read_nodes(&self) -> &[NodeId] {
        &self.read_nodes
    }

    /// Remote writers, plus the coordinator itself if it wrote locally.
    pub fn write_participant_count(&self) -> usize {
        self.write_nodes.len() + usize::from(self.local_write)
    }

    pub fn set_local_write(&mut self) {
        self.local_write = true;
    }

    pub fn mark_temp_object_touched(&mut self) {
        self.temp_object_touched = true;
    }

    pub fn requires_two_phase(&self) -> bool {
        self.write_participant_count() > 1 && !self.temp_object_touched
    }

    pub fn gid(&self) -> Option<&str> {
        self.gid.as_deref()
    }

    /// Global id, `<prefix>_<txn id>`, generated on first use.
    pub fn ensure_gid(&mut self, prefix: &str) -> String {
        if let Some(gid) = &self.gid {
            return gid.clone();
        }
        let gid = format!("{}_{}", prefix, self.txn_id.map_or(0, |t| t.0));
        self.gid = Some(gid.clone());
        gid
    }

    pub fn status(&self) -> TxnPhaseStatus {
        self.status
    }

    pub fn set_status(&mut self, status: TxnPhaseStatus) {
        self.status = status;
    }

    pub fn node_status(&self, node: NodeId) -> Option<NodeTxnStatus> {
        self.node_status.get(&node).copied()
    }

    pub fn set_node_status(&mut self, node: NodeId, status: NodeTxnStatus) {
        self.node_status.insert(node, status);
    }

    pub fn mark_prepare_sent(&mut self, node: NodeId) {
        if !self.prepare_sent.contains(&node) {
            self.prepare_sent.push(node);
        }
        self.node_status.insert(node, NodeTxnStatus::PrepareSent);
    }

    /// Whether `node` may hold a prepared transaction: PREPARE was sent and
    /// not rejected.
    pub fn may_be_prepared(&self, node: NodeId) -> bool {
        self.prepare_sent.contains(&node)
            && self.node_status(node) != Some(NodeTxnStatus::PrepareFailed)
    }

    /// Commit or rollback already ran; nothing more is sent for this state.
    pub fn is_finished(&self) -> bool {
        !matches!(self.status, TxnPhaseStatus::None | TxnPhaseStatus::Prepared)
    }

    pub fn nodes_in(&self, status: NodeTxnStatus) -> Vec<NodeId> {
        self.node_status
            .iter()
            .filter(|(_, s)| **s == status)
            .map(|(n, _)| *n)
            .collect()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// What one participant is sent in a round.
#[derive(Debug, Clone)]
struct NodeCommand {
    sql: String,
    /// Global xid announced ahead of the command, if any.
    gxid: Option<TxnId>,
}

impl NodeCommand {
    fn plain(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            gxid: None,
        }
    }
}

/// A round whose commands are on the wire; replies not read yet.
struct Dispatched {
    combiner: CombinerId,
    unsent: Vec<NodeId>,
    reason: String,
}

/// Replies of one fan-out round, split by how each node answered.
struct RoundResult {
    ok: Vec<NodeId>,
    /// The node answered with an error.
    rejected: Vec<NodeId>,
    /// The connection broke; the node's state is unknown.
    lost: Vec<NodeId>,
    reason: String,
}

/// Ends distributed transactions for a session.
#[derive(Debug, Clone)]
pub struct TwoPhaseCoordinator {
    enforce_two_phase: bool,
    gid_prefix: String,
}

impl TwoPhaseCoordinator {
    pub fn new(enforce_two_phase: bool, gid_prefix: impl Into<String>) -> Self {
        Self {
            enforce_two_phase,
            gid_prefix: gid_prefix.into(),
        }
    }

    pub fn from_config(config: &KestrelConfig) -> Self {
        Self::new(config.txn.enforce_two_phase, config.coordinator.gid_prefix.clone())
    }

    pub fn uses_two_phase(&self, txn: &DistributedTxnState) -> bool {
        self.enforce_two_phase && txn.requires_two_phase()
    }

    /// Send and flush `command(node)` on each node without reading replies.
    ///
    /// With `stop_on_first_failure`, a node that cannot even be sent its
    /// command before any other node was reached aborts the round; nothing
    /// is sent after that.
    async fn dispatch(
        &self,
        session: &mut SessionContext,
        nodes: &[NodeId],
        command: impl Fn(NodeId) -> NodeCommand,
        stop_on_first_failure: bool,
    ) -> KestrelResult<Dispatched> {
        let id = session.create_combiner(CombineType::None, None);
        let mut unsent = Vec::new();
        let mut sent = 0usize;
        let mut reason = String::new();
        for &node in nodes {
            match self.send_one(session, id, node, &command(node)).await {
                Ok(()) => sent += 1,
                Err(e) => {
                    if stop_on_first_failure && sent == 0 {
                        session.discard_combiner(id);
                        return Err(e);
                    }
                    tracing::warn!(node = %node, error = %e, "transaction command not sent");
                    if reason.is_empty() {
                        reason = e.to_string();
                    }
                    unsent.push(node);
                }
            }
        }
        Ok(Dispatched {
            combiner: id,
            unsent,
            reason,
        })
    }

    /// Wait for every reply of a dispatched round and sort the nodes by
    /// how they answered.
    async fn collect(
        &self,
        session: &mut SessionContext,
        nodes: &[NodeId],
        round: Dispatched,
    ) -> KestrelResult<RoundResult> {
        let Dispatched {
            combiner: id,
            unsent,
            mut reason,
        } = round;
        if let Err(e) = session.drive(id, DriveUntil::AllReady).await {
            session.discard_combiner(id);
            return Err(e);
        }
        let (rejected, fatal) = match session.combiner(id) {
            Some(c) => (c.errored_nodes().to_vec(), c.fatal_nodes()),
            None => (Vec::new(), Vec::new()),
        };
        if let Err(e) = session.close_combiner(id).await {
            if reason.is_empty() {
                reason = e.to_string();
            }
        }
        let mut lost = unsent;
        lost.extend(fatal.iter().copied().filter(|n| !rejected.contains(n)));
        let ok = nodes
            .iter()
            .copied()
            .filter(|n| !rejected.contains(n) && !lost.contains(n))
            .collect();
        Ok(RoundResult {
            ok,
            rejected,
            lost,
            reason,
        })
    }

    async fn fan_out(
        &self,
        session: &mut SessionContext,
        nodes: &[NodeId],
        command: impl Fn(NodeId) -> NodeCommand,
        stop_on_first_failure: bool,
    ) -> KestrelResult<RoundResult> {
        let round = self
            .dispatch(session, nodes, command, stop_on_first_failure)
            .await?;
        self.collect(session, nodes, round).await
    }

    async fn send_one(
        &self,
        session: &mut SessionContext,
        id: CombinerId,
        node: NodeId,
        command: &NodeCommand,
    ) -> KestrelResult<()> {
        session.claim_connections(id, &[node]).await?;
        let send_gxid = session.config().executor.send_gxid;
        let conn = session
            .pool_mut()
            .get_mut(node)
            .ok_or_else(|| KestrelError::connection(node, "not held by session"))?;
        if let (true, Some(gxid)) = (send_gxid, command.gxid) {
            conn.send(&FrontendMessage::GlobalXid(gxid.0))?;
        }
        conn.send(&FrontendMessage::Query(command.sql.clone()))?;
        conn.flush().await
    }

    /// Id under which COMMIT/ROLLBACK PREPARED run, issued once per
    /// transaction.
    fn ensure_aux_txn_id(&self, session: &mut SessionContext, gid: &str) -> TxnId {
        if let Some(aux) = session.txn().aux_txn_id {
            return aux;
        }
        let aux = session.gtm().begin_auxiliary(gid);
        session.txn_mut().aux_txn_id = Some(aux);
        aux
    }

    /// PREPARE TRANSACTION on every writer. Returns whether anything was
    /// prepared. Any failure leaves the transaction PrepareFailed.
    pub async fn prepare(&self, session: &mut SessionContext) -> KestrelResult<bool> {
        if !self.uses_two_phase(session.txn()) || session.txn().write_nodes().is_empty() {
            return Ok(false);
        }
        let txn_id = session.ensure_txn_id();
        let gid = session.txn_mut().ensure_gid(&self.gid_prefix);
        let writers = session.txn().write_nodes().to_vec();
        for &node in &writers {
            session.txn_mut().mark_prepare_sent(node);
        }
        tracing::debug!(gid = %gid, nodes = ?writers, "preparing transaction");

        let sql = format!("PREPARE TRANSACTION '{}'", gid);
        let round = match self
            .fan_out(session, &writers, |_| NodeCommand::plain(sql.clone()), false)
            .await
        {
            Ok(round) => round,
            Err(e) => {
                session.txn_mut().set_status(TxnPhaseStatus::PrepareFailed);
                return Err(e);
            }
        };
        for &node in &round.ok {
            session.txn_mut().set_node_status(node, NodeTxnStatus::Prepared);
        }
        for &node in &round.rejected {
            session.txn_mut().set_node_status(node, NodeTxnStatus::PrepareFailed);
        }
        // Lost nodes stay PrepareSent: they may have prepared.
        if let Some(&node) = round.rejected.first().or(round.lost.first()) {
            session.txn_mut().set_status(TxnPhaseStatus::PrepareFailed);
            tracing::warn!(gid = %gid, node = %node, reason = %round.reason, "prepare failed");
            return Err(TxnError::PrepareFailed {
                gid,
                node,
                reason: round.reason,
            }
            .into());
        }
        session.txn_mut().set_status(TxnPhaseStatus::Prepared);
        session.gtm().record_prepared(&gid, txn_id, &writers);
        Ok(true)
    }

    /// Commit on every participant: COMMIT PREPARED where a prepare was
    /// sent, plain COMMIT elsewhere. The shared barrier lock is held while
    /// the commands are dispatched and released before any reply is read.
    pub async fn commit(&self, session: &mut SessionContext) -> KestrelResult<TxnPhaseStatus> {
        let participants = session.txn().participants();
        if participants.is_empty() {
            session.txn_mut().set_status(TxnPhaseStatus::Committed);
            return Ok(TxnPhaseStatus::Committed);
        }
        let prepared = session.txn().status() == TxnPhaseStatus::Prepared;
        let txn_id = session.ensure_txn_id();
        let gid = session.txn_mut().ensure_gid(&self.gid_prefix);
        let aux = if prepared {
            Some(self.ensure_aux_txn_id(session, &gid))
        } else {
            None
        };

        let commands: BTreeMap<NodeId, NodeCommand> = participants
            .iter()
            .map(|&n| {
                let cmd = if session.txn().may_be_prepared(n) {
                    NodeCommand {
                        sql: format!("COMMIT PREPARED '{}'", gid),
                        gxid: aux,
                    }
                } else {
                    NodeCommand::plain("COMMIT")
                };
                (n, cmd)
            })
            .collect();
        let command = |n: NodeId| {
            commands
                .get(&n)
                .cloned()
                .unwrap_or_else(|| NodeCommand::plain("COMMIT"))
        };

        let barrier = session.barrier().clone();
        let dispatched = {
            let _guard = barrier.read().await;
            self.dispatch(session, &participants, command, true).await
        };
        let round = match dispatched {
            Ok(sent) => self.collect(session, &participants, sent).await,
            Err(e) => Err(e),
        };
        let round = match round {
            Ok(round) => round,
            Err(e) => {
                let node = participants[0];
                session.txn_mut().set_status(TxnPhaseStatus::CommitFailed);
                tracing::warn!(gid = %gid, node = %node, error = %e, "commit failed before any node committed");
                return Err(TxnError::CommitFailed {
                    node,
                    reason: e.to_string(),
                }
                .into());
            }
        };

        for &node in &round.ok {
            session.txn_mut().set_node_status(node, NodeTxnStatus::Committed);
        }
        let mut failed = round.rejected.clone();
        failed.extend(round.lost.iter().copied());
        for &node in &failed {
            session.txn_mut().set_node_status(node, NodeTxnStatus::CommitFailed);
        }

        if failed.is_empty() {
            session.txn_mut().set_status(TxnPhaseStatus::Committed);
            tracing::debug!(gid = %gid, nodes = participants.len(), "transaction committed");
            return Ok(TxnPhaseStatus::Committed);
        }
        if round.ok.is_empty() {
            session.txn_mut().set_status(TxnPhaseStatus::CommitFailed);
            return Err(TxnError::CommitFailed {
                node: failed[0],
                reason: round.reason,
            }
            .into());
        }
        session.txn_mut().set_status(TxnPhaseStatus::PartCommitted);
        session.gtm().record_partial_commit(&gid, txn_id, &failed);
        tracing::error!(
            gid = %gid,
            committed = %join_nodes(&round.ok),
            failed = %join_nodes(&failed),
            "transaction partially committed; manual inspection required"
        );
        Err(TxnError::PartiallyCommitted {
            gid,
            failed_nodes: failed,
        }
        .into())
    }

    /// Roll back on every participant. Failures are logged, never raised.
    pub async fn abort(&self, session: &mut SessionContext) -> TxnPhaseStatus {
        let participants = session.txn().participants();
        if participants.is_empty() {
            session.txn_mut().set_status(TxnPhaseStatus::Aborted);
            return TxnPhaseStatus::Aborted;
        }
        let gid = session.txn().gid().unwrap_or_default().to_string();
        let any_prepared = participants.iter().any(|&n| session.txn().may_be_prepared(n));
        let aux = if any_prepared {
            Some(self.ensure_aux_txn_id(session, &gid))
        } else {
            None
        };
        let commands: BTreeMap<NodeId, NodeCommand> = participants
            .iter()
            .map(|&n| {
                let cmd = if session.txn().may_be_prepared(n) {
                    NodeCommand {
                        sql: format!("ROLLBACK PREPARED '{}'", gid),
                        gxid: aux,
                    }
                } else {
                    NodeCommand::plain("ROLLBACK")
                };
                (n, cmd)
            })
            .collect();
        for &node in &participants {
            session.txn_mut().set_node_status(node, NodeTxnStatus::AbortSent);
        }

        let round = self
            .fan_out(
                session,
                &participants,
                |n| {
                    commands
                        .get(&n)
                        .cloned()
                        .unwrap_or_else(|| NodeCommand::plain("ROLLBACK"))
                },
                false,
            )
            .await;
        let status = match round {
            Ok(round) => {
                for &node in &round.ok {
                    session.txn_mut().set_node_status(node, NodeTxnStatus::Aborted);
                }
                let mut failed = round.rejected;
                failed.extend(round.lost);
                for &node in &failed {
                    session.txn_mut().set_node_status(node, NodeTxnStatus::AbortFailed);
                }
                if failed.is_empty() {
                    TxnPhaseStatus::Aborted
                } else {
                    tracing::warn!(
                        gid = %gid,
                        failed = %join_nodes(&failed),
                        reason = %round.reason,
                        "rollback failed on some nodes; manual inspection may be required"
                    );
                    if round.ok.is_empty() {
                        TxnPhaseStatus::AbortFailed
                    } else {
                        TxnPhaseStatus::PartAborted
                    }
                }
            }
            Err(e) => {
                tracing::warn!(gid = %gid, error = %e, "rollback could not be dispatched");
                TxnPhaseStatus::AbortFailed
            }
        };
        session.txn_mut().set_status(status);
        status
    }

    /// End the session's transaction with a commit, two-phase when needed.
    ///
    /// A failed prepare or a commit that reached no node is rolled back.
    /// After PartCommitted the transaction state is left in place for
    /// inspection until the session begins its next transaction.
    pub async fn commit_transaction(&self, session: &mut SessionContext) -> KestrelResult<TxnPhaseStatus> {
        let two_phase = self.uses_two_phase(session.txn());
        if !two_phase && session.txn().write_participant_count() > 1 {
            tracing::warn!(
                writers = %join_nodes(session.txn().write_nodes()),
                "committing multi-node writes without two-phase commit"
            );
        }
        let result = match self.prepare(session).await {
            Ok(_) => self.commit(session).await,
            Err(e) => Err(e),
        };
        let txn_id = session.txn().txn_id;
        let gid = session.txn().gid().map(str::to_string);
        let outcome = match &result {
            Ok(_) | Err(KestrelError::Txn(TxnError::PartiallyCommitted { .. })) => {
                GlobalOutcome::Committed
            }
            Err(e) => {
                tracing::debug!(error = %e, "commit failed, rolling back");
                self.abort(session).await;
                GlobalOutcome::Aborted
            }
        };
        if let Some(txn) = txn_id {
            session.gtm().finish(txn, gid.as_deref(), outcome);
        }
        let status = session.txn().status();
        kestrel_observability::record_txn_outcome(status.as_str(), two_phase);
        session.release_connections();
        if status != TxnPhaseStatus::PartCommitted {
            session.reset_transaction();
        }
        result
    }

    /// End the session's transaction with a rollback.
    pub async fn rollback_transaction(&self, session: &mut SessionContext) -> TxnPhaseStatus {
        let status = self.abort(session).await;
        if let Some(txn) = session.txn().txn_id {
            let gid = session.txn().gid().map(str::to_string);
            session.gtm().finish(txn, gid.as_deref(), GlobalOutcome::Aborted);
        }
        kestrel_observability::record_txn_outcome(status.as_str(), false);
        session.release_connections();
        session.reset_transaction();
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_promotes_reader() {
        let mut txn = DistributedTxnState::default();
        txn.register_read(NodeId(1));
        txn.register_read(NodeId(2));
        txn.register_write(NodeId(1));
        assert_eq!(txn.write_nodes(), &[NodeId(1)]);
        assert_eq!(txn.read_nodes(), &[NodeId(2)]);
        assert_eq!(txn.participants(), vec![NodeId(1), NodeId(2)]);
    }

    #[test]
    fn test_two_phase_needed_for_two_writers() {
        let mut txn = DistributedTxnState::default();
        txn.register_write(NodeId(1));
        assert!(!txn.requires_two_phase());
        txn.set_local_write();
        assert!(txn.requires_two_phase());
        txn.mark_temp_object_touched();
        assert!(!txn.requires_two_phase());
    }

    #[test]
    fn test_gid_is_stable() {
        let mut txn = DistributedTxnState {
            txn_id: Some(TxnId(42)),
            ..Default::default()
        };
        assert_eq!(txn.ensure_gid("kestrel"), "kestrel_42");
        txn.txn_id = Some(TxnId(43));
        assert_eq!(txn.ensure_gid("kestrel"), "kestrel_42");
        txn.reset();
        assert!(txn.gid().is_none());
    }

    #[test]
    fn test_finished_states() {
        let mut txn = DistributedTxnState::default();
        assert!(!txn.is_finished());
        txn.set_status(TxnPhaseStatus::Prepared);
        assert!(!txn.is_finished());
        for status in [
            TxnPhaseStatus::PartCommitted,
            TxnPhaseStatus::CommitFailed,
            TxnPhaseStatus::PartAborted,
        ] {
            txn.set_status(status);
            assert!(txn.is_finished(), "{}", status.as_str());
        }
    }

    #[test]
    fn test_disabled_enforcement_skips_two_phase() {
        let mut txn = DistributedTxnState::default();
        txn.register_write(NodeId(1));
        txn.register_write(NodeId(2));
        assert!(TwoPhaseCoordinator::new(true, "g").uses_two_phase(&txn));
        assert!(!TwoPhaseCoordinator::new(false, "g").uses_two_phase(&txn));
    }
}
