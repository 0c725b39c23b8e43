//! Per-session execution context.
//!
//! Everything one client session needs to talk to the data nodes lives
//! here: the held connections, the live combiners (keyed by
//! [`CombinerId`]), and the distributed transaction state. Nothing is
//! global; two sessions never share a connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use kestrel_common::config::KestrelConfig;
use kestrel_common::datum::OwnedRow;
use kestrel_common::error::{KestrelError, KestrelResult};
use kestrel_common::types::{NodeId, TxnId};
use kestrel_protocol::{DescribeTarget, FrontendMessage};

use crate::barrier::BarrierLock;
use crate::combiner::{
    CombineType, CombinerId, CombinerSummary, ResponseCombiner, ResponseOutcome, SortKey,
};
use crate::connection::{ConnState, NodeConnection};
use crate::gtm::TransactionIdService;
use crate::pool::{PoolClient, PoolManager};
use crate::two_phase::DistributedTxnState;

/// Stop condition for [`SessionContext::drive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveUntil {
    /// Every connection sent ReadyForQuery or failed.
    AllReady,
    /// Every remaining connection is waiting for COPY data.
    AllCopyIn,
}

enum Step {
    Continue,
    Wait,
    Done,
}

fn unknown_combiner(id: CombinerId) -> KestrelError {
    KestrelError::internal_bug("E-SESS-001", "unknown combiner", id.to_string())
}

fn missing_connection(id: CombinerId, node: NodeId) -> KestrelError {
    KestrelError::internal_bug(
        "E-SESS-002",
        "combiner references a connection the session does not hold",
        format!("{} {}", id, node),
    )
}

/// Queue whatever a suspended portal needs so the node reaches ReadyForQuery:
/// the rest of the rows, or a Close when nobody wants them any more.
fn finish_suspended(comb: &mut ResponseCombiner, conn: &mut NodeConnection) -> KestrelResult<()> {
    let node = conn.node();
    let portal = comb.portal().unwrap_or_default().to_string();
    if comb.is_abandoned() {
        conn.send(&FrontendMessage::Close {
            target: DescribeTarget::Portal,
            name: portal,
        })?;
    } else {
        conn.send(&FrontendMessage::Execute {
            portal,
            max_rows: 0,
        })?;
    }
    conn.send(&FrontendMessage::Sync)?;
    comb.clear_suspended(node);
    comb.set_needs_sync(node, false);
    conn.set_state(ConnState::QueryActive);
    Ok(())
}

fn sync_if_needed(comb: &mut ResponseCombiner, conn: &mut NodeConnection) -> KestrelResult<()> {
    let node = conn.node();
    if comb.needs_sync(node) {
        conn.send(&FrontendMessage::Sync)?;
        comb.set_needs_sync(node, false);
        conn.set_state(ConnState::QueryActive);
    }
    Ok(())
}

async fn flush_quietly(conn: &mut NodeConnection) {
    if conn.has_pending_output() {
        if let Err(e) = conn.flush().await {
            // The connection is fatal now; the combiner drops it on its next call.
            tracing::debug!(node = %conn.node(), error = %e, "flush failed");
        }
    }
}

pub struct SessionContext {
    config: Arc<KestrelConfig>,
    pool: PoolClient,
    combiners: HashMap<CombinerId, ResponseCombiner>,
    next_combiner: u64,
    txn: DistributedTxnState,
    gtm: Arc<dyn TransactionIdService>,
    barrier: Arc<BarrierLock>,
}

impl SessionContext {
    pub fn new(
        config: Arc<KestrelConfig>,
        manager: Arc<dyn PoolManager>,
        gtm: Arc<dyn TransactionIdService>,
        barrier: Arc<BarrierLock>,
    ) -> Self {
        let pool = PoolClient::new(manager, config.executor.max_frame_bytes);
        Self {
            config,
            pool,
            combiners: HashMap::new(),
            next_combiner: 1,
            txn: DistributedTxnState::default(),
            gtm,
            barrier,
        }
    }

    pub fn config(&self) -> &KestrelConfig {
        &self.config
    }

    pub fn pool(&self) -> &PoolClient {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut PoolClient {
        &mut self.pool
    }

    pub fn gtm(&self) -> &Arc<dyn TransactionIdService> {
        &self.gtm
    }

    pub fn barrier(&self) -> &Arc<BarrierLock> {
        &self.barrier
    }

    pub fn txn(&self) -> &DistributedTxnState {
        &self.txn
    }

    pub fn txn_mut(&mut self) -> &mut DistributedTxnState {
        &mut self.txn
    }

    pub fn combiner(&self, id: CombinerId) -> Option<&ResponseCombiner> {
        self.combiners.get(&id)
    }

    pub fn combiner_mut(&mut self, id: CombinerId) -> Option<&mut ResponseCombiner> {
        self.combiners.get_mut(&id)
    }

    pub fn live_combiners(&self) -> usize {
        self.combiners.len()
    }

    pub fn create_combiner(&mut self, combine: CombineType, sort: Option<Vec<SortKey>>) -> CombinerId {
        let id = CombinerId(self.next_combiner);
        self.next_combiner += 1;
        self.combiners
            .insert(id, ResponseCombiner::new(id, combine, sort));
        id
    }

    /// Make sure the session holds a connection to every node.
    pub async fn acquire(&mut self, nodes: &[NodeId]) -> KestrelResult<()> {
        self.pool.acquire(nodes).await
    }

    /// Current top-level transaction id, allocating one on first use.
    pub fn ensure_txn_id(&mut self) -> TxnId {
        match self.txn.txn_id {
            Some(id) => id,
            None => {
                let id = self.gtm.begin_transaction();
                tracing::debug!(txn = %id, "transaction id assigned");
                self.txn.txn_id = Some(id);
                id
            }
        }
    }

    /// Hand the connections for `nodes` to combiner `id`, draining whatever
    /// combiner owned them before.
    ///
    /// Every connection is checked before any is taken, so a failure leaves
    /// none of them claimed. A connection still streaming replies for a
    /// discarded combiner is made fatal instead of being reused.
    pub async fn claim_connections(&mut self, id: CombinerId, nodes: &[NodeId]) -> KestrelResult<()> {
        if !self.combiners.contains_key(&id) {
            return Err(unknown_combiner(id));
        }
        for &node in nodes {
            let owner = self.pool.get(node).and_then(|c| c.owner());
            if owner.is_some() && owner != Some(id) {
                self.drain_and_detach(node).await?;
            }
            let conn = self
                .pool
                .get_mut(node)
                .ok_or_else(|| missing_connection(id, node))?;
            if conn.is_fatal() {
                return Err(conn.fatal_error());
            }
            if conn.owner().is_none() && !conn.is_idle() {
                conn.mark_fatal("claimed with another query's replies outstanding");
                return Err(conn.fatal_error());
            }
        }
        for &node in nodes {
            let Some(conn) = self.pool.get_mut(node) else { continue };
            if conn.owner() == Some(id) {
                continue;
            }
            conn.set_owner(Some(id));
            conn.set_state(ConnState::QueryActive);
            if let Some(comb) = self.combiners.get_mut(&id) {
                comb.add_connection(node);
            }
        }
        Ok(())
    }

    /// Consume the rest of the current owner's replies on `node` into the
    /// owner's row buffer, then detach it.
    ///
    /// A suspended portal is asked for all of its remaining rows first. On
    /// return the connection is `Idle` with no owner, or `FatalError`.
    pub async fn drain_and_detach(&mut self, node: NodeId) -> KestrelResult<()> {
        loop {
            let step = {
                let Some(conn) = self.pool.get_mut(node) else {
                    return Ok(());
                };
                let Some(owner) = conn.owner() else {
                    return Ok(());
                };
                let Some(comb) = self.combiners.get_mut(&owner) else {
                    conn.mark_fatal(format!("reply stream owned by unknown {}", owner));
                    conn.set_owner(None);
                    return Ok(());
                };
                if conn.is_fatal() {
                    comb.handle_response(conn)?;
                    conn.set_owner(None);
                    return Ok(());
                }
                tracing::debug!(node = %node, owner = %owner, "draining connection for new owner");
                comb.buffer_current_row();
                if comb.is_suspended(node) {
                    finish_suspended(comb, conn)?;
                }
                let step = match comb.handle_response(conn)? {
                    ResponseOutcome::NeedMoreData => Step::Wait,
                    ResponseOutcome::RowAvailable => {
                        comb.buffer_current_row();
                        Step::Continue
                    }
                    ResponseOutcome::PortalSuspended => {
                        finish_suspended(comb, conn)?;
                        Step::Continue
                    }
                    ResponseOutcome::ConnectionDone | ResponseOutcome::ErrorReceived => {
                        sync_if_needed(comb, conn)?;
                        Step::Continue
                    }
                    ResponseOutcome::ConnectionReady => Step::Done,
                    _ => Step::Continue,
                };
                flush_quietly(conn).await;
                step
            };
            match step {
                Step::Wait => {
                    self.wait_readable(&[node]).await?;
                }
                Step::Done => {
                    if let Some(conn) = self.pool.get_mut(node) {
                        conn.set_owner(None);
                    }
                    return Ok(());
                }
                Step::Continue => {}
            }
        }
    }

    /// Wait until at least one of `nodes` is readable, then read whatever
    /// every one of them has. Fatal connections are skipped. A receive
    /// timeout makes the silent connections fatal.
    pub async fn wait_readable(&mut self, nodes: &[NodeId]) -> KestrelResult<usize> {
        let timeout_ms = self.config.executor.receive_timeout_ms;
        let ready = {
            let conns: Vec<&NodeConnection> = self
                .pool
                .get_many(nodes)
                .into_iter()
                .filter(|c| !c.is_fatal())
                .collect();
            if conns.is_empty() {
                return Ok(0);
            }
            let any_ready = std::future::poll_fn(|cx| {
                let mut ready = false;
                for c in &conns {
                    if c.poll_read_ready(cx).is_ready() {
                        ready = true;
                    }
                }
                if ready {
                    Poll::Ready(())
                } else {
                    Poll::Pending
                }
            });
            if timeout_ms == 0 {
                any_ready.await;
                true
            } else {
                tokio::time::timeout(Duration::from_millis(timeout_ms), any_ready)
                    .await
                    .is_ok()
            }
        };

        let mut total = 0;
        for &node in nodes {
            let Some(conn) = self.pool.get_mut(node) else { continue };
            if conn.is_fatal() {
                continue;
            }
            if !ready {
                conn.mark_fatal(format!(
                    "no reply within {}ms",
                    self.config.executor.receive_timeout_ms
                ));
                continue;
            }
            match conn.read_available() {
                Ok(n) => total += n,
                Err(e) => tracing::debug!(node = %node, error = %e, "read failed"),
            }
        }
        Ok(total)
    }

    /// Consume replies for combiner `id` until `until` holds. Rows are
    /// buffered; suspended portals are finished.
    pub async fn drive(&mut self, id: CombinerId, until: DriveUntil) -> KestrelResult<()> {
        loop {
            let mut starving = Vec::new();
            {
                let Self {
                    pool, combiners, ..
                } = self;
                let comb = combiners.get_mut(&id).ok_or_else(|| unknown_combiner(id))?;
                let active = comb.active_nodes();
                let copy_ready = active
                    .iter()
                    .all(|n| pool.get(*n).map_or(false, |c| c.state() == ConnState::CopyIn));
                if active.is_empty() || (until == DriveUntil::AllCopyIn && copy_ready) {
                    return Ok(());
                }
                for node in active {
                    let conn = pool.get_mut(node).ok_or_else(|| missing_connection(id, node))?;
                    if comb.is_suspended(node) {
                        finish_suspended(comb, conn)?;
                    }
                    loop {
                        if until == DriveUntil::AllCopyIn && conn.state() == ConnState::CopyIn {
                            break;
                        }
                        match comb.handle_response(conn)? {
                            ResponseOutcome::NeedMoreData => {
                                starving.push(node);
                                break;
                            }
                            ResponseOutcome::RowAvailable => comb.buffer_current_row(),
                            ResponseOutcome::PortalSuspended => finish_suspended(comb, conn)?,
                            ResponseOutcome::ConnectionDone | ResponseOutcome::ErrorReceived => {
                                sync_if_needed(comb, conn)?;
                                if !comb.is_active(node) {
                                    break;
                                }
                            }
                            ResponseOutcome::ConnectionReady => break,
                            _ => {}
                        }
                    }
                    flush_quietly(conn).await;
                }
            }
            if !starving.is_empty() {
                self.wait_readable(&starving).await?;
            }
        }
    }

    /// Next row for the consumer: buffered rows first, then live
    /// connections. In merge-sort mode rows come out in key order.
    /// Once every connection finished, a recorded error is raised.
    pub async fn next_row(&mut self, id: CombinerId) -> KestrelResult<Option<OwnedRow>> {
        let merge = self
            .combiners
            .get(&id)
            .ok_or_else(|| unknown_combiner(id))?
            .is_merge_sort();
        if merge {
            return self.next_merged_row(id).await;
        }
        loop {
            let mut starving = Vec::new();
            {
                let Self {
                    pool, combiners, ..
                } = self;
                let comb = combiners.get_mut(&id).ok_or_else(|| unknown_combiner(id))?;
                if let Some(row) = comb.pop_buffered() {
                    return comb.decode(&row).map(Some);
                }
                let active = comb.active_nodes();
                if active.is_empty() {
                    return match comb.take_error() {
                        Some(e) => Err(e),
                        None => Ok(None),
                    };
                }
                for node in active {
                    let conn = pool.get_mut(node).ok_or_else(|| missing_connection(id, node))?;
                    if comb.is_suspended(node) {
                        finish_suspended(comb, conn)?;
                        flush_quietly(conn).await;
                    }
                    loop {
                        match comb.handle_response(conn)? {
                            ResponseOutcome::NeedMoreData => {
                                starving.push(node);
                                break;
                            }
                            ResponseOutcome::RowAvailable => {
                                let Some(row) = comb.take_current_row() else { continue };
                                return comb.decode(&row).map(Some);
                            }
                            ResponseOutcome::PortalSuspended => {
                                finish_suspended(comb, conn)?;
                                flush_quietly(conn).await;
                            }
                            ResponseOutcome::ConnectionDone | ResponseOutcome::ErrorReceived => {
                                sync_if_needed(comb, conn)?;
                                flush_quietly(conn).await;
                                if !comb.is_active(node) {
                                    break;
                                }
                            }
                            ResponseOutcome::ConnectionReady => break,
                            _ => {}
                        }
                    }
                }
            }
            if !starving.is_empty() {
                self.wait_readable(&starving).await?;
            }
        }
    }

    async fn next_merged_row(&mut self, id: CombinerId) -> KestrelResult<Option<OwnedRow>> {
        let primed = self
            .combiners
            .get_mut(&id)
            .and_then(|c| c.merge_state())
            .map_or(true, |m| m.is_primed());
        if !primed {
            let nodes = self
                .combiners
                .get(&id)
                .map(|c| c.active_nodes())
                .unwrap_or_default();
            for node in nodes {
                self.refill(id, node).await?;
            }
            if let Some(m) = self.combiners.get_mut(&id).and_then(|c| c.merge_state()) {
                m.set_primed();
            }
        }

        let popped = self
            .combiners
            .get_mut(&id)
            .and_then(|c| c.merge_state())
            .and_then(|m| m.pop());
        match popped {
            Some((node, _, row)) => {
                self.refill(id, node).await?;
                Ok(Some(row))
            }
            None => {
                self.drive(id, DriveUntil::AllReady).await?;
                let comb = self.combiners.get_mut(&id).ok_or_else(|| unknown_combiner(id))?;
                match comb.take_error() {
                    Some(e) => Err(e),
                    None => Ok(None),
                }
            }
        }
    }

    /// Push the next row of `node`'s stream into the merge heap.
    async fn refill(&mut self, id: CombinerId, node: NodeId) -> KestrelResult<()> {
        if let Some(row) = self.next_row_for(id, node).await? {
            let comb = self.combiners.get_mut(&id).ok_or_else(|| unknown_combiner(id))?;
            let slot = comb.slot_of(node).unwrap_or(usize::MAX);
            if let Some(m) = comb.merge_state() {
                m.push(node, slot, row);
            }
        }
        Ok(())
    }

    /// Next row of one node's stream. Suspended portals are resumed one
    /// batch at a time (Execute with a row limit, then Flush).
    pub async fn next_row_for(&mut self, id: CombinerId, node: NodeId) -> KestrelResult<Option<OwnedRow>> {
        let batch = self.config.executor.merge_sort_batch_rows;
        loop {
            let wait = {
                let Self {
                    pool, combiners, ..
                } = self;
                let comb = combiners.get_mut(&id).ok_or_else(|| unknown_combiner(id))?;
                if let Some(row) = comb.pop_buffered_for(node) {
                    return comb.decode(&row).map(Some);
                }
                if !comb.is_active(node) {
                    return Ok(None);
                }
                let conn = pool.get_mut(node).ok_or_else(|| missing_connection(id, node))?;
                if comb.is_suspended(node) {
                    let portal = comb.portal().unwrap_or_default().to_string();
                    conn.send(&FrontendMessage::Execute {
                        portal,
                        max_rows: batch,
                    })?;
                    conn.send(&FrontendMessage::Flush)?;
                    comb.clear_suspended(node);
                    comb.set_needs_sync(node, true);
                    conn.set_state(ConnState::QueryActive);
                    flush_quietly(conn).await;
                }
                match comb.handle_response(conn)? {
                    ResponseOutcome::NeedMoreData => true,
                    ResponseOutcome::RowAvailable => {
                        if let Some(row) = comb.take_current_row() {
                            return comb.decode(&row).map(Some);
                        }
                        false
                    }
                    ResponseOutcome::ConnectionDone | ResponseOutcome::ErrorReceived => {
                        sync_if_needed(comb, conn)?;
                        flush_quietly(conn).await;
                        false
                    }
                    _ => false,
                }
            };
            if wait {
                self.wait_readable(&[node]).await?;
            }
        }
    }

    /// Drive combiner `id` to completion and close it.
    pub async fn run_to_completion(&mut self, id: CombinerId) -> KestrelResult<CombinerSummary> {
        if let Err(e) = self.drive(id, DriveUntil::AllReady).await {
            self.discard_combiner(id);
            return Err(e);
        }
        self.close_combiner(id).await
    }

    /// Finish and remove combiner `id`.
    ///
    /// Unconsumed rows are dropped: suspended portals are closed, the rest
    /// of every stream is read and discarded. Surfaces any pending error.
    pub async fn close_combiner(&mut self, id: CombinerId) -> KestrelResult<CombinerSummary> {
        let active = {
            let comb = self.combiners.get_mut(&id).ok_or_else(|| unknown_combiner(id))?;
            comb.active_count()
        };
        if active > 0 {
            if let Some(comb) = self.combiners.get_mut(&id) {
                tracing::debug!(combiner = %id, active, "closing combiner early");
                comb.abandon();
            }
            if let Err(e) = self.drive(id, DriveUntil::AllReady).await {
                self.discard_combiner(id);
                return Err(e);
            }
        }
        let mut comb = self.combiners.remove(&id).ok_or_else(|| unknown_combiner(id))?;
        self.detach_all(id);
        comb.validate()
    }

    /// Drop combiner `id` without validating it.
    pub fn discard_combiner(&mut self, id: CombinerId) {
        if self.combiners.remove(&id).is_some() {
            self.detach_all(id);
        }
    }

    fn detach_all(&mut self, id: CombinerId) {
        for conn in self.pool.connections_mut() {
            if conn.owner() == Some(id) {
                conn.set_owner(None);
                if !conn.is_idle() {
                    // Replies may still be in flight; never reuse.
                    conn.mark_dirty();
                }
            }
        }
    }

    /// Start a new top-level transaction if the previous one has ended.
    ///
    /// A partially committed transaction keeps its state until this point;
    /// the GTM still holds its in-doubt record afterwards.
    pub fn begin_transaction(&mut self) {
        if self.txn.is_finished() {
            tracing::debug!(
                status = self.txn.status().as_str(),
                gid = self.txn.gid().unwrap_or_default(),
                "previous transaction state dropped"
            );
            self.txn.reset();
        }
    }

    /// Open a transaction block on each node that is not a participant yet.
    /// New nodes are registered as readers or writers.
    pub async fn begin_on_nodes(&mut self, nodes: &[NodeId], write: bool) -> KestrelResult<()> {
        self.begin_transaction();
        let fresh: Vec<NodeId> = nodes
            .iter()
            .copied()
            .filter(|n| !self.txn.is_participant(*n))
            .collect();
        for &node in nodes {
            if write {
                self.txn.register_write(node);
            } else if !self.txn.is_participant(node) {
                self.txn.register_read(node);
            }
        }
        if fresh.is_empty() {
            return Ok(());
        }
        let txn_id = self.ensure_txn_id();
        self.acquire(&fresh).await?;
        let id = self.create_combiner(CombineType::None, None);
        if let Err(e) = self.claim_connections(id, &fresh).await {
            self.discard_combiner(id);
            return Err(e);
        }
        let send_gxid = self.config.executor.send_gxid;
        for &node in &fresh {
            let conn = self
                .pool
                .get_mut(node)
                .ok_or_else(|| missing_connection(id, node))?;
            if send_gxid {
                conn.send(&FrontendMessage::GlobalXid(txn_id.0))?;
            }
            conn.send(&FrontendMessage::Query("BEGIN".into()))?;
            flush_quietly(conn).await;
        }
        tracing::debug!(txn = %txn_id, nodes = ?fresh, "transaction block opened");
        self.run_to_completion(id).await.map(|_| ())
    }

    /// Cancel whatever the session's connections are running.
    ///
    /// Sends cancel requests through the pool manager, drains every stream,
    /// and marks the connections dirty so they are not pooled again.
    pub async fn cancel_query(&mut self, reason: &str) -> KestrelError {
        let busy: Vec<(NodeId, Option<crate::pool::CancelKey>)> = self
            .pool
            .connections_mut()
            .filter(|c| !c.is_fatal() && c.owner().is_some())
            .map(|c| (c.node(), c.cancel_key()))
            .collect();
        let manager = self.pool.manager().clone();
        for (node, key) in &busy {
            if let Some(key) = key {
                if let Err(e) = manager.cancel(*node, *key).await {
                    tracing::warn!(node = %node, error = %e, "cancel request failed");
                }
            }
        }
        let mut owners: Vec<CombinerId> = self
            .pool
            .connections_mut()
            .filter_map(|c| c.owner())
            .collect();
        owners.sort();
        owners.dedup();
        for id in owners {
            if let Some(comb) = self.combiners.get_mut(&id) {
                comb.abandon();
            }
            if let Err(e) = self.drive(id, DriveUntil::AllReady).await {
                tracing::debug!(combiner = %id, error = %e, "drain after cancel failed");
            }
            self.discard_combiner(id);
        }
        for conn in self.pool.connections_mut() {
            conn.mark_dirty();
        }
        tracing::info!(nodes = busy.len(), reason, "query canceled");
        KestrelError::QueryCanceled(reason.to_string())
    }

    /// Return every connection to the pool manager.
    pub fn release_connections(&mut self) -> (usize, usize) {
        self.combiners.clear();
        self.pool.release_all()
    }

    /// Forget the finished transaction.
    pub fn reset_transaction(&mut self) {
        self.txn.reset();
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("held", &self.pool.held_nodes())
            .field("combiners", &self.combiners.len())
            .field("txn", &self.txn)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gtm::LocalGtm;
    use crate::in_process::{InProcessCluster, JournalEvent, Reply};

    fn session(cluster: &Arc<InProcessCluster>) -> SessionContext {
        let mut config = cluster.config();
        config.executor.receive_timeout_ms = 2_000;
        SessionContext::new(
            Arc::new(config),
            cluster.pool_manager(),
            Arc::new(LocalGtm::new()),
            Arc::new(BarrierLock::new()),
        )
    }

    async fn query(s: &mut SessionContext, id: CombinerId, nodes: &[NodeId], sql: &str) {
        s.acquire(nodes).await.unwrap();
        s.claim_connections(id, nodes).await.unwrap();
        for &n in nodes {
            let conn = s.pool_mut().get_mut(n).unwrap();
            conn.send(&FrontendMessage::Query(sql.into())).unwrap();
            conn.flush().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_rows_stream_from_all_nodes() {
        let cluster = InProcessCluster::new(&[1, 2]);
        cluster.node(1).on("SELECT v", Reply::int_column("v", &[1, 2]));
        cluster.node(2).on("SELECT v", Reply::int_column("v", &[3]));
        let mut s = session(&cluster);
        let id = s.create_combiner(CombineType::None, None);
        query(&mut s, id, &[NodeId(1), NodeId(2)], "SELECT v").await;

        let mut seen = Vec::new();
        while let Some(row) = s.next_row(id).await.unwrap() {
            seen.push(row.values[0].as_i64().unwrap());
        }
        seen.sort();
        assert_eq!(seen, vec![1, 2, 3]);
        s.close_combiner(id).await.unwrap();
        assert_eq!(s.live_combiners(), 0);
    }

    #[tokio::test]
    async fn test_drain_and_detach_buffers_previous_owner() {
        let cluster = InProcessCluster::new(&[1]);
        cluster.node(1).on("SELECT v", Reply::int_column("v", &[7, 8, 9]));
        cluster.node(1).on("SELECT 2", Reply::int_column("x", &[2]));
        let mut s = session(&cluster);
        let first = s.create_combiner(CombineType::None, None);
        query(&mut s, first, &[NodeId(1)], "SELECT v").await;
        assert_eq!(s.next_row(first).await.unwrap().unwrap().values[0].as_i64(), Some(7));

        let second = s.create_combiner(CombineType::None, None);
        query(&mut s, second, &[NodeId(1)], "SELECT 2").await;
        assert_eq!(s.combiner(first).unwrap().buffered_len(), 2);
        assert_eq!(s.pool().get(NodeId(1)).unwrap().owner(), Some(second));

        assert_eq!(s.next_row(second).await.unwrap().unwrap().values[0].as_i64(), Some(2));
        assert_eq!(s.next_row(first).await.unwrap().unwrap().values[0].as_i64(), Some(8));
        assert_eq!(s.next_row(first).await.unwrap().unwrap().values[0].as_i64(), Some(9));
        assert!(s.next_row(first).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_discarded_stream_is_never_claimed() {
        let cluster = InProcessCluster::new(&[1, 2]);
        cluster.node(2).on("SELECT v", Reply::int_column("v", &[1, 2]));
        let mut s = session(&cluster);
        s.acquire(&[NodeId(1), NodeId(2)]).await.unwrap();
        let first = s.create_combiner(CombineType::None, None);
        query(&mut s, first, &[NodeId(2)], "SELECT v").await;
        s.discard_combiner(first);
        let left = s.pool().get(NodeId(2)).unwrap();
        assert!(left.owner().is_none());
        assert!(left.is_dirty());
        assert!(!left.is_idle());

        let second = s.create_combiner(CombineType::None, None);
        let err = s
            .claim_connections(second, &[NodeId(1), NodeId(2)])
            .await
            .unwrap_err();
        assert!(matches!(err, KestrelError::Connection { node: NodeId(2), .. }));
        assert!(s.pool().get(NodeId(2)).unwrap().is_fatal());

        // Nothing was claimed, not even the healthy connection.
        let healthy = s.pool().get(NodeId(1)).unwrap();
        assert!(healthy.owner().is_none());
        assert!(healthy.is_idle());
        assert!(s.combiner(second).unwrap().active_nodes().is_empty());
        s.discard_combiner(second);
        assert_eq!(s.release_connections(), (2, 1));
    }

    #[tokio::test]
    async fn test_receive_timeout_marks_connection_fatal() {
        let cluster = InProcessCluster::new(&[1]);
        cluster.node(1).on("SELECT pg_sleep", Reply::Hang);
        let mut config = cluster.config();
        config.executor.receive_timeout_ms = 20;
        let mut s = SessionContext::new(
            Arc::new(config),
            cluster.pool_manager(),
            Arc::new(LocalGtm::new()),
            Arc::new(BarrierLock::new()),
        );
        let id = s.create_combiner(CombineType::None, None);
        query(&mut s, id, &[NodeId(1)], "SELECT pg_sleep(10)").await;
        let err = s.run_to_completion(id).await.unwrap_err();
        assert!(matches!(err, KestrelError::Connection { .. }));
        assert!(s.pool().get(NodeId(1)).unwrap().is_fatal());
        assert_eq!(s.release_connections(), (1, 1));
    }

    #[tokio::test]
    async fn test_cancel_drains_and_dirties() {
        let cluster = InProcessCluster::new(&[1, 2]);
        cluster.on_all("SELECT pg_sleep", Reply::Hang);
        let manager = cluster.pool_manager();
        let mut s = SessionContext::new(
            Arc::new(cluster.config()),
            manager.clone(),
            Arc::new(LocalGtm::new()),
            Arc::new(BarrierLock::new()),
        );
        let id = s.create_combiner(CombineType::None, None);
        query(&mut s, id, &[NodeId(1), NodeId(2)], "SELECT pg_sleep(60)").await;
        let err = s.cancel_query("user request").await;
        assert_eq!(err.sqlstate(), "57014");
        let cancels = cluster
            .journal()
            .iter()
            .filter(|e| e.event == JournalEvent::Cancel)
            .count();
        assert_eq!(cancels, 2);
        assert!(s.pool().get(NodeId(1)).unwrap().is_idle());
        s.release_connections();
        assert_eq!(manager.discarded(), 2);
    }

    #[tokio::test]
    async fn test_begin_only_on_new_participants() {
        let cluster = InProcessCluster::new(&[1, 2]);
        let mut s = session(&cluster);
        s.begin_on_nodes(&[NodeId(1)], false).await.unwrap();
        s.begin_on_nodes(&[NodeId(1), NodeId(2)], true).await.unwrap();
        assert_eq!(cluster.queries(1), vec!["BEGIN".to_string()]);
        assert_eq!(cluster.queries(2), vec!["BEGIN".to_string()]);
        assert_eq!(s.txn().write_nodes(), &[NodeId(1), NodeId(2)]);
        let gxids = cluster
            .journal()
            .iter()
            .filter(|e| matches!(e.event, JournalEvent::GlobalXid(_)))
            .count();
        assert_eq!(gxids, 2);
    }
}
