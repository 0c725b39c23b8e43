//! Remote query execution: one SQL statement shipped to a set of data nodes.

use std::time::Instant;

use kestrel_common::datum::OwnedRow;
use kestrel_common::error::{KestrelError, KestrelResult};
use kestrel_common::types::NodeId;
use kestrel_protocol::{DescribeTarget, FrontendMessage};

use crate::combiner::{CombineType, CombinerId, CombinerSummary, SortKey};
use crate::locator::ExecNodes;
use crate::session::{DriveUntil, SessionContext};

/// A statement and where to run it.
#[derive(Debug, Clone)]
pub struct RemoteStep {
    pub sql: String,
    pub exec_nodes: ExecNodes,
    pub combine: CombineType,
    pub is_write: bool,
    /// Prepared statement name; `None` uses the unnamed statement.
    pub statement_name: Option<String>,
    /// Text-format parameters bound at execution.
    pub params: Vec<Option<String>>,
    /// Per-node ordering to merge on; enables merge-sort mode.
    pub sort: Option<Vec<SortKey>>,
    /// Run outside any transaction block (no BEGIN is sent).
    pub force_autocommit: bool,
}

impl RemoteStep {
    pub fn new(sql: impl Into<String>, exec_nodes: ExecNodes) -> Self {
        Self {
            sql: sql.into(),
            exec_nodes,
            combine: CombineType::None,
            is_write: false,
            statement_name: None,
            params: Vec::new(),
            sort: None,
            force_autocommit: false,
        }
    }

    /// Mark as a write whose row counts are folded with `combine`.
    pub fn write(mut self, combine: CombineType) -> Self {
        self.is_write = true;
        self.combine = combine;
        self
    }

    pub fn with_statement(mut self, name: impl Into<String>) -> Self {
        self.statement_name = Some(name.into());
        self
    }

    pub fn with_params(mut self, params: Vec<Option<String>>) -> Self {
        self.params = params;
        self
    }

    pub fn sorted_by(mut self, keys: Vec<SortKey>) -> Self {
        self.sort = Some(keys);
        self
    }

    pub fn autocommit(mut self) -> Self {
        self.force_autocommit = true;
        self
    }

    fn wants_extended(&self) -> bool {
        self.statement_name.is_some() || !self.params.is_empty() || self.sort.is_some()
    }
}

/// Executor state for one [`RemoteStep`].
#[derive(Debug)]
pub struct RemoteQueryState {
    step: RemoteStep,
    combiner: Option<CombinerId>,
    rows: u64,
    started: Option<Instant>,
    done: bool,
}

impl RemoteQueryState {
    pub fn new(step: RemoteStep) -> Self {
        Self {
            step,
            combiner: None,
            rows: 0,
            started: None,
            done: false,
        }
    }

    pub fn step(&self) -> &RemoteStep {
        &self.step
    }

    pub fn combiner(&self) -> Option<CombinerId> {
        self.combiner
    }

    /// Column names of the result, once the first row description arrived.
    pub fn columns(&self, session: &SessionContext) -> Vec<String> {
        self.combiner
            .and_then(|id| session.combiner(id))
            .and_then(|c| c.tuple_desc())
            .map(|d| d.column_names())
            .unwrap_or_default()
    }

    /// Acquire connections, open the transaction where needed and send the
    /// statement. A primary node is run to completion before any other node
    /// is sent anything.
    pub async fn open(&mut self, session: &mut SessionContext) -> KestrelResult<()> {
        if self.combiner.is_some() {
            return Ok(());
        }
        let nodes = self.step.exec_nodes.all();
        if nodes.is_empty() {
            return Err(KestrelError::Internal(format!(
                "remote step has no target nodes: {}",
                self.step.sql
            )));
        }
        self.started = Some(Instant::now());
        session.acquire(&nodes).await?;

        let id = session.create_combiner(self.step.combine, self.step.sort.clone());
        self.combiner = Some(id);
        tracing::debug!(combiner = %id, nodes = ?nodes, sql = %self.step.sql, "remote query");

        if let Some(primary) = self.step.exec_nodes.primary {
            self.start_on(session, id, &[primary]).await?;
            session.drive(id, DriveUntil::AllReady).await?;
            if session.combiner(id).map_or(false, |c| c.has_error()) {
                tracing::debug!(combiner = %id, node = %primary, "primary failed, replicas skipped");
                return Ok(());
            }
        }
        let rest = self.step.exec_nodes.nodes.clone();
        if !rest.is_empty() {
            self.start_on(session, id, &rest).await?;
        }
        Ok(())
    }

    async fn start_on(
        &self,
        session: &mut SessionContext,
        id: CombinerId,
        nodes: &[NodeId],
    ) -> KestrelResult<()> {
        if !self.step.force_autocommit {
            session.begin_on_nodes(nodes, self.step.is_write).await?;
        }
        session.claim_connections(id, nodes).await?;
        self.dispatch(session, id, nodes).await
    }

    /// Queue the statement on every node, then flush them all. Nothing is
    /// read here.
    async fn dispatch(
        &self,
        session: &mut SessionContext,
        id: CombinerId,
        nodes: &[NodeId],
    ) -> KestrelResult<()> {
        let extended = session.config().executor.extended_protocol && self.step.wants_extended();
        let merge = self.step.sort.is_some();
        let batch = if merge && extended {
            session.config().executor.merge_sort_batch_rows
        } else {
            0
        };
        let portal = if merge && extended {
            format!("p_{}", id.0)
        } else {
            String::new()
        };
        if let Some(comb) = session.combiner_mut(id) {
            comb.set_portal(portal.clone());
            comb.set_statement(self.step.statement_name.clone());
        }

        for &node in nodes {
            let Some(conn) = session.pool_mut().get_mut(node) else {
                return Err(KestrelError::connection(node, "not held by session"));
            };
            if !extended {
                conn.send(&FrontendMessage::Query(self.step.sql.clone()))?;
            } else {
                let statement = self.step.statement_name.clone().unwrap_or_default();
                if statement.is_empty() || !conn.has_prepared(&statement) {
                    if !statement.is_empty() {
                        // A failed earlier attempt may have left it half-defined.
                        conn.send(&FrontendMessage::Close {
                            target: DescribeTarget::Statement,
                            name: statement.clone(),
                        })?;
                    }
                    conn.send(&FrontendMessage::Parse {
                        name: statement.clone(),
                        query: self.step.sql.clone(),
                        param_types: Vec::new(),
                    })?;
                    if !statement.is_empty() {
                        conn.mark_prepared(&statement);
                    }
                }
                conn.send(&FrontendMessage::Bind {
                    portal: portal.clone(),
                    statement,
                    params: self
                        .step
                        .params
                        .iter()
                        .map(|p| p.as_ref().map(|v| v.as_bytes().to_vec()))
                        .collect(),
                })?;
                conn.send(&FrontendMessage::Describe {
                    target: DescribeTarget::Portal,
                    name: portal.clone(),
                })?;
                conn.send(&FrontendMessage::Execute {
                    portal: portal.clone(),
                    max_rows: batch,
                })?;
                if batch > 0 {
                    conn.send(&FrontendMessage::Flush)?;
                } else {
                    conn.send(&FrontendMessage::Sync)?;
                }
            }
            if let Err(e) = conn.flush().await {
                tracing::warn!(node = %node, error = %e, "failed to send remote query");
            }
        }
        if batch > 0 {
            if let Some(comb) = session.combiner_mut(id) {
                for &node in nodes {
                    comb.set_needs_sync(node, true);
                }
            }
        }
        Ok(())
    }

    pub async fn next_row(&mut self, session: &mut SessionContext) -> KestrelResult<Option<OwnedRow>> {
        if self.done {
            return Ok(None);
        }
        self.open(session).await?;
        let Some(id) = self.combiner else {
            return Ok(None);
        };
        let row = session.next_row(id).await?;
        match row {
            Some(_) => self.rows += 1,
            None => self.done = true,
        }
        Ok(row)
    }

    /// Finish the statement, dropping unread rows, and surface its error.
    pub async fn close(&mut self, session: &mut SessionContext) -> KestrelResult<CombinerSummary> {
        let Some(id) = self.combiner.take() else {
            return Ok(CombinerSummary::default());
        };
        self.done = true;
        // An error already surfaced through `next_row` is not raised again
        // by the close, so collect the failed nodes first.
        let errored = session
            .combiner(id)
            .map(|c| c.errored_nodes().to_vec())
            .unwrap_or_default();
        let result = session.close_combiner(id).await;
        match &result {
            Err(e) => self.forget_statement(session, &self.step.exec_nodes.all(), &e.to_string()),
            Ok(_) if !errored.is_empty() => {
                self.forget_statement(session, &errored, "statement failed on node")
            }
            Ok(_) => {}
        }
        let elapsed = self
            .started
            .map(|t| t.elapsed().as_micros() as u64)
            .unwrap_or(0);
        let kind = if self.step.is_write { "write" } else { "read" };
        kestrel_observability::record_remote_query(
            kind,
            self.step.exec_nodes.len(),
            elapsed,
            result.is_ok(),
        );
        kestrel_observability::record_rows_fetched(self.rows);
        result
    }

    /// The statement may not be defined on `nodes`; parse it again next time.
    fn forget_statement(&self, session: &mut SessionContext, nodes: &[NodeId], reason: &str) {
        let Some(name) = self.step.statement_name.as_deref() else {
            return;
        };
        tracing::debug!(statement = name, nodes = ?nodes, reason, "forgetting prepared statement");
        for &node in nodes {
            if let Some(conn) = session.pool_mut().get_mut(node) {
                conn.forget_prepared(name);
            }
        }
    }

    /// Run the statement to completion, collecting every row.
    pub async fn execute(
        &mut self,
        session: &mut SessionContext,
    ) -> KestrelResult<(Vec<OwnedRow>, CombinerSummary)> {
        let mut rows = Vec::new();
        loop {
            match self.next_row(session).await {
                Ok(Some(row)) => rows.push(row),
                Ok(None) => break,
                Err(e) => {
                    let _ = self.close(session).await;
                    return Err(e);
                }
            }
        }
        let summary = self.close(session).await?;
        Ok((rows, summary))
    }
}

/// Run a utility statement on every node, outside row processing.
/// Returns the summed affected row count.
pub async fn execute_utility(
    session: &mut SessionContext,
    sql: &str,
    nodes: &[NodeId],
    autocommit: bool,
) -> KestrelResult<u64> {
    let mut step = RemoteStep::new(sql, ExecNodes::all_of(nodes.to_vec())).write(CombineType::Sum);
    if autocommit {
        step = step.autocommit();
    }
    let mut state = RemoteQueryState::new(step);
    let (_, summary) = state.execute(session).await?;
    Ok(summary.affected_rows)
}

/// Drop prepared statement `name` on every held connection that parsed it.
pub async fn close_statement(session: &mut SessionContext, name: &str) -> KestrelResult<()> {
    let nodes: Vec<NodeId> = session
        .pool()
        .held_nodes()
        .into_iter()
        .filter(|n| session.pool().get(*n).map_or(false, |c| c.has_prepared(name)))
        .collect();
    if nodes.is_empty() {
        return Ok(());
    }
    let id = session.create_combiner(CombineType::None, None);
    if let Err(e) = session.claim_connections(id, &nodes).await {
        session.discard_combiner(id);
        return Err(e);
    }
    for &node in &nodes {
        if let Some(conn) = session.pool_mut().get_mut(node) {
            conn.forget_prepared(name);
            conn.send(&FrontendMessage::Close {
                target: DescribeTarget::Statement,
                name: name.to_string(),
            })?;
            conn.send(&FrontendMessage::Sync)?;
            if let Err(e) = conn.flush().await {
                tracing::debug!(node = %node, error = %e, "close statement not sent");
            }
        }
    }
    session.run_to_completion(id).await.map(|_| ())
}
