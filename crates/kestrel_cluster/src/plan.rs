//! Coordinator plan nodes and their executor.
//!
//! The set of node kinds is closed; adding one means adding a match arm
//! everywhere a plan is executed.

use std::future::Future;
use std::pin::Pin;

use kestrel_common::datum::OwnedRow;
use kestrel_common::error::KestrelResult;

use crate::combiner::SortKey;
use crate::locator::ExecNodes;
use crate::remote_query::{RemoteQueryState, RemoteStep};
use crate::session::SessionContext;

/// A plan fragment shipped to data nodes as a named prepared statement.
#[derive(Debug, Clone)]
pub struct RemoteSubplan {
    /// Statement name the fragment is prepared under on each node.
    pub cursor: String,
    pub plan_text: String,
    pub exec_nodes: ExecNodes,
    pub sort: Option<Vec<SortKey>>,
    pub params: Vec<Option<String>>,
}

impl RemoteSubplan {
    fn to_step(&self) -> RemoteStep {
        let mut step = RemoteStep::new(self.plan_text.clone(), self.exec_nodes.clone())
            .with_statement(self.cursor.clone())
            .with_params(self.params.clone());
        if let Some(keys) = &self.sort {
            step = step.sorted_by(keys.clone());
        }
        step
    }
}

#[derive(Debug, Clone)]
pub enum PlanNode {
    RemoteQuery(RemoteStep),
    RemoteSubplan(RemoteSubplan),
    Limit {
        input: Box<PlanNode>,
        limit: Option<u64>,
        offset: u64,
    },
    /// Children run one after another; rows are concatenated.
    Append(Vec<PlanNode>),
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

/// Runtime state mirroring a [`PlanNode`] tree.
#[derive(Debug)]
pub enum ExecState {
    Remote(RemoteQueryState),
    Limit {
        input: Box<ExecState>,
        limit: Option<u64>,
        offset: u64,
        skipped: u64,
        emitted: u64,
        affected: u64,
        input_closed: bool,
    },
    Append {
        children: Vec<ExecState>,
        current: usize,
        affected: u64,
    },
}

impl ExecState {
    pub fn build(plan: &PlanNode) -> Self {
        match plan {
            PlanNode::RemoteQuery(step) => ExecState::Remote(RemoteQueryState::new(step.clone())),
            PlanNode::RemoteSubplan(sub) => ExecState::Remote(RemoteQueryState::new(sub.to_step())),
            PlanNode::Limit {
                input,
                limit,
                offset,
            } => ExecState::Limit {
                input: Box::new(ExecState::build(input)),
                limit: *limit,
                offset: *offset,
                skipped: 0,
                emitted: 0,
                affected: 0,
                input_closed: false,
            },
            PlanNode::Append(children) => ExecState::Append {
                children: children.iter().map(ExecState::build).collect(),
                current: 0,
                affected: 0,
            },
        }
    }

    /// Column names of the rows this node produces, as far as known.
    pub fn columns(&self, session: &SessionContext) -> Vec<String> {
        match self {
            ExecState::Remote(state) => state.columns(session),
            ExecState::Limit { input, .. } => input.columns(session),
            ExecState::Append {
                children, current, ..
            } => children
                .get(*current)
                .map(|c| c.columns(session))
                .unwrap_or_default(),
        }
    }

    pub fn next_row<'a>(
        &'a mut self,
        session: &'a mut SessionContext,
    ) -> BoxFuture<'a, KestrelResult<Option<OwnedRow>>> {
        Box::pin(async move {
            match self {
                ExecState::Remote(state) => state.next_row(session).await,
                ExecState::Limit {
                    input,
                    limit,
                    offset,
                    skipped,
                    emitted,
                    affected,
                    input_closed,
                } => {
                    if *input_closed {
                        return Ok(None);
                    }
                    loop {
                        if limit.map_or(false, |l| *emitted >= l) {
                            // Stop the remote streams; the rest is never read.
                            *input_closed = true;
                            *affected += input.close(session).await?;
                            return Ok(None);
                        }
                        let Some(row) = input.next_row(session).await? else {
                            return Ok(None);
                        };
                        if *skipped < *offset {
                            *skipped += 1;
                            continue;
                        }
                        *emitted += 1;
                        return Ok(Some(row));
                    }
                }
                ExecState::Append {
                    children,
                    current,
                    affected,
                } => {
                    while let Some(child) = children.get_mut(*current) {
                        if let Some(row) = child.next_row(session).await? {
                            return Ok(Some(row));
                        }
                        *affected += child.close(session).await?;
                        *current += 1;
                    }
                    Ok(None)
                }
            }
        })
    }

    /// Close every open remote stream. Returns the affected row count.
    pub fn close<'a>(&'a mut self, session: &'a mut SessionContext) -> BoxFuture<'a, KestrelResult<u64>> {
        Box::pin(async move {
            match self {
                ExecState::Remote(state) => Ok(state.close(session).await?.affected_rows),
                ExecState::Limit {
                    input,
                    affected,
                    input_closed,
                    ..
                } => {
                    if !*input_closed {
                        *input_closed = true;
                        *affected += input.close(session).await?;
                    }
                    Ok(*affected)
                }
                ExecState::Append {
                    children,
                    current,
                    affected,
                } => {
                    let mut first_err = None;
                    for child in children.iter_mut().skip(*current) {
                        match child.close(session).await {
                            Ok(n) => *affected += n,
                            Err(e) => {
                                first_err.get_or_insert(e);
                            }
                        }
                    }
                    *current = children.len();
                    match first_err {
                        Some(e) => Err(e),
                        None => Ok(*affected),
                    }
                }
            }
        })
    }
}

/// Materialized result of a plan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<OwnedRow>,
    pub affected: u64,
}

/// Run `plan` to completion inside the session's current transaction.
pub async fn execute_plan(session: &mut SessionContext, plan: &PlanNode) -> KestrelResult<QueryResult> {
    let mut state = ExecState::build(plan);
    let mut result = QueryResult::default();
    loop {
        match state.next_row(session).await {
            Ok(Some(row)) => {
                if result.columns.is_empty() {
                    result.columns = state.columns(session);
                }
                result.rows.push(row);
            }
            Ok(None) => break,
            Err(e) => {
                if let Err(close_err) = state.close(session).await {
                    tracing::debug!(error = %close_err, "close after failed plan");
                }
                return Err(e);
            }
        }
    }
    if result.columns.is_empty() {
        result.columns = state.columns(session);
    }
    result.affected = state.close(session).await?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::barrier::BarrierLock;
    use crate::combiner::CombineType;
    use crate::gtm::LocalGtm;
    use crate::in_process::{InProcessCluster, Reply};
    use kestrel_common::types::NodeId;

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

    fn values(result: &QueryResult) -> Vec<i64> {
        result
            .rows
            .iter()
            .filter_map(|r| r.values[0].as_i64())
            .collect()
    }

    #[tokio::test]
    async fn test_limit_with_offset_closes_early() {
        let cluster = InProcessCluster::new(&[1]);
        cluster.node(1).on("SELECT v", Reply::int_column("v", &[1, 2, 3, 4, 5]));
        let mut s = session(&cluster);
        let plan = PlanNode::Limit {
            input: Box::new(PlanNode::RemoteQuery(RemoteStep::new(
                "SELECT v",
                ExecNodes::single(NodeId(1)),
            ))),
            limit: Some(2),
            offset: 1,
        };
        let result = execute_plan(&mut s, &plan).await.unwrap();
        assert_eq!(values(&result), vec![2, 3]);
        assert_eq!(result.columns, vec!["v".to_string()]);
        assert_eq!(s.live_combiners(), 0);
        assert!(s.pool().get(NodeId(1)).unwrap().is_idle());
    }

    #[tokio::test]
    async fn test_append_concatenates_and_sums() {
        let cluster = InProcessCluster::new(&[1, 2]);
        cluster.node(1).on("SELECT v", Reply::int_column("v", &[1]));
        cluster.node(2).on("DELETE FROM t", Reply::command("DELETE 6"));
        let mut s = session(&cluster);
        let plan = PlanNode::Append(vec![
            PlanNode::RemoteQuery(RemoteStep::new("SELECT v", ExecNodes::single(NodeId(1)))),
            PlanNode::RemoteQuery(
                RemoteStep::new("DELETE FROM t", ExecNodes::single(NodeId(2))).write(CombineType::Sum),
            ),
        ]);
        let result = execute_plan(&mut s, &plan).await.unwrap();
        assert_eq!(values(&result), vec![1]);
        assert_eq!(result.affected, 6);
    }

    #[tokio::test]
    async fn test_subplan_runs_as_named_statement() {
        let cluster = InProcessCluster::new(&[1, 2]);
        cluster.node(1).on("FRAGMENT scan(t)", Reply::int_column("v", &[1, 4]));
        cluster.node(2).on("FRAGMENT scan(t)", Reply::int_column("v", &[2, 3]));
        let mut config = cluster.config();
        config.executor.extended_protocol = true;
        config.executor.merge_sort_batch_rows = 1;
        let mut s = SessionContext::new(
            Arc::new(config),
            cluster.pool_manager(),
            Arc::new(LocalGtm::new()),
            Arc::new(BarrierLock::new()),
        );
        let plan = PlanNode::RemoteSubplan(RemoteSubplan {
            cursor: "frag_1".into(),
            plan_text: "FRAGMENT scan(t)".into(),
            exec_nodes: ExecNodes::all_of(vec![NodeId(1), NodeId(2)]),
            sort: Some(vec![SortKey::asc(0)]),
            params: Vec::new(),
        });
        let result = execute_plan(&mut s, &plan).await.unwrap();
        assert_eq!(values(&result), vec![1, 2, 3, 4]);
        assert!(s.pool().get(NodeId(2)).unwrap().has_prepared("frag_1"));
    }
}
