//! COPY through the coordinator: rows routed to their owning nodes on the
//! way in, copy-data collected from every node on the way out.

use std::collections::BTreeSet;

use bytes::Bytes;

use kestrel_common::datum::Datum;
use kestrel_common::error::KestrelResult;
use kestrel_common::types::NodeId;
use kestrel_protocol::FrontendMessage;

use crate::combiner::{CombineType, CombinerId};
use crate::connection::ConnState;
use crate::locator::{AccessType, Locator};
use crate::session::{DriveUntil, SessionContext};

/// One input line and the value of its distribution column.
#[derive(Debug, Clone, PartialEq)]
pub struct CopyRow {
    pub key: Option<Datum>,
    pub line: String,
}

impl CopyRow {
    pub fn new(key: Option<Datum>, line: impl Into<String>) -> Self {
        Self {
            key,
            line: line.into(),
        }
    }
}

async fn finish(session: &mut SessionContext, id: CombinerId) -> KestrelResult<u64> {
    session
        .run_to_completion(id)
        .await
        .map(|summary| summary.affected_rows)
}

/// `COPY ... FROM STDIN` with every row sent to the node(s) the locator
/// picks for it. Replicated tables must report the same count everywhere.
pub async fn copy_from(
    session: &mut SessionContext,
    locator: &Locator,
    sql: &str,
    rows: &[CopyRow],
) -> KestrelResult<u64> {
    let mut routes: Vec<Vec<NodeId>> = Vec::with_capacity(rows.len());
    let mut all = BTreeSet::new();
    for row in rows {
        let targets = locator.target_nodes(AccessType::Insert, row.key.as_ref())?.all();
        all.extend(targets.iter().copied());
        routes.push(targets);
    }
    if all.is_empty() {
        // No rows: every node of the relation still runs the (empty) COPY.
        all.extend(locator.info().nodes.iter().copied());
    }
    let nodes: Vec<NodeId> = all.into_iter().collect();

    session.acquire(&nodes).await?;
    session.begin_on_nodes(&nodes, true).await?;
    let combine = if locator.info().is_replicated() {
        CombineType::SameValueCheck
    } else {
        CombineType::Sum
    };
    let id = session.create_combiner(combine, None);
    if let Err(e) = session.claim_connections(id, &nodes).await {
        session.discard_combiner(id);
        return Err(e);
    }
    for &node in &nodes {
        if let Some(conn) = session.pool_mut().get_mut(node) {
            conn.send(&FrontendMessage::Query(sql.to_string()))?;
            if let Err(e) = conn.flush().await {
                tracing::warn!(node = %node, error = %e, "failed to start COPY");
            }
        }
    }
    session.drive(id, DriveUntil::AllCopyIn).await?;

    let failed = session.combiner(id).map_or(true, |c| c.has_error());
    if failed {
        // Whoever did enter copy mode is told to give up.
        for &node in &nodes {
            if let Some(conn) = session.pool_mut().get_mut(node) {
                if conn.state() == ConnState::CopyIn {
                    conn.send(&FrontendMessage::CopyFail("COPY aborted on another node".into()))?;
                    if let Err(e) = conn.flush().await {
                        tracing::warn!(node = %node, error = %e, "failed to send COPY abort");
                    }
                }
            }
        }
        return finish(session, id).await;
    }

    for (row, targets) in rows.iter().zip(&routes) {
        let data = Bytes::from(format!("{}\n", row.line));
        for node in targets {
            if let Some(conn) = session.pool_mut().get_mut(*node) {
                conn.send(&FrontendMessage::CopyData(data.clone()))?;
            }
        }
    }
    for &node in &nodes {
        if let Some(conn) = session.pool_mut().get_mut(node) {
            conn.send(&FrontendMessage::CopyDone)?;
            if let Err(e) = conn.flush().await {
                tracing::warn!(node = %node, error = %e, "failed to send COPY data");
            }
        }
    }
    let copied = finish(session, id).await?;
    tracing::debug!(rows = rows.len(), copied, nodes = nodes.len(), "copy from finished");
    Ok(copied)
}

/// `COPY ... TO STDOUT` on `nodes`; returns the lines in arrival order.
pub async fn copy_to(session: &mut SessionContext, sql: &str, nodes: &[NodeId]) -> KestrelResult<Vec<String>> {
    session.acquire(nodes).await?;
    session.begin_on_nodes(nodes, false).await?;
    let id = session.create_combiner(CombineType::None, None);
    if let Err(e) = session.claim_connections(id, nodes).await {
        session.discard_combiner(id);
        return Err(e);
    }
    for &node in nodes {
        if let Some(conn) = session.pool_mut().get_mut(node) {
            conn.send(&FrontendMessage::Query(sql.to_string()))?;
            if let Err(e) = conn.flush().await {
                tracing::warn!(node = %node, error = %e, "failed to start COPY");
            }
        }
    }
    if let Err(e) = session.drive(id, DriveUntil::AllReady).await {
        session.discard_combiner(id);
        return Err(e);
    }
    let data = session
        .combiner_mut(id)
        .map(|c| c.take_copy_out())
        .unwrap_or_default();
    session.close_combiner(id).await?;
    Ok(data
        .iter()
        .map(|d| String::from_utf8_lossy(d).trim_end_matches('\n').to_string())
        .collect())
}
