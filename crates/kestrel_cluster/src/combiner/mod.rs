//! Response combiner.
//!
//! One combiner per logical remote operation. It consumes the replies of
//! every connection it was given, one message per `handle_response` call,
//! and folds them into a single outcome: a row stream, a combined affected
//! row count, copy acknowledgements, and at most one surfaced error.
//!
//! # Invariants
//! - A connection is counted done exactly once: on ReadyForQuery, or when
//!   it is found in `FatalError` (never read again after that).
//! - After an error, data rows are dropped but completion is still counted
//!   until every connection reaches its terminal message.
//! - Remote errors: first one wins, unless the stored one is producer-side.

mod buffer;
mod merge;
mod tuple;

use std::collections::HashSet;

use bytes::Bytes;

use kestrel_common::datum::OwnedRow;
use kestrel_common::error::{
    ClusterError, KestrelError, KestrelResult, ProtocolError, RemoteError,
};
use kestrel_common::types::NodeId;
use kestrel_protocol::{command_row_count, BackendMessage};

use crate::connection::{ConnState, NodeConnection};

use buffer::RowBuffer;
pub(crate) use merge::MergeState;
pub use merge::{compare_rows, SortKey};
pub use tuple::{RemoteRow, TupleDesc};

/// Non-owning handle on a combiner held by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CombinerId(pub u64);

impl std::fmt::Display for CombinerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "combiner:{}", self.0)
    }
}

/// How CommandComplete row counts from several nodes are folded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombineType {
    None,
    Sum,
    /// Every node must report the same count (replicated writes).
    SameValueCheck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombinerState {
    Uninitialized,
    Receiving,
    Complete,
    Failed,
}

/// Kind of reply stream established by the first typed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestType {
    Unset,
    Command,
    Query,
    CopyIn,
    CopyOut,
}

impl RequestType {
    fn name(self) -> &'static str {
        match self {
            RequestType::Unset => "none",
            RequestType::Command => "command",
            RequestType::Query => "rows",
            RequestType::CopyIn => "copy in",
            RequestType::CopyOut => "copy out",
        }
    }
}

/// Result of consuming (at most) one message from one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// No complete message buffered; read more from the socket.
    NeedMoreData,
    /// First row description of the operation.
    TupleDesc,
    /// A row is staged; take it before calling again.
    RowAvailable,
    /// CommandComplete consumed, or the connection is fatal and was dropped.
    ConnectionDone,
    PortalSuspended,
    CopyModeEntered,
    ErrorReceived,
    /// ReadyForQuery: this connection's contribution is over.
    ConnectionReady,
    BarrierAck(String),
    /// Acknowledgement or notice with nothing to report.
    Absorbed,
}

#[derive(Debug)]
enum PendingError {
    Remote(RemoteError),
    Local(KestrelError),
}

impl PendingError {
    fn is_producer_error(&self) -> bool {
        matches!(self, PendingError::Remote(e) if e.is_producer_error())
    }

    fn into_error(self) -> KestrelError {
        match self {
            PendingError::Remote(e) => KestrelError::Remote(e),
            PendingError::Local(e) => e,
        }
    }
}

/// Counters reported when a combiner is closed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CombinerSummary {
    pub node_count: usize,
    pub command_complete_count: usize,
    pub description_count: usize,
    pub copy_in_count: usize,
    pub copy_out_count: usize,
    pub ready_count: usize,
    pub affected_rows: u64,
    pub errored_nodes: Vec<NodeId>,
    pub fatal_nodes: Vec<NodeId>,
}

#[derive(Debug)]
pub struct ResponseCombiner {
    id: CombinerId,
    /// Active connections. In merge-sort mode slots are nulled, not removed,
    /// so slot indexes stay stable.
    connections: Vec<Option<NodeId>>,
    finished: Vec<NodeId>,
    node_count: usize,
    combine: CombineType,
    request_type: RequestType,
    command_complete_count: usize,
    description_count: usize,
    copy_in_count: usize,
    copy_out_count: usize,
    ready_count: usize,
    affected_rows: u64,
    expected_rows: Option<u64>,
    tuple_desc: Option<TupleDesc>,
    current_row: Option<RemoteRow>,
    buffer: RowBuffer,
    pending: Option<PendingError>,
    error_surfaced: bool,
    errored_nodes: Vec<NodeId>,
    fatal_nodes: Vec<(NodeId, String)>,
    merge: Option<MergeState>,
    copy_out: Vec<Bytes>,
    suspended: HashSet<NodeId>,
    /// Nodes with an extended-protocol exchange that still needs a Sync.
    needs_sync: HashSet<NodeId>,
    portal: Option<String>,
    statement: Option<String>,
    abandoned: bool,
    state: CombinerState,
}

impl ResponseCombiner {
    pub fn new(id: CombinerId, combine: CombineType, sort: Option<Vec<SortKey>>) -> Self {
        let merge = sort.map(MergeState::new);
        Self {
            id,
            connections: Vec::new(),
            finished: Vec::new(),
            node_count: 0,
            combine,
            request_type: RequestType::Unset,
            command_complete_count: 0,
            description_count: 0,
            copy_in_count: 0,
            copy_out_count: 0,
            ready_count: 0,
            affected_rows: 0,
            expected_rows: None,
            tuple_desc: None,
            current_row: None,
            buffer: RowBuffer::new(merge.is_some()),
            pending: None,
            error_surfaced: false,
            errored_nodes: Vec::new(),
            fatal_nodes: Vec::new(),
            merge,
            copy_out: Vec::new(),
            suspended: HashSet::new(),
            needs_sync: HashSet::new(),
            portal: None,
            statement: None,
            abandoned: false,
            state: CombinerState::Uninitialized,
        }
    }

    pub fn id(&self) -> CombinerId {
        self.id
    }

    pub fn state(&self) -> CombinerState {
        self.state
    }

    pub fn combine_type(&self) -> CombineType {
        self.combine
    }

    pub fn is_merge_sort(&self) -> bool {
        self.merge.is_some()
    }

    /// Add a connection to the set this combiner waits on.
    pub fn add_connection(&mut self, node: NodeId) {
        self.connections.push(Some(node));
        self.node_count += 1;
        if self.state == CombinerState::Uninitialized {
            self.state = CombinerState::Receiving;
        }
    }

    /// Nodes that have not yet reached their terminal message.
    pub fn active_nodes(&self) -> Vec<NodeId> {
        self.connections.iter().flatten().copied().collect()
    }

    pub fn active_count(&self) -> usize {
        self.connections.iter().flatten().count()
    }

    /// Slot of `node` in the connection list (merge sort tie-break).
    pub fn slot_of(&self, node: NodeId) -> Option<usize> {
        self.connections.iter().position(|c| *c == Some(node))
    }

    pub fn is_active(&self, node: NodeId) -> bool {
        self.slot_of(node).is_some()
    }

    pub fn finished_nodes(&self) -> &[NodeId] {
        &self.finished
    }

    pub fn tuple_desc(&self) -> Option<&TupleDesc> {
        self.tuple_desc.as_ref()
    }

    pub fn affected_rows(&self) -> u64 {
        self.affected_rows
    }

    pub fn copy_in_count(&self) -> usize {
        self.copy_in_count
    }

    pub fn command_complete_count(&self) -> usize {
        self.command_complete_count
    }

    pub fn errored_nodes(&self) -> &[NodeId] {
        &self.errored_nodes
    }

    pub fn fatal_nodes(&self) -> Vec<NodeId> {
        self.fatal_nodes.iter().map(|(n, _)| *n).collect()
    }

    pub fn has_error(&self) -> bool {
        self.pending.is_some()
    }

    pub fn set_portal(&mut self, portal: impl Into<String>) {
        self.portal = Some(portal.into());
    }

    pub fn portal(&self) -> Option<&str> {
        self.portal.as_deref()
    }

    pub fn set_statement(&mut self, statement: Option<String>) {
        self.statement = statement;
    }

    pub fn statement(&self) -> Option<&str> {
        self.statement.as_deref()
    }

    pub fn is_suspended(&self, node: NodeId) -> bool {
        self.suspended.contains(&node)
    }

    pub fn clear_suspended(&mut self, node: NodeId) {
        self.suspended.remove(&node);
    }

    pub fn needs_sync(&self, node: NodeId) -> bool {
        self.needs_sync.contains(&node)
    }

    pub fn set_needs_sync(&mut self, node: NodeId, needed: bool) {
        if needed {
            self.needs_sync.insert(node);
        } else {
            self.needs_sync.remove(&node);
        }
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned
    }

    /// Stop delivering rows; the remaining replies are consumed and dropped.
    pub fn abandon(&mut self) {
        self.abandoned = true;
        self.current_row = None;
        self.buffer.clear();
        if let Some(m) = self.merge.as_mut() {
            m.clear();
        }
    }

    pub(crate) fn merge_state(&mut self) -> Option<&mut MergeState> {
        self.merge.as_mut()
    }

    pub fn take_current_row(&mut self) -> Option<RemoteRow> {
        self.current_row.take()
    }

    /// Move the staged row into the row buffer (drain side-trip).
    pub fn buffer_current_row(&mut self) {
        if let Some(row) = self.current_row.take() {
            self.buffer.push(row);
        }
    }

    pub fn pop_buffered(&mut self) -> Option<RemoteRow> {
        self.buffer.pop()
    }

    pub fn pop_buffered_for(&mut self, node: NodeId) -> Option<RemoteRow> {
        self.buffer.pop_for(node)
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn total_buffered(&self) -> u64 {
        self.buffer.total_buffered()
    }

    pub fn take_copy_out(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.copy_out)
    }

    pub fn decode(&self, row: &RemoteRow) -> KestrelResult<OwnedRow> {
        let desc = self.tuple_desc.as_ref().ok_or_else(|| {
            KestrelError::internal_bug(
                "E-COMB-001",
                "data row received before row description",
                format!("{} {}", self.id, row.node),
            )
        })?;
        desc.decode_row(&row.payload)
    }

    /// Surface the recorded error once. Later calls return `None`.
    pub fn take_error(&mut self) -> Option<KestrelError> {
        let err = self.pending.take()?;
        self.error_surfaced = true;
        self.state = CombinerState::Failed;
        Some(err.into_error())
    }

    /// Record an error raised by the coordinator itself.
    pub fn record_local_error(&mut self, err: KestrelError) {
        tracing::debug!(combiner = %self.id, error = %err, "local error recorded");
        match &self.pending {
            Some(p) if !p.is_producer_error() => {}
            _ => self.pending = Some(PendingError::Local(err)),
        }
    }

    fn record_remote_error(&mut self, err: RemoteError) {
        match &self.pending {
            None => self.pending = Some(PendingError::Remote(err)),
            Some(p) if p.is_producer_error() => {
                tracing::debug!(
                    combiner = %self.id,
                    code = %err.code,
                    "producer-side error replaced by node error"
                );
                self.pending = Some(PendingError::Remote(err));
            }
            Some(_) => {}
        }
    }

    fn check_request_type(&mut self, wanted: RequestType) -> bool {
        if self.request_type == RequestType::Unset || self.request_type == wanted {
            self.request_type = wanted;
            return true;
        }
        let err = ProtocolError::ResponseTypeChanged {
            from: self.request_type.name(),
            to: wanted.name(),
        };
        self.record_local_error(err.into());
        false
    }

    fn remove_connection(&mut self, node: NodeId) {
        if let Some(slot) = self.slot_of(node) {
            if self.merge.is_some() {
                self.connections[slot] = None;
            } else {
                self.connections.swap_remove(slot);
            }
            self.finished.push(node);
        }
        self.suspended.remove(&node);
        self.needs_sync.remove(&node);
    }

    fn drop_fatal(&mut self, conn: &mut NodeConnection) {
        let node = conn.node();
        if self.is_active(node) {
            let reason = conn
                .last_error()
                .unwrap_or("connection is in fatal state")
                .to_string();
            tracing::debug!(combiner = %self.id, node = %node, "fatal connection dropped from combiner");
            self.fatal_nodes.push((node, reason));
            self.remove_connection(node);
        }
        if conn.owner() == Some(self.id) {
            conn.set_owner(None);
        }
    }

    /// Consume at most one message from `conn`.
    ///
    /// Never reads the socket; the caller fills the input buffer and calls
    /// again on `NeedMoreData`.
    pub fn handle_response(&mut self, conn: &mut NodeConnection) -> KestrelResult<ResponseOutcome> {
        let node = conn.node();
        if conn.is_fatal() {
            self.drop_fatal(conn);
            return Ok(ResponseOutcome::ConnectionDone);
        }

        let frame = match conn.try_parse_one_message() {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(ResponseOutcome::NeedMoreData),
            Err(_) => {
                self.drop_fatal(conn);
                return Ok(ResponseOutcome::ConnectionDone);
            }
        };

        let msg = match BackendMessage::decode(&frame) {
            Ok(msg) => msg,
            Err(e) => {
                conn.mark_fatal(format!("undecodable '{}' message: {}", frame.tag_char(), e));
                self.record_local_error(e.into());
                self.drop_fatal(conn);
                return Ok(ResponseOutcome::ConnectionDone);
            }
        };
        tracing::trace!(combiner = %self.id, node = %node, tag = %frame.tag_char(), "response");

        match msg {
            BackendMessage::RowDescription(fields) => {
                self.description_count += 1;
                if !self.check_request_type(RequestType::Query) {
                    return Ok(ResponseOutcome::Absorbed);
                }
                let desc = TupleDesc::new(fields);
                match &self.tuple_desc {
                    None => {
                        self.tuple_desc = Some(desc);
                        Ok(ResponseOutcome::TupleDesc)
                    }
                    Some(existing) if *existing == desc => Ok(ResponseOutcome::Absorbed),
                    Some(_) => {
                        self.record_local_error(
                            ProtocolError::UnexpectedResponse(format!(
                                "row description from {} differs from the first one",
                                node
                            ))
                            .into(),
                        );
                        Ok(ResponseOutcome::Absorbed)
                    }
                }
            }
            BackendMessage::DataRow(payload) => {
                if self.pending.is_some() || self.abandoned {
                    return Ok(ResponseOutcome::Absorbed);
                }
                if !self.check_request_type(RequestType::Query) {
                    return Ok(ResponseOutcome::Absorbed);
                }
                if self.current_row.is_some() {
                    return Err(KestrelError::internal_bug(
                        "E-COMB-002",
                        "data row received while the previous one is unconsumed",
                        format!("{} {}", self.id, node),
                    ));
                }
                self.current_row = Some(RemoteRow { node, payload });
                Ok(ResponseOutcome::RowAvailable)
            }
            BackendMessage::CommandComplete(tag) => {
                if self.request_type == RequestType::Unset {
                    self.request_type = RequestType::Command;
                }
                self.command_complete_count += 1;
                let rows = command_row_count(&tag);
                match self.combine {
                    CombineType::None => {}
                    CombineType::Sum => self.affected_rows += rows.unwrap_or(0),
                    CombineType::SameValueCheck => {
                        if let Some(got) = rows {
                            match self.expected_rows {
                                None => {
                                    self.expected_rows = Some(got);
                                    self.affected_rows = got;
                                }
                                Some(expected) if expected != got => {
                                    tracing::warn!(
                                        combiner = %self.id,
                                        node = %node,
                                        expected,
                                        got,
                                        "replicated write diverged"
                                    );
                                    self.record_local_error(
                                        ClusterError::ReplicatedWriteDiverged { node, expected, got }
                                            .into(),
                                    );
                                }
                                Some(_) => {}
                            }
                        }
                    }
                }
                self.suspended.remove(&node);
                conn.set_state(ConnState::Idle);
                Ok(ResponseOutcome::ConnectionDone)
            }
            BackendMessage::PortalSuspended => {
                self.suspended.insert(node);
                conn.set_state(ConnState::Idle);
                Ok(ResponseOutcome::PortalSuspended)
            }
            BackendMessage::CopyInResponse { .. } => {
                self.copy_in_count += 1;
                if self.check_request_type(RequestType::CopyIn) {
                    conn.set_state(ConnState::CopyIn);
                }
                Ok(ResponseOutcome::CopyModeEntered)
            }
            BackendMessage::CopyOutResponse { .. } => {
                self.copy_out_count += 1;
                if self.check_request_type(RequestType::CopyOut) {
                    conn.set_state(ConnState::CopyOut);
                }
                Ok(ResponseOutcome::CopyModeEntered)
            }
            BackendMessage::CopyData(data) => {
                if self.check_request_type(RequestType::CopyOut) && self.pending.is_none() {
                    self.copy_out.push(data);
                }
                Ok(ResponseOutcome::Absorbed)
            }
            BackendMessage::CopyDone => Ok(ResponseOutcome::Absorbed),
            BackendMessage::ErrorResponse(fields) => {
                let mut err = RemoteError::new(fields.code, fields.message).from_node(node);
                err.detail = fields.detail;
                tracing::debug!(combiner = %self.id, node = %node, code = %err.code, "node reported error");
                self.record_remote_error(err);
                self.errored_nodes.push(node);
                self.suspended.remove(&node);
                conn.set_state(ConnState::QueryActive);
                Ok(ResponseOutcome::ErrorReceived)
            }
            BackendMessage::ReadyForQuery(status) => {
                self.ready_count += 1;
                conn.set_txn_status(status);
                conn.set_state(ConnState::Idle);
                if conn.owner() == Some(self.id) {
                    conn.set_owner(None);
                }
                self.remove_connection(node);
                if self.active_count() == 0 && self.pending.is_none() {
                    self.state = CombinerState::Complete;
                }
                Ok(ResponseOutcome::ConnectionReady)
            }
            BackendMessage::BarrierAck(id) => Ok(ResponseOutcome::BarrierAck(id)),
            BackendMessage::ParseComplete
            | BackendMessage::BindComplete
            | BackendMessage::CloseComplete
            | BackendMessage::NoData
            | BackendMessage::EmptyQueryResponse
            | BackendMessage::ParameterStatus { .. } => Ok(ResponseOutcome::Absorbed),
            BackendMessage::NoticeResponse(text) => {
                tracing::debug!(node = %node, notice = %text, "notice from data node");
                Ok(ResponseOutcome::Absorbed)
            }
            BackendMessage::Authentication(_) | BackendMessage::BackendKeyData { .. } => {
                let err = ProtocolError::UnexpectedMessage {
                    tag: frame.tag_char(),
                    state: "receiving query results".into(),
                };
                conn.mark_fatal(err.to_string());
                self.record_local_error(err.into());
                self.drop_fatal(conn);
                Ok(ResponseOutcome::ConnectionDone)
            }
        }
    }

    /// Check completeness and surface any unsurfaced error.
    ///
    /// Every participating connection must have sent its CommandComplete
    /// (copy-in rounds additionally their CopyInResponse), unless the
    /// combiner was abandoned or its error was already surfaced.
    pub fn validate(&mut self) -> KestrelResult<CombinerSummary> {
        if let Some(err) = self.take_error() {
            return Err(err);
        }
        if let Some((node, reason)) = self.fatal_nodes.first() {
            self.state = CombinerState::Failed;
            return Err(KestrelError::connection(*node, reason.clone()));
        }
        if !self.error_surfaced && !self.abandoned {
            if self.active_count() > 0 {
                self.state = CombinerState::Failed;
                return Err(KestrelError::internal_bug(
                    "E-COMB-003",
                    "combiner closed with connections still active",
                    format!("{} active={:?}", self.id, self.active_nodes()),
                ));
            }
            let complete = match self.request_type {
                RequestType::CopyIn => {
                    self.copy_in_count == self.node_count
                        && self.command_complete_count == self.node_count
                }
                RequestType::Unset => self.ready_count >= self.node_count,
                _ => self.command_complete_count == self.node_count,
            };
            if !complete {
                self.state = CombinerState::Failed;
                return Err(KestrelError::Protocol(ProtocolError::UnexpectedResponse(format!(
                    "expected {} completions, got {} ({})",
                    self.node_count,
                    self.command_complete_count,
                    self.request_type.name()
                ))));
            }
        }
        if self.state != CombinerState::Failed {
            self.state = CombinerState::Complete;
        }
        Ok(self.summary())
    }

    pub fn summary(&self) -> CombinerSummary {
        CombinerSummary {
            node_count: self.node_count,
            command_complete_count: self.command_complete_count,
            description_count: self.description_count,
            copy_in_count: self.copy_in_count,
            copy_out_count: self.copy_out_count,
            ready_count: self.ready_count,
            affected_rows: self.affected_rows,
            errored_nodes: self.errored_nodes.clone(),
            fatal_nodes: self.fatal_nodes(),
        }
    }
}
