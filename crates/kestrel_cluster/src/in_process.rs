//! In-process data nodes.
//!
//! Each [`InProcessNode`] speaks the coordinator wire protocol over an
//! in-memory socket, so the whole remote execution path (framing, combiner,
//! pool, 2PC) runs without a network. Replies are scripted per SQL text;
//! unscripted transaction-control statements get their usual answers and
//! prepared gids are tracked the way a real node would. Every message a
//! node receives is appended to one shared journal, in arrival order.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;

use kestrel_common::config::{DataNodeConfig, KestrelConfig};
use kestrel_common::error::{ClusterError, KestrelResult};
use kestrel_common::types::NodeId;
use kestrel_protocol::{
    encode_data_row, BackendMessage, DescribeTarget, ErrorFields, FieldDescription, Frame,
    FrameBuffer, FrontendMessage,
};

use crate::pool::{CancelKey, LeasedSocket, PoolManager};
use crate::transport::NodeSocket;

/// What a node received, or did with its replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEvent {
    Query(String),
    Parse { name: String, query: String },
    Bind { portal: String, statement: String },
    Execute { portal: String, max_rows: u32 },
    Sync,
    Flush,
    Close { name: String },
    CopyData(String),
    CopyDone,
    GlobalXid(u64),
    Cancel,
    /// The coordinator read the node's output buffer to the end.
    ReplyConsumed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub node: NodeId,
    pub event: JournalEvent,
}

/// Scripted answer to one statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Command(String),
    Rows {
        columns: Vec<(String, String)>,
        rows: Vec<Vec<Option<String>>>,
    },
    Error {
        code: String,
        message: String,
        detail: Option<String>,
    },
    /// Rejected when parsed: extended protocol fails at Parse and the
    /// statement is never defined.
    ParseError {
        code: String,
        message: String,
    },
    CopyIn,
    CopyOut {
        rows: Vec<String>,
    },
    /// Never answer until cancelled.
    Hang,
    /// Drop the connection.
    Disconnect,
    /// Send a frame with an invalid length.
    Garbage,
}

impl Reply {
    pub fn command(tag: impl Into<String>) -> Self {
        Reply::Command(tag.into())
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Reply::Error {
            code: code.into(),
            message: message.into(),
            detail: None,
        }
    }

    pub fn parse_error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Reply::ParseError {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn rows(columns: &[(&str, &str)], rows: &[&[Option<&str>]]) -> Self {
        Reply::Rows {
            columns: columns
                .iter()
                .map(|(n, t)| (n.to_string(), t.to_string()))
                .collect(),
            rows: rows
                .iter()
                .map(|r| r.iter().map(|v| v.map(str::to_string)).collect())
                .collect(),
        }
    }

    /// Single `int8` column holding `values` in order.
    pub fn int_column(name: &str, values: &[i64]) -> Self {
        Reply::Rows {
            columns: vec![(name.to_string(), "int8".to_string())],
            rows: values.iter().map(|v| vec![Some(v.to_string())]).collect(),
        }
    }
}

#[derive(Debug)]
struct Rule {
    pattern: String,
    reply: Reply,
}

/// One simulated data node.
#[derive(Debug)]
pub struct InProcessNode {
    id: NodeId,
    rules: Mutex<Vec<Rule>>,
    prepared: Mutex<HashSet<String>>,
    committed: Mutex<Vec<String>>,
    unavailable: AtomicBool,
    read_chunk: AtomicUsize,
    reads: AtomicU64,
    backends: Mutex<HashMap<u32, Weak<Mutex<Backend>>>>,
    journal: Arc<Mutex<Vec<JournalEntry>>>,
}

impl InProcessNode {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Script `reply` for statements equal to, or else starting with, `pattern`.
    /// Later rules take precedence.
    pub fn on(&self, pattern: impl Into<String>, reply: Reply) {
        self.rules.lock().push(Rule {
            pattern: pattern.into(),
            reply,
        });
    }

    pub fn clear_rules(&self) {
        self.rules.lock().clear();
    }

    /// Refuse new connections from the pool manager.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn is_unavailable(&self) -> bool {
        self.unavailable.load(Ordering::SeqCst)
    }

    /// Deliver at most `bytes` per socket read (0 = unlimited).
    pub fn set_read_chunk(&self, bytes: usize) {
        self.read_chunk.store(bytes, Ordering::SeqCst);
    }

    /// Socket reads attempted by the coordinator on this node.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn is_prepared(&self, gid: &str) -> bool {
        self.prepared.lock().contains(gid)
    }

    pub fn prepared_gids(&self) -> Vec<String> {
        let mut gids: Vec<String> = self.prepared.lock().iter().cloned().collect();
        gids.sort();
        gids
    }

    pub fn committed_gids(&self) -> Vec<String> {
        self.committed.lock().clone()
    }

    /// Close every live connection to this node.
    pub fn disconnect_all(&self) {
        for backend in self.live_backends() {
            let mut b = backend.lock();
            b.closed = true;
            b.out.clear();
            b.wake();
        }
    }

    fn live_backends(&self) -> Vec<Arc<Mutex<Backend>>> {
        let mut backends = self.backends.lock();
        backends.retain(|_, w| w.strong_count() > 0);
        backends.values().filter_map(Weak::upgrade).collect()
    }

    fn record(&self, event: JournalEvent) {
        self.journal.lock().push(JournalEntry {
            node: self.id,
            event,
        });
    }

    fn scripted(&self, sql: &str) -> Option<Reply> {
        let rules = self.rules.lock();
        rules
            .iter()
            .rev()
            .find(|r| r.pattern == sql)
            .or_else(|| rules.iter().rev().find(|r| sql.starts_with(&r.pattern)))
            .map(|r| r.reply.clone())
    }
}

#[derive(Debug)]
struct Portal {
    columns: Vec<FieldDescription>,
    rows: VecDeque<Vec<Option<String>>>,
    sent: u64,
    tag: Option<String>,
    hang: bool,
}

/// Server side of one connection.
#[derive(Debug)]
struct Backend {
    node: Arc<InProcessNode>,
    pid: u32,
    inbuf: FrameBuffer,
    out: BytesMut,
    waker: Option<Waker>,
    closed: bool,
    in_txn: bool,
    failed: bool,
    statements: HashMap<String, String>,
    portals: HashMap<String, Portal>,
    skip_until_sync: bool,
    copy_in: Option<u64>,
    hung: bool,
}

fn quoted(sql: &str) -> String {
    match (sql.find('\''), sql.rfind('\'')) {
        (Some(a), Some(b)) if b > a => sql[a + 1..b].to_string(),
        _ => String::new(),
    }
}

impl Backend {
    fn new(node: Arc<InProcessNode>, pid: u32) -> Self {
        Self {
            node,
            pid,
            inbuf: FrameBuffer::default(),
            out: BytesMut::new(),
            waker: None,
            closed: false,
            in_txn: false,
            failed: false,
            statements: HashMap::new(),
            portals: HashMap::new(),
            skip_until_sync: false,
            copy_in: None,
            hung: false,
        }
    }

    fn wake(&mut self) {
        if let Some(w) = self.waker.take() {
            w.wake();
        }
    }

    fn put(&mut self, msg: BackendMessage) {
        msg.encode(&mut self.out);
    }

    fn status(&self) -> u8 {
        match (self.in_txn, self.failed) {
            (false, _) => b'I',
            (true, false) => b'T',
            (true, true) => b'E',
        }
    }

    fn ready(&mut self) {
        let status = self.status();
        self.put(BackendMessage::ReadyForQuery(status));
    }

    fn put_error(&mut self, code: &str, message: &str, detail: Option<String>) {
        self.put(BackendMessage::ErrorResponse(ErrorFields {
            code: code.to_string(),
            message: message.to_string(),
            detail,
        }));
        if self.in_txn {
            self.failed = true;
        }
    }

    fn extended_error(&mut self, code: &str, message: &str) {
        self.put_error(code, message, None);
        self.skip_until_sync = true;
    }

    fn on_bytes(&mut self, bytes: &[u8]) {
        self.inbuf.append(bytes);
        loop {
            match self.inbuf.try_read_frame() {
                Ok(Some(frame)) => self.on_frame(frame),
                Ok(None) => break,
                Err(_) => {
                    self.closed = true;
                    break;
                }
            }
            if self.closed {
                break;
            }
        }
    }

    fn on_frame(&mut self, frame: Frame) {
        let msg = match FrontendMessage::decode(&frame) {
            Ok(msg) => msg,
            Err(_) => {
                self.closed = true;
                return;
            }
        };
        match msg {
            FrontendMessage::Query(sql) => {
                self.node.record(JournalEvent::Query(sql.clone()));
                self.simple_query(&sql);
            }
            FrontendMessage::Parse { name, query, .. } => {
                self.node.record(JournalEvent::Parse {
                    name: name.clone(),
                    query: query.clone(),
                });
                if self.skip_until_sync {
                    return;
                }
                if !name.is_empty() && self.statements.contains_key(&name) {
                    let msg = format!("prepared statement \"{}\" already exists", name);
                    self.extended_error("42P05", &msg);
                    return;
                }
                if let Some(Reply::ParseError { code, message }) = self.node.scripted(&query) {
                    self.extended_error(&code, &message);
                    return;
                }
                self.statements.insert(name, query);
                self.put(BackendMessage::ParseComplete);
            }
            FrontendMessage::Bind {
                portal, statement, ..
            } => {
                self.node.record(JournalEvent::Bind {
                    portal: portal.clone(),
                    statement: statement.clone(),
                });
                if self.skip_until_sync {
                    return;
                }
                self.bind(portal, &statement);
            }
            FrontendMessage::Describe { target, name } => {
                if self.skip_until_sync {
                    return;
                }
                let columns = match target {
                    DescribeTarget::Portal => self.portals.get(&name).map(|p| p.columns.clone()),
                    DescribeTarget::Statement => None,
                };
                match columns {
                    Some(cols) if !cols.is_empty() => self.put(BackendMessage::RowDescription(cols)),
                    _ => self.put(BackendMessage::NoData),
                }
            }
            FrontendMessage::Execute { portal, max_rows } => {
                self.node.record(JournalEvent::Execute {
                    portal: portal.clone(),
                    max_rows,
                });
                if self.skip_until_sync {
                    return;
                }
                self.execute(&portal, max_rows);
            }
            FrontendMessage::Sync => {
                self.node.record(JournalEvent::Sync);
                self.skip_until_sync = false;
                self.portals.remove("");
                if !self.hung {
                    self.ready();
                }
            }
            FrontendMessage::Flush => self.node.record(JournalEvent::Flush),
            FrontendMessage::Close { target, name } => {
                self.node.record(JournalEvent::Close { name: name.clone() });
                if self.skip_until_sync {
                    return;
                }
                match target {
                    DescribeTarget::Statement => self.statements.remove(&name).is_some(),
                    DescribeTarget::Portal => self.portals.remove(&name).is_some(),
                };
                self.put(BackendMessage::CloseComplete);
            }
            FrontendMessage::CopyData(data) => {
                self.node
                    .record(JournalEvent::CopyData(String::from_utf8_lossy(&data).into_owned()));
                if let Some(n) = self.copy_in.as_mut() {
                    *n += 1;
                }
            }
            FrontendMessage::CopyDone => {
                self.node.record(JournalEvent::CopyDone);
                if let Some(n) = self.copy_in.take() {
                    self.put(BackendMessage::CommandComplete(format!("COPY {}", n)));
                    self.ready();
                }
            }
            FrontendMessage::CopyFail(reason) => {
                if self.copy_in.take().is_some() {
                    let msg = format!("COPY from stdin failed: {}", reason);
                    self.put_error("57014", &msg, None);
                    self.ready();
                }
            }
            FrontendMessage::GlobalXid(gxid) => self.node.record(JournalEvent::GlobalXid(gxid)),
            FrontendMessage::Terminate => self.closed = true,
            FrontendMessage::Startup { .. } => {}
        }
    }

    fn simple_query(&mut self, sql: &str) {
        let reply = if self.failed && !sql.trim().to_ascii_uppercase().starts_with("ROLLBACK") {
            Reply::error(
                "25P02",
                "current transaction is aborted, commands ignored until end of transaction block",
            )
        } else {
            self.resolve(sql)
        };
        match reply {
            Reply::Command(tag) => self.put(BackendMessage::CommandComplete(tag)),
            Reply::Rows { columns, rows } => {
                self.put(BackendMessage::RowDescription(
                    columns
                        .iter()
                        .map(|(n, t)| FieldDescription::new(n.as_str(), t.as_str()))
                        .collect(),
                ));
                for row in &rows {
                    self.put(BackendMessage::DataRow(encode_data_row(row)));
                }
                self.put(BackendMessage::CommandComplete(format!("SELECT {}", rows.len())));
            }
            Reply::Error {
                code,
                message,
                detail,
            } => self.put_error(&code, &message, detail),
            Reply::ParseError { code, message } => self.put_error(&code, &message, None),
            Reply::CopyIn => {
                self.put(BackendMessage::CopyInResponse { columns: 1 });
                self.copy_in = Some(0);
                return;
            }
            Reply::CopyOut { rows } => {
                self.put(BackendMessage::CopyOutResponse { columns: 1 });
                for row in &rows {
                    self.put(BackendMessage::CopyData(Bytes::from(format!("{}\n", row))));
                }
                self.put(BackendMessage::CopyDone);
                self.put(BackendMessage::CommandComplete(format!("COPY {}", rows.len())));
            }
            Reply::Hang => {
                self.hung = true;
                return;
            }
            Reply::Disconnect => {
                self.closed = true;
                self.out.clear();
                return;
            }
            Reply::Garbage => {
                self.out.extend_from_slice(&[b'D', 0, 0, 0, 1]);
                return;
            }
        }
        self.ready();
    }

    fn bind(&mut self, portal: String, statement: &str) {
        let Some(sql) = self.statements.get(statement).cloned() else {
            let msg = format!("prepared statement \"{}\" does not exist", statement);
            self.extended_error("26000", &msg);
            return;
        };
        let p = match self.resolve(&sql) {
            Reply::Rows { columns, rows } => Portal {
                columns: columns
                    .iter()
                    .map(|(n, t)| FieldDescription::new(n.as_str(), t.as_str()))
                    .collect(),
                rows: rows.into(),
                sent: 0,
                tag: None,
                hang: false,
            },
            Reply::Command(tag) => Portal {
                columns: Vec::new(),
                rows: VecDeque::new(),
                sent: 0,
                tag: Some(tag),
                hang: false,
            },
            Reply::Hang => Portal {
                columns: Vec::new(),
                rows: VecDeque::new(),
                sent: 0,
                tag: None,
                hang: true,
            },
            Reply::Error { code, message, .. } => {
                self.extended_error(&code, &message);
                return;
            }
            other => {
                let msg = format!("{:?} is not supported through a portal", other);
                self.extended_error("0A000", &msg);
                return;
            }
        };
        self.portals.insert(portal, p);
        self.put(BackendMessage::BindComplete);
    }

    fn execute(&mut self, portal: &str, max_rows: u32) {
        let Some(mut p) = self.portals.remove(portal) else {
            let msg = format!("portal \"{}\" does not exist", portal);
            self.extended_error("34000", &msg);
            return;
        };
        if p.hang {
            self.hung = true;
            return;
        }
        let limit = if max_rows == 0 { usize::MAX } else { max_rows as usize };
        let mut n = 0;
        while n < limit {
            let Some(row) = p.rows.pop_front() else { break };
            self.put(BackendMessage::DataRow(encode_data_row(&row)));
            n += 1;
        }
        p.sent += n as u64;
        if !p.rows.is_empty() {
            self.put(BackendMessage::PortalSuspended);
            self.portals.insert(portal.to_string(), p);
            return;
        }
        let tag = p.tag.unwrap_or_else(|| format!("SELECT {}", p.sent));
        self.put(BackendMessage::CommandComplete(tag));
    }

    /// Scripted reply, else the built-in answer for transaction control.
    fn resolve(&mut self, sql: &str) -> Reply {
        if let Some(reply) = self.node.scripted(sql) {
            return reply;
        }
        let upper = sql.trim().to_ascii_uppercase();
        if upper == "BEGIN" || upper == "START TRANSACTION" {
            self.in_txn = true;
            self.failed = false;
            return Reply::command("BEGIN");
        }
        if upper == "COMMIT" || upper == "ROLLBACK" {
            self.in_txn = false;
            self.failed = false;
            return Reply::command(upper);
        }
        if upper.starts_with("PREPARE TRANSACTION") {
            self.node.prepared.lock().insert(quoted(sql));
            self.in_txn = false;
            return Reply::command("PREPARE TRANSACTION");
        }
        if upper.starts_with("COMMIT PREPARED") || upper.starts_with("ROLLBACK PREPARED") {
            let gid = quoted(sql);
            if !self.node.prepared.lock().remove(&gid) {
                return Reply::error(
                    "42704",
                    format!("prepared transaction with identifier \"{}\" does not exist", gid),
                );
            }
            if upper.starts_with("COMMIT") {
                self.node.committed.lock().push(gid);
                return Reply::command("COMMIT PREPARED");
            }
            return Reply::command("ROLLBACK PREPARED");
        }
        if upper == "SELECT 1" {
            return Reply::rows(&[("?column?", "int4")], &[&[Some("1")]]);
        }
        Reply::error("42601", format!("syntax error at or near \"{}\"", sql))
    }

    fn cancel(&mut self) {
        self.node.record(JournalEvent::Cancel);
        if self.hung {
            self.hung = false;
            self.put_error("57014", "canceling statement due to user request", None);
            self.ready();
            self.wake();
        }
    }
}

/// Coordinator side of an in-process connection.
#[derive(Debug)]
pub struct InProcessSocket {
    backend: Arc<Mutex<Backend>>,
}

impl NodeSocket for InProcessSocket {
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut b = self.backend.lock();
        b.node.reads.fetch_add(1, Ordering::SeqCst);
        if b.out.is_empty() {
            if b.closed {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let chunk = match b.node.read_chunk.load(Ordering::SeqCst) {
            0 => usize::MAX,
            n => n,
        };
        let n = buf.len().min(chunk).min(b.out.len());
        buf[..n].copy_from_slice(&b.out[..n]);
        b.out.advance(n);
        if b.out.is_empty() {
            b.node.record(JournalEvent::ReplyConsumed);
        }
        Ok(n)
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut b = self.backend.lock();
        if b.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        b.on_bytes(buf);
        Ok(buf.len())
    }

    fn poll_read_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut b = self.backend.lock();
        if !b.out.is_empty() || b.closed {
            return Poll::Ready(Ok(()));
        }
        b.waker = Some(cx.waker().clone());
        Poll::Pending
    }

    fn poll_write_ready(&self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// A set of in-process data nodes sharing one journal.
#[derive(Debug)]
pub struct InProcessCluster {
    nodes: BTreeMap<NodeId, Arc<InProcessNode>>,
    journal: Arc<Mutex<Vec<JournalEntry>>>,
    next_pid: AtomicU32,
}

impl InProcessCluster {
    pub fn new(ids: &[u32]) -> Arc<Self> {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let nodes = ids
            .iter()
            .map(|id| {
                let node = Arc::new(InProcessNode {
                    id: NodeId(*id),
                    rules: Mutex::new(Vec::new()),
                    prepared: Mutex::new(HashSet::new()),
                    committed: Mutex::new(Vec::new()),
                    unavailable: AtomicBool::new(false),
                    read_chunk: AtomicUsize::new(0),
                    reads: AtomicU64::new(0),
                    backends: Mutex::new(HashMap::new()),
                    journal: journal.clone(),
                });
                (NodeId(*id), node)
            })
            .collect();
        Arc::new(Self {
            nodes,
            journal,
            next_pid: AtomicU32::new(1000),
        })
    }

    pub fn node(&self, id: u32) -> &Arc<InProcessNode> {
        &self.nodes[&NodeId(id)]
    }

    pub fn get(&self, id: NodeId) -> Option<&Arc<InProcessNode>> {
        self.nodes.get(&id)
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    /// Script `reply` on every node.
    pub fn on_all(&self, pattern: &str, reply: Reply) {
        for node in self.nodes.values() {
            node.on(pattern, reply.clone());
        }
    }

    pub fn journal(&self) -> Vec<JournalEntry> {
        self.journal.lock().clone()
    }

    pub fn clear_journal(&self) {
        self.journal.lock().clear();
    }

    /// Simple-protocol statements received by `node`, in order.
    pub fn queries(&self, node: u32) -> Vec<String> {
        self.journal
            .lock()
            .iter()
            .filter(|e| e.node == NodeId(node))
            .filter_map(|e| match &e.event {
                JournalEvent::Query(sql) => Some(sql.clone()),
                _ => None,
            })
            .collect()
    }

    /// Coordinator configuration naming these nodes.
    pub fn config(&self) -> KestrelConfig {
        let mut config = KestrelConfig::default();
        config.nodes = self
            .nodes
            .keys()
            .map(|id| DataNodeConfig {
                id: id.0,
                name: format!("dn{}", id.0),
                host: "in-process".into(),
                port: 15_000 + id.0 as u16,
                primary: false,
                preferred: false,
            })
            .collect();
        config
    }

    pub fn pool_manager(self: &Arc<Self>) -> Arc<InProcessPoolManager> {
        Arc::new(InProcessPoolManager {
            cluster: self.clone(),
            acquires: AtomicU64::new(0),
            released: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        })
    }

    fn connect(&self, id: NodeId) -> KestrelResult<LeasedSocket> {
        let node = self.nodes.get(&id).ok_or(ClusterError::NodeNotFound(id))?;
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        let backend = Arc::new(Mutex::new(Backend::new(node.clone(), pid)));
        node.backends.lock().insert(pid, Arc::downgrade(&backend));
        Ok(LeasedSocket {
            node: id,
            socket: Box::new(InProcessSocket { backend }),
            cancel_key: Some(CancelKey {
                process_id: pid,
                secret_key: pid ^ 0x5eed,
            }),
        })
    }

    fn cancel(&self, id: NodeId, key: CancelKey) {
        let Some(node) = self.nodes.get(&id) else { return };
        let backend = node.backends.lock().get(&key.process_id).and_then(Weak::upgrade);
        if let Some(backend) = backend {
            let mut b = backend.lock();
            if b.pid ^ 0x5eed == key.secret_key {
                b.cancel();
            }
        }
    }
}

/// Pool manager handing out in-process sockets.
#[derive(Debug)]
pub struct InProcessPoolManager {
    cluster: Arc<InProcessCluster>,
    acquires: AtomicU64,
    released: AtomicU64,
    discarded: AtomicU64,
}

impl InProcessPoolManager {
    pub fn acquires(&self) -> u64 {
        self.acquires.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::SeqCst)
    }

    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PoolManager for InProcessPoolManager {
    async fn acquire(&self, nodes: &[NodeId]) -> KestrelResult<Vec<LeasedSocket>> {
        let down: Vec<NodeId> = nodes
            .iter()
            .copied()
            .filter(|n| self.cluster.get(*n).map_or(true, |node| node.is_unavailable()))
            .collect();
        if !down.is_empty() {
            return Err(ClusterError::AcquireFailed {
                nodes: down,
                reason: "data node unavailable".into(),
            }
            .into());
        }
        let mut granted = Vec::with_capacity(nodes.len());
        for n in nodes {
            granted.push(self.cluster.connect(*n)?);
        }
        self.acquires.fetch_add(nodes.len() as u64, Ordering::SeqCst);
        Ok(granted)
    }

    fn release(&self, leased: LeasedSocket, discard: bool) {
        self.released.fetch_add(1, Ordering::SeqCst);
        if discard {
            self.discarded.fetch_add(1, Ordering::SeqCst);
        }
        drop(leased);
    }

    async fn cancel(&self, node: NodeId, key: CancelKey) -> KestrelResult<()> {
        self.cluster.cancel(node, key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_protocol::FrameBuffer;

    fn roundtrip(sock: &InProcessSocket, msgs: &[FrontendMessage]) -> Vec<BackendMessage> {
        let mut out = BytesMut::new();
        for m in msgs {
            m.encode(&mut out);
        }
        sock.try_write(&out).unwrap();
        let mut fb = FrameBuffer::default();
        let mut buf = [0u8; 4096];
        while let Ok(n) = sock.try_read(&mut buf) {
            if n == 0 {
                break;
            }
            fb.append(&buf[..n]);
        }
        let mut replies = Vec::new();
        while let Some(frame) = fb.try_read_frame().unwrap() {
            replies.push(BackendMessage::decode(&frame).unwrap());
        }
        replies
    }

    fn socket(cluster: &InProcessCluster, id: u32) -> InProcessSocket {
        let leased = cluster.connect(NodeId(id)).unwrap();
        let node = cluster.node(id).clone();
        let backend = node.live_backends().pop().unwrap();
        drop(leased);
        InProcessSocket { backend }
    }

    #[test]
    fn test_transaction_control_defaults() {
        let cluster = InProcessCluster::new(&[1]);
        let sock = socket(&cluster, 1);
        let replies = roundtrip(&sock, &[FrontendMessage::Query("BEGIN".into())]);
        assert_eq!(replies.last(), Some(&BackendMessage::ReadyForQuery(b'T')));
        roundtrip(&sock, &[FrontendMessage::Query("PREPARE TRANSACTION 'T_1'".into())]);
        assert!(cluster.node(1).is_prepared("T_1"));
        let replies = roundtrip(&sock, &[FrontendMessage::Query("COMMIT PREPARED 'T_9'".into())]);
        assert!(matches!(&replies[0], BackendMessage::ErrorResponse(f) if f.code == "42704"));
        roundtrip(&sock, &[FrontendMessage::Query("COMMIT PREPARED 'T_1'".into())]);
        assert_eq!(cluster.node(1).committed_gids(), vec!["T_1".to_string()]);
    }

    #[test]
    fn test_portal_suspends_at_row_limit() {
        let cluster = InProcessCluster::new(&[1]);
        cluster.node(1).on("SELECT v", Reply::int_column("v", &[1, 2, 3]));
        let sock = socket(&cluster, 1);
        let replies = roundtrip(
            &sock,
            &[
                FrontendMessage::Parse {
                    name: String::new(),
                    query: "SELECT v".into(),
                    param_types: vec![],
                },
                FrontendMessage::Bind {
                    portal: "p".into(),
                    statement: String::new(),
                    params: vec![],
                },
                FrontendMessage::Describe {
                    target: DescribeTarget::Portal,
                    name: "p".into(),
                },
                FrontendMessage::Execute {
                    portal: "p".into(),
                    max_rows: 2,
                },
                FrontendMessage::Flush,
            ],
        );
        assert_eq!(replies.len(), 6);
        assert_eq!(replies[5], BackendMessage::PortalSuspended);
        let replies = roundtrip(
            &sock,
            &[
                FrontendMessage::Execute {
                    portal: "p".into(),
                    max_rows: 2,
                },
                FrontendMessage::Sync,
            ],
        );
        assert_eq!(replies[1], BackendMessage::CommandComplete("SELECT 3".into()));
        assert_eq!(replies[2], BackendMessage::ReadyForQuery(b'I'));
    }

    #[test]
    fn test_error_skips_until_sync() {
        let cluster = InProcessCluster::new(&[1]);
        let sock = socket(&cluster, 1);
        let replies = roundtrip(
            &sock,
            &[
                FrontendMessage::Bind {
                    portal: String::new(),
                    statement: "missing".into(),
                    params: vec![],
                },
                FrontendMessage::Execute {
                    portal: String::new(),
                    max_rows: 0,
                },
                FrontendMessage::Sync,
            ],
        );
        assert_eq!(replies.len(), 2);
        assert!(matches!(&replies[0], BackendMessage::ErrorResponse(f) if f.code == "26000"));
    }
}
