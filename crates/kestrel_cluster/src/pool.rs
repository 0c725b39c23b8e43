//! Connection pool client.
//!
//! The pool manager is the only component that creates or destroys data-node
//! sockets. A session asks it for one connection per missing node and hands
//! the sockets back at transaction end, flagging the ones that must not be
//! reused.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use kestrel_common::config::KestrelConfig;
use kestrel_common::error::{ClusterError, KestrelError, KestrelResult};
use kestrel_common::types::NodeId;
use kestrel_protocol::{BackendMessage, FrameBuffer, FrontendMessage};

use crate::connection::{ConnState, NodeConnection};
use crate::transport::NodeSocket;

/// Identifies a backend for out-of-band cancel requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelKey {
    pub process_id: u32,
    pub secret_key: u32,
}

/// A socket granted by the pool manager.
#[derive(Debug)]
pub struct LeasedSocket {
    pub node: NodeId,
    pub socket: Box<dyn NodeSocket>,
    pub cancel_key: Option<CancelKey>,
}

/// External pool-manager service.
#[async_trait]
pub trait PoolManager: Send + Sync {
    /// Lease one socket per node. All-or-nothing: on failure no socket is
    /// returned and none of the partially granted ones leak.
    async fn acquire(&self, nodes: &[NodeId]) -> KestrelResult<Vec<LeasedSocket>>;

    /// Return a socket. `discard` sockets are closed instead of reused.
    fn release(&self, leased: LeasedSocket, discard: bool);

    /// Ask the backend identified by `key` to cancel its running statement.
    async fn cancel(&self, node: NodeId, key: CancelKey) -> KestrelResult<()>;
}

/// Observable pool-client statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub total_acquires: u64,
    pub total_acquire_failures: u64,
    pub total_released: u64,
    pub total_discarded: u64,
    /// Connections currently held by the session.
    pub held: usize,
}

#[derive(Debug, Default)]
struct PoolStatsInner {
    total_acquires: AtomicU64,
    total_acquire_failures: AtomicU64,
    total_released: AtomicU64,
    total_discarded: AtomicU64,
}

impl PoolStatsInner {
    fn snapshot(&self, held: usize) -> PoolStats {
        PoolStats {
            total_acquires: self.total_acquires.load(Ordering::Relaxed),
            total_acquire_failures: self.total_acquire_failures.load(Ordering::Relaxed),
            total_released: self.total_released.load(Ordering::Relaxed),
            total_discarded: self.total_discarded.load(Ordering::Relaxed),
            held,
        }
    }
}

/// Per-session view of the pool: the connections this session currently holds.
pub struct PoolClient {
    manager: Arc<dyn PoolManager>,
    connections: BTreeMap<NodeId, NodeConnection>,
    max_frame_bytes: usize,
    stats: PoolStatsInner,
}

impl PoolClient {
    pub fn new(manager: Arc<dyn PoolManager>, max_frame_bytes: usize) -> Self {
        Self {
            manager,
            connections: BTreeMap::new(),
            max_frame_bytes,
            stats: PoolStatsInner::default(),
        }
    }

    pub fn manager(&self) -> &Arc<dyn PoolManager> {
        &self.manager
    }

    /// Make sure a connection is held for every node in `nodes`.
    /// Only the missing ones are requested; the request is atomic.
    pub async fn acquire(&mut self, nodes: &[NodeId]) -> KestrelResult<()> {
        let mut missing: Vec<NodeId> = nodes
            .iter()
            .copied()
            .filter(|n| !self.connections.contains_key(n))
            .collect();
        missing.sort();
        missing.dedup();
        if missing.is_empty() {
            return Ok(());
        }

        match self.manager.acquire(&missing).await {
            Ok(leased) => {
                if leased.len() != missing.len() {
                    for l in leased {
                        self.manager.release(l, true);
                    }
                    self.stats.total_acquire_failures.fetch_add(1, Ordering::Relaxed);
                    return Err(ClusterError::AcquireFailed {
                        nodes: missing,
                        reason: "pool manager returned a partial grant".into(),
                    }
                    .into());
                }
                for l in leased {
                    tracing::debug!(node = %l.node, "leased data node connection");
                    let conn =
                        NodeConnection::new(l.node, l.socket, l.cancel_key, self.max_frame_bytes);
                    self.connections.insert(l.node, conn);
                }
                self.stats.total_acquires.fetch_add(1, Ordering::Relaxed);
                kestrel_observability::record_pool_acquire(missing.len(), true);
                kestrel_observability::record_active_connections(self.connections.len());
                Ok(())
            }
            Err(e) => {
                self.stats.total_acquire_failures.fetch_add(1, Ordering::Relaxed);
                kestrel_observability::record_pool_acquire(missing.len(), false);
                tracing::warn!(nodes = ?missing, error = %e, "connection acquisition failed");
                Err(e)
            }
        }
    }

    pub fn get(&self, node: NodeId) -> Option<&NodeConnection> {
        self.connections.get(&node)
    }

    pub fn get_mut(&mut self, node: NodeId) -> Option<&mut NodeConnection> {
        self.connections.get_mut(&node)
    }

    /// Borrow the connections for `nodes` (those that are held), in order.
    pub fn get_many(&self, nodes: &[NodeId]) -> Vec<&NodeConnection> {
        nodes.iter().filter_map(|n| self.connections.get(n)).collect()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.connections.contains_key(&node)
    }

    pub fn held_nodes(&self) -> Vec<NodeId> {
        self.connections.keys().copied().collect()
    }

    pub fn connections_mut(&mut self) -> impl Iterator<Item = &mut NodeConnection> {
        self.connections.values_mut()
    }

    /// Return every held connection. Anything not `Idle`, still inside a
    /// transaction block, or dirtied by a cancel is discarded.
    /// Returns `(released, discarded)`.
    pub fn release_all(&mut self) -> (usize, usize) {
        let conns = std::mem::take(&mut self.connections);
        let total = conns.len();
        let mut discarded = 0;
        for (node, conn) in conns {
            let discard =
                conn.state() != ConnState::Idle || conn.is_dirty() || conn.txn_status() != b'I';
            if discard {
                discarded += 1;
                tracing::debug!(node = %node, state = ?conn.state(), "discarding connection");
            }
            self.manager.release(conn.into_leased(), discard);
        }
        self.stats
            .total_released
            .fetch_add(total as u64, Ordering::Relaxed);
        self.stats
            .total_discarded
            .fetch_add(discarded as u64, Ordering::Relaxed);
        kestrel_observability::record_pool_release(total, discarded);
        kestrel_observability::record_active_connections(0);
        (total, discarded)
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.snapshot(self.connections.len())
    }
}

impl Drop for PoolClient {
    fn drop(&mut self) {
        if !self.connections.is_empty() {
            self.release_all();
        }
    }
}

// ── TCP pool manager ─────────────────────────────────────────────────────────

const CANCEL_REQUEST_CODE: u32 = 80_877_102;

struct IdleSocket {
    socket: Box<dyn NodeSocket>,
    cancel_key: Option<CancelKey>,
}

/// Pool manager that connects to data nodes over TCP and keeps a bounded
/// number of idle sockets per node.
pub struct TcpPoolManager {
    config: Arc<KestrelConfig>,
    idle: Mutex<HashMap<NodeId, Vec<IdleSocket>>>,
}

impl TcpPoolManager {
    pub fn new(config: Arc<KestrelConfig>) -> Self {
        Self {
            config,
            idle: Mutex::new(HashMap::new()),
        }
    }

    fn timeout(&self) -> Option<Duration> {
        match self.config.pool.acquire_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    fn address(&self, node: NodeId) -> KestrelResult<String> {
        self.config
            .node(node)
            .map(|n| n.address())
            .ok_or_else(|| ClusterError::NodeNotFound(node).into())
    }

    /// Connect and run the startup handshake until the first ReadyForQuery.
    async fn connect(&self, node: NodeId) -> KestrelResult<LeasedSocket> {
        let addr = self.address(node)?;
        let mut stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| KestrelError::connection(node, format!("connect {}: {}", addr, e)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| KestrelError::connection(node, e.to_string()))?;

        let mut out = BytesMut::new();
        FrontendMessage::Startup {
            params: vec![
                ("user".into(), self.config.pool.user.clone()),
                ("database".into(), self.config.pool.database.clone()),
                (
                    "application_name".into(),
                    self.config.coordinator.node_name.clone(),
                ),
            ],
        }
        .encode(&mut out);
        stream
            .write_all(&out)
            .await
            .map_err(|e| KestrelError::connection(node, format!("startup write: {}", e)))?;

        let mut inbuf = FrameBuffer::new(self.config.executor.max_frame_bytes);
        let mut cancel_key = None;
        let mut chunk = [0u8; 4096];
        loop {
            while let Some(frame) = inbuf.try_read_frame()? {
                match BackendMessage::decode(&frame)? {
                    BackendMessage::Authentication(0) => {}
                    BackendMessage::Authentication(code) => {
                        return Err(KestrelError::connection(
                            node,
                            format!("unsupported authentication method {}", code),
                        ));
                    }
                    BackendMessage::BackendKeyData {
                        process_id,
                        secret_key,
                    } => {
                        cancel_key = Some(CancelKey {
                            process_id,
                            secret_key,
                        });
                    }
                    BackendMessage::ErrorResponse(fields) => {
                        return Err(KestrelError::connection(
                            node,
                            format!("startup rejected: {} ({})", fields.message, fields.code),
                        ));
                    }
                    BackendMessage::ReadyForQuery(_) => {
                        return Ok(LeasedSocket {
                            node,
                            socket: Box::new(stream),
                            cancel_key,
                        });
                    }
                    _ => {}
                }
            }
            let n = stream
                .read(&mut chunk)
                .await
                .map_err(|e| KestrelError::connection(node, format!("startup read: {}", e)))?;
            if n == 0 {
                return Err(KestrelError::connection(node, "closed during startup"));
            }
            inbuf.append(&chunk[..n]);
        }
    }

    async fn lease_one(&self, node: NodeId) -> KestrelResult<LeasedSocket> {
        let reused = self.idle.lock().get_mut(&node).and_then(|v| v.pop());
        if let Some(idle) = reused {
            return Ok(LeasedSocket {
                node,
                socket: idle.socket,
                cancel_key: idle.cancel_key,
            });
        }
        match self.timeout() {
            Some(t) => tokio::time::timeout(t, self.connect(node))
                .await
                .map_err(|_| KestrelError::connection(node, "connect timed out"))?,
            None => self.connect(node).await,
        }
    }
}

#[async_trait]
impl PoolManager for TcpPoolManager {
    async fn acquire(&self, nodes: &[NodeId]) -> KestrelResult<Vec<LeasedSocket>> {
        let mut granted: Vec<LeasedSocket> = Vec::with_capacity(nodes.len());
        for &node in nodes {
            match self.lease_one(node).await {
                Ok(leased) => granted.push(leased),
                Err(e) => {
                    for g in granted {
                        self.release(g, false);
                    }
                    return Err(ClusterError::AcquireFailed {
                        nodes: nodes.to_vec(),
                        reason: e.to_string(),
                    }
                    .into());
                }
            }
        }
        Ok(granted)
    }

    fn release(&self, leased: LeasedSocket, discard: bool) {
        if discard {
            return;
        }
        let mut idle = self.idle.lock();
        let slot = idle.entry(leased.node).or_default();
        if slot.len() < self.config.pool.max_idle_per_node {
            slot.push(IdleSocket {
                socket: leased.socket,
                cancel_key: leased.cancel_key,
            });
        }
    }

    async fn cancel(&self, node: NodeId, key: CancelKey) -> KestrelResult<()> {
        let addr = self.address(node)?;
        let mut stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| KestrelError::connection(node, format!("cancel connect: {}", e)))?;
        let mut packet = Vec::with_capacity(16);
        packet.extend_from_slice(&16u32.to_be_bytes());
        packet.extend_from_slice(&CANCEL_REQUEST_CODE.to_be_bytes());
        packet.extend_from_slice(&key.process_id.to_be_bytes());
        packet.extend_from_slice(&key.secret_key.to_be_bytes());
        stream
            .write_all(&packet)
            .await
            .map_err(|e| KestrelError::connection(node, format!("cancel write: {}", e)))?;
        Ok(())
    }
}
