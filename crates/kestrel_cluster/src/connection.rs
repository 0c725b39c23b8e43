use std::collections::HashSet;
use std::io;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};

use kestrel_common::error::{KestrelError, KestrelResult};
use kestrel_common::types::NodeId;
use kestrel_protocol::{Frame, FrameBuffer, FrontendMessage};

use crate::combiner::CombinerId;
use crate::pool::{CancelKey, LeasedSocket};
use crate::transport::NodeSocket;

const READ_CHUNK: usize = 16 * 1024;

/// Protocol state of one data-node connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    QueryActive,
    CopyIn,
    CopyOut,
    /// Socket error or framing violation. Never read or written again.
    FatalError,
}

/// Handle on one leased socket to one data node.
///
/// `owner` names the combiner currently consuming this connection's replies.
/// It is an id, not a reference: the connection outlives any one combiner.
#[derive(Debug)]
pub struct NodeConnection {
    node: NodeId,
    socket: Box<dyn NodeSocket>,
    state: ConnState,
    inbuf: FrameBuffer,
    outbuf: BytesMut,
    last_error: Option<String>,
    owner: Option<CombinerId>,
    /// Status byte of the last ReadyForQuery ('I', 'T' or 'E').
    txn_status: u8,
    prepared: HashSet<String>,
    cancel_key: Option<CancelKey>,
    /// Set after a cancel: the backend may still hold stray output.
    dirty: bool,
}

impl NodeConnection {
    pub fn new(
        node: NodeId,
        socket: Box<dyn NodeSocket>,
        cancel_key: Option<CancelKey>,
        max_frame_bytes: usize,
    ) -> Self {
        Self {
            node,
            socket,
            state: ConnState::Idle,
            inbuf: FrameBuffer::new(max_frame_bytes),
            outbuf: BytesMut::with_capacity(4 * 1024),
            last_error: None,
            owner: None,
            txn_status: b'I',
            prepared: HashSet::new(),
            cancel_key,
            dirty: false,
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn set_state(&mut self, state: ConnState) {
        if self.state != ConnState::FatalError {
            self.state = state;
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.state == ConnState::FatalError
    }

    pub fn is_idle(&self) -> bool {
        self.state == ConnState::Idle
    }

    pub fn owner(&self) -> Option<CombinerId> {
        self.owner
    }

    pub fn set_owner(&mut self, owner: Option<CombinerId>) {
        self.owner = owner;
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn txn_status(&self) -> u8 {
        self.txn_status
    }

    pub fn set_txn_status(&mut self, status: u8) {
        self.txn_status = status;
    }

    pub fn cancel_key(&self) -> Option<CancelKey> {
        self.cancel_key
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn has_prepared(&self, statement: &str) -> bool {
        self.prepared.contains(statement)
    }

    pub fn mark_prepared(&mut self, statement: &str) {
        self.prepared.insert(statement.to_string());
    }

    pub fn forget_prepared(&mut self, statement: &str) -> bool {
        self.prepared.remove(statement)
    }

    /// Encode `msg` into the output buffer. Never touches the socket.
    pub fn send(&mut self, msg: &FrontendMessage) -> KestrelResult<()> {
        if self.is_fatal() {
            return Err(self.fatal_error());
        }
        msg.encode(&mut self.outbuf);
        Ok(())
    }

    pub fn has_pending_output(&self) -> bool {
        !self.outbuf.is_empty()
    }

    /// Write the whole output buffer, waiting for writability as needed.
    pub async fn flush(&mut self) -> KestrelResult<()> {
        while !self.outbuf.is_empty() {
            if self.is_fatal() {
                return Err(self.fatal_error());
            }
            match self.socket.try_write(&self.outbuf) {
                Ok(0) => {
                    self.mark_fatal("connection closed while writing");
                    return Err(self.fatal_error());
                }
                Ok(n) => self.outbuf.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let ready = std::future::poll_fn(|cx| self.socket.poll_write_ready(cx)).await;
                    if let Err(e) = ready {
                        self.mark_fatal(format!("write readiness failed: {}", e));
                        return Err(self.fatal_error());
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.mark_fatal(format!("write failed: {}", e));
                    return Err(self.fatal_error());
                }
            }
        }
        Ok(())
    }

    /// One non-blocking read into the input buffer.
    ///
    /// Returns the byte count, `Ok(0)` when the socket would block. A hard
    /// error or end of stream makes the connection fatal.
    pub fn read_available(&mut self) -> KestrelResult<usize> {
        if self.is_fatal() {
            return Err(self.fatal_error());
        }
        let mut chunk = [0u8; READ_CHUNK];
        match self.socket.try_read(&mut chunk) {
            Ok(0) => {
                self.mark_fatal("connection closed by data node");
                Err(self.fatal_error())
            }
            Ok(n) => {
                self.inbuf.append(&chunk[..n]);
                Ok(n)
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(0)
            }
            Err(e) => {
                self.mark_fatal(format!("read failed: {}", e));
                Err(self.fatal_error())
            }
        }
    }

    /// Next complete buffered frame, or `None` if more bytes are needed.
    /// A framing violation makes the connection fatal.
    pub fn try_parse_one_message(&mut self) -> KestrelResult<Option<Frame>> {
        if self.is_fatal() {
            return Ok(None);
        }
        match self.inbuf.try_read_frame() {
            Ok(frame) => Ok(frame),
            Err(e) => {
                self.mark_fatal(format!("framing violation: {}", e));
                Err(KestrelError::Protocol(e))
            }
        }
    }

    pub fn has_buffered_input(&self) -> bool {
        !self.inbuf.is_empty()
    }

    pub fn poll_read_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.socket.poll_read_ready(cx)
    }

    pub fn mark_fatal(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.state != ConnState::FatalError {
            tracing::warn!(node = %self.node, reason = %reason, "data node connection is fatal");
            kestrel_observability::record_connection_fatal("io");
        }
        self.state = ConnState::FatalError;
        self.last_error = Some(reason);
        self.inbuf.clear();
        self.outbuf.clear();
    }

    pub fn fatal_error(&self) -> KestrelError {
        KestrelError::connection(
            self.node,
            self.last_error
                .clone()
                .unwrap_or_else(|| "connection is in fatal state".into()),
        )
    }

    /// Give the socket back for release to the pool manager.
    pub fn into_leased(self) -> LeasedSocket {
        LeasedSocket {
            node: self.node,
            socket: self.socket,
            cancel_key: self.cancel_key,
        }
    }
}
