use thiserror::Error;

use crate::types::{join_nodes, NodeId, RelationId};

/// Convenience alias for `Result<T, KestrelError>`.
pub type KestrelResult<T> = Result<T, KestrelError>;

/// SQLSTATE a data node reports when it failed only because a peer it was
/// consuming from failed. Genuine errors from other nodes take precedence.
pub const PRODUCER_ERROR_SQLSTATE: &str = "XX010";

/// Error classification for retry/escalation decisions.
///
/// - `UserError`  : bad input or a remote SQL error passed through
/// - `Retryable`  : serialization failure reported by a node; client SHOULD retry
/// - `Transient`  : connection loss, timeout, pool exhaustion; client MAY retry
/// - `InternalBug`: protocol contract broken; triggers alert + diagnostic dump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    Retryable,
    Transient,
    InternalBug,
}

/// Top-level error type that all crate-specific errors convert into.
#[derive(Error, Debug)]
pub enum KestrelError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Socket-level failure on one data-node connection.
    #[error("Connection to {node} failed: {reason}")]
    Connection { node: NodeId, reason: String },

    /// Error reported by a data node, surfaced with its code and text intact.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("Transaction error: {0}")]
    Txn(#[from] TxnError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{message}")]
    ProgramLimitExceeded { message: String, hint: String },

    #[error("canceling statement: {0}")]
    QueryCanceled(String),

    #[error("Internal error: {0}")]
    Internal(String),

    /// Transient resource/backpressure error.
    #[error("Transient: {reason} (retry after {retry_after_ms}ms)")]
    Transient { reason: String, retry_after_ms: u64 },

    /// Internal bug; should never occur in production.
    /// Always carries a unique `error_code` and `debug_context` for post-mortem.
    #[error("InternalBug [{error_code}]: {message} | context: {debug_context}")]
    InternalBug {
        error_code: &'static str,
        message: String,
        debug_context: String,
    },
}

/// Which precedence class a remote error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// "A peer I was reading from failed"; may be overwritten.
    ProducerSide,
    /// Anything else; first one wins.
    Genuine,
}

/// Structured fields of an ErrorResponse received from a data node.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct RemoteError {
    pub node: Option<NodeId>,
    /// Five-character SQLSTATE copied verbatim.
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
}

impl RemoteError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            node: None,
            code: code.into(),
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn from_node(mut self, node: NodeId) -> Self {
        self.node = Some(node);
        self
    }

    pub fn kind(&self) -> RemoteErrorKind {
        if self.code == PRODUCER_ERROR_SQLSTATE {
            RemoteErrorKind::ProducerSide
        } else {
            RemoteErrorKind::Genuine
        }
    }

    pub fn is_producer_error(&self) -> bool {
        self.kind() == RemoteErrorKind::ProducerSide
    }
}

/// Wire protocol errors. All of them are fatal to the connection or the
/// operation that observed them.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Unexpected message '{tag}' while {state}")]
    UnexpectedMessage { tag: char, state: String },

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Response type changed mid-stream from {from} to {to}")]
    ResponseTypeChanged {
        from: &'static str,
        to: &'static str,
    },

    #[error("Connection closed")]
    ConnectionClosed,
}

/// Distributed transaction errors.
#[derive(Error, Debug)]
pub enum TxnError {
    #[error("Failed to PREPARE transaction '{gid}' on {node}: {reason}")]
    PrepareFailed {
        gid: String,
        node: NodeId,
        reason: String,
    },

    #[error("Failed to COMMIT transaction on {node}: {reason}")]
    CommitFailed { node: NodeId, reason: String },

    #[error(
        "Transaction '{gid}' partially committed; nodes {} need manual resolution",
        join_nodes(.failed_nodes)
    )]
    PartiallyCommitted {
        gid: String,
        failed_nodes: Vec<NodeId>,
    },

    #[error("Invalid transaction state transition: {0} → {1}")]
    InvalidTransition(String, String),
}

/// Cluster metadata and routing errors.
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Relation not found: {0}")]
    RelationNotFound(RelationId),

    #[error("Could not obtain connections to {}: {reason}", join_nodes(.nodes))]
    AcquireFailed { nodes: Vec<NodeId>, reason: String },

    #[error("Write to replicated table returned {got} rows on {node}, expected {expected}")]
    ReplicatedWriteDiverged {
        node: NodeId,
        expected: u64,
        got: u64,
    },

    #[error("No target nodes for {0}")]
    NoTargetNodes(RelationId),

    #[error("Invalid distribution key: {0}")]
    InvalidDistributionKey(String),
}

// ── KestrelError classification & helpers ────────────────────────────────────

impl KestrelError {
    /// Classify this error for retry/escalation decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            KestrelError::Remote(e) if e.code == "40001" || e.code == "40P01" => {
                ErrorKind::Retryable
            }
            KestrelError::Remote(_) => ErrorKind::UserError,
            KestrelError::ProgramLimitExceeded { .. } => ErrorKind::UserError,
            KestrelError::QueryCanceled(_) => ErrorKind::UserError,
            KestrelError::Config(_) => ErrorKind::UserError,
            KestrelError::Cluster(ClusterError::InvalidDistributionKey(_)) => ErrorKind::UserError,
            KestrelError::Cluster(ClusterError::RelationNotFound(_)) => ErrorKind::UserError,
            KestrelError::Cluster(ClusterError::ReplicatedWriteDiverged { .. }) => {
                ErrorKind::Retryable
            }

            KestrelError::Transient { .. } => ErrorKind::Transient,
            KestrelError::Connection { .. } => ErrorKind::Transient,
            KestrelError::Cluster(ClusterError::AcquireFailed { .. }) => ErrorKind::Transient,
            KestrelError::Protocol(ProtocolError::Io(_)) => ErrorKind::Transient,
            KestrelError::Protocol(ProtocolError::ConnectionClosed) => ErrorKind::Transient,
            KestrelError::Txn(TxnError::PrepareFailed { .. }) => ErrorKind::Retryable,
            KestrelError::Txn(TxnError::CommitFailed { .. }) => ErrorKind::Transient,

            KestrelError::InternalBug { .. } => ErrorKind::InternalBug,
            _ => ErrorKind::InternalBug,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Retryable)
    }

    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }

    pub fn is_internal_bug(&self) -> bool {
        matches!(self.kind(), ErrorKind::InternalBug)
    }

    /// SQLSTATE to report to the client. Remote errors keep the node's code.
    pub fn sqlstate(&self) -> &str {
        match self {
            KestrelError::Remote(e) => e.code.as_str(),
            KestrelError::Protocol(ProtocolError::ConnectionClosed) => "08006", // connection_failure
            KestrelError::Protocol(ProtocolError::Io(_)) => "08006",
            KestrelError::Protocol(_) => "08P01", // protocol_violation
            KestrelError::Connection { .. } => "08006",
            KestrelError::Cluster(ClusterError::AcquireFailed { .. }) => "53000", // insufficient_resources
            KestrelError::Cluster(ClusterError::ReplicatedWriteDiverged { .. }) => "XX001",
            KestrelError::Cluster(ClusterError::InvalidDistributionKey(_)) => "22023", // invalid_parameter_value
            KestrelError::Cluster(ClusterError::RelationNotFound(_)) => "42P01", // undefined_table
            KestrelError::Txn(TxnError::PartiallyCommitted { .. }) => "XX000",
            KestrelError::Txn(_) => "40000", // transaction_rollback
            KestrelError::ProgramLimitExceeded { .. } => "54000", // program_limit_exceeded
            KestrelError::QueryCanceled(_) => "57014",            // query_canceled
            KestrelError::Config(_) => "F0000",                   // config_file_error
            KestrelError::Transient { .. } => "53000",
            _ => "XX000", // internal_error
        }
    }

    pub fn connection(node: NodeId, reason: impl Into<String>) -> Self {
        KestrelError::Connection {
            node,
            reason: reason.into(),
        }
    }

    /// Construct a transient backpressure error.
    pub fn transient(reason: impl Into<String>, retry_after_ms: u64) -> Self {
        KestrelError::Transient {
            reason: reason.into(),
            retry_after_ms,
        }
    }

    pub fn program_limit(message: impl Into<String>, hint: impl Into<String>) -> Self {
        KestrelError::ProgramLimitExceeded {
            message: message.into(),
            hint: hint.into(),
        }
    }

    /// Construct an internal bug error with error code and context.
    pub fn internal_bug(
        error_code: &'static str,
        message: impl Into<String>,
        debug_context: impl Into<String>,
    ) -> Self {
        KestrelError::InternalBug {
            error_code,
            message: message.into(),
            debug_context: debug_context.into(),
        }
    }

    /// Add context string to an error, preserving its classification where
    /// the variant carries a free-text field. Remote errors are never wrapped.
    pub fn with_context(self, ctx: impl Into<String>) -> Self {
        let ctx = ctx.into();
        match self {
            KestrelError::Internal(msg) => KestrelError::Internal(format!("{ctx}: {msg}")),
            KestrelError::Transient {
                reason,
                retry_after_ms,
            } => KestrelError::Transient {
                reason: format!("{ctx}: {reason}"),
                retry_after_ms,
            },
            KestrelError::Connection { node, reason } => KestrelError::Connection {
                node,
                reason: format!("{ctx}: {reason}"),
            },
            KestrelError::InternalBug {
                error_code,
                message,
                debug_context,
            } => KestrelError::InternalBug {
                error_code,
                message: format!("{ctx}: {message}"),
                debug_context,
            },
            other => other,
        }
    }

    /// Emit a tracing event if this error is an internal bug.
    pub fn log_if_fatal(&self) {
        if let KestrelError::InternalBug {
            error_code,
            message,
            debug_context,
        } = self
        {
            tracing::error!(
                error_code = error_code,
                sqlstate = self.sqlstate(),
                debug_context = debug_context.as_str(),
                "FATAL [{}]: {}",
                error_code,
                message,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_passes_through() {
        let err: KestrelError = RemoteError::new("23505", "duplicate key value")
            .with_detail("Key (id)=(1) already exists.")
            .from_node(NodeId(2))
            .into();
        assert_eq!(err.to_string(), "duplicate key value");
        assert_eq!(err.sqlstate(), "23505");
        assert_eq!(err.kind(), ErrorKind::UserError);
    }

    #[test]
    fn test_producer_error_kind() {
        assert_eq!(
            RemoteError::new(PRODUCER_ERROR_SQLSTATE, "peer failed").kind(),
            RemoteErrorKind::ProducerSide
        );
        assert!(!RemoteError::new("42P01", "no such table").is_producer_error());
    }

    #[test]
    fn test_partial_commit_message_names_nodes() {
        let err = KestrelError::from(TxnError::PartiallyCommitted {
            gid: "T42".into(),
            failed_nodes: vec![NodeId(2), NodeId(3)],
        });
        let msg = err.to_string();
        assert!(msg.contains("T42"));
        assert!(msg.contains("[node:2, node:3]"));
    }

    #[test]
    fn test_classification() {
        assert!(KestrelError::connection(NodeId(1), "reset").is_transient());
        assert!(KestrelError::internal_bug("E-X", "boom", "ctx").is_internal_bug());
        assert!(KestrelError::from(RemoteError::new("40001", "serialization")).is_retryable());
        assert_eq!(KestrelError::QueryCanceled("user request".into()).sqlstate(), "57014");
        assert_eq!(
            KestrelError::program_limit("too many nodes", "raise max_nodes").sqlstate(),
            "54000"
        );
    }

    #[test]
    fn test_with_context_keeps_class() {
        let err = KestrelError::transient("pool exhausted", 50).with_context("acquire");
        assert!(err.is_transient());
        assert!(err.to_string().contains("acquire: pool exhausted"));
    }
}
