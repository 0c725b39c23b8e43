//! Distributed query execution and transaction coordination.
//!
//! A coordinator session leases one connection per data node, fans remote
//! statements out through a [`ResponseCombiner`], merges the replies into a
//! single row stream, and at transaction end drives plain or two-phase
//! commit across every node it touched.

pub mod barrier;
pub mod combiner;
pub mod connection;
pub mod gtm;
pub mod in_process;
pub mod locator;
pub mod plan;
pub mod pool;
pub mod remote_copy;
pub mod remote_query;
pub mod session;
pub mod transport;
pub mod two_phase;

pub use barrier::BarrierLock;
pub use combiner::{
    CombineType, CombinerId, CombinerState, CombinerSummary, RemoteRow, ResponseCombiner,
    ResponseOutcome, SortKey, TupleDesc,
};
pub use connection::{ConnState, NodeConnection};
pub use gtm::{GlobalOutcome, InDoubtTxn, LocalGtm, TransactionIdService};
pub use in_process::{InProcessCluster, InProcessPoolManager, JournalEntry, JournalEvent, Reply};
pub use locator::{
    AccessType, DistributionStrategy, ExecNodes, InMemoryCatalog, Locator, LocatorCatalog,
    RelationLocInfo,
};
pub use plan::{execute_plan, ExecState, PlanNode, QueryResult, RemoteSubplan};
pub use pool::{CancelKey, LeasedSocket, PoolClient, PoolManager, PoolStats, TcpPoolManager};
pub use remote_copy::{copy_from, copy_to, CopyRow};
pub use remote_query::{close_statement, execute_utility, RemoteQueryState, RemoteStep};
pub use session::{DriveUntil, SessionContext};
pub use transport::NodeSocket;
pub use two_phase::{DistributedTxnState, NodeTxnStatus, TwoPhaseCoordinator, TxnPhaseStatus};
