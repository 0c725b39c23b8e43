//! Relation → data node routing.
//!
//! A [`Locator`] answers "which nodes must this access touch" for one
//! relation. Hash and modulo routing are pure functions of the key and the
//! node count. Round-robin state is the only mutable piece and is shared by
//! every locator built from the same [`RelationLocInfo`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use xxhash_rust::xxh3::xxh3_64;

use kestrel_common::datum::Datum;
use kestrel_common::error::{ClusterError, KestrelResult};
use kestrel_common::types::{DataType, NodeId, RelationId};

/// How a relation's rows are spread over its nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributionStrategy {
    Hash,
    Modulo,
    RoundRobin,
    Replicated,
    Single,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Read,
    ReadForUpdate,
    Insert,
    Write,
}

impl AccessType {
    pub fn is_write(self) -> bool {
        matches!(self, AccessType::Insert | AccessType::Write)
    }
}

/// Distribution metadata of one relation.
#[derive(Debug)]
pub struct RelationLocInfo {
    pub relation: RelationId,
    pub strategy: DistributionStrategy,
    pub nodes: Vec<NodeId>,
    pub key_column: Option<usize>,
    pub key_type: Option<DataType>,
    /// Replicated writes go here first.
    pub primary: Option<NodeId>,
    rr_cursor: AtomicUsize,
}

impl RelationLocInfo {
    pub fn new(relation: RelationId, strategy: DistributionStrategy, nodes: Vec<NodeId>) -> Self {
        Self {
            relation,
            strategy,
            nodes,
            key_column: None,
            key_type: None,
            primary: None,
            rr_cursor: AtomicUsize::new(0),
        }
    }

    pub fn with_key(mut self, column: usize, key_type: DataType) -> Self {
        self.key_column = Some(column);
        self.key_type = Some(key_type);
        self
    }

    pub fn with_primary(mut self, primary: NodeId) -> Self {
        self.primary = Some(primary);
        self
    }

    pub fn is_replicated(&self) -> bool {
        self.strategy == DistributionStrategy::Replicated
    }

    /// Advance the shared cursor and return the node it lands on.
    ///
    /// Concurrent callers may observe the same slot; fairness is best-effort.
    fn next_round_robin(&self) -> NodeId {
        let n = self.nodes.len();
        let slot = self.rr_cursor.fetch_add(1, Ordering::Relaxed) % n;
        self.nodes[slot]
    }
}

/// Target node set for one access. `primary`, when set, is not repeated in
/// `nodes` and must be handled before them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecNodes {
    pub primary: Option<NodeId>,
    pub nodes: Vec<NodeId>,
}

impl ExecNodes {
    pub fn single(node: NodeId) -> Self {
        Self {
            primary: None,
            nodes: vec![node],
        }
    }

    pub fn all_of(nodes: Vec<NodeId>) -> Self {
        Self {
            primary: None,
            nodes,
        }
    }

    /// Every target, primary first.
    pub fn all(&self) -> Vec<NodeId> {
        let mut out = Vec::with_capacity(self.nodes.len() + 1);
        out.extend(self.primary);
        out.extend(self.nodes.iter().copied());
        out
    }

    pub fn len(&self) -> usize {
        self.nodes.len() + usize::from(self.primary.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Routing for one relation under the current session's preferences.
#[derive(Debug, Clone)]
pub struct Locator {
    info: Arc<RelationLocInfo>,
    preferred: Vec<NodeId>,
}

impl Locator {
    pub fn new(info: Arc<RelationLocInfo>, preferred: Vec<NodeId>) -> Self {
        Self { info, preferred }
    }

    pub fn info(&self) -> &RelationLocInfo {
        &self.info
    }

    pub fn target_nodes(&self, access: AccessType, key: Option<&Datum>) -> KestrelResult<ExecNodes> {
        let info = &self.info;
        if info.nodes.is_empty() {
            return Err(ClusterError::NoTargetNodes(info.relation).into());
        }

        let nodes = match info.strategy {
            DistributionStrategy::Replicated => match access {
                AccessType::Write | AccessType::Insert => self.replicated_write(),
                AccessType::ReadForUpdate => match self.primary_in_list() {
                    Some(p) => ExecNodes::single(p),
                    None => self.replicated_read(),
                },
                AccessType::Read => self.replicated_read(),
            },
            DistributionStrategy::Hash | DistributionStrategy::Modulo => {
                match key.filter(|k| !k.is_null()) {
                    Some(k) => ExecNodes::single(self.node_for_key(k)?),
                    None if access == AccessType::Insert => ExecNodes::single(info.nodes[0]),
                    None => ExecNodes::all_of(info.nodes.clone()),
                }
            }
            DistributionStrategy::RoundRobin => {
                if access == AccessType::Insert {
                    ExecNodes::single(info.next_round_robin())
                } else {
                    ExecNodes::all_of(info.nodes.clone())
                }
            }
            DistributionStrategy::Single => ExecNodes::single(info.nodes[0]),
        };
        tracing::trace!(relation = %info.relation, ?access, targets = ?nodes, "located");
        Ok(nodes)
    }

    /// Single node owning `key`. Same key and node count, same node.
    pub fn node_for_key(&self, key: &Datum) -> KestrelResult<NodeId> {
        let info = &self.info;
        let n = info.nodes.len();
        let slot = match info.strategy {
            DistributionStrategy::Modulo => {
                let v = key.as_i64().ok_or_else(|| {
                    ClusterError::InvalidDistributionKey(format!(
                        "modulo distribution of {} needs an integer key, got {}",
                        info.relation, key
                    ))
                })?;
                v.rem_euclid(n as i64) as usize
            }
            _ => {
                let bytes = key.distribution_bytes().ok_or_else(|| {
                    ClusterError::InvalidDistributionKey(format!("NULL key for {}", info.relation))
                })?;
                (xxh3_64(&bytes) % n as u64) as usize
            }
        };
        Ok(info.nodes[slot])
    }

    fn primary_in_list(&self) -> Option<NodeId> {
        self.info.primary.filter(|p| self.info.nodes.contains(p))
    }

    fn replicated_write(&self) -> ExecNodes {
        match self.primary_in_list() {
            Some(p) => ExecNodes {
                primary: Some(p),
                nodes: self.info.nodes.iter().copied().filter(|n| *n != p).collect(),
            },
            None => ExecNodes::all_of(self.info.nodes.clone()),
        }
    }

    fn replicated_read(&self) -> ExecNodes {
        match self.preferred.iter().find(|p| self.info.nodes.contains(p)) {
            Some(p) => ExecNodes::single(*p),
            None => ExecNodes::single(self.info.next_round_robin()),
        }
    }
}

/// Relation distribution metadata provider.
pub trait LocatorCatalog: Send + Sync {
    fn relation(&self, relation: RelationId) -> Option<Arc<RelationLocInfo>>;

    fn locator(&self, relation: RelationId, preferred: &[NodeId]) -> KestrelResult<Locator> {
        let info = self
            .relation(relation)
            .ok_or(ClusterError::RelationNotFound(relation))?;
        Ok(Locator::new(info, preferred.to_vec()))
    }
}

/// Catalog held in memory; used by the coordinator binary and tests.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    relations: RwLock<HashMap<RelationId, Arc<RelationLocInfo>>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, info: RelationLocInfo) -> Arc<RelationLocInfo> {
        let info = Arc::new(info);
        self.relations.write().insert(info.relation, info.clone());
        info
    }

    pub fn drop_relation(&self, relation: RelationId) -> bool {
        self.relations.write().remove(&relation).is_some()
    }

    pub fn len(&self) -> usize {
        self.relations.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.read().is_empty()
    }
}

impl LocatorCatalog for InMemoryCatalog {
    fn relation(&self, relation: RelationId) -> Option<Arc<RelationLocInfo>> {
        self.relations.read().get(&relation).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn nodes(ids: &[u32]) -> Vec<NodeId> {
        ids.iter().map(|i| NodeId(*i)).collect()
    }

    fn locator(strategy: DistributionStrategy) -> Locator {
        let info = RelationLocInfo::new(RelationId(1), strategy, nodes(&[1, 2, 3, 4]))
            .with_key(0, DataType::Int64);
        Locator::new(Arc::new(info), vec![])
    }

    #[test]
    fn test_hash_is_deterministic() {
        let loc = locator(DistributionStrategy::Hash);
        for k in 0..200i64 {
            let a = loc.target_nodes(AccessType::Read, Some(&Datum::Int64(k))).unwrap();
            let b = loc.target_nodes(AccessType::Write, Some(&Datum::Int64(k))).unwrap();
            assert_eq!(a.len(), 1);
            assert_eq!(a, b);
        }
        // Integer width does not change routing.
        assert_eq!(
            loc.node_for_key(&Datum::Int32(17)).unwrap(),
            loc.node_for_key(&Datum::Int64(17)).unwrap()
        );
    }

    #[test]
    fn test_modulo_routing() {
        let loc = locator(DistributionStrategy::Modulo);
        assert_eq!(loc.node_for_key(&Datum::Int64(5)).unwrap(), NodeId(2));
        assert_eq!(loc.node_for_key(&Datum::Int64(-1)).unwrap(), NodeId(4));
        let err = loc
            .target_nodes(AccessType::Read, Some(&Datum::Text("x".into())))
            .unwrap_err();
        assert_eq!(err.sqlstate(), "22023");
    }

    #[test]
    fn test_missing_key() {
        let loc = locator(DistributionStrategy::Hash);
        assert_eq!(
            loc.target_nodes(AccessType::Insert, Some(&Datum::Null)).unwrap(),
            ExecNodes::single(NodeId(1))
        );
        assert_eq!(loc.target_nodes(AccessType::Write, None).unwrap().len(), 4);
        assert_eq!(loc.target_nodes(AccessType::Read, None).unwrap().len(), 4);
    }

    #[test]
    fn test_round_robin_insert_cycles() {
        let info = Arc::new(RelationLocInfo::new(
            RelationId(9),
            DistributionStrategy::RoundRobin,
            nodes(&[1, 2, 3]),
        ));
        let a = Locator::new(info.clone(), vec![]);
        let b = Locator::new(info, vec![]);
        let mut seen = HashSet::new();
        for i in 0..3 {
            let loc = if i % 2 == 0 { &a } else { &b };
            let t = loc.target_nodes(AccessType::Insert, None).unwrap();
            seen.insert(t.nodes[0]);
        }
        assert_eq!(seen.len(), 3);
        assert_eq!(a.target_nodes(AccessType::Read, None).unwrap().len(), 3);
    }

    #[test]
    fn test_replicated_write_primary_first() {
        let info = RelationLocInfo::new(
            RelationId(2),
            DistributionStrategy::Replicated,
            nodes(&[1, 2, 3]),
        )
        .with_primary(NodeId(1));
        let loc = Locator::new(Arc::new(info), vec![NodeId(3)]);
        let t = loc.target_nodes(AccessType::Insert, None).unwrap();
        assert_eq!(t.primary, Some(NodeId(1)));
        assert_eq!(t.nodes, nodes(&[2, 3]));
        assert_eq!(t.all(), nodes(&[1, 2, 3]));

        assert_eq!(
            loc.target_nodes(AccessType::ReadForUpdate, None).unwrap(),
            ExecNodes::single(NodeId(1))
        );
        assert_eq!(
            loc.target_nodes(AccessType::Read, None).unwrap(),
            ExecNodes::single(NodeId(3))
        );
    }

    #[test]
    fn test_catalog_lookup() {
        let catalog = InMemoryCatalog::new();
        catalog.register(RelationLocInfo::new(
            RelationId(7),
            DistributionStrategy::Single,
            nodes(&[2]),
        ));
        let loc = catalog.locator(RelationId(7), &[]).unwrap();
        assert_eq!(
            loc.target_nodes(AccessType::Write, None).unwrap(),
            ExecNodes::single(NodeId(2))
        );
        assert!(catalog.locator(RelationId(8), &[]).is_err());
    }
}
