//! K-way merge of individually sorted node streams.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;

use kestrel_common::datum::{Datum, OwnedRow};
use kestrel_common::types::NodeId;

/// One ORDER BY key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortKey {
    pub column: usize,
    pub descending: bool,
    pub nulls_first: bool,
}

impl SortKey {
    pub fn asc(column: usize) -> Self {
        Self {
            column,
            descending: false,
            nulls_first: false,
        }
    }

    pub fn desc(column: usize) -> Self {
        Self {
            column,
            descending: true,
            nulls_first: true,
        }
    }
}

fn compare_datum(a: &Datum, b: &Datum, key: &SortKey) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        // NULL placement is independent of direction.
        (true, false) => {
            if key.nulls_first {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        }
        (false, true) => {
            if key.nulls_first {
                Ordering::Greater
            } else {
                Ordering::Less
            }
        }
        (false, false) => {
            let ord = a.partial_cmp(b).unwrap_or(Ordering::Equal);
            if key.descending {
                ord.reverse()
            } else {
                ord
            }
        }
    }
}

/// Lexicographic comparison of two rows over `keys`.
pub fn compare_rows(a: &OwnedRow, b: &OwnedRow, keys: &[SortKey]) -> Ordering {
    for key in keys {
        let ord = match (a.get(key.column), b.get(key.column)) {
            (Some(x), Some(y)) => compare_datum(x, y, key),
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

struct MergeEntry {
    row: OwnedRow,
    node: NodeId,
    /// Position of the node in the combiner's connection list; breaks ties.
    slot: usize,
    keys: Arc<Vec<SortKey>>,
}

impl PartialEq for MergeEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MergeEntry {}

impl PartialOrd for MergeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_rows(&self.row, &other.row, &self.keys).then(self.slot.cmp(&other.slot))
    }
}

/// Heap holding at most one pending row per node.
pub(crate) struct MergeState {
    keys: Arc<Vec<SortKey>>,
    heap: BinaryHeap<Reverse<MergeEntry>>,
    primed: bool,
}

impl std::fmt::Debug for MergeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeState")
            .field("keys", &self.keys)
            .field("pending", &self.heap.len())
            .field("primed", &self.primed)
            .finish()
    }
}

impl MergeState {
    pub(crate) fn new(keys: Vec<SortKey>) -> Self {
        Self {
            keys: Arc::new(keys),
            heap: BinaryHeap::new(),
            primed: false,
        }
    }

    pub(crate) fn keys(&self) -> &[SortKey] {
        &self.keys
    }

    pub(crate) fn is_primed(&self) -> bool {
        self.primed
    }

    pub(crate) fn set_primed(&mut self) {
        self.primed = true;
    }

    pub(crate) fn push(&mut self, node: NodeId, slot: usize, row: OwnedRow) {
        self.heap.push(Reverse(MergeEntry {
            row,
            node,
            slot,
            keys: self.keys.clone(),
        }));
    }

    /// Smallest pending row and the node to refill from.
    pub(crate) fn pop(&mut self) -> Option<(NodeId, usize, OwnedRow)> {
        self.heap
            .pop()
            .map(|Reverse(e)| (e.node, e.slot, e.row))
    }

    pub(crate) fn clear(&mut self) {
        self.heap.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(vals: &[Option<i64>]) -> OwnedRow {
        OwnedRow::new(
            vals.iter()
                .map(|v| v.map(Datum::Int64).unwrap_or(Datum::Null))
                .collect(),
        )
    }

    #[test]
    fn test_compare_rows_lexicographic() {
        let keys = [SortKey::asc(0), SortKey::desc(1)];
        assert_eq!(
            compare_rows(&r(&[Some(1), Some(5)]), &r(&[Some(1), Some(3)]), &keys),
            Ordering::Less
        );
        assert_eq!(
            compare_rows(&r(&[Some(0), Some(1)]), &r(&[Some(1), Some(9)]), &keys),
            Ordering::Less
        );
    }

    #[test]
    fn test_nulls_placement() {
        let last = [SortKey::asc(0)];
        assert_eq!(
            compare_rows(&r(&[None]), &r(&[Some(1)]), &last),
            Ordering::Greater
        );
        let first = [SortKey {
            column: 0,
            descending: false,
            nulls_first: true,
        }];
        assert_eq!(compare_rows(&r(&[None]), &r(&[Some(1)]), &first), Ordering::Less);
    }

    #[test]
    fn test_heap_pops_in_key_order() {
        let mut m = MergeState::new(vec![SortKey::asc(0)]);
        m.push(NodeId(1), 0, r(&[Some(4)]));
        m.push(NodeId(2), 1, r(&[Some(2)]));
        m.push(NodeId(3), 2, r(&[Some(2)]));
        assert_eq!(m.pop().unwrap().0, NodeId(2));
        assert_eq!(m.pop().unwrap().0, NodeId(3));
        assert_eq!(m.pop().unwrap().0, NodeId(1));
        assert!(m.pop().is_none());
    }
}
