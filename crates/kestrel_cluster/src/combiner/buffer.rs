use std::collections::{BTreeMap, VecDeque};

use kestrel_common::types::NodeId;

use super::tuple::RemoteRow;

/// Rows received but not yet handed to the consumer.
///
/// Without merge sort this is a single FIFO. With merge sort every node has
/// its own tape so the merge can resume each stream exactly where it left
/// off after a connection was drained out of turn.
#[derive(Debug, Default)]
pub(crate) struct RowBuffer {
    fifo: VecDeque<RemoteRow>,
    tapes: BTreeMap<NodeId, VecDeque<RemoteRow>>,
    per_node: bool,
    total_buffered: u64,
}

impl RowBuffer {
    pub(crate) fn new(per_node: bool) -> Self {
        Self {
            per_node,
            ..Default::default()
        }
    }

    pub(crate) fn push(&mut self, row: RemoteRow) {
        self.total_buffered += 1;
        if self.per_node {
            self.tapes.entry(row.node).or_default().push_back(row);
        } else {
            self.fifo.push_back(row);
        }
    }

    pub(crate) fn pop(&mut self) -> Option<RemoteRow> {
        if self.per_node {
            let node = self
                .tapes
                .iter()
                .find(|(_, tape)| !tape.is_empty())
                .map(|(n, _)| *n)?;
            return self.pop_for(node);
        }
        self.fifo.pop_front()
    }

    pub(crate) fn pop_for(&mut self, node: NodeId) -> Option<RemoteRow> {
        if self.per_node {
            self.tapes.get_mut(&node)?.pop_front()
        } else {
            let at = self.fifo.iter().position(|r| r.node == node)?;
            self.fifo.remove(at)
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.fifo.len() + self.tapes.values().map(VecDeque::len).sum::<usize>()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn total_buffered(&self) -> u64 {
        self.total_buffered
    }

    pub(crate) fn clear(&mut self) {
        self.fifo.clear();
        self.tapes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn row(node: u32, v: &'static str) -> RemoteRow {
        RemoteRow {
            node: NodeId(node),
            payload: Bytes::from_static(v.as_bytes()),
        }
    }

    #[test]
    fn test_fifo_keeps_arrival_order() {
        let mut buf = RowBuffer::new(false);
        buf.push(row(1, "a"));
        buf.push(row(2, "b"));
        buf.push(row(1, "c"));
        assert_eq!(buf.pop_for(NodeId(1)).unwrap().payload, "a");
        assert_eq!(buf.pop().unwrap().payload, "b");
        assert_eq!(buf.pop().unwrap().payload, "c");
        assert!(buf.is_empty());
        assert_eq!(buf.total_buffered(), 3);
    }

    #[test]
    fn test_tapes_are_per_node() {
        let mut buf = RowBuffer::new(true);
        buf.push(row(2, "x"));
        buf.push(row(1, "a"));
        buf.push(row(2, "y"));
        assert_eq!(buf.pop_for(NodeId(2)).unwrap().payload, "x");
        assert_eq!(buf.pop_for(NodeId(2)).unwrap().payload, "y");
        assert!(buf.pop_for(NodeId(2)).is_none());
        assert_eq!(buf.len(), 1);
    }
}
