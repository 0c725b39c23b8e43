use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a data node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

/// Top-level (global) transaction identifier handed out by the GTM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnId(pub u64);

/// Identifier of a distributed relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelationId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node:{}", self.0)
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

impl fmt::Display for RelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rel:{}", self.0)
    }
}

/// Render a node list as `[node:1, node:3]` for log lines and error text.
pub fn join_nodes(nodes: &[NodeId]) -> String {
    let parts: Vec<String> = nodes.iter().map(|n| n.to_string()).collect();
    format!("[{}]", parts.join(", "))
}

/// Column types understood by the coordinator when materializing remote rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    Int32,
    Int64,
    Float64,
    Text,
    Bytea,
}

impl DataType {
    /// Map a type name as sent in a RowDescription. Unknown names fall back to text.
    pub fn from_type_name(name: &str) -> DataType {
        match name.to_ascii_lowercase().as_str() {
            "bool" | "boolean" => DataType::Boolean,
            "int2" | "int4" | "integer" | "smallint" => DataType::Int32,
            "int8" | "bigint" => DataType::Int64,
            "float4" | "float8" | "real" | "double precision" | "numeric" => DataType::Float64,
            "bytea" => DataType::Bytea,
            _ => DataType::Text,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            DataType::Boolean => "bool",
            DataType::Int32 => "int4",
            DataType::Int64 => "int8",
            DataType::Float64 => "float8",
            DataType::Text => "text",
            DataType::Bytea => "bytea",
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, DataType::Int32 | DataType::Int64)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_ids() {
        assert_eq!(NodeId(3).to_string(), "node:3");
        assert_eq!(TxnId(42).to_string(), "txn:42");
        assert_eq!(join_nodes(&[NodeId(1), NodeId(2)]), "[node:1, node:2]");
    }

    #[test]
    fn test_type_names() {
        assert_eq!(DataType::from_type_name("INT4"), DataType::Int32);
        assert_eq!(DataType::from_type_name("bigint"), DataType::Int64);
        assert_eq!(DataType::from_type_name("varchar"), DataType::Text);
        assert!(DataType::Int64.is_integer());
        assert!(!DataType::Text.is_integer());
    }
}
