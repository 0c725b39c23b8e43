use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::types::DataType;

/// A single scalar value materialized from a remote data row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Datum {
    Null,
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Text(String),
    Bytea(Vec<u8>),
}

impl Datum {
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Datum::Null => None,
            Datum::Boolean(_) => Some(DataType::Boolean),
            Datum::Int32(_) => Some(DataType::Int32),
            Datum::Int64(_) => Some(DataType::Int64),
            Datum::Float64(_) => Some(DataType::Float64),
            Datum::Text(_) => Some(DataType::Text),
            Datum::Bytea(_) => Some(DataType::Bytea),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Datum::Int32(v) => Some(*v as i64),
            Datum::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Datum::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Encode to PG text format. `None` for NULL.
    pub fn to_pg_text(&self) -> Option<String> {
        match self {
            Datum::Null => None,
            Datum::Boolean(b) => Some(if *b { "t".into() } else { "f".into() }),
            Datum::Int32(v) => Some(v.to_string()),
            Datum::Int64(v) => Some(v.to_string()),
            Datum::Float64(v) => Some(v.to_string()),
            Datum::Text(s) => Some(s.clone()),
            Datum::Bytea(bytes) => {
                let mut out = String::with_capacity(2 + bytes.len() * 2);
                out.push_str("\\x");
                for b in bytes {
                    out.push_str(&format!("{:02x}", b));
                }
                Some(out)
            }
        }
    }

    /// Decode a PG text-format value of the given type.
    /// Returns `None` when the text does not parse as that type.
    pub fn from_pg_text(data_type: DataType, text: &str) -> Option<Datum> {
        match data_type {
            DataType::Boolean => match text {
                "t" | "true" | "TRUE" | "on" | "1" => Some(Datum::Boolean(true)),
                "f" | "false" | "FALSE" | "off" | "0" => Some(Datum::Boolean(false)),
                _ => None,
            },
            DataType::Int32 => text.trim().parse().ok().map(Datum::Int32),
            DataType::Int64 => text.trim().parse().ok().map(Datum::Int64),
            DataType::Float64 => text.trim().parse().ok().map(Datum::Float64),
            DataType::Text => Some(Datum::Text(text.to_string())),
            DataType::Bytea => {
                let hex = text.strip_prefix("\\x")?;
                if hex.len() % 2 != 0 {
                    return None;
                }
                let mut out = Vec::with_capacity(hex.len() / 2);
                for i in (0..hex.len()).step_by(2) {
                    out.push(u8::from_str_radix(hex.get(i..i + 2)?, 16).ok()?);
                }
                Some(Datum::Bytea(out))
            }
        }
    }

    /// Stable byte encoding used as input to distribution hashing.
    /// Integers of either width encode identically so `Int32(5)` and
    /// `Int64(5)` route to the same node.
    pub fn distribution_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Datum::Null => None,
            Datum::Boolean(b) => Some(vec![*b as u8]),
            Datum::Int32(v) => Some((*v as i64).to_be_bytes().to_vec()),
            Datum::Int64(v) => Some(v.to_be_bytes().to_vec()),
            Datum::Float64(v) => Some(v.to_bits().to_be_bytes().to_vec()),
            Datum::Text(s) => Some(s.as_bytes().to_vec()),
            Datum::Bytea(b) => Some(b.clone()),
        }
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_pg_text() {
            Some(text) => f.write_str(&text),
            None => f.write_str("NULL"),
        }
    }
}

impl PartialEq for Datum {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Datum::Null, Datum::Null) => true,
            (Datum::Bytea(a), Datum::Bytea(b)) => a == b,
            (Datum::Text(a), Datum::Text(b)) => a == b,
            (Datum::Boolean(a), Datum::Boolean(b)) => a == b,
            _ => matches!(self.partial_cmp(other), Some(Ordering::Equal)),
        }
    }
}

impl PartialOrd for Datum {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Datum::Null, _) | (_, Datum::Null) => None,
            (Datum::Boolean(a), Datum::Boolean(b)) => a.partial_cmp(b),
            (Datum::Int32(a), Datum::Int32(b)) => a.partial_cmp(b),
            (Datum::Int64(a), Datum::Int64(b)) => a.partial_cmp(b),
            (Datum::Int32(a), Datum::Int64(b)) => (*a as i64).partial_cmp(b),
            (Datum::Int64(a), Datum::Int32(b)) => a.partial_cmp(&(*b as i64)),
            (Datum::Float64(a), Datum::Float64(b)) => a.partial_cmp(b),
            (Datum::Float64(a), Datum::Int32(b)) => a.partial_cmp(&(*b as f64)),
            (Datum::Float64(a), Datum::Int64(b)) => a.partial_cmp(&(*b as f64)),
            (Datum::Int32(a), Datum::Float64(b)) => (*a as f64).partial_cmp(b),
            (Datum::Int64(a), Datum::Float64(b)) => (*a as f64).partial_cmp(b),
            (Datum::Text(a), Datum::Text(b)) => a.partial_cmp(b),
            (Datum::Bytea(a), Datum::Bytea(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

/// A row is an ordered list of datums.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnedRow {
    pub values: Vec<Datum>,
}

impl OwnedRow {
    pub fn new(values: Vec<Datum>) -> Self {
        Self { values }
    }

    pub fn get(&self, idx: usize) -> Option<&Datum> {
        self.values.get(idx)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Display for OwnedRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pg_text_parse() {
        assert_eq!(Datum::from_pg_text(DataType::Int32, "42"), Some(Datum::Int32(42)));
        assert_eq!(Datum::from_pg_text(DataType::Boolean, "t"), Some(Datum::Boolean(true)));
        assert_eq!(Datum::from_pg_text(DataType::Int64, "x"), None);
        assert_eq!(
            Datum::from_pg_text(DataType::Bytea, "\\x0aff"),
            Some(Datum::Bytea(vec![0x0a, 0xff]))
        );
    }

    #[test]
    fn test_cross_width_integer_compare() {
        assert_eq!(Datum::Int32(7), Datum::Int64(7));
        assert!(Datum::Int32(3) < Datum::Int64(9));
        assert_eq!(Datum::Null.partial_cmp(&Datum::Int32(1)), None);
    }

    #[test]
    fn test_distribution_bytes_width_independent() {
        assert_eq!(
            Datum::Int32(5).distribution_bytes(),
            Datum::Int64(5).distribution_bytes()
        );
        assert!(Datum::Null.distribution_bytes().is_none());
    }

    #[test]
    fn test_row_display() {
        let row = OwnedRow::new(vec![Datum::Int32(1), Datum::Null, Datum::Text("a".into())]);
        assert_eq!(row.to_string(), "(1, NULL, a)");
    }
}
