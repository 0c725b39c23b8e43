use bytes::Bytes;

use kestrel_common::datum::{Datum, OwnedRow};
use kestrel_common::error::{KestrelResult, ProtocolError};
use kestrel_common::types::{DataType, NodeId};
use kestrel_protocol::{decode_data_row, FieldDescription};

/// One data row as received, tagged with the node that sent it.
/// The payload is copied out of the connection buffer on receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRow {
    pub node: NodeId,
    pub payload: Bytes,
}

/// Shape of the rows a combiner produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TupleDesc {
    fields: Vec<FieldDescription>,
    types: Vec<DataType>,
}

impl TupleDesc {
    pub fn new(fields: Vec<FieldDescription>) -> Self {
        let types = fields
            .iter()
            .map(|f| DataType::from_type_name(&f.type_name))
            .collect();
        Self { fields, types }
    }

    pub fn fields(&self) -> &[FieldDescription] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    pub fn data_types(&self) -> &[DataType] {
        &self.types
    }

    /// Materialize a text-format DataRow payload.
    pub fn decode_row(&self, payload: &Bytes) -> KestrelResult<OwnedRow> {
        let raw = decode_data_row(payload)?;
        if raw.len() != self.types.len() {
            return Err(ProtocolError::InvalidMessage(format!(
                "data row has {} columns, row description has {}",
                raw.len(),
                self.types.len()
            ))
            .into());
        }
        let mut values = Vec::with_capacity(raw.len());
        for (i, (value, ty)) in raw.iter().zip(&self.types).enumerate() {
            let datum = match value {
                None => Datum::Null,
                Some(bytes) => {
                    let text = std::str::from_utf8(bytes).map_err(|e| {
                        ProtocolError::InvalidMessage(format!("column {} is not UTF-8: {}", i, e))
                    })?;
                    Datum::from_pg_text(*ty, text).ok_or_else(|| {
                        ProtocolError::InvalidMessage(format!(
                            "column {} value {:?} is not a valid {}",
                            i, text, ty
                        ))
                    })?
                }
            };
            values.push(datum);
        }
        Ok(OwnedRow::new(values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_protocol::encode_data_row;

    fn desc() -> TupleDesc {
        TupleDesc::new(vec![
            FieldDescription::new("id", "int4"),
            FieldDescription::new("name", "text"),
        ])
    }

    #[test]
    fn test_decode_row() {
        let row = desc()
            .decode_row(&encode_data_row(&[Some("7"), None]))
            .unwrap();
        assert_eq!(row.values, vec![Datum::Int32(7), Datum::Null]);
    }

    #[test]
    fn test_column_count_mismatch() {
        assert!(desc().decode_row(&encode_data_row(&[Some("7")])).is_err());
        assert!(desc()
            .decode_row(&encode_data_row(&[Some("x"), Some("y")]))
            .is_err());
    }
}
