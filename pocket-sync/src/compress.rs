use crate::change::ChangeRecord;
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const COLUMNAR_ENCODING: &str = "columnar";

/// Column-oriented encoding of a change batch: the field schema is taken
/// from the first record (extended in order of first appearance when later
/// records carry extra keys) and every record becomes a value array aligned
/// to that schema, with nulls for absent fields.
///
/// The only contract is that `unpack(pack(xs))` yields `xs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnarBatch {
    pub encoding: String,
    pub schema: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl ColumnarBatch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

pub fn pack(records: &[ChangeRecord]) -> Result<ColumnarBatch> {
    let mut objects = Vec::with_capacity(records.len());
    let mut schema: Vec<String> = Vec::new();

    for record in records {
        let value = serde_json::to_value(record)?;
        let object = match value {
            Value::Object(m) => m,
            other => {
                return Err(SyncError::Protocol(format!(
                    "change record serialized to non-object: {other}"
                )));
            }
        };
        for key in object.keys() {
            if !schema.iter().any(|k| k == key) {
                schema.push(key.clone());
            }
        }
        objects.push(object);
    }

    let rows = objects
        .into_iter()
        .map(|mut object| {
            schema
                .iter()
                .map(|key| object.remove(key).unwrap_or(Value::Null))
                .collect()
        })
        .collect();

    Ok(ColumnarBatch {
        encoding: COLUMNAR_ENCODING.to_string(),
        schema,
        rows,
    })
}

pub fn unpack(batch: &ColumnarBatch) -> Result<Vec<ChangeRecord>> {
    if batch.encoding != COLUMNAR_ENCODING {
        return Err(SyncError::Protocol(format!(
            "unknown batch encoding {:?}",
            batch.encoding
        )));
    }
    let mut records = Vec::with_capacity(batch.rows.len());
    for row in batch.rows.iter() {
        if row.len() != batch.schema.len() {
            return Err(SyncError::Protocol(format!(
                "columnar row arity {} does not match schema arity {}",
                row.len(),
                batch.schema.len()
            )));
        }
        let mut object = Map::new();
        for (key, value) in batch.schema.iter().zip(row.iter()) {
            // Null marks a field the record never carried; re-inserting it
            // would break fields that default on absence but reject null.
            if !value.is_null() {
                object.insert(key.clone(), value.clone());
            }
        }
        records.push(serde_json::from_value(Value::Object(object))?);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{Document, Operation};
    use crate::vclock::VectorClock;
    use serde_json::json;

    fn record(id: &str, op: Operation, doc: Option<Value>) -> ChangeRecord {
        ChangeRecord {
            collection: "todos".into(),
            document_id: id.into(),
            operation: op,
            document: doc.map(|fields| {
                let mut d = Document::new(id, fields.as_object().cloned().unwrap_or_default());
                d.rev = Some("1-abc".into());
                d.vclock.increment("a");
                d
            }),
            previous_document: None,
            sequence: None,
            timestamp: 42,
            node_id: "a".into(),
            vclock: VectorClock::from([("a", 1)]),
            from_sync: false,
        }
    }

    #[test]
    fn pack_unpack_identity() {
        let records = vec![
            record("t1", Operation::Insert, Some(json!({"title": "one"}))),
            record("t2", Operation::Update, Some(json!({"title": "two"}))),
            record("t3", Operation::Delete, None),
        ];
        let batch = pack(&records).unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(unpack(&batch).unwrap(), records);
    }

    #[test]
    fn schema_extends_for_ragged_records() {
        // First record has no sequence; a later one does. The schema grows
        // and earlier rows read null for the extra column.
        let mut with_seq = record("t2", Operation::Insert, Some(json!({"n": 2})));
        with_seq.sequence = Some(9);
        let records = vec![
            record("t1", Operation::Delete, None),
            with_seq,
        ];
        let batch = pack(&records).unwrap();
        assert!(batch.schema.contains(&"sequence".to_string()));
        assert_eq!(unpack(&batch).unwrap(), records);
    }

    #[test]
    fn mixed_default_flags_round_trip() {
        // Only the second record serializes a from_sync key; the first row
        // reads null for that column and must come back with the default.
        let plain = record("t1", Operation::Insert, Some(json!({"x": 1})));
        let mut synced = record("t2", Operation::Insert, Some(json!({"x": 2})));
        synced.from_sync = true;
        let records = vec![plain, synced];
        let batch = pack(&records).unwrap();
        assert_eq!(unpack(&batch).unwrap(), records);
    }

    #[test]
    fn empty_batch() {
        let batch = pack(&[]).unwrap();
        assert!(batch.is_empty());
        assert_eq!(unpack(&batch).unwrap(), Vec::<ChangeRecord>::new());
    }

    #[test]
    fn rejects_wrong_arity() {
        let records = vec![record("t1", Operation::Insert, Some(json!({"x": 1})))];
        let mut batch = pack(&records).unwrap();
        batch.rows[0].pop();
        assert!(unpack(&batch).is_err());
    }

    #[test]
    fn rejects_unknown_encoding() {
        let mut batch = pack(&[]).unwrap();
        batch.encoding = "zstd".into();
        assert!(unpack(&batch).is_err());
    }
}
