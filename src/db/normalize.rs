// Result Normalizer
// Converts family-native results into the wire shapes handed to callers.
// Pure and stateless; timing is done by the dispatcher.

use crate::db::traits::{CellValue, DatabaseFamily, NativeResult};
use mongodb::bson::{Bson, Document};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// One result row: column name to value, in declared column order
pub type Row = Map<String, JsonValue>;

/// Reply fields that only describe command status
const STATUS_FIELDS: [&str; 3] = ["ok", "$clusterTime", "operationTime"];

/// Normalized query result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum QueryResult {
    /// Tabular rows (relational result sets and unwrapped cursor batches)
    #[serde(rename_all = "camelCase")]
    Rows {
        columns: Vec<String>,
        rows: Vec<Row>,
        #[serde(skip_serializing_if = "Option::is_none")]
        rows_affected: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_insert_id: Option<i64>,
    },
    /// Command reply without a batch, kept as an opaque document
    Document { result: JsonValue, rows: Vec<Row> },
}

impl QueryResult {
    pub fn rows(&self) -> &[Row] {
        match self {
            QueryResult::Rows { rows, .. } | QueryResult::Document { rows, .. } => rows,
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows().len()
    }
}

/// Normalize a native result for the given family
pub fn normalize(native: NativeResult, family: DatabaseFamily) -> QueryResult {
    match (native, family) {
        (NativeResult::Rows { columns, rows }, _) => QueryResult::Rows {
            rows: rows
                .into_iter()
                .map(|cells| {
                    columns
                        .iter()
                        .cloned()
                        .zip(cells.into_iter().map(cell_to_json))
                        .collect()
                })
                .collect(),
            columns,
            rows_affected: None,
            last_insert_id: None,
        },
        (
            NativeResult::Affected {
                rows_affected,
                last_insert_rowid,
            },
            _,
        ) => QueryResult::Rows {
            columns: Vec::new(),
            rows: Vec::new(),
            rows_affected: Some(rows_affected),
            last_insert_id: Some(last_insert_rowid),
        },
        (NativeResult::Document(reply), _) => normalize_reply(reply),
    }
}

/// Relational cell to JSON; NULL stays null, blobs become byte arrays
pub fn cell_to_json(cell: CellValue) -> JsonValue {
    match cell {
        CellValue::Null => JsonValue::Null,
        CellValue::Bool(v) => JsonValue::Bool(v),
        CellValue::Int(v) => JsonValue::from(v),
        CellValue::Float(v) => serde_json::Number::from_f64(v)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        CellValue::String(v) => JsonValue::String(v),
        CellValue::Binary(bytes) => {
            JsonValue::Array(bytes.into_iter().map(JsonValue::from).collect())
        }
    }
}

fn normalize_reply(reply: Document) -> QueryResult {
    if let Some(batch) = cursor_batch(&reply) {
        let rows: Vec<Row> = batch
            .iter()
            .map(|item| match bson_to_json(item.clone()) {
                JsonValue::Object(map) => map,
                other => {
                    let mut map = Map::new();
                    map.insert("value".to_string(), other);
                    map
                }
            })
            .collect();

        let mut columns: Vec<String> = Vec::new();
        for row in &rows {
            for key in row.keys() {
                if !columns.iter().any(|c| c == key) {
                    columns.push(key.clone());
                }
            }
        }

        return QueryResult::Rows {
            columns,
            rows,
            rows_affected: None,
            last_insert_id: None,
        };
    }

    let payload: Document = reply
        .iter()
        .filter(|(key, _)| !STATUS_FIELDS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    let rows = if payload.is_empty() {
        Vec::new()
    } else {
        match bson_to_json(Bson::Document(payload)) {
            JsonValue::Object(map) => vec![map],
            _ => Vec::new(),
        }
    };

    QueryResult::Document {
        result: bson_to_json(Bson::Document(reply)),
        rows,
    }
}

/// `cursor.firstBatch` (initial reply) or `cursor.nextBatch` (getMore).
/// Only this batch is returned; the adapter kills any cursor left open.
fn cursor_batch(reply: &Document) -> Option<&Vec<Bson>> {
    let cursor = reply.get_document("cursor").ok()?;
    cursor
        .get_array("firstBatch")
        .or_else(|_| cursor.get_array("nextBatch"))
        .ok()
}

fn bson_to_json(value: Bson) -> JsonValue {
    value.into_relaxed_extjson()
}
