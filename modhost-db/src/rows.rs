//! JSON statement execution for sessions driven by guest code.
//!
//! Parameters arrive as a JSON array and rows leave as JSON objects keyed by
//! column name. Blobs are hex strings; nested arrays and objects are bound
//! as their JSON text.

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::params_from_iter;
use serde_json::{Map, Number, Value};

use crate::{PersistenceResult, Session};

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        nested => SqlValue::Text(nested.to_string()),
    }
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(hex::encode(b)),
    }
}

impl Session {
    /// Runs one statement; the number of rows it changed.
    pub fn execute_json(&self, sql: &str, params: &[Value]) -> PersistenceResult<usize> {
        let changed = self.execute(sql, params_from_iter(params.iter().map(to_sql)))?;
        Ok(changed)
    }

    /// Runs a query; one JSON object per row.
    pub fn query_json(&self, sql: &str, params: &[Value]) -> PersistenceResult<Vec<Value>> {
        let mut stmt = self.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut rows = stmt.query(params_from_iter(params.iter().map(to_sql)))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut object = Map::with_capacity(columns.len());
            for (i, column) in columns.iter().enumerate() {
                object.insert(column.clone(), to_json(row.get_ref(i)?));
            }
            out.push(Value::Object(object));
        }
        Ok(out)
    }
}
