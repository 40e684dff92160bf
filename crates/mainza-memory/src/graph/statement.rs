//! Parameterized Cypher statements and the rows they return.
//!
//! Values are always bound through `params`; query text never embeds
//! caller-supplied data.

use serde::Serialize;
use serde_json::{Map, Value};

/// One Cypher statement with its bound parameters
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub text: String,
    pub params: Map<String, Value>,
}

impl Statement {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            params: Map::new(),
        }
    }

    /// Bind a parameter. Values that fail to serialize bind as null.
    pub fn param(mut self, name: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.params.insert(name.to_string(), value);
        self
    }

    pub fn get_param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }
}

/// One result row, addressed by column name
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: std::sync::Arc<Vec<String>>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: std::sync::Arc<Vec<String>>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
            .filter(|v| !v.is_null())
    }

    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(|v| v.as_str())
    }

    pub fn get_string(&self, column: &str) -> Option<String> {
        self.get_str(column).map(str::to_string)
    }

    pub fn get_f64(&self, column: &str) -> Option<f64> {
        self.get(column).and_then(|v| v.as_f64())
    }

    pub fn get_f32(&self, column: &str) -> Option<f32> {
        self.get_f64(column).map(|v| v as f32)
    }

    pub fn get_i64(&self, column: &str) -> Option<i64> {
        self.get(column)
            .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
    }

    pub fn get_bool(&self, column: &str) -> Option<bool> {
        self.get(column).and_then(|v| v.as_bool())
    }

    pub fn get_vec_f32(&self, column: &str) -> Option<Vec<f32>> {
        self.get(column).and_then(|v| v.as_array()).map(|items| {
            items
                .iter()
                .filter_map(|x| x.as_f64().map(|f| f as f32))
                .collect()
        })
    }

    pub fn get_strings(&self, column: &str) -> Vec<String> {
        self.get(column)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|x| x.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Rows produced by one statement
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl QueryResult {
    pub fn from_rows(columns: &[&str], rows: Vec<Vec<Value>>) -> Self {
        let columns: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
        let shared = std::sync::Arc::new(columns.clone());
        Self {
            columns,
            rows: rows
                .into_iter()
                .map(|values| Row::new(shared.clone(), values))
                .collect(),
        }
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
