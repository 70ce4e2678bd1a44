//! Row access and the command-execution seam.

use crate::error::ExecutionError;
use crate::render::RenderedQuery;
use crate::types::{Name, Value};
use serde::{Deserialize, Serialize};

/// Positional access to one result row
pub trait RowReader {
    fn column_count(&self) -> usize;

    fn value(&self, ordinal: usize) -> Result<&Value, ExecutionError>;

    fn is_null(&self, ordinal: usize) -> Result<bool, ExecutionError> {
        Ok(self.value(ordinal)?.is_null())
    }

    fn get_i64(&self, ordinal: usize) -> Result<Option<i64>, ExecutionError> {
        match self.value(ordinal)? {
            Value::Null => Ok(None),
            Value::Number(n) => n.as_i64().map(Some).ok_or_else(|| mismatch(ordinal, "integer")),
            _ => Err(mismatch(ordinal, "integer")),
        }
    }

    fn get_f64(&self, ordinal: usize) -> Result<Option<f64>, ExecutionError> {
        match self.value(ordinal)? {
            Value::Null => Ok(None),
            Value::Number(n) => n.as_f64().map(Some).ok_or_else(|| mismatch(ordinal, "number")),
            _ => Err(mismatch(ordinal, "number")),
        }
    }

    /// Booleans may arrive as `0`/`1` from products without a boolean type
    fn get_bool(&self, ordinal: usize) -> Result<Option<bool>, ExecutionError> {
        match self.value(ordinal)? {
            Value::Null => Ok(None),
            Value::Bool(b) => Ok(Some(*b)),
            Value::Number(n) => Ok(Some(n.as_f64() != Some(0.0))),
            _ => Err(mismatch(ordinal, "bool")),
        }
    }

    fn get_str(&self, ordinal: usize) -> Result<Option<&str>, ExecutionError> {
        match self.value(ordinal)? {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s)),
            _ => Err(mismatch(ordinal, "text")),
        }
    }
}

fn mismatch(ordinal: usize, expected: &str) -> ExecutionError {
    ExecutionError::TypeMismatch {
        ordinal,
        expected: expected.to_string(),
    }
}

/// A buffered result row
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }
}

impl From<Vec<Value>> for Row {
    fn from(values: Vec<Value>) -> Self {
        Self::new(values)
    }
}

impl RowReader for Row {
    fn column_count(&self) -> usize {
        self.values.len()
    }

    fn value(&self, ordinal: usize) -> Result<&Value, ExecutionError> {
        self.values
            .get(ordinal)
            .ok_or(ExecutionError::MissingColumn { ordinal })
    }
}

/// Argument values in the order of a command's parameters
pub type BoundArguments = Vec<(Name, Value)>;

/// Runs rendered commands against a database.
///
/// Connections, transactions and retries live behind this trait.
pub trait QueryExecutor: Send + Sync {
    /// Run a query and buffer its rows
    fn query(
        &self,
        command: &RenderedQuery,
        arguments: &BoundArguments,
    ) -> Result<Vec<Row>, ExecutionError>;

    /// Run a data-modification command, returning the affected row count
    fn execute(
        &self,
        command: &RenderedQuery,
        arguments: &BoundArguments,
    ) -> Result<u64, ExecutionError>;
}
