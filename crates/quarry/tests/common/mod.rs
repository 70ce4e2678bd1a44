//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use quarry::plan::BoundArguments;
use quarry::render::RenderedQuery;
use quarry::{
    DialectRef, EntitySchema, ExecutionError, QueryCompiler, QueryExecutor, Row, ScalarKind,
    SqlServerDialect, SqliteDialect, StaticMapping, Value,
};
use std::sync::{Arc, Mutex};

/// Customers (city first), orders and order lines
pub fn northwind() -> StaticMapping {
    StaticMapping::new()
        .with_entity(
            EntitySchema::new("Customer", "Customers")
                .column("City", ScalarKind::Text)
                .key("CustomerID", ScalarKind::Text)
                .column("CompanyName", ScalarKind::Text)
                .required()
                .column("Phone", ScalarKind::Text)
                .has_many("Orders", "Order", &["CustomerID"], &["CustomerID"]),
        )
        .with_entity(
            EntitySchema::new("Order", "Orders")
                .generated_key("OrderID", ScalarKind::Int)
                .column("CustomerID", ScalarKind::Text)
                .column("OrderDate", ScalarKind::DateTime)
                .has_one("Customer", "Customer", &["CustomerID"], &["CustomerID"]),
        )
}

pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// SQL Server spelling with bare parameter names
pub fn bare_server() -> DialectRef {
    Arc::new(SqlServerDialect::new().with_parameter_prefix(""))
}

pub fn server() -> DialectRef {
    Arc::new(SqlServerDialect::new())
}

pub fn sqlite() -> DialectRef {
    Arc::new(SqliteDialect::new())
}

pub fn compiler(mapping: &StaticMapping, dialect: DialectRef) -> QueryCompiler<'_> {
    QueryCompiler::new(mapping, dialect)
}

/// The part of a statement before its first `FROM`
pub fn select_list(sql: &str) -> &str {
    sql.split(" FROM ").next().unwrap_or(sql)
}

/// Executor answering each query with the rows registered for the table it
/// mentions first, bracketed or quoted
#[derive(Default)]
pub struct FakeExecutor {
    tables: Vec<(String, Vec<Row>)>,
    pub log: Mutex<Vec<(String, BoundArguments)>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(mut self, table: &str, rows: Vec<Vec<Value>>) -> Self {
        self.tables
            .push((table.to_string(), rows.into_iter().map(Row::new).collect()));
        self
    }

    pub fn queries(&self) -> Vec<(String, BoundArguments)> {
        self.log.lock().unwrap().clone()
    }
}

impl QueryExecutor for FakeExecutor {
    fn query(
        &self,
        command: &RenderedQuery,
        arguments: &BoundArguments,
    ) -> Result<Vec<Row>, ExecutionError> {
        self.log
            .lock()
            .unwrap()
            .push((command.sql.clone(), arguments.clone()));
        let position = |table: &str| {
            [format!("[{table}]"), format!("\"{table}\"")]
                .iter()
                .filter_map(|name| command.sql.find(name.as_str()))
                .min()
        };
        self.tables
            .iter()
            .filter_map(|(table, rows)| position(table).map(|at| (at, rows)))
            .min_by_key(|(at, _)| *at)
            .map(|(_, rows)| rows.clone())
            .ok_or_else(|| ExecutionError::Executor(format!("no rows for: {}", command.sql)))
    }

    fn execute(
        &self,
        command: &RenderedQuery,
        arguments: &BoundArguments,
    ) -> Result<u64, ExecutionError> {
        self.log
            .lock()
            .unwrap()
            .push((command.sql.clone(), arguments.clone()));
        Ok(1)
    }
}
