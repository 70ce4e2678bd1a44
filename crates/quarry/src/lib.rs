//! Query translation for mapped entities.
//!
//! Queries are described as [`Expr`] trees of sequence operators over
//! mapped entities. The compiler binds them into relational selects, applies
//! the fetch policy, parameterizes client constants, rewrites the tree into
//! what the target dialect can express, and produces an [`ExecutionPlan`]:
//! SQL text, its parameters and a materializer that turns result rows back
//! into values.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use quarry::{Expr, QueryCompiler, SqlServerDialect, StaticMapping};
//!
//! let compiler = QueryCompiler::new(&mapping, Arc::new(SqlServerDialect::new()));
//! let query = Expr::source("Customer")
//!     .filter("c", |c| c.member("City").equal(Expr::constant("London")));
//!
//! let rendered = compiler.render(&query)?;
//! let customers = compiler.query(&query, &executor)?;
//! ```

pub mod binder;
pub mod cache;
pub mod command;
pub mod compiler;
pub mod config;
pub mod dialect;
pub mod error;
pub mod expr;
pub mod mapping;
pub mod parameterizer;
pub mod plan;
pub mod policy;
pub mod projector;
pub mod render;
pub mod transform;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports
pub use cache::{PlanCache, QuerySignature};
pub use command::CommandBuilder;
pub use compiler::{PreparedQuery, QueryCompiler};
pub use config::CompilerConfig;
pub use dialect::{dialect_by_name, Dialect, DialectRef, SqlServerDialect, SqliteDialect};
pub use error::{
    ConfigError, ExecutionError, QueryError, QueryResult, RenderError, TranslationError,
    TranslationResult,
};
pub use expr::{Expr, ScalarFunction};
pub use mapping::{EntityMapping, EntitySchema, StaticMapping};
pub use plan::{build_plan, Arguments, ExecutionPlan, QueryExecutor, Row, RowReader};
pub use policy::QueryPolicy;
pub use render::{format, QueryRenderer, RenderedQuery, SqlFormatter};
pub use types::{ScalarKind, Value};
