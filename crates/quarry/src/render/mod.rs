//! SQL renderers.
//!
//! Renderers turn a rewritten select or command into dialect SQL text plus
//! the parameters it binds, in order of first appearance.

mod formatter;

pub use formatter::SqlFormatter;

use crate::dialect::Dialect;
use crate::error::RenderError;
use crate::expr::Expr;
use crate::types::{Name, QueryType, ValueType};

/// A parameter bound by a rendered command
#[derive(Debug, Clone, PartialEq)]
pub struct QueryParameter {
    pub name: Name,
    /// Client type of the bound value
    pub ty: ValueType,
    pub db_type: Option<QueryType>,
    /// A constant, or an expression over the outer row for correlated commands
    pub value: Expr,
}

/// Output from rendering
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedQuery {
    /// The generated command text
    pub sql: String,
    /// Parameters to bind, in order of first appearance
    pub params: Vec<QueryParameter>,
}

impl RenderedQuery {
    pub fn param(&self, name: &str) -> Option<&QueryParameter> {
        self.params.iter().find(|p| &*p.name == name)
    }
}

/// Trait for rendering a rewritten tree to a command
pub trait QueryRenderer: Send + Sync {
    /// Unique name for this renderer
    fn name(&self) -> &str;

    /// Render a select, projection or command
    fn render(&self, expr: &Expr) -> Result<RenderedQuery, RenderError>;
}

/// Render `expr` with the generic formatter for `dialect`
pub fn format(expr: &Expr, dialect: &dyn Dialect) -> Result<RenderedQuery, RenderError> {
    SqlFormatter::new(dialect).render(expr)
}
