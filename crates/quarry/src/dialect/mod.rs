//! Dialect descriptors.
//!
//! A [`Dialect`] answers the capability questions the rewrite passes ask
//! (offset support, multi-statement batches, subqueries without `FROM`)
//! and supplies the token spellings the formatter needs (identifier
//! quoting, parameter placeholders, function names, concatenation).
//! Descriptors are immutable values passed into the compiler; there is
//! no process-wide default.

mod sqlite;
mod sqlserver;

pub use sqlite::{SqliteDialect, SqliteTypes};
pub use sqlserver::{SqlServerDialect, SqlServerTypes};

use crate::expr::{ColumnDeclaration, Expr, ScalarFunction, SelectExpr};
use crate::types::{QueryType, ScalarKind, TypeSystem, ValueType};
use std::fmt;
use std::sync::Arc;

/// How a dialect expresses `Skip`/`Take`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Paging {
    /// `SELECT TOP (n)`; skipping needs row numbering
    Top,
    /// `LIMIT n OFFSET m`
    LimitOffset,
}

/// Capabilities and spellings of one SQL product
pub trait Dialect: Send + Sync + fmt::Debug {
    /// Product name used in diagnostics
    fn name(&self) -> &'static str;

    fn type_system(&self) -> &dyn TypeSystem;

    fn quote_identifier(&self, name: &str) -> String;

    /// Placeholder text for a bound parameter
    fn parameter_placeholder(&self, name: &str) -> String;

    /// Name of a batch-local variable
    fn variable_name(&self, name: &str) -> String {
        self.parameter_placeholder(name)
    }

    /// Expression yielding the identity generated by the preceding insert
    fn generated_id_expression(&self, ty: QueryType) -> Expr {
        Expr::call(
            ScalarFunction::GeneratedId,
            ValueType::Scalar(ty.scalar_kind()),
            Vec::new(),
        )
    }

    /// Column of `select` that is null exactly when an outer join found no
    /// match, `None` when a constant test column must be added.
    fn outer_join_test_expression(&self, select: &SelectExpr) -> Option<Expr> {
        select
            .columns
            .iter()
            .find(|c| c.db_type.not_null && matches!(c.expr, Expr::Column(_)))
            .map(|c| select.column_ref(c))
    }

    fn allows_multiple_statements(&self) -> bool;

    fn allows_subquery_in_select_without_from(&self) -> bool;

    fn allows_distinct_in_aggregate(&self) -> bool;

    /// Whether `AVG` of an integer column yields an integer
    fn truncates_integer_average(&self) -> bool {
        false
    }

    /// `CROSS APPLY` / `OUTER APPLY` for correlations that cannot be lowered
    fn supports_apply(&self) -> bool;

    /// Whether predicates can appear where a value is expected
    fn supports_boolean_values(&self) -> bool {
        false
    }

    fn paging(&self) -> Paging;

    /// Native `OFFSET` support
    fn supports_offset(&self) -> bool {
        self.paging() == Paging::LimitOffset
    }

    /// Whether values of this type can be computed on the server
    fn is_scalar_type(&self, ty: &ValueType) -> bool {
        ty.is_scalar()
    }

    fn format_type(&self, ty: &QueryType, suppress_size: bool) -> String {
        self.type_system().format(ty, suppress_size)
    }

    /// Infix operator for string concatenation
    fn concat_operator(&self) -> &'static str;

    /// Characters with wildcard meaning inside a `LIKE` pattern
    fn like_wildcards(&self) -> &'static [char] {
        &['%', '_']
    }

    /// Function name for scalar functions rendered as calls
    fn function_name(&self, function: ScalarFunction) -> &'static str {
        match function {
            ScalarFunction::Lower => "LOWER",
            ScalarFunction::Upper => "UPPER",
            ScalarFunction::Length => "LENGTH",
            ScalarFunction::Trim => "TRIM",
            ScalarFunction::Substring => "SUBSTR",
            ScalarFunction::Abs => "ABS",
            ScalarFunction::Round => "ROUND",
            ScalarFunction::Now => "CURRENT_TIMESTAMP",
            ScalarFunction::GeneratedId => "IDENTITY",
            ScalarFunction::StartsWith | ScalarFunction::EndsWith | ScalarFunction::Contains => {
                "LIKE"
            }
        }
    }

    /// Column type for a declared column, preferring the mapping override
    fn column_type(&self, kind: ScalarKind, override_name: Option<&str>) -> QueryType {
        override_name
            .and_then(|name| self.type_system().parse(name).ok())
            .unwrap_or_else(|| self.type_system().column_type(kind))
    }
}

/// Shared dialect handle
pub type DialectRef = Arc<dyn Dialect>;

/// Build a dialect by name, `None` when the name is unknown
pub fn dialect_by_name(name: &str, parameter_prefix: Option<&str>) -> Option<DialectRef> {
    match name.to_ascii_lowercase().as_str() {
        "sqlserver" | "mssql" | "tsql" => {
            let mut dialect = SqlServerDialect::new();
            if let Some(prefix) = parameter_prefix {
                dialect = dialect.with_parameter_prefix(prefix);
            }
            Some(Arc::new(dialect))
        }
        "sqlite" => {
            let mut dialect = SqliteDialect::new();
            if let Some(prefix) = parameter_prefix {
                dialect = dialect.with_parameter_prefix(prefix);
            }
            Some(Arc::new(dialect))
        }
        _ => None,
    }
}

/// Declaration of a constant column that is non-null on every row
pub(crate) fn test_column(name: impl Into<crate::types::Name>) -> ColumnDeclaration {
    ColumnDeclaration {
        name: name.into(),
        expr: Expr::constant(1),
        db_type: QueryType::new(crate::types::SqlType::Int).not_null(),
    }
}

fn size_suffix(ty: &QueryType) -> String {
    match (ty.length, ty.precision) {
        (Some(crate::types::MAX_LENGTH), _) => "(MAX)".to_string(),
        (Some(length), _) => format!("({length})"),
        (None, Some(precision)) => format!("({precision}, {})", ty.scale.unwrap_or(0)),
        (None, None) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::AliasGenerator;
    use crate::types::SqlType;

    #[test]
    fn test_dialect_by_name() {
        assert_eq!(dialect_by_name("SqlServer", None).map(|d| d.name()), Some("sqlserver"));
        assert_eq!(dialect_by_name("sqlite", None).map(|d| d.name()), Some("sqlite"));
        assert!(dialect_by_name("oracle", None).is_none());

        let d = dialect_by_name("sqlserver", Some("")).unwrap();
        assert_eq!(d.parameter_placeholder("p0"), "p0");
    }

    #[test]
    fn test_outer_join_test_prefers_not_null_column() {
        let gen = AliasGenerator::new();
        let t = gen.next_alias();
        let nullable = QueryType::new(SqlType::NVarChar);
        let key = QueryType::new(SqlType::NChar).not_null();
        let decl = |name: &str, ty: QueryType| ColumnDeclaration {
            name: name.into(),
            expr: Expr::column(t, name.into(), ValueType::Scalar(ScalarKind::Text), ty),
            db_type: ty,
        };
        let select = SelectExpr::new(
            gen.next_alias(),
            vec![decl("City", nullable), decl("CustomerID", key)],
            None,
        );

        let test = SqlServerDialect::new().outer_join_test_expression(&select).unwrap();
        assert_eq!(test.as_column().map(|c| &*c.name), Some("CustomerID"));
        assert_eq!(test.as_column().map(|c| c.alias), Some(select.alias));
    }

    #[test]
    fn test_column_type_uses_override() {
        let d = SqlServerDialect::new();
        let ty = d.column_type(ScalarKind::Text, Some("NVARCHAR(15)"));
        assert_eq!(ty.length, Some(15));
        let fallback = d.column_type(ScalarKind::Text, Some("not a type("));
        assert_eq!(fallback.sql_type, SqlType::NVarChar);
    }
}
