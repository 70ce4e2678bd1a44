//! SQLite.

use super::{Dialect, Paging};
use crate::expr::ScalarFunction;
use crate::types::{QueryType, ScalarKind, SqlType, TypeSystem};

/// SQLite storage classes
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteTypes;

impl TypeSystem for SqliteTypes {
    fn column_type(&self, kind: ScalarKind) -> QueryType {
        let sql_type = match kind {
            ScalarKind::Bool | ScalarKind::Int | ScalarKind::BigInt => SqlType::Integer,
            ScalarKind::Float => SqlType::Real,
            ScalarKind::Decimal => SqlType::Numeric,
            ScalarKind::Text | ScalarKind::DateTime | ScalarKind::Guid => SqlType::Text,
            ScalarKind::Binary => SqlType::Blob,
        };
        QueryType::new(sql_type)
    }

    fn format(&self, ty: &QueryType, _suppress_size: bool) -> String {
        match ty.sql_type.scalar_kind() {
            ScalarKind::Bool | ScalarKind::Int | ScalarKind::BigInt => "INTEGER",
            ScalarKind::Float => "REAL",
            ScalarKind::Decimal => "NUMERIC",
            ScalarKind::Text | ScalarKind::DateTime | ScalarKind::Guid => "TEXT",
            ScalarKind::Binary => "BLOB",
        }
        .to_string()
    }
}

/// SQLite spelling: double-quoted identifiers, `LIMIT`/`OFFSET`, one
/// statement per command.
#[derive(Debug, Clone)]
pub struct SqliteDialect {
    parameter_prefix: String,
    types: SqliteTypes,
}

impl Default for SqliteDialect {
    fn default() -> Self {
        Self::new()
    }
}

impl SqliteDialect {
    pub fn new() -> Self {
        Self {
            parameter_prefix: ":".to_string(),
            types: SqliteTypes,
        }
    }

    pub fn with_parameter_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.parameter_prefix = prefix.into();
        self
    }
}

impl Dialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn type_system(&self) -> &dyn TypeSystem {
        &self.types
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn parameter_placeholder(&self, name: &str) -> String {
        format!("{}{name}", self.parameter_prefix)
    }

    fn allows_multiple_statements(&self) -> bool {
        false
    }

    fn allows_subquery_in_select_without_from(&self) -> bool {
        true
    }

    fn allows_distinct_in_aggregate(&self) -> bool {
        true
    }

    fn supports_apply(&self) -> bool {
        false
    }

    fn supports_boolean_values(&self) -> bool {
        true
    }

    fn paging(&self) -> Paging {
        Paging::LimitOffset
    }

    fn concat_operator(&self) -> &'static str {
        "||"
    }

    fn function_name(&self, function: ScalarFunction) -> &'static str {
        match function {
            ScalarFunction::GeneratedId => "last_insert_rowid",
            ScalarFunction::Now => "CURRENT_TIMESTAMP",
            ScalarFunction::Substring => "SUBSTR",
            ScalarFunction::Length => "LENGTH",
            ScalarFunction::Lower => "LOWER",
            ScalarFunction::Upper => "UPPER",
            ScalarFunction::Trim => "TRIM",
            ScalarFunction::Abs => "ABS",
            ScalarFunction::Round => "ROUND",
            ScalarFunction::StartsWith | ScalarFunction::EndsWith | ScalarFunction::Contains => {
                "LIKE"
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_classes() {
        let types = SqliteTypes;
        assert_eq!(types.format(&types.column_type(ScalarKind::Bool), false), "INTEGER");
        assert_eq!(types.format(&types.column_type(ScalarKind::Guid), false), "TEXT");
        let parsed = types.parse("NVARCHAR(40)").unwrap();
        assert_eq!(types.format(&parsed, false), "TEXT");
    }

    #[test]
    fn test_capabilities() {
        let d = SqliteDialect::new();
        assert!(d.supports_offset());
        assert!(!d.allows_multiple_statements());
        assert_eq!(d.quote_identifier("Customers"), "\"Customers\"");
        assert_eq!(d.parameter_placeholder("p0"), ":p0");
    }
}
