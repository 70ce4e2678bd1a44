//! Microsoft SQL Server (T-SQL).

use super::{size_suffix, Dialect, Paging};
use crate::expr::ScalarFunction;
use crate::types::{QueryType, ScalarKind, SqlType, TypeSystem, MAX_LENGTH};

#[derive(Debug, Clone, Copy, Default)]
pub struct SqlServerTypes;

impl TypeSystem for SqlServerTypes {
    fn column_type(&self, kind: ScalarKind) -> QueryType {
        match kind {
            ScalarKind::Bool => QueryType::new(SqlType::Bit),
            ScalarKind::Int => QueryType::new(SqlType::Int),
            ScalarKind::BigInt => QueryType::new(SqlType::BigInt),
            ScalarKind::Float => QueryType::new(SqlType::Float),
            ScalarKind::Decimal => QueryType::new(SqlType::Decimal).with_precision(29, 4),
            ScalarKind::Text => QueryType::new(SqlType::NVarChar).with_length(4000),
            ScalarKind::DateTime => QueryType::new(SqlType::DateTime),
            ScalarKind::Guid => QueryType::new(SqlType::UniqueIdentifier),
            ScalarKind::Binary => QueryType::new(SqlType::VarBinary).with_length(MAX_LENGTH),
        }
    }

    fn format(&self, ty: &QueryType, suppress_size: bool) -> String {
        let name = match ty.sql_type {
            SqlType::Bit => "BIT",
            SqlType::TinyInt => "TINYINT",
            SqlType::SmallInt => "SMALLINT",
            SqlType::Int | SqlType::Integer => "INT",
            SqlType::BigInt => "BIGINT",
            SqlType::Real => "REAL",
            SqlType::Float => "FLOAT",
            SqlType::Decimal | SqlType::Numeric => "DECIMAL",
            SqlType::Money => "MONEY",
            SqlType::Char => "CHAR",
            SqlType::VarChar => "VARCHAR",
            SqlType::NChar => "NCHAR",
            SqlType::NVarChar => "NVARCHAR",
            SqlType::Text => "TEXT",
            SqlType::NText => "NTEXT",
            SqlType::Date => "DATE",
            SqlType::DateTime => "DATETIME",
            SqlType::DateTime2 => "DATETIME2",
            SqlType::Time => "TIME",
            SqlType::UniqueIdentifier => "UNIQUEIDENTIFIER",
            SqlType::Binary => "BINARY",
            SqlType::VarBinary | SqlType::Blob => "VARBINARY",
        };
        if suppress_size {
            name.to_string()
        } else {
            format!("{name}{}", size_suffix(ty))
        }
    }
}

/// T-SQL spelling: bracket quoting, `TOP`, identity via `SCOPE_IDENTITY()`
#[derive(Debug, Clone)]
pub struct SqlServerDialect {
    parameter_prefix: String,
    types: SqlServerTypes,
}

impl Default for SqlServerDialect {
    fn default() -> Self {
        Self::new()
    }
}

impl SqlServerDialect {
    pub fn new() -> Self {
        Self {
            parameter_prefix: "@".to_string(),
            types: SqlServerTypes,
        }
    }

    /// Override the `@` placeholder prefix
    pub fn with_parameter_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.parameter_prefix = prefix.into();
        self
    }
}

impl Dialect for SqlServerDialect {
    fn name(&self) -> &'static str {
        "sqlserver"
    }

    fn type_system(&self) -> &dyn TypeSystem {
        &self.types
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("[{}]", name.replace(']', "]]"))
    }

    fn parameter_placeholder(&self, name: &str) -> String {
        format!("{}{name}", self.parameter_prefix)
    }

    fn variable_name(&self, name: &str) -> String {
        format!("@{name}")
    }

    fn allows_multiple_statements(&self) -> bool {
        true
    }

    fn allows_subquery_in_select_without_from(&self) -> bool {
        true
    }

    fn allows_distinct_in_aggregate(&self) -> bool {
        true
    }

    fn truncates_integer_average(&self) -> bool {
        true
    }

    fn supports_apply(&self) -> bool {
        true
    }

    fn paging(&self) -> Paging {
        Paging::Top
    }

    fn concat_operator(&self) -> &'static str {
        "+"
    }

    fn like_wildcards(&self) -> &'static [char] {
        &['%', '_', '[']
    }

    fn function_name(&self, function: ScalarFunction) -> &'static str {
        match function {
            ScalarFunction::Length => "LEN",
            ScalarFunction::Substring => "SUBSTRING",
            ScalarFunction::Now => "GETDATE",
            ScalarFunction::GeneratedId => "SCOPE_IDENTITY",
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
