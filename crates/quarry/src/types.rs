//! Type system abstraction.
//!
//! Client values are `serde_json::Value`s classified by [`ScalarKind`];
//! database columns carry a [`QueryType`] produced by a dialect's
//! [`TypeSystem`], either from a scalar kind or parsed from a stored type
//! name such as `NVARCHAR(40) NOT NULL`.

use crate::error::{TranslationError, TranslationResult};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Client-side value representation
pub type Value = serde_json::Value;

/// Interned identifier used for members, columns and entities
pub type Name = Arc<str>;

/// Semantic scalar field types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarKind {
    Bool,
    Int,
    BigInt,
    Float,
    Decimal,
    Text,
    DateTime,
    Guid,
    Binary,
}

impl ScalarKind {
    /// Classify a client value, `None` for nulls and structured values
    pub fn of_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(_) => Some(Self::Bool),
            Value::Number(n) if n.is_i64() || n.is_u64() => Some(Self::Int),
            Value::Number(_) => Some(Self::Float),
            Value::String(_) => Some(Self::Text),
            _ => None,
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            Self::Int | Self::BigInt | Self::Float | Self::Decimal
        )
    }
}

impl fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::BigInt => "bigint",
            Self::Float => "float",
            Self::Decimal => "decimal",
            Self::Text => "text",
            Self::DateTime => "datetime",
            Self::Guid => "guid",
            Self::Binary => "binary",
        };
        f.write_str(name)
    }
}

/// The type of an expression node
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueType {
    Scalar(ScalarKind),
    /// An entity constructed from a mapped table
    Entity(Name),
    /// An anonymous record of named fields
    Record,
    /// A sequence of values
    Sequence,
    /// A group key with its elements
    Grouping,
    /// The type of an untyped null literal
    Null,
    Unknown,
}

impl ValueType {
    pub fn is_scalar(&self) -> bool {
        matches!(self, Self::Scalar(_))
    }

    pub fn scalar_kind(&self) -> Option<ScalarKind> {
        match self {
            Self::Scalar(kind) => Some(*kind),
            _ => None,
        }
    }

    /// Infer the type of a client value
    pub fn of_value(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Array(_) => Self::Sequence,
            Value::Object(_) => Self::Record,
            other => ScalarKind::of_value(other).map_or(Self::Unknown, Self::Scalar),
        }
    }
}

/// Database column type names, shared across dialects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SqlType {
    Bit,
    TinyInt,
    SmallInt,
    Int,
    BigInt,
    Real,
    Float,
    Decimal,
    Money,
    Char,
    VarChar,
    NChar,
    NVarChar,
    Text,
    NText,
    Date,
    DateTime,
    DateTime2,
    Time,
    UniqueIdentifier,
    Binary,
    VarBinary,
    Integer,
    Numeric,
    Blob,
}

impl SqlType {
    fn from_name(name: &str) -> Option<Self> {
        let ty = match name.to_ascii_uppercase().as_str() {
            "BIT" | "BOOLEAN" | "BOOL" => Self::Bit,
            "TINYINT" => Self::TinyInt,
            "SMALLINT" => Self::SmallInt,
            "INT" => Self::Int,
            "BIGINT" => Self::BigInt,
            "REAL" => Self::Real,
            "FLOAT" | "DOUBLE" => Self::Float,
            "DECIMAL" => Self::Decimal,
            "MONEY" => Self::Money,
            "CHAR" => Self::Char,
            "VARCHAR" => Self::VarChar,
            "NCHAR" => Self::NChar,
            "NVARCHAR" => Self::NVarChar,
            "TEXT" => Self::Text,
            "NTEXT" => Self::NText,
            "DATE" => Self::Date,
            "DATETIME" => Self::DateTime,
            "DATETIME2" => Self::DateTime2,
            "TIME" => Self::Time,
            "UNIQUEIDENTIFIER" | "UUID" => Self::UniqueIdentifier,
            "BINARY" => Self::Binary,
            "VARBINARY" => Self::VarBinary,
            "INTEGER" => Self::Integer,
            "NUMERIC" => Self::Numeric,
            "BLOB" => Self::Blob,
            _ => return None,
        };
        Some(ty)
    }

    /// Whether the first size argument is a precision rather than a length
    fn has_precision(self) -> bool {
        matches!(self, Self::Decimal | Self::Numeric)
    }

    pub fn scalar_kind(self) -> ScalarKind {
        match self {
            Self::Bit => ScalarKind::Bool,
            Self::TinyInt | Self::SmallInt | Self::Int | Self::Integer => ScalarKind::Int,
            Self::BigInt => ScalarKind::BigInt,
            Self::Real | Self::Float => ScalarKind::Float,
            Self::Decimal | Self::Money | Self::Numeric => ScalarKind::Decimal,
            Self::Char
            | Self::VarChar
            | Self::NChar
            | Self::NVarChar
            | Self::Text
            | Self::NText => ScalarKind::Text,
            Self::Date | Self::DateTime | Self::DateTime2 | Self::Time => ScalarKind::DateTime,
            Self::UniqueIdentifier => ScalarKind::Guid,
            Self::Binary | Self::VarBinary | Self::Blob => ScalarKind::Binary,
        }
    }
}

/// Length marker for `(MAX)` sizes
pub const MAX_LENGTH: u32 = u32::MAX;

/// A database column type descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryType {
    pub sql_type: SqlType,
    pub not_null: bool,
    pub length: Option<u32>,
    pub precision: Option<u8>,
    pub scale: Option<u8>,
}

impl QueryType {
    pub fn new(sql_type: SqlType) -> Self {
        Self {
            sql_type,
            not_null: false,
            length: None,
            precision: None,
            scale: None,
        }
    }

    pub fn with_length(mut self, length: u32) -> Self {
        self.length = Some(length);
        self
    }

    pub fn with_precision(mut self, precision: u8, scale: u8) -> Self {
        self.precision = Some(precision);
        self.scale = Some(scale);
        self
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.not_null = false;
        self
    }

    pub fn scalar_kind(&self) -> ScalarKind {
        self.sql_type.scalar_kind()
    }
}

/// Matches `NAME`, `NAME(n)`, `NAME(MAX)`, `NAME(p, s)` with optional nullability
static TYPE_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*([a-z][a-z0-9_]*)\s*(?:\(\s*(max|\d+)\s*(?:,\s*(\d+)\s*)?\))?\s*(not\s+null|null)?\s*$",
    )
    .unwrap()
});

/// Parse a stored type name into a [`QueryType`]
pub fn parse_type_name(type_name: &str) -> TranslationResult<QueryType> {
    let invalid = || TranslationError::invalid("type", format!("cannot parse '{type_name}'"));
    let caps = TYPE_NAME_RE.captures(type_name).ok_or_else(invalid)?;

    let sql_type = SqlType::from_name(&caps[1]).ok_or_else(invalid)?;
    let mut ty = QueryType::new(sql_type);

    if let Some(size) = caps.get(2) {
        let size = size.as_str();
        if size.eq_ignore_ascii_case("max") {
            ty.length = Some(MAX_LENGTH);
        } else if sql_type.has_precision() {
            ty.precision = Some(size.parse().map_err(|_| invalid())?);
            ty.scale = match caps.get(3) {
                Some(scale) => Some(scale.as_str().parse().map_err(|_| invalid())?),
                None => Some(0),
            };
        } else {
            ty.length = Some(size.parse().map_err(|_| invalid())?);
        }
    }

    if let Some(nullability) = caps.get(4) {
        ty.not_null = nullability.as_str().to_ascii_uppercase().starts_with("NOT");
    }

    Ok(ty)
}

/// Maps semantic field types to database column types and back.
///
/// Per-product type-name tables live in the dialect modules.
pub trait TypeSystem: Send + Sync + fmt::Debug {
    /// Column type used for a value of the given kind
    fn column_type(&self, kind: ScalarKind) -> QueryType;

    /// Render a type name, omitting size arguments when `suppress_size`
    fn format(&self, ty: &QueryType, suppress_size: bool) -> String;

    /// Parse a stored type name
    fn parse(&self, type_name: &str) -> TranslationResult<QueryType> {
        parse_type_name(type_name)
    }

    /// Database type for an expression type, if it is scalar
    fn type_for(&self, ty: &ValueType) -> Option<QueryType> {
        ty.scalar_kind().map(|kind| self.column_type(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    #[test_case("INT", SqlType::Int, None, None, false ; "plain")]
    #[test_case("nvarchar(40)", SqlType::NVarChar, Some(40), None, false ; "lowercase with length")]
    #[test_case("NVARCHAR(MAX) NOT NULL", SqlType::NVarChar, Some(MAX_LENGTH), None, true ; "max not null")]
    #[test_case("DECIMAL(18, 2)", SqlType::Decimal, None, Some(18), false ; "precision")]
    #[test_case("bigint null", SqlType::BigInt, None, None, false ; "explicit null")]
    fn test_parse_type_name(
        input: &str,
        sql_type: SqlType,
        length: Option<u32>,
        precision: Option<u8>,
        not_null: bool,
    ) {
        let ty = parse_type_name(input).unwrap();
        assert_eq!(ty.sql_type, sql_type);
        assert_eq!(ty.length, length);
        assert_eq!(ty.precision, precision);
        assert_eq!(ty.not_null, not_null);
    }

    #[test]
    fn test_parse_decimal_scale() {
        let ty = parse_type_name("NUMERIC(10,4)").unwrap();
        assert_eq!(ty.precision, Some(10));
        assert_eq!(ty.scale, Some(4));
        assert_eq!(ty.scalar_kind(), ScalarKind::Decimal);
    }

    #[test]
    fn test_parse_rejects_unknown_type() {
        assert!(parse_type_name("GEOGRAPHY").is_err());
        assert!(parse_type_name("INT(").is_err());
    }

    #[test]
    fn test_value_type_inference() {
        assert_eq!(ValueType::of_value(&json!(1)), ValueType::Scalar(ScalarKind::Int));
        assert_eq!(ValueType::of_value(&json!(1.5)), ValueType::Scalar(ScalarKind::Float));
        assert_eq!(ValueType::of_value(&json!("a")), ValueType::Scalar(ScalarKind::Text));
        assert_eq!(ValueType::of_value(&json!(null)), ValueType::Null);
        assert_eq!(ValueType::of_value(&json!([1, 2])), ValueType::Sequence);
        assert_eq!(ValueType::of_value(&json!({"a": 1})), ValueType::Record);
    }
}
