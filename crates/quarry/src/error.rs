//! Error types for the translation pipeline.
//!
//! Every stage reports through its own enum; [`QueryError`] is the umbrella
//! returned by the [`crate::compiler`] entry points.

use thiserror::Error;

/// Failures raised while binding or rewriting a query tree.
///
/// All of these are deterministic for a given tree, mapping and dialect.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TranslationError {
    /// A member has no column or relationship mapping
    #[error("Member '{member}' of '{entity}' is not mapped")]
    UnmappedMember { entity: String, member: String },

    /// The entity is not described by the mapping
    #[error("Unknown entity '{entity}'")]
    UnknownEntity { entity: String },

    /// Two constructed values compared with different field sets
    #[error("Cannot compare {left} with {right}: field sets differ")]
    IncompatibleComparison { left: String, right: String },

    /// An entity cannot be constructed from the available members
    #[error("Cannot construct '{entity}': missing constructor members {missing:?}")]
    UnconstructibleProjection { entity: String, missing: Vec<String> },

    /// The dialect lacks a capability the query requires
    #[error("{dialect} does not support {capability}")]
    UnsupportedForDialect { dialect: String, capability: String },

    /// A parameter's database type cannot be inferred
    #[error("Cannot infer database type for parameter '{name}'")]
    AmbiguousParameterType { name: String },

    /// A lambda parameter was referenced outside its scope
    #[error("Parameter '{name}' is not bound")]
    UnboundParameter { name: String },

    /// The construct has no translation
    #[error("Unsupported construct: {construct}")]
    Unsupported { construct: String },

    /// The tree violates a structural invariant
    #[error("Invalid {node} node: {detail}")]
    InvalidTree { node: &'static str, detail: String },
}

impl TranslationError {
    pub(crate) fn unsupported(construct: impl Into<String>) -> Self {
        Self::Unsupported {
            construct: construct.into(),
        }
    }

    pub(crate) fn invalid(node: &'static str, detail: impl Into<String>) -> Self {
        Self::InvalidTree {
            node,
            detail: detail.into(),
        }
    }
}

/// Failures raised while formatting SQL text
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RenderError {
    /// The formatter has no case for this node in a SQL position
    #[error("Node '{node}' cannot be rendered as SQL")]
    UnsupportedNode { node: &'static str },

    /// The dialect cannot express the construct
    #[error("{dialect} cannot render {construct}")]
    UnsupportedForDialect { dialect: String, construct: String },

    #[error(transparent)]
    Translation(#[from] TranslationError),
}

/// Failures raised while running a compiled plan
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    /// The command executor reported a failure
    #[error("Executor error: {0}")]
    Executor(String),

    /// A singleton aggregator received no rows
    #[error("Sequence contains no elements")]
    NoElements,

    /// A `Single` aggregator received more than one row
    #[error("Sequence contains more than one element")]
    MoreThanOneElement,

    /// A row value does not match the expected scalar kind
    #[error("Column {ordinal} is not a {expected}")]
    TypeMismatch { ordinal: usize, expected: String },

    /// A row is shorter than the materializer expects
    #[error("Row has no column {ordinal}")]
    MissingColumn { ordinal: usize },

    /// No argument was supplied for a bound parameter
    #[error("Missing argument for parameter '{name}'")]
    MissingArgument { name: String },

    /// Client-side evaluation failed
    #[error("Cannot evaluate {0} on the client")]
    Evaluation(String),
}

/// Failures raised while loading [`crate::config::CompilerConfig`]
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is syntactically valid but meaningless
    #[error("Invalid config value for '{key}': {message}")]
    Invalid { key: String, message: String },
}

/// Umbrella error for the compiler entry points
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    #[error(transparent)]
    Translation(#[from] TranslationError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

/// Result type for binding and rewriting
pub type TranslationResult<T> = Result<T, TranslationError>;

/// Result type for the compiler entry points
pub type QueryResult<T> = Result<T, QueryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmapped_member_message_names_entity_and_member() {
        let err = TranslationError::UnmappedMember {
            entity: "Customer".to_string(),
            member: "Bogus".to_string(),
        };
        assert_eq!(err.to_string(), "Member 'Bogus' of 'Customer' is not mapped");
    }

    #[test]
    fn test_render_error_wraps_translation_error() {
        let err: RenderError = TranslationError::unsupported("Union").into();
        assert!(matches!(err, RenderError::Translation(_)));

        let query: QueryError = err.into();
        assert_eq!(query.to_string(), "Unsupported construct: Union");
    }
}
