//! Tree-to-tree passes.
//!
//! Each pass implements [`QueryTransform`]: a pure rewrite that returns the
//! identical tree when it has nothing to do, so running it twice is a no-op.
//! [`TransformPipeline`] runs passes in a fixed order; the cleanup and
//! dialect pipelines used by the compiler are built here.

mod comparison;
mod cross_apply;
mod cross_join;
mod order_by;
mod redundant_columns;
mod redundant_joins;
mod redundant_subqueries;
mod skip_take;
mod unused_columns;
mod validate;

pub use comparison::{compare, ComparisonRewrite};
pub use cross_apply::CrossApplyRewrite;
pub use cross_join::CrossJoinRewrite;
pub use order_by::OrderByRewrite;
pub use redundant_columns::RedundantColumnRemoval;
pub use redundant_joins::RedundantJoinRemoval;
pub use redundant_subqueries::RedundantSubqueryRemoval;
pub use skip_take::SkipTakeRewrite;
pub use unused_columns::UnusedColumnRemoval;
pub use validate::ValidateTransform;

use crate::dialect::Dialect;
use crate::error::TranslationResult;
use crate::expr::{AliasGenerator, Expr};
use crate::mapping::EntityMapping;
use std::sync::Arc;
use tracing::trace;

/// Services available to every pass of one compilation
#[derive(Clone, Copy)]
pub struct TransformContext<'a> {
    pub aliases: &'a AliasGenerator,
    pub dialect: &'a dyn Dialect,
    pub mapping: Option<&'a dyn EntityMapping>,
    pub server_affinity: bool,
}

impl<'a> TransformContext<'a> {
    pub fn new(aliases: &'a AliasGenerator, dialect: &'a dyn Dialect) -> Self {
        Self {
            aliases,
            dialect,
            mapping: None,
            server_affinity: false,
        }
    }

    pub fn with_mapping(mut self, mapping: &'a dyn EntityMapping) -> Self {
        self.mapping = Some(mapping);
        self
    }

    pub fn with_server_affinity(mut self, server_affinity: bool) -> Self {
        self.server_affinity = server_affinity;
        self
    }
}

/// A single rewrite pass over a bound tree
pub trait QueryTransform: Send + Sync {
    /// Unique name for this pass
    fn name(&self) -> &'static str;

    fn transform(&self, expr: Expr, cx: &TransformContext<'_>) -> TranslationResult<Expr>;
}

/// Ordered list of passes
#[derive(Clone, Default)]
pub struct TransformPipeline {
    transforms: Vec<Arc<dyn QueryTransform>>,
}

impl TransformPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, transform: impl QueryTransform + 'static) -> Self {
        self.transforms.push(Arc::new(transform));
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.transforms.iter().map(|t| t.name()).collect()
    }

    pub fn run(&self, mut expr: Expr, cx: &TransformContext<'_>) -> TranslationResult<Expr> {
        for transform in &self.transforms {
            let before = expr.clone();
            expr = transform.transform(expr, cx)?;
            trace!(pass = transform.name(), changed = !expr.same(&before), "applied pass");
        }
        Ok(expr)
    }
}

/// Passes that keep a tree minimal after structural changes
pub fn cleanup_pipeline() -> TransformPipeline {
    TransformPipeline::new()
        .with(UnusedColumnRemoval)
        .with(RedundantColumnRemoval)
        .with(RedundantSubqueryRemoval)
        .with(RedundantJoinRemoval)
        .with(UnusedColumnRemoval)
}

/// Normalization into what the dialect can express, followed by cleanup
pub fn dialect_pipeline() -> TransformPipeline {
    TransformPipeline::new()
        .with(ComparisonRewrite)
        .with(CrossApplyRewrite)
        .with(CrossJoinRewrite)
        .with(UnusedColumnRemoval)
        .with(RedundantColumnRemoval)
        .with(RedundantSubqueryRemoval)
        .with(RedundantJoinRemoval)
        .with(OrderByRewrite)
        .with(SkipTakeRewrite)
        .with(UnusedColumnRemoval)
        .with(RedundantSubqueryRemoval)
        .with(ValidateTransform)
}
