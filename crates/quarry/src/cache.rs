//! Compiled-plan cache.
//!
//! Queries that differ only in their client constants share a
//! [`QuerySignature`]: constants are erased into named arguments
//! (`a0`, `a1`, ...) so the plan compiled for one set of values runs with
//! any other. Paging counts, nulls, booleans and arrays stay literal since
//! they change the SQL itself.

use crate::error::TranslationResult;
use crate::expr::rewrite::Rewriter;
use crate::expr::{Expr, NamedValueExpr, SequenceOp};
use crate::plan::{Arguments, ExecutionPlan};
use crate::types::Value;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::debug;

/// The argument-erased shape of a query
#[derive(Debug, Clone)]
pub struct QuerySignature {
    key: String,
    hash: u64,
    query: Expr,
    arguments: Arguments,
}

impl QuerySignature {
    /// Erase the client constants of `query`
    pub fn erase(query: &Expr) -> TranslationResult<Self> {
        let mut eraser = Eraser {
            arguments: Arguments::new(),
            keep_values: true,
        };
        let erased = eraser.rewrite(query)?;
        let arguments = std::mem::take(&mut eraser.arguments);

        eraser.keep_values = false;
        let key = format!("{:?}", eraser.rewrite(query)?);
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);

        Ok(Self {
            hash: hasher.finish(),
            key,
            query: erased,
            arguments,
        })
    }

    /// The query with constants replaced by named arguments
    pub fn query(&self) -> &Expr {
        &self.query
    }

    /// Values of the erased constants, by argument name
    pub fn arguments(&self) -> &Arguments {
        &self.arguments
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Short form of the key for logs
    pub fn hash(&self) -> String {
        format!("{:016x}", self.hash)
    }
}

impl PartialEq for QuerySignature {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for QuerySignature {}

struct Eraser {
    arguments: Arguments,
    /// Whether arguments carry their values or typed nulls
    keep_values: bool,
}

impl Eraser {
    fn argument(&mut self, constant: &Expr) -> Expr {
        let name = format!("a{}", self.arguments.len());
        let value = match constant {
            Expr::Constant(c) if !self.keep_values => Expr::constant_of(Value::Null, c.ty.clone()),
            _ => constant.clone(),
        };
        self.arguments.insert(
            name.as_str().into(),
            constant.as_constant().cloned().unwrap_or(Value::Null),
        );
        Expr::NamedValue(Arc::new(NamedValueExpr {
            name: name.into(),
            db_type: None,
            value,
        }))
    }
}

impl Rewriter for Eraser {
    fn rewrite(&mut self, expr: &Expr) -> TranslationResult<Expr> {
        match expr {
            Expr::Constant(c) if matches!(c.value, Value::String(_) | Value::Number(_)) => {
                Ok(self.argument(expr))
            }
            Expr::Sequence(op) => match &**op {
                SequenceOp::Skip { source, count } => Ok(Expr::Sequence(Arc::new(SequenceOp::Skip {
                    source: self.rewrite(source)?,
                    count: count.clone(),
                }))),
                SequenceOp::Take { source, count } => Ok(Expr::Sequence(Arc::new(SequenceOp::Take {
                    source: self.rewrite(source)?,
                    count: count.clone(),
                }))),
                _ => self.rewrite_children(expr),
            },
            _ => self.rewrite_children(expr),
        }
    }
}

/// Signature-keyed map of compiled plans.
///
/// Each signature owns a cell initialised at most once: concurrent callers
/// with the same signature wait for the first compilation instead of
/// repeating it. A failed compilation leaves the cell empty.
#[derive(Debug)]
pub struct PlanCache {
    enabled: bool,
    plans: DashMap<String, Arc<OnceCell<Arc<ExecutionPlan>>>>,
}

impl Default for PlanCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PlanCache {
    pub fn new() -> Self {
        Self {
            enabled: true,
            plans: DashMap::new(),
        }
    }

    /// A cache that compiles on every call
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            plans: DashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Number of compiled plans held
    pub fn len(&self) -> usize {
        self.plans.iter().filter(|entry| entry.value().get().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.plans.clear();
    }

    /// The plan for `signature`, compiling it with `compute` on a miss
    pub fn get_or_compile<F, E>(
        &self,
        signature: &QuerySignature,
        compute: F,
    ) -> Result<Arc<ExecutionPlan>, E>
    where
        F: FnOnce(&Expr) -> Result<ExecutionPlan, E>,
    {
        if !self.enabled {
            return compute(signature.query()).map(Arc::new);
        }

        // clone the cell out so the shard lock is released before compiling
        let cell = self
            .plans
            .entry(signature.key().to_string())
            .or_default()
            .clone();
        if let Some(plan) = cell.get() {
            debug!(signature = %signature.hash(), "plan cache hit");
            return Ok(plan.clone());
        }
        cell.get_or_try_init(|| {
            debug!(signature = %signature.hash(), "plan cache miss");
            compute(signature.query()).map(Arc::new)
        })
        .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::QueryCompiler;
    use crate::dialect::SqlServerDialect;
    use crate::error::QueryError;
    use crate::testing::northwind;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn london(city: &str) -> Expr {
        Expr::source("Customer").filter("c", |c| c.member("City").equal(Expr::constant(city)))
    }

    // ========================================================================
    // Signatures
    // ========================================================================

    #[test]
    fn test_constants_do_not_change_the_signature() {
        let a = QuerySignature::erase(&london("London")).unwrap();
        let b = QuerySignature::erase(&london("Berlin")).unwrap();

        assert_eq!(a, b);
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.arguments().get("a0"), Some(&json!("London")));
        assert_eq!(b.arguments().get("a0"), Some(&json!("Berlin")));
    }

    #[test]
    fn test_paging_counts_stay_in_the_signature() {
        let a = QuerySignature::erase(&Expr::source("Customer").take(5)).unwrap();
        let b = QuerySignature::erase(&Expr::source("Customer").take(10)).unwrap();

        assert_ne!(a, b);
        assert!(a.arguments().is_empty());
    }

    #[test]
    fn test_erased_query_carries_named_arguments() {
        let signature = QuerySignature::erase(&london("London")).unwrap();
        let mut names = Vec::new();
        crate::expr::visit::for_each_node(signature.query(), &mut |e| {
            if let Expr::NamedValue(n) = e {
                names.push(n.name.to_string());
            }
        });
        assert_eq!(names, vec!["a0"]);
    }

    // ========================================================================
    // Cache
    // ========================================================================

    #[test]
    fn test_second_lookup_reuses_the_plan() {
        let mapping = northwind();
        let compiler = QueryCompiler::new(&mapping, Arc::new(SqlServerDialect::new()));
        let cache = PlanCache::new();
        let compiled = AtomicUsize::new(0);
        let compute = |q: &Expr| {
            compiled.fetch_add(1, Ordering::SeqCst);
            compiler.compile(q)
        };

        let first = cache
            .get_or_compile(&QuerySignature::erase(&london("London")).unwrap(), compute)
            .unwrap();
        let second = cache
            .get_or_compile(&QuerySignature::erase(&london("Paris")).unwrap(), compute)
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(compiled.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_concurrent_callers_compile_once() {
        let mapping = northwind();
        let compiler = QueryCompiler::new(&mapping, Arc::new(SqlServerDialect::new()));
        let cache = PlanCache::new();
        let compiled = AtomicUsize::new(0);
        let signature = QuerySignature::erase(&london("London")).unwrap();

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    cache
                        .get_or_compile(&signature, |q| {
                            compiled.fetch_add(1, Ordering::SeqCst);
                            compiler.compile(q)
                        })
                        .unwrap();
                });
            }
        });

        assert_eq!(compiled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_compilation_is_not_cached() {
        let cache = PlanCache::new();
        let signature = QuerySignature::erase(&london("London")).unwrap();
        let failing = |_: &Expr| -> Result<ExecutionPlan, QueryError> {
            Err(crate::error::TranslationError::unsupported("test").into())
        };

        assert!(cache.get_or_compile(&signature, failing).is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_disabled_cache_always_compiles() {
        let mapping = northwind();
        let compiler = QueryCompiler::new(&mapping, Arc::new(SqlServerDialect::new()));
        let cache = PlanCache::disabled();
        let compiled = AtomicUsize::new(0);
        let signature = QuerySignature::erase(&london("London")).unwrap();
        for _ in 0..2 {
            cache
                .get_or_compile(&signature, |q| {
                    compiled.fetch_add(1, Ordering::SeqCst);
                    compiler.compile(q)
                })
                .unwrap();
        }
        assert_eq!(compiled.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty());
    }
}
