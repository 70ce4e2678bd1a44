//! Pipeline entry point.
//!
//! A query runs through the stages in order:
//!
//! 1. `bind` turns sequence operators and member access into a projection
//! 2. `policy` adds included relationships and splits out client joins
//! 3. `parameterize` turns client constants into named parameters
//! 4. `rewrite` normalizes for the dialect and removes redundancy
//! 5. `plan` renders the SQL and compiles the materializer
//!
//! Every compilation owns its alias generator, so one [`QueryCompiler`]
//! serves any number of threads.

use crate::binder::bind;
use crate::cache::{PlanCache, QuerySignature};
use crate::command::CommandBuilder;
use crate::config::CompilerConfig;
use crate::dialect::{Dialect, DialectRef};
use crate::error::{ConfigError, QueryResult};
use crate::expr::{AliasGenerator, Expr};
use crate::mapping::EntityMapping;
use crate::parameterizer::parameterize;
use crate::plan::{build_plan, Arguments, ExecutionPlan, QueryExecutor};
use crate::policy::{apply_policy, QueryPolicy};
use crate::render::{format, RenderedQuery};
use crate::transform::{dialect_pipeline, TransformContext};
use crate::types::Value;
use std::sync::Arc;
use tracing::debug;

/// Compiles queries over one mapping for one dialect
pub struct QueryCompiler<'a> {
    mapping: &'a dyn EntityMapping,
    dialect: DialectRef,
    policy: QueryPolicy,
    server_affinity: bool,
    cache: PlanCache,
}

/// A cached plan paired with the argument values of one query
#[derive(Debug, Clone)]
pub struct PreparedQuery {
    pub plan: Arc<ExecutionPlan>,
    pub arguments: Arguments,
}

impl PreparedQuery {
    pub fn execute(&self, executor: &dyn QueryExecutor) -> QueryResult<Value> {
        Ok(self.plan.execute(executor, &self.arguments)?)
    }
}

impl<'a> QueryCompiler<'a> {
    pub fn new(mapping: &'a dyn EntityMapping, dialect: DialectRef) -> Self {
        Self {
            mapping,
            dialect,
            policy: QueryPolicy::new(),
            server_affinity: false,
            cache: PlanCache::new(),
        }
    }

    pub fn from_config(
        mapping: &'a dyn EntityMapping,
        config: &CompilerConfig,
    ) -> Result<Self, ConfigError> {
        let cache = if config.cache.enabled {
            PlanCache::new()
        } else {
            PlanCache::disabled()
        };
        Ok(Self {
            mapping,
            dialect: config.dialect()?,
            policy: config.policy()?,
            server_affinity: config.server_affinity,
            cache,
        })
    }

    pub fn with_policy(mut self, policy: QueryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_server_affinity(mut self, server_affinity: bool) -> Self {
        self.server_affinity = server_affinity;
        self
    }

    pub fn dialect(&self) -> &dyn Dialect {
        &*self.dialect
    }

    pub fn cache(&self) -> &PlanCache {
        &self.cache
    }

    /// Bind and rewrite `query` into its final tree
    pub fn translate(&self, query: &Expr) -> QueryResult<Expr> {
        let aliases = AliasGenerator::new();
        let cx = TransformContext::new(&aliases, self.dialect())
            .with_mapping(self.mapping)
            .with_server_affinity(self.server_affinity);

        debug!(stage = "bind", "compiling query");
        let bound = bind(query, &cx)?;
        debug!(stage = "policy", includes = self.policy.includes().count(), "compiling query");
        let included = apply_policy(&bound, &self.policy, &cx)?;
        debug!(stage = "parameterize", "compiling query");
        let parameterized = parameterize(&included, &cx)?;
        debug!(stage = "rewrite", dialect = self.dialect.name(), "compiling query");
        Ok(dialect_pipeline().run(parameterized, &cx)?)
    }

    /// The SQL for `query`, without a materializer
    pub fn render(&self, query: &Expr) -> QueryResult<RenderedQuery> {
        let translated = self.translate(query)?;
        Ok(format(&translated, self.dialect())?)
    }

    pub fn compile(&self, query: &Expr) -> QueryResult<ExecutionPlan> {
        let translated = self.translate(query)?;
        debug!(stage = "plan", "compiling query");
        build_plan(&translated, self.dialect())
    }

    /// Compile through the plan cache
    pub fn prepare(&self, query: &Expr) -> QueryResult<PreparedQuery> {
        let signature = QuerySignature::erase(query)?;
        let plan = self.cache.get_or_compile(&signature, |erased| self.compile(erased))?;
        Ok(PreparedQuery {
            plan,
            arguments: signature.arguments().clone(),
        })
    }

    /// Prepare and run `query`
    pub fn query(&self, query: &Expr, executor: &dyn QueryExecutor) -> QueryResult<Value> {
        self.prepare(query)?.execute(executor)
    }

    /// Command builder over the same mapping and dialect
    pub fn commands(&self) -> CommandBuilder<'_> {
        CommandBuilder::new(self.mapping, self.dialect())
    }
}
