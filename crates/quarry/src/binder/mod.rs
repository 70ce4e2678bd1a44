//! Query binder.
//!
//! Turns the input language (sequence operators over mapped entities, with
//! lambdas over their members) into relational nodes. Every operator yields a
//! [`ProjectionExpr`] whose select introduces a fresh alias; the
//! [`ColumnProjector`] decides which columns that select must return so that
//! the projector and every outer reference stay valid.
//!
//! Member access resolves against the [`EntityMapping`]:
//!
//! * a column member becomes a column reference
//! * a to-many relationship becomes a correlated nested projection
//! * a to-one relationship becomes an `OUTER APPLY` join attached to the
//!   select the enclosing operator builds, read through an outer-join test

mod aggregate;
mod sequence;

use crate::dialect::{test_column, Dialect};
use crate::error::{TranslationError, TranslationResult};
use crate::expr::util::{declared_aliases, unique_column_name};
use crate::expr::{
    AliasGenerator, BinaryOp, EntityExpr, Expr, GroupingExpr, JoinKind, LambdaExpr,
    OuterJoinedExpr, ProjectionExpr, SelectExpr, TableAlias, TableExpr,
};
use crate::mapping::{EntityMapping, RelationshipSchema};
use crate::projector::ColumnProjector;
use crate::transform::{compare, TransformContext};
use crate::types::{Name, Value, ValueType};
use std::sync::Arc;

/// Bind an input query into a client projection.
///
/// Aggregates, quantifiers and element operators at the root produce a
/// single-row projection with an aggregator.
pub fn bind(query: &Expr, cx: &TransformContext<'_>) -> TranslationResult<Expr> {
    let mut binder = Binder::new(cx)?;
    let bound = match query {
        Expr::Sequence(op) => binder.bind_sequence(op, true)?,
        other => binder.visit(other)?,
    };
    match bound {
        Expr::Projection(_) => Ok(bound),
        other => Err(TranslationError::invalid(
            other.kind_name(),
            "query does not produce a projection",
        )),
    }
}

/// Add a test to `select` telling whether an outer join matched.
///
/// Uses the dialect's test expression when the select has a suitable column,
/// otherwise declares a constant non-null column. The projector comes back
/// wrapped in an [`OuterJoinedExpr`].
pub fn add_outer_join_test(
    select: &SelectExpr,
    projector: &Expr,
    dialect: &dyn Dialect,
) -> (SelectExpr, Expr) {
    let mut select = select.clone();
    let test = match dialect.outer_join_test_expression(&select) {
        Some(test) => test,
        None => {
            let decl = test_column(unique_column_name(&select.columns, "Test"));
            let test = select.column_ref(&decl);
            select.columns.push(decl);
            test
        }
    };
    let joined = Expr::OuterJoined(Arc::new(OuterJoinedExpr {
        test,
        expr: projector.clone(),
    }));
    (select, joined)
}

/// Bookkeeping local to the lambda being bound
#[derive(Default)]
struct LambdaState {
    /// Right sides of `OUTER APPLY` joins the enclosing operator attaches
    lifted: Vec<SelectExpr>,
    /// To-one navigations already lifted, by source entity and member
    navigations: Vec<(Arc<EntityExpr>, Name, Expr)>,
}

pub(crate) struct Binder<'a> {
    mapping: &'a dyn EntityMapping,
    aliases: &'a AliasGenerator,
    dialect: &'a dyn Dialect,
    server_affinity: bool,
    /// Lambda parameters, innermost last
    scopes: Vec<(Name, Expr)>,
    lambda: LambdaState,
    /// Groupings whose aggregates are computed by the grouped select itself,
    /// with the scope depth they are valid at
    inline_groups: Vec<(Arc<GroupingExpr>, usize)>,
}

impl<'a> Binder<'a> {
    pub(crate) fn new(cx: &TransformContext<'a>) -> TranslationResult<Self> {
        let mapping = cx.mapping.ok_or_else(|| {
            TranslationError::invalid("Sequence", "binding needs an entity mapping")
        })?;
        Ok(Self {
            mapping,
            aliases: cx.aliases,
            dialect: cx.dialect,
            server_affinity: cx.server_affinity,
            scopes: Vec::new(),
            lambda: LambdaState::default(),
            inline_groups: Vec::new(),
        })
    }

    fn column_projector(&self) -> ColumnProjector<'a> {
        ColumnProjector::new(self.dialect, self.server_affinity)
    }

    /// New select over `from` declaring the columns `projector` needs
    pub(crate) fn project_into(
        &self,
        projector: &Expr,
        from: Expr,
    ) -> TranslationResult<(SelectExpr, Expr)> {
        let alias = self.aliases.next_alias();
        let bound = declared_aliases(&from);
        let projected = self.column_projector().project(projector, &[], alias, &bound)?;
        Ok((SelectExpr::new(alias, projected.columns, Some(from)), projected.projector))
    }

    /// Attach lifted to-one joins to the right of `from`
    pub(crate) fn attach(&self, from: Expr, lifted: Vec<SelectExpr>) -> Expr {
        lifted.into_iter().fold(from, |left, right| {
            Expr::join(JoinKind::OuterApply, left, Expr::select(right), None)
        })
    }

    /// Bind a lambda body with its parameters bound to `args`.
    ///
    /// Returns the body and the to-one joins it lifted.
    fn bind_lambda(
        &mut self,
        lambda: &LambdaExpr,
        args: &[Expr],
    ) -> TranslationResult<(Expr, Vec<SelectExpr>)> {
        if lambda.params.len() != args.len() {
            return Err(TranslationError::invalid(
                "Lambda",
                format!("expected {} parameters, found {}", args.len(), lambda.params.len()),
            ));
        }
        let depth = self.scopes.len();
        self.scopes
            .extend(lambda.params.iter().cloned().zip(args.iter().cloned()));
        let saved = std::mem::take(&mut self.lambda);
        let body = self.visit(&lambda.body);
        let state = std::mem::replace(&mut self.lambda, saved);
        self.scopes.truncate(depth);
        Ok((body?, state.lifted))
    }

    fn lookup(&self, name: &Name) -> TranslationResult<Expr> {
        self.scopes
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, e)| e.clone())
            .ok_or_else(|| TranslationError::UnboundParameter {
                name: name.to_string(),
            })
    }

    /// Bind any expression in the current scope
    fn visit(&mut self, expr: &Expr) -> TranslationResult<Expr> {
        match expr {
            Expr::Parameter(name) => self.lookup(name),
            Expr::Member(m) => {
                let source = self.visit(&m.expr)?;
                self.bind_member(&source, &m.member)
            }
            Expr::Binary(b) => {
                let left = self.visit(&b.left)?;
                let right = self.visit(&b.right)?;
                compare(b.op, &left, &right, Some(self.mapping))
            }
            Expr::Sequence(op) => self.bind_sequence(op, false),
            Expr::Lambda(_) => Err(TranslationError::unsupported(
                "lambda outside a sequence operator",
            )),
            _ => expr.map_children(&mut |child| self.visit(child)),
        }
    }

    fn bind_member(&mut self, source: &Expr, member: &Name) -> TranslationResult<Expr> {
        let unmapped = |entity: &str| TranslationError::UnmappedMember {
            entity: entity.to_string(),
            member: member.to_string(),
        };
        match source {
            Expr::Entity(entity) => self.entity_member(source, entity, member),
            Expr::OuterJoined(o) => self.bind_member(&o.expr, member),
            Expr::New(record) => record.field(member).cloned().ok_or_else(|| unmapped("record")),
            Expr::Grouping(g) if &**member == "Key" => Ok(g.key.clone()),
            // client values are evaluated here rather than on the server
            Expr::Constant(c) => match &c.value {
                Value::Object(fields) => Ok(fields
                    .get(&**member)
                    .cloned()
                    .map(Expr::constant)
                    .unwrap_or_else(Expr::null)),
                _ => Err(unmapped("constant")),
            },
            other => Err(unmapped(other.kind_name())),
        }
    }

    fn entity_member(
        &mut self,
        source: &Expr,
        entity: &Arc<EntityExpr>,
        member: &Name,
    ) -> TranslationResult<Expr> {
        if let Some(value) = entity.new_expr().and_then(|n| n.field(member)) {
            return Ok(value.clone());
        }
        let Some(relationship) = self.mapping.relationship(&entity.entity, member).cloned() else {
            return Err(TranslationError::UnmappedMember {
                entity: entity.entity.to_string(),
                member: member.to_string(),
            });
        };
        if relationship.many {
            let related = self.related_projection(source, &relationship)?;
            return Ok(Expr::projection(related));
        }

        let lifted = self
            .lambda
            .navigations
            .iter()
            .find(|(e, m, _)| Arc::ptr_eq(e, entity) && m == member);
        if let Some((_, _, joined)) = lifted {
            return Ok(joined.clone());
        }
        let related = self.related_projection(source, &relationship)?;
        let (select, joined) =
            add_outer_join_test(&related.select, &related.projector, self.dialect);
        self.lambda.lifted.push(select);
        self.lambda
            .navigations
            .push((entity.clone(), member.clone(), joined.clone()));
        Ok(joined)
    }

    /// All rows of `relationship`'s target matching `source`'s key members
    pub(crate) fn related_projection(
        &mut self,
        source: &Expr,
        relationship: &RelationshipSchema,
    ) -> TranslationResult<ProjectionExpr> {
        let target = self.source_projection(&relationship.target)?;
        self.correlate(source, relationship, &target)
    }

    /// `target` restricted to the rows matching `source`'s key members
    pub(crate) fn correlate(
        &mut self,
        source: &Expr,
        relationship: &RelationshipSchema,
        target: &ProjectionExpr,
    ) -> TranslationResult<ProjectionExpr> {
        if relationship.key_members.len() != relationship.related_key_members.len() {
            return Err(TranslationError::invalid(
                "Member",
                format!("relationship to '{}' has mismatched keys", relationship.target),
            ));
        }
        let mut comparisons = Vec::new();
        for (key, related_key) in relationship
            .key_members
            .iter()
            .zip(&relationship.related_key_members)
        {
            let outer = self.bind_member(source, key)?;
            let inner = self.bind_member(&target.projector, related_key)?;
            comparisons.push(compare(BinaryOp::Eq, &inner, &outer, Some(self.mapping))?);
        }
        let (select, projector) =
            self.project_into(&target.projector, Expr::Select(target.select.clone()))?;
        Ok(ProjectionExpr::new(
            select.with_where(Expr::conjunction(comparisons)),
            projector,
        ))
    }

    /// Every row of `entity`'s table, projected as the entity
    pub(crate) fn source_projection(&self, entity: &str) -> TranslationResult<ProjectionExpr> {
        let alias = self.aliases.next_alias();
        let table = Expr::Table(Arc::new(TableExpr {
            alias,
            entity: entity.into(),
            name: self.mapping.table_name(entity)?,
        }));
        let projector = self.entity_projector(entity, alias)?;
        let (select, projector) = self.project_into(&projector, table)?;
        Ok(ProjectionExpr::new(select, projector))
    }

    /// Construction of `entity` from the columns of table `alias`
    fn entity_projector(&self, entity: &str, alias: TableAlias) -> TranslationResult<Expr> {
        let mut fields = Vec::new();
        for member in self.mapping.mapped_members(entity)? {
            let Some(column) = self.mapping.column(entity, &member) else {
                continue;
            };
            let mut db_type = self.dialect.column_type(column.kind, column.db_type.as_deref());
            if !column.nullable {
                db_type = db_type.not_null();
            }
            let value = Expr::column(
                alias,
                column.column.clone(),
                ValueType::Scalar(column.kind),
                db_type,
            );
            fields.push((member, value));
        }

        let missing: Vec<String> = self
            .mapping
            .constructor_members(entity)
            .iter()
            .filter(|m| !fields.iter().any(|(name, _)| name == *m))
            .map(|m| m.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(TranslationError::UnconstructibleProjection {
                entity: entity.to_string(),
                missing,
            });
        }
        Ok(Expr::entity(entity.into(), Expr::new_entity(entity.into(), fields)))
    }
}
