//! Relationship policy.
//!
//! A [`QueryPolicy`] names the relationships that are fetched together with
//! the entities that own them. [`apply_policy`] injects them into a bound
//! projection:
//!
//! * a to-one relationship is joined into the owner's select with an
//!   `OUTER APPLY` and read through an outer-join test, one row in, one row out
//! * a to-many relationship becomes a nested projection
//!
//! Nested projections correlated by key equality are then turned into
//! [`ClientJoinExpr`]s: a second query joined in memory, so collections never
//! multiply the rows of the outer query. The second query is restricted to
//! the keys a copy of the outer query produces.

use crate::binder::{add_outer_join_test, Binder};
use crate::dialect::Dialect;
use crate::error::{TranslationError, TranslationResult};
use crate::expr::rewrite::Rewriter;
use crate::expr::util::{
    all_declared_aliases, and_also, declared_aliases, map_aliases, nulls_equal, realias,
    referenced_aliases, references_any, split_conjuncts,
};
use crate::expr::{
    AliasGenerator, BinaryOp, ClientJoinExpr, EntityExpr, ExistsExpr, Expr, GroupingExpr,
    ProjectionExpr, SelectExpr, TableAlias,
};
use crate::mapping::{EntityMapping, RelationshipSchema};
use crate::projector::ColumnProjector;
use crate::transform::{cleanup_pipeline, TransformContext};
use crate::types::Name;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Relationships fetched eagerly, as `(entity, member)` pairs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryPolicy {
    includes: BTreeSet<(Name, Name)>,
}

impl QueryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn include(mut self, entity: &str, member: &str) -> Self {
        self.includes.insert((entity.into(), member.into()));
        self
    }

    /// Build from `"Entity.Member"` paths
    pub fn from_paths<I, S>(paths: I) -> TranslationResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut policy = Self::new();
        for path in paths {
            let path = path.as_ref();
            let Some((entity, member)) = path.split_once('.') else {
                return Err(TranslationError::invalid(
                    "Member",
                    format!("include path '{path}' is not 'Entity.Member'"),
                ));
            };
            if entity.is_empty() || member.is_empty() || member.contains('.') {
                return Err(TranslationError::invalid(
                    "Member",
                    format!("include path '{path}' is not 'Entity.Member'"),
                ));
            }
            policy = policy.include(entity, member);
        }
        Ok(policy)
    }

    pub fn is_included(&self, entity: &str, member: &str) -> bool {
        self.includes
            .iter()
            .any(|(e, m)| &**e == entity && &**m == member)
    }

    pub fn is_empty(&self) -> bool {
        self.includes.is_empty()
    }

    pub fn includes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.includes.iter().map(|(e, m)| (&**e, &**m))
    }
}

/// Inject included relationships into `projection` and split correlated
/// collections into client joins.
pub fn apply_policy(
    projection: &Expr,
    policy: &QueryPolicy,
    cx: &TransformContext<'_>,
) -> TranslationResult<Expr> {
    if !matches!(projection, Expr::Projection(_)) {
        return Err(TranslationError::invalid(
            projection.kind_name(),
            "policy applies to projections only",
        ));
    }
    let included = if policy.is_empty() {
        projection.clone()
    } else {
        let mapping = cx.mapping.ok_or_else(|| {
            TranslationError::invalid("Projection", "includes need an entity mapping")
        })?;
        let mut includer = Includer {
            binder: Binder::new(cx)?,
            policy,
            mapping,
            dialect: cx.dialect,
            cx: *cx,
            active: Vec::new(),
            lifted: Vec::new(),
        };
        includer.rewrite(projection)?
    };

    let cleaned = cleanup_pipeline().run(included, cx)?;
    let joined = ClientJoins {
        dialect: cx.dialect,
        aliases: cx.aliases,
        enclosing: Vec::new(),
    }
    .rewrite(&cleaned)?;
    if joined.same(&cleaned) {
        return Ok(cleaned);
    }
    cleanup_pipeline().run(joined, cx)
}

struct Includer<'a> {
    binder: Binder<'a>,
    policy: &'a QueryPolicy,
    mapping: &'a dyn EntityMapping,
    dialect: &'a dyn Dialect,
    cx: TransformContext<'a>,
    /// Relationships being expanded, outermost first
    active: Vec<(Name, Name)>,
    /// To-one joins for the projection being rewritten
    lifted: Vec<SelectExpr>,
}

impl Includer<'_> {
    fn projection(
        &mut self,
        projection: &Arc<ProjectionExpr>,
    ) -> TranslationResult<Arc<ProjectionExpr>> {
        let saved = std::mem::take(&mut self.lifted);
        let projector = self.rewrite(&projection.projector);
        let lifted = std::mem::replace(&mut self.lifted, saved);
        let projector = projector?;

        if lifted.is_empty() {
            if projector.same(&projection.projector) {
                return Ok(projection.clone());
            }
            return Ok(Arc::new(ProjectionExpr {
                select: projection.select.clone(),
                projector,
                aggregator: projection.aggregator,
            }));
        }

        let from = self.binder.attach(Expr::Select(projection.select.clone()), lifted);
        let (select, projector) = self.binder.project_into(&projector, from)?;
        let joined = Expr::projection(ProjectionExpr {
            select: Arc::new(select),
            projector,
            aggregator: projection.aggregator,
        });
        match cleanup_pipeline().run(joined, &self.cx)? {
            Expr::Projection(p) => Ok(p),
            other => Err(TranslationError::invalid(
                other.kind_name(),
                "cleanup did not return a projection",
            )),
        }
    }

    fn entity(&mut self, expr: &Expr, entity: &EntityExpr) -> TranslationResult<Expr> {
        let Some(construction) = entity.new_expr() else {
            return Ok(expr.clone());
        };
        let mut fields = construction.fields.clone();
        let mut changed = false;
        for member in self.mapping.mapped_members(&entity.entity)? {
            if construction.field(&member).is_some()
                || !self.policy.is_included(&entity.entity, &member)
            {
                continue;
            }
            let Some(relationship) = self.mapping.relationship(&entity.entity, &member).cloned()
            else {
                continue;
            };
            let key = (entity.entity.clone(), member.clone());
            // a relationship already being expanded further out is not repeated
            if self.active.contains(&key) {
                continue;
            }
            debug!(
                entity = %entity.entity,
                member = %member,
                many = relationship.many,
                "including relationship"
            );
            self.active.push(key);
            let value = self.related(expr, &relationship);
            self.active.pop();
            fields.push((member, value?));
            changed = true;
        }
        if !changed {
            return Ok(expr.clone());
        }
        Ok(Expr::entity(
            entity.entity.clone(),
            Expr::new_entity(entity.entity.clone(), fields),
        ))
    }

    fn related(
        &mut self,
        source: &Expr,
        relationship: &RelationshipSchema,
    ) -> TranslationResult<Expr> {
        // includes of the target go in before the correlation so that it stays outermost
        let target = Arc::new(self.binder.source_projection(&relationship.target)?);
        let target = self.projection(&target)?;
        let related = Arc::new(self.binder.correlate(source, relationship, &target)?);
        if relationship.many {
            return Ok(Expr::Projection(related));
        }
        let (select, joined) =
            add_outer_join_test(&related.select, &related.projector, self.dialect);
        self.lifted.push(select);
        Ok(joined)
    }
}

impl Rewriter for Includer<'_> {
    fn rewrite(&mut self, expr: &Expr) -> TranslationResult<Expr> {
        match expr {
            Expr::Entity(entity) => self.entity(expr, entity),
            Expr::Projection(p) => Ok(Expr::Projection(self.projection(p)?)),
            Expr::Grouping(g) => {
                let key = self.rewrite(&g.key)?;
                let elements = self.rewrite(&g.elements)?;
                if key.same(&g.key) && elements.same(&g.elements) {
                    return Ok(expr.clone());
                }
                Ok(Expr::Grouping(Arc::new(GroupingExpr {
                    key,
                    elements,
                    key_source: g.key_source.clone(),
                    element_source: g.element_source.clone(),
                })))
            }
            Expr::ClientJoin(_) | Expr::Select(_) => Ok(expr.clone()),
            _ => self.rewrite_children(expr),
        }
    }
}

/// Turns key-correlated nested projections into client joins
struct ClientJoins<'a> {
    dialect: &'a dyn Dialect,
    aliases: &'a AliasGenerator,
    /// Selects of the projections entered so far, innermost last. The root
    /// projection is never joined.
    enclosing: Vec<Arc<SelectExpr>>,
}

/// One component of a key correlation
struct KeyEquality {
    inner: Expr,
    outer: Expr,
    nulls_match: bool,
}

impl ClientJoins<'_> {
    fn client_join(
        &self,
        projection: &ProjectionExpr,
        enclosing: &Arc<SelectExpr>,
    ) -> TranslationResult<Option<ClientJoinExpr>> {
        let select = &projection.select;
        let (Some(predicate), Some(from)) = (&select.where_clause, &select.from) else {
            return Ok(None);
        };
        let whole = Expr::Select(select.clone());
        let internal = all_declared_aliases(&whole);
        let outer: HashSet<TableAlias> = referenced_aliases(&whole)
            .into_iter()
            .filter(|a| !internal.contains(a))
            .collect();
        // outer keys are read from the enclosing projection's rows
        if outer.is_empty() || outer.iter().any(|a| *a != enclosing.alias) {
            return Ok(None);
        }

        let mut keys = Vec::new();
        let mut remaining = Vec::new();
        for conjunct in split_conjuncts(predicate) {
            if !references_any(&conjunct, &outer) {
                remaining.push(conjunct);
                continue;
            }
            let Some(key) = key_equality(&conjunct, &outer) else {
                return Ok(None);
            };
            keys.push(key);
        }
        let nulls_match = keys.iter().all(|k| k.nulls_match);
        if keys.iter().any(|k| k.nulls_match != nulls_match) {
            return Ok(None);
        }

        let uncorrelated = SelectExpr::clone(select).with_where(Expr::conjunction(remaining));
        if references_any(&Expr::Select(Arc::new(uncorrelated.clone())), &outer) {
            return Ok(None);
        }
        let restriction = self.restriction(enclosing, &keys, nulls_match)?;
        let where_clause = and_also(uncorrelated.where_clause.clone(), restriction);

        // the inner query returns its key columns alongside the projected ones
        let key_record = Expr::new_record(
            keys.iter()
                .enumerate()
                .map(|(i, k)| (Name::from(format!("k{i}")), k.inner.clone()))
                .collect(),
        );
        let projected = ColumnProjector::new(self.dialect, false).project(
            &key_record,
            &uncorrelated.columns,
            uncorrelated.alias,
            &declared_aliases(from),
        )?;
        let Expr::New(key_record) = &projected.projector else {
            return Ok(None);
        };
        let inner_key: Vec<Expr> = key_record.fields.iter().map(|(_, k)| k.clone()).collect();
        let select = SelectExpr {
            columns: projected.columns,
            where_clause,
            ..uncorrelated
        };
        Ok(Some(ClientJoinExpr {
            projection: Arc::new(ProjectionExpr {
                select: Arc::new(select),
                projector: projection.projector.clone(),
                aggregator: None,
            }),
            outer_key: keys.into_iter().map(|k| k.outer).collect(),
            inner_key,
            nulls_match,
        }))
    }

    /// `EXISTS` over a copy of the enclosing select matching the inner keys,
    /// so the second query only reads rows some outer row can use.
    ///
    /// `None` when the enclosing select is itself correlated; the second
    /// query then reads every row and the keys are matched in memory.
    fn restriction(
        &self,
        enclosing: &Arc<SelectExpr>,
        keys: &[KeyEquality],
        nulls_match: bool,
    ) -> TranslationResult<Option<Expr>> {
        let (copy, renamed) = realias(enclosing, self.aliases)?;
        let copied = Expr::Select(copy.clone());
        let declared = all_declared_aliases(&copied);
        if referenced_aliases(&copied).iter().any(|a| !declared.contains(a)) {
            return Ok(None);
        }
        let matches = keys
            .iter()
            .map(|k| {
                let outer = map_aliases(&k.outer, &renamed)?;
                Ok(if nulls_match {
                    nulls_equal(k.inner.clone(), outer)
                } else {
                    Expr::binary(BinaryOp::Eq, k.inner.clone(), outer)
                })
            })
            .collect::<TranslationResult<Vec<_>>>()?;
        let select = SelectExpr::new(self.aliases.next_alias(), Vec::new(), Some(copied))
            .with_where(Expr::conjunction(matches));
        Ok(Some(Expr::Exists(Arc::new(ExistsExpr {
            select: Arc::new(select),
        }))))
    }

    /// Rewrite `projector` with `select` as the innermost enclosing select
    fn nested(&mut self, select: &Arc<SelectExpr>, projector: &Expr) -> TranslationResult<Expr> {
        self.enclosing.push(select.clone());
        let out = self.rewrite(projector);
        self.enclosing.pop();
        out
    }
}

/// `(inner, outer)` sides of an equality between an inner column and an
/// outer value, also accepting the null-matching form grouping uses
fn key_equality(conjunct: &Expr, outer: &HashSet<TableAlias>) -> Option<KeyEquality> {
    let Expr::Binary(b) = conjunct else {
        return None;
    };
    match b.op {
        BinaryOp::Eq => {
            let sides = |inner: &Expr, outer_side: &Expr| {
                let inner_ok = matches!(inner, Expr::Column(c) if !outer.contains(&c.alias));
                let outer_ok = references_any(outer_side, outer)
                    && referenced_aliases(outer_side).iter().all(|a| outer.contains(a));
                (inner_ok && outer_ok).then(|| KeyEquality {
                    inner: inner.clone(),
                    outer: outer_side.clone(),
                    nulls_match: false,
                })
            };
            sides(&b.left, &b.right).or_else(|| sides(&b.right, &b.left))
        }
        // (a IS NULL AND b IS NULL) OR a = b
        BinaryOp::Or => {
            let (Expr::Binary(both_null), Expr::Binary(eq)) = (&b.left, &b.right) else {
                return None;
            };
            if both_null.op != BinaryOp::And || eq.op != BinaryOp::Eq {
                return None;
            }
            let (Expr::IsNull(l), Expr::IsNull(r)) = (&both_null.left, &both_null.right) else {
                return None;
            };
            let tests = |x: &Expr, y: &Expr| l.expr == *x && r.expr == *y;
            if !tests(&eq.left, &eq.right) && !tests(&eq.right, &eq.left) {
                return None;
            }
            let mut key = key_equality(&b.right, outer)?;
            key.nulls_match = true;
            Some(key)
        }
        _ => None,
    }
}

impl Rewriter for ClientJoins<'_> {
    fn rewrite(&mut self, expr: &Expr) -> TranslationResult<Expr> {
        match expr {
            Expr::Projection(p) => {
                let enclosing = self.enclosing.last().cloned();
                if let (Some(enclosing), None) = (enclosing, p.aggregator) {
                    if let Some(join) = self.client_join(p, &enclosing)? {
                        let projector =
                            self.nested(&join.projection.select, &join.projection.projector)?;
                        let projection = Arc::new(ProjectionExpr {
                            projector,
                            ..ProjectionExpr::clone(&join.projection)
                        });
                        return Ok(Expr::ClientJoin(Arc::new(ClientJoinExpr {
                            projection,
                            ..join
                        })));
                    }
                }
                let projector = self.nested(&p.select, &p.projector)?;
                if projector.same(&p.projector) {
                    return Ok(expr.clone());
                }
                Ok(Expr::projection(ProjectionExpr {
                    select: p.select.clone(),
                    projector,
                    aggregator: p.aggregator,
                }))
            }
            Expr::Select(_) | Expr::ClientJoin(_) => Ok(expr.clone()),
            _ => self.rewrite_children(expr),
        }
    }
}
