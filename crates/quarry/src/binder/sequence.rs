//! Sequence operators that produce sequences.

use super::{add_outer_join_test, Binder};
use crate::error::{TranslationError, TranslationResult};
use crate::expr::util::{
    declared_aliases, inline_columns, map_aliases, nulls_equal, realias, references_any,
};
use crate::expr::{
    BinaryOp, Expr, GroupingExpr, JoinKind, LambdaExpr, OrderDirection, OrderExpr, ProjectionExpr,
    SelectExpr, SequenceOp,
};
use crate::projector::ColumnProjector;
use crate::transform::compare;
use std::collections::HashSet;
use std::sync::Arc;

impl Binder<'_> {
    pub(super) fn bind_sequence(&mut self, op: &SequenceOp, root: bool) -> TranslationResult<Expr> {
        let projection = match op {
            SequenceOp::Source { entity } => self.source_projection(entity)?,
            SequenceOp::Where { source, predicate } => {
                let source = self.sequence(source)?;
                self.restrict(&source, predicate, false)?
            }
            SequenceOp::Select { source, selector } => self.bind_select(source, selector)?,
            SequenceOp::SelectMany {
                source,
                collection,
                result,
            } => self.bind_select_many(source, collection, result.as_deref())?,
            SequenceOp::Join {
                outer,
                inner,
                outer_key,
                inner_key,
                result,
            } => self.bind_join(outer, inner, outer_key, inner_key, result)?,
            SequenceOp::GroupBy {
                source,
                key,
                element,
            } => self.bind_group_by(source, key, element.as_deref())?,
            SequenceOp::OrderBy { .. } => self.bind_order_by(op)?,
            SequenceOp::Reverse { source } => {
                let source = self.sequence(source)?;
                self.wrap(&source, |s| s.with_reverse(true))?
            }
            SequenceOp::Skip { source, count } => {
                let source = self.sequence(source)?;
                let count = self.visit(count)?;
                self.wrap(&source, |s| s.with_skip(Some(count)))?
            }
            SequenceOp::Take { source, count } => {
                let source = self.sequence(source)?;
                let count = self.visit(count)?;
                self.wrap(&source, |s| s.with_take(Some(count)))?
            }
            SequenceOp::Distinct { source } => {
                let source = self.sequence(source)?;
                self.wrap(&source, |s| s.with_distinct(true))?
            }
            SequenceOp::DefaultIfEmpty { .. } => {
                return Err(TranslationError::unsupported(
                    "DefaultIfEmpty outside a SelectMany collection",
                ))
            }
            SequenceOp::Aggregate {
                source,
                kind,
                selector,
            } => return self.bind_aggregate(source, *kind, selector.as_deref(), root),
            SequenceOp::Any { source, predicate } => {
                return self.bind_any(source, predicate.as_deref(), root)
            }
            SequenceOp::All { source, predicate } => return self.bind_all(source, predicate, root),
            SequenceOp::Contains { source, value } => {
                return self.bind_contains(source, value, root)
            }
            SequenceOp::Element {
                source,
                kind,
                predicate,
            } => return self.bind_element(source, *kind, predicate.as_deref(), root),
        };
        Ok(Expr::projection(projection))
    }

    /// Bind an operand that must denote a sequence
    pub(super) fn sequence(&mut self, expr: &Expr) -> TranslationResult<Arc<ProjectionExpr>> {
        let bound = self.visit(expr)?;
        as_sequence(bound)
    }

    /// New select over `source` adjusted by `f`
    fn wrap(
        &self,
        source: &ProjectionExpr,
        f: impl FnOnce(SelectExpr) -> SelectExpr,
    ) -> TranslationResult<ProjectionExpr> {
        let (select, projector) =
            self.project_into(&source.projector, Expr::Select(source.select.clone()))?;
        Ok(ProjectionExpr::new(f(select), projector))
    }

    /// `source` filtered by `predicate`, negated when `negate`
    pub(super) fn restrict(
        &mut self,
        source: &ProjectionExpr,
        predicate: &LambdaExpr,
        negate: bool,
    ) -> TranslationResult<ProjectionExpr> {
        let (predicate, lifted) = self.bind_lambda(predicate, &[source.projector.clone()])?;
        let predicate = if negate { predicate.negate() } else {
            predicate
        };
        self.restrict_with(source, predicate, lifted)
    }

    pub(super) fn restrict_with(
        &self,
        source: &ProjectionExpr,
        predicate: Expr,
        lifted: Vec<SelectExpr>,
    ) -> TranslationResult<ProjectionExpr> {
        let from = self.attach(Expr::Select(source.select.clone()), lifted);
        let (select, projector) = self.project_into(&source.projector, from)?;
        Ok(ProjectionExpr::new(select.with_where(Some(predicate)), projector))
    }

    fn bind_select(
        &mut self,
        source: &Expr,
        selector: &LambdaExpr,
    ) -> TranslationResult<ProjectionExpr> {
        let source = self.sequence(source)?;
        if let Expr::Grouping(grouping) = &source.projector {
            if !source.select.group_by.is_empty() {
                return self.bind_group_select(&source, grouping, selector);
            }
        }
        let (body, lifted) = self.bind_lambda(selector, &[source.projector.clone()])?;
        let from = self.attach(Expr::Select(source.select.clone()), lifted);
        let (select, projector) = self.project_into(&body, from)?;
        Ok(ProjectionExpr::new(select, projector))
    }

    /// Select over a grouped select, computed by a select grouped the same way
    fn bind_group_select(
        &mut self,
        source: &ProjectionExpr,
        grouping: &GroupingExpr,
        selector: &LambdaExpr,
    ) -> TranslationResult<ProjectionExpr> {
        let Some(from) = source.select.from.clone() else {
            return Err(TranslationError::invalid("Select", "grouped select without a source"));
        };
        let local = Arc::new(GroupingExpr {
            key: grouping.key_source.clone(),
            elements: inline_columns(&grouping.elements, &source.select)?,
            key_source: grouping.key_source.clone(),
            element_source: grouping.element_source.clone(),
        });
        self.inline_groups.push((local.clone(), self.scopes.len() + 1));
        let bound = self.bind_lambda(selector, &[Expr::Grouping(local)]);
        self.inline_groups.pop();
        let (body, lifted) = bound?;

        let from = self.attach(from, lifted);
        let (select, projector) = self.project_into(&body, from)?;
        let select = SelectExpr {
            where_clause: source.select.where_clause.clone(),
            group_by: source.select.group_by.clone(),
            ..select
        };
        Ok(ProjectionExpr::new(select, projector))
    }

    fn bind_select_many(
        &mut self,
        source: &Expr,
        collection: &LambdaExpr,
        result: Option<&LambdaExpr>,
    ) -> TranslationResult<ProjectionExpr> {
        let source = self.sequence(source)?;
        let (body, default_if_empty) = match &collection.body {
            Expr::Sequence(op) => match &**op {
                SequenceOp::DefaultIfEmpty { source } => (source.clone(), true),
                _ => (collection.body.clone(), false),
            },
            other => (other.clone(), false),
        };
        let collection = LambdaExpr {
            params: collection.params.clone(),
            body,
        };
        let (bound, lifted) = self.bind_lambda(&collection, &[source.projector.clone()])?;
        let inner = as_sequence(bound)?;
        let left = self.attach(Expr::Select(source.select.clone()), lifted);

        let correlated =
            references_any(&Expr::Select(inner.select.clone()), &declared_aliases(&left));
        let (kind, right, inner_projector) = if default_if_empty {
            let (select, projector) =
                add_outer_join_test(&inner.select, &inner.projector, self.dialect);
            (JoinKind::OuterApply, select, projector)
        } else {
            let kind = if correlated {
                JoinKind::CrossApply
            } else {
                JoinKind::Cross
            };
            (kind, (*inner.select).clone(), inner.projector.clone())
        };
        let mut from = Expr::join(kind, left, Expr::select(right), None);

        let projector = match result {
            Some(result) => {
                let (body, lifted) =
                    self.bind_lambda(result, &[source.projector.clone(), inner_projector])?;
                from = self.attach(from, lifted);
                body
            }
            None => inner_projector,
        };
        let (select, projector) = self.project_into(&projector, from)?;
        Ok(ProjectionExpr::new(select, projector))
    }

    fn bind_join(
        &mut self,
        outer: &Expr,
        inner: &Expr,
        outer_key: &LambdaExpr,
        inner_key: &LambdaExpr,
        result: &LambdaExpr,
    ) -> TranslationResult<ProjectionExpr> {
        let outer = self.sequence(outer)?;
        let inner = self.sequence(inner)?;
        let (outer_key, outer_lifted) = self.bind_lambda(outer_key, &[outer.projector.clone()])?;
        let (inner_key, inner_lifted) = self.bind_lambda(inner_key, &[inner.projector.clone()])?;
        if !outer_lifted.is_empty() || !inner_lifted.is_empty() {
            return Err(TranslationError::unsupported("relationship navigation in join keys"));
        }
        let condition = compare(BinaryOp::Eq, &outer_key, &inner_key, Some(self.mapping))?;
        let join = Expr::join(
            JoinKind::Inner,
            Expr::Select(outer.select.clone()),
            Expr::Select(inner.select.clone()),
            Some(condition),
        );
        let (body, lifted) =
            self.bind_lambda(result, &[outer.projector.clone(), inner.projector.clone()])?;
        let from = self.attach(join, lifted);
        let (select, projector) = self.project_into(&body, from)?;
        Ok(ProjectionExpr::new(select, projector))
    }

    fn bind_order_by(&mut self, op: &SequenceOp) -> TranslationResult<ProjectionExpr> {
        // OrderBy(...).ThenBy(...) nests outwards; collect the chain innermost first
        let mut keys: Vec<(Arc<LambdaExpr>, OrderDirection)> = Vec::new();
        let mut current = op;
        let source = loop {
            let SequenceOp::OrderBy {
                source,
                key,
                direction,
                then,
            } = current
            else {
                return Err(TranslationError::invalid(
                    "Sequence",
                    "ThenBy without a preceding OrderBy",
                ));
            };
            keys.push((key.clone(), *direction));
            if !*then {
                break source;
            }
            match source {
                Expr::Sequence(inner) => current = &**inner,
                _ => {
                    return Err(TranslationError::invalid(
                        "Sequence",
                        "ThenBy without a preceding OrderBy",
                    ))
                }
            }
        };
        keys.reverse();

        let source = self.sequence(source)?;
        let mut orderings = Vec::new();
        let mut lifted = Vec::new();
        for (key, direction) in keys {
            let (expr, key_lifted) = self.bind_lambda(&key, &[source.projector.clone()])?;
            lifted.extend(key_lifted);
            for part in self.ordering_keys(&expr)? {
                orderings.push(OrderExpr::new(direction, part));
            }
        }
        let from = self.attach(Expr::Select(source.select.clone()), lifted);
        let (select, projector) = self.project_into(&source.projector, from)?;
        Ok(ProjectionExpr::new(select.with_order_by(orderings), projector))
    }

    /// Scalar expressions an ordering key sorts by
    fn ordering_keys(&self, key: &Expr) -> TranslationResult<Vec<Expr>> {
        match key {
            Expr::OuterJoined(o) => self.ordering_keys(&o.expr),
            Expr::Entity(entity) => {
                let construction = entity.new_expr().ok_or_else(|| {
                    TranslationError::invalid(
                        "Entity",
                        format!("'{}' is not a plain construction", entity.entity),
                    )
                })?;
                self.mapping
                    .primary_key(&entity.entity)?
                    .iter()
                    .map(|k| {
                        construction
                            .field(k)
                            .cloned()
                            .ok_or_else(|| TranslationError::UnmappedMember {
                                entity: entity.entity.to_string(),
                                member: k.to_string(),
                            })
                    })
                    .collect()
            }
            Expr::New(record) => {
                let mut parts = Vec::new();
                for (_, field) in &record.fields {
                    parts.extend(self.ordering_keys(field)?);
                }
                Ok(parts)
            }
            other => Ok(vec![other.clone()]),
        }
    }

    fn bind_group_by(
        &mut self,
        source: &Expr,
        key: &LambdaExpr,
        element: Option<&LambdaExpr>,
    ) -> TranslationResult<ProjectionExpr> {
        let source = self.sequence(source)?;
        let (key_expr, key_lifted) = self.bind_lambda(key, &[source.projector.clone()])?;
        let element_expr = match element {
            Some(element) => {
                let (expr, lifted) = self.bind_lambda(element, &[source.projector.clone()])?;
                if !lifted.is_empty() {
                    return Err(TranslationError::unsupported(
                        "relationship navigation in a group element",
                    ));
                }
                expr
            }
            None => source.projector.clone(),
        };
        if !key_lifted.is_empty() {
            return Err(TranslationError::unsupported("relationship navigation in a group key"));
        }

        // group keys as expressions over the source select
        let source_alias = source.select.alias;
        let bound = HashSet::from([source_alias]);
        let keys = ColumnProjector::new(self.dialect, true).project(
            &key_expr,
            &[],
            source_alias,
            &bound,
        )?;
        let group_by: Vec<Expr> = keys.columns.iter().map(|c| c.expr.clone()).collect();

        // elements come from a copy of the source correlated on the group keys
        let (copy, renamed) = realias(&source.select, self.aliases)?;
        let copy_keys = group_by
            .iter()
            .map(|k| map_aliases(k, &renamed))
            .collect::<TranslationResult<Vec<_>>>()?;
        let correlation = Expr::conjunction(
            copy_keys
                .into_iter()
                .zip(&group_by)
                .map(|(inner, outer)| nulls_equal(inner, outer.clone())),
        );
        let copy_element = map_aliases(&element_expr, &renamed)?;
        let (elements_select, elements_projector) =
            self.project_into(&copy_element, Expr::Select(copy))?;
        let elements =
            ProjectionExpr::new(elements_select.with_where(correlation), elements_projector);

        let grouping = Expr::Grouping(Arc::new(GroupingExpr {
            key: key_expr.clone(),
            elements: Expr::projection(elements),
            key_source: key_expr,
            element_source: element_expr,
        }));
        let (select, projector) =
            self.project_into(&grouping, Expr::Select(source.select.clone()))?;
        Ok(ProjectionExpr::new(select.with_group_by(group_by), projector))
    }
}

/// Narrow a bound operand to the sequence it denotes
pub(super) fn as_sequence(bound: Expr) -> TranslationResult<Arc<ProjectionExpr>> {
    match bound {
        Expr::Projection(p) if !p.is_singleton() => Ok(p),
        Expr::Grouping(g) => match &g.elements {
            Expr::Projection(p) => Ok(p.clone()),
            other => Err(TranslationError::invalid(
                other.kind_name(),
                "grouping elements are not a projection",
            )),
        },
        other => Err(TranslationError::invalid(other.kind_name(), "expected a sequence")),
    }
}
