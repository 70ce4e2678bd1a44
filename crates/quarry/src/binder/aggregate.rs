//! Aggregates, quantifiers and element operators.
//!
//! At the root these produce a one-row projection with an aggregator. Nested
//! inside a lambda an aggregate becomes a scalar subquery (or a column of the
//! grouped select it summarizes), a quantifier becomes `EXISTS` / `IN`, and
//! an element operator becomes an `OUTER APPLY` of a one-row select.

use super::sequence::as_sequence;
use super::{add_outer_join_test, Binder};
use crate::error::{TranslationError, TranslationResult};
use crate::expr::{
    AggregateKind, Aggregator, BinaryOp, ColumnDeclaration, ElementKind, ExistsExpr, Expr, InExpr,
    InValues, LambdaExpr, ProjectionExpr, ScalarExpr, SelectExpr,
};
use crate::transform::compare;
use crate::types::{ScalarKind, Value, ValueType};
use std::sync::Arc;

fn aggregate_type(kind: AggregateKind, argument: Option<&Expr>) -> ValueType {
    match (kind, argument) {
        (AggregateKind::Count, _) => ValueType::Scalar(ScalarKind::Int),
        (AggregateKind::Average, Some(arg))
            if arg.value_type() == ValueType::Scalar(ScalarKind::Decimal) =>
        {
            ValueType::Scalar(ScalarKind::Decimal)
        }
        (AggregateKind::Average, _) => ValueType::Scalar(ScalarKind::Float),
        (_, Some(arg)) => arg.value_type(),
        (_, None) => ValueType::Unknown,
    }
}

impl Binder<'_> {
    /// Whether aggregates over `grouping` belong to the grouped select being built
    fn is_inline_group(&self, bound: &Expr) -> bool {
        match bound {
            Expr::Grouping(g) => self
                .inline_groups
                .iter()
                .any(|(inline, depth)| Arc::ptr_eq(inline, g) && *depth == self.scopes.len()),
            _ => false,
        }
    }

    pub(super) fn bind_aggregate(
        &mut self,
        source: &Expr,
        kind: AggregateKind,
        selector: Option<&LambdaExpr>,
        root: bool,
    ) -> TranslationResult<Expr> {
        let bound = self.visit(source)?;

        if !root && self.is_inline_group(&bound) {
            let Expr::Grouping(grouping) = &bound else {
                return Err(TranslationError::invalid("Grouping", "expected a grouping"));
            };
            let argument = match selector {
                Some(selector) => {
                    let (argument, lifted) =
                        self.bind_lambda(selector, &[grouping.element_source.clone()])?;
                    if !lifted.is_empty() {
                        return Err(TranslationError::unsupported(
                            "relationship navigation inside a grouped aggregate",
                        ));
                    }
                    Some(argument)
                }
                None if kind == AggregateKind::Count => None,
                None => Some(grouping.element_source.clone()),
            };
            let ty = aggregate_type(kind, argument.as_ref());
            return Ok(Expr::aggregate(kind, ty, argument, false));
        }

        let source = as_sequence(bound)?;
        let (from, where_clause, argument, distinct) =
            self.aggregate_input(&source, kind, selector)?;
        let non_scalar = argument
            .as_ref()
            .is_some_and(|a| !a.value_type().is_scalar() && a.value_type() != ValueType::Unknown);
        if non_scalar {
            return Err(TranslationError::unsupported(format!("{kind:?} over a non-scalar value")));
        }

        let types = self.dialect.type_system();
        let ty = aggregate_type(kind, argument.as_ref());
        let aggregate = Expr::aggregate(kind, ty.clone(), argument, distinct);
        let db_type = aggregate
            .query_type(types)
            .unwrap_or_else(|| types.column_type(ScalarKind::Int));
        let decl = ColumnDeclaration {
            name: "agg".into(),
            expr: aggregate,
            db_type,
        };
        let select = SelectExpr::new(self.aliases.next_alias(), vec![decl], Some(from))
            .with_where(where_clause);

        if root {
            let projector = select.column_ref(&select.columns[0]);
            return Ok(Expr::projection(ProjectionExpr {
                select: Arc::new(select),
                projector,
                aggregator: Some(Aggregator::Single),
            }));
        }
        Ok(Expr::Scalar(Arc::new(ScalarExpr {
            ty,
            select: Arc::new(select),
        })))
    }

    /// Source, filter, argument and distinctness of an aggregate over `source`
    fn aggregate_input(
        &mut self,
        source: &ProjectionExpr,
        kind: AggregateKind,
        selector: Option<&LambdaExpr>,
    ) -> TranslationResult<(Expr, Option<Expr>, Option<Expr>, bool)> {
        // COUNT(DISTINCT x) / SUM(DISTINCT x) over a single-column distinct select
        let select = &source.select;
        let distinct_column = select.distinct
            && selector.is_none()
            && select.columns.len() == 1
            && select.skip.is_none()
            && select.take.is_none()
            && select.group_by.is_empty()
            && self.dialect.allows_distinct_in_aggregate();
        if distinct_column {
            if let Some(from) = &select.from {
                let argument = select.columns[0].expr.clone();
                return Ok((from.clone(), select.where_clause.clone(), Some(argument), true));
            }
        }

        let from = Expr::Select(source.select.clone());
        match selector {
            Some(selector) => {
                let (argument, lifted) = self.bind_lambda(selector, &[source.projector.clone()])?;
                Ok((self.attach(from, lifted), None, Some(argument), false))
            }
            None if kind == AggregateKind::Count => Ok((from, None, None, false)),
            None => Ok((from, None, Some(source.projector.clone()), false)),
        }
    }

    pub(super) fn bind_any(
        &mut self,
        source: &Expr,
        predicate: Option<&LambdaExpr>,
        root: bool,
    ) -> TranslationResult<Expr> {
        let source = self.sequence(source)?;
        let source = match predicate {
            Some(predicate) => Arc::new(self.restrict(&source, predicate, false)?),
            None => source,
        };
        self.quantified(&source.select, false, root)
    }

    pub(super) fn bind_all(
        &mut self,
        source: &Expr,
        predicate: &LambdaExpr,
        root: bool,
    ) -> TranslationResult<Expr> {
        let source = self.sequence(source)?;
        let counterexamples = self.restrict(&source, predicate, true)?;
        self.quantified(&counterexamples.select, true, root)
    }

    pub(super) fn bind_contains(
        &mut self,
        source: &Expr,
        value: &Expr,
        root: bool,
    ) -> TranslationResult<Expr> {
        let value = self.visit(value)?;
        let bound = self.visit(source)?;
        if let Expr::Constant(constant) = &bound {
            let Value::Array(items) = &constant.value else {
                return Err(TranslationError::invalid(
                    "Constant",
                    "Contains over a non-list constant",
                ));
            };
            if root {
                return Err(TranslationError::unsupported(
                    "Contains over a client list at the root",
                ));
            }
            let list = items.iter().cloned().map(Expr::constant).collect();
            return Ok(Expr::In(Arc::new(InExpr {
                expr: value,
                values: InValues::List(list),
            })));
        }

        let source = as_sequence(bound)?;
        let single_column =
            source.select.columns.len() == 1 && matches!(source.projector, Expr::Column(_));
        if !root && single_column {
            return Ok(Expr::In(Arc::new(InExpr {
                expr: value,
                values: InValues::Select(source.select.clone()),
            })));
        }
        let predicate = compare(BinaryOp::Eq, &source.projector, &value, Some(self.mapping))?;
        let matching = self.restrict_with(&source, predicate, Vec::new())?;
        self.quantified(&matching.select, false, root)
    }

    /// `EXISTS(select)`, negated when `negated`
    fn quantified(
        &self,
        select: &Arc<SelectExpr>,
        negated: bool,
        root: bool,
    ) -> TranslationResult<Expr> {
        let exists = Expr::Exists(Arc::new(ExistsExpr {
            select: select.clone(),
        }));
        let test = if negated { exists.negate() } else {
            exists
        };
        if !root {
            return Ok(test);
        }

        let types = self.dialect.type_system();
        let (decl, from, compare_with) = if self.dialect.allows_subquery_in_select_without_from() {
            let decl = ColumnDeclaration {
                name: "value".into(),
                expr: test,
                db_type: types.column_type(ScalarKind::Bool).not_null(),
            };
            (decl, None, None)
        } else {
            // count the rows and decide on the client
            let decl = ColumnDeclaration {
                name: "value".into(),
                expr: Expr::aggregate(
                    AggregateKind::Count,
                    ValueType::Scalar(ScalarKind::Int),
                    None,
                    false,
                ),
                db_type: types.column_type(ScalarKind::Int).not_null(),
            };
            let op = if negated { BinaryOp::Eq } else {
                BinaryOp::Gt
            };
            (decl, Some(Expr::Select(select.clone())), Some(op))
        };
        let select = SelectExpr::new(self.aliases.next_alias(), vec![decl], from);
        let column = select.column_ref(&select.columns[0]);
        let projector = match compare_with {
            Some(op) => Expr::binary(op, column, Expr::constant(0)),
            None => column,
        };
        Ok(Expr::projection(ProjectionExpr {
            select: Arc::new(select),
            projector,
            aggregator: Some(Aggregator::Single),
        }))
    }

    pub(super) fn bind_element(
        &mut self,
        source: &Expr,
        kind: ElementKind,
        predicate: Option<&LambdaExpr>,
        root: bool,
    ) -> TranslationResult<Expr> {
        let source = self.sequence(source)?;
        let source = match predicate {
            Some(predicate) => Arc::new(self.restrict(&source, predicate, false)?),
            None => source,
        };
        // two rows are enough to tell a root Single that it is not single
        let take = match (kind, root) {
            (ElementKind::Single | ElementKind::SingleOrDefault, true) => 2,
            _ => 1,
        };
        let (select, projector) =
            self.project_into(&source.projector, Expr::Select(source.select.clone()))?;
        let select = select.with_take(Some(Expr::constant(take)));

        if root {
            return Ok(Expr::projection(ProjectionExpr {
                select: Arc::new(select),
                projector,
                aggregator: Some(Aggregator::from_element(kind)),
            }));
        }
        let (select, joined) = add_outer_join_test(&select, &projector, self.dialect);
        self.lambda.lifted.push(select);
        Ok(joined)
    }
}
