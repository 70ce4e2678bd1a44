//! Redundant-subquery removal.
//!
//! A select is inlined into its parent when the two can be expressed as one
//! select without changing which rows come back: predicates are combined,
//! references to the inner select's columns are replaced by the expressions
//! they declare, and paging or distinctness carries over when the parent
//! does not depend on it. Simple selects over a table that sit inside a join
//! are inlined too, their predicate moving into the join condition.

use crate::error::TranslationResult;
use crate::expr::rewrite::Rewriter;
use crate::expr::util::{and_also, column_map, replace_columns, ColumnKey};
use crate::expr::{Expr, JoinExpr, JoinKind, OrderExpr, SelectExpr};
use crate::transform::{QueryTransform, TransformContext};
use std::collections::HashMap;
use std::sync::Arc;

pub struct RedundantSubqueryRemoval;

impl QueryTransform for RedundantSubqueryRemoval {
    fn name(&self) -> &'static str {
        "redundant_subqueries"
    }

    fn transform(&self, expr: Expr, _cx: &TransformContext<'_>) -> TranslationResult<Expr> {
        Remover.rewrite(&expr)
    }
}

struct Remover;

impl Rewriter for Remover {
    fn rewrite(&mut self, expr: &Expr) -> TranslationResult<Expr> {
        let out = self.rewrite_children(expr)?;
        match &out {
            Expr::Select(s) => Ok(simplify(s)?.map(Expr::select).unwrap_or(out)),
            _ => Ok(out),
        }
    }
}

/// A select with no semantics beyond filtering and naming
fn is_simple(select: &SelectExpr) -> bool {
    !select.distinct
        && select.group_by.is_empty()
        && select.skip.is_none()
        && select.take.is_none()
        && !select.reverse
        && !select.has_aggregates()
        && !select
            .columns
            .iter()
            .any(|c| matches!(c.expr, Expr::RowNumber(_)))
}

fn orders_preserved(select: &SelectExpr) -> bool {
    !select.distinct && select.group_by.is_empty() && !select.has_aggregates()
}

/// Whether `outer` only renames every column of `inner`
fn is_name_map(outer: &SelectExpr, inner: &SelectExpr) -> bool {
    outer.columns.len() == inner.columns.len()
        && outer.columns.iter().all(|c| {
            c.expr
                .as_column()
                .is_some_and(|col| col.alias == inner.alias && col.name == c.name)
        })
}

/// Whether `outer` can absorb `inner`, its `FROM`
fn can_merge(outer: &SelectExpr, inner: &SelectExpr) -> bool {
    if outer.reverse || inner.reverse || !inner.group_by.is_empty() {
        return false;
    }
    if inner.columns.iter().any(|c| matches!(c.expr, Expr::RowNumber(_))) {
        return false;
    }
    let outer_order = !outer.order_by.is_empty();
    let outer_group = !outer.group_by.is_empty();
    let outer_aggregates = outer.has_aggregates();
    let outer_paged = outer.take.is_some() || outer.skip.is_some();

    let inner_paged = inner.take.is_some() || inner.skip.is_some();
    if inner_paged
        && (outer.where_clause.is_some()
            || outer_order
            || outer.distinct
            || outer_aggregates
            || outer_group)
    {
        return false;
    }
    // take-then-skip is a window; skip-then-take merges into one
    if inner.take.is_some() && outer_paged {
        return false;
    }
    if inner.skip.is_some() && outer.skip.is_some() {
        return false;
    }
    if inner.distinct
        && (outer_paged
            || outer_group
            || outer_aggregates
            || outer_order
            || !is_name_map(outer, inner))
    {
        return false;
    }
    if inner.has_aggregates()
        && (outer.where_clause.is_some()
            || outer_paged
            || outer.distinct
            || outer_aggregates
            || outer_group)
    {
        return false;
    }
    true
}

fn simplify(select: &SelectExpr) -> TranslationResult<Option<SelectExpr>> {
    let mut current = select.clone();
    let mut changed = false;

    while let Some(Expr::Select(inner)) = &current.from {
        if !can_merge(&current, inner) {
            break;
        }
        let inner = inner.clone();
        current = merge(&current, &inner)?;
        changed = true;
    }

    if let Some(Expr::Join(join)) = &current.from {
        let mut map = HashMap::new();
        let from = flatten_join(join, &mut map)?;
        if !map.is_empty() {
            current.from = Some(from);
            current = inline(current, &map)?;
            changed = true;
        }
    }

    Ok(changed.then_some(current))
}

fn inline(select: SelectExpr, map: &HashMap<ColumnKey, Expr>) -> TranslationResult<SelectExpr> {
    match replace_columns(&Expr::select(select.clone()), map)? {
        Expr::Select(s) => Ok((*s).clone()),
        _ => Ok(select),
    }
}

/// Absorb `inner`, the `FROM` of `outer`, into `outer`
fn merge(outer: &SelectExpr, inner: &SelectExpr) -> TranslationResult<SelectExpr> {
    let mut shell = outer.clone();
    shell.from = None;
    let mut merged = inline(shell, &column_map(inner))?;

    merged.from = inner.from.clone();
    merged.where_clause = and_also(inner.where_clause.clone(), merged.where_clause);
    merged.distinct |= inner.distinct;
    merged.skip = merged.skip.or_else(|| inner.skip.clone());
    merged.take = merged.take.or_else(|| inner.take.clone());
    if orders_preserved(&merged) {
        let mut order_by: Vec<OrderExpr> = merged.order_by;
        for ordering in &inner.order_by {
            if !order_by.iter().any(|o| o.expr == ordering.expr) {
                order_by.push(ordering.clone());
            }
        }
        merged.order_by = order_by;
    }
    Ok(merged)
}

fn flatten_join(
    join: &Arc<JoinExpr>,
    map: &mut HashMap<ColumnKey, Expr>,
) -> TranslationResult<Expr> {
    let mut lifted = Vec::new();
    let left = flatten_source(&join.left, join.kind, false, map, &mut lifted)?;
    let right = flatten_source(&join.right, join.kind, true, map, &mut lifted)?;
    if left.same(&join.left) && right.same(&join.right) && lifted.is_empty() {
        return Ok(Expr::Join(join.clone()));
    }
    let condition = and_also(join.condition.clone(), Expr::conjunction(lifted));
    Ok(Expr::join(join.kind, left, right, condition))
}

fn inlinable(select: &SelectExpr, kind: JoinKind, is_right: bool) -> bool {
    let over_table = matches!(select.from, Some(Expr::Table(_)));
    let predicate_fits = select.where_clause.is_none()
        || kind == JoinKind::Inner
        || (is_right && matches!(kind, JoinKind::LeftOuter | JoinKind::SingletonLeftOuter));
    over_table
        && is_simple(select)
        && select.order_by.is_empty()
        && !(is_right && kind.is_apply())
        && predicate_fits
}

fn flatten_source(
    source: &Expr,
    kind: JoinKind,
    is_right: bool,
    map: &mut HashMap<ColumnKey, Expr>,
    lifted: &mut Vec<Expr>,
) -> TranslationResult<Expr> {
    match source {
        Expr::Join(inner) => flatten_join(inner, map),
        Expr::Select(s) if inlinable(s, kind, is_right) => {
            map.extend(column_map(s));
            if let Some(predicate) = &s.where_clause {
                lifted.push(predicate.clone());
            }
            Ok(s.from.clone().unwrap_or_else(|| source.clone()))
        }
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::SqlServerDialect;
    use crate::expr::{
        AliasGenerator, BinaryOp, ColumnDeclaration, OrderDirection, ProjectionExpr, TableAlias,
        TableExpr,
    };
    use crate::types::{QueryType, SqlType, ValueType};

    fn int() -> QueryType {
        QueryType::new(SqlType::Int)
    }

    fn col(alias: TableAlias, name: &str) -> Expr {
        Expr::column(alias, name.into(), ValueType::Unknown, int())
    }

    fn decl(name: &str, expr: Expr) -> ColumnDeclaration {
        ColumnDeclaration {
            name: name.into(),
            expr,
            db_type: int(),
        }
    }

    fn table(alias: TableAlias, name: &str) -> Expr {
        Expr::Table(Arc::new(TableExpr {
            alias,
            entity: name.into(),
            name: name.into(),
        }))
    }

    fn run(expr: Expr, gen: &AliasGenerator) -> Expr {
        let dialect = SqlServerDialect::new();
        let cx = TransformContext::new(gen, &dialect);
        RedundantSubqueryRemoval.transform(expr, &cx).unwrap()
    }

    /// `SELECT a FROM (inner)`
    fn over(gen: &AliasGenerator, inner: SelectExpr) -> SelectExpr {
        let columns = vec![decl("a", col(inner.alias, "a"))];
        SelectExpr::new(gen.next_alias(), columns, Some(Expr::select(inner)))
    }

    fn filtered(gen: &AliasGenerator, distinct: bool) -> SelectExpr {
        let t = gen.next_alias();
        SelectExpr::new(gen.next_alias(), vec![decl("a", col(t, "a"))], Some(table(t, "T")))
            .with_where(Some(Expr::binary(BinaryOp::Gt, col(t, "a"), Expr::constant(1))))
            .with_order_by(vec![OrderExpr::new(OrderDirection::Ascending, col(t, "a"))])
            .with_distinct(distinct)
    }

    #[test]
    fn test_simple_subquery_is_merged_into_parent() {
        let gen = AliasGenerator::new();
        let inner = filtered(&gen, false);
        let outer = over(&gen, inner).with_take(Some(Expr::constant(5)));
        let alias = outer.alias;
        let tree = Expr::projection(ProjectionExpr::new(outer, col(alias, "a")));

        let out = run(tree, &gen);
        let Expr::Projection(p) = &out else {
            panic!("expected projection")
        };
        assert_eq!(p.select.alias, alias);
        assert!(matches!(p.select.from, Some(Expr::Table(_))));
        assert!(p.select.where_clause.is_some());
        assert_eq!(p.select.order_by.len(), 1);
        assert!(p.select.take.is_some());

        assert!(run(out.clone(), &gen).same(&out));
    }

    #[test]
    fn test_distinct_subquery_under_take_is_kept() {
        let gen = AliasGenerator::new();
        let inner = filtered(&gen, true);
        let outer = over(&gen, inner).with_take(Some(Expr::constant(3)));
        let out = run(Expr::select(outer), &gen);
        let Expr::Select(s) = &out else {
            panic!("expected select")
        };
        assert!(matches!(s.from, Some(Expr::Select(_))));
    }

    #[test]
    fn test_renaming_select_over_distinct_is_merged() {
        let gen = AliasGenerator::new();
        let inner = filtered(&gen, true);
        let outer = over(&gen, inner);
        let out = run(Expr::select(outer), &gen);
        let Expr::Select(s) = &out else {
            panic!("expected select")
        };
        assert!(s.distinct);
        assert!(s.order_by.is_empty());
        assert!(matches!(s.from, Some(Expr::Table(_))));
    }

    fn paged_pair(gen: &AliasGenerator, inner_skip: bool) -> Expr {
        let inner = filtered(gen, false).with_where(None);
        let inner = if inner_skip {
            inner.with_skip(Some(Expr::constant(5)))
        } else {
            inner.with_take(Some(Expr::constant(10)))
        };
        let outer = over(gen, inner);
        let outer = if inner_skip {
            outer.with_take(Some(Expr::constant(10)))
        } else {
            outer.with_skip(Some(Expr::constant(5)))
        };
        Expr::select(outer)
    }

    #[test]
    fn test_take_over_skip_is_merged() {
        let gen = AliasGenerator::new();
        let out = run(paged_pair(&gen, true), &gen);
        let Expr::Select(s) = &out else {
            panic!("expected select")
        };
        assert!(s.skip.is_some() && s.take.is_some());
        assert_eq!(s.order_by.len(), 1);
        assert!(matches!(s.from, Some(Expr::Table(_))));
    }

    #[test]
    fn test_skip_over_take_is_kept() {
        let gen = AliasGenerator::new();
        let out = run(paged_pair(&gen, false), &gen);
        let Expr::Select(s) = &out else {
            panic!("expected select")
        };
        assert!(matches!(s.from, Some(Expr::Select(_))));
    }

    #[test]
    fn test_filter_over_take_is_kept() {
        let gen = AliasGenerator::new();
        let inner = filtered(&gen, false).with_take(Some(Expr::constant(10)));
        let inner_alias = inner.alias;
        let outer = over(&gen, inner)
            .with_where(Some(Expr::binary(BinaryOp::Lt, col(inner_alias, "a"), Expr::constant(9))));
        let out = run(Expr::select(outer), &gen);
        let Expr::Select(s) = &out else {
            panic!("expected select")
        };
        assert!(matches!(s.from, Some(Expr::Select(_))));
    }

    #[test]
    fn test_orderings_dropped_when_parent_is_distinct() {
        let gen = AliasGenerator::new();
        let inner = filtered(&gen, false);
        let outer = over(&gen, inner).with_distinct(true);
        let out = run(Expr::select(outer), &gen);
        let Expr::Select(s) = &out else {
            panic!("expected select")
        };
        assert!(s.order_by.is_empty());
        assert!(matches!(s.from, Some(Expr::Table(_))));
    }

    #[test]
    fn test_right_side_predicate_moves_into_join_condition() {
        let gen = AliasGenerator::new();
        let o = gen.next_alias();
        let c = gen.next_alias();
        let customers = SelectExpr::new(
            gen.next_alias(),
            vec![decl("CustomerID", col(c, "CustomerID"))],
            Some(table(c, "Customers")),
        )
        .with_where(Some(Expr::binary(BinaryOp::Eq, col(c, "City"), Expr::constant("London"))));
        let customer_alias = customers.alias;
        let join = Expr::join(
            JoinKind::LeftOuter,
            table(o, "Orders"),
            Expr::select(customers),
            Some(Expr::binary(
                BinaryOp::Eq,
                col(customer_alias, "CustomerID"),
                col(o, "CustomerID"),
            )),
        );
        let columns = vec![decl("CustomerID", col(customer_alias, "CustomerID"))];
        let outer = SelectExpr::new(gen.next_alias(), columns, Some(join));

        let out = run(Expr::select(outer), &gen);
        let Expr::Select(s) = &out else {
            panic!("expected select")
        };
        let Some(Expr::Join(j)) = &s.from else {
            panic!("expected join")
        };
        assert!(matches!(j.right, Expr::Table(_)));
        let Some(Expr::Binary(cond)) = &j.condition else {
            panic!("expected condition")
        };
        assert_eq!(cond.op, BinaryOp::And);
        assert_eq!(s.columns[0].expr, col(c, "CustomerID"));
        assert!(s.where_clause.is_none());
    }
}
