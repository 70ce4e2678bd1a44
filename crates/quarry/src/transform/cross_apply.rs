//! Apply-join lowering.
//!
//! A `CROSS APPLY` / `OUTER APPLY` whose right side only correlates with the
//! left through its `WHERE` is rewritten to a plain join: the predicate
//! becomes the join condition (projected through the right side's columns)
//! and the join kind becomes `INNER`, `LEFT OUTER` or `CROSS`. Apply joins
//! that cannot be lowered are an error on dialects without apply support.

use crate::error::{TranslationError, TranslationResult};
use crate::expr::rewrite::Rewriter;
use crate::expr::util::{declared_aliases, references_any};
use crate::expr::visit::any_node;
use crate::expr::{Expr, JoinKind, SelectExpr};
use crate::projector::ColumnProjector;
use crate::transform::{QueryTransform, TransformContext};
use std::collections::HashSet;

pub struct CrossApplyRewrite;

impl QueryTransform for CrossApplyRewrite {
    fn name(&self) -> &'static str {
        "cross_apply"
    }

    fn transform(&self, expr: Expr, cx: &TransformContext<'_>) -> TranslationResult<Expr> {
        Lowering { cx }.rewrite(&expr)
    }
}

struct Lowering<'c, 'a> {
    cx: &'c TransformContext<'a>,
}

impl Lowering<'_, '_> {
    fn lower(&self, kind: JoinKind, left: &Expr, right: &Expr) -> TranslationResult<Option<Expr>> {
        let left_aliases = declared_aliases(left);
        let Expr::Select(select) = right else {
            if references_any(right, &left_aliases) {
                return Ok(None);
            }
            return Ok(Some(Expr::join(JoinKind::Cross, left.clone(), right.clone(), None)));
        };

        let self_contained = select.take.is_none()
            && select.skip.is_none()
            && select.group_by.is_empty()
            && !select.has_aggregates();
        if !self_contained {
            return Ok(None);
        }

        let without_where = SelectExpr {
            where_clause: None,
            ..(**select).clone()
        };
        if references_any(&Expr::select(without_where.clone()), &left_aliases) {
            return Ok(None);
        }

        let Some(predicate) = &select.where_clause else {
            let kind = if kind == JoinKind::CrossApply {
                JoinKind::Cross
            } else {
                JoinKind::LeftOuter
            };
            let condition = (kind == JoinKind::LeftOuter).then(|| Expr::constant(true));
            return Ok(Some(Expr::join(kind, left.clone(), Expr::select(without_where), condition)));
        };
        let has_subquery = any_node(predicate, &|e| {
            matches!(e, Expr::Scalar(_) | Expr::Exists(_) | Expr::In(_))
        });
        if has_subquery {
            return Ok(None);
        }

        let bound: HashSet<_> = without_where
            .from
            .as_ref()
            .map(declared_aliases)
            .unwrap_or_default();
        let projected = ColumnProjector::new(self.cx.dialect, false).project(
            predicate,
            &without_where.columns,
            without_where.alias,
            &bound,
        )?;
        let lowered_right = SelectExpr {
            columns: projected.columns,
            ..without_where
        };
        let kind = if kind == JoinKind::CrossApply {
            JoinKind::Inner
        } else {
            JoinKind::LeftOuter
        };
        Ok(Some(Expr::join(
            kind,
            left.clone(),
            Expr::select(lowered_right),
            Some(projected.projector),
        )))
    }
}

impl Rewriter for Lowering<'_, '_> {
    fn rewrite(&mut self, expr: &Expr) -> TranslationResult<Expr> {
        let out = self.rewrite_children(expr)?;
        let Expr::Join(join) = &out else {
            return Ok(out);
        };
        if !join.kind.is_apply() {
            return Ok(out);
        }
        if let Some(lowered) = self.lower(join.kind, &join.left, &join.right)? {
            return Ok(lowered);
        }
        if self.cx.dialect.supports_apply() {
            return Ok(out);
        }
        let capability = match join.kind {
            JoinKind::CrossApply => "CROSS APPLY",
            _ => "OUTER APPLY",
        };
        Err(TranslationError::UnsupportedForDialect {
            dialect: self.cx.dialect.name().to_string(),
            capability: capability.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{SqlServerDialect, SqliteDialect};
    use crate::expr::{AliasGenerator, BinaryOp, ColumnDeclaration, TableAlias, TableExpr};
    use crate::types::{QueryType, SqlType, ValueType};
    use std::sync::Arc;

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

    /// `Customers c OUTER APPLY (SELECT o.OrderID FROM Orders o WHERE o.CustomerID = c.CustomerID)`
    fn correlated(gen: &AliasGenerator, kind: JoinKind, take: bool) -> (Expr, TableAlias) {
        let c = gen.next_alias();
        let o = gen.next_alias();
        let columns = vec![decl("OrderID", col(o, "OrderID"))];
        let correlation = Expr::binary(BinaryOp::Eq, col(o, "CustomerID"), col(c, "CustomerID"));
        let orders = SelectExpr::new(gen.next_alias(), columns, Some(table(o, "Orders")))
            .with_where(Some(correlation))
            .with_take(take.then(|| Expr::constant(1)));
        let alias = orders.alias;
        (Expr::join(kind, table(c, "Customers"), Expr::select(orders), None), alias)
    }

    #[test]
    fn test_outer_apply_becomes_left_outer_join() {
        let gen = AliasGenerator::new();
        let (tree, right_alias) = correlated(&gen, JoinKind::OuterApply, false);
        let dialect = SqliteDialect::new();
        let cx = TransformContext::new(&gen, &dialect);

        let out = CrossApplyRewrite.transform(tree, &cx).unwrap();
        let Expr::Join(j) = &out else {
            panic!("expected join")
        };
        assert_eq!(j.kind, JoinKind::LeftOuter);
        let Expr::Select(right) = &j.right else {
            panic!("expected select")
        };
        assert!(right.where_clause.is_none());
        assert!(right.column("CustomerID").is_some());
        let Some(Expr::Binary(cond)) = &j.condition else {
            panic!("expected condition")
        };
        assert_eq!(cond.left, col(right_alias, "CustomerID"));

        assert!(CrossApplyRewrite.transform(out.clone(), &cx).unwrap().same(&out));
    }

    #[test]
    fn test_cross_apply_becomes_inner_join() {
        let gen = AliasGenerator::new();
        let (tree, _) = correlated(&gen, JoinKind::CrossApply, false);
        let dialect = SqlServerDialect::new();
        let cx = TransformContext::new(&gen, &dialect);
        let out = CrossApplyRewrite.transform(tree, &cx).unwrap();
        let Expr::Join(j) = &out else {
            panic!("expected join")
        };
        assert_eq!(j.kind, JoinKind::Inner);
    }

    #[test]
    fn test_paged_apply_is_kept_where_supported() {
        let gen = AliasGenerator::new();
        let (tree, _) = correlated(&gen, JoinKind::OuterApply, true);
        let dialect = SqlServerDialect::new();
        let cx = TransformContext::new(&gen, &dialect);
        let out = CrossApplyRewrite.transform(tree.clone(), &cx).unwrap();
        assert!(out.same(&tree));
    }

    #[test]
    fn test_paged_apply_fails_without_apply_support() {
        let gen = AliasGenerator::new();
        let (tree, _) = correlated(&gen, JoinKind::OuterApply, true);
        let dialect = SqliteDialect::new();
        let cx = TransformContext::new(&gen, &dialect);
        let err = CrossApplyRewrite.transform(tree, &cx).unwrap_err();
        assert!(matches!(err, TranslationError::UnsupportedForDialect { .. }));
    }
}
