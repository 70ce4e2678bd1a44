//! Cross-join conversion.
//!
//! Moves `WHERE` conjuncts that relate both sides of a `CROSS JOIN` into the
//! join condition, turning it into an `INNER JOIN`.

use crate::error::TranslationResult;
use crate::expr::rewrite::Rewriter;
use crate::expr::util::{declared_aliases, referenced_aliases, split_conjuncts};
use crate::expr::{Expr, JoinExpr, JoinKind, SelectExpr, TableAlias};
use crate::transform::{QueryTransform, TransformContext};
use std::collections::HashSet;
use std::sync::Arc;

pub struct CrossJoinRewrite;

impl QueryTransform for CrossJoinRewrite {
    fn name(&self) -> &'static str {
        "cross_join"
    }

    fn transform(&self, expr: Expr, _cx: &TransformContext<'_>) -> TranslationResult<Expr> {
        Conversion.rewrite(&expr)
    }
}

struct Conversion;

impl Rewriter for Conversion {
    fn rewrite(&mut self, expr: &Expr) -> TranslationResult<Expr> {
        let out = self.rewrite_children(expr)?;
        let Expr::Select(select) = &out else {
            return Ok(out);
        };
        let (Some(from @ Expr::Join(_)), Some(predicate)) = (&select.from, &select.where_clause)
        else {
            return Ok(out);
        };

        let mut conjuncts = split_conjuncts(predicate);
        let converted = convert(from, &mut conjuncts);
        if converted.same(from) {
            return Ok(out);
        }
        Ok(Expr::select(SelectExpr {
            from: Some(converted),
            where_clause: Expr::conjunction(conjuncts),
            ..(**select).clone()
        }))
    }
}

fn relates(
    predicate: &Expr,
    left: &HashSet<TableAlias>,
    right: &HashSet<TableAlias>,
) -> bool {
    let referenced = referenced_aliases(predicate);
    referenced.iter().any(|a| left.contains(a))
        && referenced.iter().any(|a| right.contains(a))
        && referenced.iter().all(|a| left.contains(a) || right.contains(a))
}

fn convert(source: &Expr, conjuncts: &mut Vec<Expr>) -> Expr {
    let Expr::Join(join) = source else {
        return source.clone();
    };
    let left = convert(&join.left, conjuncts);
    let right = convert(&join.right, conjuncts);
    let unchanged = left.same(&join.left) && right.same(&join.right);

    if join.kind == JoinKind::Cross {
        let left_aliases = declared_aliases(&left);
        let right_aliases = declared_aliases(&right);
        let (condition, rest): (Vec<_>, Vec<_>) = conjuncts
            .drain(..)
            .partition(|c| relates(c, &left_aliases, &right_aliases));
        *conjuncts = rest;
        if let Some(condition) = Expr::conjunction(condition) {
            return Expr::join(JoinKind::Inner, left, right, Some(condition));
        }
    }
    if unchanged {
        return source.clone();
    }
    Expr::Join(Arc::new(JoinExpr {
        left,
        right,
        ..(**join).clone()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::SqlServerDialect;
    use crate::expr::{AliasGenerator, BinaryOp, ColumnDeclaration, TableExpr};
    use crate::types::{QueryType, SqlType, ValueType};

    fn int() -> QueryType {
        QueryType::new(SqlType::Int)
    }

    fn col(alias: TableAlias, name: &str) -> Expr {
        Expr::column(alias, name.into(), ValueType::Unknown, int())
    }

    fn table(alias: TableAlias, name: &str) -> Expr {
        Expr::Table(Arc::new(TableExpr {
            alias,
            entity: name.into(),
            name: name.into(),
        }))
    }

    #[test]
    fn test_equality_in_where_becomes_join_condition() {
        let gen = AliasGenerator::new();
        let c = gen.next_alias();
        let o = gen.next_alias();
        let join = Expr::join(JoinKind::Cross, table(c, "Customers"), table(o, "Orders"), None);
        let relate = Expr::binary(BinaryOp::Eq, col(c, "CustomerID"), col(o, "CustomerID"));
        let filter = Expr::binary(BinaryOp::Eq, col(c, "City"), Expr::constant("London"));
        let select = SelectExpr::new(
            gen.next_alias(),
            vec![ColumnDeclaration {
                name: "OrderID".into(),
                expr: col(o, "OrderID"),
                db_type: int(),
            }],
            Some(join),
        )
        .with_where(Some(Expr::binary(BinaryOp::And, relate.clone(), filter.clone())));

        let dialect = SqlServerDialect::new();
        let cx = TransformContext::new(&gen, &dialect);
        let out = CrossJoinRewrite.transform(Expr::select(select), &cx).unwrap();

        let Expr::Select(s) = &out else {
            panic!("expected select")
        };
        let Some(Expr::Join(j)) = &s.from else {
            panic!("expected join")
        };
        assert_eq!(j.kind, JoinKind::Inner);
        assert_eq!(j.condition.as_ref(), Some(&relate));
        assert_eq!(s.where_clause.as_ref(), Some(&filter));

        assert!(CrossJoinRewrite.transform(out.clone(), &cx).unwrap().same(&out));
    }

    #[test]
    fn test_unrelated_filter_keeps_cross_join() {
        let gen = AliasGenerator::new();
        let c = gen.next_alias();
        let o = gen.next_alias();
        let join = Expr::join(JoinKind::Cross, table(c, "Customers"), table(o, "Orders"), None);
        let select = SelectExpr::new(gen.next_alias(), Vec::new(), Some(join))
            .with_where(Some(Expr::binary(BinaryOp::Eq, col(c, "City"), Expr::constant("London"))));
        let tree = Expr::select(select);

        let dialect = SqlServerDialect::new();
        let cx = TransformContext::new(&gen, &dialect);
        assert!(CrossJoinRewrite.transform(tree.clone(), &cx).unwrap().same(&tree));
    }
}
