//! Row-numbered paging for dialects without `OFFSET`.
//!
//! A select with `skip` is numbered with `ROW_NUMBER() OVER (ORDER BY ...)`
//! in an inner select and filtered on that number in a new outer select that
//! keeps the original alias, so references from above stay valid:
//!
//! ```text
//! SELECT ... FROM (SELECT ..., ROW_NUMBER() OVER (ORDER BY ...) AS rn FROM ...) AS t1
//! WHERE t1.rn BETWEEN skip + 1 AND skip + take ORDER BY t1.rn
//! ```

use crate::dialect::Paging;
use crate::error::{TranslationError, TranslationResult};
use crate::expr::rewrite::Rewriter;
use crate::expr::util::unique_column_name;
use crate::expr::{
    AliasGenerator, BetweenExpr, BinaryOp, ColumnDeclaration, Expr, OrderDirection, OrderExpr,
    RowNumberExpr, SelectExpr,
};
use crate::transform::{QueryTransform, TransformContext};
use crate::types::{QueryType, ScalarKind, ValueType};
use std::sync::Arc;

pub struct SkipTakeRewrite;

impl QueryTransform for SkipTakeRewrite {
    fn name(&self) -> &'static str {
        "skip_take"
    }

    fn transform(&self, expr: Expr, cx: &TransformContext<'_>) -> TranslationResult<Expr> {
        if cx.dialect.paging() != Paging::Top {
            return Ok(expr);
        }
        Numbering { cx }.rewrite(&expr)
    }
}

struct Numbering<'c, 'a> {
    cx: &'c TransformContext<'a>,
}

impl Numbering<'_, '_> {
    fn unsupported(&self, capability: &str) -> TranslationError {
        TranslationError::UnsupportedForDialect {
            dialect: self.cx.dialect.name().to_string(),
            capability: capability.to_string(),
        }
    }

    fn number(&self, select: &SelectExpr, skip: &Expr) -> TranslationResult<SelectExpr> {
        if select.order_by.is_empty() {
            return Err(self.unsupported("Skip without an ordering"));
        }
        let aliases: &AliasGenerator = self.cx.aliases;
        let base = SelectExpr {
            skip: None,
            take: None,
            order_by: Vec::new(),
            ..select.clone()
        };

        let (mut numbered, orderings) = if select.distinct || !select.group_by.is_empty() {
            // the number must be computed over the distinct/grouped rows
            let inner_alias = aliases.next_alias();
            let wrapped = base.add_redundant_select(inner_alias);
            let orderings = select
                .order_by
                .iter()
                .map(|o| {
                    let decl = select
                        .columns
                        .iter()
                        .find(|d| d.expr == o.expr)
                        .ok_or_else(|| {
                            self.unsupported("Skip ordered by a column it does not return")
                        })?;
                    let expr = Expr::column(
                        inner_alias,
                        decl.name.clone(),
                        decl.expr.value_type(),
                        decl.db_type,
                    );
                    Ok(OrderExpr::new(o.direction, expr))
                })
                .collect::<TranslationResult<Vec<_>>>()?;
            (wrapped, orderings)
        } else {
            (base, select.order_by.clone())
        };

        let rn_type: QueryType = self
            .cx
            .dialect
            .type_system()
            .column_type(ScalarKind::BigInt)
            .not_null();
        let rn = unique_column_name(&numbered.columns, "rn");
        numbered.columns.push(ColumnDeclaration {
            name: rn.clone(),
            expr: Expr::RowNumber(Arc::new(RowNumberExpr { order_by: orderings })),
            db_type: rn_type,
        });

        let numbered_alias = aliases.next_alias();
        let mut outer = numbered.add_redundant_select(numbered_alias);
        outer.columns.retain(|c| c.name != rn);

        let row_number = Expr::column(
            numbered_alias,
            rn,
            ValueType::Scalar(ScalarKind::BigInt),
            rn_type,
        );
        let filter = match &select.take {
            Some(take) => Expr::Between(Arc::new(BetweenExpr {
                expr: row_number.clone(),
                lower: add(skip, &Expr::constant(1)),
                upper: add(skip, take),
            })),
            None => Expr::binary(BinaryOp::Gt, row_number.clone(), skip.clone()),
        };
        outer.where_clause = Some(filter);
        outer.order_by = vec![OrderExpr::new(OrderDirection::Ascending, row_number)];
        Ok(outer)
    }
}

/// `a + b`, folded when both are integer constants
fn add(a: &Expr, b: &Expr) -> Expr {
    match (a.as_constant().and_then(|v| v.as_i64()), b.as_constant().and_then(|v| v.as_i64())) {
        (Some(x), Some(y)) => Expr::constant(x + y),
        _ => Expr::binary(BinaryOp::Add, a.clone(), b.clone()),
    }
}

impl Rewriter for Numbering<'_, '_> {
    fn rewrite(&mut self, expr: &Expr) -> TranslationResult<Expr> {
        let out = self.rewrite_children(expr)?;
        match &out {
            Expr::Select(s) => match &s.skip {
                Some(skip) => Ok(Expr::select(self.number(s, skip)?)),
                None => Ok(out),
            },
            _ => Ok(out),
        }
    }
}
