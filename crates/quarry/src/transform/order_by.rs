//! Order-by hoisting.
//!
//! Orderings are gathered bottom-up and carried to the outermost select of
//! each projection, re-expressed through every intermediate select's
//! columns (declaring new columns where needed). Selects that page keep the
//! orderings gathered below them, since `TOP`/`LIMIT` depend on them. A
//! `DISTINCT`, `GROUP BY` or aggregate select ends the chain: orderings
//! below it are dropped. A reverse marker flips every gathered ordering and
//! is cleared.

use crate::error::TranslationResult;
use crate::expr::rewrite::Rewriter;
use crate::expr::util::{column_key, declared_aliases, unique_column_name};
use crate::expr::{ColumnDeclaration, Expr, JoinExpr, OrderExpr, SelectExpr, TableAlias};
use crate::transform::{QueryTransform, TransformContext};
use crate::types::ScalarKind;
use std::collections::HashSet;
use std::sync::Arc;

pub struct OrderByRewrite;

impl QueryTransform for OrderByRewrite {
    fn name(&self) -> &'static str {
        "order_by"
    }

    fn transform(&self, expr: Expr, cx: &TransformContext<'_>) -> TranslationResult<Expr> {
        let mut hoister = Hoister {
            cx,
            gathered: None,
            outermost: true,
        };
        hoister.rewrite(&expr)
    }
}

struct Hoister<'c, 'a> {
    cx: &'c TransformContext<'a>,
    gathered: Option<Vec<OrderExpr>>,
    outermost: bool,
}

impl Hoister<'_, '_> {
    fn scoped(&mut self, expr: &Expr, outermost: bool) -> TranslationResult<Expr> {
        let saved_gathered = self.gathered.take();
        let saved_outermost = std::mem::replace(&mut self.outermost, outermost);
        let out = self.rewrite_children(expr);
        self.gathered = saved_gathered;
        self.outermost = saved_outermost;
        out
    }

    fn prepend(&mut self, orderings: Vec<OrderExpr>) {
        let mut merged = orderings;
        merged.extend(self.gathered.take().unwrap_or_default());

        let mut seen = HashSet::new();
        merged.retain(|o| match o.expr.as_column() {
            Some(c) => seen.insert(column_key(c)),
            None => true,
        });
        self.gathered = Some(merged);
    }

    fn reverse(&mut self) {
        if let Some(gathered) = &mut self.gathered {
            for ordering in gathered.iter_mut() {
                ordering.direction = ordering.direction.reversed();
            }
        }
    }

    /// Express `orderings` through the columns of the select `alias`
    fn rebind(
        &self,
        orderings: Vec<OrderExpr>,
        alias: TableAlias,
        produced: &HashSet<TableAlias>,
        existing: &[ColumnDeclaration],
    ) -> (Vec<ColumnDeclaration>, Vec<OrderExpr>) {
        let types = self.cx.dialect.type_system();
        let mut columns = existing.to_vec();
        let mut rebound = Vec::new();

        for ordering in orderings {
            let column = ordering.expr.as_column();
            // correlated orderings have no meaning outside their scope
            if column.is_some_and(|c| !produced.contains(&c.alias)) {
                continue;
            }
            let index = match columns.iter().position(|d| d.expr == ordering.expr) {
                Some(index) => index,
                None => {
                    let base = match column {
                        Some(c) => c.name.to_string(),
                        None => format!("c{}", columns.len()),
                    };
                    let db_type = ordering
                        .expr
                        .query_type(types)
                        .unwrap_or_else(|| types.column_type(ScalarKind::Int));
                    columns.push(ColumnDeclaration {
                        name: unique_column_name(&columns, &base),
                        expr: ordering.expr.clone(),
                        db_type,
                    });
                    columns.len() - 1
                }
            };
            let decl = &columns[index];
            let expr = Expr::column(alias, decl.name.clone(), decl.expr.value_type(), decl.db_type);
            rebound.push(OrderExpr::new(ordering.direction, expr));
        }
        (columns, rebound)
    }

    fn select(&mut self, expr: &Expr) -> TranslationResult<Expr> {
        let was_outermost = std::mem::replace(&mut self.outermost, false);
        let out = self.rewrite_children(expr);
        self.outermost = was_outermost;
        let out = out?;
        let Expr::Select(select) = &out else {
            return Ok(out);
        };

        let has_order_by = !select.order_by.is_empty();
        let has_group_by = !select.group_by.is_empty();
        let can_have_order_by = was_outermost || select.take.is_some() || select.skip.is_some();
        let can_receive = can_have_order_by
            && !has_group_by
            && !select.distinct
            && !select.has_aggregates();

        if has_order_by {
            self.prepend(select.order_by.clone());
        }
        if select.reverse {
            self.reverse();
        }

        let order_by = if can_receive {
            self.gathered.clone().unwrap_or_default()
        } else if can_have_order_by {
            select.order_by.clone()
        } else {
            Vec::new()
        };

        let can_pass_on = !was_outermost && !has_group_by && !select.distinct;
        let mut columns = None;
        if let Some(gathered) = self.gathered.take() {
            if can_pass_on {
                let produced = select.from.as_ref().map(declared_aliases).unwrap_or_default();
                let (rebound_columns, rebound) =
                    self.rebind(gathered, select.alias, &produced, &select.columns);
                self.prepend(rebound);
                if rebound_columns.len() != select.columns.len() {
                    columns = Some(rebound_columns);
                }
            }
        }

        if order_by == select.order_by && columns.is_none() && !select.reverse {
            return Ok(out);
        }
        Ok(Expr::select(SelectExpr {
            columns: columns.unwrap_or_else(|| select.columns.clone()),
            order_by,
            reverse: false,
            ..(**select).clone()
        }))
    }

    fn join(&mut self, expr: &Expr, join: &JoinExpr) -> TranslationResult<Expr> {
        let left = self.rewrite(&join.left)?;
        let left_orderings = self.gathered.take();
        let right = self.rewrite(&join.right)?;
        if let Some(orderings) = left_orderings {
            self.prepend(orderings);
        }
        let condition = match &join.condition {
            Some(c) => Some(self.rewrite(c)?),
            None => None,
        };
        let condition_same = match (&condition, &join.condition) {
            (Some(a), Some(b)) => a.same(b),
            (None, None) => true,
            _ => false,
        };
        if left.same(&join.left) && right.same(&join.right) && condition_same {
            return Ok(expr.clone());
        }
        Ok(Expr::Join(Arc::new(JoinExpr {
            kind: join.kind,
            left,
            right,
            condition,
        })))
    }
}

impl Rewriter for Hoister<'_, '_> {
    fn rewrite(&mut self, expr: &Expr) -> TranslationResult<Expr> {
        match expr {
            Expr::Projection(_) => self.scoped(expr, true),
            Expr::Scalar(_) | Expr::Exists(_) | Expr::In(_) => self.scoped(expr, false),
            Expr::Select(_) => self.select(expr),
            Expr::Join(j) => self.join(expr, j),
            _ => self.rewrite_children(expr),
        }
    }
}
