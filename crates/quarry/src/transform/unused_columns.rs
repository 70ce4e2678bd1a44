//! Unused-column removal.
//!
//! Drops column declarations that nothing outside their select references.
//! Removing a column can orphan the columns it referenced, so the pass
//! repeats until the reference set stops shrinking.

use crate::error::TranslationResult;
use crate::expr::rewrite::Rewriter;
use crate::expr::util::{referenced_columns, ColumnKey};
use crate::expr::{Expr, ExistsExpr, InExpr, InValues, ScalarExpr, SelectExpr};
use crate::transform::{QueryTransform, TransformContext};
use std::collections::HashSet;
use std::sync::Arc;

pub struct UnusedColumnRemoval;

impl QueryTransform for UnusedColumnRemoval {
    fn name(&self) -> &'static str {
        "unused_columns"
    }

    fn transform(&self, expr: Expr, _cx: &TransformContext<'_>) -> TranslationResult<Expr> {
        let mut current = expr;
        loop {
            let mut remover = Remover {
                used: referenced_columns(&current),
                root: true,
            };
            let next = remover.rewrite(&current)?;
            if next.same(&current) {
                return Ok(current);
            }
            current = next;
        }
    }
}

/// What a select's position demands of its columns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Keep {
    /// Referenced columns only, at least one
    Referenced,
    /// First column plus referenced ones
    First,
    /// Nothing: the select only tests for rows
    Nothing,
    All,
}

struct Remover {
    used: HashSet<ColumnKey>,
    root: bool,
}

impl Remover {
    fn prune(
        &mut self,
        select: &Arc<SelectExpr>,
        keep: Keep,
    ) -> TranslationResult<Arc<SelectExpr>> {
        let rewritten = match self.rewrite_children(&Expr::Select(select.clone()))? {
            Expr::Select(s) => s,
            _ => select.clone(),
        };
        let keep = if rewritten.distinct { Keep::All } else {
            keep
        };

        let retained: Vec<_> = rewritten
            .columns
            .iter()
            .enumerate()
            .filter(|(i, c)| match keep {
                Keep::All => true,
                Keep::Nothing => false,
                Keep::First if *i == 0 => true,
                Keep::First | Keep::Referenced => {
                    self.used.contains(&(rewritten.alias, c.name.clone()))
                }
            })
            .map(|(_, c)| c.clone())
            .collect();

        let retained = if retained.is_empty() && keep == Keep::Referenced {
            rewritten.columns.iter().take(1).cloned().collect()
        } else {
            retained
        };

        if retained.len() == rewritten.columns.len() {
            return Ok(rewritten);
        }
        Ok(Arc::new(SelectExpr {
            columns: retained,
            ..(*rewritten).clone()
        }))
    }
}

impl Rewriter for Remover {
    fn rewrite(&mut self, expr: &Expr) -> TranslationResult<Expr> {
        let root = std::mem::replace(&mut self.root, false);
        match expr {
            Expr::Select(s) => {
                let keep = if root { Keep::All } else {
                    Keep::Referenced
                };
                let out = self.prune(s, keep)?;
                Ok(if Arc::ptr_eq(&out, s) { expr.clone() } else { Expr::Select(out) })
            }
            Expr::Scalar(x) => {
                let select = self.prune(&x.select, Keep::First)?;
                if Arc::ptr_eq(&select, &x.select) {
                    return Ok(expr.clone());
                }
                Ok(Expr::Scalar(Arc::new(ScalarExpr {
                    ty: x.ty.clone(),
                    select,
                })))
            }
            Expr::Exists(x) => {
                let select = self.prune(&x.select, Keep::Nothing)?;
                if Arc::ptr_eq(&select, &x.select) {
                    return Ok(expr.clone());
                }
                Ok(Expr::Exists(Arc::new(ExistsExpr { select })))
            }
            Expr::In(x) => {
                let InValues::Select(s) = &x.values else {
                    return self.rewrite_children(expr);
                };
                let value = self.rewrite(&x.expr)?;
                let select = self.prune(s, Keep::First)?;
                if value.same(&x.expr) && Arc::ptr_eq(&select, s) {
                    return Ok(expr.clone());
                }
                Ok(Expr::In(Arc::new(InExpr {
                    expr: value,
                    values: InValues::Select(select),
                })))
            }
            _ => self.rewrite_children(expr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::SqlServerDialect;
    use crate::expr::{AliasGenerator, ColumnDeclaration, ProjectionExpr, TableAlias, TableExpr};
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

    fn table(alias: TableAlias) -> Expr {
        Expr::Table(Arc::new(TableExpr {
            alias,
            entity: "Customer".into(),
            name: "Customers".into(),
        }))
    }

    /// Projection of `outer(a)` over `inner(a, b, c)`
    fn nested(distinct: bool) -> (Expr, AliasGenerator) {
        let gen = AliasGenerator::new();
        let t = gen.next_alias();
        let inner = SelectExpr::new(
            gen.next_alias(),
            vec![decl("a", col(t, "a")), decl("b", col(t, "b")), decl("c", col(t, "c"))],
            Some(table(t)),
        )
        .with_distinct(distinct);
        let outer = SelectExpr::new(
            gen.next_alias(),
            vec![decl("a", col(inner.alias, "a")), decl("b", col(inner.alias, "b"))],
            Some(Expr::select(inner)),
        );
        let projector = col(outer.alias, "a");
        (Expr::projection(ProjectionExpr::new(outer, projector)), gen)
    }

    fn run(expr: Expr, gen: &AliasGenerator) -> Expr {
        let dialect = SqlServerDialect::new();
        let cx = TransformContext::new(gen, &dialect);
        UnusedColumnRemoval.transform(expr, &cx).unwrap()
    }

    fn column_counts(expr: &Expr) -> (usize, usize) {
        let Expr::Projection(p) = expr else {
            panic!("expected projection")
        };
        let Some(Expr::Select(inner)) = &p.select.from else {
            panic!("expected inner select")
        };
        (p.select.columns.len(), inner.columns.len())
    }

    #[test]
    fn test_removes_columns_transitively() {
        let (tree, gen) = nested(false);
        let out = run(tree, &gen);
        assert_eq!(column_counts(&out), (1, 1));
    }

    #[test]
    fn test_distinct_select_keeps_all_columns() {
        let (tree, gen) = nested(true);
        let out = run(tree, &gen);
        assert_eq!(column_counts(&out), (1, 3));
    }

    #[test]
    fn test_second_run_is_a_no_op() {
        let (tree, gen) = nested(false);
        let once = run(tree, &gen);
        let twice = run(once.clone(), &gen);
        assert!(twice.same(&once));
    }

    #[test]
    fn test_exists_subquery_drops_all_columns() {
        let gen = AliasGenerator::new();
        let t = gen.next_alias();
        let select =
            SelectExpr::new(gen.next_alias(), vec![decl("a", col(t, "a"))], Some(table(t)));
        let exists = Expr::Exists(Arc::new(ExistsExpr {
            select: Arc::new(select),
        }));
        let out = run(exists, &gen);
        let Expr::Exists(e) = out else {
            panic!("expected exists")
        };
        assert!(e.select.columns.is_empty());
    }
}
