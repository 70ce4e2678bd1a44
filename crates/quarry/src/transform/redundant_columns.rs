//! Redundant-column removal.
//!
//! Merges declarations within one select that compute the same expression,
//! redirecting every reference to the first of them.

use crate::error::TranslationResult;
use crate::expr::rewrite::Rewriter;
use crate::expr::util::{replace_columns, ColumnKey};
use crate::expr::visit::for_each_node;
use crate::expr::{ColumnDeclaration, Expr, SelectExpr};
use crate::transform::{QueryTransform, TransformContext};
use std::collections::HashMap;
use std::sync::Arc;

pub struct RedundantColumnRemoval;

impl QueryTransform for RedundantColumnRemoval {
    fn name(&self) -> &'static str {
        "redundant_columns"
    }

    fn transform(&self, expr: Expr, _cx: &TransformContext<'_>) -> TranslationResult<Expr> {
        let mut redirects: HashMap<ColumnKey, Expr> = HashMap::new();
        for_each_node(&expr, &mut |node| {
            if let Expr::Select(s) = node {
                collect_duplicates(s, &mut redirects);
            }
        });
        if redirects.is_empty() {
            return Ok(expr);
        }

        let deduped = Dedupe.rewrite(&expr)?;
        replace_columns(&deduped, &redirects)
    }
}

fn first_match(columns: &[ColumnDeclaration], index: usize) -> Option<usize> {
    columns[..index]
        .iter()
        .position(|c| c.expr == columns[index].expr)
}

fn has_duplicates(select: &SelectExpr) -> bool {
    (0..select.columns.len()).any(|i| first_match(&select.columns, i).is_some())
}

fn collect_duplicates(select: &SelectExpr, redirects: &mut HashMap<ColumnKey, Expr>) {
    for (i, column) in select.columns.iter().enumerate() {
        if let Some(first) = first_match(&select.columns, i) {
            let kept = &select.columns[first];
            redirects.insert((select.alias, column.name.clone()), select.column_ref(kept));
        }
    }
}

fn dedupe(select: &SelectExpr) -> SelectExpr {
    let columns = select
        .columns
        .iter()
        .enumerate()
        .filter(|(i, _)| first_match(&select.columns, *i).is_none())
        .map(|(_, c)| c.clone())
        .collect();
    SelectExpr {
        columns,
        ..select.clone()
    }
}

struct Dedupe;

impl Rewriter for Dedupe {
    fn rewrite(&mut self, expr: &Expr) -> TranslationResult<Expr> {
        let out = self.rewrite_children(expr)?;
        match &out {
            Expr::Select(s) if has_duplicates(s) => Ok(Expr::Select(Arc::new(dedupe(s)))),
            _ => Ok(out),
        }
    }
}
