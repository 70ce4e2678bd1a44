//! Gatherers and small tree utilities shared by the binder and the passes.

use super::rewrite::Rewriter;
use super::visit::for_each_node;
use super::*;
use crate::error::TranslationResult;
use std::collections::{HashMap, HashSet};

/// Identity of a column reference
pub type ColumnKey = (TableAlias, Name);

pub fn column_key(column: &ColumnExpr) -> ColumnKey {
    (column.alias, column.name.clone())
}

/// Aliases a `FROM` source declares at its own level.
///
/// Stops at selects: a select declares its own alias, not those inside it.
pub fn declared_aliases(source: &Expr) -> HashSet<TableAlias> {
    let mut out = HashSet::new();
    collect_declared(source, &mut out);
    out
}

fn collect_declared(source: &Expr, out: &mut HashSet<TableAlias>) {
    match source {
        Expr::Table(t) => {
            out.insert(t.alias);
        }
        Expr::Select(s) => {
            out.insert(s.alias);
        }
        Expr::Join(j) => {
            collect_declared(&j.left, out);
            collect_declared(&j.right, out);
        }
        _ => {}
    }
}

/// Every alias declared anywhere in the tree, selects and tables alike
pub fn all_declared_aliases(expr: &Expr) -> HashSet<TableAlias> {
    let mut out = HashSet::new();
    for_each_node(expr, &mut |e| match e {
        Expr::Table(t) => {
            out.insert(t.alias);
        }
        Expr::Select(s) => {
            out.insert(s.alias);
        }
        _ => {}
    });
    out
}

/// Aliases referenced by column nodes anywhere in the tree
pub fn referenced_aliases(expr: &Expr) -> HashSet<TableAlias> {
    let mut out = HashSet::new();
    for_each_node(expr, &mut |e| {
        if let Expr::Column(c) = e {
            out.insert(c.alias);
        }
    });
    out
}

/// Column references anywhere in the tree, keyed by `(alias, name)`
pub fn referenced_columns(expr: &Expr) -> HashSet<ColumnKey> {
    let mut out = HashSet::new();
    for_each_node(expr, &mut |e| {
        if let Expr::Column(c) = e {
            out.insert(column_key(c));
        }
    });
    out
}

/// Whether the tree references any of `aliases`
pub fn references_any(expr: &Expr, aliases: &HashSet<TableAlias>) -> bool {
    referenced_aliases(expr)
        .iter()
        .any(|a| aliases.contains(a))
}

/// Flatten a chain of `AND`s
pub fn split_conjuncts(expr: &Expr) -> Vec<Expr> {
    let mut out = Vec::new();
    push_conjuncts(expr, &mut out);
    out
}

fn push_conjuncts(expr: &Expr, out: &mut Vec<Expr>) {
    match expr {
        Expr::Binary(b) if b.op == BinaryOp::And => {
            push_conjuncts(&b.left, out);
            push_conjuncts(&b.right, out);
        }
        other => out.push(other.clone()),
    }
}

/// AND two optional predicates together
pub fn and_also(left: Option<Expr>, right: Option<Expr>) -> Option<Expr> {
    match (left, right) {
        (Some(l), Some(r)) => Some(Expr::binary(BinaryOp::And, l, r)),
        (l, r) => l.or(r),
    }
}

/// `a = b`, also true when both are null
pub fn nulls_equal(a: Expr, b: Expr) -> Expr {
    let both_null = Expr::binary(
        BinaryOp::And,
        Expr::is_null_test(a.clone()),
        Expr::is_null_test(b.clone()),
    );
    Expr::binary(BinaryOp::Or, both_null, Expr::binary(BinaryOp::Eq, a, b))
}

struct AliasMapper<'a> {
    map: &'a HashMap<TableAlias, TableAlias>,
}

impl Rewriter for AliasMapper<'_> {
    fn rewrite(&mut self, expr: &Expr) -> TranslationResult<Expr> {
        let out = self.rewrite_children(expr)?;
        Ok(match &out {
            Expr::Column(c) => match self.map.get(&c.alias) {
                Some(&alias) => Expr::Column(Arc::new(ColumnExpr {
                    alias,
                    ..(**c).clone()
                })),
                None => out,
            },
            Expr::Table(t) => match self.map.get(&t.alias) {
                Some(&alias) => Expr::Table(Arc::new(TableExpr {
                    alias,
                    ..(**t).clone()
                })),
                None => out,
            },
            Expr::Select(s) => match self.map.get(&s.alias) {
                Some(&alias) => Expr::select(SelectExpr {
                    alias,
                    ..(**s).clone()
                }),
                None => out,
            },
            _ => out,
        })
    }
}

/// Rename aliases (declarations and references) throughout the tree
pub fn map_aliases(expr: &Expr, map: &HashMap<TableAlias, TableAlias>) -> TranslationResult<Expr> {
    if map.is_empty() {
        return Ok(expr.clone());
    }
    AliasMapper { map }.rewrite(expr)
}

/// Copy a tree giving every alias it declares a fresh one.
///
/// References to aliases declared outside the tree stay as they are, so a
/// correlated subquery stays correlated to the same outer source.
pub fn duplicate(
    expr: &Expr,
    aliases: &AliasGenerator,
) -> TranslationResult<(Expr, HashMap<TableAlias, TableAlias>)> {
    let mut declared: Vec<TableAlias> = all_declared_aliases(expr).into_iter().collect();
    declared.sort();
    let map: HashMap<_, _> = declared
        .into_iter()
        .map(|a| (a, aliases.next_alias()))
        .collect();
    Ok((map_aliases(expr, &map)?, map))
}

/// Deep copy of a select with fresh aliases, plus the old-to-new alias map
pub fn realias(
    select: &Arc<SelectExpr>,
    aliases: &AliasGenerator,
) -> TranslationResult<(Arc<SelectExpr>, HashMap<TableAlias, TableAlias>)> {
    match duplicate(&Expr::Select(select.clone()), aliases)? {
        (Expr::Select(copy), map) => Ok((copy, map)),
        (other, _) => Err(crate::error::TranslationError::invalid(
            "Select",
            format!("copy of a select produced {}", other.kind_name()),
        )),
    }
}

struct ColumnReplacer<'a> {
    map: &'a HashMap<ColumnKey, Expr>,
}

impl Rewriter for ColumnReplacer<'_> {
    fn rewrite(&mut self, expr: &Expr) -> TranslationResult<Expr> {
        if let Expr::Column(c) = expr {
            if let Some(replacement) = self.map.get(&column_key(c)) {
                return Ok(replacement.clone());
            }
        }
        self.rewrite_children(expr)
    }
}

/// Replace column references found in `map`
pub fn replace_columns(expr: &Expr, map: &HashMap<ColumnKey, Expr>) -> TranslationResult<Expr> {
    if map.is_empty() {
        return Ok(expr.clone());
    }
    ColumnReplacer { map }.rewrite(expr)
}

/// Map each column of `select` to the expression it declares
pub fn column_map(select: &SelectExpr) -> HashMap<ColumnKey, Expr> {
    select
        .columns
        .iter()
        .map(|c| ((select.alias, c.name.clone()), c.expr.clone()))
        .collect()
}

/// Replace references to `select`'s columns with their definitions
pub fn inline_columns(expr: &Expr, select: &SelectExpr) -> TranslationResult<Expr> {
    replace_columns(expr, &column_map(select))
}

/// Pick a column name not already declared, `base`, `base1`, `base2`...
pub fn unique_column_name(columns: &[ColumnDeclaration], base: &str) -> Name {
    let taken = |n: &str| columns.iter().any(|c| &*c.name == n);
    if !taken(base) {
        return Name::from(base);
    }
    (1..)
        .map(|i| format!("{base}{i}"))
        .find(|n| !taken(n))
        .map(Name::from)
        .unwrap_or_else(|| Name::from(base))
}

/// Wrap `expr`'s select in a redundant outer select that keeps its alias
pub fn add_redundant_select(select: &SelectExpr, aliases: &AliasGenerator) -> SelectExpr {
    select.add_redundant_select(aliases.next_alias())
}
