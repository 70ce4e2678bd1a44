//! Redundant-join removal.
//!
//! Two shapes are dropped from a select's `FROM`:
//!
//! * a joined source that repeats an earlier join of the same table on the
//!   same condition; references are redirected to the earlier copy.
//! * the right side of a singleton left outer join that nothing references.
//!   Such a join can neither remove nor multiply rows.

use crate::error::TranslationResult;
use crate::expr::rewrite::Rewriter;
use crate::expr::util::{declared_aliases, map_aliases, referenced_aliases};
use crate::expr::{Expr, JoinExpr, JoinKind, SelectExpr, TableAlias};
use crate::transform::{QueryTransform, TransformContext};
use std::collections::HashMap;
use std::sync::Arc;

pub struct RedundantJoinRemoval;

impl QueryTransform for RedundantJoinRemoval {
    fn name(&self) -> &'static str {
        "redundant_joins"
    }

    fn transform(&self, expr: Expr, _cx: &TransformContext<'_>) -> TranslationResult<Expr> {
        Remover.rewrite(&expr)
    }
}

type AliasMap = HashMap<TableAlias, TableAlias>;

struct Remover;

impl Rewriter for Remover {
    fn rewrite(&mut self, expr: &Expr) -> TranslationResult<Expr> {
        let out = self.rewrite_children(expr)?;
        let Expr::Select(select) = &out else {
            return Ok(out);
        };
        let Some(from @ Expr::Join(_)) = &select.from else {
            return Ok(out);
        };

        let mut map = AliasMap::new();
        let deduped = dedupe(from, &mut map)?;
        let mut current = if deduped.same(from) {
            (**select).clone()
        } else {
            let rewritten = SelectExpr {
                from: Some(deduped),
                ..(**select).clone()
            };
            match map_aliases(&Expr::select(rewritten.clone()), &map)? {
                Expr::Select(s) => (*s).clone(),
                _ => rewritten,
            }
        };

        let pruned = prune_unreferenced(&current)?;
        let changed = !map.is_empty() || pruned.is_some();
        if let Some(from) = pruned {
            current.from = Some(from);
        }
        Ok(if changed { Expr::select(current) } else { out })
    }
}

/// Alias correspondence making `b` coincide with `a`, when they read the
/// same rows
fn similar(a: &Expr, b: &Expr) -> TranslationResult<Option<AliasMap>> {
    match (a, b) {
        (Expr::Table(x), Expr::Table(y)) if x.name == y.name => {
            Ok(Some(AliasMap::from([(y.alias, x.alias)])))
        }
        (Expr::Select(x), Expr::Select(y)) => {
            let (Some(Expr::Table(xt)), Some(Expr::Table(yt))) = (&x.from, &y.from) else {
                return Ok(None);
            };
            if xt.name != yt.name {
                return Ok(None);
            }
            let map = AliasMap::from([(y.alias, x.alias), (yt.alias, xt.alias)]);
            let mapped = map_aliases(b, &map)?;
            Ok((&mapped == a).then_some(map))
        }
        _ => Ok(None),
    }
}

/// Earlier join in `left` that `(kind, right, condition)` duplicates
fn find_duplicate(
    left: &Expr,
    kind: JoinKind,
    right: &Expr,
    condition: &Option<Expr>,
) -> TranslationResult<Option<AliasMap>> {
    let Expr::Join(j) = left else {
        return Ok(None);
    };
    if j.kind == kind {
        if let Some(map) = similar(&j.right, right)? {
            let mapped = match condition {
                Some(c) => Some(map_aliases(c, &map)?),
                None => None,
            };
            if mapped == j.condition {
                return Ok(Some(map));
            }
        }
    }
    match find_duplicate(&j.left, kind, right, condition)? {
        Some(map) => Ok(Some(map)),
        None => find_duplicate(&j.right, kind, right, condition),
    }
}

fn dedupe(source: &Expr, map: &mut AliasMap) -> TranslationResult<Expr> {
    let Expr::Join(join) = source else {
        return Ok(source.clone());
    };
    let left = dedupe(&join.left, map)?;
    let duplicates_preserve_rows =
        matches!(join.kind, JoinKind::Inner | JoinKind::SingletonLeftOuter);
    if duplicates_preserve_rows {
        if let Some(found) = find_duplicate(&left, join.kind, &join.right, &join.condition)? {
            map.extend(found);
            return Ok(left);
        }
    }
    if left.same(&join.left) {
        return Ok(source.clone());
    }
    Ok(Expr::Join(Arc::new(JoinExpr {
        left,
        ..(**join).clone()
    })))
}

/// `FROM` without singleton outer joins whose right side is never referenced
fn prune_unreferenced(select: &SelectExpr) -> TranslationResult<Option<Expr>> {
    let Some(from) = &select.from else {
        return Ok(None);
    };
    let outside = SelectExpr {
        from: None,
        ..select.clone()
    };
    let mut used = referenced_aliases(&Expr::select(outside));

    let mut joins = Vec::new();
    collect_joins(from, &mut joins);
    let mut singletons = Vec::new();
    for join in joins {
        if join.kind == JoinKind::SingletonLeftOuter {
            let refs = join.condition.as_ref().map(referenced_aliases).unwrap_or_default();
            singletons.push((declared_aliases(&join.right), refs));
        } else if let Some(c) = &join.condition {
            used.extend(referenced_aliases(c));
        }
    }
    for source in sources(from) {
        if let Expr::Select(_) = source {
            used.extend(referenced_aliases(source));
        }
    }

    // a kept singleton keeps whatever its condition reads
    loop {
        let before = used.len();
        for (declared, refs) in &singletons {
            if declared.iter().any(|a| used.contains(a)) {
                used.extend(refs.iter().copied());
            }
        }
        if used.len() == before {
            break;
        }
    }

    let pruned = prune(from, &mut |right: &Expr| {
        declared_aliases(right).iter().all(|a| !used.contains(a))
    });
    Ok((!pruned.same(from)).then_some(pruned))
}

fn collect_joins<'a>(source: &'a Expr, out: &mut Vec<&'a JoinExpr>) {
    if let Expr::Join(j) = source {
        out.push(j);
        collect_joins(&j.left, out);
        collect_joins(&j.right, out);
    }
}

/// Leaf sources of a join tree
fn sources(source: &Expr) -> Vec<&Expr> {
    match source {
        Expr::Join(j) => {
            let mut out = sources(&j.left);
            out.extend(sources(&j.right));
            out
        }
        other => vec![other],
    }
}

fn prune(source: &Expr, unused: &mut dyn FnMut(&Expr) -> bool) -> Expr {
    let Expr::Join(join) = source else {
        return source.clone();
    };
    let left = prune(&join.left, &mut *unused);
    if join.kind == JoinKind::SingletonLeftOuter && unused(&join.right) {
        return left;
    }
    if left.same(&join.left) {
        return source.clone();
    }
    Expr::Join(Arc::new(JoinExpr {
        left,
        ..(**join).clone()
    }))
}
