//! Comparison rewriting.
//!
//! Equality between constructed values is not something SQL can express, so
//! `==` / `!=` over entities, records and outer-joined values is lowered to
//! comparisons of scalars:
//!
//! * entity against entity: conjunction over the primary-key members
//! * record against record: conjunction over the fields, which must match
//! * outer-joined value against `null`: `IS NULL` on the join's test column
//! * anything else against `null`: `IS NULL`
//!
//! Inequality is the negation of the equality.

use crate::error::{TranslationError, TranslationResult};
use crate::expr::rewrite::Rewriter;
use crate::expr::{BinaryOp, EntityExpr, Expr, NewExpr};
use crate::mapping::EntityMapping;
use crate::transform::{QueryTransform, TransformContext};
use crate::types::Name;
use std::collections::BTreeSet;

pub struct ComparisonRewrite;

impl QueryTransform for ComparisonRewrite {
    fn name(&self) -> &'static str {
        "comparison"
    }

    fn transform(&self, expr: Expr, cx: &TransformContext<'_>) -> TranslationResult<Expr> {
        Lowering { mapping: cx.mapping }.rewrite(&expr)
    }
}

struct Lowering<'a> {
    mapping: Option<&'a dyn EntityMapping>,
}

fn needs_lowering(expr: &Expr) -> bool {
    matches!(expr, Expr::Entity(_) | Expr::OuterJoined(_) | Expr::New(_)) || expr.is_null_constant()
}

impl Rewriter for Lowering<'_> {
    fn rewrite(&mut self, expr: &Expr) -> TranslationResult<Expr> {
        let out = self.rewrite_children(expr)?;
        match &out {
            Expr::Binary(b)
                if matches!(b.op, BinaryOp::Eq | BinaryOp::Ne)
                    && (needs_lowering(&b.left) || needs_lowering(&b.right)) =>
            {
                compare(b.op, &b.left, &b.right, self.mapping)
            }
            _ => Ok(out),
        }
    }
}

/// Lower `left op right` to a comparison of scalars.
///
/// Operators other than `==` / `!=` and scalar operands come back as a plain
/// binary node.
pub fn compare(
    op: BinaryOp,
    left: &Expr,
    right: &Expr,
    mapping: Option<&dyn EntityMapping>,
) -> TranslationResult<Expr> {
    if !matches!(op, BinaryOp::Eq | BinaryOp::Ne) {
        return Ok(Expr::binary(op, left.clone(), right.clone()));
    }
    let equality = match (left, right) {
        (l, r) if l.is_null_constant() && r.is_null_constant() => Expr::constant(true),
        (other, null) | (null, other) if null.is_null_constant() => null_test(other, mapping)?,
        (l, r) if entity_of(l).is_some() || entity_of(r).is_some() => {
            entity_equality(l, r, mapping)?
        }
        (Expr::New(l), Expr::New(r)) => field_equality(l, r, mapping)?,
        (Expr::New(n), other) | (other, Expr::New(n)) => {
            return Err(TranslationError::IncompatibleComparison {
                left: describe_fields(n),
                right: other.kind_name().to_string(),
            })
        }
        (l, r) => return Ok(Expr::binary(op, l.clone(), r.clone())),
    };
    Ok(match op {
        BinaryOp::Ne => equality.negate(),
        _ => equality,
    })
}

/// The entity a value denotes, looking through outer-join wrappers
fn entity_of(expr: &Expr) -> Option<&EntityExpr> {
    match expr {
        Expr::Entity(e) => Some(e),
        Expr::OuterJoined(o) => entity_of(&o.expr),
        _ => None,
    }
}

fn null_test(expr: &Expr, mapping: Option<&dyn EntityMapping>) -> TranslationResult<Expr> {
    match expr {
        Expr::OuterJoined(o) => Ok(Expr::is_null_test(o.test.clone())),
        Expr::Entity(e) => {
            let keys = key_fields(e, mapping)?;
            Ok(Expr::conjunction(keys.into_iter().map(|(_, k)| Expr::is_null_test(k)))
                .unwrap_or_else(|| Expr::constant(false)))
        }
        Expr::New(_) => Err(TranslationError::unsupported(
            "comparison of a constructed record with null",
        )),
        other => Ok(Expr::is_null_test(other.clone())),
    }
}

fn key_fields(
    entity: &EntityExpr,
    mapping: Option<&dyn EntityMapping>,
) -> TranslationResult<Vec<(Name, Expr)>> {
    let mapping = mapping.ok_or_else(|| {
        TranslationError::invalid(
            "Entity",
            format!("comparing '{}' needs an entity mapping", entity.entity),
        )
    })?;
    let construction = entity.new_expr().ok_or_else(|| {
        TranslationError::invalid(
            "Entity",
            format!("'{}' is not a plain construction", entity.entity),
        )
    })?;
    mapping
        .primary_key(&entity.entity)?
        .into_iter()
        .map(|key| {
            let value = construction.field(&key).cloned().ok_or_else(|| {
                TranslationError::invalid(
                    "Entity",
                    format!("'{}' does not project key member '{key}'", entity.entity),
                )
            })?;
            Ok((key, value))
        })
        .collect()
}

fn entity_equality(
    left: &Expr,
    right: &Expr,
    mapping: Option<&dyn EntityMapping>,
) -> TranslationResult<Expr> {
    let (Some(l), Some(r)) = (entity_of(left), entity_of(right)) else {
        return Err(TranslationError::IncompatibleComparison {
            left: left.kind_name().to_string(),
            right: right.kind_name().to_string(),
        });
    };
    if l.entity != r.entity {
        return Err(TranslationError::IncompatibleComparison {
            left: l.entity.to_string(),
            right: r.entity.to_string(),
        });
    }
    let left_keys = key_fields(l, mapping)?;
    let right_keys = key_fields(r, mapping)?;
    let comparisons = left_keys
        .iter()
        .zip(&right_keys)
        .map(|((_, a), (_, b))| compare(BinaryOp::Eq, a, b, mapping))
        .collect::<TranslationResult<Vec<_>>>()?;
    Ok(Expr::conjunction(comparisons).unwrap_or_else(|| Expr::constant(true)))
}

fn describe_fields(record: &NewExpr) -> String {
    format!("{{{}}}", record.field_names().join(", "))
}

fn field_equality(
    left: &NewExpr,
    right: &NewExpr,
    mapping: Option<&dyn EntityMapping>,
) -> TranslationResult<Expr> {
    let left_names: BTreeSet<&str> = left.field_names().into_iter().collect();
    let right_names: BTreeSet<&str> = right.field_names().into_iter().collect();
    if left_names != right_names {
        return Err(TranslationError::IncompatibleComparison {
            left: describe_fields(left),
            right: describe_fields(right),
        });
    }
    let comparisons = left
        .fields
        .iter()
        .filter_map(|(name, a)| right.field(name).map(|b| (a, b)))
        .map(|(a, b)| compare(BinaryOp::Eq, a, b, mapping))
        .collect::<TranslationResult<Vec<_>>>()?;
    Ok(Expr::conjunction(comparisons).unwrap_or_else(|| Expr::constant(true)))
}
